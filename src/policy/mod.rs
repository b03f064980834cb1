//! Memory policies: regions, where they come from, and the spaces that group them.
//!
//! A region is the unit of allocation, marking and reclamation. A space is a set of regions
//! sharing an allocation policy. Each heap owns a young, an old, a non-movable and a huge
//! object space; the shared heap owns a shared old and a shared huge space.

pub mod region;
pub mod region_allocator;
pub mod region_map;
pub mod space;

pub mod freelist;
pub mod hugespace;
pub mod oldspace;
pub mod semispace;
