//! Utilities used by the policies and plans: addresses and tagged values, the object
//! layout, handles, options, statistics and heap verification.

/// Address and object references.
pub mod address;
/// Allocation kinds and allocation errors.
pub mod alloc;
/// Atomic per-cell bitmaps of a region.
pub mod bitmap;
/// Constants used throughout the collector.
pub mod constants;
/// Calculation, conversion and rounding for memory related numbers.
pub mod conversions;
/// Local, global and weak handles.
pub mod handles;
/// Logger initialization
pub mod logger;
/// Reserving and releasing memory from the operating system.
pub mod memory;
/// Forwarding pointers of evacuated objects.
pub mod object_forwarding;
/// Object headers and field access.
pub mod object_model;
/// Runtime options.
pub mod options;
/// Clearing weak references to dead objects.
pub mod reference_processor;
/// Cycle counters and summaries.
pub mod statistics;
/// Tagged values stored in object fields and handles.
pub mod tagged;
/// Heap verification.
pub mod verify;

/// Test utilities. Also compiled with the `test_private` feature for integration tests.
#[cfg(any(test, feature = "test_private"))]
pub mod test_util;

pub use self::address::Address;
pub use self::address::ObjectReference;
