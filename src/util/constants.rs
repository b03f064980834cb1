/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a word. Tagged values and headers are one word each.
pub const LOG_BYTES_IN_WORD: u8 = 3;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a word
pub const LOG_BITS_IN_WORD: usize = LOG_BITS_IN_BYTE as usize + LOG_BYTES_IN_WORD as usize;
/// The number of bits in a word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the region unit size. Every region starts at an address aligned to this.
pub const LOG_BYTES_IN_REGION: u8 = 18;
/// The number of bytes in a region unit (256 KiB).
pub const BYTES_IN_REGION: usize = 1 << LOG_BYTES_IN_REGION;
/// The number of words in a region unit.
pub const WORDS_IN_REGION: usize = BYTES_IN_REGION >> LOG_BYTES_IN_WORD;

/// Objects are one header word followed by slots.
pub const OBJECT_HEADER_BYTES: usize = BYTES_IN_WORD;
/// The smallest object is a header with no slots.
pub const MIN_OBJECT_SIZE: usize = OBJECT_HEADER_BYTES;
/// Free cells smaller than this are left as filler and never handed out again until the
/// next sweep coalesces them with a neighbour.
pub const MIN_FREE_CELL_SIZE: usize = 4 * BYTES_IN_WORD;
/// The largest object that fits into a regular (non-huge) region.
pub const MAX_REGULAR_OBJECT_SIZE: usize = BYTES_IN_REGION;

static_assertions::const_assert_eq!(std::mem::size_of::<usize>(), BYTES_IN_WORD);
static_assertions::const_assert!(MIN_FREE_CELL_SIZE >= MIN_OBJECT_SIZE);
