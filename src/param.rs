//! Compile-time layout and sizing constants shared across the stack.

/// Logical block size in bytes. Equal to the virtio device's sector size,
/// so the cache never has to re-tile device reads.
pub const BSIZE: usize = 512;

/// Number of cache slots.
pub const NBUF: usize = 64;

/// Number of direct block pointers in a `DiskInode`.
pub const NDIRECT: usize = 12;

/// Number of block indices that fit in one indirection block.
pub const IPB: usize = BSIZE / 4;

/// Number of data blocks reachable through the single indirect pointer.
pub const NINDIRECT: usize = IPB;

/// Number of data blocks reachable through the two double-indirect
/// pointers.
pub const NDINDIRECT: usize = 2 * IPB * IPB;

/// Maximum file size in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NDINDIRECT;

/// Maximum filename length, not counting the NUL terminator implied by
/// padding.
pub const DIRNAME_MAX: usize = 28;

/// Virtio descriptor ring size. Must be a power of two.
pub const NUM: usize = 8;
