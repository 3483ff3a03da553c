//! Reclaimed memory: free chunks formatted in place, the bins that hold
//! leftovers, and the old space that feeds allocator refills.

mod bins;
mod chunk;
mod old_space;

pub use bins::SegregatedFreeList;
pub use chunk::{ChunkIter, FreeChunk, link_chunks};
pub use old_space::{OldList, OldRefill, OldSpace, OldSpaceUsage, RefillClient};
