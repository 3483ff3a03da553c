//! Region-based, generational heap for managed runtimes.
//!
//! The address space is reserved once and carved into equally sized
//! regions that are leased to accounts. Young objects are bump allocated
//! in a contiguous nursery and evacuated into the old space; the old space
//! is marked and swept in place, reusing dead gaps through free-chunk
//! lists and segregated bins.

pub mod alloc;
pub mod evacuate;
pub mod freespace;
pub mod mark;
pub mod region;
pub mod rset;
pub mod sweep;
pub mod walk;

mod barrier;
mod error;
mod heap;
mod settings;
mod stats;
mod system;

pub use barrier::SenseBarrier;
pub use error::{AllocError, HeapError, dump_words, invariant_violation};
pub use heap::*;
pub use region::RegionId;
pub use settings::{HeapSettings, TraceLevel};
pub use stats::{CollectionKind, CollectionReason, CollectionStats, HeapStats};
pub use system::{OS_PAGE_SIZE, commit_memory, reserve_memory, uncommit_memory, unmap_memory};
