use std::ops::Range;

use object::WORD_SIZE;

/// Errors surfaced to the embedding runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("invalid heap configuration: {0}")]
    Config(&'static str),
    #[error("failed to map {0} bytes of address space")]
    MapFailed(usize),
    #[error("account `{account}` cannot reserve {requested} regions ({available} unreserved)")]
    ReserveExhausted {
        account: String,
        requested: usize,
        available: usize,
    },
    #[error("region {region} is not owned by account `{account}`")]
    NotOwner { region: usize, account: String },
    #[error("failed to change backing of region {0}")]
    CommitFailed(usize),
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },
}

/// Transient allocator outcomes, recovered by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// No refill is possible until a collection frees space.
    #[error("collection required to allocate {requested} bytes")]
    NeedsCollection { requested: usize },
    /// Another thread requested a collection; join it before taking more
    /// nursery space.
    #[error("collection pending")]
    CollectionPending,
}

/// Reports a broken heap invariant and terminates.
///
/// Debug builds dump `range` word by word at `error` level first.
#[cold]
#[inline(never)]
#[track_caller]
pub fn invariant_violation(what: std::fmt::Arguments<'_>, range: Option<Range<usize>>) -> ! {
    log::error!("heap invariant violated: {what}");
    if cfg!(debug_assertions) {
        if let Some(range) = range {
            dump_words(range);
        }
    }
    panic!("heap invariant violated: {what}");
}

/// Logs the words of `range`, four per line.
pub fn dump_words(range: Range<usize>) {
    let start = range.start & !(WORD_SIZE - 1);
    let mut line = String::new();
    for (i, addr) in (start..range.end).step_by(WORD_SIZE).enumerate() {
        if i % 4 == 0 {
            if !line.is_empty() {
                log::error!("{line}");
                line.clear();
            }
            line.push_str(&format!("0x{addr:012x}:"));
        }
        // SAFETY: callers only dump committed heap memory
        let word = unsafe { *(addr as *const u64) };
        line.push_str(&format!(" {word:016x}"));
    }
    if !line.is_empty() {
        log::error!("{line}");
    }
}
