use std::{fmt, time::Duration};

use crate::{
    evacuate::EvacuationStats, freespace::OldSpaceUsage, mark::MarkStats, sweep::SweepStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Evacuate the nursery.
    Minor,
    /// Mark the whole heap, sweep the old space, then evacuate the nursery.
    Full,
}

/// Why a collection ran as the kind it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionReason {
    /// An allocation could not be served.
    Allocation,
    /// A mutator asked for it explicitly.
    Requested,
    /// The old space could not take a fully live nursery.
    EvacuationReserve,
    /// Too many minor collections in a row.
    MinorLimit,
}

/// Everything measured during one collection.
#[derive(Debug, Clone, Copy)]
pub struct CollectionStats {
    /// Generation counter of the collection.
    pub generation: u32,
    pub kind: CollectionKind,
    pub reason: CollectionReason,
    /// Mutators stopped in the rendezvous.
    pub participants: u32,
    pub roots: usize,
    /// Nursery bytes in use when the world stopped.
    pub nursery_used: usize,
    pub mark: Option<MarkStats>,
    pub sweep: Option<SweepStats>,
    pub evacuation: Option<EvacuationStats>,
    /// Empty old regions handed back to the pool.
    pub released_regions: usize,
    pub old_space: OldSpaceUsage,
    pub duration: Duration,
}

impl CollectionStats {
    /// Whether the nursery was left in place for lack of old-space room.
    #[inline]
    pub fn evacuation_skipped(&self) -> bool {
        self.evacuation.is_none()
    }
}

impl fmt::Display for CollectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gc #{} {:?} ({:?}, {} threads, {} roots) in {:.3}ms: nursery {} KB",
            self.generation,
            self.kind,
            self.reason,
            self.participants,
            self.roots,
            self.duration.as_secs_f64() * 1000.0,
            self.nursery_used / 1024,
        )?;
        if let Some(mark) = &self.mark {
            write!(f, ", marked {} objects ({} KB)", mark.objects, mark.bytes / 1024)?;
        }
        if let Some(sweep) = &self.sweep {
            write!(
                f,
                ", swept {} free KB / {} dark B / {} emptied",
                sweep.free_bytes / 1024,
                sweep.dark_bytes,
                sweep.emptied
            )?;
        }
        match &self.evacuation {
            Some(evac) => write!(f, ", promoted {} objects ({} KB)", evac.objects, evac.bytes / 1024)?,
            None => write!(f, ", evacuation skipped")?,
        }
        write!(
            f,
            ", old {}/{} regions",
            self.old_space.leased, self.old_space.reserve
        )
    }
}

/// Running totals over the heap's lifetime.
#[derive(Debug, Default, Clone)]
pub struct HeapStats {
    pub minor_collections: usize,
    pub full_collections: usize,
    pub promoted_bytes: usize,
    pub weak_cleared: usize,
    pub total_pause: Duration,
    pub max_pause: Duration,
    pub last: Option<CollectionStats>,
}

impl HeapStats {
    pub fn record(&mut self, stats: CollectionStats) {
        match stats.kind {
            CollectionKind::Minor => self.minor_collections += 1,
            CollectionKind::Full => self.full_collections += 1,
        }
        if let Some(evac) = &stats.evacuation {
            self.promoted_bytes += evac.bytes;
            self.weak_cleared += evac.weak_cleared;
        }
        if let Some(mark) = &stats.mark {
            self.weak_cleared += mark.weak_cleared;
        }
        self.total_pause += stats.duration;
        self.max_pause = self.max_pause.max(stats.duration);
        self.last = Some(stats);
    }

    #[inline]
    pub fn collections(&self) -> usize {
        self.minor_collections + self.full_collections
    }
}
