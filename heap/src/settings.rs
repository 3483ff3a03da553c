use object::WORD_SIZE;

use crate::{HeapError, OS_PAGE_SIZE, freespace::FreeChunk};

/// How much the collector reports through the `log` facade.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLevel {
    /// Only warnings and errors.
    Quiet,
    /// One line per collection phase.
    #[default]
    Phases,
    /// Per-object tracing of marking and evacuation.
    Verbose,
}

/// Configuration for the region heap.
///
/// Sizing inputs (region count, nursery share) come from the embedding
/// runtime's heap policy; structural thresholds are opaque inputs.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// log2 of the region size. Regions are the unit of reservation,
    /// commit and reclamation (typ. 1 MB).
    pub region_size_log2: u32,
    /// Number of regions in the reserved range.
    pub region_count: usize,
    /// Regions leased to the nursery account. The rest is the old space's
    /// reserve.
    pub nursery_regions: usize,
    /// log2 of the card size. At most 1 KB so a direct first-object offset
    /// fits a signed byte.
    pub card_size_log2: u32,
    /// Size of a thread-local allocation buffer.
    pub tlab_size: usize,
    /// Objects at least this big are allocated in their own regions.
    pub large_object_threshold: usize,
    /// Dead gaps smaller than this are left as dark matter.
    pub min_reclaimable: usize,
    /// Capacity of the marking stack before it overflows into rescans.
    pub mark_stack_capacity: usize,
    /// Failed collect-and-retry cycles before an allocation reports
    /// out-of-memory.
    pub max_collection_attempts: u32,
    /// Number of consecutive minor collections allowed before forcing a full one.
    pub max_minor_before_major: u32,
    /// Empty old-space regions kept committed after a full collection.
    pub retained_empty_regions: usize,
    pub trace_level: TraceLevel,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            region_size_log2: 20,            // 1 MB
            region_count: 64,                // 64 MB
            nursery_regions: 8,              // 8 MB
            card_size_log2: 9,               // 512 B
            tlab_size: 16 * 1024,            // 16 KB
            large_object_threshold: 256 * 1024,
            min_reclaimable: 256,
            mark_stack_capacity: 4096,
            max_collection_attempts: 3,
            max_minor_before_major: 10,
            retained_empty_regions: 4,
            trace_level: TraceLevel::Phases,
        }
    }
}

impl HeapSettings {
    #[inline]
    pub fn region_size(&self) -> usize {
        1 << self.region_size_log2
    }

    #[inline]
    pub fn card_size(&self) -> usize {
        1 << self.card_size_log2
    }

    #[inline]
    pub fn heap_size(&self) -> usize {
        self.region_count << self.region_size_log2
    }

    #[inline]
    pub fn old_regions(&self) -> usize {
        self.region_count - self.nursery_regions
    }

    /// Old-space regions needed to absorb a completely live nursery of
    /// `bytes`. Each destination region can lose up to one large-object
    /// threshold to fragmentation.
    pub fn evacuation_regions_for(&self, bytes: usize) -> usize {
        let usable = self.region_size() - self.large_object_threshold;
        bytes.div_ceil(usable) + 1
    }

    pub fn validate(&self) -> Result<(), HeapError> {
        if !(16..=30).contains(&self.region_size_log2) {
            return Err(HeapError::Config("region size must be between 64 KB and 1 GB"));
        }
        if !self.region_size().is_multiple_of(OS_PAGE_SIZE) {
            return Err(HeapError::Config("region size must match OS page alignment"));
        }
        if self.region_count == 0 || self.region_count > u32::MAX as usize - 1 {
            return Err(HeapError::Config("region count out of range"));
        }
        if self.nursery_regions == 0 || self.nursery_regions >= self.region_count {
            return Err(HeapError::Config(
                "nursery needs at least one region and must leave an old space",
            ));
        }
        if !(7..=10).contains(&self.card_size_log2) {
            return Err(HeapError::Config("card size must be between 128 B and 1 KB"));
        }
        if self.tlab_size < 2 * WORD_SIZE
            || !self.tlab_size.is_multiple_of(WORD_SIZE)
            || self.tlab_size > self.nursery_regions * self.region_size()
        {
            return Err(HeapError::Config("tlab size must be word aligned and fit the nursery"));
        }
        if self.large_object_threshold < self.tlab_size
            || self.large_object_threshold > self.region_size() / 2
        {
            return Err(HeapError::Config(
                "large object threshold must lie between tlab size and half a region",
            ));
        }
        if self.min_reclaimable < FreeChunk::DOUBLY_LINKED_SIZE
            || !self.min_reclaimable.is_multiple_of(WORD_SIZE)
        {
            return Err(HeapError::Config(
                "minimum reclaimable size must hold a doubly linked free chunk",
            ));
        }
        if self.mark_stack_capacity == 0 {
            return Err(HeapError::Config("mark stack capacity must be > 0"));
        }
        if self.max_collection_attempts == 0 || self.max_minor_before_major == 0 {
            return Err(HeapError::Config("collection attempt limits must be > 0"));
        }
        let nursery_bytes = self.nursery_regions * self.region_size();
        if self.evacuation_regions_for(nursery_bytes) > self.old_regions() {
            return Err(HeapError::Config(
                "old space cannot hold a fully evacuated nursery",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(HeapSettings::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_under_provisioned_old_space() {
        let settings = HeapSettings {
            region_count: 10,
            nursery_regions: 6,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(HeapError::Config(_))));
    }

    #[test]
    fn rejects_oversized_cards() {
        let settings = HeapSettings {
            card_size_log2: 11,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_tiny_reclaimable_threshold() {
        let settings = HeapSettings {
            min_reclaimable: 16,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn evacuation_requirement_rounds_up() {
        let settings = HeapSettings::default();
        let usable = settings.region_size() - settings.large_object_threshold;
        assert_eq!(settings.evacuation_regions_for(0), 1);
        assert_eq!(settings.evacuation_regions_for(usable), 2);
        assert_eq!(settings.evacuation_regions_for(usable + 1), 3);
    }
}
