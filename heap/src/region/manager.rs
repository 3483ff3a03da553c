use std::{
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use parking_lot::Mutex;

use super::{
    ListUse, NO_OWNER, RegionFlags, RegionId, RegionLinks, RegionList, RegionState,
    RegionTable,
};
use crate::{HeapError, system};

/// Regions nobody leased yet, plus the count nobody reserved yet.
#[derive(Debug)]
struct Pool {
    free: RegionList,
    unreserved: usize,
}

/// Hands out regions of the [`RegionTable`] to accounts.
///
/// Every region is in exactly one ownership list at a time: the pool's, or
/// a list supplied by the account that leased it. Leased regions are also
/// in their account's accounting list.
#[derive(Debug)]
pub struct RegionManager {
    table: RegionTable,
    ownership: RegionLinks,
    accounting: RegionLinks,
    pool: Mutex<Pool>,
    next_account: AtomicU32,
}

impl RegionManager {
    /// Puts every region of `table` in the pool, uncommitted.
    pub fn new(table: RegionTable) -> Self {
        let ownership = RegionLinks::new(ListUse::Ownership, table.len());
        let accounting = RegionLinks::new(ListUse::Accounting, table.len());
        let mut free = RegionList::new(&ownership);
        free.append_range(&ownership, 0, table.len());
        let unreserved = table.len();
        Self {
            table,
            ownership,
            accounting,
            pool: Mutex::new(Pool { free, unreserved }),
            next_account: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub fn table(&self) -> &RegionTable {
        &self.table
    }

    #[inline(always)]
    pub fn ownership_links(&self) -> &RegionLinks {
        &self.ownership
    }

    #[inline(always)]
    pub fn accounting_links(&self) -> &RegionLinks {
        &self.accounting
    }

    /// Regions not promised to any account.
    pub fn unreserved(&self) -> usize {
        self.pool.lock().unreserved
    }

    /// Regions currently sitting in the pool.
    pub fn pooled(&self) -> usize {
        self.pool.lock().free.len()
    }

    /// Whether `region` sits in the pool.
    pub fn is_pooled(&self, region: RegionId) -> bool {
        let pool = self.pool.lock();
        pool.free.contains(&self.ownership, region)
    }

    /// Creates an account holding a reservation of `reserve` regions.
    pub fn open_account(&self, name: &str, reserve: usize) -> Result<HeapAccount, HeapError> {
        let mut pool = self.pool.lock();
        if reserve > pool.unreserved {
            return Err(HeapError::ReserveExhausted {
                account: name.to_owned(),
                requested: reserve,
                available: pool.unreserved,
            });
        }
        pool.unreserved -= reserve;
        drop(pool);

        let id = self.next_account.fetch_add(1, Ordering::Relaxed);
        log::debug!("account `{name}` (#{id}) reserved {reserve} regions");
        Ok(HeapAccount {
            id,
            name: name.to_owned(),
            state: Mutex::new(AccountState {
                reserve,
                leased: RegionList::new(&self.accounting),
                committed: 0,
            }),
        })
    }

    fn region_ptr(&self, region: RegionId) -> NonNull<u8> {
        let start = self.table.region_start(region);
        // SAFETY: region starts are inside the non-null reservation
        unsafe { NonNull::new_unchecked(start as *mut u8) }
    }

    fn commit_region(&self, region: RegionId) -> Result<(), HeapError> {
        let descriptor = self.table.descriptor(region);
        if descriptor.is_committed() {
            return Ok(());
        }
        if !system::commit_memory(self.region_ptr(region), self.table.region_size()) {
            return Err(HeapError::CommitFailed(region));
        }
        descriptor.insert_flags(RegionFlags::COMMITTED);
        Ok(())
    }

    fn uncommit_region(&self, region: RegionId) -> Result<(), HeapError> {
        let descriptor = self.table.descriptor(region);
        if !descriptor.is_committed() {
            return Ok(());
        }
        if !system::uncommit_memory(self.region_ptr(region), self.table.region_size()) {
            return Err(HeapError::CommitFailed(region));
        }
        descriptor.remove_flags(RegionFlags::COMMITTED);
        Ok(())
    }

    /// First run of `count` consecutive pooled regions.
    fn find_contiguous(&self, pool: &Pool, count: usize) -> Option<RegionId> {
        let mut run_start = 0;
        let mut run_len = 0;
        for region in 0..self.table.len() {
            if pool.free.contains(&self.ownership, region) {
                if run_len == 0 {
                    run_start = region;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }
}

#[derive(Debug)]
struct AccountState {
    reserve: usize,
    /// Accounting list of every region leased by this account.
    leased: RegionList,
    committed: usize,
}

/// Reservation and commit bookkeeping for one owner of regions.
///
/// The account lock serializes every mutation of the lists the account
/// leases into; the pool lock is taken after it.
#[derive(Debug)]
pub struct HeapAccount {
    id: u32,
    name: String,
    state: Mutex<AccountState>,
}

impl HeapAccount {
    #[inline(always)]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reserve(&self) -> usize {
        self.state.lock().reserve
    }

    pub fn leased(&self) -> usize {
        self.state.lock().leased.len()
    }

    pub fn committed(&self) -> usize {
        self.state.lock().committed
    }

    pub fn uncommitted(&self) -> usize {
        let state = self.state.lock();
        state.leased.len() - state.committed
    }

    /// Regions that can still be leased without exceeding the reserve.
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state.reserve - state.leased.len()
    }

    pub fn owns(&self, manager: &RegionManager, region: RegionId) -> bool {
        manager.table.descriptor(region).owner() == self.id
    }

    pub fn leased_regions(&self, manager: &RegionManager) -> Vec<RegionId> {
        self.state.lock().leased.to_vec(&manager.accounting)
    }

    fn check_owner(&self, manager: &RegionManager, region: RegionId) -> Result<(), HeapError> {
        if self.owns(manager, region) {
            Ok(())
        } else {
            Err(HeapError::NotOwner {
                region,
                account: self.name.clone(),
            })
        }
    }

    fn lease(
        &self,
        manager: &RegionManager,
        state: &mut AccountState,
        region: RegionId,
        list: &mut RegionList,
        append: bool,
    ) -> Result<(), HeapError> {
        manager.commit_region(region)?;
        let descriptor = manager.table.descriptor(region);
        descriptor.set_owner(self.id);
        descriptor.set_state(RegionState::Empty);
        descriptor.clear_free_chunks();
        descriptor.reset_live_bytes();
        state.committed += 1;
        state.leased.append(&manager.accounting, region);
        if append {
            list.append(&manager.ownership, region);
        } else {
            list.prepend(&manager.ownership, region);
        }
        Ok(())
    }

    /// Leases up to `count` committed regions into `list` (appended or
    /// prepended), lowest ids first. Returns how many were leased: fewer
    /// than `count` when the reserve runs short, or `0` if `exact` and the
    /// full count is not available.
    pub fn allocate(
        &self,
        manager: &RegionManager,
        count: usize,
        list: &mut RegionList,
        append: bool,
        exact: bool,
    ) -> Result<usize, HeapError> {
        let mut state = self.state.lock();
        let grant = count.min(state.reserve - state.leased.len());
        if grant < count && exact {
            return Ok(0);
        }

        let mut pool = manager.pool.lock();
        let mut leased = 0;
        while leased < grant {
            let Some(region) = pool.free.pop_head(&manager.ownership) else {
                break;
            };
            if let Err(err) = self.lease(manager, &mut state, region, list, append) {
                pool.free.insert_sorted(&manager.ownership, region);
                return Err(err);
            }
            leased += 1;
        }
        log::trace!("account `{}` leased {leased}/{count} regions", self.name);
        Ok(leased)
    }

    /// Leases `count` regions with consecutive ids, appended to `list` in
    /// id order. Returns the first id, or `None` if the reserve or the pool
    /// cannot supply such a run.
    pub fn allocate_contiguous(
        &self,
        manager: &RegionManager,
        count: usize,
        list: &mut RegionList,
    ) -> Result<Option<RegionId>, HeapError> {
        debug_assert!(count > 0);
        let mut state = self.state.lock();
        if state.reserve - state.leased.len() < count {
            return Ok(None);
        }

        let mut pool = manager.pool.lock();
        let Some(first) = manager.find_contiguous(&pool, count) else {
            return Ok(None);
        };
        for region in first..first + count {
            pool.free.remove(&manager.ownership, region);
        }
        for region in first..first + count {
            if let Err(err) = self.lease(manager, &mut state, region, list, true) {
                for rest in region..first + count {
                    pool.free.insert_sorted(&manager.ownership, rest);
                }
                return Err(err);
            }
        }
        log::trace!(
            "account `{}` leased contiguous regions {first}..{}",
            self.name,
            first + count
        );
        Ok(Some(first))
    }

    /// Backs an owned, uncommitted region with memory again.
    pub fn commit(&self, manager: &RegionManager, region: RegionId) -> Result<(), HeapError> {
        let mut state = self.state.lock();
        self.check_owner(manager, region)?;
        if !manager.table.descriptor(region).is_committed() {
            manager.commit_region(region)?;
            state.committed += 1;
        }
        Ok(())
    }

    /// Drops the memory behind an owned region while keeping the lease.
    pub fn uncommit(&self, manager: &RegionManager, region: RegionId) -> Result<(), HeapError> {
        let mut state = self.state.lock();
        self.check_owner(manager, region)?;
        if manager.table.descriptor(region).is_committed() {
            manager.uncommit_region(region)?;
            state.committed -= 1;
        }
        Ok(())
    }

    /// Unlinks `region` from `list`, uncommits it and returns it to the
    /// pool. The reservation is kept.
    pub fn release(
        &self,
        manager: &RegionManager,
        region: RegionId,
        list: &mut RegionList,
    ) -> Result<(), HeapError> {
        let mut state = self.state.lock();
        self.check_owner(manager, region)?;
        if manager.table.descriptor(region).is_committed() {
            manager.uncommit_region(region)?;
            state.committed -= 1;
        }
        list.remove(&manager.ownership, region);
        state.leased.remove(&manager.accounting, region);

        let descriptor = manager.table.descriptor(region);
        descriptor.set_owner(NO_OWNER);
        descriptor.set_state(RegionState::Empty);
        descriptor.clear_free_chunks();
        descriptor.reset_live_bytes();
        descriptor.remove_flags(RegionFlags::YOUNG);

        manager.pool.lock().free.insert_sorted(&manager.ownership, region);
        Ok(())
    }

    /// Releases every region held in `lists` and gives the reservation back.
    /// All leased regions must be in one of `lists`.
    pub fn close(
        self,
        manager: &RegionManager,
        lists: &mut [&mut RegionList],
    ) -> Result<(), HeapError> {
        for list in lists.iter_mut() {
            while let Some(region) = list.head() {
                self.release(manager, region, list)?;
            }
        }
        let state = self.state.lock();
        if !state.leased.is_empty() {
            crate::error::invariant_violation(
                format_args!(
                    "account `{}` closed with {} regions outside the given lists",
                    self.name,
                    state.leased.len()
                ),
                None,
            );
        }
        manager.pool.lock().unreserved += state.reserve;
        log::debug!("account `{}` closed, {} regions unreserved", self.name, state.reserve);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{reserve_memory, unmap_memory};

    struct Fixture {
        manager: RegionManager,
        base: NonNull<u8>,
        size: usize,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unmap_memory(self.base, self.size);
        }
    }

    fn fixture(count: usize) -> Fixture {
        let log2 = 16;
        let size = count << log2;
        let base = reserve_memory(size, 1 << log2).expect("reserve");
        let table = RegionTable::new(base.as_ptr() as usize, log2, count);
        Fixture {
            manager: RegionManager::new(table),
            base,
            size,
        }
    }

    #[test]
    fn reserve_is_bounded_by_pool() {
        let f = fixture(8);
        let a = f.manager.open_account("a", 5).expect("open");
        assert_eq!(f.manager.unreserved(), 3);
        assert!(matches!(
            f.manager.open_account("b", 4),
            Err(HeapError::ReserveExhausted { requested: 4, available: 3, .. })
        ));
        assert_eq!(a.reserve(), 5);
    }

    #[test]
    fn allocate_short_and_exact() {
        let f = fixture(8);
        let account = f.manager.open_account("old", 3).expect("open");
        let mut list = RegionList::new(f.manager.ownership_links());

        assert_eq!(account.allocate(&f.manager, 5, &mut list, true, true), Ok(0));
        assert_eq!(account.allocate(&f.manager, 5, &mut list, true, false), Ok(3));
        assert_eq!(list.to_vec(f.manager.ownership_links()), vec![0, 1, 2]);
        assert_eq!(account.committed(), 3);
        assert_eq!(account.available(), 0);
        for region in list.iter(f.manager.ownership_links()) {
            assert!(account.owns(&f.manager, region));
            assert!(f.manager.table().descriptor(region).is_committed());
        }
    }

    #[test]
    fn committed_plus_uncommitted_never_exceeds_reserve() {
        let f = fixture(8);
        let account = f.manager.open_account("old", 4).expect("open");
        let mut list = RegionList::new(f.manager.ownership_links());
        account.allocate(&f.manager, 4, &mut list, false, false).expect("allocate");

        account.uncommit(&f.manager, 1).expect("uncommit");
        account.uncommit(&f.manager, 2).expect("uncommit");
        assert_eq!(account.committed(), 2);
        assert_eq!(account.uncommitted(), 2);
        assert!(account.committed() + account.uncommitted() <= account.reserve());

        account.commit(&f.manager, 1).expect("commit");
        assert_eq!(account.committed(), 3);
        assert!(account.committed() + account.uncommitted() <= account.reserve());
    }

    #[test]
    fn commit_requires_ownership() {
        let f = fixture(8);
        let a = f.manager.open_account("a", 2).expect("open");
        let b = f.manager.open_account("b", 2).expect("open");
        let mut list = RegionList::new(f.manager.ownership_links());
        a.allocate(&f.manager, 1, &mut list, true, true).expect("allocate");

        assert!(matches!(b.uncommit(&f.manager, 0), Err(HeapError::NotOwner { region: 0, .. })));
        assert!(matches!(b.commit(&f.manager, 5), Err(HeapError::NotOwner { .. })));
    }

    #[test]
    fn contiguous_runs_skip_leased_regions() {
        let f = fixture(8);
        let a = f.manager.open_account("a", 8).expect("open");
        let links = f.manager.ownership_links();
        let mut scattered = RegionList::new(links);
        let mut large = RegionList::new(links);

        a.allocate(&f.manager, 3, &mut scattered, true, true).expect("allocate");
        a.release(&f.manager, 1, &mut scattered).expect("release");
        // pool now holds 1, 3..8
        let first = a.allocate_contiguous(&f.manager, 3, &mut large).expect("contiguous");
        assert_eq!(first, Some(3));
        assert_eq!(large.to_vec(links), vec![3, 4, 5]);
        assert_eq!(a.allocate_contiguous(&f.manager, 3, &mut large), Ok(None));
    }

    #[test]
    fn release_returns_regions_in_id_order() {
        let f = fixture(6);
        let a = f.manager.open_account("a", 6).expect("open");
        let links = f.manager.ownership_links();
        let mut list = RegionList::new(links);
        a.allocate(&f.manager, 4, &mut list, true, true).expect("allocate");

        a.release(&f.manager, 2, &mut list).expect("release");
        a.release(&f.manager, 0, &mut list).expect("release");
        assert!(f.manager.is_pooled(0));
        assert!(!f.manager.table().descriptor(2).is_committed());

        let mut again = RegionList::new(links);
        a.allocate(&f.manager, 2, &mut again, true, true).expect("allocate");
        assert_eq!(again.to_vec(links), vec![0, 2]);
        assert_eq!(a.leased(), 4);
    }

    #[test]
    fn exclusive_ownership_membership() {
        let f = fixture(8);
        let a = f.manager.open_account("a", 4).expect("open");
        let b = f.manager.open_account("b", 4).expect("open");
        let links = f.manager.ownership_links();
        let mut la = RegionList::new(links);
        let mut lb = RegionList::new(links);
        a.allocate(&f.manager, 4, &mut la, true, true).expect("allocate");
        b.allocate(&f.manager, 4, &mut lb, true, true).expect("allocate");

        for region in 0..8 {
            let holders = [la.contains(links, region), lb.contains(links, region)]
                .iter()
                .filter(|&&held| held)
                .count();
            assert_eq!(holders, 1, "region {region} must be in exactly one list");
        }
    }

    #[test]
    fn close_returns_reservation() {
        let f = fixture(8);
        let a = f.manager.open_account("a", 5).expect("open");
        let mut list = RegionList::new(f.manager.ownership_links());
        a.allocate(&f.manager, 3, &mut list, true, true).expect("allocate");
        a.close(&f.manager, &mut [&mut list]).expect("close");
        assert_eq!(f.manager.unreserved(), 8);
        assert_eq!(f.manager.pooled(), 8);
    }
}
