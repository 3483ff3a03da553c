use std::sync::atomic::{AtomicU32, Ordering};

use crate::{RegionId, error::invariant_violation};

const NIL: u32 = u32::MAX;

/// What a family of lists is used for. A region belongs to at most one
/// list of each use at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListUse {
    /// Which pool or space list currently holds the region.
    Ownership,
    /// Which account leased the region.
    Accounting,
}

/// The shared link storage for every list of one [`ListUse`].
///
/// `prev`/`next` thread regions into lists; `member` records which list
/// holds the region so exclusive membership is checked on every insert.
/// Links are atomics because different accounts mutate disjoint entries
/// under their own locks.
#[derive(Debug)]
pub struct RegionLinks {
    list_use: ListUse,
    prev: Box<[AtomicU32]>,
    next: Box<[AtomicU32]>,
    member: Box<[AtomicU32]>,
    next_list_id: AtomicU32,
}

fn nil_array(len: usize) -> Box<[AtomicU32]> {
    let mut v = Vec::with_capacity(len);
    v.resize_with(len, || AtomicU32::new(NIL));
    v.into_boxed_slice()
}

impl RegionLinks {
    pub fn new(list_use: ListUse, region_count: usize) -> Self {
        Self {
            list_use,
            prev: nil_array(region_count),
            next: nil_array(region_count),
            member: nil_array(region_count),
            next_list_id: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub fn list_use(&self) -> ListUse {
        self.list_use
    }

    #[inline(always)]
    fn next(&self, id: u32) -> u32 {
        self.next[id as usize].load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn prev(&self, id: u32) -> u32 {
        self.prev[id as usize].load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn set_next(&self, id: u32, next: u32) {
        self.next[id as usize].store(next, Ordering::Relaxed);
    }

    #[inline(always)]
    fn set_prev(&self, id: u32, prev: u32) {
        self.prev[id as usize].store(prev, Ordering::Relaxed);
    }

    /// Id of the list currently holding `region`, if any.
    #[inline(always)]
    pub fn member_of(&self, region: RegionId) -> Option<u32> {
        let list = self.member[region].load(Ordering::Acquire);
        (list != NIL).then_some(list)
    }

    fn claim(&self, region: RegionId, list: u32) {
        if let Err(current) =
            self.member[region].compare_exchange(NIL, list, Ordering::AcqRel, Ordering::Acquire)
        {
            invariant_violation(
                format_args!(
                    "region {region} inserted into {:?} list {list} while in list {current}",
                    self.list_use
                ),
                None,
            );
        }
    }

    fn unclaim(&self, region: RegionId, list: u32) {
        if let Err(current) =
            self.member[region].compare_exchange(list, NIL, Ordering::AcqRel, Ordering::Acquire)
        {
            invariant_violation(
                format_args!(
                    "region {region} removed from {:?} list {list} but is in list {current}",
                    self.list_use
                ),
                None,
            );
        }
    }
}

/// A doubly linked list of region ids threaded through [`RegionLinks`].
///
/// The list itself only stores its ends; every operation takes the link
/// storage of the list's use.
#[derive(Debug)]
pub struct RegionList {
    id: u32,
    list_use: ListUse,
    head: u32,
    tail: u32,
    len: usize,
}

impl RegionList {
    pub fn new(links: &RegionLinks) -> Self {
        let id = links.next_list_id.fetch_add(1, Ordering::Relaxed);
        debug_assert_ne!(id, NIL, "list id space exhausted");
        Self {
            id,
            list_use: links.list_use,
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline(always)]
    pub fn list_use(&self) -> ListUse {
        self.list_use
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn head(&self) -> Option<RegionId> {
        (self.head != NIL).then_some(self.head as RegionId)
    }

    #[inline(always)]
    pub fn tail(&self) -> Option<RegionId> {
        (self.tail != NIL).then_some(self.tail as RegionId)
    }

    #[inline(always)]
    pub fn contains(&self, links: &RegionLinks, region: RegionId) -> bool {
        links.member_of(region) == Some(self.id)
    }

    #[inline(always)]
    fn check_use(&self, links: &RegionLinks) {
        debug_assert_eq!(self.list_use, links.list_use, "list used with foreign links");
    }

    pub fn append(&mut self, links: &RegionLinks, region: RegionId) {
        self.check_use(links);
        links.claim(region, self.id);
        let r = region as u32;
        links.set_next(r, NIL);
        links.set_prev(r, self.tail);
        if self.tail == NIL {
            self.head = r;
        } else {
            links.set_next(self.tail, r);
        }
        self.tail = r;
        self.len += 1;
    }

    pub fn prepend(&mut self, links: &RegionLinks, region: RegionId) {
        self.check_use(links);
        links.claim(region, self.id);
        let r = region as u32;
        links.set_prev(r, NIL);
        links.set_next(r, self.head);
        if self.head == NIL {
            self.tail = r;
        } else {
            links.set_prev(self.head, r);
        }
        self.head = r;
        self.len += 1;
    }

    /// Inserts `region` before the first member with a larger id, keeping an
    /// id-ordered list ordered. O(list length).
    pub fn insert_sorted(&mut self, links: &RegionLinks, region: RegionId) {
        let Some(successor) = self.iter(links).find(|&id| id > region) else {
            self.append(links, region);
            return;
        };
        let successor = successor as u32;
        let prev = links.prev(successor);
        if prev == NIL {
            self.prepend(links, region);
            return;
        }
        links.claim(region, self.id);
        let r = region as u32;
        links.set_prev(r, prev);
        links.set_next(r, successor);
        links.set_next(prev, r);
        links.set_prev(successor, r);
        self.len += 1;
    }

    /// Appends `count` consecutive ids starting at `first`.
    pub fn append_range(&mut self, links: &RegionLinks, first: RegionId, count: usize) {
        for region in first..first + count {
            self.append(links, region);
        }
    }

    /// Unlinks `region`, which must be a member of this list.
    pub fn remove(&mut self, links: &RegionLinks, region: RegionId) {
        self.check_use(links);
        links.unclaim(region, self.id);
        let r = region as u32;
        let prev = links.prev(r);
        let next = links.next(r);
        if prev == NIL {
            self.head = next;
        } else {
            links.set_next(prev, next);
        }
        if next == NIL {
            self.tail = prev;
        } else {
            links.set_prev(next, prev);
        }
        links.set_next(r, NIL);
        links.set_prev(r, NIL);
        self.len -= 1;
    }

    pub fn pop_head(&mut self, links: &RegionLinks) -> Option<RegionId> {
        let head = self.head()?;
        self.remove(links, head);
        Some(head)
    }

    pub fn pop_tail(&mut self, links: &RegionLinks) -> Option<RegionId> {
        let tail = self.tail()?;
        self.remove(links, tail);
        Some(tail)
    }

    /// Iterates member ids from head to tail. The list must not be mutated
    /// while iterating.
    pub fn iter<'a>(&self, links: &'a RegionLinks) -> RegionListIter<'a> {
        self.check_use(links);
        RegionListIter {
            links,
            cursor: self.head,
        }
    }

    /// Collects the members; convenient when the caller moves regions
    /// between lists while walking.
    pub fn to_vec(&self, links: &RegionLinks) -> Vec<RegionId> {
        self.iter(links).collect()
    }
}

pub struct RegionListIter<'a> {
    links: &'a RegionLinks,
    cursor: u32,
}

impl Iterator for RegionListIter<'_> {
    type Item = RegionId;

    fn next(&mut self) -> Option<RegionId> {
        if self.cursor == NIL {
            return None;
        }
        let current = self.cursor;
        self.cursor = self.links.next(current);
        Some(current as RegionId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_prepend_remove() {
        let links = RegionLinks::new(ListUse::Ownership, 16);
        let mut list = RegionList::new(&links);

        list.append(&links, 3);
        list.append(&links, 4);
        list.prepend(&links, 1);
        assert_eq!(list.to_vec(&links), vec![1, 3, 4]);
        assert_eq!(list.len(), 3);

        list.remove(&links, 3);
        assert_eq!(list.to_vec(&links), vec![1, 4]);
        assert_eq!(list.pop_head(&links), Some(1));
        assert_eq!(list.pop_tail(&links), Some(4));
        assert!(list.is_empty());
        assert_eq!(list.head(), None);
        assert_eq!(list.tail(), None);
    }

    #[test]
    fn insert_sorted_keeps_id_order() {
        let links = RegionLinks::new(ListUse::Ownership, 16);
        let mut list = RegionList::new(&links);
        for id in [5, 1, 9, 3, 7, 0] {
            list.insert_sorted(&links, id);
        }
        assert_eq!(list.to_vec(&links), vec![0, 1, 3, 5, 7, 9]);
        assert_eq!(list.tail(), Some(9));
        assert_eq!(list.len(), 6);
    }

    #[test]
    fn regions_move_between_lists() {
        let links = RegionLinks::new(ListUse::Ownership, 8);
        let mut a = RegionList::new(&links);
        let mut b = RegionList::new(&links);

        a.append_range(&links, 2, 4);
        assert_eq!(a.to_vec(&links), vec![2, 3, 4, 5]);

        a.remove(&links, 4);
        b.append(&links, 4);
        assert!(b.contains(&links, 4));
        assert!(!a.contains(&links, 4));
        assert_eq!(links.member_of(4), Some(b.id()));
        assert_eq!(links.member_of(7), None);
    }

    #[test]
    #[should_panic(expected = "heap invariant violated")]
    fn double_membership_is_rejected() {
        let links = RegionLinks::new(ListUse::Ownership, 8);
        let mut a = RegionList::new(&links);
        let mut b = RegionList::new(&links);
        a.append(&links, 1);
        b.append(&links, 1);
    }

    #[test]
    fn uses_are_independent() {
        let owner = RegionLinks::new(ListUse::Ownership, 8);
        let account = RegionLinks::new(ListUse::Accounting, 8);
        let mut owned = RegionList::new(&owner);
        let mut accounted = RegionList::new(&account);

        owned.append(&owner, 5);
        accounted.append(&account, 5);
        assert!(owned.contains(&owner, 5));
        assert!(accounted.contains(&account, 5));
    }
}
