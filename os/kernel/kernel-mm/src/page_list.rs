//! Intrusive doubly linked lists threaded through the descriptor links.
//!
//! A page is on at most one list at a time: a buddy free list, a per-CPU
//! cache or a hive partial list.

use crate::addr::Pfn;
use crate::mem_map::MemMap;
use crate::page::NIL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageList {
    head: u64,
    tail: u64,
    len: usize,
}

impl Default for PageList {
    fn default() -> Self {
        Self::new()
    }
}

impl PageList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub const fn front(&self) -> Option<Pfn> {
        if self.head == NIL {
            None
        } else {
            Some(Pfn::new(self.head))
        }
    }

    pub fn push_front(&mut self, map: &MemMap<'_>, pfn: Pfn) {
        let desc = map.page(pfn);
        desc.set_links(NIL, self.head);
        if self.head == NIL {
            self.tail = pfn.as_u64();
        } else {
            map.page(Pfn::new(self.head)).set_link_prev(pfn.as_u64());
        }
        self.head = pfn.as_u64();
        self.len += 1;
    }

    pub fn push_back(&mut self, map: &MemMap<'_>, pfn: Pfn) {
        let desc = map.page(pfn);
        desc.set_links(self.tail, NIL);
        if self.tail == NIL {
            self.head = pfn.as_u64();
        } else {
            map.page(Pfn::new(self.tail)).set_link_next(pfn.as_u64());
        }
        self.tail = pfn.as_u64();
        self.len += 1;
    }

    pub fn pop_front(&mut self, map: &MemMap<'_>) -> Option<Pfn> {
        let pfn = self.front()?;
        self.remove(map, pfn);
        Some(pfn)
    }

    pub fn pop_back(&mut self, map: &MemMap<'_>) -> Option<Pfn> {
        if self.tail == NIL {
            return None;
        }
        let pfn = Pfn::new(self.tail);
        self.remove(map, pfn);
        Some(pfn)
    }

    /// Unlinks `pfn`, which must be on this list.
    ///
    /// # Panics
    /// Panics when the links show `pfn` is not on a list.
    pub fn remove(&mut self, map: &MemMap<'_>, pfn: Pfn) {
        let desc = map.page(pfn);
        let (prev, next) = (desc.link_prev(), desc.link_next());
        if prev == NIL {
            assert_eq!(self.head, pfn.as_u64(), "BUG: page {pfn} is not on this list");
            self.head = next;
        } else {
            map.page(Pfn::new(prev)).set_link_next(next);
        }
        if next == NIL {
            assert_eq!(self.tail, pfn.as_u64(), "BUG: page {pfn} is not on this list");
            self.tail = prev;
        } else {
            map.page(Pfn::new(next)).set_link_prev(prev);
        }
        desc.set_links(NIL, NIL);
        self.len -= 1;
    }

    /// Walks the list front to back.
    ///
    /// # Panics
    /// The walk panics if it finds more entries than `len` (a cycle).
    pub fn iter<'a>(&self, map: &'a MemMap<'_>) -> impl Iterator<Item = Pfn> + 'a {
        let mut cur = self.head;
        let mut left = self.len;
        core::iter::from_fn(move || {
            if cur == NIL {
                return None;
            }
            assert!(left > 0, "BUG: page list longer than its count (cycle?)");
            left -= 1;
            let pfn = Pfn::new(cur);
            cur = map.page(pfn).link_next();
            Some(pfn)
        })
    }

    /// Checks the back links and the count.
    ///
    /// # Panics
    /// Panics on any inconsistency.
    pub fn verify(&self, map: &MemMap<'_>) {
        let mut prev = NIL;
        let mut seen = 0;
        for pfn in self.iter(map) {
            assert_eq!(
                map.page(pfn).link_prev(),
                prev,
                "BUG: broken back link at page {pfn}"
            );
            prev = pfn.as_u64();
            seen += 1;
        }
        assert_eq!(prev, self.tail, "BUG: list tail mismatch");
        assert_eq!(seen, self.len, "BUG: list count mismatch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::ZoneType;
    use crate::mem_map::SectionInfo;
    use crate::page::PageDescriptor;

    fn with_map(f: impl FnOnce(&MemMap<'_>)) {
        let descs: Vec<_> = (0..8)
            .map(|_| PageDescriptor::reserved(0, ZoneType::Dma, 0))
            .collect();
        let sections = [SectionInfo {
            node: 0,
            present: true,
        }];
        f(&MemMap::new(&descs, 0, &sections, 0));
    }

    #[test]
    fn push_pop_keeps_order() {
        with_map(|map| {
            let mut list = PageList::new();
            list.push_back(map, Pfn::new(1));
            list.push_back(map, Pfn::new(2));
            list.push_front(map, Pfn::new(0));
            list.verify(map);
            assert_eq!(list.iter(map).collect::<Vec<_>>(), [Pfn::new(0), Pfn::new(1), Pfn::new(2)]);
            assert_eq!(list.pop_back(map), Some(Pfn::new(2)));
            assert_eq!(list.pop_front(map), Some(Pfn::new(0)));
            assert_eq!(list.len(), 1);
        });
    }

    #[test]
    fn remove_from_the_middle() {
        with_map(|map| {
            let mut list = PageList::new();
            for i in 0..5 {
                list.push_back(map, Pfn::new(i));
            }
            list.remove(map, Pfn::new(2));
            list.remove(map, Pfn::new(4));
            list.verify(map);
            assert_eq!(
                list.iter(map).collect::<Vec<_>>(),
                [Pfn::new(0), Pfn::new(1), Pfn::new(3)]
            );
        });
    }

    #[test]
    #[should_panic(expected = "cycle")]
    fn cycles_are_detected() {
        with_map(|map| {
            let mut list = PageList::new();
            list.push_back(map, Pfn::new(0));
            list.push_back(map, Pfn::new(1));
            // corrupt: 1 -> 0
            map.page(Pfn::new(1)).set_link_next(0);
            list.verify(map);
        });
    }
}
