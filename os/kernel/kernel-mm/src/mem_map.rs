//! # Page descriptor table
//!
//! A flat arena of [`PageDescriptor`]s covering `[base_pfn, end_pfn)`, plus a
//! section table recording which sections hold any memory and which node they
//! belong to. Holes inside the span get reserved descriptors that are never
//! handed to the page allocator.

use crate::addr::Pfn;
use crate::flags::ZoneType;
use crate::page::PageDescriptor;
use kernel_info::memory::SECTION_SHIFT;

/// One entry of the section table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionInfo {
    pub node: u8,
    pub present: bool,
}

pub struct MemMap<'m> {
    descs: &'m [PageDescriptor],
    base_pfn: u64,
    sections: &'m [SectionInfo],
    first_section: u64,
}

impl<'m> MemMap<'m> {
    pub(crate) const fn new(
        descs: &'m [PageDescriptor],
        base_pfn: u64,
        sections: &'m [SectionInfo],
        first_section: u64,
    ) -> Self {
        Self {
            descs,
            base_pfn,
            sections,
            first_section,
        }
    }

    #[inline]
    #[must_use]
    pub const fn start_pfn(&self) -> Pfn {
        Pfn::new(self.base_pfn)
    }

    /// One past the last frame with a descriptor.
    #[inline]
    #[must_use]
    pub const fn end_pfn(&self) -> Pfn {
        Pfn::new(self.base_pfn + self.descs.len() as u64)
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.descs.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Whether `pfn` has a descriptor.
    #[inline]
    #[must_use]
    pub const fn pfn_valid(&self, pfn: Pfn) -> bool {
        pfn.as_u64() >= self.base_pfn && pfn.as_u64() < self.end_pfn().as_u64()
    }

    #[inline]
    #[must_use]
    pub fn try_page(&self, pfn: Pfn) -> Option<&'m PageDescriptor> {
        let idx = pfn.as_u64().checked_sub(self.base_pfn)?;
        self.descs.get(usize::try_from(idx).ok()?)
    }

    /// # Panics
    /// Panics if `pfn` has no descriptor.
    #[inline]
    #[must_use]
    pub fn page(&self, pfn: Pfn) -> &'m PageDescriptor {
        match self.try_page(pfn) {
            Some(desc) => desc,
            None => panic!("BUG: no page descriptor for pfn {pfn}"),
        }
    }

    /// Frame number of a descriptor taken from this table.
    ///
    /// # Panics
    /// Panics if `desc` does not live in this table.
    #[must_use]
    pub fn pfn_of(&self, desc: &PageDescriptor) -> Pfn {
        let base = self.descs.as_ptr().addr();
        let offset = core::ptr::from_ref(desc).addr().wrapping_sub(base);
        let idx = offset / size_of::<PageDescriptor>();
        assert!(
            idx < self.descs.len() && offset % size_of::<PageDescriptor>() == 0,
            "BUG: descriptor not in the page table"
        );
        Pfn::new(self.base_pfn + idx as u64)
    }

    #[must_use]
    pub fn section(&self, pfn: Pfn) -> Option<&'m SectionInfo> {
        let idx = (pfn.as_u64() >> SECTION_SHIFT).checked_sub(self.first_section)?;
        self.sections.get(usize::try_from(idx).ok()?)
    }

    #[inline]
    #[must_use]
    pub fn node_of(&self, pfn: Pfn) -> usize {
        self.page(pfn).node()
    }

    #[inline]
    #[must_use]
    pub fn zone_of(&self, pfn: Pfn) -> ZoneType {
        self.page(pfn).zone_type()
    }

    #[must_use]
    pub const fn sections(&self) -> &'m [SectionInfo] {
        self.sections
    }
}

impl core::fmt::Debug for MemMap<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemMap")
            .field("start_pfn", &self.start_pfn())
            .field("end_pfn", &self.end_pfn())
            .field("sections", &self.sections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::memory::PAGES_PER_SECTION;

    #[test]
    fn lookups_cover_exactly_the_span() {
        let descs: Vec<_> = (0..16)
            .map(|_| PageDescriptor::reserved(1, ZoneType::Normal, 0))
            .collect();
        let sections = [SectionInfo {
            node: 1,
            present: true,
        }];
        let map = MemMap::new(&descs, 100, &sections, 0);

        assert!(map.try_page(Pfn::new(99)).is_none());
        assert!(map.try_page(Pfn::new(116)).is_none());
        assert!(map.pfn_valid(Pfn::new(115)));
        assert_eq!(map.pfn_of(map.page(Pfn::new(107))), Pfn::new(107));
        assert_eq!(map.node_of(Pfn::new(100)), 1);
        assert!(map.section(Pfn::new(100)).is_some_and(|s| s.present));
        assert!(map.section(Pfn::new(PAGES_PER_SECTION)).is_none());
    }
}
