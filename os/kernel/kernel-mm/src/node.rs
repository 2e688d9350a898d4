//! # Memory nodes and fallback order

use crate::flags::ZoneType;
use crate::zone::{PageArea, ZoneId};
use kernel_info::memory::{MAX_NUMNODES, NR_ZONES};

pub(crate) const MAX_ZONELIST: usize = MAX_NUMNODES * NR_ZONES;

/// Ordered list of page areas an allocation may be served from.
#[derive(Debug, Clone, Copy)]
pub struct ZoneList {
    zones: [ZoneId; MAX_ZONELIST],
    len: usize,
}

impl ZoneList {
    const fn empty() -> Self {
        Self {
            zones: [ZoneId {
                node: 0,
                zone: ZoneType::Dma,
            }; MAX_ZONELIST],
            len: 0,
        }
    }

    fn push(&mut self, id: ZoneId) {
        self.zones[self.len] = id;
        self.len += 1;
    }

    #[must_use]
    pub fn as_slice(&self) -> &[ZoneId] {
        &self.zones[..self.len]
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }
}

pub struct MemoryNode {
    id: usize,
    pub(crate) zones: [PageArea; NR_ZONES],
    zonelists: [ZoneList; NR_ZONES],
}

impl MemoryNode {
    pub(crate) const fn new(id: usize, zones: [PageArea; NR_ZONES]) -> Self {
        Self {
            id,
            zones,
            zonelists: [ZoneList::empty(); NR_ZONES],
        }
    }

    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub const fn zone(&self, zone: ZoneType) -> &PageArea {
        &self.zones[zone as usize]
    }

    #[must_use]
    pub fn present_pages(&self) -> u64 {
        self.zones.iter().map(PageArea::present_pages).sum()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.present_pages() > 0
    }

    /// Fallback order for requests whose highest zone is `zone`.
    #[must_use]
    pub const fn zonelist(&self, zone: ZoneType) -> &ZoneList {
        &self.zonelists[zone as usize]
    }

    /// Builds the fallback lists: nodes nearest first (by `distance`), and
    /// within a node the allowed zones from highest to lowest. Unpopulated
    /// zones are skipped.
    pub(crate) fn build_zonelists(
        &mut self,
        populated: &[[bool; NR_ZONES]; MAX_NUMNODES],
        distance: impl Fn(usize, usize) -> u32,
    ) {
        let mut order: [usize; MAX_NUMNODES] = core::array::from_fn(|n| n);
        order.sort_unstable_by_key(|&n| (distance(self.id, n), n));

        for top in ZoneType::ALL {
            let mut list = ZoneList::empty();
            for &node in &order {
                for zone in top.fallback() {
                    if populated[node][zone.index()] {
                        list.push(ZoneId { node, zone });
                    }
                }
            }
            self.zonelists[top.index()] = list;
        }
    }
}

impl core::fmt::Debug for MemoryNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryNode")
            .field("id", &self.id)
            .field("zones", &self.zones)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: usize) -> MemoryNode {
        MemoryNode::new(
            id,
            ZoneType::ALL.map(|zone| PageArea::new(ZoneId { node: id, zone }, 0, 0, 0)),
        )
    }

    #[test]
    fn local_node_first_then_nearest() {
        let mut populated = [[false; NR_ZONES]; MAX_NUMNODES];
        populated[0] = [true, true, false];
        populated[1] = [false, true, true];
        populated[2] = [false, true, false];

        let mut n = node(1);
        // node 2 is nearer to node 1 than node 0
        n.build_zonelists(&populated, |a, b| match (a, b) {
            _ if a == b => 10,
            (_, 0) => 30,
            _ => 20,
        });

        let ids: Vec<_> = n.zonelist(ZoneType::User).as_slice().to_vec();
        assert_eq!(
            ids,
            [
                ZoneId { node: 1, zone: ZoneType::User },
                ZoneId { node: 1, zone: ZoneType::Normal },
                ZoneId { node: 2, zone: ZoneType::Normal },
                ZoneId { node: 0, zone: ZoneType::Normal },
                ZoneId { node: 0, zone: ZoneType::Dma },
            ]
        );
        let dma: Vec<_> = n.zonelist(ZoneType::Dma).as_slice().to_vec();
        assert_eq!(dma, [ZoneId { node: 0, zone: ZoneType::Dma }]);
    }
}
