use crate::common::{Length, PageId};
use crate::span::SpanLocation;

/// Heap statistics snapshot.
///
/// Maintained inline on every state change. `committed_bytes` always
/// equals `system_bytes - unmapped_bytes` while no operation is in
/// flight; the `total_*` figures are lifetime sums and only grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde_stats", derive(serde::Serialize))]
pub struct Stats {
    /// Bytes reserved from the system.
    pub system_bytes: u64,
    /// Bytes sitting on the normal free structures.
    pub free_bytes: u64,
    /// Bytes on the returned structures: reserved but decommitted.
    pub unmapped_bytes: u64,
    /// Bytes with physical backing.
    pub committed_bytes: u64,

    /// Scavenger attempts.
    pub scavenge_count: u64,

    pub commit_count: u64,
    pub total_commit_bytes: u64,
    pub decommit_count: u64,
    pub total_decommit_bytes: u64,
    pub reserve_count: u64,
    pub total_reserve_bytes: u64,
}

/// Span counts over the per-length free lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde_stats", derive(serde::Serialize))]
pub struct SmallSpanStats {
    pub normal_spans: u64,
    pub returned_spans: u64,
}

/// Aggregates over the large free sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde_stats", derive(serde::Serialize))]
pub struct LargeSpanStats {
    pub spans: u64,
    pub normal_pages: u64,
    pub returned_pages: u64,
}

/// What a reported range is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde_stats", derive(serde::Serialize))]
pub enum RangeKind {
    InUse,
    Free,
    Unmapped,
}

impl From<SpanLocation> for RangeKind {
    fn from(location: SpanLocation) -> RangeKind {
        match location {
            SpanLocation::InUse => RangeKind::InUse,
            SpanLocation::OnNormalFreelist => RangeKind::Free,
            SpanLocation::OnReturnedFreelist => RangeKind::Unmapped,
        }
    }
}

/// One contiguous managed range, for external introspection.
/// `address` and `length` are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde_stats", derive(serde::Serialize))]
pub struct PageRange {
    pub address: usize,
    pub length: usize,
    pub kind: RangeKind,
    /// 0 unless the span was registered for small-object carving.
    pub sizeclass: u32,
}

impl PageRange {
    pub fn first_page(&self) -> PageId {
        self.address >> crate::common::PAGE_SHIFT
    }

    pub fn page_count(&self) -> Length {
        self.length >> crate::common::PAGE_SHIFT
    }
}
