//! Radix maps from page id to span descriptor.
//!
//! The full page-id space (2^36 ids at a 48-bit address width) is far too
//! large to mirror flatly, so slots live in radix leaves that are created
//! on demand. Two layouts are provided: the two-level map trades a big
//! root for one less indirection, the three-level map keeps every node
//! small. Leaves store raw span-handle values with an all-ones empty
//! sentinel.
//!
//! Node storage comes from the host allocator; the page heap never feeds
//! its own pagemap.

// only one of the two layouts is wired up per build
#![allow(dead_code)]

use crate::common::{PageId, PAGE_ID_BITS};
use crate::span::SpanHandle;

const EMPTY: u32 = u32::MAX;

type Leaf = Box<[u32]>;

fn new_leaf(len: usize) -> Leaf {
    vec![EMPTY; len].into_boxed_slice()
}

/// Two-level map: root of 2^21 leaf slots, leaves of 2^15 entries.
pub(crate) struct PageMap2 {
    root: Vec<Option<Leaf>>,
}

impl PageMap2 {
    const LEAF_BITS: usize = 15;
    const LEAF_LEN: usize = 1 << Self::LEAF_BITS;
    const ROOT_LEN: usize = 1 << (PAGE_ID_BITS - Self::LEAF_BITS);

    pub(crate) fn new() -> Self {
        let mut root = Vec::new();
        root.resize_with(Self::ROOT_LEN, || None);
        PageMap2 { root }
    }

    pub(crate) fn get(&self, p: PageId) -> Option<SpanHandle> {
        if p >> PAGE_ID_BITS != 0 {
            return None;
        }
        let leaf = self.root[p >> Self::LEAF_BITS].as_ref()?;
        let raw = leaf[p & (Self::LEAF_LEN - 1)];
        (raw != EMPTY).then(|| SpanHandle::from_raw(raw))
    }

    pub(crate) fn set(&mut self, p: PageId, handle: SpanHandle) {
        debug_assert_eq!(p >> PAGE_ID_BITS, 0);
        let leaf =
            self.root[p >> Self::LEAF_BITS].get_or_insert_with(|| new_leaf(Self::LEAF_LEN));
        leaf[p & (Self::LEAF_LEN - 1)] = handle.raw();
    }

    pub(crate) fn clear(&mut self, p: PageId) {
        if let Some(leaf) = self.root[p >> Self::LEAF_BITS].as_mut() {
            leaf[p & (Self::LEAF_LEN - 1)] = EMPTY;
        }
    }

    /// Preallocates leaves covering `[start, start + n)`. Fails only when
    /// the range leaves the supported address width.
    pub(crate) fn ensure(&mut self, start: PageId, n: usize) -> bool {
        let Some(end) = start.checked_add(n) else {
            return false;
        };
        if n == 0 {
            return true;
        }
        if (end - 1) >> PAGE_ID_BITS != 0 {
            return false;
        }
        let mut key = start;
        while key < end {
            let i = key >> Self::LEAF_BITS;
            if self.root[i].is_none() {
                self.root[i] = Some(new_leaf(Self::LEAF_LEN));
            }
            key = (i + 1) << Self::LEAF_BITS;
        }
        true
    }

    /// Smallest non-empty slot at or after `p`, with its page id.
    pub(crate) fn next_after(&self, p: PageId) -> Option<(PageId, SpanHandle)> {
        if p >> PAGE_ID_BITS != 0 {
            return None;
        }
        let mut offset = p & (Self::LEAF_LEN - 1);
        for i in (p >> Self::LEAF_BITS)..Self::ROOT_LEN {
            if let Some(leaf) = self.root[i].as_ref() {
                for (j, &raw) in leaf.iter().enumerate().skip(offset) {
                    if raw != EMPTY {
                        return Some(((i << Self::LEAF_BITS) | j, SpanHandle::from_raw(raw)));
                    }
                }
            }
            offset = 0;
        }
        None
    }
}

/// Three-level map: 2^12-slot root and interior nodes, 2^12-entry leaves.
/// The memory-conscious default.
pub(crate) struct PageMap3 {
    root: Vec<Option<Interior>>,
}

struct Interior {
    leaves: Vec<Option<Leaf>>,
}

impl Interior {
    fn new() -> Self {
        let mut leaves = Vec::new();
        leaves.resize_with(PageMap3::INTERIOR_LEN, || None);
        Interior { leaves }
    }
}

impl PageMap3 {
    const LEAF_BITS: usize = 12;
    const LEAF_LEN: usize = 1 << Self::LEAF_BITS;
    const INTERIOR_BITS: usize = 12;
    const INTERIOR_LEN: usize = 1 << Self::INTERIOR_BITS;
    const ROOT_LEN: usize = 1 << (PAGE_ID_BITS - Self::LEAF_BITS - Self::INTERIOR_BITS);

    pub(crate) fn new() -> Self {
        let mut root = Vec::new();
        root.resize_with(Self::ROOT_LEN, || None);
        PageMap3 { root }
    }

    fn split(p: PageId) -> (usize, usize, usize) {
        (
            p >> (Self::INTERIOR_BITS + Self::LEAF_BITS),
            (p >> Self::LEAF_BITS) & (Self::INTERIOR_LEN - 1),
            p & (Self::LEAF_LEN - 1),
        )
    }

    pub(crate) fn get(&self, p: PageId) -> Option<SpanHandle> {
        if p >> PAGE_ID_BITS != 0 {
            return None;
        }
        let (i1, i2, i3) = Self::split(p);
        let leaf = self.root[i1].as_ref()?.leaves[i2].as_ref()?;
        let raw = leaf[i3];
        (raw != EMPTY).then(|| SpanHandle::from_raw(raw))
    }

    pub(crate) fn set(&mut self, p: PageId, handle: SpanHandle) {
        debug_assert_eq!(p >> PAGE_ID_BITS, 0);
        let (i1, i2, i3) = Self::split(p);
        let interior = self.root[i1].get_or_insert_with(Interior::new);
        let leaf = interior.leaves[i2].get_or_insert_with(|| new_leaf(Self::LEAF_LEN));
        leaf[i3] = handle.raw();
    }

    pub(crate) fn clear(&mut self, p: PageId) {
        let (i1, i2, i3) = Self::split(p);
        if let Some(interior) = self.root[i1].as_mut() {
            if let Some(leaf) = interior.leaves[i2].as_mut() {
                leaf[i3] = EMPTY;
            }
        }
    }

    /// Preallocates interior nodes and leaves covering `[start, start + n)`.
    pub(crate) fn ensure(&mut self, start: PageId, n: usize) -> bool {
        let Some(end) = start.checked_add(n) else {
            return false;
        };
        if n == 0 {
            return true;
        }
        if (end - 1) >> PAGE_ID_BITS != 0 {
            return false;
        }
        let mut key = start;
        while key < end {
            let (i1, i2, _) = Self::split(key);
            let interior = self.root[i1].get_or_insert_with(Interior::new);
            if interior.leaves[i2].is_none() {
                interior.leaves[i2] = Some(new_leaf(Self::LEAF_LEN));
            }
            key = ((key >> Self::LEAF_BITS) + 1) << Self::LEAF_BITS;
        }
        true
    }

    /// Smallest non-empty slot at or after `p`, with its page id.
    pub(crate) fn next_after(&self, p: PageId) -> Option<(PageId, SpanHandle)> {
        if p >> PAGE_ID_BITS != 0 {
            return None;
        }
        let (first_i1, mut i2, mut i3) = Self::split(p);
        for i1 in first_i1..Self::ROOT_LEN {
            if let Some(interior) = self.root[i1].as_ref() {
                for (j2, slot) in interior.leaves.iter().enumerate().skip(i2) {
                    if let Some(leaf) = slot.as_ref() {
                        for (j3, &raw) in leaf.iter().enumerate().skip(i3) {
                            if raw != EMPTY {
                                let page = (i1 << (Self::INTERIOR_BITS + Self::LEAF_BITS))
                                    | (j2 << Self::LEAF_BITS)
                                    | j3;
                                return Some((page, SpanHandle::from_raw(raw)));
                            }
                        }
                    }
                    i3 = 0;
                }
            }
            i2 = 0;
            i3 = 0;
        }
        None
    }
}

#[cfg(feature = "wide_pagemap")]
pub(crate) type PageMap = PageMap2;
#[cfg(not(feature = "wide_pagemap"))]
pub(crate) type PageMap = PageMap3;
