//! Page-level heap: serves contiguous page runs ("spans") and reclaims
//! them with eager coalescing.
//!
//! The heap owns every span descriptor, a radix pagemap indexing page
//! number to descriptor, per-length free lists for small spans and
//! ordered best-fit sets for large ones. Address space comes from the
//! system-allocator module in reserved-but-decommitted chunks; physical
//! backing is committed on hand-out and dropped again by the scavenger
//! or by aggressive decommit.
//!
//! All mutating operations expect to run under one heap lock; the
//! structure itself is lock-free only on the size-class cache probe.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::common::{
    pages_to_bytes, Length, PageId, DEFAULT_RELEASE_DELAY, MAX_PAGES, MAX_RELEASE_DELAY,
    MIN_SYSTEM_ALLOC, PAGEMAP_BIG_ALLOCATION_THRESHOLD, PAGE_SHIFT, PAGE_SIZE,
};
use crate::free_list::{SpanList, SpanListPair};
use crate::modules::system_allocator::{SysAllocation, SystemAllocatorModule};
use crate::pagemap::PageMap;
use crate::sizeclass_cache::{SizeClassCache, MAX_SIZE_CLASS};
use crate::span::{SpanHandle, SpanInfo, SpanLocation, SpanStore};
use crate::stats::{LargeSpanStats, PageRange, SmallSpanStats, Stats};

/// Runtime policy of a page heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapConfig {
    /// Decommit spans the moment they are freed.
    pub aggressive_decommit: bool,
    /// Soft limit on system bytes; 0 means unlimited.
    pub limit_bytes: usize,
}

/// Outcome of one pass over the free structures.
enum Search {
    Found(SpanHandle),
    /// A span was found but recommitting it failed; the allocation must
    /// not fall through to heap growth.
    CommitFailed,
    NotFound,
}

impl Search {
    fn carve_result(carved: Option<SpanHandle>) -> Search {
        match carved {
            Some(handle) => Search::Found(handle),
            None => Search::CommitFailed,
        }
    }
}

pub struct PageHeap<S: SystemAllocatorModule> {
    sys: S,
    store: SpanStore,
    pagemap: PageMap,
    cache: Arc<SizeClassCache>,

    /// Per-length normal/returned lists; slot 0 stays empty.
    free: [SpanListPair; MAX_PAGES],
    /// Large spans keyed by (length, start) for best-fit lookup.
    large_normal: BTreeMap<(Length, PageId), SpanHandle>,
    large_returned: BTreeMap<(Length, PageId), SpanHandle>,

    stats: Stats,

    /// Pages still to deallocate before the next scavenger attempt.
    scavenge_counter: i64,
    /// Round-robin cursor of `release_at_least`; slot `MAX_PAGES` is the
    /// large set.
    release_index: usize,

    aggressive_decommit: bool,
    limit_bytes: usize,

    /// Page window seen so far, for the one-shot pagemap preallocation.
    lo_page: PageId,
    hi_page: PageId,
    pagemap_preallocated: bool,
}

impl<S: SystemAllocatorModule> PageHeap<S> {
    pub fn new(sys: S, config: HeapConfig) -> Self {
        PageHeap {
            sys,
            store: SpanStore::new(),
            pagemap: PageMap::new(),
            cache: Arc::new(SizeClassCache::new()),
            free: [SpanListPair::new(); MAX_PAGES],
            large_normal: BTreeMap::new(),
            large_returned: BTreeMap::new(),
            stats: Stats::default(),
            scavenge_counter: DEFAULT_RELEASE_DELAY,
            release_index: 0,
            aggressive_decommit: config.aggressive_decommit,
            limit_bytes: config.limit_bytes,
            lo_page: PageId::MAX,
            hi_page: 0,
            pagemap_preallocated: false,
        }
    }

    /// Allocate a run of `n` contiguous pages. `None` when the system is
    /// out of memory or the configured limit would be exceeded.
    pub fn allocate(&mut self, n: Length) -> Option<SpanHandle> {
        debug_assert!(n > 0);

        match self.search_free_and_large(n) {
            Search::Found(handle) => return Some(handle),
            Search::CommitFailed => return None,
            Search::NotFound => {}
        }

        // Growing would breach the limit. A mixed normal/returned
        // neighborhood can hide a big-enough run, so maximally coalesce
        // by releasing everything, then look again before giving up.
        if self.over_limit(n.max(MIN_SYSTEM_ALLOC)) {
            self.release_at_least(Length::MAX);
            match self.search_free_and_large(n) {
                Search::Found(handle) => return Some(handle),
                Search::CommitFailed => return None,
                Search::NotFound => {}
            }
            if self.over_limit(n) {
                warn!(
                    "allocate({}) rejected, limit is {} bytes",
                    n, self.limit_bytes
                );
                return None;
            }
        }

        if !self.grow_heap(n) {
            return None;
        }
        match self.search_free_and_large(n) {
            Search::Found(handle) => {
                debug_assert_eq!(self.store.get(handle).length, n);
                Some(handle)
            }
            _ => None,
        }
    }

    /// Return a span produced by `allocate` or `split` to the heap.
    pub fn deallocate(&mut self, handle: SpanHandle) {
        let (start, length, sizeclass) = {
            let span = self.store.get(handle);
            debug_assert_eq!(span.location, SpanLocation::InUse);
            (span.start, span.length, span.sizeclass)
        };
        trace!("deallocate {} pages at page {:#x}", length, start);

        if sizeclass != 0 {
            for p in start..start + length {
                self.cache.invalidate(p);
            }
        }
        {
            let span = self.store.get_mut(handle);
            span.sizeclass = 0;
            span.sample = false;
            span.location = SpanLocation::OnNormalFreelist;
        }
        self.merge_into_free_structure(handle);
        self.incremental_scavenge(length);
        debug_assert!(self.check());
    }

    /// Split an in-use span after its first `n` pages. The returned
    /// handle describes the tail; both halves stay in use and no commit
    /// state changes.
    pub fn split(&mut self, handle: SpanHandle, n: Length) -> SpanHandle {
        let (start, length) = {
            let span = self.store.get(handle);
            debug_assert!(n > 0 && n < span.length);
            debug_assert_eq!(span.location, SpanLocation::InUse);
            debug_assert_eq!(span.sizeclass, 0);
            (span.start, span.length)
        };
        let tail = self.store.new_span(start + n, length - n);
        self.record_span(tail);
        self.pagemap.set(start + n - 1, handle);
        self.store.get_mut(handle).length = n;
        tail
    }

    /// Mark an in-use span as carved into `sizeclass` objects and
    /// publish the mapping for the lock-free fast path.
    pub fn register_size_class(&mut self, handle: SpanHandle, sizeclass: u32) {
        debug_assert!(sizeclass != 0 && sizeclass <= MAX_SIZE_CLASS);
        let (start, length) = {
            let span = self.store.get(handle);
            debug_assert_eq!(span.location, SpanLocation::InUse);
            (span.start, span.length)
        };
        self.store.get_mut(handle).sizeclass = sizeclass;
        // interior pages resolve to the descriptor too once it is carved
        for i in 1..length.saturating_sub(1) {
            self.pagemap.set(start + i, handle);
        }
        for p in start..start + length {
            self.cache.put(p, sizeclass);
        }
    }

    /// Flag a span as holding a sampled allocation. Sampled spans are
    /// never coalesced into; the flag clears on deallocate.
    pub fn set_sample(&mut self, handle: SpanHandle, sample: bool) {
        debug_assert_eq!(self.store.get(handle).location, SpanLocation::InUse);
        self.store.get_mut(handle).sample = sample;
    }

    /// Pagemap lookup: the span owning page `p`, if any.
    pub fn get_descriptor(&self, p: PageId) -> Option<SpanHandle> {
        self.pagemap.get(p)
    }

    /// Cache probe for the small-object free path. Misses fall back to
    /// `get_descriptor`.
    pub fn try_get_size_class(&self, p: PageId) -> Option<u32> {
        self.cache.try_get(p)
    }

    /// The shared size-class cache, probe-able without the heap lock.
    pub fn sizeclass_cache(&self) -> &Arc<SizeClassCache> {
        &self.cache
    }

    pub fn span_info(&self, handle: SpanHandle) -> SpanInfo {
        let span = self.store.get(handle);
        SpanInfo {
            start: span.start,
            length: span.length,
            location: span.location,
            sizeclass: span.sizeclass,
            sample: span.sample,
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn set_aggressive_decommit(&mut self, on: bool) {
        self.aggressive_decommit = on;
    }

    pub fn aggressive_decommit(&self) -> bool {
        self.aggressive_decommit
    }

    pub fn set_limit_bytes(&mut self, bytes: usize) {
        self.limit_bytes = bytes;
    }

    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    /// Move at least `n` pages from the normal structures to returned,
    /// decommitting whole spans. Returns the pages actually released,
    /// which can exceed `n` (a released span is never split) or fall
    /// short (nothing left to release, or a decommit failed).
    pub fn release_at_least(&mut self, n: Length) -> Length {
        let mut released = 0;

        // Round robin across the length slots so no single list pays for
        // the whole release; the cursor survives between calls.
        while released < n && self.stats.free_bytes > 0 {
            for _ in 0..=MAX_PAGES {
                if released >= n {
                    break;
                }
                let index = self.release_index;
                self.release_index = (self.release_index + 1) % (MAX_PAGES + 1);

                let candidate = if index == MAX_PAGES {
                    self.large_normal.values().next().copied()
                } else {
                    self.free[index].normal.last()
                };
                let Some(handle) = candidate else { continue };

                let released_len = self.release_span(handle);
                if released_len == 0 {
                    // decommit failure; retrying now would spin
                    return released;
                }
                released += released_len;
            }
        }
        released
    }

    /// Report the managed range at or after page `start`, if any.
    pub fn get_next_range(&self, start: PageId) -> Option<PageRange> {
        let mut p = start;
        loop {
            let (slot, handle) = self.pagemap.next_after(p)?;
            if self.store.is_live(handle) {
                let span = self.store.get(handle);
                let covers = span.start <= slot && slot < span.start + span.length;
                if covers && self.pagemap.get(span.start) == Some(handle) {
                    return Some(PageRange {
                        address: span.start << PAGE_SHIFT,
                        length: span.length << PAGE_SHIFT,
                        kind: span.location.into(),
                        sizeclass: span.sizeclass,
                    });
                }
            }
            // stale interior slot of a span that has since moved on
            p = slot + 1;
        }
    }

    pub fn small_span_stats(&self) -> SmallSpanStats {
        let mut out = SmallSpanStats::default();
        for pair in self.free.iter().skip(1) {
            out.normal_spans += pair.normal.len(&self.store) as u64;
            out.returned_spans += pair.returned.len(&self.store) as u64;
        }
        out
    }

    pub fn large_span_stats(&self) -> LargeSpanStats {
        let mut out = LargeSpanStats::default();
        for (&(length, _), _) in &self.large_normal {
            out.spans += 1;
            out.normal_pages += length as u64;
        }
        for (&(length, _), _) in &self.large_returned {
            out.spans += 1;
            out.returned_pages += length as u64;
        }
        out
    }

    /// Cheap structural check.
    pub fn check(&self) -> bool {
        // the length-0 slot must stay empty
        self.free[0].normal.is_empty() && self.free[0].returned.is_empty()
    }

    /// Full invariant verification: list membership, pagemap edges,
    /// eager-coalescing adjacency and the stats identities. Test-speed
    /// only.
    pub fn check_expensive(&self) -> bool {
        let mut ok = self.check();

        let mut free_pages = 0u64;
        let mut unmapped_pages = 0u64;
        let mut free_span_count = 0;

        for (length, pair) in self.free.iter().enumerate().skip(1) {
            ok &= self.check_list(&pair.normal, length, SpanLocation::OnNormalFreelist);
            ok &= self.check_list(&pair.returned, length, SpanLocation::OnReturnedFreelist);
            let normal_spans = pair.normal.len(&self.store);
            let returned_spans = pair.returned.len(&self.store);
            free_pages += (normal_spans * length) as u64;
            unmapped_pages += (returned_spans * length) as u64;
            free_span_count += normal_spans + returned_spans;
        }

        for (&(length, start), &handle) in &self.large_normal {
            ok &= length >= MAX_PAGES;
            ok &= self.check_free_span(handle, SpanLocation::OnNormalFreelist);
            let span = self.store.get(handle);
            ok &= span.length == length && span.start == start;
            free_pages += length as u64;
        }
        for (&(length, start), &handle) in &self.large_returned {
            ok &= length >= MAX_PAGES;
            ok &= self.check_free_span(handle, SpanLocation::OnReturnedFreelist);
            let span = self.store.get(handle);
            ok &= span.length == length && span.start == start;
            unmapped_pages += length as u64;
        }

        free_span_count += self.large_normal.len() + self.large_returned.len();
        ok &= free_span_count <= self.store.live_count();

        ok &= self.stats.free_bytes == free_pages << PAGE_SHIFT;
        ok &= self.stats.unmapped_bytes == unmapped_pages << PAGE_SHIFT;
        ok &= self.stats.committed_bytes == self.stats.system_bytes - self.stats.unmapped_bytes;

        if !ok {
            log::error!("page heap invariant violation, stats: {:?}", self.stats);
        }
        ok
    }

    // ---- internals ----

    fn check_list(&self, list: &SpanList, length: Length, location: SpanLocation) -> bool {
        let mut ok = true;
        for handle in list.iter(&self.store) {
            ok &= self.store.get(handle).length == length;
            ok &= self.check_free_span(handle, location);
        }
        ok
    }

    fn check_free_span(&self, handle: SpanHandle, location: SpanLocation) -> bool {
        let span = self.store.get(handle);
        let mut ok = span.location == location && !span.sample && span.sizeclass == 0;

        // first and last page resolve back to the descriptor
        ok &= self.pagemap.get(span.start) == Some(handle);
        ok &= self.pagemap.get(span.start + span.length - 1) == Some(handle);

        // eager coalescing leaves no same-list neighbors
        for neighbor in [
            (span.start > 0).then(|| self.pagemap.get(span.start - 1)).flatten(),
            self.pagemap.get(span.start + span.length),
        ]
        .into_iter()
        .flatten()
        {
            ok &= self.store.is_live(neighbor);
            if self.store.is_live(neighbor) {
                ok &= self.store.get(neighbor).location != location;
            }
        }
        ok
    }

    /// Best-fitting free span for `n` pages: exact small lists first,
    /// then longer small lists, then the large sets. Within a length,
    /// normal is preferred over returned.
    fn search_free_and_large(&mut self, n: Length) -> Search {
        for length in n..MAX_PAGES {
            if let Some(handle) = self.free[length].normal.first() {
                return Search::carve_result(self.carve(handle, n));
            }
            if let Some(handle) = self.free[length].returned.first() {
                return Search::carve_result(self.carve(handle, n));
            }
        }
        self.alloc_large(n)
    }

    /// Smallest large span of length >= n, normal set before returned,
    /// ties broken by lowest start.
    fn alloc_large(&mut self, n: Length) -> Search {
        let pick = self
            .large_normal
            .range((n, 0)..)
            .next()
            .or_else(|| self.large_returned.range((n, 0)..).next())
            .map(|(_, &handle)| handle);
        match pick {
            Some(handle) => Search::carve_result(self.carve(handle, n)),
            None => Search::NotFound,
        }
    }

    /// Detach a free span and hand out its first `n` pages; the
    /// remainder goes back to the free structure it came from.
    fn carve(&mut self, handle: SpanHandle, n: Length) -> Option<SpanHandle> {
        let old_location = self.store.get(handle).location;
        debug_assert_ne!(old_location, SpanLocation::InUse);
        self.remove_from_free_structure(handle);

        // returned pages need backing before hand-out
        if old_location == SpanLocation::OnReturnedFreelist {
            let start = self.store.get(handle).start;
            if self.commit_range(start, n).is_err() {
                warn!("commit of {} pages at page {:#x} failed", n, start);
                self.prepend_to_free_structure(handle);
                return None;
            }
        }

        let (start, length) = {
            let span = self.store.get(handle);
            (span.start, span.length)
        };
        let extra = length - n;
        if extra > 0 {
            let leftover = self.store.new_span(start + n, extra);
            self.store.get_mut(leftover).location = old_location;
            self.record_span(leftover);
            // no coalescing candidates: the left neighbor is the span
            // being carved, the right one did not match before the carve
            self.prepend_to_free_structure(leftover);

            self.store.get_mut(handle).length = n;
            self.pagemap.set(start + n - 1, handle);
        }
        self.store.get_mut(handle).location = SpanLocation::InUse;
        trace!("carve {} pages at page {:#x}, {} left over", n, start, extra);
        Some(handle)
    }

    /// Ask the system for at least `n` pages and file the new range as a
    /// returned span. A range landing next to an existing returned span
    /// coalesces on entry.
    fn grow_heap(&mut self, n: Length) -> bool {
        let mut ask = n.max(MIN_SYSTEM_ALLOC);
        if self.over_limit(ask) {
            ask = n;
        }

        let mut alloc = self.sys.reserve(ask << PAGE_SHIFT, PAGE_SIZE);
        if alloc.is_none() && ask > n {
            ask = n;
            alloc = self.sys.reserve(ask << PAGE_SHIFT, PAGE_SIZE);
        }
        let Some(SysAllocation { base, actual_bytes }) = alloc else {
            warn!("system allocator refused {} pages", ask);
            return false;
        };
        debug_assert_eq!(base % PAGE_SIZE, 0);
        debug_assert!(actual_bytes >= ask << PAGE_SHIFT);

        let first = base >> PAGE_SHIFT;
        let growth = actual_bytes >> PAGE_SHIFT;

        // slots one page either side keep the neighbor probes of
        // coalescing inside allocated pagemap nodes
        if !self.pagemap.ensure(first.saturating_sub(1), growth + 2) {
            warn!("pagemap could not cover {} pages at page {:#x}", growth, first);
            self.sys.release(base, actual_bytes);
            return false;
        }

        debug!("heap grew by {} pages at page {:#x}", growth, first);
        self.stats.reserve_count += 1;
        self.stats.total_reserve_bytes += actual_bytes as u64;
        self.stats.system_bytes += actual_bytes as u64;

        self.lo_page = self.lo_page.min(first);
        self.hi_page = self.hi_page.max(first + growth);
        self.maybe_preallocate_pagemap();

        // fresh address space arrives decommitted
        let handle = self.store.new_span(first, growth);
        self.store.get_mut(handle).location = SpanLocation::OnReturnedFreelist;
        self.record_span(handle);
        self.merge_into_free_structure(handle);
        debug_assert!(self.check());
        true
    }

    fn over_limit(&self, extra_pages: Length) -> bool {
        self.limit_bytes != 0
            && self.stats.system_bytes + pages_to_bytes(extra_pages) > self.limit_bytes as u64
    }

    /// One-shot bulk preallocation once the heap is big: covers the page
    /// window seen so far so interior nodes stop growing piecemeal.
    fn maybe_preallocate_pagemap(&mut self) {
        if self.pagemap_preallocated
            || (self.stats.system_bytes as usize) < PAGEMAP_BIG_ALLOCATION_THRESHOLD
        {
            return;
        }
        self.pagemap_preallocated = true;
        if self.lo_page < self.hi_page {
            let lo = self.lo_page;
            let span = self.hi_page - self.lo_page;
            let _ = self.pagemap.ensure(lo, span);
        }
    }

    /// Point the pagemap edges of a span at its descriptor. Interior
    /// pages are left alone and may go stale; only the edges are
    /// load-bearing.
    fn record_span(&mut self, handle: SpanHandle) {
        let (start, length) = {
            let span = self.store.get(handle);
            (span.start, span.length)
        };
        self.pagemap.set(start, handle);
        if length > 1 {
            self.pagemap.set(start + length - 1, handle);
        }
    }

    /// Coalesce an unlisted span with its neighbors and file it.
    fn merge_into_free_structure(&mut self, handle: SpanHandle) {
        // freeing under aggressive decommit drops the backing right away
        if self.aggressive_decommit
            && self.store.get(handle).location == SpanLocation::OnNormalFreelist
            && self.decommit_span(handle).is_ok()
        {
            self.store.get_mut(handle).location = SpanLocation::OnReturnedFreelist;
        }

        // Matching neighbors merge first; the cross-location pre-merge
        // may decommit the span itself, in which case the matching pass
        // runs once more so no same-list neighbor is left adjacent.
        let location_before = self.store.get(handle).location;
        self.try_merge_neighbors(handle, true);
        self.try_merge_neighbors(handle, false);
        if self.store.get(handle).location != location_before {
            self.try_merge_neighbors(handle, true);
        }

        self.prepend_to_free_structure(handle);
    }

    fn try_merge_neighbors(&mut self, handle: SpanHandle, matching_only: bool) {
        let start = self.store.get(handle).start;
        if start > 0 {
            if let Some(prev) = self.pagemap.get(start - 1) {
                if self.check_and_handle_pre_merge(handle, prev, matching_only) {
                    let (prev_start, prev_length) = {
                        let span = self.store.get(prev);
                        (span.start, span.length)
                    };
                    debug_assert_eq!(prev_start + prev_length, start);
                    self.store.retire(prev);
                    let span = self.store.get_mut(handle);
                    span.start = prev_start;
                    span.length += prev_length;
                    self.pagemap.set(prev_start, handle);
                }
            }
        }

        let (start, length) = {
            let span = self.store.get(handle);
            (span.start, span.length)
        };
        if let Some(next) = self.pagemap.get(start + length) {
            if self.check_and_handle_pre_merge(handle, next, matching_only) {
                let next_length = self.store.get(next).length;
                debug_assert_eq!(self.store.get(next).start, start + length);
                self.store.retire(next);
                let span = self.store.get_mut(handle);
                span.length += next_length;
                let last = span.start + span.length - 1;
                self.pagemap.set(last, handle);
            }
        }
    }

    /// Decides whether `other` can merge into `handle`, performing the
    /// decommit that lines their locations up when necessary. On `true`
    /// the neighbor has been removed from its free structure and is
    /// ready to be absorbed.
    fn check_and_handle_pre_merge(
        &mut self,
        handle: SpanHandle,
        other: SpanHandle,
        matching_only: bool,
    ) -> bool {
        let (other_location, other_sample) = {
            let span = self.store.get(other);
            (span.location, span.sample)
        };
        if other_location == SpanLocation::InUse || other_sample {
            return false;
        }
        let location = self.store.get(handle).location;

        if matching_only {
            if other_location != location {
                return false;
            }
        } else if other_location == location {
            // handled by the matching pass
            return false;
        } else if self.aggressive_decommit
            && location == SpanLocation::OnReturnedFreelist
            && other_location == SpanLocation::OnNormalFreelist
        {
            // decommit the neighbor so the merged run stays returned
            if self.decommit_span(other).is_err() {
                return false;
            }
        } else if !self.aggressive_decommit
            && location == SpanLocation::OnNormalFreelist
            && other_location == SpanLocation::OnReturnedFreelist
        {
            // Joining a returned neighbor costs decommitting the freed
            // span; only worth it when the merge glues together at least
            // one minimum growth unit of address space.
            let combined = self.store.get(handle).length + self.store.get(other).length;
            if combined < MIN_SYSTEM_ALLOC {
                return false;
            }
            if self.decommit_span(handle).is_err() {
                return false;
            }
            self.store.get_mut(handle).location = SpanLocation::OnReturnedFreelist;
        } else {
            return false;
        }

        self.remove_from_free_structure(other);
        true
    }

    /// Decommit one normal-free span and rehome it on the returned side.
    /// Returns its length, or 0 after a decommit failure (the span then
    /// stays normal, fully rolled back).
    fn release_span(&mut self, handle: SpanHandle) -> Length {
        debug_assert_eq!(
            self.store.get(handle).location,
            SpanLocation::OnNormalFreelist
        );
        self.remove_from_free_structure(handle);
        if self.decommit_span(handle).is_err() {
            warn!("decommit failed, span stays on the normal freelist");
            self.prepend_to_free_structure(handle);
            return 0;
        }
        let length = self.store.get(handle).length;
        self.store.get_mut(handle).location = SpanLocation::OnReturnedFreelist;
        self.merge_into_free_structure(handle);
        length
    }

    /// Deallocation-driven release: every `DEFAULT_RELEASE_DELAY` freed
    /// pages, one span is pushed back to the OS. A dry attempt backs off
    /// to `MAX_RELEASE_DELAY`.
    fn incremental_scavenge(&mut self, n: Length) {
        self.scavenge_counter -= n as i64;
        if self.scavenge_counter >= 0 {
            return;
        }
        self.stats.scavenge_count += 1;
        let released = self.release_at_least(1);
        if released > 0 {
            debug!("scavenge released {} pages", released);
            self.scavenge_counter = DEFAULT_RELEASE_DELAY;
        } else {
            self.scavenge_counter = MAX_RELEASE_DELAY;
        }
    }

    /// File a span in the structure matching its location and length,
    /// and account for it. The span must not be listed anywhere.
    fn prepend_to_free_structure(&mut self, handle: SpanHandle) {
        let (start, length, location) = {
            let span = self.store.get(handle);
            (span.start, span.length, span.location)
        };
        debug_assert_ne!(location, SpanLocation::InUse);

        let bytes = pages_to_bytes(length);
        if location == SpanLocation::OnNormalFreelist {
            self.stats.free_bytes += bytes;
        } else {
            self.stats.unmapped_bytes += bytes;
        }

        if length >= MAX_PAGES {
            let set = if location == SpanLocation::OnNormalFreelist {
                &mut self.large_normal
            } else {
                &mut self.large_returned
            };
            let previous = set.insert((length, start), handle);
            debug_assert!(previous.is_none());
        } else {
            let pair = &mut self.free[length];
            let list = if location == SpanLocation::OnNormalFreelist {
                &mut pair.normal
            } else {
                &mut pair.returned
            };
            list.push_front(&mut self.store, handle);
        }
    }

    /// Inverse of `prepend_to_free_structure`.
    fn remove_from_free_structure(&mut self, handle: SpanHandle) {
        let (start, length, location) = {
            let span = self.store.get(handle);
            (span.start, span.length, span.location)
        };
        debug_assert_ne!(location, SpanLocation::InUse);

        let bytes = pages_to_bytes(length);
        if location == SpanLocation::OnNormalFreelist {
            self.stats.free_bytes -= bytes;
        } else {
            self.stats.unmapped_bytes -= bytes;
        }

        if length >= MAX_PAGES {
            let set = if location == SpanLocation::OnNormalFreelist {
                &mut self.large_normal
            } else {
                &mut self.large_returned
            };
            let removed = set.remove(&(length, start));
            debug_assert_eq!(removed, Some(handle));
        } else {
            let pair = &mut self.free[length];
            let list = if location == SpanLocation::OnNormalFreelist {
                &mut pair.normal
            } else {
                &mut pair.returned
            };
            list.remove(&mut self.store, handle);
        }
    }

    fn commit_range(&mut self, start: PageId, n: Length) -> Result<(), ()> {
        self.stats.commit_count += 1;
        self.sys.commit(start << PAGE_SHIFT, n << PAGE_SHIFT)?;
        let bytes = pages_to_bytes(n);
        self.stats.committed_bytes += bytes;
        self.stats.total_commit_bytes += bytes;
        Ok(())
    }

    fn decommit_span(&mut self, handle: SpanHandle) -> Result<(), ()> {
        let (start, length) = {
            let span = self.store.get(handle);
            (span.start, span.length)
        };
        self.stats.decommit_count += 1;
        self.sys.decommit(start << PAGE_SHIFT, length << PAGE_SHIFT)?;
        let bytes = pages_to_bytes(length);
        self.stats.committed_bytes -= bytes;
        self.stats.total_decommit_bytes += bytes;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn sys(&mut self) -> &mut S {
        &mut self.sys
    }

    #[cfg(test)]
    pub(crate) fn live_span_count(&self) -> usize {
        self.store.live_count()
    }
}

#[cfg(test)]
mod test {
    use super::{HeapConfig, PageHeap};
    use crate::common::{MAX_PAGES, PAGE_SIZE};
    use crate::modules::system_allocator::SimSystemAllocator;
    use crate::span::SpanLocation;

    fn heap() -> PageHeap<SimSystemAllocator> {
        PageHeap::new(SimSystemAllocator::new(), HeapConfig::default())
    }

    #[test]
    fn test_exact_small_reuse() {
        let mut heap = heap();

        let a = heap.allocate(3).unwrap();
        let start = heap.span_info(a).start;
        heap.deallocate(a);

        // the freed span coalesces into the returned tail, so the next
        // allocate carves from the front of the arena again
        let b = heap.allocate(3).unwrap();
        assert_eq!(heap.span_info(b).start, start);
        assert!(heap.check_expensive());
    }

    #[test]
    fn test_carve_leftover_keeps_location() {
        let mut heap = heap();

        let a = heap.allocate(10).unwrap();
        let info = heap.span_info(a);
        assert_eq!(info.length, 10);
        assert_eq!(info.location, SpanLocation::InUse);

        // the arena is 256 pages, so a returned tail of 246 remains
        let stats = heap.stats();
        assert_eq!(stats.system_bytes, 256 * PAGE_SIZE as u64);
        assert_eq!(stats.committed_bytes, 10 * PAGE_SIZE as u64);
        assert_eq!(stats.unmapped_bytes, 246 * PAGE_SIZE as u64);
        assert_eq!(stats.free_bytes, 0);
        assert!(heap.check_expensive());
    }

    #[test]
    fn test_first_large_path() {
        let mut heap = heap();
        let a = heap.allocate(MAX_PAGES).unwrap();
        assert_eq!(heap.span_info(a).length, MAX_PAGES);
        assert!(heap.check_expensive());

        let b = heap.allocate(MAX_PAGES - 1).unwrap();
        assert_eq!(heap.span_info(b).length, MAX_PAGES - 1);
        assert!(heap.check_expensive());
    }

    #[test]
    fn test_get_descriptor_edges() {
        let mut heap = heap();
        let a = heap.allocate(16).unwrap();
        let info = heap.span_info(a);

        assert_eq!(heap.get_descriptor(info.start), Some(a));
        assert_eq!(heap.get_descriptor(info.start + info.length - 1), Some(a));
        assert_eq!(heap.get_descriptor(3), None);
    }

    #[test]
    fn test_register_size_class_populates_cache() {
        let mut heap = heap();
        let a = heap.allocate(4).unwrap();
        let info = heap.span_info(a);

        assert_eq!(heap.try_get_size_class(info.start), None);
        heap.register_size_class(a, 9);

        for p in info.start..info.start + info.length {
            assert_eq!(heap.try_get_size_class(p), Some(9));
            assert_eq!(heap.get_descriptor(p), Some(a));
        }

        heap.deallocate(a);
        for p in info.start..info.start + info.length {
            assert_eq!(heap.try_get_size_class(p), None);
        }
        assert!(heap.check_expensive());
    }

    #[test]
    fn test_sampled_neighbor_not_merged() {
        let mut heap = heap();
        let a = heap.allocate(4).unwrap();
        let b = heap.allocate(4).unwrap();
        let c = heap.allocate(4).unwrap();
        assert_eq!(
            heap.span_info(a).start + 4,
            heap.span_info(b).start,
            "carves should be address ordered"
        );

        heap.set_sample(b, true);
        heap.deallocate(a);
        heap.deallocate(c);
        assert!(heap.check_expensive());

        // b sits between two free spans but stays whole
        assert_eq!(heap.span_info(b).length, 4);
        assert!(heap.span_info(b).sample);
        heap.deallocate(b);
        assert!(heap.check_expensive());
    }

    #[test]
    fn test_commit_failure_rolls_back() {
        let mut heap = heap();
        let stats_before = {
            let a = heap.allocate(4).unwrap();
            heap.deallocate(a);
            heap.stats()
        };

        heap.sys().fail_next_commit = true;
        assert!(heap.allocate(4).is_none());

        let stats = heap.stats();
        assert_eq!(stats.system_bytes, stats_before.system_bytes);
        assert_eq!(stats.unmapped_bytes, stats_before.unmapped_bytes);
        assert_eq!(stats.committed_bytes, stats_before.committed_bytes);
        assert!(heap.check_expensive());

        // the heap recovers once commit works again
        assert!(heap.allocate(4).is_some());
        assert!(heap.check_expensive());
    }

    #[test]
    fn test_decommit_failure_keeps_span_normal() {
        let mut heap = heap();
        let a = heap.allocate(4).unwrap();
        let b = heap.allocate(4).unwrap();
        // a's only neighbor is the in-use b, so it stays on the normal list
        heap.deallocate(a);
        let _ = b;
        assert_eq!(heap.stats().free_bytes, 4 * PAGE_SIZE as u64);

        heap.sys().fail_next_decommit = true;
        assert_eq!(heap.release_at_least(1), 0);
        assert_eq!(heap.stats().free_bytes, 4 * PAGE_SIZE as u64);
        assert!(heap.check_expensive());

        assert_eq!(heap.release_at_least(1), 4);
        assert_eq!(heap.stats().free_bytes, 0);
        assert!(heap.check_expensive());
    }
}
