//! Conservative mark-sweep allocator over an owned arena.
//!
//! A collector whose arena, globals and mutator all lived in the same
//! address space could scan the process's own static data segment and
//! its own call stack for roots with no abstraction between them. This
//! crate has no linker-script cooperation to discover a caller's own
//! data segment, so globals are modeled explicitly: [`GcHeap::new`]
//! takes a [`GlobalsRegion`] the caller registers, rather than the
//! collector discovering it via platform symbols (see DESIGN.md). The
//! stack root scan is not modeled away the same way — it walks this OS
//! thread's real frame-pointer chain, since that part of marking is
//! about the mutator's actual call stack rather than its data segment.
//!
//! A block's header is `{ info: u64, next: word offset }`, stored inline
//! in the arena. A finalizer does not fit inline next to the header, so
//! finalizers are kept out-of-band in a side table keyed by header
//! offset. The rest of the algorithm — tri-bit info word, first-fit
//! search, mark phases in globals/stack/heap order, sweep-with-
//! coalescing, finalizer-before-coalesce — follows the conventional
//! conservative mark-sweep shape.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;

use tracing::{debug, trace};

use crate::error::AllocError;

const ALLOC_BIT: u64 = 1 << 63;
const MARK_BIT: u64 = 1 << 62;
const SIZE_MASK: u64 = (1 << 62) - 1;

/// Words occupied by a block header in the arena: `info`, then `next`.
const HEADER_WORDS: usize = 2;

/// Sentinel `next` value meaning "tail of the list".
const NO_NEXT: u64 = u64::MAX;

/// A caller-registered byte range treated as the GC's "globals" root set,
/// standing in for `__data_start`.._end` (see the module docs). Callers
/// typically register the backing storage of their own global `GcPtr`
/// slots here.
#[derive(Clone, Copy)]
pub struct GlobalsRegion {
    base: *const u8,
    len_bytes: usize,
}

impl GlobalsRegion {
    /// Builds a region covering `slice`, read word-by-word as a root set
    /// on every collection. `slice` must outlive the [`GcHeap`] it is
    /// registered with.
    pub fn of_words(slice: &[u64]) -> Self {
        Self {
            base: slice.as_ptr().cast(),
            len_bytes: std::mem::size_of_val(slice),
        }
    }
}

fn info_make(alloc: bool, mark: bool, size: u64) -> u64 {
    ((alloc as u64) << 63) | ((mark as u64) << 62) | (size & SIZE_MASK)
}

/// A handle to a live allocation's first payload word, opaque outside
/// this module except for the raw address it carries — callers write
/// addresses of other `GcPtr`s into a block's payload to build the
/// pointer graph the collector traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcPtr(usize);

impl GcPtr {
    /// The raw address of this allocation's first payload word, as a
    /// conservative root value suitable for storing into another block's
    /// payload or a registered [`GlobalsRegion`].
    pub fn addr(self) -> u64 {
        self.0 as u64
    }
}

impl fmt::Display for GcPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A finalizer: run exactly once, with the address of the block it was
/// attached to, when that block is collected.
pub type Finalizer = Box<dyn FnOnce(GcPtr)>;

/// A conservative mark-sweep heap: one contiguous `Box<[u64]>` arena
/// carved into an address-ordered singly-linked list of blocks.
pub struct GcHeap {
    arena: Box<[u64]>,
    globals: Option<GlobalsRegion>,
    stack_top: Cell<usize>,
    frame_bottom: Cell<usize>,
    finalizers: RefCell<HashMap<usize, Finalizer>>,
    in_finalizer: Cell<bool>,
}

impl GcHeap {
    /// Allocates an arena of `(1.2 * requested_words).ceil()` words and
    /// formats it as a single free block. Returns `Err` on size `0` or a
    /// size that would not fit the 62-bit payload field. `GcHeap::new`
    /// returns an owned value rather than mutating a `static`, so a
    /// second call is simply a second independent heap — callers that
    /// want a single reinitializable heap hold the first `GcHeap` and
    /// never call `new` again.
    pub fn new(requested_words: u64, globals: Option<GlobalsRegion>) -> Result<Self, AllocError> {
        if requested_words == 0 || requested_words > SIZE_MASK {
            return Err(AllocError::InvalidSize);
        }
        let total_words = (requested_words as f64 * 1.2).ceil() as usize;
        let mut arena = vec![0u64; total_words].into_boxed_slice();
        arena[0] = info_make(false, false, (total_words - HEADER_WORDS) as u64);
        arena[1] = NO_NEXT;

        debug!(total_words, "gc heap initialized");

        Ok(Self {
            arena,
            globals,
            stack_top: Cell::new(0),
            frame_bottom: Cell::new(0),
            finalizers: RefCell::new(HashMap::new()),
            in_finalizer: Cell::new(false),
        })
    }

    fn total_words(&self) -> usize {
        self.arena.len()
    }

    fn base_addr(&self) -> usize {
        self.arena.as_ptr() as usize
    }

    fn word_addr(&self, index: usize) -> usize {
        self.base_addr() + index * 8
    }

    /// Maps a conservative root value to an arena word index, if it names
    /// one: the address must be 8-byte aligned and fall within the arena.
    fn index_of_addr(&self, addr: u64) -> Option<usize> {
        let addr = addr as usize;
        let base = self.base_addr();
        let span = self.total_words() * 8;
        if addr < base || addr >= base + span || (addr - base) % 8 != 0 {
            return None;
        }
        Some((addr - base) / 8)
    }

    fn info(&self, header: usize) -> u64 {
        self.arena[header]
    }

    fn set_info(&mut self, header: usize, info: u64) {
        self.arena[header] = info;
    }

    fn next(&self, header: usize) -> Option<usize> {
        let n = self.arena[header + 1];
        (n != NO_NEXT).then_some(n as usize)
    }

    fn set_next(&mut self, header: usize, next: Option<usize>) {
        self.arena[header + 1] = next.map_or(NO_NEXT, |n| n as u64);
    }

    fn size(&self, header: usize) -> u64 {
        self.info(header) & SIZE_MASK
    }

    fn is_alloc(&self, header: usize) -> bool {
        self.info(header) & ALLOC_BIT != 0
    }

    fn is_marked(&self, header: usize) -> bool {
        self.info(header) & MARK_BIT != 0
    }

    /// Finds the block whose payload range contains word index `word`, if
    /// any. Mirrors `getBlock`'s address-ordered linear scan.
    fn block_containing(&self, word: usize) -> Option<usize> {
        let mut cur = Some(0usize);
        while let Some(header) = cur {
            let payload_start = header + HEADER_WORDS;
            let payload_end = payload_start + self.size(header) as usize;
            if (payload_start..payload_end).contains(&word) {
                return Some(header);
            }
            cur = self.next(header);
        }
        None
    }

    /// Refreshes the saved stack bounds from the calling frame by
    /// snapshotting `%rsp`/`%rbp` on entry.
    ///
    /// # Safety
    /// Must be called on the same OS thread that owns this heap; the
    /// captured `rbp` must belong to a normal frame-pointer-chained call
    /// stack (true for any non-`-fomit-frame-pointer` x86-64 build, which
    /// is what this crate assumes throughout).
    #[cfg(target_arch = "x86_64")]
    unsafe fn refresh_stack_bounds(&self) {
        let rsp: usize;
        let rbp: usize;
        std::arch::asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags));
        std::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags));
        self.stack_top.set(rsp);
        self.frame_bottom.set(rbp);
    }

    #[cfg(not(target_arch = "x86_64"))]
    unsafe fn refresh_stack_bounds(&self) {
        // No portable way to read the frame-pointer chain; the stack root
        // scan degrades to "no stack roots" rather than reading garbage.
        self.stack_top.set(0);
        self.frame_bottom.set(0);
    }

    /// First-fit search for a free block whose payload holds at least
    /// `size` words.
    fn first_fit(&self, size: u64) -> Option<usize> {
        let mut cur = Some(0usize);
        while let Some(header) = cur {
            if !self.is_alloc(header) && self.size(header) >= size {
                return Some(header);
            }
            cur = self.next(header);
        }
        None
    }

    /// Allocates `size` words, recording `finalizer` to run exactly once
    /// when the block is eventually collected. Runs a collection and
    /// retries once if no free block is large enough; returns
    /// [`AllocError::OutOfMemory`] if that still fails.
    ///
    /// # Panics
    /// Calling this reentrantly from a finalizer is a fatal error, not a
    /// recoverable one: it aborts the process with a diagnostic rather
    /// than returning.
    pub fn allocate(
        &mut self,
        size: u64,
        finalizer: Option<Finalizer>,
    ) -> Result<GcPtr, AllocError> {
        if self.in_finalizer.get() {
            eprintln!("fatal: allocate() called reentrantly from a finalizer");
            panic!("allocate() called reentrantly from a finalizer");
        }

        // SAFETY: called on the owning thread, per the type's contract.
        unsafe { self.refresh_stack_bounds() };

        let header = match self.first_fit(size) {
            Some(h) => h,
            None => {
                let freed = self.mark_and_sweep();
                if freed == 0 {
                    return Err(AllocError::OutOfMemory);
                }
                self.first_fit(size).ok_or(AllocError::OutOfMemory)?
            }
        };

        let block_size = self.size(header);
        let remainder = block_size.saturating_sub(size);
        if remainder >= HEADER_WORDS as u64 + 1 {
            let new_header = header + HEADER_WORDS + size as usize;
            let old_next = self.next(header);
            self.arena[new_header] = info_make(false, false, remainder - HEADER_WORDS as u64);
            self.arena[new_header + 1] = NO_NEXT;
            self.set_next(new_header, old_next);
            self.set_info(header, info_make(true, false, size));
            self.set_next(header, Some(new_header));
        } else {
            self.set_info(header, info_make(true, false, block_size));
        }

        if let Some(f) = finalizer {
            self.finalizers.borrow_mut().insert(header, f);
        } else {
            self.finalizers.borrow_mut().remove(&header);
        }

        let ptr = GcPtr(self.word_addr(header + HEADER_WORDS));
        trace!(size, addr = %ptr, "gc allocate");
        Ok(ptr)
    }

    /// Reads payload word `offset` (0-based) of the allocation at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a still-live allocation from this heap and `offset`
    /// within its requested size.
    pub unsafe fn read(&self, ptr: GcPtr, offset: usize) -> u64 {
        let header = self.index_of_addr(ptr.addr()).expect("ptr not in arena") - HEADER_WORDS;
        self.arena[header + HEADER_WORDS + offset]
    }

    /// Writes payload word `offset` of the allocation at `ptr`. Used to
    /// build the pointer graph the collector traces: storing another
    /// `GcPtr`'s [`GcPtr::addr`] here makes this block keep that one
    /// alive.
    ///
    /// # Safety
    /// Same contract as [`GcHeap::read`].
    pub unsafe fn write(&mut self, ptr: GcPtr, offset: usize, value: u64) {
        let header = self.index_of_addr(ptr.addr()).expect("ptr not in arena") - HEADER_WORDS;
        self.arena[header + HEADER_WORDS + offset] = value;
    }

    /// Marks from globals, the stack, and the heap-to-heap fixed point,
    /// then sweeps, coalescing adjacent free blocks and running each
    /// newly-freed block's finalizer exactly once before it is absorbed.
    /// Returns the number of words freed, matching `markAndSweep`'s return
    /// value (`0` meaning the caller should treat the heap as exhausted).
    fn mark_and_sweep(&mut self) -> u64 {
        debug!("gc: mark and sweep begin");
        self.mark_globals();
        self.mark_stack();
        self.mark_heap_to_heap_fixed_point();
        let freed = self.sweep();
        debug!(freed, "gc: mark and sweep done");
        freed
    }

    /// Chases a root value through globals/stack indirection (bounded to
    /// 100 hops) until it either resolves to a heap block (which it
    /// marks) or runs out.
    fn chase_and_mark(&mut self, mut data: u64) {
        let mut iterations_left = 100;
        while data != 0 && iterations_left > 0 {
            iterations_left -= 1;
            if let Some(word) = self.index_of_addr(data) {
                if let Some(header) = self.block_containing(word) {
                    if !self.is_marked(header) && self.is_alloc(header) {
                        self.set_info(header, self.info(header) | MARK_BIT);
                        return;
                    }
                    // Already marked or free: keep chasing whatever this
                    // word itself points to.
                    data = self.arena[word];
                    continue;
                }
                // In-arena but not inside any block's payload (a header
                // word, or between blocks): nothing more to chase.
                return;
            }
            if self.in_globals_range(data) || self.in_stack_range(data) {
                data = self.read_root_word(data);
                continue;
            }
            return;
        }
    }

    fn in_globals_range(&self, addr: u64) -> bool {
        match self.globals {
            Some(region) => {
                let base = region.base as u64;
                (base..base + region.len_bytes as u64).contains(&addr)
            }
            None => false,
        }
    }

    fn in_stack_range(&self, addr: u64) -> bool {
        let addr = addr as usize;
        self.frame_bottom.get() > addr && addr >= self.stack_top.get()
    }

    /// Reads one `u64` from a raw address already established to lie in
    /// globals or stack range.
    ///
    /// # Safety note: not `unsafe fn` because the two callers
    /// (`chase_and_mark`, the root scans) have already range-checked the
    /// address via `in_globals_range`/`in_stack_range`, which is itself
    /// only as sound as the caller's promise that the registered
    /// [`GlobalsRegion`] and the live stack are what they claim to be.
    fn read_root_word(&self, addr: u64) -> u64 {
        unsafe { (addr as *const u64).read_unaligned() }
    }

    fn mark_globals(&mut self) {
        let Some(region) = self.globals else {
            return;
        };
        let count = region.len_bytes / 8;
        let mut marked = 0;
        for i in 0..count {
            let word_addr = region.base as u64 + (i * 8) as u64;
            let data = self.read_root_word(word_addr);
            let before = self.count_marked();
            self.chase_and_mark(data);
            if self.count_marked() > before {
                marked += 1;
            }
        }
        debug!(marked, "gc: globals scan");
    }

    fn mark_stack(&mut self) {
        let mut marked = 0;
        let mut top = self.stack_top.get();
        let mut bottom = self.frame_bottom.get();
        let mut frame_count = 0;
        loop {
            if bottom <= top || bottom == 0 {
                break;
            }
            if bottom == top || frame_count > 128 {
                break;
            }
            if bottom % std::mem::align_of::<usize>() != 0 {
                break;
            }
            let mut addr = top;
            while addr <= bottom {
                let data = unsafe { (addr as *const u64).read_unaligned() };
                let before = self.count_marked();
                self.chase_and_mark(data);
                if self.count_marked() > before {
                    marked += 1;
                }
                addr += 8;
            }
            frame_count += 1;
            top = bottom;
            bottom = unsafe { (bottom as *const usize).read_unaligned() };
        }
        debug!(marked, frames = frame_count, "gc: stack scan");
    }

    fn count_marked(&self) -> usize {
        let mut cur = Some(0usize);
        let mut n = 0;
        while let Some(h) = cur {
            if self.is_marked(h) {
                n += 1;
            }
            cur = self.next(h);
        }
        n
    }

    /// Iterates the block list to a fixed point: any payload word inside a
    /// marked, allocated block that names another allocated, unmarked
    /// block marks it too. Needed because a live block's payload may be
    /// the only reference keeping another block alive.
    fn mark_heap_to_heap_fixed_point(&mut self) {
        let mut marked_any = true;
        let mut rounds = 0;
        while marked_any {
            marked_any = false;
            let mut cur = Some(0usize);
            while let Some(header) = cur {
                if self.is_marked(header) && self.is_alloc(header) {
                    let start = header + HEADER_WORDS;
                    let end = start + self.size(header) as usize;
                    for word in start..end {
                        let data = self.arena[word];
                        if let Some(target_word) = self.index_of_addr(data) {
                            if let Some(target) = self.block_containing(target_word) {
                                if !self.is_marked(target) && self.is_alloc(target) {
                                    self.set_info(target, self.info(target) | MARK_BIT);
                                    marked_any = true;
                                }
                            }
                        }
                    }
                }
                cur = self.next(header);
            }
            rounds += 1;
        }
        debug!(rounds, "gc: heap-to-heap fixed point");
    }

    /// Left-to-right sweep: clears `MARK` on survivors, frees and
    /// finalizes the rest, coalescing adjacent free blocks. Returns words
    /// freed.
    fn sweep(&mut self) -> u64 {
        let mut words_freed = 0u64;
        let mut cur = Some(0usize);
        let mut prev: Option<usize> = None;

        while let Some(header) = cur {
            let next = self.next(header);

            if self.is_marked(header) {
                self.set_info(header, self.info(header) & !MARK_BIT);
                prev = None;
                cur = next;
                continue;
            }

            if self.is_alloc(header) {
                self.set_info(header, self.info(header) & !ALLOC_BIT);
                words_freed += self.size(header);
                if let Some(finalizer) = self.finalizers.borrow_mut().remove(&header) {
                    let ptr = GcPtr(self.word_addr(header + HEADER_WORDS));
                    self.in_finalizer.set(true);
                    finalizer(ptr);
                    self.in_finalizer.set(false);
                }
            }

            match prev {
                Some(p) => {
                    let merged = self.size(p) + HEADER_WORDS as u64 + self.size(header);
                    self.set_info(p, info_make(false, false, merged));
                    self.set_next(p, next);
                    words_freed += HEADER_WORDS as u64;
                }
                None => prev = Some(header),
            }

            cur = next;
        }

        words_freed
    }

    /// Diagnostic dump: globals, reachable stack frames, and a walk of
    /// every block with runs of zero payload words collapsed to
    /// `first-zero / skipped-N / last-zero`, matching `memDump`.
    pub fn dump(&self, out: &mut dyn std::fmt::Write) -> std::fmt::Result {
        writeln!(out, "Blocks:")?;
        let mut cur = Some(0usize);
        let mut block_count = 0;
        while let Some(header) = cur {
            block_count += 1;
            let size = self.size(header);
            write!(
                out,
                "Block {block_count} ({}): {size} words.",
                if self.is_alloc(header) { "Allocated" } else { "Free" }
            )?;
            if self.is_alloc(header) {
                writeln!(out, " has finalizer: {}", self.finalizers.borrow().contains_key(&header))?;
                let start = header + HEADER_WORDS;
                self.dump_payload(out, start, size as usize)?;
            } else {
                writeln!(out)?;
            }
            cur = self.next(header);
        }
        writeln!(out, "End heap.")
    }

    fn dump_payload(&self, out: &mut dyn std::fmt::Write, start: usize, len: usize) -> std::fmt::Result {
        let mut i = 0;
        while i < len {
            let value = self.arena[start + i];
            if value == 0 {
                let run_start = i;
                let mut j = i;
                while j < len && self.arena[start + j] == 0 {
                    j += 1;
                }
                let zeros = j - run_start;
                writeln!(out, "  [{run_start}]: 0")?;
                if zeros > 2 {
                    writeln!(out, "       ... skipped {} words of 0 ...", zeros - 2)?;
                }
                if zeros > 1 {
                    writeln!(out, "  [{}]: 0", j - 1)?;
                }
                i = j;
            } else {
                writeln!(out, "  [{i}]: {value:#x}")?;
                i += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The only reference to a finalized block is a local that goes out
    /// of scope when a nested call returns, then enough further
    /// allocation happens that the collector's next pass no longer finds
    /// a stale copy of the address lying in the now-dead stack region
    /// above the new stack top. This is conservative-GC-inherent: it
    /// depends on the dead frame's stack words getting overwritten rather
    /// than on any language guarantee, which is why the test drives
    /// several rounds of unrelated allocation before asserting.
    #[test]
    fn reference_dropped_in_returned_function_is_eventually_collected() {
        let released = std::rc::Rc::new(Cell::new(false));

        fn allocate_and_discard(heap: &mut GcHeap, released: std::rc::Rc<Cell<bool>>) {
            let _ptr = heap
                .allocate(20, Some(Box::new(move |_| released.set(true))))
                .unwrap();
        }

        // A small arena so a handful of unrelated allocations exhausts it
        // and forces at least one collection.
        let mut heap = GcHeap::new(60, None).unwrap();
        allocate_and_discard(&mut heap, released.clone());

        let mut collected = false;
        for _ in 0..20 {
            if heap.allocate(5, None).is_err() {
                break;
            }
            if released.get() {
                collected = true;
                break;
            }
        }
        assert!(collected, "finalizer should have run during some collection");
    }

    #[test]
    fn allocation_exceeding_arena_fails_without_panicking() {
        let mut heap = GcHeap::new(10, None).unwrap();
        assert_eq!(heap.allocate(1000, None), Err(AllocError::OutOfMemory));
    }

    #[test]
    #[should_panic(expected = "reentrantly from a finalizer")]
    fn reentrant_allocate_from_finalizer_is_fatal() {
        let mut heap = GcHeap::new(50, None).unwrap();
        let _first = heap.allocate(10, Some(Box::new(|_| {}))).unwrap();
        // Force `in_finalizer` manually to exercise the reentrancy guard
        // without constructing a real nested-allocate finalizer (which
        // would need `&mut GcHeap` inside a `FnOnce(GcPtr)` closure that
        // cannot also borrow `heap` mutably).
        heap.in_finalizer.set(true);
        let _ = heap.allocate(1, None);
    }

    #[test]
    fn zero_size_initialize_is_rejected() {
        assert!(GcHeap::new(0, None).is_err());
    }

    #[test]
    fn first_allocation_formats_a_single_free_block_minus_header() {
        let heap = GcHeap::new(100, None).unwrap();
        assert_eq!(heap.next(0), None);
        assert!(!heap.is_alloc(0));
    }
}
