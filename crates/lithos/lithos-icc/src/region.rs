//! Typed views over a mapped segment.
//!
//! A `Region` owns the memory (a shared file mapping, or a heap block that
//! stands in for one in tests) and hands out references to the header, the
//! reader slots and byte ranges of the data area. Every view is bounds
//! checked against the layout at construction or in debug builds.

use crate::segment::SegmentIdent;
use crate::shm_layout::{DATA_OFFSET, MAX_READERS, READERS_OFFSET, ReaderSlot, SegmentHeader};
use lithos_mmap::ShmFile;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicU32;

enum Backing {
    /// Keeps the mapping alive; never accessed after `base` is taken.
    Shm { _file: ShmFile },
    Heap(Layout),
}

pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
    ident: Option<SegmentIdent>,
}

// SAFETY: all shared state inside the region is accessed through atomics or
// through the ring protocol, which hands each byte range to one side at a time.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Wrap a mapped segment file. The mapping must be at least header-sized.
    pub(crate) fn from_shm(mut file: ShmFile, ident: SegmentIdent) -> Option<Self> {
        if file.len() < DATA_OFFSET {
            return None;
        }
        let base = NonNull::new(file.as_mut_ptr())?;
        let len = file.len();
        Some(Self {
            base,
            len,
            backing: Backing::Shm { _file: file },
            ident: Some(ident),
        })
    }

    /// Zeroed heap block laid out like a segment of `len` bytes.
    pub(crate) fn heap(len: usize) -> Option<Self> {
        if len < DATA_OFFSET {
            return None;
        }
        let layout = Layout::from_size_align(len, 64).ok()?;
        // SAFETY: layout has non-zero size (len >= DATA_OFFSET > 0).
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(Self {
            base,
            len,
            backing: Backing::Heap(layout),
            ident: None,
        })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn ident(&self) -> Option<&SegmentIdent> {
        self.ident.as_ref()
    }

    #[inline(always)]
    pub(crate) fn header(&self) -> &SegmentHeader {
        // SAFETY: construction guarantees len >= DATA_OFFSET and both mmap and
        // heap bases are at least 64-byte aligned.
        unsafe { &*(self.base.as_ptr() as *const SegmentHeader) }
    }

    #[inline(always)]
    pub(crate) fn reader_slot(&self, idx: usize) -> &ReaderSlot {
        assert!(idx < MAX_READERS, "reader slot {idx} out of range");
        // SAFETY: the slot table lies entirely inside the header area checked
        // at construction.
        unsafe {
            &*(self
                .base
                .as_ptr()
                .add(READERS_OFFSET + idx * size_of::<ReaderSlot>())
                as *const ReaderSlot)
        }
    }

    #[inline(always)]
    fn data(&self) -> *mut u8 {
        // SAFETY: DATA_OFFSET <= len.
        unsafe { self.base.as_ptr().add(DATA_OFFSET) }
    }

    #[inline(always)]
    fn check(&self, offset: usize, len: usize) {
        debug_assert!(
            DATA_OFFSET + offset + len <= self.len,
            "data range {offset}+{len} outside segment"
        );
    }

    /// The length prefix word of the slot at data offset `offset`.
    #[inline(always)]
    pub(crate) fn prefix(&self, offset: usize) -> &AtomicU32 {
        self.check(offset, 4);
        debug_assert!(offset % 8 == 0, "unaligned slot offset {offset}");
        // SAFETY: in bounds per `check`; slot offsets are 8-aligned and the
        // data area is 64-aligned.
        unsafe { &*(self.data().add(offset) as *const AtomicU32) }
    }

    /// Borrow `len` bytes of the data area.
    ///
    /// # Safety
    /// The range must be committed and, under the reject policy, not
    /// reclaimable while the borrow lives (the caller's cursor gates it).
    #[inline(always)]
    pub(crate) unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        self.check(offset, len);
        unsafe { std::slice::from_raw_parts(self.data().add(offset), len) }
    }

    /// Mutably borrow `len` bytes of the data area.
    ///
    /// # Safety
    /// The range must be reserved by the single producer and not visible to
    /// any reader.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        self.check(offset, len);
        unsafe { std::slice::from_raw_parts_mut(self.data().add(offset), len) }
    }

    /// Copy `dst.len()` bytes out of the data area without forming a shared
    /// reference, for ranges the producer may be overwriting concurrently.
    #[inline(always)]
    pub(crate) fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len());
        // SAFETY: in bounds per `check`; torn reads are detected by the caller.
        unsafe { ptr::copy_nonoverlapping(self.data().add(offset), dst.as_mut_ptr(), dst.len()) };
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Backing::Heap(layout) = self.backing {
            // SAFETY: allocated in `heap` with this exact layout.
            unsafe { dealloc(self.base.as_ptr(), layout) };
        }
    }
}
