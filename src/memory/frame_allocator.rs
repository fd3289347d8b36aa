//! Bitmap physical frame allocator.
//!
//! One bit per 4 KiB frame, packed into 32-bit words. A set bit means the
//! frame is owned by something: the firmware, the kernel image, or a page
//! mapping. Allocation is first-fit from the lowest address, skipping words
//! that are completely full.
//!
//! A second bitmap remembers which used frames came out of the free pool,
//! either through [`FrameAllocator::allocate_frame`] or by being mapped while
//! free. Only those go back to the pool when their last mapping is removed;
//! reserved memory and the kernel image stay used no matter what is unmapped.

use alloc::{boxed::Box, collections::BTreeMap, vec};
use core::fmt;

use x86_64::structures::paging::PageTableFlags;

use crate::{
    constants::memory::{
        BITMAP_ENTRY_BITS, FRAME_SIZE, FULL_BITMAP_ENTRY, MAX_FRAMES, RESERVED_LOW_FRAMES,
    },
    error::{KernelError, KernelResult},
    memory::PhysAddr,
};

/// Index of a physical frame (physical address / 4 KiB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameIndex(usize);

impl FrameIndex {
    /// Frame number `index`, tracked or not.
    pub const fn new(index: usize) -> Self {
        FrameIndex(index)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// The frame `addr` falls into.
    pub const fn containing(addr: PhysAddr) -> Self {
        FrameIndex(addr.as_usize() / FRAME_SIZE as usize)
    }

    /// First byte of the frame.
    pub const fn start_address(self) -> PhysAddr {
        PhysAddr::new(self.0 as u32 * FRAME_SIZE)
    }
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An allocated frame together with the access it was requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub index: FrameIndex,
    pub kernel: bool,
    pub writable: bool,
}

impl Frame {
    pub fn start_address(&self) -> PhysAddr {
        self.index.start_address()
    }

    /// Page table flags matching the requested access.
    pub fn flags(&self) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        if self.writable {
            flags |= PageTableFlags::WRITABLE;
        }
        if !self.kernel {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        flags
    }
}

/// Region types a multiboot memory map reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    Available,
    Reserved,
    Acpi,
    Nvs,
    BadRam,
}

impl MemoryRegionKind {
    /// Decodes the `type` field of a multiboot memory map entry.
    pub fn from_multiboot(kind: u32) -> Self {
        match kind {
            1 => MemoryRegionKind::Available,
            3 => MemoryRegionKind::Acpi,
            4 => MemoryRegionKind::Nvs,
            5 => MemoryRegionKind::BadRam,
            _ => MemoryRegionKind::Reserved,
        }
    }
}

/// One entry of the physical memory map, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

/// Owner of all physical frames.
pub struct FrameAllocator {
    total_frames: usize,
    used_frames: usize,
    bitmap: Box<[u32]>,
    /// Used frames that were taken from the pool and may return to it.
    pooled: Box<[u32]>,
    /// Live page mappings per frame. Frames without mappings have no entry.
    mappings: BTreeMap<usize, u32>,
}

impl FrameAllocator {
    /// Tracks `total_frames` frames (capped at 4 GiB worth), all free except
    /// the reserved low megabyte.
    pub fn new(total_frames: usize) -> Self {
        let mut allocator = Self::with_fill(total_frames, 0);
        allocator.reserve_low_memory();
        allocator
    }

    /// Builds the bitmap from a physical memory map. Only available regions
    /// become allocatable; the low megabyte stays reserved regardless.
    pub fn from_regions(regions: &[MemoryRegion]) -> Self {
        let top = regions
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Available)
            .map(|r| r.base.saturating_add(r.length))
            .max()
            .unwrap_or(0);

        let total_frames = (top / u64::from(FRAME_SIZE)) as usize;
        let mut allocator = Self::with_fill(total_frames, FULL_BITMAP_ENTRY);

        for region in regions
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Available)
        {
            // Only whole frames inside the region are usable.
            let frame = u64::from(FRAME_SIZE);
            let start = region.base.div_ceil(frame) as usize;
            let end = (region.base.saturating_add(region.length) / frame) as usize;
            for index in start..end.min(allocator.total_frames) {
                allocator.clear_bit(index);
            }
        }

        allocator.reserve_low_memory();
        allocator
    }

    fn with_fill(total_frames: usize, fill: u32) -> Self {
        let total_frames = total_frames.min(MAX_FRAMES);
        let words = total_frames.div_ceil(BITMAP_ENTRY_BITS);
        let used_frames = if fill == 0 { 0 } else { total_frames };
        FrameAllocator {
            total_frames,
            used_frames,
            bitmap: vec![fill; words].into_boxed_slice(),
            pooled: vec![0; words].into_boxed_slice(),
            mappings: BTreeMap::new(),
        }
    }

    fn reserve_low_memory(&mut self) {
        for index in 0..RESERVED_LOW_FRAMES.min(self.total_frames) {
            self.set_bit(index);
        }
    }

    /// First-fit allocation of the lowest free frame.
    pub fn allocate_frame(&mut self, kernel: bool, writable: bool) -> KernelResult<Frame> {
        let index = self
            .bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != FULL_BITMAP_ENTRY)
            .map(|(word_index, word)| word_index * BITMAP_ENTRY_BITS + word.trailing_ones() as usize)
            .filter(|index| *index < self.total_frames)
            .ok_or(KernelError::OutOfFrames)?;

        self.set_bit(index);
        set(&mut self.pooled, index);
        Ok(Frame {
            index: FrameIndex(index),
            kernel,
            writable,
        })
    }

    /// Releases `index`. Freeing a free frame changes nothing and reports
    /// [`KernelError::FrameNotAllocated`], which callers treat as silent.
    pub fn free_frame(&mut self, index: FrameIndex) -> KernelResult<()> {
        self.check(index)?;
        if !self.is_bit_set(index.0) {
            return Err(KernelError::FrameNotAllocated(index));
        }
        self.clear_bit(index.0);
        clear(&mut self.pooled, index.0);
        Ok(())
    }

    /// Marks a frame owned without going through allocation, e.g. for
    /// the kernel image or firmware memory. Such frames are never returned
    /// to the pool by [`FrameAllocator::unmap_frame`].
    pub fn mark_frame_used(&mut self, index: FrameIndex) -> KernelResult<()> {
        self.check(index)?;
        self.set_bit(index.0);
        Ok(())
    }

    /// Records a new page mapping of `index` and marks the frame used. A
    /// frame that was free until now is claimed from the pool.
    pub fn map_frame(&mut self, index: FrameIndex) -> KernelResult<()> {
        self.check(index)?;
        if !self.is_bit_set(index.0) {
            self.set_bit(index.0);
            set(&mut self.pooled, index.0);
        }
        *self.mappings.entry(index.0).or_insert(0) += 1;
        Ok(())
    }

    /// Drops one page mapping of `index`. Returns `true` if that was the last
    /// mapping of a pool frame and the frame is free again.
    pub fn unmap_frame(&mut self, index: FrameIndex) -> KernelResult<bool> {
        self.check(index)?;
        if let Some(count) = self.mappings.get_mut(&index.0) {
            *count -= 1;
            if *count > 0 {
                return Ok(false);
            }
            self.mappings.remove(&index.0);
        }
        if !is_set(&self.pooled, index.0) {
            return Ok(false);
        }
        clear(&mut self.pooled, index.0);
        self.clear_bit(index.0);
        Ok(true)
    }

    /// Number of live page mappings of `index`.
    pub fn mapping_count(&self, index: FrameIndex) -> u32 {
        self.mappings.get(&index.0).copied().unwrap_or(0)
    }

    /// `true` for allocated or reserved frames, and for anything past the
    /// end of tracked memory.
    pub fn is_frame_used(&self, index: FrameIndex) -> bool {
        // Frames past the end of RAM can never be handed out.
        index.0 >= self.total_frames || self.is_bit_set(index.0)
    }

    /// Frames covered by the bitmap.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Frames currently marked used, reserved ones included.
    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    /// Frames [`FrameAllocator::allocate_frame`] can still hand out.
    pub fn free_frames(&self) -> usize {
        self.total_frames - self.used_frames
    }

    fn check(&self, index: FrameIndex) -> KernelResult<()> {
        if index.0 < self.total_frames {
            Ok(())
        } else {
            Err(KernelError::FrameOutOfRange(index))
        }
    }

    fn set_bit(&mut self, index: usize) {
        let mask = 1 << (index % BITMAP_ENTRY_BITS);
        let word = &mut self.bitmap[index / BITMAP_ENTRY_BITS];
        if *word & mask == 0 {
            *word |= mask;
            self.used_frames += 1;
        }
    }

    fn clear_bit(&mut self, index: usize) {
        let mask = 1 << (index % BITMAP_ENTRY_BITS);
        let word = &mut self.bitmap[index / BITMAP_ENTRY_BITS];
        if *word & mask != 0 {
            *word &= !mask;
            self.used_frames -= 1;
        }
    }

    fn is_bit_set(&self, index: usize) -> bool {
        is_set(&self.bitmap, index)
    }
}

fn set(words: &mut [u32], index: usize) {
    words[index / BITMAP_ENTRY_BITS] |= 1 << (index % BITMAP_ENTRY_BITS);
}

fn clear(words: &mut [u32], index: usize) {
    words[index / BITMAP_ENTRY_BITS] &= !(1 << (index % BITMAP_ENTRY_BITS));
}

fn is_set(words: &[u32], index: usize) -> bool {
    words[index / BITMAP_ENTRY_BITS] & (1 << (index % BITMAP_ENTRY_BITS)) != 0
}
