//! The kernel heap.
//!
//! `kmalloc` and friends are served by a bump allocator over a fixed arena:
//! a cursor that only moves forward. Nothing is ever reclaimed, `free` only
//! validates its argument. Everything above this module talks to the
//! [`KernelAllocator`] trait, so a reclaiming allocator can replace the bump
//! allocator without touching callers.
//!
//! The same allocator, wrapped in a [`LockedAllocator`], backs Rust's global
//! allocator on bare metal.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use log::debug;

use crate::{
    constants::memory::REALLOC_COPY_LIMIT,
    error::{KernelError, KernelResult},
    hal::Hardware,
    memory::VirtAddr,
    sync::IrqMutex,
};

pub trait KernelAllocator {
    /// Returns `size` bytes whose start address is a multiple of `align`.
    fn allocate(&mut self, size: usize, align: usize) -> KernelResult<VirtAddr>;

    /// Gives a block back to the allocator.
    fn free(&mut self, addr: VirtAddr) -> KernelResult<()>;

    /// Whether `addr` lies inside the arena.
    fn owns(&self, addr: VirtAddr) -> bool;

    /// Copies `len` bytes between two heap blocks.
    fn copy(&mut self, from: VirtAddr, to: VirtAddr, len: usize) -> KernelResult<()>;

    /// Bytes handed out so far, including alignment padding.
    fn used(&self) -> usize;

    /// Arena size in bytes.
    fn size(&self) -> usize;

    /// `None` allocates, a zero size frees, anything else moves the block.
    ///
    /// The new block receives at most [`REALLOC_COPY_LIMIT`] bytes of the old
    /// one because the old block's size is not recorded. A foreign `old` is
    /// rejected before anything is allocated.
    fn reallocate(&mut self, old: Option<VirtAddr>, size: usize) -> KernelResult<Option<VirtAddr>> {
        let Some(old) = old else {
            return self.allocate(size, 1).map(Some);
        };
        if !self.owns(old) {
            return Err(KernelError::NotHeapAddress(old));
        }
        if size == 0 {
            self.free(old)?;
            return Ok(None);
        }
        let new = self.allocate(size, 1)?;
        self.copy(old, new, size.min(REALLOC_COPY_LIMIT))?;
        self.free(old)?;
        Ok(Some(new))
    }
}

pub struct BumpAllocator {
    arena: &'static mut [u8],
    base: VirtAddr,
    next: usize,
}

impl BumpAllocator {
    /// `base` is the address the kernel sees for `arena[0]`.
    pub fn new(arena: &'static mut [u8], base: VirtAddr) -> Self {
        BumpAllocator {
            arena,
            base,
            next: 0,
        }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn remaining(&self) -> usize {
        self.arena.len() - self.next
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.offset_of(addr).is_some()
    }

    fn offset_of(&self, addr: VirtAddr) -> Option<usize> {
        let offset = addr.as_usize().checked_sub(self.base.as_usize())?;
        (offset < self.arena.len()).then_some(offset)
    }

    /// Borrows `len` bytes at `addr`, if the whole range is inside the arena.
    pub fn bytes_mut(&mut self, addr: VirtAddr, len: usize) -> Option<&mut [u8]> {
        let start = self.offset_of(addr)?;
        self.arena.get_mut(start..start.checked_add(len)?)
    }

    fn as_mut_ptr(&mut self, addr: VirtAddr) -> Option<*mut u8> {
        let offset = self.offset_of(addr)?;
        Some(self.arena[offset..].as_mut_ptr())
    }
}

impl KernelAllocator for BumpAllocator {
    fn allocate(&mut self, size: usize, align: usize) -> KernelResult<VirtAddr> {
        let exhausted = KernelError::HeapExhausted {
            requested: size,
            remaining: self.remaining(),
        };
        let cursor = self.base.as_usize() + self.next;
        let start = cursor.checked_next_multiple_of(align.max(1)).ok_or(exhausted)?;
        let end = start.checked_add(size).ok_or(exhausted)?;
        if end > self.base.as_usize() + self.arena.len() {
            return Err(exhausted);
        }
        self.next = end - self.base.as_usize();
        Ok(VirtAddr::new(start as u32))
    }

    fn owns(&self, addr: VirtAddr) -> bool {
        self.contains(addr)
    }

    fn free(&mut self, addr: VirtAddr) -> KernelResult<()> {
        if !self.contains(addr) {
            return Err(KernelError::NotHeapAddress(addr));
        }
        debug!("kfree({}): bump heap does not reclaim", addr);
        Ok(())
    }

    fn copy(&mut self, from: VirtAddr, to: VirtAddr, len: usize) -> KernelResult<()> {
        let src = self.offset_of(from).ok_or(KernelError::NotHeapAddress(from))?;
        let dst = self.offset_of(to).ok_or(KernelError::NotHeapAddress(to))?;
        // Never read or write past the end of the arena.
        let len = len
            .min(self.arena.len() - src)
            .min(self.arena.len() - dst);
        self.arena.copy_within(src..src + len, dst);
        Ok(())
    }

    fn used(&self) -> usize {
        self.next
    }

    fn size(&self) -> usize {
        self.arena.len()
    }
}

/// A [`BumpAllocator`] usable as `#[global_allocator]`.
///
/// Installed once at boot with [`LockedAllocator::init`]; allocations before
/// that fail with a null pointer.
pub struct LockedAllocator<H: Hardware> {
    hw: H,
    inner: IrqMutex<Option<BumpAllocator>>,
}

impl<H: Hardware> LockedAllocator<H> {
    pub const fn new(hw: H) -> Self {
        LockedAllocator {
            hw,
            inner: IrqMutex::new(None),
        }
    }

    pub fn init(&self, allocator: BumpAllocator) {
        *self.inner.lock(&self.hw) = Some(allocator);
    }
}

unsafe impl<H: Hardware> GlobalAlloc for LockedAllocator<H> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut guard = self.inner.lock(&self.hw);
        let Some(heap) = guard.as_mut() else {
            return ptr::null_mut();
        };
        heap.allocate(layout.size(), layout.align())
            .ok()
            .and_then(|addr| heap.as_mut_ptr(addr))
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {}
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod arenas {
    use core::{
        ptr::addr_of_mut,
        sync::atomic::{AtomicBool, Ordering},
    };

    use super::{BumpAllocator, LockedAllocator};
    use crate::{
        constants::memory::{GLOBAL_HEAP_SIZE, HEAP_SIZE},
        error::{KernelError, KernelResult},
        hal::x86::X86Hardware,
        memory::VirtAddr,
    };

    static mut GLOBAL_ARENA: [u8; GLOBAL_HEAP_SIZE] = [0; GLOBAL_HEAP_SIZE];
    static mut KMALLOC_ARENA: [u8; HEAP_SIZE] = [0; HEAP_SIZE];
    static HANDED_OUT: AtomicBool = AtomicBool::new(false);

    #[global_allocator]
    pub static ALLOCATOR: LockedAllocator<X86Hardware> = LockedAllocator::new(X86Hardware::new());

    fn bump(arena: &'static mut [u8]) -> BumpAllocator {
        let base = VirtAddr::new(arena.as_ptr() as u32);
        BumpAllocator::new(arena, base)
    }

    /// Installs the global allocator and returns the kmalloc allocator.
    /// Only the first call gets them.
    pub fn init_heaps() -> KernelResult<BumpAllocator> {
        if HANDED_OUT.swap(true, Ordering::SeqCst) {
            return Err(KernelError::HeapsTaken);
        }
        // HANDED_OUT guarantees these are the only references ever made.
        let global = unsafe { &mut *addr_of_mut!(GLOBAL_ARENA) };
        let kmalloc = unsafe { &mut *addr_of_mut!(KMALLOC_ARENA) };
        ALLOCATOR.init(bump(global));
        Ok(bump(kmalloc))
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use arenas::{init_heaps, ALLOCATOR};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimulatedHardware;
    use alloc::{boxed::Box, vec};

    const BASE: u32 = 0x0020_0000;

    fn heap(size: usize) -> BumpAllocator {
        BumpAllocator::new(Box::leak(vec![0u8; size].into_boxed_slice()), VirtAddr::new(BASE))
    }

    #[test]
    fn allocations_are_monotonic() {
        let mut heap = heap(0x4000);
        let a = heap.allocate(10, 1).unwrap();
        let b = heap.allocate(10, 1).unwrap();
        assert_eq!(a, VirtAddr::new(BASE));
        assert_eq!(b, VirtAddr::new(BASE + 10));
        assert_eq!(heap.used(), 20);
    }

    #[test]
    fn aligned_allocation_skips_to_page_boundary() {
        let mut heap = heap(0x4000);
        heap.allocate(1, 1).unwrap();
        let page = heap.allocate(16, 4096).unwrap();
        assert_eq!(page, VirtAddr::new(BASE + 0x1000));
        assert_eq!(heap.used(), 0x1010);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut heap = heap(64);
        heap.allocate(60, 1).unwrap();
        assert_eq!(
            heap.allocate(8, 1),
            Err(KernelError::HeapExhausted {
                requested: 8,
                remaining: 4
            })
        );
        assert_eq!(heap.used(), 60);
    }

    #[test]
    fn free_does_not_reclaim() {
        let mut heap = heap(64);
        let a = heap.allocate(16, 1).unwrap();
        heap.free(a).unwrap();
        assert_eq!(heap.allocate(16, 1).unwrap(), VirtAddr::new(BASE + 16));
        assert_eq!(
            heap.free(VirtAddr::new(0x10)),
            Err(KernelError::NotHeapAddress(VirtAddr::new(0x10)))
        );
    }

    #[test]
    fn reallocate_copies_up_to_the_cap() {
        let mut heap = heap(0x1000);
        let old = heap.allocate(512, 1).unwrap();
        heap.bytes_mut(old, 512).unwrap().fill(0xAB);

        let new = heap.reallocate(Some(old), 600).unwrap().unwrap();
        assert_ne!(new, old);
        let bytes = heap.bytes_mut(new, 600).unwrap();
        assert!(bytes[..REALLOC_COPY_LIMIT].iter().all(|b| *b == 0xAB));
        assert!(bytes[REALLOC_COPY_LIMIT..].iter().all(|b| *b == 0));
    }

    #[test]
    fn reallocate_edge_cases() {
        let mut heap = heap(0x1000);
        let fresh = heap.reallocate(None, 32).unwrap();
        assert_eq!(fresh, Some(VirtAddr::new(BASE)));
        assert_eq!(heap.reallocate(fresh, 0), Ok(None));
        assert_eq!(heap.used(), 32);
    }

    #[test]
    fn reallocating_a_foreign_pointer_allocates_nothing() {
        let mut heap = heap(0x1000);
        heap.allocate(8, 1).unwrap();
        let foreign = VirtAddr::new(0x10);
        assert_eq!(
            heap.reallocate(Some(foreign), 64),
            Err(KernelError::NotHeapAddress(foreign))
        );
        assert_eq!(heap.used(), 8);
        assert_eq!(
            heap.reallocate(Some(foreign), 0),
            Err(KernelError::NotHeapAddress(foreign))
        );
    }

    #[test]
    fn global_allocator_hands_out_arena_memory() {
        let locked = LockedAllocator::new(SimulatedHardware::new());
        let layout = Layout::from_size_align(64, 8).unwrap();
        assert!(unsafe { locked.alloc(layout) }.is_null());

        let arena = Box::leak(vec![0u8; 256].into_boxed_slice());
        let start = arena.as_ptr() as usize;
        locked.init(BumpAllocator::new(arena, VirtAddr::new(0x1000)));
        let ptr = unsafe { locked.alloc(layout) };
        assert!(!ptr.is_null());
        assert!((ptr as usize) >= start && (ptr as usize) < start + 256);
    }
}
