pub mod frame_allocator;
pub mod heap;
pub mod page_fault;
pub mod paging;

use core::fmt;

use log::{debug, info, warn};
use x86_64::structures::paging::PageTableFlags;

use crate::{
    constants::memory::{
        ENTRIES_PER_TABLE, ENTRY_FLAGS_MASK, FRAME_SIZE, IDENTITY_MAPPED_PAGES, PAGE_SIZE,
    },
    error::{KernelError, KernelResult, Severity},
    hal::Hardware,
    kernel::Kernel,
};

use frame_allocator::{Frame, FrameIndex};

/// A 32-bit linear address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

/// A 32-bit physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u32);

macro_rules! address_common {
    ($name:ident) => {
        impl $name {
            pub const fn new(addr: u32) -> Self {
                $name(addr)
            }

            pub const fn zero() -> Self {
                $name(0)
            }

            pub const fn as_u32(self) -> u32 {
                self.0
            }

            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }

            pub const fn is_aligned(self, align: u32) -> bool {
                self.0 % align == 0
            }

            pub const fn align_down(self, align: u32) -> Self {
                $name(self.0 & !(align - 1))
            }

            /// Offset into the containing 4 KiB page.
            pub const fn page_offset(self) -> u32 {
                self.0 & ENTRY_FLAGS_MASK
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#010x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }
    };
}

address_common!(VirtAddr);
address_common!(PhysAddr);

impl VirtAddr {
    /// Index into the page directory (bits 22-31).
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Index into the page table (bits 12-21).
    pub const fn table_index(self) -> usize {
        (self.0 >> 12) as usize % ENTRIES_PER_TABLE
    }

    pub const fn from_page(page: u32) -> Self {
        VirtAddr(page * PAGE_SIZE)
    }
}

/// Snapshot of physical and heap memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub heap_used: usize,
    pub heap_size: usize,
}

impl<H: Hardware> Kernel<H> {
    /// Identity maps the first 4 MiB read-only for the kernel, marks those
    /// frames used and turns paging on.
    ///
    /// Supervisor writes ignore the read-only bit while CR0.WP is clear.
    pub fn memory_init(&self) {
        for page in 0..IDENTITY_MAPPED_PAGES {
            let addr = page * PAGE_SIZE;
            self.map_page(
                PhysAddr::new(addr),
                VirtAddr::new(addr),
                PageTableFlags::PRESENT,
            );
        }
        self.switch_page_directory();

        let frames = self.frames.lock(&self.hw);
        info!(
            "paging enabled: {} KiB identity mapped, {} of {} frames free",
            IDENTITY_MAPPED_PAGES * PAGE_SIZE / 1024,
            frames.free_frames(),
            frames.total_frames()
        );
    }

    pub fn try_allocate_frame(&self, kernel: bool, writable: bool) -> KernelResult<Frame> {
        let frame = self.frames.lock(&self.hw).allocate_frame(kernel, writable)?;
        debug!("allocated frame {}", frame.index);
        Ok(frame)
    }

    /// Lowest free frame. Running out of physical memory halts the kernel.
    pub fn allocate_frame(&self, kernel: bool, writable: bool) -> Frame {
        self.try_allocate_frame(kernel, writable)
            .unwrap_or_else(|err| self.fatal(err))
    }

    /// Releases a frame. Freeing a frame that is already free does nothing.
    pub fn free_frame(&self, index: FrameIndex) {
        if let Err(err) = self.frames.lock(&self.hw).free_frame(index) {
            report(err);
        }
    }

    /// Maps `virt` to `physical` in the kernel directory and marks the frame
    /// used. A previous mapping of `virt` is replaced and its frame released
    /// if nothing else maps it.
    pub fn map_page(&self, physical: PhysAddr, virt: VirtAddr, flags: PageTableFlags) {
        let previous = self
            .paging
            .lock(&self.hw)
            .map_page(&self.hw, physical, virt, flags);

        let mut frames = self.frames.lock(&self.hw);
        // Addresses beyond RAM (device memory) have no frame to track.
        if let Err(err) = frames.map_frame(FrameIndex::containing(physical)) {
            debug!("map_page({}): {}", virt, err);
        }
        if let Some(old) = previous {
            match frames.unmap_frame(FrameIndex::containing(old)) {
                Ok(true) => debug!("map_page({}): released frame at {}", virt, old),
                Ok(false) => {}
                Err(err) => debug!("map_page({}): {}", virt, err),
            }
        }
    }

    /// Allocates a frame and maps it at `virt`.
    pub fn map_new_page(&self, virt: VirtAddr, kernel: bool, writable: bool) -> Frame {
        let frame = self.allocate_frame(kernel, writable);
        self.map_page(frame.start_address(), virt, frame.flags());
        frame
    }

    /// Unmaps `virt` and returns the frame behind it to the pool once no
    /// other page maps it. Reserved frames and the kernel image stay used.
    pub fn unmap_page(&self, virt: VirtAddr) -> KernelResult<PhysAddr> {
        let physical = self.paging.lock(&self.hw).unmap_page(&self.hw, virt)?;
        match self
            .frames
            .lock(&self.hw)
            .unmap_frame(FrameIndex::containing(physical))
        {
            Ok(true) => debug!("unmap_page({}): released frame at {}", virt, physical),
            Ok(false) => {}
            Err(err) => debug!("unmap_page({}): {}", virt, err),
        }
        Ok(physical)
    }

    pub fn get_physical_address(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.paging.lock(&self.hw).get_physical_address(virt)
    }

    pub fn switch_page_directory(&self) {
        self.paging.lock(&self.hw).switch_page_directory(&self.hw);
    }

    pub fn try_kmalloc(&self, size: usize, align: usize) -> KernelResult<VirtAddr> {
        self.heap.lock(&self.hw).allocate(size, align)
    }

    /// Exhausting the heap halts the kernel.
    pub fn kmalloc(&self, size: usize) -> VirtAddr {
        self.try_kmalloc(size, 1).unwrap_or_else(|err| self.fatal(err))
    }

    /// Like [`Kernel::kmalloc`], starting on a page boundary.
    pub fn kmalloc_aligned(&self, size: usize) -> VirtAddr {
        self.try_kmalloc(size, PAGE_SIZE as usize)
            .unwrap_or_else(|err| self.fatal(err))
    }

    /// Allocation plus the physical address behind it, if mapped.
    pub fn kmalloc_physical(&self, size: usize) -> (VirtAddr, Option<PhysAddr>) {
        let virt = self.kmalloc(size);
        (virt, self.get_physical_address(virt))
    }

    pub fn kmalloc_aligned_physical(&self, size: usize) -> (VirtAddr, Option<PhysAddr>) {
        let virt = self.kmalloc_aligned(size);
        (virt, self.get_physical_address(virt))
    }

    /// Does not reclaim memory; the heap only grows.
    pub fn kfree(&self, addr: VirtAddr) {
        if let Err(err) = self.heap.lock(&self.hw).free(addr) {
            report(err);
        }
    }

    /// Moves a block to a new allocation of `size` bytes, copying at most
    /// 256 bytes. `None` allocates; a zero size frees and returns `None`.
    pub fn krealloc(&self, addr: Option<VirtAddr>, size: usize) -> Option<VirtAddr> {
        let result = self.heap.lock(&self.hw).reallocate(addr, size);
        match result {
            Ok(new) => new,
            Err(err) if err.is_fatal() => self.fatal(err),
            Err(err) => {
                report(err);
                None
            }
        }
    }

    pub fn memory_info(&self) -> MemoryInfo {
        let (total, used) = {
            let frames = self.frames.lock(&self.hw);
            (frames.total_frames() as u64, frames.used_frames() as u64)
        };
        let heap = self.heap.lock(&self.hw);
        MemoryInfo {
            total_bytes: total * u64::from(FRAME_SIZE),
            used_bytes: used * u64::from(FRAME_SIZE),
            free_bytes: (total - used) * u64::from(FRAME_SIZE),
            heap_used: heap.used(),
            heap_size: heap.size(),
        }
    }
}

/// Logs a non-fatal error according to its severity.
fn report(err: KernelError) {
    match err.severity() {
        Severity::Silent => {}
        Severity::Recoverable | Severity::Fatal => warn!("memory: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{tests::test_kernel, KernelConfig};

    #[test]
    fn virtual_address_splits_into_indices() {
        let addr = VirtAddr::new(0x0040_3123);
        assert_eq!(addr.directory_index(), 1);
        assert_eq!(addr.table_index(), 3);
        assert_eq!(addr.page_offset(), 0x123);
        assert_eq!(addr.align_down(PAGE_SIZE), VirtAddr::new(0x0040_3000));
    }

    #[test]
    fn identity_map_covers_first_four_megabytes() {
        let kernel = test_kernel();
        kernel.memory_init();
        assert_eq!(
            kernel.get_physical_address(VirtAddr::new(0x003F_F123)),
            Some(PhysAddr::new(0x003F_F123))
        );
        assert_eq!(kernel.get_physical_address(VirtAddr::new(0x0040_0000)), None);
        let flags = kernel.paging.lock(kernel.hw()).flags(VirtAddr::new(0x1000));
        assert_eq!(flags, Some(PageTableFlags::PRESENT));
        assert!(kernel.hw().paging_enabled());
    }

    #[test]
    fn mapped_frames_are_marked_used() {
        let kernel = test_kernel();
        let physical = PhysAddr::new(0x0080_0000);
        kernel.map_page(physical, VirtAddr::new(0xC000_0000), PageTableFlags::WRITABLE);
        assert!(kernel
            .frames
            .lock(kernel.hw())
            .is_frame_used(FrameIndex::containing(physical)));

        assert_eq!(kernel.unmap_page(VirtAddr::new(0xC000_0000)), Ok(physical));
        assert!(!kernel
            .frames
            .lock(kernel.hw())
            .is_frame_used(FrameIndex::containing(physical)));
    }

    #[test]
    fn unmapping_reserved_memory_keeps_it_reserved() {
        let kernel = test_kernel();
        kernel.memory_init();
        assert_eq!(
            kernel.unmap_page(VirtAddr::new(0x1000)),
            Ok(PhysAddr::new(0x1000))
        );
        assert!(kernel.frames.lock(kernel.hw()).is_frame_used(FrameIndex::new(1)));
        let next = kernel.allocate_frame(true, true);
        assert_ne!(next.index, FrameIndex::new(1));
        assert_eq!(next.index, FrameIndex::new(1024));
    }

    #[test]
    fn shared_frames_outlive_one_unmap() {
        let kernel = test_kernel();
        let first = VirtAddr::new(0x4000_0000);
        let second = VirtAddr::new(0x5000_0000);
        let frame = kernel.map_new_page(first, true, true);
        kernel.map_page(frame.start_address(), second, frame.flags());

        assert_eq!(kernel.unmap_page(first), Ok(frame.start_address()));
        assert!(kernel.frames.lock(kernel.hw()).is_frame_used(frame.index));
        assert_ne!(kernel.allocate_frame(true, true).index, frame.index);
        assert_eq!(kernel.get_physical_address(second), Some(frame.start_address()));

        assert_eq!(kernel.unmap_page(second), Ok(frame.start_address()));
        assert!(!kernel.frames.lock(kernel.hw()).is_frame_used(frame.index));
    }

    #[test]
    fn remapping_releases_the_replaced_frame() {
        let kernel = test_kernel();
        let virt = VirtAddr::new(0x4000_0000);
        let old = kernel.map_new_page(virt, true, true);
        let new = kernel.map_new_page(virt, true, true);
        assert_ne!(old.index, new.index);
        assert_eq!(kernel.get_physical_address(virt), Some(new.start_address()));
        assert!(!kernel.frames.lock(kernel.hw()).is_frame_used(old.index));
        assert_eq!(kernel.allocate_frame(true, true).index, old.index);

        // Same frame, same page: nothing is released.
        kernel.map_page(new.start_address(), virt, new.flags());
        assert!(kernel.frames.lock(kernel.hw()).is_frame_used(new.index));
    }

    #[test]
    fn map_new_page_allocates_the_lowest_frame() {
        let kernel = test_kernel();
        let frame = kernel.map_new_page(VirtAddr::new(0xD000_0000), true, true);
        assert_eq!(frame.index, FrameIndex::new(256));
        assert_eq!(
            kernel.get_physical_address(VirtAddr::new(0xD000_0010)),
            Some(PhysAddr::new(0x0010_0010))
        );
    }

    #[test]
    fn double_free_of_a_frame_is_silent() {
        let kernel = test_kernel();
        let frame = kernel.allocate_frame(true, true);
        kernel.free_frame(frame.index);
        kernel.free_frame(frame.index);
        assert_eq!(kernel.allocate_frame(true, true).index, frame.index);
    }

    #[test]
    #[should_panic(expected = "halted")]
    fn running_out_of_frames_is_fatal() {
        let kernel = Kernel::simulated(KernelConfig {
            memory_frames: 257,
            ..KernelConfig::default()
        });
        kernel.allocate_frame(true, true);
        kernel.allocate_frame(true, true);
    }

    #[test]
    fn kmalloc_physical_translates_through_paging() {
        let kernel = test_kernel();
        kernel.memory_init();
        let (virt, physical) = kernel.kmalloc_aligned_physical(64);
        assert!(virt.is_aligned(PAGE_SIZE));
        assert_eq!(physical, Some(PhysAddr::new(virt.as_u32())));
    }

    #[test]
    fn krealloc_follows_the_bump_rules() {
        let kernel = test_kernel();
        let a = kernel.krealloc(None, 16);
        assert!(a.is_some());
        let b = kernel.krealloc(a, 32);
        assert_ne!(a, b);
        assert_eq!(kernel.krealloc(b, 0), None);
        assert_eq!(kernel.memory_info().heap_used, 48);
    }

    #[test]
    fn krealloc_of_a_foreign_pointer_leaks_nothing() {
        let kernel = test_kernel();
        kernel.kmalloc(16);
        assert_eq!(kernel.krealloc(Some(VirtAddr::new(0xB8000)), 128), None);
        assert_eq!(kernel.memory_info().heap_used, 16);
    }

    #[test]
    #[should_panic(expected = "halted")]
    fn heap_exhaustion_is_fatal() {
        let kernel = test_kernel();
        kernel.kmalloc(kernel.config().heap_size + 1);
    }

    #[test]
    fn memory_info_counts_frames() {
        let kernel = test_kernel();
        let info = kernel.memory_info();
        assert_eq!(info.total_bytes, 4096 * 4096);
        assert_eq!(info.used_bytes, 256 * 4096);
        assert_eq!(info.free_bytes, info.total_bytes - info.used_bytes);
        assert_eq!(info.heap_size, 64 * 1024);
    }

    #[test]
    fn addresses_print_as_hex() {
        assert_eq!(alloc::format!("{}", PhysAddr::new(0x1000)), "0x00001000");
        assert_eq!(
            alloc::format!("{:?}", VirtAddr::new(0xB8000)),
            "VirtAddr(0x000b8000)"
        );
    }
}
