//! Two-level 32-bit paging.
//!
//! The directory keeps two views of every page table: the hardware entry
//! (physical address plus flags) that the MMU walks, and an owned
//! `Box<PageTable>` slot that the kernel edits. Tables are created on demand
//! and live as long as the directory.

use alloc::{boxed::Box, vec::Vec};
use core::fmt;

use log::debug;
use x86_64::structures::paging::PageTableFlags;

use crate::{
    constants::memory::{
        ENTRIES_PER_DIRECTORY, ENTRIES_PER_TABLE, ENTRY_FLAGS_MASK, ENTRY_FRAME_MASK, PAGE_SIZE,
    },
    error::{KernelError, KernelResult},
    hal::Hardware,
    memory::{PhysAddr, VirtAddr},
};

/// One 32-bit directory or table entry: frame address in the high 20 bits,
/// flags in the low 12.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        PageTableEntry(0)
    }

    pub fn new(frame: PhysAddr, flags: PageTableFlags) -> Self {
        PageTableEntry((frame.as_u32() & ENTRY_FRAME_MASK) | (flags.bits() as u32 & ENTRY_FLAGS_MASK))
    }

    pub fn frame(&self) -> PhysAddr {
        PhysAddr::new(self.0 & ENTRY_FRAME_MASK)
    }

    pub fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(u64::from(self.0 & ENTRY_FLAGS_MASK))
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("frame", &self.frame())
            .field("flags", &self.flags())
            .finish()
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub const fn new() -> Self {
        PageTable {
            entries: [PageTableEntry::empty(); ENTRIES_PER_TABLE],
        }
    }

    pub fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PageDirectory {
    entries: Box<PageTable>,
    tables: Vec<Option<Box<PageTable>>>,
    physical: PhysAddr,
}

impl PageDirectory {
    pub fn new<H: Hardware + ?Sized>(hw: &H) -> Self {
        let entries = Box::new(PageTable::new());
        let physical = hw.physical_address_of(entries.as_ref() as *const PageTable as *const u8);
        let mut tables = Vec::with_capacity(ENTRIES_PER_DIRECTORY);
        tables.resize_with(ENTRIES_PER_DIRECTORY, || None);
        PageDirectory {
            entries,
            tables,
            physical,
        }
    }

    /// Physical address loaded into CR3.
    pub fn physical_address(&self) -> PhysAddr {
        self.physical
    }

    pub fn directory_entry(&self, index: usize) -> PageTableEntry {
        self.entries.entry(index)
    }

    pub fn table(&self, index: usize) -> Option<&PageTable> {
        self.tables[index].as_deref()
    }

    fn table_or_create<H: Hardware + ?Sized>(&mut self, hw: &H, index: usize) -> &mut PageTable {
        let entries = &mut self.entries;
        self.tables[index].get_or_insert_with(|| {
            let table = Box::new(PageTable::new());
            let physical = hw.physical_address_of(table.as_ref() as *const PageTable as *const u8);
            entries.set(
                index,
                PageTableEntry::new(
                    physical,
                    PageTableFlags::PRESENT
                        | PageTableFlags::WRITABLE
                        | PageTableFlags::USER_ACCESSIBLE,
                ),
            );
            debug!("paging: created page table {} at {}", index, physical);
            table
        })
    }

    /// Leaf entry for `virt`, if both levels are present.
    pub fn entry(&self, virt: VirtAddr) -> Option<PageTableEntry> {
        if !self.entries.entry(virt.directory_index()).is_present() {
            return None;
        }
        let entry = self.table(virt.directory_index())?.entry(virt.table_index());
        entry.is_present().then_some(entry)
    }
}

/// Paging state: the kernel page directory and whether it is active.
///
/// The kernel keeps a single address space, so the kernel directory is also
/// the current one once [`Paging::switch_page_directory`] has run.
pub struct Paging {
    kernel_directory: PageDirectory,
    enabled: bool,
}

impl Paging {
    pub fn new<H: Hardware + ?Sized>(hw: &H) -> Self {
        Paging {
            kernel_directory: PageDirectory::new(hw),
            enabled: false,
        }
    }

    pub fn kernel_directory(&self) -> &PageDirectory {
        &self.kernel_directory
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Maps `virt` to `physical`, replacing any previous mapping of `virt`.
    /// `PRESENT` is always added to `flags`. Returns the frame the replaced
    /// mapping pointed at.
    pub fn map_page<H: Hardware + ?Sized>(
        &mut self,
        hw: &H,
        physical: PhysAddr,
        virt: VirtAddr,
        flags: PageTableFlags,
    ) -> Option<PhysAddr> {
        let previous = self.kernel_directory.entry(virt).map(|entry| entry.frame());
        let table = self.kernel_directory.table_or_create(hw, virt.directory_index());
        table.set(
            virt.table_index(),
            PageTableEntry::new(physical, flags | PageTableFlags::PRESENT),
        );
        hw.invalidate_page(virt.align_down(PAGE_SIZE));
        previous
    }

    /// Removes the mapping of `virt` and returns the frame it pointed at.
    pub fn unmap_page<H: Hardware + ?Sized>(
        &mut self,
        hw: &H,
        virt: VirtAddr,
    ) -> KernelResult<PhysAddr> {
        let entry = self
            .kernel_directory
            .entry(virt)
            .ok_or(KernelError::Unmapped(virt))?;
        if let Some(table) = self.kernel_directory.tables[virt.directory_index()].as_mut() {
            table.set(virt.table_index(), PageTableEntry::empty());
        }
        hw.invalidate_page(virt.align_down(PAGE_SIZE));
        Ok(entry.frame())
    }

    /// Walks directory and table. `None` if either level is not present.
    pub fn get_physical_address(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.kernel_directory
            .entry(virt)
            .map(|entry| PhysAddr::new(entry.frame().as_u32() | virt.page_offset()))
    }

    pub fn flags(&self, virt: VirtAddr) -> Option<PageTableFlags> {
        self.kernel_directory.entry(virt).map(|entry| entry.flags())
    }

    /// Loads the kernel directory into CR3 and turns paging on.
    pub fn switch_page_directory<H: Hardware + ?Sized>(&mut self, hw: &H) {
        hw.load_page_directory(self.kernel_directory.physical_address());
        self.enabled = true;
    }
}
