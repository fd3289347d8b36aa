//! Boot-time setup: reads what the bootloader left behind, builds the
//! kernel context and runs its init sequence.

use arrayvec::ArrayVec;
use log::{debug, info, warn};

use crate::{
    constants::memory::{DEFAULT_MEMORY_FRAMES, FRAME_SIZE},
    memory::{
        frame_allocator::{FrameAllocator, FrameIndex, MemoryRegion, MemoryRegionKind},
        PhysAddr,
    },
};

/// Value left in EAX by a multiboot v1 loader.
pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// `mem_lower`/`mem_upper` are valid.
const MULTIBOOT_INFO_MEMORY: u32 = 1 << 0;
/// `mmap_addr`/`mmap_length` are valid.
const MULTIBOOT_INFO_MEM_MAP: u32 = 1 << 6;

/// Entries beyond this are ignored.
pub const MAX_MEMORY_REGIONS: usize = 32;

/// Bytes in one memory map entry after its leading `size` field.
const MMAP_ENTRY_LEN: usize = 20;

pub type MemoryMap = ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>;

/// The fixed part of the multiboot v1 information structure.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MultibootInfo {
    pub flags: u32,
    /// KiB below 1 MiB.
    pub mem_lower: u32,
    /// KiB above 1 MiB.
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

impl MultibootInfo {
    pub fn has_memory_map(&self) -> bool {
        self.flags & MULTIBOOT_INFO_MEM_MAP != 0
    }

    pub fn has_memory_bounds(&self) -> bool {
        self.flags & MULTIBOOT_INFO_MEMORY != 0
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let low = read_u32(bytes, at)?;
    let high = read_u32(bytes, at + 4)?;
    Some(u64::from(high) << 32 | u64::from(low))
}

/// Decodes a raw multiboot memory map. Each entry starts with its own size,
/// which does not count the size field itself. A truncated trailing entry
/// ends the walk.
pub fn parse_memory_map(bytes: &[u8]) -> MemoryMap {
    let mut regions = MemoryMap::new();
    let mut offset = 0;

    while let Some(size) = read_u32(bytes, offset) {
        let size = size as usize;
        if size < MMAP_ENTRY_LEN {
            warn!("malformed memory map entry of {} bytes", size);
            break;
        }
        let entry = offset + 4;
        let (Some(base), Some(length), Some(kind)) = (
            read_u64(bytes, entry),
            read_u64(bytes, entry + 8),
            read_u32(bytes, entry + 16),
        ) else {
            break;
        };
        if regions
            .try_push(MemoryRegion {
                base,
                length,
                kind: MemoryRegionKind::from_multiboot(kind),
            })
            .is_err()
        {
            warn!("memory map has more than {} entries", MAX_MEMORY_REGIONS);
            break;
        }
        offset = entry + size;
    }
    regions
}

/// Physical memory as the bootloader describes it: the full map when there
/// is one, otherwise the lower/upper bounds, otherwise nothing.
pub fn memory_regions(info: &MultibootInfo, mmap: &[u8]) -> MemoryMap {
    if info.has_memory_map() {
        return parse_memory_map(mmap);
    }
    let mut regions = MemoryMap::new();
    if info.has_memory_bounds() {
        regions.push(MemoryRegion {
            base: 0,
            length: u64::from(info.mem_lower) * 1024,
            kind: MemoryRegionKind::Available,
        });
        regions.push(MemoryRegion {
            base: 0x10_0000,
            length: u64::from(info.mem_upper) * 1024,
            kind: MemoryRegionKind::Available,
        });
    }
    regions
}

/// Builds the frame bitmap from `regions`, falling back to
/// [`DEFAULT_MEMORY_FRAMES`] of flat memory when the map is empty.
pub fn frame_allocator_for(regions: &[MemoryRegion]) -> FrameAllocator {
    let usable = regions
        .iter()
        .any(|r| r.kind == MemoryRegionKind::Available && r.length >= u64::from(FRAME_SIZE));
    if !usable {
        warn!(
            "no usable memory map, assuming {} MiB",
            DEFAULT_MEMORY_FRAMES * FRAME_SIZE as usize / (1024 * 1024)
        );
        return FrameAllocator::new(DEFAULT_MEMORY_FRAMES);
    }

    for region in regions {
        info!(
            "memory {:#011x}..{:#011x} {:?}",
            region.base,
            region.base.saturating_add(region.length),
            region.kind
        );
    }
    FrameAllocator::from_regions(regions)
}

/// Marks every frame overlapping `start..end` used. Frames past the end of
/// tracked memory are skipped. Returns how many frames were marked.
pub fn reserve_range(frames: &mut FrameAllocator, start: PhysAddr, end: PhysAddr) -> usize {
    let first = start.as_u32() / FRAME_SIZE;
    let last = end.as_u32().div_ceil(FRAME_SIZE);
    let mut reserved = 0;
    for index in first..last {
        match frames.mark_frame_used(FrameIndex::new(index as usize)) {
            Ok(()) => reserved += 1,
            Err(err) => {
                debug!("reserve {}..{}: {}", start, end, err);
                break;
            }
        }
    }
    reserved
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod bare_metal {
    use alloc::boxed::Box;
    use core::ptr::addr_of;

    use log::{error, info, warn};

    use super::{
        frame_allocator_for, memory_regions, reserve_range, MemoryMap, MultibootInfo,
        MULTIBOOT_BOOTLOADER_MAGIC,
    };
    use crate::{
        hal::{x86::X86Hardware, Hardware},
        kernel::{Kernel, KernelConfig, KERNEL},
        logging,
        memory::{heap::init_heaps, PhysAddr},
    };

    extern "C" {
        static _kernel_start: u8;
        static _kernel_end: u8;
    }

    fn bootloader_regions(magic: u32, info_addr: u32) -> MemoryMap {
        if magic != MULTIBOOT_BOOTLOADER_MAGIC || info_addr == 0 {
            warn!("not started by a multiboot loader (magic {:#x})", magic);
            return MemoryMap::new();
        }
        // The loader's structures sit in identity-mapped low memory and are
        // read before anything is allocated over them.
        let info = unsafe { &*(info_addr as *const MultibootInfo) };
        let mmap: &[u8] = if info.has_memory_map() {
            unsafe {
                core::slice::from_raw_parts(info.mmap_addr as *const u8, info.mmap_length as usize)
            }
        } else {
            &[]
        };
        memory_regions(info, mmap)
    }

    /// Brings the kernel up and returns it with interrupts enabled.
    pub fn init(magic: u32, info_addr: u32) -> &'static Kernel<X86Hardware> {
        logging::init();
        info!("kestrel booting");

        let heap = match init_heaps() {
            Ok(heap) => heap,
            Err(err) => {
                error!("FATAL: {}", err);
                X86Hardware.disable_interrupts();
                X86Hardware.halt_forever()
            }
        };

        let regions = bootloader_regions(magic, info_addr);
        let mut frames = frame_allocator_for(&regions);

        // The image itself, arenas included, must never be handed out.
        let start = PhysAddr::new(unsafe { addr_of!(_kernel_start) } as u32);
        let end = PhysAddr::new(unsafe { addr_of!(_kernel_end) } as u32);
        let reserved = reserve_range(&mut frames, start, end);
        info!("kernel image {}..{}: {} frames reserved", start, end, reserved);

        let config = KernelConfig {
            memory_frames: frames.total_frames(),
            ..KernelConfig::default()
        };
        let kernel =
            KERNEL.call_once(|| Kernel::new(X86Hardware::new(), config, frames, Box::new(heap)));

        if let Err(err) = kernel.init() {
            kernel.fatal(err);
        }
        kernel.enable_interrupts();
        info!("interrupts enabled");
        kernel
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use bare_metal::init;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn entry(base: u64, length: u64, kind: u32) -> [u8; 24] {
        let mut raw = [0u8; 24];
        raw[0..4].copy_from_slice(&20u32.to_le_bytes());
        raw[4..12].copy_from_slice(&base.to_le_bytes());
        raw[12..20].copy_from_slice(&length.to_le_bytes());
        raw[20..24].copy_from_slice(&kind.to_le_bytes());
        raw
    }

    fn qemu_map() -> Vec<u8> {
        [
            entry(0, 0x9_FC00, 1),
            entry(0x9_FC00, 0x400, 2),
            entry(0xF_0000, 0x1_0000, 2),
            entry(0x10_0000, 0x7EE_0000, 1),
            entry(0xFFFC_0000, 0x4_0000, 2),
        ]
        .concat()
    }

    #[test]
    fn parses_a_typical_memory_map() {
        let regions = parse_memory_map(&qemu_map());
        assert_eq!(regions.len(), 5);
        assert_eq!(
            regions[3],
            MemoryRegion {
                base: 0x10_0000,
                length: 0x7EE_0000,
                kind: MemoryRegionKind::Available,
            }
        );
        assert_eq!(regions[4].kind, MemoryRegionKind::Reserved);
    }

    #[test]
    fn truncated_entries_end_the_map() {
        let mut raw = qemu_map();
        raw.truncate(24 + 10);
        assert_eq!(parse_memory_map(&raw).len(), 1);
        assert!(parse_memory_map(&[]).is_empty());
    }

    #[test]
    fn oversized_entries_are_skipped_by_their_size_field() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&24u32.to_le_bytes());
        raw.extend_from_slice(&entry(0x10_0000, 0x10_0000, 1)[4..]);
        raw.extend_from_slice(&[0xAA; 4]);
        raw.extend_from_slice(&entry(0x20_0000, 0x1000, 4));

        let regions = parse_memory_map(&raw);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].kind, MemoryRegionKind::Nvs);
    }

    #[test]
    fn memory_bounds_stand_in_for_a_missing_map() {
        let info = MultibootInfo {
            flags: MULTIBOOT_INFO_MEMORY,
            mem_lower: 639,
            mem_upper: 64 * 1024,
            ..MultibootInfo::default()
        };
        let regions = memory_regions(&info, &[]);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].base + regions[1].length, 65 * 1024 * 1024);

        let frames = frame_allocator_for(&regions);
        assert_eq!(frames.total_frames(), 65 * 256);
        assert_eq!(frames.used_frames(), 256);
    }

    #[test]
    fn map_flag_takes_precedence() {
        let info = MultibootInfo {
            flags: MULTIBOOT_INFO_MEMORY | MULTIBOOT_INFO_MEM_MAP,
            mem_upper: 1024,
            ..MultibootInfo::default()
        };
        assert_eq!(memory_regions(&info, &qemu_map()).len(), 5);
    }

    #[test]
    fn no_memory_information_falls_back_to_the_default() {
        let regions = memory_regions(&MultibootInfo::default(), &[]);
        assert!(regions.is_empty());
        assert_eq!(frame_allocator_for(&regions).total_frames(), DEFAULT_MEMORY_FRAMES);
    }

    #[test]
    fn reserving_a_range_covers_partial_frames() {
        let mut frames = FrameAllocator::new(1024);
        let reserved = reserve_range(
            &mut frames,
            PhysAddr::new(0x0010_0800),
            PhysAddr::new(0x0010_2001),
        );
        assert_eq!(reserved, 3);
        assert!(frames.is_frame_used(FrameIndex::new(256)));
        assert!(frames.is_frame_used(FrameIndex::new(258)));
        assert!(!frames.is_frame_used(FrameIndex::new(259)));
    }

    #[test]
    fn reserving_past_the_end_stops_quietly() {
        let mut frames = FrameAllocator::new(300);
        let reserved = reserve_range(
            &mut frames,
            PhysAddr::new(298 * 4096),
            PhysAddr::new(310 * 4096),
        );
        assert_eq!(reserved, 2);
        assert_eq!(frames.free_frames(), 300 - 256 - 2);
    }

    #[test]
    fn reserved_holes_stay_used() {
        let frames = frame_allocator_for(&parse_memory_map(&qemu_map()));
        let top = (0x10_0000 + 0x7EE_0000) / 4096;
        assert_eq!(frames.total_frames(), top);
        assert_eq!(frames.free_frames(), top - 256);
    }
}
