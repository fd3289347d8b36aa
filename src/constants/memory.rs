//! Physical memory, paging and heap layout.

pub const PAGE_SIZE: u32 = 4096;
pub const FRAME_SIZE: u32 = 4096;

/// Frames addressable by the bitmap (4 GiB / 4 KiB).
pub const MAX_FRAMES: usize = 1_048_576;

/// Frames below 1 MiB belong to firmware and the bootloader.
pub const RESERVED_LOW_FRAMES: usize = 256;

/// Memory assumed when the bootloader gives no map (128 MiB).
pub const DEFAULT_MEMORY_FRAMES: usize = 128 * 1024 * 1024 / FRAME_SIZE as usize;

pub const BITMAP_ENTRY_BITS: usize = 32;
pub const FULL_BITMAP_ENTRY: u32 = 0xFFFF_FFFF;

pub const ENTRIES_PER_TABLE: usize = 1024;
pub const ENTRIES_PER_DIRECTORY: usize = 1024;

/// Low 12 bits of an entry hold flags, the rest the frame address.
pub const ENTRY_FLAGS_MASK: u32 = 0xFFF;
pub const ENTRY_FRAME_MASK: u32 = 0xFFFF_F000;

/// Pages identity mapped at boot (first 4 MiB).
pub const IDENTITY_MAPPED_PAGES: u32 = 1024;

/// Size of the kmalloc arena.
pub const HEAP_SIZE: usize = 1024 * 1024; // 1 MB

/// Size of the arena backing Rust's global allocator on bare metal.
pub const GLOBAL_HEAP_SIZE: usize = 1024 * 1024;

/// `krealloc` copies at most this many bytes from the old block.
pub const REALLOC_COPY_LIMIT: usize = 256;
