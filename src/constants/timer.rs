//! Programmable Interval Timer configuration.

/// PIT input clock in Hertz.
pub const PIT_BASE_FREQUENCY: u32 = 1_193_180;

pub const MIN_FREQUENCY: u32 = 18;
pub const MAX_FREQUENCY: u32 = 1000;

/// Tick rate programmed at boot.
pub const DEFAULT_FREQUENCY: u32 = 100;

/// Timer ticks between scheduler invocations.
pub const TIME_SLICE_TICKS: u64 = 10;
