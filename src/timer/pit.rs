//! 8253/8254 programmable interval timer, channel 0.

use crate::{
    constants::{
        ports::{PIT_CHANNEL0, PIT_COMMAND},
        timer::{MAX_FREQUENCY, MIN_FREQUENCY, PIT_BASE_FREQUENCY},
    },
    hal::Hardware,
};

/// Channel 0, lobyte/hibyte access, mode 3 (square wave), binary.
const PIT_MODE_SQUARE_WAVE: u8 = 0x36;

pub fn clamp_frequency(frequency: u32) -> u32 {
    frequency.clamp(MIN_FREQUENCY, MAX_FREQUENCY)
}

/// Reload value for `frequency`. The counter is 16 bits wide, so the
/// slowest rate is about 18.2 Hz.
pub fn divisor(frequency: u32) -> u16 {
    let divisor = PIT_BASE_FREQUENCY / clamp_frequency(frequency);
    u16::try_from(divisor).unwrap_or(u16::MAX)
}

/// Starts channel 0 counting down from `divisor`.
pub fn program<H: Hardware + ?Sized>(hw: &H, divisor: u16) {
    let [low, high] = divisor.to_le_bytes();
    hw.write_port8(PIT_COMMAND, PIT_MODE_SQUARE_WAVE);
    hw.write_port8(PIT_CHANNEL0, low);
    hw.io_wait();
    hw.write_port8(PIT_CHANNEL0, high);
}
