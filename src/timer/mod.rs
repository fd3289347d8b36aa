//! System tick source.
//!
//! The PIT fires IRQ0 `frequency` times a second. Each tick bumps the tick
//! counter and uptime, runs the registered callback, and every time slice
//! gives the scheduler a turn.

pub mod pit;

use log::{info, warn};

use crate::{
    constants::idt::TIMER_VECTOR,
    hal::Hardware,
    interrupts::{frame::InterruptFrame, pic::Irq},
    kernel::Kernel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerInfo {
    pub ticks: u64,
    pub frequency: u32,
    pub ms_per_tick: u32,
    pub uptime_ms: u64,
}

/// Runs in interrupt context on every tick. Must not block.
pub type TimerCallback = fn(&TimerInfo);

pub struct Timer {
    ticks: u64,
    frequency: u32,
    ms_per_tick: u32,
    uptime_ms: u64,
    time_slice: u64,
    callback: Option<TimerCallback>,
}

impl Timer {
    pub const fn new(time_slice: u64) -> Self {
        Timer {
            ticks: 0,
            frequency: 0,
            ms_per_tick: 0,
            uptime_ms: 0,
            time_slice,
            callback: None,
        }
    }

    /// Sets the tick rate; returns the clamped frequency actually used.
    pub fn configure(&mut self, frequency: u32) -> u32 {
        let frequency = pit::clamp_frequency(frequency);
        self.frequency = frequency;
        self.ms_per_tick = 1000 / frequency;
        frequency
    }

    pub fn tick(&mut self) -> TimerInfo {
        self.ticks += 1;
        self.uptime_ms += u64::from(self.ms_per_tick);
        self.info()
    }

    pub fn info(&self) -> TimerInfo {
        TimerInfo {
            ticks: self.ticks,
            frequency: self.frequency,
            ms_per_tick: self.ms_per_tick,
            uptime_ms: self.uptime_ms,
        }
    }

    /// Whether the tick numbered `ticks` ends a time slice.
    pub fn slice_elapsed(&self, ticks: u64) -> bool {
        self.time_slice != 0 && ticks % self.time_slice == 0
    }

    /// Ticks needed to cover `ms`, rounded up.
    pub fn ticks_for(&self, ms: u32) -> Option<u64> {
        (self.ms_per_tick != 0).then(|| u64::from(ms.div_ceil(self.ms_per_tick)))
    }
}

impl<H: Hardware> Kernel<H> {
    /// Programs the PIT for `frequency` Hz (clamped to 18-1000), installs
    /// the tick handler on vector 32 and unmasks IRQ0.
    pub fn pit_init(&self, frequency: u32) {
        let frequency = self.timer.lock(&self.hw).configure(frequency);
        pit::program(&self.hw, pit::divisor(frequency));
        self.register_interrupt_handler(TIMER_VECTOR, timer_handler::<H>);
        self.enable_irq(Irq::TIMER);
        info!("PIT running at {} Hz", frequency);
    }

    /// Replaces the per-tick callback.
    pub fn register_timer_callback(&self, callback: TimerCallback) {
        self.timer.lock(&self.hw).callback = Some(callback);
    }

    pub fn get_tick_count(&self) -> u64 {
        self.timer.lock(&self.hw).ticks
    }

    pub fn get_uptime_ms(&self) -> u64 {
        self.timer.lock(&self.hw).uptime_ms
    }

    pub fn get_timer_info(&self) -> TimerInfo {
        self.timer.lock(&self.hw).info()
    }

    /// Halts until at least `ms` milliseconds of ticks have passed.
    /// Interrupts must be enabled.
    pub fn sleep_ms(&self, ms: u32) {
        let (start, wait) = {
            let timer = self.timer.lock(&self.hw);
            (timer.ticks, timer.ticks_for(ms))
        };
        let Some(wait) = wait else {
            warn!("sleep_ms({}) before the timer was initialized", ms);
            return;
        };

        let target = start + wait;
        while self.get_tick_count() < target {
            if let Some(vector) = self.hw.halt() {
                self.deliver(vector);
            }
        }
    }
}

/// IRQ0.
pub fn timer_handler<H: Hardware>(kernel: &Kernel<H>, frame: &mut InterruptFrame) {
    let (info, callback, slice_elapsed) = {
        let mut timer = kernel.timer.lock(&kernel.hw);
        let info = timer.tick();
        (info, timer.callback, timer.slice_elapsed(info.ticks))
    };

    if let Some(callback) = callback {
        callback(&info);
    }

    if slice_elapsed && kernel.should_schedule() {
        kernel.process_schedule(frame);
    }
}
