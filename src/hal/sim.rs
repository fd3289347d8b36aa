//! Simulated machine for host builds.
//!
//! Records port traffic and control register writes so tests can check
//! what the kernel asked the hardware to do. Interrupts are delivered
//! synchronously: [`SimulatedHardware::raise`] queues a vector and the next
//! [`Hardware::halt`] hands it back to the kernel for dispatch.

use alloc::{collections::BTreeMap, collections::VecDeque, vec::Vec};
use spin::Mutex;

use super::{DescriptorTablePointer, Hardware};
use crate::{
    constants::{idt::TIMER_VECTOR, memory::PAGE_SIZE},
    memory::{PhysAddr, VirtAddr},
};

/// First fake physical address handed out for kernel objects.
const SIM_PHYS_BASE: u32 = 0x0030_0000;
const SIM_STUB_BASE: u32 = 0x1000;
const SIM_STUB_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortWrite {
    pub port: u16,
    pub value: u32,
}

#[derive(Debug)]
struct SimState {
    writes: Vec<PortWrite>,
    port_values: BTreeMap<u16, u32>,
    interrupts: bool,
    cli_count: usize,
    cr3: Option<PhysAddr>,
    paging: bool,
    cr2: VirtAddr,
    invalidated: Vec<VirtAddr>,
    idt: Option<DescriptorTablePointer>,
    pending: VecDeque<u8>,
    timer_running: bool,
    halts: usize,
    phys: BTreeMap<usize, u32>,
    next_phys: u32,
}

#[derive(Debug)]
pub struct SimulatedHardware {
    state: Mutex<SimState>,
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHardware {
    pub fn new() -> Self {
        SimulatedHardware {
            state: Mutex::new(SimState {
                writes: Vec::new(),
                port_values: BTreeMap::new(),
                interrupts: false,
                cli_count: 0,
                cr3: None,
                paging: false,
                cr2: VirtAddr::zero(),
                invalidated: Vec::new(),
                idt: None,
                pending: VecDeque::new(),
                timer_running: false,
                halts: 0,
                phys: BTreeMap::new(),
                next_phys: SIM_PHYS_BASE,
            }),
        }
    }

    /// Every port write so far, oldest first.
    pub fn port_writes(&self) -> Vec<PortWrite> {
        self.state.lock().writes.clone()
    }

    /// Values written to `port`, oldest first.
    pub fn writes_to(&self, port: u16) -> Vec<u32> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.port == port)
            .map(|w| w.value)
            .collect()
    }

    pub fn clear_port_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Value the next read of `port` returns.
    pub fn set_port_value(&self, port: u16, value: u32) {
        self.state.lock().port_values.insert(port, value);
    }

    /// Queues `vector` for delivery at the next halt.
    pub fn raise(&self, vector: u8) {
        self.state.lock().pending.push_back(vector);
    }

    /// While running, every halt with nothing queued delivers a timer tick.
    pub fn set_timer_running(&self, running: bool) {
        self.state.lock().timer_running = running;
    }

    pub fn set_fault_address(&self, address: VirtAddr) {
        self.state.lock().cr2 = address;
    }

    pub fn page_directory(&self) -> Option<PhysAddr> {
        self.state.lock().cr3
    }

    pub fn paging_enabled(&self) -> bool {
        self.state.lock().paging
    }

    pub fn invalidated_pages(&self) -> Vec<VirtAddr> {
        self.state.lock().invalidated.clone()
    }

    pub fn loaded_idt(&self) -> Option<DescriptorTablePointer> {
        self.state.lock().idt
    }

    pub fn halt_count(&self) -> usize {
        self.state.lock().halts
    }

    /// Number of times interrupts were disabled.
    pub fn cli_count(&self) -> usize {
        self.state.lock().cli_count
    }

    fn write(&self, port: u16, value: u32) {
        let mut state = self.state.lock();
        state.writes.push(PortWrite { port, value });
        state.port_values.insert(port, value);
    }

    fn read(&self, port: u16) -> u32 {
        self.state.lock().port_values.get(&port).copied().unwrap_or(0)
    }
}

impl Hardware for SimulatedHardware {
    fn read_port8(&self, port: u16) -> u8 {
        self.read(port) as u8
    }

    fn read_port16(&self, port: u16) -> u16 {
        self.read(port) as u16
    }

    fn read_port32(&self, port: u16) -> u32 {
        self.read(port)
    }

    fn write_port8(&self, port: u16, value: u8) {
        self.write(port, value.into());
    }

    fn write_port16(&self, port: u16, value: u16) {
        self.write(port, value.into());
    }

    fn write_port32(&self, port: u16, value: u32) {
        self.write(port, value);
    }

    fn interrupts_enabled(&self) -> bool {
        self.state.lock().interrupts
    }

    fn enable_interrupts(&self) {
        self.state.lock().interrupts = true;
    }

    fn disable_interrupts(&self) {
        let mut state = self.state.lock();
        state.interrupts = false;
        state.cli_count += 1;
    }

    fn halt(&self) -> Option<u8> {
        let mut state = self.state.lock();
        state.halts += 1;
        if !state.interrupts {
            drop(state);
            panic!("cpu halted with interrupts disabled");
        }
        let next = state.pending.pop_front();
        let timer = state.timer_running;
        drop(state);
        match next {
            Some(vector) => Some(vector),
            None if timer => Some(TIMER_VECTOR),
            None => panic!("cpu halted with no interrupt source"),
        }
    }

    fn halt_forever(&self) -> ! {
        self.disable_interrupts();
        panic!("cpu halted for good");
    }

    fn load_page_directory(&self, directory: PhysAddr) {
        let mut state = self.state.lock();
        state.cr3 = Some(directory);
        state.paging = true;
    }

    fn invalidate_page(&self, address: VirtAddr) {
        self.state.lock().invalidated.push(address);
    }

    fn fault_address(&self) -> VirtAddr {
        self.state.lock().cr2
    }

    fn load_idt(&self, pointer: DescriptorTablePointer) {
        self.state.lock().idt = Some(pointer);
    }

    fn isr_stub_address(&self, vector: u8) -> Option<u32> {
        Some(SIM_STUB_BASE + u32::from(vector) * SIM_STUB_SIZE)
    }

    fn physical_address_of(&self, ptr: *const u8) -> PhysAddr {
        let page = ptr as usize & !(PAGE_SIZE as usize - 1);
        let offset = (ptr as usize - page) as u32;
        let mut state = self.state.lock();
        let base = match state.phys.get(&page) {
            Some(&base) => base,
            None => {
                let base = state.next_phys;
                state.next_phys += PAGE_SIZE;
                state.phys.insert(page, base);
                base
            }
        };
        PhysAddr::new(base + offset)
    }
}
