//! A recording host implementation shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use vm86_api::{GuestRegisters, VmConfig};
use vm86_monitor::host::{Host, TaskId};
use vm86_monitor::memory::linear;
use vm86_monitor::{Machine, Vm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Created(TaskId),
    Released(TaskId),
    Suspended(TaskId),
    Woken(TaskId),
    Frozen(TaskId),
    TimerStarted(TaskId, u64),
    TimerStopped(TaskId),
}

#[derive(Default)]
pub struct MockHost {
    next_task: AtomicU32,
    clock: AtomicU64,
    events: Mutex<Vec<Event>>,
}

impl MockHost {
    pub fn advance(&self, ticks: u64) {
        self.clock.fetch_add(ticks, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn saw(&self, event: Event) -> bool {
        self.events().contains(&event)
    }

    pub fn last_timer_delay(&self) -> Option<u64> {
        self.events()
            .iter()
            .rev()
            .find_map(|e| match e {
                Event::TimerStarted(_, delay) => Some(*delay),
                _ => None,
            })
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Host for MockHost {
    fn create_task(&self, _name: &str, _config: &VmConfig) -> Option<TaskId> {
        let task = TaskId(self.next_task.fetch_add(1, Ordering::SeqCst));
        self.record(Event::Created(task));
        Some(task)
    }

    fn release_task(&self, task: TaskId) {
        self.record(Event::Released(task));
    }

    fn suspend(&self, task: TaskId) {
        self.record(Event::Suspended(task));
    }

    fn wake(&self, task: TaskId) {
        self.record(Event::Woken(task));
    }

    fn freeze(&self, task: TaskId) {
        self.record(Event::Frozen(task));
    }

    fn ticks(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn start_timer(&self, task: TaskId, delay_ticks: u64) {
        self.record(Event::TimerStarted(task, delay_ticks));
    }

    fn stop_timer(&self, task: TaskId) {
        self.record(Event::TimerStopped(task));
    }
}

pub fn new_vm() -> (Arc<Machine>, Arc<MockHost>, Arc<Vm>) {
    new_vm_with_config(VmConfig::new_default())
}

pub fn new_vm_with_config(config: VmConfig) -> (Arc<Machine>, Arc<MockHost>, Arc<Vm>) {
    let machine = Machine::new();
    let host = Arc::new(MockHost::default());
    let host_dyn: Arc<dyn Host> = host.clone();
    let vm = machine
        .create_vm(&host_dyn, "guest", config)
        .expect("vm creation failed");
    (machine, host, vm)
}

/// Writes `bytes` at the frame's CS:IP.
pub fn load_code(vm: &Vm, regs: &GuestRegisters, bytes: &[u8]) {
    let mut memory = vm.memory().lock();
    for (i, byte) in bytes.iter().enumerate() {
        let ip = regs.ip().wrapping_add(i as u16);
        memory.write_u8(linear(regs.cs, u32::from(ip)), *byte);
    }
}

/// Points the real-mode interrupt vector `vector` at `seg:off`.
pub fn set_ivt_entry(vm: &Vm, vector: u8, seg: u16, off: u16) {
    let mut memory = vm.memory().lock();
    let base = u64::from(vector) * 4;
    memory.write_u16(base, off);
    memory.write_u16(base + 2, seg);
}

/// A register frame parked at a fixed spot with a usable stack.
pub fn test_frame() -> GuestRegisters {
    let mut regs = GuestRegisters::at_reset();
    regs.cs = 0x0100;
    regs.set_ip(0x0000);
    regs.ss = 0x0200;
    regs.set_sp(0x0FFE);
    regs
}
