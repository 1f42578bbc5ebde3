//! The monitor's registry: VM lifecycle, I/O and service-call handler
//! chains, kill handlers, and the per-VM extension slots.
//!
//! Lock order, outermost first: handler chains → extension slots → guest
//! memory. Each lock stands in for the original single-core
//! interrupts-masked critical section, so nothing may sleep while holding
//! one.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use core::any::Any;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use spinning_top::Spinlock;
use vm86_api::{GuestRegisters, VmConfig, Width};
use x86_64::registers::rflags::RFlags;

use crate::host::{Host, TaskId};
use crate::memory::GuestAddressSpace;
use crate::{pic, pit};

/// Number of extension slots every VM carries.
pub const VM_SLOTS: usize = 32;

/// A claimed extension-slot index, one per extension across all VMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmSlot(u8);

impl VmSlot {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// A handler for a range of guest I/O ports.
///
/// The registering collaborator keeps ownership; the registry only links the
/// handler into a chain, and drops its link on removal.
pub trait IoHandler: Send + Sync {
    fn name(&self) -> &str;

    /// The inclusive port range this handler claims.
    fn ports(&self) -> (u16, u16);

    fn port_in(&self, vm: &Vm, port: u16, width: Width) -> u32;

    fn port_out(&self, vm: &Vm, port: u16, width: Width, value: u32);
}

/// A handler for a range of service numbers of the 16-bit service-call
/// escape (the repurposed ARPL opcode).
pub trait ArplHandler: Send + Sync {
    fn name(&self) -> &str;

    /// The inclusive service-number range this handler claims.
    fn services(&self) -> (u16, u16);

    fn call(&self, vm: &Vm, service: u16, regs: &mut GuestRegisters);
}

/// Run once when the VM is torn down; extensions use these to release
/// whatever their slot refers to.
pub type KillHandler = Box<dyn FnOnce(&Vm) + Send>;

fn covers(range: (u16, u16), value: u16) -> bool {
    range.0 <= value && value <= range.1
}

/// Process-wide monitor state shared by every VM.
pub struct Machine {
    io: Spinlock<Vec<Arc<dyn IoHandler>>>,
    arpl: Spinlock<Vec<Arc<dyn ArplHandler>>>,
    slot_bitmap: Spinlock<u32>,
    pub(crate) pic_slot: OnceCell<VmSlot>,
    pub(crate) pit_slot: OnceCell<VmSlot>,
}

impl Machine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            io: Spinlock::new(Vec::new()),
            arpl: Spinlock::new(Vec::new()),
            slot_bitmap: Spinlock::new(0),
            pic_slot: OnceCell::uninit(),
            pit_slot: OnceCell::uninit(),
        })
    }

    /// Creates a guest: host task, address space, virtual interrupt
    /// hardware, and the initial register frame at the reset vector.
    ///
    /// The embedding kernel wires the returned VM's exception handling to
    /// [`crate::trap`] and calls [`crate::pic::deliver_pending`] on every
    /// resume.
    pub fn create_vm(
        self: &Arc<Self>,
        host: &Arc<dyn Host>,
        name: &str,
        config: VmConfig,
    ) -> Result<Arc<Vm>, &'static str> {
        let task = host
            .create_task(name, &config)
            .ok_or("host task allocation failed")?;

        pic::open(self);
        pit::open(self);

        let vm = Arc::new(Vm {
            name: name.to_string(),
            config,
            task,
            machine: Arc::clone(self),
            host: Arc::clone(host),
            memory: Spinlock::new(GuestAddressSpace::new(config.memory_kib)),
            local_io: Spinlock::new(Vec::new()),
            kill_handlers: Spinlock::new(Vec::new()),
            slots: Spinlock::new(SlotTable::new()),
            vflags: AtomicU64::new(RFlags::INTERRUPT_FLAG.bits()),
            halted: AtomicBool::new(false),
            delivery_armed: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            fault_depth: AtomicU32::new(0),
        });

        // The gate starts open so the full address space can be set up, and
        // is closed before the guest sees it, as on a just-reset PC.
        vm.set_gate_a20(false);

        log::info!(
            "created vm `{name}`: {} KiB, display {}",
            config.memory_kib,
            config.display
        );
        Ok(vm)
    }

    /// Tears a VM down: the task is frozen and parked, every kill handler
    /// runs exactly once, then the task is released. The `Arc` keeps the
    /// object alive until the last collaborator lets go.
    pub fn kill_vm(&self, vm: &Vm) {
        if vm.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        vm.host.freeze(vm.task);
        vm.host.suspend(vm.task);

        let handlers: Vec<KillHandler> = core::mem::take(&mut *vm.kill_handlers.lock());
        for handler in handlers {
            handler(vm);
        }

        vm.local_io.lock().clear();
        vm.slots.lock().clear();
        vm.host.release_task(vm.task);
        log::info!("killed vm `{}`", vm.name);
    }

    /// Links an I/O handler, either into one VM's chain or the global one.
    pub fn add_io_handler(&self, vm: Option<&Vm>, handler: Arc<dyn IoHandler>) {
        match vm {
            Some(vm) => vm.local_io.lock().push(handler),
            None => self.io.lock().push(handler),
        }
    }

    /// Unlinks a previously added I/O handler. Returns whether it was found.
    pub fn remove_io_handler(&self, vm: Option<&Vm>, handler: &Arc<dyn IoHandler>) -> bool {
        let mut chain = match vm {
            Some(vm) => vm.local_io.lock(),
            None => self.io.lock(),
        };
        let before = chain.len();
        chain.retain(|h| !Arc::ptr_eq(h, handler));
        chain.len() != before
    }

    pub(crate) fn lookup_global_io(&self, port: u16) -> Option<Arc<dyn IoHandler>> {
        self.io
            .lock()
            .iter()
            .find(|h| covers(h.ports(), port))
            .cloned()
    }

    pub fn add_arpl_handler(&self, handler: Arc<dyn ArplHandler>) {
        self.arpl.lock().push(handler);
    }

    pub fn remove_arpl_handler(&self, handler: &Arc<dyn ArplHandler>) -> bool {
        let mut chain = self.arpl.lock();
        let before = chain.len();
        chain.retain(|h| !Arc::ptr_eq(h, handler));
        chain.len() != before
    }

    pub fn lookup_arpl_handler(&self, service: u16) -> Option<Arc<dyn ArplHandler>> {
        self.arpl
            .lock()
            .iter()
            .find(|h| covers(h.services(), service))
            .cloned()
    }

    /// Claims the lowest free extension slot. Exhaustion is fatal to the
    /// requesting extension, not to the monitor.
    pub fn alloc_slot(&self) -> Option<VmSlot> {
        let mut bitmap = self.slot_bitmap.lock();
        let free = (!*bitmap).trailing_zeros();
        if free as usize >= VM_SLOTS {
            return None;
        }
        *bitmap |= 1 << free;
        Some(VmSlot(free as u8))
    }

    pub fn free_slot(&self, slot: VmSlot) {
        *self.slot_bitmap.lock() &= !(1 << slot.0);
    }
}

struct SlotTable([Option<Box<dyn Any + Send>>; VM_SLOTS]);

impl SlotTable {
    fn new() -> Self {
        const EMPTY: Option<Box<dyn Any + Send>> = None;
        Self([EMPTY; VM_SLOTS])
    }

    fn clear(&mut self) {
        for slot in &mut self.0 {
            *slot = None;
        }
    }
}

/// One guest execution context.
pub struct Vm {
    name: String,
    config: VmConfig,
    task: TaskId,
    machine: Arc<Machine>,
    host: Arc<dyn Host>,
    memory: Spinlock<GuestAddressSpace>,
    local_io: Spinlock<Vec<Arc<dyn IoHandler>>>,
    kill_handlers: Spinlock<Vec<KillHandler>>,
    slots: Spinlock<SlotTable>,
    /// Shadow of the IF/TF bits the guest believes it controls. The real
    /// EFLAGS never carries them while the guest runs unprivileged.
    vflags: AtomicU64,
    halted: AtomicBool,
    delivery_armed: AtomicBool,
    killed: AtomicBool,
    fault_depth: AtomicU32,
}

impl Vm {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn memory(&self) -> &Spinlock<GuestAddressSpace> {
        &self.memory
    }

    /// The guest's shadow EFLAGS (IF and TF only).
    pub fn virtual_flags(&self) -> RFlags {
        RFlags::from_bits_truncate(self.vflags.load(Ordering::SeqCst))
    }

    pub fn virtual_if(&self) -> bool {
        self.virtual_flags().contains(RFlags::INTERRUPT_FLAG)
    }

    pub(crate) fn set_virtual_if(&self, enabled: bool) {
        self.set_virtual_flag(RFlags::INTERRUPT_FLAG, enabled);
    }

    pub(crate) fn set_virtual_tf(&self, enabled: bool) {
        self.set_virtual_flag(RFlags::TRAP_FLAG, enabled);
    }

    fn set_virtual_flag(&self, flag: RFlags, enabled: bool) {
        if enabled {
            self.vflags.fetch_or(flag.bits(), Ordering::SeqCst);
        } else {
            self.vflags.fetch_and(!flag.bits(), Ordering::SeqCst);
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_halted(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Clears the halted state; returns whether the VM was halted.
    pub(crate) fn wake_from_halt(&self) -> bool {
        self.halted.swap(false, Ordering::SeqCst)
    }

    /// Whether an interrupt injection is queued for the next resume.
    pub fn delivery_armed(&self) -> bool {
        self.delivery_armed.load(Ordering::SeqCst)
    }

    pub(crate) fn arm_delivery(&self) {
        self.delivery_armed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn disarm_delivery(&self) {
        self.delivery_armed.store(false, Ordering::SeqCst);
    }

    /// Finds the I/O handler responsible for `port`, local chain first.
    pub fn lookup_io_handler(&self, port: u16) -> Option<Arc<dyn IoHandler>> {
        let local = self
            .local_io
            .lock()
            .iter()
            .find(|h| covers(h.ports(), port))
            .cloned();
        local.or_else(|| self.machine.lookup_global_io(port))
    }

    pub fn add_kill_handler(&self, handler: KillHandler) {
        self.kill_handlers.lock().push(handler);
    }

    /// Runs `f` on this VM's state for the given extension slot, creating
    /// it via `init` on first use.
    ///
    /// Panics if the slot holds a value of a different type; slot numbers
    /// are claimed process-wide, so that can only be a bug in the claiming
    /// extension.
    pub fn with_ext<T, R>(
        &self,
        slot: VmSlot,
        init: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> R,
    ) -> R
    where
        T: Any + Send,
    {
        let mut slots = self.slots.lock();
        let entry = &mut slots.0[slot.index()];
        if entry.is_none() {
            *entry = Some(Box::new(init()));
        }
        let ext = entry
            .as_mut()
            .and_then(|boxed| boxed.downcast_mut::<T>())
            .expect("extension slot holds a different type");
        f(ext)
    }

    /// Opens or closes the emulated A20 gate.
    pub fn set_gate_a20(&self, enabled: bool) {
        log::trace!("vm `{}`: gate a20 {}", self.name, if enabled { "open" } else { "closed" });
        self.memory.lock().set_a20(enabled);
    }

    pub(crate) fn fault_scope(&self) -> FaultScope<'_> {
        self.fault_depth.fetch_add(1, Ordering::SeqCst);
        FaultScope { vm: self }
    }

    pub(crate) fn fault_depth(&self) -> u32 {
        self.fault_depth.load(Ordering::SeqCst)
    }
}

/// Tracks nesting of fault handling; a guest fault taken while the monitor
/// was already handling one means monitor state can no longer be trusted.
pub(crate) struct FaultScope<'a> {
    vm: &'a Vm,
}

impl Drop for FaultScope<'_> {
    fn drop(&mut self) {
        self.vm.fault_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_allocator_is_first_fit() {
        let machine = Machine::new();
        let a = machine.alloc_slot().unwrap();
        let b = machine.alloc_slot().unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        machine.free_slot(a);
        let c = machine.alloc_slot().unwrap();
        assert_eq!(c.index(), 0);
    }

    #[test]
    fn slot_allocator_reports_exhaustion() {
        let machine = Machine::new();
        for _ in 0..VM_SLOTS {
            assert!(machine.alloc_slot().is_some());
        }
        assert!(machine.alloc_slot().is_none());
    }

    struct DummyPort(u16);

    impl IoHandler for DummyPort {
        fn name(&self) -> &str {
            "dummy"
        }

        fn ports(&self) -> (u16, u16) {
            (self.0, self.0)
        }

        fn port_in(&self, _vm: &Vm, _port: u16, _width: Width) -> u32 {
            0
        }

        fn port_out(&self, _vm: &Vm, _port: u16, _width: Width, _value: u32) {}
    }

    #[test]
    fn global_chain_add_remove() {
        let machine = Machine::new();
        let h: Arc<dyn IoHandler> = Arc::new(DummyPort(0x3F8));
        machine.add_io_handler(None, Arc::clone(&h));
        assert!(machine.lookup_global_io(0x3F8).is_some());
        assert!(machine.lookup_global_io(0x3F9).is_none());
        assert!(machine.remove_io_handler(None, &h));
        assert!(!machine.remove_io_handler(None, &h));
        assert!(machine.lookup_global_io(0x3F8).is_none());
    }
}
