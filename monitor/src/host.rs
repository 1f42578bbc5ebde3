use vm86_api::VmConfig;

/// Handle of a host scheduler task. The monitor never inspects it, it only
/// hands it back to the [`Host`] it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u32);

/// Rate of the host tick counter returned by [`Host::ticks`], in Hz.
pub const TICK_HZ: u64 = 1000;

/// Scheduler and timer services the embedding kernel provides to the
/// monitor.
///
/// Every guest runs as one host task. The monitor parks that task on HLT,
/// wakes it from `simulate_irq`, and freezes it when the guest does
/// something the emulator does not understand. The embedder's resume path
/// must call [`crate::pic::deliver_pending`] with the outgoing register
/// frame immediately before returning control to the guest; that is the
/// single point where queued virtual interrupts are injected.
pub trait Host: Send + Sync {
    /// Allocates the task (and its console, per `config.display`) backing a
    /// new guest. Returns `None` when the host is out of tasks.
    fn create_task(&self, name: &str, config: &VmConfig) -> Option<TaskId>;

    /// Releases a task previously returned by [`Host::create_task`].
    fn release_task(&self, task: TaskId);

    /// Parks the task until [`Host::wake`]. Called with the guest off-cpu
    /// conceptually; on a single-core host this returns and the caller's
    /// trap path unwinds back into the scheduler.
    fn suspend(&self, task: TaskId);

    /// Makes a suspended task runnable again.
    fn wake(&self, task: TaskId);

    /// Permanently stops a misbehaving guest's task. The VM object stays
    /// around for inspection until `kill_vm`.
    fn freeze(&self, task: TaskId);

    /// Monotonic tick counter at [`TICK_HZ`].
    fn ticks(&self) -> u64;

    /// Requests a one-shot timer. After `delay_ticks` ticks the host must
    /// call [`crate::pit::on_timer`] for the VM owning `task`. A second
    /// request replaces the first; each VM owns at most one.
    fn start_timer(&self, task: TaskId, delay_ticks: u64);

    /// Cancels the pending timer request, if any.
    fn stop_timer(&self, task: TaskId);
}
