//! Three emulated 8253/8254 timer channels per VM.
//!
//! Counters are not ticked: each channel remembers when it was loaded and
//! derives its current count from the host tick counter on demand. Channel
//! 0 is the system timer and owns the VM's single host timer request, which
//! raises virtual IRQ 0 through the PIC on expiry. Channel 2 only matters
//! to the speaker, which can hook divisor reloads to resync its tone.

use alloc::sync::Arc;
use bit_field::BitField;
use vm86_api::Width;

use crate::host::TICK_HZ;
use crate::machine::{IoHandler, Machine, Vm, VmSlot};
use crate::pic;

pub const CH0_DATA: u16 = 0x40;
pub const CH2_DATA: u16 = 0x42;
pub const COMMAND: u16 = 0x43;

/// Input clock of the i8254, in Hz.
pub const PIT_HZ: u64 = 1_193_182;

/// Converts a divisor (0 meaning 65536) into host timer ticks, never less
/// than one tick so short periods still produce a running timer.
pub fn calc_divisor_ticks(divisor: u16) -> u64 {
    core::cmp::max(1, period_counts(divisor) * TICK_HZ / PIT_HZ)
}

fn period_counts(divisor: u16) -> u64 {
    if divisor == 0 {
        65536
    } else {
        u64::from(divisor)
    }
}

/// How the guest asked to transfer a channel's 16-bit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    LsbOnly,
    MsbOnly,
    Word,
}

impl Access {
    fn status_bits(self) -> u8 {
        match self {
            Access::LsbOnly => 1,
            Access::MsbOnly => 2,
            Access::Word => 3,
        }
    }
}

#[derive(Debug)]
struct Channel {
    mode: u8,
    bcd: bool,
    access: Access,
    divisor: u16,
    start_ticks: u64,
    programmed: bool,
    /// Set from control write until the divisor is fully loaded.
    null_count: bool,
    write_lsb: Option<u8>,
    read_hi: bool,
    latched_count: Option<u16>,
    latched_status: Option<u8>,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            mode: 0,
            bcd: false,
            access: Access::Word,
            divisor: 0,
            start_ticks: 0,
            programmed: false,
            null_count: false,
            write_lsb: None,
            read_hi: false,
            latched_count: None,
            latched_status: None,
        }
    }
}

impl Channel {
    fn period(&self) -> u64 {
        period_counts(self.divisor)
    }

    fn elapsed_counts(&self, now: u64) -> u64 {
        now.saturating_sub(self.start_ticks) * PIT_HZ / TICK_HZ
    }

    /// The count the guest would read right now. One-shot modes stick at
    /// zero once expired; periodic modes fold the elapsed time into the
    /// current period.
    fn current_count(&self, now: u64) -> u16 {
        let period = self.period();
        let elapsed = self.elapsed_counts(now);
        let count = match self.mode {
            0 | 1 | 4 | 5 => period.saturating_sub(elapsed),
            _ => period - (elapsed % period),
        };
        // A full period of 65536 reads back as 0, as on the real chip.
        count as u16
    }

    fn out_pin(&self, now: u64) -> bool {
        let period = self.period();
        let elapsed = self.elapsed_counts(now);
        match self.mode {
            3 => (elapsed % period) * 2 < period,
            2 => elapsed > 0 && elapsed % period == 0,
            _ => elapsed >= period,
        }
    }

    fn status(&self, now: u64) -> u8 {
        u8::from(self.out_pin(now)) << 7
            | u8::from(self.null_count) << 6
            | self.access.status_bits() << 4
            | (self.mode & 7) << 1
            | u8::from(self.bcd)
    }

    fn latch_count(&mut self, now: u64) {
        if self.latched_count.is_none() {
            self.latched_count = Some(self.current_count(now));
            self.read_hi = false;
        }
    }

    fn latch_status(&mut self, now: u64) {
        if self.latched_status.is_none() {
            self.latched_status = Some(self.status(now));
        }
    }

    /// Applies a control word addressed at this channel.
    fn control(&mut self, byte: u8, now: u64) {
        match byte.get_bits(4..6) {
            0 => self.latch_count(now),
            rw => {
                self.access = match rw {
                    1 => Access::LsbOnly,
                    2 => Access::MsbOnly,
                    _ => Access::Word,
                };
                let mode = byte.get_bits(1..4);
                // Modes 6 and 7 alias 2 and 3.
                self.mode = if mode >= 6 { mode - 4 } else { mode };
                self.bcd = byte.get_bit(0);
                self.null_count = true;
                self.write_lsb = None;
                self.read_hi = false;
                self.latched_count = None;
                self.latched_status = None;
            }
        }
    }

    /// Feeds one data-port byte; returns whether the divisor load is now
    /// complete.
    fn write_data(&mut self, byte: u8) -> bool {
        match self.access {
            Access::LsbOnly => {
                self.divisor = u16::from(byte);
                true
            }
            Access::MsbOnly => {
                self.divisor = u16::from(byte) << 8;
                true
            }
            Access::Word => match self.write_lsb.take() {
                None => {
                    self.write_lsb = Some(byte);
                    self.null_count = true;
                    false
                }
                Some(lsb) => {
                    self.divisor = u16::from(lsb) | u16::from(byte) << 8;
                    true
                }
            },
        }
    }

    /// (Re)starts the count after a completed divisor load.
    fn reload(&mut self, now: u64) {
        self.start_ticks = now;
        self.programmed = true;
        self.null_count = false;
    }

    fn read_data(&mut self, now: u64) -> u8 {
        if let Some(status) = self.latched_status.take() {
            return status;
        }
        let count = match self.latched_count {
            Some(latched) => latched,
            None => self.current_count(now),
        };
        let [lo, hi] = count.to_le_bytes();
        match self.access {
            Access::LsbOnly => {
                self.latched_count = None;
                lo
            }
            Access::MsbOnly => {
                self.latched_count = None;
                hi
            }
            Access::Word => {
                if self.read_hi {
                    self.read_hi = false;
                    self.latched_count = None;
                    hi
                } else {
                    self.read_hi = true;
                    lo
                }
            }
        }
    }
}

/// Callback invoked with the new divisor whenever channel 2 is reloaded.
pub type SpeakerHook = Arc<dyn Fn(&Vm, u16) + Send + Sync>;

#[derive(Default)]
struct VPit {
    channels: [Channel; 3],
    timer_hooked: bool,
    speaker_hook: Option<SpeakerHook>,
}

/// Work to do once the extension slot is unlocked again.
enum AfterWrite {
    Nothing,
    SystemTimer { delay: u64, first: bool },
    SpeakerReload { divisor: u16, hook: Option<SpeakerHook> },
}

struct PitPorts;

impl IoHandler for PitPorts {
    fn name(&self) -> &str {
        "vpit"
    }

    fn ports(&self) -> (u16, u16) {
        (CH0_DATA, COMMAND)
    }

    fn port_in(&self, vm: &Vm, port: u16, _width: Width) -> u32 {
        if port == COMMAND {
            // The control word is write-only.
            return 0xFF;
        }
        let now = vm.host().ticks();
        let channel = usize::from(port - CH0_DATA);
        u32::from(with_pit(vm, |pit| pit.channels[channel].read_data(now)))
    }

    fn port_out(&self, vm: &Vm, port: u16, _width: Width, value: u32) {
        let byte = value as u8;
        let now = vm.host().ticks();

        let after = with_pit(vm, |pit| {
            if port == COMMAND {
                let select = byte.get_bits(6..8);
                if select == 3 {
                    // Read-back: latch count and/or status of any subset.
                    let latch_count = !byte.get_bit(5);
                    let latch_status = !byte.get_bit(4);
                    for channel in 0..3 {
                        if byte.get_bit(channel + 1) {
                            if latch_count {
                                pit.channels[channel].latch_count(now);
                            }
                            if latch_status {
                                pit.channels[channel].latch_status(now);
                            }
                        }
                    }
                } else {
                    pit.channels[usize::from(select)].control(byte, now);
                }
                return AfterWrite::Nothing;
            }

            let channel = usize::from(port - CH0_DATA);
            if !pit.channels[channel].write_data(byte) {
                return AfterWrite::Nothing;
            }
            pit.channels[channel].reload(now);
            match channel {
                0 => AfterWrite::SystemTimer {
                    delay: calc_divisor_ticks(pit.channels[0].divisor),
                    first: !core::mem::replace(&mut pit.timer_hooked, true),
                },
                2 => AfterWrite::SpeakerReload {
                    divisor: pit.channels[2].divisor,
                    hook: pit.speaker_hook.clone(),
                },
                _ => AfterWrite::Nothing,
            }
        });

        match after {
            AfterWrite::Nothing => {}
            AfterWrite::SystemTimer { delay, first } => {
                if first {
                    vm.add_kill_handler(alloc::boxed::Box::new(|vm| {
                        vm.host().stop_timer(vm.task());
                    }));
                }
                log::trace!("vm `{}`: system timer every {delay} ticks", vm.name());
                vm.host().start_timer(vm.task(), delay);
            }
            AfterWrite::SpeakerReload { divisor, hook } => {
                if let Some(hook) = hook {
                    hook(vm, divisor);
                }
            }
        }
    }
}

/// Claims the PIT's extension slot and registers its ports, once per
/// machine.
pub(crate) fn open(machine: &Arc<Machine>) -> VmSlot {
    *machine.pit_slot.get_or_init(|| {
        let slot = machine
            .alloc_slot()
            .expect("no free extension slot for the vpit");
        machine.add_io_handler(None, Arc::new(PitPorts));
        slot
    })
}

fn with_pit<R>(vm: &Vm, f: impl FnOnce(&mut VPit) -> R) -> R {
    let slot = open(vm.machine());
    vm.with_ext(slot, VPit::default, f)
}

/// Host timer expiry for this VM: channel 0 fires IRQ 0 and, in the
/// periodic modes, asks for the next shot.
pub fn on_timer(vm: &Vm) {
    pic::simulate_irq(vm, 0);
    let rearm = with_pit(vm, |pit| {
        let ch0 = &pit.channels[0];
        if ch0.programmed && matches!(ch0.mode, 2 | 3) {
            Some(calc_divisor_ticks(ch0.divisor))
        } else {
            None
        }
    });
    if let Some(delay) = rearm {
        vm.host().start_timer(vm.task(), delay);
    }
}

/// Registers the channel-2 reload hook used by speaker emulation.
pub fn set_speaker_hook(vm: &Vm, hook: SpeakerHook) {
    with_pit(vm, |pit| pit.speaker_hook = Some(hook));
}

/// Point-in-time view of one channel, for status-style consumers.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSnapshot {
    pub mode: u8,
    pub divisor: u16,
    pub count: u16,
    pub out: bool,
}

pub fn snapshot(vm: &Vm, channel: usize) -> ChannelSnapshot {
    let now = vm.host().ticks();
    with_pit(vm, |pit| {
        let ch = &pit.channels[channel];
        ChannelSnapshot {
            mode: ch.mode,
            divisor: ch.divisor,
            count: ch.current_count(now),
            out: ch.out_pin(now),
        }
    })
}
