//! A pair of emulated 8259A interrupt controllers per VM.
//!
//! The guest programs them through the usual ports; collaborators raise
//! lines with [`simulate_irq`]. Delivery is deferred: raising a line only
//! arms the VM's injection flag, and the scheduler's resume path calls
//! [`deliver_pending`] to push the vector just before the guest continues.

use alloc::sync::Arc;
use bit_field::BitField;
use vm86_api::{GuestRegisters, Width};

use crate::machine::{IoHandler, Machine, Vm, VmSlot};
use crate::trap;

pub const MASTER_CMD: u16 = 0x20;
pub const MASTER_DATA: u16 = 0x21;
pub const SLAVE_CMD: u16 = 0xA0;
pub const SLAVE_DATA: u16 = 0xA1;

/// Where a controller is in the ICW/OCW byte protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PicState {
    Normal,
    WaitIcw2,
    WaitIcw3,
    WaitIcw4,
    /// The next command-port read returns IRR.
    ReadIrr,
    /// The next command-port read returns ISR.
    ReadIsr,
}

/// One emulated 8259A.
#[derive(Debug)]
pub(crate) struct VPic {
    irr: u8,
    isr: u8,
    mask: u8,
    /// Vector base programmed by ICW2.
    base: u8,
    /// ICW3 byte: on the master a bitmask of cascade lines, on the slave
    /// its cascade identity.
    link: u8,
    state: PicState,
    icw4_expected: bool,
    icw4: u8,
}

impl VPic {
    fn new(base: u8, link: u8) -> Self {
        Self {
            irr: 0,
            isr: 0,
            mask: 0,
            base,
            link,
            state: PicState::Normal,
            icw4_expected: false,
            icw4: 0,
        }
    }

    /// Feeds one byte written to the command port (0x20/0xA0). Returns
    /// whether the byte was an EOI, which the caller answers by re-arming
    /// delivery.
    fn command_write(&mut self, byte: u8) -> bool {
        if byte.get_bit(4) {
            // ICW1: restart initialization.
            self.icw4_expected = byte.get_bit(0);
            self.irr = 0;
            self.isr = 0;
            self.mask = 0;
            self.icw4 = 0;
            self.state = PicState::WaitIcw2;
            false
        } else if byte.get_bit(3) {
            // OCW3: choose what the command port reads back.
            match byte.get_bits(0..2) {
                0b10 => self.state = PicState::ReadIrr,
                0b11 => self.state = PicState::ReadIsr,
                _ => {}
            }
            if byte.get_bits(5..8) != 0 || byte.get_bit(2) {
                log::debug!("vpic: ignoring unsupported ocw3 bits {byte:#04x}");
            }
            false
        } else {
            // OCW2. Both EOI forms drop the in-service state; the rotate
            // and nop variants are accepted and ignored.
            match byte.get_bits(5..8) {
                0b001 | 0b011 => {
                    self.isr = 0;
                    true
                }
                _ => false,
            }
        }
    }

    /// Feeds one byte written to the data port (0x21/0xA1).
    fn data_write(&mut self, byte: u8) {
        match self.state {
            PicState::WaitIcw2 => {
                self.base = byte & 0xF8;
                self.state = PicState::WaitIcw3;
            }
            PicState::WaitIcw3 => {
                self.link = byte;
                self.state = if self.icw4_expected {
                    PicState::WaitIcw4
                } else {
                    PicState::Normal
                };
            }
            PicState::WaitIcw4 => {
                self.icw4 = byte;
                self.state = PicState::Normal;
            }
            // OCW1: the mask, verbatim.
            _ => self.mask = byte,
        }
    }

    fn command_read(&mut self) -> u8 {
        let value = match self.state {
            PicState::ReadIsr => self.isr,
            _ => self.irr,
        };
        if matches!(self.state, PicState::ReadIrr | PicState::ReadIsr) {
            self.state = PicState::Normal;
        }
        value
    }

    fn data_read(&self) -> u8 {
        self.mask
    }
}

/// The master/slave pair of one VM, living in the PIC's extension slot.
#[derive(Debug)]
pub(crate) struct VPicPair {
    pub(crate) master: VPic,
    pub(crate) slave: VPic,
}

impl Default for VPicPair {
    fn default() -> Self {
        // Vector bases and cascade wiring as a PC's BIOS leaves them.
        Self {
            master: VPic::new(0x08, 0x04),
            slave: VPic::new(0x70, 0x02),
        }
    }
}

struct PicPorts {
    ports: (u16, u16),
}

impl IoHandler for PicPorts {
    fn name(&self) -> &str {
        "vpic"
    }

    fn ports(&self) -> (u16, u16) {
        self.ports
    }

    fn port_in(&self, vm: &Vm, port: u16, _width: Width) -> u32 {
        let value = with_pic(vm, |pic| match port {
            MASTER_CMD => pic.master.command_read(),
            MASTER_DATA => pic.master.data_read(),
            SLAVE_CMD => pic.slave.command_read(),
            _ => pic.slave.data_read(),
        });
        u32::from(value)
    }

    fn port_out(&self, vm: &Vm, port: u16, _width: Width, value: u32) {
        let byte = value as u8;
        let eoi = with_pic(vm, |pic| match port {
            MASTER_CMD => pic.master.command_write(byte),
            MASTER_DATA => {
                pic.master.data_write(byte);
                false
            }
            SLAVE_CMD => pic.slave.command_write(byte),
            _ => {
                pic.slave.data_write(byte);
                false
            }
        });
        if eoi {
            reevaluate(vm);
        }
    }
}

/// Claims the PIC's extension slot and registers its ports, once per
/// machine.
pub(crate) fn open(machine: &Arc<Machine>) -> VmSlot {
    *machine.pic_slot.get_or_init(|| {
        let slot = machine
            .alloc_slot()
            .expect("no free extension slot for the vpic");
        machine.add_io_handler(
            None,
            Arc::new(PicPorts {
                ports: (MASTER_CMD, MASTER_DATA),
            }),
        );
        machine.add_io_handler(
            None,
            Arc::new(PicPorts {
                ports: (SLAVE_CMD, SLAVE_DATA),
            }),
        );
        slot
    })
}

fn with_pic<R>(vm: &Vm, f: impl FnOnce(&mut VPicPair) -> R) -> R {
    let slot = open(vm.machine());
    vm.with_ext(slot, VPicPair::default, f)
}

/// Raises a virtual interrupt line (0..16).
///
/// May be called from any context: a host interrupt handler, a timer
/// callback, or another VM's emulation path. A line masked in the
/// controller's IMR is dropped at this point. If the guest currently
/// accepts interrupts the VM is woken from HLT and injection is armed.
pub fn simulate_irq(vm: &Vm, irq: u8) {
    debug_assert!(irq < 16);
    let raised = with_pic(vm, |pic| {
        if irq >= 8 {
            let line = usize::from(irq - 8);
            if pic.slave.mask.get_bit(line) {
                return false;
            }
            pic.slave.irr.set_bit(line, true);
            // The slave's request shows up on the master's cascade lines.
            pic.master.irr |= pic.master.link & !pic.master.mask;
            true
        } else {
            let line = usize::from(irq);
            if pic.master.mask.get_bit(line) {
                return false;
            }
            pic.master.irr.set_bit(line, true);
            true
        }
    });
    if !raised {
        return;
    }

    if vm.virtual_if() {
        if vm.wake_from_halt() {
            vm.host().wake(vm.task());
        }
        vm.arm_delivery();
    }
}

/// The guest turned interrupts on: arm injection if anything is waiting.
pub fn if_enabled(vm: &Vm) {
    let pending = with_pic(vm, |pic| pic.master.irr != 0);
    if pending {
        vm.arm_delivery();
    }
}

/// The guest turned interrupts off: withdraw the injection hook. Request
/// and in-service state are untouched.
pub fn if_disabled(vm: &Vm) {
    vm.disarm_delivery();
}

/// Re-evaluates the injection hook after an EOI or IRET.
pub fn reevaluate(vm: &Vm) {
    if vm.virtual_if() {
        if_enabled(vm);
    }
}

/// Sets or clears mask bits: the low byte lands in the master's IMR, the
/// high byte in the slave's.
pub fn set_mask(vm: &Vm, set: bool, mask: u16) {
    with_pic(vm, |pic| {
        let lo = mask as u8;
        let hi = (mask >> 8) as u8;
        if set {
            pic.master.mask |= lo;
            pic.slave.mask |= hi;
        } else {
            pic.master.mask &= !lo;
            pic.slave.mask &= !hi;
        }
    });
}

/// Injects the highest-priority pending vector into the guest frame, if the
/// hook is armed and the guest can take it. Called by the scheduler
/// immediately before resuming the guest. Returns the delivered vector.
pub fn deliver_pending(vm: &Vm, regs: &mut GuestRegisters) -> Option<u8> {
    if !vm.delivery_armed() || !regs.in_vm86_mode() || !vm.virtual_if() {
        return None;
    }

    let vector = with_pic(vm, |pic| {
        if pic.master.isr != 0 {
            return None;
        }
        if pic.master.irr == 0 {
            vm.disarm_delivery();
            return None;
        }

        // Lowest set line wins, the 8259's fixed priority order.
        let line = pic.master.irr.trailing_zeros() as usize;
        pic.master.irr.set_bit(line, false);
        pic.master.isr.set_bit(line, true);

        let vector = if pic.master.link.get_bit(line) {
            if pic.slave.irr == 0 {
                pic.master.base + line as u8
            } else {
                let sline = pic.slave.irr.trailing_zeros() as usize;
                pic.slave.irr.set_bit(sline, false);
                pic.slave.isr.set_bit(sline, true);
                if pic.slave.irr != 0 {
                    // More slave work: keep the cascade line requesting.
                    pic.master.irr.set_bit(line, true);
                }
                pic.slave.base + sline as u8
            }
        } else {
            pic.master.base + line as u8
        };

        if pic.master.irr == 0 {
            vm.disarm_delivery();
        }
        Some(vector)
    })?;

    trap::simulate_vm_int(vm, regs, vector);
    log::trace!("vm `{}`: injected vector {vector:#04x}", vm.name());
    Some(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_init_sequence_lands_in_normal() {
        let mut pic = VPic::new(0, 0);
        assert!(!pic.command_write(0x11)); // ICW1, ICW4 follows
        pic.data_write(0x20); // ICW2: base
        pic.data_write(0x04); // ICW3: cascade on line 2
        pic.data_write(0x01); // ICW4: 8086 mode
        assert_eq!(pic.state, PicState::Normal);
        assert_eq!(pic.base, 0x20);
        assert_eq!(pic.link, 0x04);
        assert_eq!(pic.icw4, 0x01);
    }

    #[test]
    fn icw4_is_skipped_when_not_requested() {
        let mut pic = VPic::new(0, 0);
        pic.command_write(0x10);
        pic.data_write(0x08);
        pic.data_write(0x02);
        assert_eq!(pic.state, PicState::Normal);
        // The next data write must be an OCW1 again.
        pic.data_write(0xFD);
        assert_eq!(pic.mask, 0xFD);
    }

    #[test]
    fn eoi_clears_in_service_state() {
        let mut pic = VPic::new(0x08, 0);
        pic.isr = 0b0001_0000;
        assert!(pic.command_write(0x20)); // non-specific EOI
        assert_eq!(pic.isr, 0);
        pic.isr = 0b0000_0100;
        assert!(pic.command_write(0x62)); // specific EOI, line 2
        assert_eq!(pic.isr, 0);
    }

    #[test]
    fn rotate_commands_are_ignored() {
        let mut pic = VPic::new(0x08, 0);
        pic.isr = 0b1000_0000;
        assert!(!pic.command_write(0x80)); // rotate in auto-EOI mode
        assert!(!pic.command_write(0xC0)); // set priority
        assert_eq!(pic.isr, 0b1000_0000);
    }

    #[test]
    fn command_reads_follow_ocw3_then_reset() {
        let mut pic = VPic::new(0x08, 0);
        pic.irr = 0x05;
        pic.isr = 0x02;
        pic.command_write(0x0B); // read ISR next
        assert_eq!(pic.command_read(), 0x02);
        // back to the power-on default of IRR
        assert_eq!(pic.command_read(), 0x05);
        pic.command_write(0x0A); // read IRR next
        assert_eq!(pic.command_read(), 0x05);
    }

    #[test]
    fn data_read_always_returns_the_mask() {
        let mut pic = VPic::new(0x08, 0);
        pic.data_write(0xA5);
        assert_eq!(pic.data_read(), 0xA5);
        pic.irr = 0xFF;
        assert_eq!(pic.data_read(), 0xA5);
    }
}
