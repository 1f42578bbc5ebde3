//! Exception entry points for a guest task and the instruction emulator
//! behind them.
//!
//! The embedding kernel points the guest task's general-protection,
//! invalid-opcode, page-fault and redirected-exception handlers here and
//! passes in the trapped register frame. Everything operates on that frame
//! copy; the embedder writes it back on resume.

use vm86_api::regs::{FLAG_ALWAYS, FLAG_DF, FLAG_IF, FLAG_TF, GUEST_FLAG_MASK};
use vm86_api::{GuestRegisters, SegReg, Width};
use x86_64::registers::rflags::RFlags;
use x86_64::structures::idt::PageFaultErrorCode;

use crate::decode::{self, Insn, Port, Prefixes, MAX_INSN_LEN};
use crate::machine::Vm;
use crate::memory::linear;
use crate::pic;

/// What the trap path should do with the guest after emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Resume the guest (after `pic::deliver_pending`).
    Continue,
    /// The guest executed HLT; its task is suspended until an interrupt.
    Halted,
    /// The guest did something the monitor cannot handle; its task is
    /// frozen.
    GuestFrozen,
}

/// Entry point for the general-protection exceptions a VM86 guest takes on
/// every privileged or I/O instruction.
pub fn handle_general_protection(vm: &Vm, regs: &mut GuestRegisters) -> TrapOutcome {
    let _scope = vm.fault_scope();
    let code = fetch_code(vm, regs);
    let decoded = decode::decode(&code);
    execute(vm, regs, decoded.insn, &decoded.prefixes, decoded.len)
}

/// Entry point for invalid-opcode exceptions: either the 16-bit service
/// escape (the repurposed ARPL opcode) or a genuine invalid opcode, which
/// is reflected back into the guest.
pub fn handle_invalid_opcode(vm: &Vm, regs: &mut GuestRegisters) -> TrapOutcome {
    let _scope = vm.fault_scope();
    let code = fetch_code(vm, regs);

    if code[0] == 0x63 {
        let service = u16::from_le_bytes([code[1], code[2]]);
        regs.advance_ip(3);
        match vm.machine().lookup_arpl_handler(service) {
            Some(handler) => handler.call(vm, service, regs),
            // No owner: the escape vanishes without a guest-visible error.
            None => log::trace!("vm `{}`: unclaimed service call {service:#06x}", vm.name()),
        }
        return TrapOutcome::Continue;
    }

    simulate_vm_int(vm, regs, 6);
    TrapOutcome::Continue
}

/// Entry point for page faults taken by the guest task.
///
/// `address` is the faulting guest-physical address (the CR2 image).
pub fn handle_page_fault(
    vm: &Vm,
    regs: &mut GuestRegisters,
    address: u64,
    error: PageFaultErrorCode,
) -> TrapOutcome {
    let _scope = vm.fault_scope();
    if vm.fault_depth() > 1 {
        panic!(
            "page fault at {address:#x} nested inside fault handling of vm `{}`",
            vm.name()
        );
    }

    if error.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
        if (0xA_0000..0x10_0000).contains(&address) {
            // A probe of the adapter/BIOS window. Nothing gets mapped; the
            // guest reads whatever is already there and skips ahead.
            let code = fetch_code(vm, regs);
            regs.advance_ip(decode::skip_len(&code));
            return TrapOutcome::Continue;
        }
        log::error!(
            "vm `{}`: protection fault at {address:#x}, frame {regs:#x?}",
            vm.name()
        );
        vm.host().freeze(vm.task());
        return TrapOutcome::GuestFrozen;
    }

    if vm.memory().lock().demand_map(address) {
        // Retry the faulting access against the fresh zeroed page.
        return TrapOutcome::Continue;
    }
    log::error!(
        "vm `{}`: fault beyond guest memory at {address:#x}",
        vm.name()
    );
    vm.host().freeze(vm.task());
    TrapOutcome::GuestFrozen
}

/// Divide-error exceptions become the guest's own INT 0.
pub fn handle_divide_error(vm: &Vm, regs: &mut GuestRegisters) -> TrapOutcome {
    simulate_vm_int(vm, regs, 0);
    TrapOutcome::Continue
}

/// Debug exceptions become the guest's own INT 1.
pub fn handle_debug(vm: &Vm, regs: &mut GuestRegisters) -> TrapOutcome {
    simulate_vm_int(vm, regs, 1);
    TrapOutcome::Continue
}

/// Breakpoint exceptions become the guest's own INT 3.
pub fn handle_breakpoint(vm: &Vm, regs: &mut GuestRegisters) -> TrapOutcome {
    simulate_vm_int(vm, regs, 3);
    TrapOutcome::Continue
}

/// Overflow exceptions become the guest's own INT 4.
pub fn handle_overflow(vm: &Vm, regs: &mut GuestRegisters) -> TrapOutcome {
    simulate_vm_int(vm, regs, 4);
    TrapOutcome::Continue
}

/// Pushes an interrupt frame and vectors the guest through its real-mode
/// IVT. Shared by software INT emulation and hardware injection.
pub fn simulate_vm_int(vm: &Vm, regs: &mut GuestRegisters, vector: u8) {
    let flags = synth_flags(vm, regs);
    let (segment, offset) = vm.memory().lock().ivt_entry(vector);
    let (return_cs, return_ip) = (regs.cs, regs.ip());

    push16(vm, regs, flags as u16);
    push16(vm, regs, return_cs);
    push16(vm, regs, return_ip);

    vm.set_virtual_if(false);
    vm.set_virtual_tf(false);
    pic::if_disabled(vm);

    regs.cs = segment;
    regs.set_ip(offset);
}

fn fetch_code(vm: &Vm, regs: &GuestRegisters) -> [u8; MAX_INSN_LEN] {
    let mut code = [0u8; MAX_INSN_LEN];
    let mut memory = vm.memory().lock();
    for (i, byte) in code.iter_mut().enumerate() {
        let ip = regs.ip().wrapping_add(i as u16);
        *byte = memory.read_u8(linear(regs.cs, u32::from(ip)));
    }
    code
}

fn execute(
    vm: &Vm,
    regs: &mut GuestRegisters,
    insn: Insn,
    prefixes: &Prefixes,
    len: u16,
) -> TrapOutcome {
    match insn {
        Insn::In { width, port } => {
            let port = resolve_port(regs, port);
            let value = io_in(vm, port, width);
            regs.set_acc(width, value);
            regs.advance_ip(len);
        }
        Insn::Out { width, port } => {
            let port = resolve_port(regs, port);
            io_out(vm, port, width, regs.acc(width));
            regs.advance_ip(len);
        }
        Insn::Ins { width } => {
            string_io(vm, regs, prefixes, width, false);
            regs.advance_ip(len);
        }
        Insn::Outs { width } => {
            string_io(vm, regs, prefixes, width, true);
            regs.advance_ip(len);
        }
        Insn::Cli => {
            vm.set_virtual_if(false);
            pic::if_disabled(vm);
            regs.advance_ip(len);
        }
        Insn::Sti => {
            vm.set_virtual_if(true);
            pic::if_enabled(vm);
            regs.advance_ip(len);
            // An STI directly followed by HLT would go to sleep past an
            // interrupt that is already waiting for the one-instruction
            // grace period; run the HLT here so the wakeup cannot be lost.
            let next = vm
                .memory()
                .lock()
                .read_u8(linear(regs.cs, u32::from(regs.ip())));
            if next == 0xF4 {
                regs.advance_ip(1);
                return halt(vm);
            }
        }
        Insn::Pushf => {
            let flags = synth_flags(vm, regs);
            if prefixes.operand32 {
                push32(vm, regs, flags);
            } else {
                push16(vm, regs, flags as u16);
            }
            regs.advance_ip(len);
        }
        Insn::Popf => {
            let value = if prefixes.operand32 {
                pop32(vm, regs)
            } else {
                u32::from(pop16(vm, regs))
            };
            apply_flags(vm, regs, value);
            regs.advance_ip(len);
        }
        Insn::Iret => {
            let (ip, cs, flags) = if prefixes.operand32 {
                let ip = pop32(vm, regs) as u16;
                let cs = pop32(vm, regs) as u16;
                let flags = pop32(vm, regs);
                (ip, cs, flags)
            } else {
                let ip = pop16(vm, regs);
                let cs = pop16(vm, regs);
                let flags = u32::from(pop16(vm, regs));
                (ip, cs, flags)
            };
            regs.set_ip(ip);
            regs.cs = cs;
            apply_flags(vm, regs, flags);
            pic::reevaluate(vm);
        }
        Insn::Int { vector } => {
            regs.advance_ip(len);
            simulate_vm_int(vm, regs, vector);
        }
        Insn::Int3 => {
            regs.advance_ip(len);
            simulate_vm_int(vm, regs, 3);
        }
        Insn::Hlt => {
            regs.advance_ip(len);
            return halt(vm);
        }
        Insn::SystemGroup { opcode } => {
            // 0F 00/0F 01 are never emulated; let the guest's own invalid
            // opcode handler see them.
            log::trace!(
                "vm `{}`: reflecting system instruction 0f {opcode:02x}",
                vm.name()
            );
            simulate_vm_int(vm, regs, 6);
        }
        Insn::Unknown { opcode } => {
            log::error!(
                "vm `{}`: unexpected opcode {opcode:#04x} at {:#06x}:{:#06x}, frame {regs:#x?}",
                vm.name(),
                regs.cs,
                regs.ip()
            );
            if vm.fault_depth() > 1 {
                panic!("unexpected opcode while the monitor owned the cpu");
            }
            // The frame is left at the faulting instruction; whatever the
            // guest already changed stays changed.
            vm.host().freeze(vm.task());
            return TrapOutcome::GuestFrozen;
        }
    }
    TrapOutcome::Continue
}

fn halt(vm: &Vm) -> TrapOutcome {
    vm.set_halted();
    if vm.delivery_armed() {
        // An injection is already queued; the resume path will push it, so
        // the task must not be parked waiting for a wakeup that came and
        // went.
        vm.wake_from_halt();
        return TrapOutcome::Continue;
    }
    vm.host().suspend(vm.task());
    TrapOutcome::Halted
}

fn resolve_port(regs: &GuestRegisters, port: Port) -> u16 {
    match port {
        Port::Imm(value) => u16::from(value),
        Port::Dx => regs.dx(),
    }
}

fn io_in(vm: &Vm, port: u16, width: Width) -> u32 {
    match vm.lookup_io_handler(port) {
        Some(handler) => handler.port_in(vm, port, width) & width.mask(),
        None => {
            if vm.config().log_unclaimed_ports {
                log::warn!("vm `{}`: read from unclaimed port {port:#06x}", vm.name());
            }
            // Floating bus: reads come back all ones.
            width.mask()
        }
    }
}

fn io_out(vm: &Vm, port: u16, width: Width, value: u32) {
    match vm.lookup_io_handler(port) {
        Some(handler) => handler.port_out(vm, port, width, value & width.mask()),
        None => {
            if vm.config().log_unclaimed_ports {
                log::warn!(
                    "vm `{}`: write of {value:#x} to unclaimed port {port:#06x}",
                    vm.name()
                );
            }
        }
    }
}

/// Emulates INS (inbound) or OUTS (outbound), with or without REP.
fn string_io(vm: &Vm, regs: &mut GuestRegisters, prefixes: &Prefixes, width: Width, outbound: bool) {
    let address32 = prefixes.address32;
    let count = if prefixes.repeat() {
        regs.count(address32)
    } else {
        1
    };
    let step = width.bytes();
    let backward = regs.eflags & FLAG_DF != 0;
    let port = regs.dx();

    for _ in 0..count {
        if outbound {
            let seg = regs.seg(prefixes.segment.unwrap_or(SegReg::Ds));
            let value = read_mem(vm, linear(seg, regs.si(address32)), width);
            io_out(vm, port, width, value);
            let si = if backward {
                regs.si(address32).wrapping_sub(step)
            } else {
                regs.si(address32).wrapping_add(step)
            };
            regs.set_si(address32, si);
        } else {
            // INS always stores through ES, overrides notwithstanding.
            let value = io_in(vm, port, width);
            write_mem(vm, linear(regs.es, regs.di(address32)), width, value);
            let di = if backward {
                regs.di(address32).wrapping_sub(step)
            } else {
                regs.di(address32).wrapping_add(step)
            };
            regs.set_di(address32, di);
        }
        if prefixes.repeat() {
            regs.set_count(address32, regs.count(address32).wrapping_sub(1));
        }
    }
}

fn read_mem(vm: &Vm, addr: u64, width: Width) -> u32 {
    let mut memory = vm.memory().lock();
    match width {
        Width::Byte => u32::from(memory.read_u8(addr)),
        Width::Word => u32::from(memory.read_u16(addr)),
        Width::Dword => memory.read_u32(addr),
    }
}

fn write_mem(vm: &Vm, addr: u64, width: Width, value: u32) {
    let mut memory = vm.memory().lock();
    match width {
        Width::Byte => memory.write_u8(addr, value as u8),
        Width::Word => memory.write_u16(addr, value as u16),
        Width::Dword => memory.write_u32(addr, value),
    }
}

/// The FLAGS image the guest is allowed to see: its own arithmetic bits
/// overlaid with the shadow IF/TF.
fn synth_flags(vm: &Vm, regs: &GuestRegisters) -> u32 {
    let mut flags = (regs.eflags & GUEST_FLAG_MASK) | FLAG_ALWAYS;
    let shadow = vm.virtual_flags();
    if shadow.contains(RFlags::INTERRUPT_FLAG) {
        flags |= FLAG_IF;
    }
    if shadow.contains(RFlags::TRAP_FLAG) {
        flags |= FLAG_TF;
    }
    flags
}

/// Applies a FLAGS image the guest restored: arithmetic bits go into the
/// real frame, IF/TF into the shadow, and the delivery hook follows IF.
fn apply_flags(vm: &Vm, regs: &mut GuestRegisters, value: u32) {
    regs.eflags = (regs.eflags & !GUEST_FLAG_MASK) | (value & GUEST_FLAG_MASK);
    vm.set_virtual_if(value & FLAG_IF != 0);
    vm.set_virtual_tf(value & FLAG_TF != 0);
    if value & FLAG_IF != 0 {
        pic::if_enabled(vm);
    } else {
        pic::if_disabled(vm);
    }
}

fn push16(vm: &Vm, regs: &mut GuestRegisters, value: u16) {
    let sp = regs.sp().wrapping_sub(2);
    regs.set_sp(sp);
    vm.memory()
        .lock()
        .write_u16(linear(regs.ss, u32::from(sp)), value);
}

fn pop16(vm: &Vm, regs: &mut GuestRegisters) -> u16 {
    let sp = regs.sp();
    let value = vm.memory().lock().read_u16(linear(regs.ss, u32::from(sp)));
    regs.set_sp(sp.wrapping_add(2));
    value
}

fn push32(vm: &Vm, regs: &mut GuestRegisters, value: u32) {
    let sp = regs.sp().wrapping_sub(4);
    regs.set_sp(sp);
    vm.memory()
        .lock()
        .write_u32(linear(regs.ss, u32::from(sp)), value);
}

fn pop32(vm: &Vm, regs: &mut GuestRegisters) -> u32 {
    let sp = regs.sp();
    let value = vm.memory().lock().read_u32(linear(regs.ss, u32::from(sp)));
    regs.set_sp(sp.wrapping_add(4));
    value
}
