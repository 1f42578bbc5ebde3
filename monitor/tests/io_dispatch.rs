//! Decoded I/O reaching registered handlers with the right port, width and
//! value.

mod common;

use std::sync::{Arc, Mutex};

use common::{load_code, new_vm, test_frame};
use vm86_api::{Width, VmConfig};
use vm86_monitor::machine::IoHandler;
use vm86_monitor::memory::linear;
use vm86_monitor::trap::{handle_general_protection, TrapOutcome};
use vm86_monitor::Vm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    In(u16, Width),
    Out(u16, Width, u32),
}

/// Returns a fixed value on reads and records every access.
struct ScriptedPort {
    ports: (u16, u16),
    value: u32,
    accesses: Mutex<Vec<Access>>,
}

impl ScriptedPort {
    fn new(low: u16, high: u16, value: u32) -> Arc<Self> {
        Arc::new(Self {
            ports: (low, high),
            value,
            accesses: Mutex::new(Vec::new()),
        })
    }

    fn accesses(&self) -> Vec<Access> {
        self.accesses.lock().unwrap().clone()
    }
}

impl IoHandler for ScriptedPort {
    fn name(&self) -> &str {
        "scripted"
    }

    fn ports(&self) -> (u16, u16) {
        self.ports
    }

    fn port_in(&self, _vm: &Vm, port: u16, width: Width) -> u32 {
        self.accesses.lock().unwrap().push(Access::In(port, width));
        self.value
    }

    fn port_out(&self, _vm: &Vm, port: u16, width: Width, value: u32) {
        self.accesses
            .lock()
            .unwrap()
            .push(Access::Out(port, width, value));
    }
}

#[test]
fn in_al_imm8_reads_the_handler_once() {
    let (machine, _host, vm) = new_vm();
    let handler = ScriptedPort::new(0x78, 0x78, 0x42);
    machine.add_io_handler(None, handler.clone());

    let mut regs = test_frame();
    load_code(&vm, &regs, &[0xE4, 0x78]); // in al, 0x78

    assert_eq!(handle_general_protection(&vm, &mut regs), TrapOutcome::Continue);
    assert_eq!(regs.eax & 0xFF, 0x42);
    assert_eq!(regs.ip(), 2);
    assert_eq!(handler.accesses(), vec![Access::In(0x78, Width::Byte)]);
}

#[test]
fn in_al_dx_reaches_a_high_port() {
    let (machine, _host, vm) = new_vm();
    let handler = ScriptedPort::new(0x378, 0x37F, 0x42);
    machine.add_io_handler(None, handler.clone());

    let mut regs = test_frame();
    regs.edx = 0x378;
    load_code(&vm, &regs, &[0xEC]); // in al, dx

    handle_general_protection(&vm, &mut regs);
    assert_eq!(regs.eax & 0xFF, 0x42);
    assert_eq!(regs.ip(), 1);
    assert_eq!(handler.accesses(), vec![Access::In(0x378, Width::Byte)]);
}

#[test]
fn unclaimed_reads_float_high_at_every_width() {
    let (_machine, _host, vm) = new_vm();

    let mut regs = test_frame();
    load_code(&vm, &regs, &[0xE4, 0x10]); // in al, 0x10
    handle_general_protection(&vm, &mut regs);
    assert_eq!(regs.eax & 0xFF, 0xFF);

    let mut regs = test_frame();
    load_code(&vm, &regs, &[0xE5, 0x10]); // in ax, 0x10
    handle_general_protection(&vm, &mut regs);
    assert_eq!(regs.eax & 0xFFFF, 0xFFFF);

    let mut regs = test_frame();
    load_code(&vm, &regs, &[0x66, 0xE5, 0x10]); // in eax, 0x10
    handle_general_protection(&vm, &mut regs);
    assert_eq!(regs.eax, 0xFFFF_FFFF);
    assert_eq!(regs.ip(), 3);
}

#[test]
fn unclaimed_write_is_dropped() {
    let (_machine, _host, vm) = new_vm_logging();
    let mut regs = test_frame();
    regs.eax = 0x5A;
    load_code(&vm, &regs, &[0xE6, 0x10]); // out 0x10, al
    assert_eq!(handle_general_protection(&vm, &mut regs), TrapOutcome::Continue);
    assert_eq!(regs.ip(), 2);
}

fn new_vm_logging() -> (Arc<vm86_monitor::Machine>, Arc<common::MockHost>, Arc<Vm>) {
    let mut config = VmConfig::new_default();
    config.log_unclaimed_ports = true;
    common::new_vm_with_config(config)
}

#[test]
fn out_carries_the_accumulator_value() {
    let (machine, _host, vm) = new_vm();
    let handler = ScriptedPort::new(0x3C0, 0x3C0, 0);
    machine.add_io_handler(None, handler.clone());

    let mut regs = test_frame();
    regs.eax = 0xABCD_1234;
    regs.edx = 0x3C0;
    load_code(&vm, &regs, &[0xEF]); // out dx, ax
    handle_general_protection(&vm, &mut regs);

    assert_eq!(
        handler.accesses(),
        vec![Access::Out(0x3C0, Width::Word, 0x1234)]
    );
}

#[test]
fn local_handlers_shadow_global_ones() {
    let (machine, _host, vm) = new_vm();
    let global = ScriptedPort::new(0x60, 0x60, 0x11);
    let local = ScriptedPort::new(0x60, 0x60, 0x22);
    machine.add_io_handler(None, global.clone());
    machine.add_io_handler(Some(&vm), local.clone());

    let mut regs = test_frame();
    load_code(&vm, &regs, &[0xE4, 0x60]);
    handle_general_protection(&vm, &mut regs);

    assert_eq!(regs.eax & 0xFF, 0x22);
    assert!(global.accesses().is_empty());

    machine.remove_io_handler(Some(&vm), &(local as Arc<dyn IoHandler>));
    let mut regs = test_frame();
    load_code(&vm, &regs, &[0xE4, 0x60]);
    handle_general_protection(&vm, &mut regs);
    assert_eq!(regs.eax & 0xFF, 0x11);
}

#[test]
fn rep_outsw_sends_every_element() {
    let (machine, _host, vm) = new_vm();
    let handler = ScriptedPort::new(0x1F0, 0x1F0, 0);
    machine.add_io_handler(None, handler.clone());

    let mut regs = test_frame();
    regs.edx = 0x1F0;
    regs.ds = 0x0300;
    regs.esi = 0x0010;
    regs.ecx = 3;
    {
        let mut memory = vm.memory().lock();
        for (i, word) in [0x1111u16, 0x2222, 0x3333].iter().enumerate() {
            memory.write_u16(linear(0x0300, 0x0010 + 2 * i as u32), *word);
        }
    }
    load_code(&vm, &regs, &[0xF3, 0x6F]); // rep outsw

    handle_general_protection(&vm, &mut regs);

    assert_eq!(
        handler.accesses(),
        vec![
            Access::Out(0x1F0, Width::Word, 0x1111),
            Access::Out(0x1F0, Width::Word, 0x2222),
            Access::Out(0x1F0, Width::Word, 0x3333),
        ]
    );
    assert_eq!(regs.ecx, 0);
    assert_eq!(regs.esi, 0x0016);
    assert_eq!(regs.ip(), 2);
}

#[test]
fn rep_insb_masks_the_counter_at_16_bits() {
    let (machine, _host, vm) = new_vm();
    let handler = ScriptedPort::new(0x1F0, 0x1F0, 0x7E);
    machine.add_io_handler(None, handler.clone());

    let mut regs = test_frame();
    regs.edx = 0x1F0;
    regs.es = 0x0400;
    regs.edi = 0x0020;
    // Only CX counts without an address-size prefix; the upper half must
    // survive untouched.
    regs.ecx = 0x7FFF_0002;
    load_code(&vm, &regs, &[0xF3, 0x6C]); // rep insb

    handle_general_protection(&vm, &mut regs);

    assert_eq!(handler.accesses().len(), 2);
    assert_eq!(regs.ecx, 0x7FFF_0000);
    assert_eq!(regs.edi, 0x0022);
    let mut memory = vm.memory().lock();
    assert_eq!(memory.read_u16(linear(0x0400, 0x0020)), 0x7E7E);
}

#[test]
fn rep_insw_with_address_size_uses_ecx() {
    let (machine, _host, vm) = new_vm();
    let handler = ScriptedPort::new(0x1F0, 0x1F0, 0xBEEF);
    machine.add_io_handler(None, handler.clone());

    let mut regs = test_frame();
    regs.edx = 0x1F0;
    regs.es = 0x0400;
    regs.edi = 0x0000;
    regs.ecx = 4;
    load_code(&vm, &regs, &[0xF3, 0x67, 0x6D]); // rep insw (32-bit addressing)

    handle_general_protection(&vm, &mut regs);

    assert_eq!(handler.accesses().len(), 4);
    assert_eq!(regs.ecx, 0);
    assert_eq!(regs.edi, 8);
    assert_eq!(regs.ip(), 3);
}

#[test]
fn direction_flag_walks_backwards() {
    let (machine, _host, vm) = new_vm();
    let handler = ScriptedPort::new(0x1F0, 0x1F0, 0);
    machine.add_io_handler(None, handler.clone());

    let mut regs = test_frame();
    regs.eflags |= vm86_api::regs::FLAG_DF;
    regs.edx = 0x1F0;
    regs.ds = 0x0300;
    regs.esi = 0x0010;
    load_code(&vm, &regs, &[0x6E]); // outsb
    handle_general_protection(&vm, &mut regs);

    assert_eq!(regs.esi, 0x000F);
}

#[test]
fn rep_with_zero_count_transfers_nothing() {
    let (machine, _host, vm) = new_vm();
    let handler = ScriptedPort::new(0x1F0, 0x1F0, 0);
    machine.add_io_handler(None, handler.clone());

    let mut regs = test_frame();
    regs.edx = 0x1F0;
    regs.ecx = 0;
    load_code(&vm, &regs, &[0xF3, 0x6E]); // rep outsb
    handle_general_protection(&vm, &mut regs);

    assert!(handler.accesses().is_empty());
    assert_eq!(regs.ecx, 0);
    assert_eq!(regs.ip(), 2);
}
