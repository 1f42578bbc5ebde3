//! Decodes the instruction a guest trapped on into a small tagged
//! instruction set. Only the opcodes real-mode guests are seen trapping
//! with are understood; everything else decodes to [`Insn::Unknown`] and is
//! dealt with by the emulator's default arm.

use vm86_api::{SegReg, Width};

/// Longest x86 instruction; the fetch window the emulator hands us.
pub const MAX_INSN_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rep {
    #[default]
    None,
    /// F3: REP / REPE.
    Rep,
    /// F2: REPNE. The string I/O instructions ignore the distinction.
    RepNe,
}

/// Legacy prefixes accumulated in front of an opcode.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prefixes {
    pub operand32: bool,
    pub address32: bool,
    pub segment: Option<SegReg>,
    pub rep: Rep,
}

impl Prefixes {
    pub fn repeat(&self) -> bool {
        self.rep != Rep::None
    }
}

/// Where an I/O instruction takes its port number from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Imm(u8),
    Dx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    In { width: Width, port: Port },
    Out { width: Width, port: Port },
    Ins { width: Width },
    Outs { width: Width },
    Cli,
    Sti,
    Pushf,
    Popf,
    Iret,
    Int { vector: u8 },
    Int3,
    Hlt,
    /// 0F 00 / 0F 01: the protected-mode system group. Never emulated;
    /// reflected into the guest as an invalid opcode.
    SystemGroup { opcode: u8 },
    Unknown { opcode: u8 },
}

#[derive(Debug, Clone, Copy)]
pub struct Decoded {
    pub insn: Insn,
    pub prefixes: Prefixes,
    /// Total instruction length, prefixes included.
    pub len: u16,
}

fn byte(code: &[u8], at: usize) -> u8 {
    code.get(at).copied().unwrap_or(0)
}

/// Consumes prefix bytes; returns the accumulated prefixes and the offset
/// of the opcode byte.
fn prefixes(code: &[u8]) -> (Prefixes, usize) {
    let mut p = Prefixes::default();
    let mut at = 0;
    while at < MAX_INSN_LEN {
        match byte(code, at) {
            0x66 => p.operand32 = true,
            0x67 => p.address32 = true,
            0x26 => p.segment = Some(SegReg::Es),
            0x2E => p.segment = Some(SegReg::Cs),
            0x36 => p.segment = Some(SegReg::Ss),
            0x3E => p.segment = Some(SegReg::Ds),
            0x64 => p.segment = Some(SegReg::Fs),
            0x65 => p.segment = Some(SegReg::Gs),
            0xF0 => {} // LOCK changes nothing we emulate
            0xF3 => p.rep = Rep::Rep,
            0xF2 => p.rep = Rep::RepNe,
            _ => break,
        }
        at += 1;
    }
    (p, at)
}

/// Decodes the instruction at the start of `code` (the bytes fetched at the
/// guest's CS:IP).
pub fn decode(code: &[u8]) -> Decoded {
    let (p, at) = prefixes(code);
    let opcode = byte(code, at);
    let wide = Width::word_or_dword(p.operand32);

    let (insn, extra) = match opcode {
        0xE4 => (
            Insn::In {
                width: Width::Byte,
                port: Port::Imm(byte(code, at + 1)),
            },
            1,
        ),
        0xE5 => (
            Insn::In {
                width: wide,
                port: Port::Imm(byte(code, at + 1)),
            },
            1,
        ),
        0xEC => (
            Insn::In {
                width: Width::Byte,
                port: Port::Dx,
            },
            0,
        ),
        0xED => (
            Insn::In {
                width: wide,
                port: Port::Dx,
            },
            0,
        ),
        0xE6 => (
            Insn::Out {
                width: Width::Byte,
                port: Port::Imm(byte(code, at + 1)),
            },
            1,
        ),
        0xE7 => (
            Insn::Out {
                width: wide,
                port: Port::Imm(byte(code, at + 1)),
            },
            1,
        ),
        0xEE => (
            Insn::Out {
                width: Width::Byte,
                port: Port::Dx,
            },
            0,
        ),
        0xEF => (
            Insn::Out {
                width: wide,
                port: Port::Dx,
            },
            0,
        ),
        0x6C => (Insn::Ins { width: Width::Byte }, 0),
        0x6D => (Insn::Ins { width: wide }, 0),
        0x6E => (Insn::Outs { width: Width::Byte }, 0),
        0x6F => (Insn::Outs { width: wide }, 0),
        0xFA => (Insn::Cli, 0),
        0xFB => (Insn::Sti, 0),
        0x9C => (Insn::Pushf, 0),
        0x9D => (Insn::Popf, 0),
        0xCF => (Insn::Iret, 0),
        0xCC => (Insn::Int3, 0),
        0xCD => (
            Insn::Int {
                vector: byte(code, at + 1),
            },
            1,
        ),
        0xF4 => (Insn::Hlt, 0),
        0x0F if byte(code, at + 1) <= 0x01 => (
            Insn::SystemGroup {
                opcode: byte(code, at + 1),
            },
            1,
        ),
        other => (Insn::Unknown { opcode: other }, 0),
    };

    Decoded {
        insn,
        prefixes: p,
        len: (at + 1 + extra) as u16,
    }
}

/// Length of a 16- or 32-bit mod/rm byte plus its displacement, without the
/// mod/rm byte itself.
fn modrm_len(modrm: u8, address32: bool) -> usize {
    let mode = modrm >> 6;
    let rm = modrm & 7;
    if address32 {
        let sib = if mode != 3 && rm == 4 { 1 } else { 0 };
        match mode {
            0 if rm == 5 => 4,
            0 => sib,
            1 => sib + 1,
            2 => sib + 4,
            _ => 0,
        }
    } else {
        match mode {
            0 if rm == 6 => 2,
            0 => 0,
            1 => 1,
            2 => 2,
            _ => 0,
        }
    }
}

/// Estimates the length of an instruction we do not emulate, so a probe of
/// the read-only adapter window can be stepped over. Covers the loads,
/// stores, compares and string moves guests are seen scanning ROM with; an
/// opcode outside that set is counted as a bare opcode and logged.
pub fn skip_len(code: &[u8]) -> u16 {
    let (p, at) = prefixes(code);
    let opcode = byte(code, at);
    let imm16_32 = if p.operand32 { 4 } else { 2 };
    let moffs = if p.address32 { 4 } else { 2 };

    let tail = match opcode {
        // mov/arith/test r/m,r and r,r/m forms
        0x00..=0x03 | 0x08..=0x0B | 0x20..=0x23 | 0x28..=0x2B | 0x30..=0x33 | 0x38..=0x3B
        | 0x84 | 0x85 | 0x88..=0x8B => 1 + modrm_len(byte(code, at + 1), p.address32),
        // grp1 imm forms
        0x80 | 0x82 | 0x83 => 1 + modrm_len(byte(code, at + 1), p.address32) + 1,
        0x81 => 1 + modrm_len(byte(code, at + 1), p.address32) + imm16_32,
        // mov r/m, imm
        0xC6 => 1 + modrm_len(byte(code, at + 1), p.address32) + 1,
        0xC7 => 1 + modrm_len(byte(code, at + 1), p.address32) + imm16_32,
        // grp3: TEST r/m,imm carries an immediate, the rest do not
        0xF6 | 0xF7 => {
            let modrm = byte(code, at + 1);
            let imm = match (modrm >> 3) & 7 {
                0 | 1 => {
                    if opcode == 0xF6 {
                        1
                    } else {
                        imm16_32
                    }
                }
                _ => 0,
            };
            1 + modrm_len(modrm, p.address32) + imm
        }
        // mov accumulator <-> moffs
        0xA0..=0xA3 => moffs,
        // movs/cmps/stos/lods/scas
        0xA4..=0xA7 | 0xAA..=0xAF => 0,
        // movzx/movsx
        0x0F if matches!(byte(code, at + 1), 0xB6 | 0xB7 | 0xBE | 0xBF) => {
            1 + 1 + modrm_len(byte(code, at + 2), p.address32)
        }
        other => {
            log::warn!("skipping unrecognized probe opcode {other:#04x} as one byte");
            0
        }
    };

    (at + 1 + tail) as u16
}
