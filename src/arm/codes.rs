//! ARM (Thumb-2) unwind codes. Unlike ARM64, skipping is measured in bytes
//! of prolog or epilog instructions rather than in codes.

use core::fmt;

use crate::config::UnwindConfig;
use crate::context::{ArmContext, ArmContextPointers, CONTEXT_UNWOUND_TO_CALL};
use crate::error::Result;
use crate::memory::Memory;

#[rustfmt::skip]
const CODE_LEN: [u8; 256] = [
/* 00 */ 1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
/* 20 */ 1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
/* 40 */ 1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
/* 60 */ 1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
/* 80 */ 2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
/* a0 */ 2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
/* c0 */ 1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
/* e0 */ 1,1,1,1,1,1,1,1,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,3,4,3,4,1,1,1,1,1,
];

/// Size of the Thumb instruction each code stands for.
#[rustfmt::skip]
const INSTR_LEN: [u8; 256] = [
/* 00 */ 2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
/* 20 */ 2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
/* 40 */ 2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
/* 60 */ 2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
/* 80 */ 4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,
/* a0 */ 4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,4,
/* c0 */ 2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,4,4,4,4,4,4,4,4,
/* e0 */ 4,4,4,4,4,4,4,4,4,4,4,4,2,2,0,4,0,0,0,0,0,4,4,2,2,4,4,2,4,2,4,0,
];

/// Offsets in the ARM `CONTEXT`.
const CONTEXT_R4_OFFSET: u64 = 0x14;
const CONTEXT_LR_OFFSET: u64 = 0x3c;
const CONTEXT_D_OFFSET: u64 = 0x50;

const MSFT_OP_MACHINE_FRAME: u8 = 1;
const MSFT_OP_CONTEXT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `add sp,sp,#n`, in bytes.
    AddSp(u32),
    /// `pop {...}`: bit n for rn, r0-r12.
    PopMask { mask: u16, lr: bool },
    /// `mov sp,rN`
    MovSp(u8),
    /// `pop {r4-rN}`
    PopRange { last: u8, lr: bool },
    /// `vpop {dFirst-dLast}`
    VPop { first: u8, last: u8 },
    /// `ldr lr,[sp],#n`
    LdrLr(u32),
    /// Microsoft specific custom frame.
    Custom(u8),
    Nop,
    /// `bx lr` ending an epilog.
    EndBx,
    /// `b` ending an epilog with a tail call.
    EndB,
    End,
    Unknown,
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Code {
    pub address: u64,
    pub byte: u8,
    /// Bytes of Thumb code the instruction this code undoes occupies.
    pub instr_len: u32,
    pub op: Op,
}

pub fn decode(bytes: &[u8], address: u64) -> Vec<Code> {
    let mut codes = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let byte = bytes[pos];
        let len = CODE_LEN[byte as usize] as usize;
        let instr_len = INSTR_LEN[byte as usize] as u32;
        let code_address = address + pos as u64;
        let Some(code) = bytes.get(pos..pos + len) else {
            codes.push(Code {
                address: code_address,
                byte,
                instr_len,
                op: Op::Truncated,
            });
            break;
        };
        let val = code.iter().fold(0u32, |val, b| val << 8 | *b as u32);

        let op = match byte {
            0x00..=0x7f => Op::AddSp(4 * (val & 0x7f)),
            0x80..=0xbf => Op::PopMask {
                mask: (val & 0x1fff) as u16,
                lr: val & 0x2000 != 0,
            },
            0xc0..=0xcf => Op::MovSp((val & 0xf) as u8),
            0xd0..=0xd7 => Op::PopRange {
                last: (val & 3) as u8 + 4,
                lr: val & 4 != 0,
            },
            0xd8..=0xdf => Op::PopRange {
                last: (val & 3) as u8 + 8,
                lr: val & 4 != 0,
            },
            0xe0..=0xe7 => Op::VPop {
                first: 8,
                last: (val & 7) as u8 + 8,
            },
            0xe8..=0xeb => Op::AddSp(4 * (val & 0x3ff)),
            0xec..=0xed => Op::PopMask {
                mask: (val & 0xff) as u16,
                lr: val & 0x100 != 0,
            },
            0xee => Op::Custom((val & 0xff) as u8),
            0xef if val & 0xff <= 0x0f => Op::LdrLr(4 * (val & 0xf)),
            0xef..=0xf4 => Op::Unknown,
            0xf5 => Op::VPop {
                first: ((val & 0xf0) >> 4) as u8,
                last: (val & 0xf) as u8,
            },
            0xf6 => Op::VPop {
                first: ((val & 0xf0) >> 4) as u8 + 16,
                last: (val & 0xf) as u8 + 16,
            },
            0xf7 | 0xf9 => Op::AddSp(4 * (val & 0xffff)),
            0xf8 | 0xfa => Op::AddSp(4u32.wrapping_mul(val & 0xff_ffff)),
            0xfb | 0xfc => Op::Nop,
            0xfd => Op::EndBx,
            0xfe => Op::EndB,
            0xff => Op::End,
        };
        codes.push(Code {
            address: code_address,
            byte,
            instr_len,
            op,
        });
        pos += len;
    }
    codes
}

/// Bytes of code the sequence covers. An epilog's final branch counts when
/// `include_end` is set.
pub fn sequence_len(codes: &[Code], include_end: bool) -> u32 {
    let mut len = 0;
    for code in codes {
        match code.op {
            Op::EndBx | Op::EndB => {
                if include_end {
                    len += code.instr_len;
                }
                break;
            }
            Op::End => break,
            _ => len += code.instr_len,
        }
    }
    len
}

pub struct Restore<'a, 'c> {
    pub mem: &'a dyn Memory,
    pub context: &'c mut ArmContext,
    pub pointers: Option<&'c mut ArmContextPointers>,
}

impl Restore<'_, '_> {
    fn sp(&self) -> u64 {
        self.context.sp() as u64
    }

    fn bump_sp(&mut self, by: u32) {
        let sp = &mut self.context.r[ArmContext::SP];
        *sp = sp.wrapping_add(by);
    }

    /// Pop r0-r12 by mask; only r4 and up are restored.
    fn pop_mask(&mut self, mask: u16) -> Result<()> {
        for i in 0..=12 {
            if mask & (1 << i) == 0 {
                continue;
            }
            let sp = self.sp();
            if let Some(pointers) = self.pointers.as_deref_mut() {
                if (4..=11).contains(&i) {
                    pointers.r4[i - 4] = Some(sp);
                }
            }
            if i >= 4 {
                self.context.r[i] = self.mem.read_u32(sp)?;
            }
            self.bump_sp(4);
        }
        Ok(())
    }

    fn pop_range(&mut self, last: u8) -> Result<()> {
        for i in 4..=last as usize {
            let sp = self.sp();
            if let Some(pointers) = self.pointers.as_deref_mut() {
                pointers.r4[i - 4] = Some(sp);
            }
            self.context.r[i] = self.mem.read_u32(sp)?;
            self.bump_sp(4);
        }
        Ok(())
    }

    fn pop_lr(&mut self, increment: u32) -> Result<()> {
        let sp = self.sp();
        if let Some(pointers) = self.pointers.as_deref_mut() {
            pointers.lr = Some(sp);
        }
        self.context.r[ArmContext::LR] = self.mem.read_u32(sp)?;
        self.bump_sp(increment);
        Ok(())
    }

    fn pop_fpregs(&mut self, first: u8, last: u8) -> Result<()> {
        for i in first as usize..=last as usize {
            let sp = self.sp();
            if let Some(pointers) = self.pointers.as_deref_mut() {
                if (8..=15).contains(&i) {
                    pointers.d8[i - 8] = Some(sp);
                }
            }
            self.context.d[i] = self.mem.read_u64(sp)?;
            self.bump_sp(8);
        }
        Ok(())
    }

    fn custom(&mut self, config: &UnwindConfig, code: &Code, opcode: u8) -> Result<()> {
        let sp = self.sp();
        match opcode {
            MSFT_OP_MACHINE_FRAME => {
                self.context.r[ArmContext::PC] = self.mem.read_u32(sp + 4)?;
                self.context.r[ArmContext::SP] = self.mem.read_u32(sp)?;
                self.context.context_flags &= !CONTEXT_UNWOUND_TO_CALL;
            }
            MSFT_OP_CONTEXT => {
                *self.context = ArmContext::read(self.mem, sp)?;
                if let Some(pointers) = self.pointers.as_deref_mut() {
                    for (i, slot) in pointers.r4.iter_mut().enumerate() {
                        *slot = Some(sp + CONTEXT_R4_OFFSET + i as u64 * 4);
                    }
                    pointers.lr = Some(sp + CONTEXT_LR_OFFSET);
                    for (i, slot) in pointers.d8.iter_mut().enumerate() {
                        *slot = Some(sp + CONTEXT_D_OFFSET + (8 + i as u64) * 8);
                    }
                }
            }
            _ => config.unsupported_opcode(code.address, code.byte)?,
        }
        Ok(())
    }
}

/// Run `codes`, treating the first `skip` bytes of instructions as not yet
/// executed.
pub fn process(
    restore: &mut Restore<'_, '_>,
    config: &UnwindConfig,
    codes: &[Code],
    skip: u32,
) -> Result<()> {
    let mut skip = skip as i64;
    let mut codes = codes.iter().peekable();
    while skip > 0 {
        match codes.peek() {
            Some(code) if !matches!(code.op, Op::EndBx | Op::EndB | Op::End) => {
                skip -= code.instr_len as i64;
                codes.next();
            }
            _ => break,
        }
    }

    for code in codes {
        trace!("{code}");
        match code.op {
            Op::AddSp(n) => restore.bump_sp(n),
            Op::PopMask { mask, lr } => {
                restore.pop_mask(mask)?;
                if lr {
                    restore.pop_lr(4)?;
                }
            }
            Op::MovSp(reg) => {
                restore.context.r[ArmContext::SP] = restore.context.r[reg as usize]
            }
            Op::PopRange { last, lr } => {
                restore.pop_range(last)?;
                if lr {
                    restore.pop_lr(4)?;
                }
            }
            Op::VPop { first, last } => restore.pop_fpregs(first, last)?,
            Op::LdrLr(n) => restore.pop_lr(n)?,
            Op::Custom(opcode) => restore.custom(config, code, opcode)?,
            Op::Unknown => config.unsupported_opcode(code.address, code.byte)?,
            Op::Nop => {}
            Op::EndBx | Op::EndB | Op::End | Op::Truncated => break,
        }
    }
    Ok(())
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: ", self.address)?;
        let list = |f: &mut fmt::Formatter<'_>, mask: u16, lr: bool| {
            let mut regs: Vec<String> = (0..13)
                .filter(|i| mask & (1 << i) != 0)
                .map(|i| format!("r{i}"))
                .collect();
            if lr {
                regs.push("lr".to_owned());
            }
            write!(f, "pop {{{}}}", regs.join(","))
        };
        match self.op {
            Op::AddSp(n) => write!(f, "add sp,sp,#{n:#x}"),
            Op::PopMask { mask, lr } => list(f, mask, lr),
            Op::MovSp(reg) => write!(f, "mov sp,r{reg}"),
            Op::PopRange { last, lr } => {
                let mask = (4..=last).fold(0u16, |m, i| m | 1 << i);
                list(f, mask, lr)
            }
            Op::VPop { first, last } => write!(f, "vpop {{d{first}-d{last}}}"),
            Op::LdrLr(n) => write!(f, "ldr lr,[sp],#{n:#x}"),
            Op::Custom(MSFT_OP_MACHINE_FRAME) => write!(f, "MSFT_OP_MACHINE_FRAME"),
            Op::Custom(MSFT_OP_CONTEXT) => write!(f, "MSFT_OP_CONTEXT"),
            Op::Custom(n) => write!(f, "MSFT_OP {n:#x}"),
            Op::Nop => write!(f, "nop"),
            Op::EndBx => write!(f, "bx lr"),
            Op::EndB => write!(f, "b"),
            Op::End => write!(f, "end"),
            Op::Unknown => write!(f, "unknown code {:#04x}", self.byte),
            Op::Truncated => write!(f, "truncated code {:#04x}", self.byte),
        }
    }
}
