//! ARM64 unwind codes: decoding the byte stream and applying each code to a
//! context.

use core::fmt;

use crate::arch::pac_auth;
use crate::arm64ec::context_x64_to_arm;
use crate::config::UnwindConfig;
use crate::context::{
    Arm64Context, Arm64ContextPointers, X64Context, CONTEXT_UNWOUND_TO_CALL,
};
use crate::error::{Error, Result};
use crate::memory::Memory;

/// Size in bytes of the code starting with each byte value.
#[rustfmt::skip]
const CODE_LEN: [u8; 256] = [
/* 00 */ 1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
/* 20 */ 1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
/* 40 */ 1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
/* 60 */ 1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
/* 80 */ 1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
/* a0 */ 1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
/* c0 */ 2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
/* e0 */ 4,1,2,1,1,1,1,3,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
];

/// Offset of `X19` in `ARM64_NT_CONTEXT`.
const CONTEXT_X_OFFSET: u64 = 0x08;
const CONTEXT_V_OFFSET: u64 = 0x110;
/// Offset of `Xmm0` in an ARM64EC context.
const EC_CONTEXT_XMM_OFFSET: u64 = 0x1a0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `alloc_s`, `alloc_m`, `alloc_l`: bytes to pop.
    Alloc(u32),
    /// `stp x19,x20,[sp,#-(n*8)]!`
    SaveR19R20X(u8),
    /// `stp x29,lr,[sp,#(n*8)]`
    SaveFpLr(u8),
    /// `stp x29,lr,[sp,#-((n+1)*8)]!`
    SaveFpLrX(u8),
    SaveRegp { reg: u8, offset: u8 },
    SaveRegpX { reg: u8, offset: u8 },
    SaveReg { reg: u8, offset: u8 },
    SaveRegX { reg: u8, offset: u8 },
    SaveLrPair { reg: u8, offset: u8 },
    SaveFregp { reg: u8, offset: u8 },
    SaveFregpX { reg: u8, offset: u8 },
    SaveFreg { reg: u8, offset: u8 },
    SaveFregX { reg: u8, offset: u8 },
    SetFp,
    AddFp(u8),
    Nop,
    End,
    EndC,
    SaveNext,
    /// The two operand bytes of `save_any_reg`.
    SaveAnyReg(u8, u8),
    MachineFrame,
    Context,
    EcContext,
    ClearUnwoundToCall,
    PacSignLr,
    Unknown,
    /// A code running past the end of the stream.
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Code {
    pub address: u64,
    pub byte: u8,
    pub op: Op,
}

impl Code {
    /// Codes describing custom stack frames do not correspond to a prolog
    /// instruction.
    fn is_custom(&self) -> bool {
        self.byte & 0xf8 == 0xe8
    }
}

/// Decode `bytes`, which live at `address`.
pub fn decode(bytes: &[u8], address: u64) -> Vec<Code> {
    let mut codes = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let byte = bytes[pos];
        let len = CODE_LEN[byte as usize] as usize;
        let code_address = address + pos as u64;
        let Some(code) = bytes.get(pos..pos + len) else {
            codes.push(Code {
                address: code_address,
                byte,
                op: Op::Truncated,
            });
            break;
        };
        let val = if len > 1 {
            (code[0] as u32) << 8 | code[1] as u32
        } else {
            byte as u32
        };
        let reg = |shift: u32, mask: u32| ((val >> shift) & mask) as u8;

        let op = match byte {
            0x00..=0x1f => Op::Alloc(16 * (val & 0x1f)),
            0x20..=0x3f => Op::SaveR19R20X((val & 0x1f) as u8),
            0x40..=0x7f => Op::SaveFpLr((val & 0x3f) as u8),
            0x80..=0xbf => Op::SaveFpLrX((val & 0x3f) as u8),
            0xc0..=0xc7 => Op::Alloc(16 * (val & 0x7ff)),
            0xc8..=0xcb => Op::SaveRegp {
                reg: 19 + reg(6, 0xf),
                offset: (val & 0x3f) as u8,
            },
            0xcc..=0xcf => Op::SaveRegpX {
                reg: 19 + reg(6, 0xf),
                offset: (val & 0x3f) as u8,
            },
            0xd0..=0xd3 => Op::SaveReg {
                reg: 19 + reg(6, 0xf),
                offset: (val & 0x3f) as u8,
            },
            0xd4..=0xd5 => Op::SaveRegX {
                reg: 19 + reg(5, 0xf),
                offset: (val & 0x1f) as u8,
            },
            0xd6..=0xd7 => Op::SaveLrPair {
                reg: 19 + 2 * reg(6, 0x7),
                offset: (val & 0x3f) as u8,
            },
            0xd8..=0xd9 => Op::SaveFregp {
                reg: 8 + reg(6, 0x7),
                offset: (val & 0x3f) as u8,
            },
            0xda..=0xdb => Op::SaveFregpX {
                reg: 8 + reg(6, 0x7),
                offset: (val & 0x3f) as u8,
            },
            0xdc..=0xdd => Op::SaveFreg {
                reg: 8 + reg(6, 0x7),
                offset: (val & 0x3f) as u8,
            },
            0xde => Op::SaveFregX {
                reg: 8 + reg(5, 0x7),
                offset: (val & 0x1f) as u8,
            },
            0xe0 => Op::Alloc(16 * ((code[1] as u32) << 16 | (code[2] as u32) << 8 | code[3] as u32)),
            0xe1 => Op::SetFp,
            0xe2 => Op::AddFp((val & 0xff) as u8),
            0xe3 => Op::Nop,
            0xe4 => Op::End,
            0xe5 => Op::EndC,
            0xe6 => Op::SaveNext,
            0xe7 => Op::SaveAnyReg(code[1], code[2]),
            0xe9 => Op::MachineFrame,
            0xea => Op::Context,
            0xeb => Op::EcContext,
            0xec => Op::ClearUnwoundToCall,
            0xfc => Op::PacSignLr,
            _ => Op::Unknown,
        };
        codes.push(Code {
            address: code_address,
            byte,
            op,
        });
        pos += len;
    }
    codes
}

/// How many prolog or epilog instructions the sequence starting at `codes`
/// describes.
pub fn sequence_len(codes: &[Code]) -> u32 {
    codes
        .iter()
        .take_while(|c| !matches!(c.op, Op::End | Op::EndC))
        .filter(|c| !c.is_custom())
        .count() as u32
}

/// A context being unwound, together with where its registers came from.
pub struct Restore<'a, 'c> {
    pub mem: &'a dyn Memory,
    pub context: &'c mut Arm64Context,
    pub pointers: Option<&'c mut Arm64ContextPointers>,
}

impl Restore<'_, '_> {
    fn set_x(&mut self, reg: u32, address: u64) -> Result<()> {
        if reg > 30 {
            return Err(Error::malformed(address, format!("restore of x{reg}")));
        }
        self.context.x[reg as usize] = self.mem.read_u64(address)?;
        if let Some(pointers) = self.pointers.as_deref_mut() {
            if reg >= 19 {
                pointers.x19[reg as usize - 19] = Some(address);
            }
        }
        Ok(())
    }

    fn set_d8(&mut self, reg: u32, address: u64) {
        if let Some(pointers) = self.pointers.as_deref_mut() {
            if (8..16).contains(&reg) {
                pointers.d8[reg as usize - 8] = Some(address);
            }
        }
    }

    /// Load `count` registers from `pos` slots above sp. A negative `pos` is
    /// a pre-indexed store: the registers are at sp, which is then popped.
    pub fn restore_regs(&mut self, reg: u32, count: u32, pos: i32) -> Result<()> {
        let offset = pos.max(0) as u64;
        let sp = self.context.sp;
        for i in 0..count {
            self.set_x(reg + i, sp.wrapping_add(8 * (i as u64 + offset)))?;
        }
        if pos < 0 {
            self.context.sp = self.context.sp.wrapping_add(8 * (-pos) as u64);
        }
        Ok(())
    }

    pub fn restore_fpregs(&mut self, reg: u32, count: u32, pos: i32) -> Result<()> {
        let offset = pos.max(0) as u64;
        let sp = self.context.sp;
        for i in 0..count {
            let n = reg + i;
            let address = sp.wrapping_add(8 * (i as u64 + offset));
            let v = self.context.v.get_mut(n as usize).ok_or_else(|| {
                Error::malformed(address, format!("restore of d{n}"))
            })?;
            *v = (*v & !(u64::MAX as u128)) | self.mem.read_u64(address)? as u128;
            self.set_d8(n, address);
        }
        if pos < 0 {
            self.context.sp = self.context.sp.wrapping_add(8 * (-pos) as u64);
        }
        Ok(())
    }

    pub fn restore_qregs(&mut self, reg: u32, count: u32, pos: i32) -> Result<()> {
        let offset = pos.max(0) as u64;
        let sp = self.context.sp;
        for i in 0..count {
            let n = reg + i;
            let address = sp.wrapping_add(16 * (i as u64 + offset));
            let value = self.mem.read_u128(address)?;
            let v = self.context.v.get_mut(n as usize).ok_or_else(|| {
                Error::malformed(address, format!("restore of q{n}"))
            })?;
            *v = value;
            self.set_d8(n, address);
        }
        if pos < 0 {
            self.context.sp = self.context.sp.wrapping_add(16 * (-pos) as u64);
        }
        Ok(())
    }

    /// `save_any_reg`: `reg` carries the pre-index flag in bit 5, `kind`
    /// selects X, D or Q registers.
    pub fn restore_any_reg(&mut self, reg: u8, count: u32, kind: u8, pos: i32) -> Result<()> {
        let mut pos = pos;
        if reg & 0x20 != 0 {
            pos = -pos - 1;
        }
        let reg = (reg & 0x1f) as u32;
        match kind {
            0 => {
                if count > 1 || pos < 0 {
                    pos *= 2;
                }
                self.restore_regs(reg, count, pos)
            }
            1 => {
                if count > 1 || pos < 0 {
                    pos *= 2;
                }
                self.restore_fpregs(reg, count, pos)
            }
            2 => self.restore_qregs(reg, count, pos),
            _ => Ok(()),
        }
    }

    pub fn pac_auth(&mut self) {
        let lr = pac_auth(self.context.lr(), self.context.sp);
        self.context.set_lr(lr);
    }

    fn keep_unwound_flag(&mut self, flags: u32, source_flags: u32) {
        self.context.context_flags = flags | (source_flags & CONTEXT_UNWOUND_TO_CALL);
    }
}

/// Run `codes`, skipping the first `skip` of them. Returns whether the
/// caller's pc still has to be taken from lr.
pub fn process(
    restore: &mut Restore<'_, '_>,
    config: &UnwindConfig,
    codes: &[Code],
    mut skip: u32,
) -> Result<bool> {
    let mut final_pc_from_lr = true;
    let mut save_next = 2;

    let mut codes = codes.iter().peekable();
    while skip > 0 {
        match codes.peek() {
            Some(code) if code.op != Op::End => {
                codes.next();
                skip -= 1;
            }
            _ => break,
        }
    }

    for code in codes {
        trace!("{code}");
        let ctx = &mut *restore.context;
        match code.op {
            Op::Alloc(size) => ctx.sp = ctx.sp.wrapping_add(size as u64),
            Op::SaveR19R20X(n) => restore.restore_regs(19, save_next, -(n as i32))?,
            Op::SaveFpLr(n) => restore.restore_regs(29, 2, n as i32)?,
            Op::SaveFpLrX(n) => restore.restore_regs(29, 2, -(n as i32) - 1)?,
            Op::SaveRegp { reg, offset } => {
                restore.restore_regs(reg as u32, save_next, offset as i32)?
            }
            Op::SaveRegpX { reg, offset } => {
                restore.restore_regs(reg as u32, save_next, -(offset as i32) - 1)?
            }
            Op::SaveReg { reg, offset } => restore.restore_regs(reg as u32, 1, offset as i32)?,
            Op::SaveRegX { reg, offset } => {
                restore.restore_regs(reg as u32, 1, -(offset as i32) - 1)?
            }
            Op::SaveLrPair { reg, offset } => {
                restore.restore_regs(reg as u32, 1, offset as i32)?;
                restore.restore_regs(30, 1, offset as i32 + 1)?;
            }
            Op::SaveFregp { reg, offset } => {
                restore.restore_fpregs(reg as u32, save_next, offset as i32)?
            }
            Op::SaveFregpX { reg, offset } => {
                restore.restore_fpregs(reg as u32, save_next, -(offset as i32) - 1)?
            }
            Op::SaveFreg { reg, offset } => restore.restore_fpregs(reg as u32, 1, offset as i32)?,
            Op::SaveFregX { reg, offset } => {
                restore.restore_fpregs(reg as u32, 1, -(offset as i32) - 1)?
            }
            Op::SetFp => ctx.sp = ctx.fp(),
            Op::AddFp(n) => ctx.sp = ctx.fp().wrapping_sub(8 * n as u64),
            Op::Nop | Op::EndC => {}
            Op::End => break,
            Op::SaveNext => {
                save_next += 2;
                continue;
            }
            Op::SaveAnyReg(reg, pos) => {
                let count = if reg & 0x40 != 0 { save_next } else { 1 };
                restore.restore_any_reg(reg, count, pos >> 6, (pos & 0x3f) as i32)?;
            }
            Op::MachineFrame => {
                let sp = ctx.sp;
                ctx.pc = restore.mem.read_u64(sp.wrapping_add(8))?;
                ctx.sp = restore.mem.read_u64(sp)?;
                ctx.context_flags &= !CONTEXT_UNWOUND_TO_CALL;
                final_pc_from_lr = false;
            }
            Op::Context => {
                let sp = ctx.sp;
                let flags = ctx.context_flags & !CONTEXT_UNWOUND_TO_CALL;
                let source = Arm64Context::read(restore.mem, sp)?;
                let source_flags = source.context_flags;
                *restore.context = source;
                restore.keep_unwound_flag(flags, source_flags);
                if let Some(pointers) = restore.pointers.as_deref_mut() {
                    for (i, slot) in pointers.x19.iter_mut().take(10).enumerate() {
                        let offset = CONTEXT_X_OFFSET + (19 + i as u64) * 8;
                        *slot = Some(sp.wrapping_add(offset));
                    }
                    for (i, slot) in pointers.d8.iter_mut().enumerate() {
                        let offset = CONTEXT_V_OFFSET + (8 + i as u64) * 16;
                        *slot = Some(sp.wrapping_add(offset));
                    }
                }
                final_pc_from_lr = false;
            }
            Op::EcContext => {
                let sp = ctx.sp;
                let flags = ctx.context_flags & !CONTEXT_UNWOUND_TO_CALL;
                let source = X64Context::read(restore.mem, sp)?;
                context_x64_to_arm(restore.context, &source);
                restore.keep_unwound_flag(flags, source.context_flags);
                if let Some(pointers) = restore.pointers.as_deref_mut() {
                    for (i, slot) in pointers.d8.iter_mut().enumerate() {
                        let offset = EC_CONTEXT_XMM_OFFSET + (8 + i as u64) * 16;
                        *slot = Some(sp.wrapping_add(offset));
                    }
                }
                final_pc_from_lr = false;
            }
            Op::ClearUnwoundToCall => {
                ctx.pc = ctx.lr();
                ctx.context_flags &= !CONTEXT_UNWOUND_TO_CALL;
                final_pc_from_lr = false;
            }
            Op::PacSignLr => restore.pac_auth(),
            Op::Truncated => break,
            Op::Unknown => {
                config.unsupported_opcode(code.address, code.byte)?;
                break;
            }
        }
        save_next = 2;
    }
    Ok(final_pc_from_lr)
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: ", self.address)?;
        match self.op {
            Op::Alloc(size) => write!(f, "sub sp,sp,#{size:#x}"),
            Op::SaveR19R20X(n) => write!(f, "stp x19,x20,[sp,#-{:#x}]!", n as u32 * 8),
            Op::SaveFpLr(n) => write!(f, "stp x29,lr,[sp,#{:#x}]", n as u32 * 8),
            Op::SaveFpLrX(n) => write!(f, "stp x29,lr,[sp,#-{:#x}]!", (n as u32 + 1) * 8),
            Op::SaveRegp { reg, offset } => {
                write!(f, "stp x{reg},x{},[sp,#{:#x}]", reg + 1, offset as u32 * 8)
            }
            Op::SaveRegpX { reg, offset } => {
                write!(f, "stp x{reg},x{},[sp,#-{:#x}]!", reg + 1, (offset as u32 + 1) * 8)
            }
            Op::SaveReg { reg, offset } => write!(f, "str x{reg},[sp,#{:#x}]", offset as u32 * 8),
            Op::SaveRegX { reg, offset } => {
                write!(f, "str x{reg},[sp,#-{:#x}]!", (offset as u32 + 1) * 8)
            }
            Op::SaveLrPair { reg, offset } => {
                write!(f, "stp x{reg},lr,[sp,#{:#x}]", offset as u32 * 8)
            }
            Op::SaveFregp { reg, offset } => {
                write!(f, "stp d{reg},d{},[sp,#{:#x}]", reg + 1, offset as u32 * 8)
            }
            Op::SaveFregpX { reg, offset } => {
                write!(f, "stp d{reg},d{},[sp,#-{:#x}]!", reg + 1, (offset as u32 + 1) * 8)
            }
            Op::SaveFreg { reg, offset } => write!(f, "str d{reg},[sp,#{:#x}]", offset as u32 * 8),
            Op::SaveFregX { reg, offset } => {
                write!(f, "str d{reg},[sp,#-{:#x}]!", (offset as u32 + 1) * 8)
            }
            Op::SetFp => write!(f, "mov x29,sp"),
            Op::AddFp(n) => write!(f, "add x29,sp,#{:#x}", n as u32 * 8),
            Op::Nop => write!(f, "nop"),
            Op::End => write!(f, "end"),
            Op::EndC => write!(f, "end_c"),
            Op::SaveNext => write!(f, "save_next"),
            Op::SaveAnyReg(reg, pos) => write!(f, "save_any_reg {reg:#x},{pos:#x}"),
            Op::MachineFrame => write!(f, "MSFT_OP_MACHINE_FRAME"),
            Op::Context => write!(f, "MSFT_OP_CONTEXT"),
            Op::EcContext => write!(f, "MSFT_OP_EC_CONTEXT"),
            Op::ClearUnwoundToCall => write!(f, "MSFT_OP_CLEAR_UNWOUND_TO_CALL"),
            Op::PacSignLr => write!(f, "pac_sign_lr"),
            Op::Unknown => write!(f, "unknown code {:#04x}", self.byte),
            Op::Truncated => write!(f, "truncated code {:#04x}", self.byte),
        }
    }
}
