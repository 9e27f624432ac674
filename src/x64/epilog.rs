//! Epilog recognition.
//!
//! Version 1 unwind info does not describe epilogs, so a pc inside one is
//! detected by matching the machine code against the only shapes the x64
//! calling convention allows:
//!
//! ```text
//! [add $n,%rsp | lea n(%reg),%rsp]
//! pop %reg ...
//! ret | ret $n | rep ret | jmp outside the function | jmp *mem
//! ```

use super::RuntimeFunction;
use crate::context::{X64Context, X64ContextPointers};
use crate::error::Result;
use crate::memory::Memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpilogInstr {
    AddRsp(i32),
    /// `lea disp(%base),%rsp`
    Lea { base: u8, disp: i32 },
    Pop(u8),
    /// `ret $n`
    RetPop(u16),
    /// Any other terminator: returns to, or tail calls with, the address on
    /// top of the stack.
    Ret,
}

struct Code<'a> {
    mem: &'a dyn Memory,
    pc: u64,
}

impl Code<'_> {
    fn u8(&self, at: u64) -> Option<u8> {
        self.mem.read_u8(self.pc.wrapping_add(at)).ok()
    }

    fn u16(&self, at: u64) -> Option<u16> {
        self.mem.read_u16(self.pc.wrapping_add(at)).ok()
    }

    fn i32(&self, at: u64) -> Option<i32> {
        self.mem.read_u32(self.pc.wrapping_add(at)).ok().map(|v| v as i32)
    }
}

/// Decode the epilog starting at `pc`, or `None` if `pc` is not in one.
pub fn decode(
    mem: &dyn Memory,
    pc: u64,
    base: u64,
    function: &RuntimeFunction,
) -> Option<Vec<EpilogInstr>> {
    let code = Code { mem, pc };
    let mut instrs = Vec::new();
    let mut at = 0u64;

    // add or lea must come first and carry a rex.W prefix
    let prefix = code.u8(0)?;
    if prefix & 0xf8 == 0x48 {
        match code.u8(1)? {
            0x81 => {
                if prefix != 0x48 || code.u8(2)? != 0xc4 {
                    return None;
                }
                instrs.push(EpilogInstr::AddRsp(code.i32(3)?));
                at = 7;
            }
            0x83 => {
                if prefix != 0x48 || code.u8(2)? != 0xc4 {
                    return None;
                }
                instrs.push(EpilogInstr::AddRsp(code.u8(3)? as i8 as i32));
                at = 4;
            }
            0x8d => {
                let modrm = code.u8(2)?;
                // no rex.R or rex.X, destination %rsp, no SIB byte
                if prefix & 0x06 != 0 || (modrm >> 3) & 7 != 4 || modrm & 7 == 4 {
                    return None;
                }
                let base_reg = (modrm & 7) + (prefix & 1) * 8;
                match modrm >> 6 {
                    1 => {
                        let disp = code.u8(3)? as i8 as i32;
                        instrs.push(EpilogInstr::Lea { base: base_reg, disp });
                        at = 4;
                    }
                    2 => {
                        instrs.push(EpilogInstr::Lea {
                            base: base_reg,
                            disp: code.i32(3)?,
                        });
                        at = 7;
                    }
                    _ => return None,
                }
            }
            _ => {}
        }
    }

    let in_function = |target: u64| {
        let rva = target.wrapping_sub(base);
        rva >= function.begin as u64 && rva < function.end as u64
    };

    loop {
        let mut rex = 0;
        let mut op = code.u8(at)?;
        if op & 0xf0 == 0x40 {
            rex = op & 0x0f;
            at += 1;
            op = code.u8(at)?;
        }

        match op {
            0x58..=0x5f => {
                instrs.push(EpilogInstr::Pop(op - 0x58 + (rex & 1) * 8));
                at += 1;
            }
            0xc2 => {
                instrs.push(EpilogInstr::RetPop(code.u16(at + 1)?));
                return Some(instrs);
            }
            0xc3 => break,
            0xe9 => {
                let target = pc
                    .wrapping_add(at + 5)
                    .wrapping_add(code.i32(at + 1)? as i64 as u64);
                if in_function(target) {
                    return None;
                }
                break;
            }
            0xeb => {
                let target = pc
                    .wrapping_add(at + 2)
                    .wrapping_add(code.u8(at + 1)? as i8 as i64 as u64);
                if in_function(target) {
                    return None;
                }
                break;
            }
            // rep ret
            0xf3 if code.u8(at + 1)? == 0xc3 => break,
            0xff => {
                if rex != 0 && rex != 8 {
                    return None;
                }
                let modrm = code.u8(at + 1)?;
                if modrm == 0x25 || (rex != 0 && (modrm >> 3) & 7 == 4) {
                    break;
                }
                return None;
            }
            _ => return None,
        }
    }
    instrs.push(EpilogInstr::Ret);
    Some(instrs)
}

/// Emulate a decoded epilog.
pub fn apply(
    mem: &dyn Memory,
    instrs: &[EpilogInstr],
    context: &mut X64Context,
    mut pointers: Option<&mut X64ContextPointers>,
) -> Result<()> {
    for instr in instrs {
        trace!("epilog: {instr:x?}");
        match *instr {
            EpilogInstr::AddRsp(n) => context.rsp = context.rsp.wrapping_add(n as i64 as u64),
            EpilogInstr::Lea { base, disp } => {
                context.rsp = context.gpr(base).wrapping_add(disp as i64 as u64)
            }
            EpilogInstr::Pop(reg) => {
                *context.gpr_mut(reg) = mem.read_u64(context.rsp)?;
                if let Some(pointers) = pointers.as_deref_mut() {
                    pointers.gpr[reg as usize] = Some(context.rsp);
                }
                context.rsp = context.rsp.wrapping_add(8);
            }
            EpilogInstr::RetPop(n) => {
                context.rip = mem.read_u64(context.rsp)?;
                context.rsp = context.rsp.wrapping_add(8 + n as u64);
            }
            EpilogInstr::Ret => {
                context.rip = mem.read_u64(context.rsp)?;
                context.rsp = context.rsp.wrapping_add(8);
            }
        }
    }
    Ok(())
}
