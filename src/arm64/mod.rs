//! ARM64 table-based unwinding.

#[cfg(test)]
mod tests;

pub mod codes;
pub mod full;
pub mod packed;

use crate::arch::{Architecture, FunctionEntry, UnwindEnv, VirtualUnwindResult};
use crate::context::{Arm64Context, Arm64ContextPointers, CONTEXT_UNWOUND_TO_CALL};
use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::nt::HandlerType;

use self::codes::Restore;
use self::full::XData;
use self::packed::PackedInfo;

/// `ARM64_RUNTIME_FUNCTION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeFunction {
    pub begin: u32,
    /// Packed unwind data, or with `Flag` zero, the RVA of an `.xdata`
    /// record.
    pub data: u32,
}

impl RuntimeFunction {
    pub const SIZE: u64 = 8;

    pub fn read(mem: &dyn Memory, address: u64) -> Result<Self> {
        Ok(Self {
            begin: mem.read_u32(address)?,
            data: mem.read_u32(address + 4)?,
        })
    }

    pub fn flag(&self) -> u8 {
        (self.data & 3) as u8
    }

    pub fn packed(&self) -> Option<PackedInfo> {
        (self.flag() != 0).then(|| PackedInfo::from_bits(self.data))
    }

    /// Length of the function in instructions.
    pub fn function_length(&self, mem: &dyn Memory, base: u64) -> Result<u32> {
        match self.packed() {
            Some(info) => Ok(info.function_length),
            None => XData::function_length(mem, base + self.data as u64),
        }
    }
}

/// Unwinding of native ARM64 code.
#[derive(Debug, Clone, Copy, Default)]
pub struct Arm64;

impl Architecture for Arm64 {
    type Context = Arm64Context;
    type ContextPointers = Arm64ContextPointers;
    type RuntimeFunction = RuntimeFunction;

    const NAME: &'static str = "aarch64";
    const FRAME_ALIGNMENT: u64 = 8;

    fn runtime_function_size(&self, _env: &UnwindEnv<'_>, _pc: u64) -> u64 {
        RuntimeFunction::SIZE
    }

    fn read_runtime_function(
        &self,
        env: &UnwindEnv<'_>,
        _pc: u64,
        address: u64,
    ) -> Result<RuntimeFunction> {
        RuntimeFunction::read(env.mem, address)
    }

    fn function_range(
        &self,
        env: &UnwindEnv<'_>,
        base: u64,
        function: &RuntimeFunction,
    ) -> Result<(u64, u64)> {
        let start = base.wrapping_add(function.begin as u64);
        let len = function.function_length(env.mem, base)?;
        Ok((start, start.wrapping_add(4 * len as u64)))
    }

    fn virtual_unwind(
        &self,
        env: &UnwindEnv<'_>,
        handler_type: HandlerType,
        base: u64,
        pc: u64,
        function: Option<&FunctionEntry<RuntimeFunction>>,
        context: &mut Arm64Context,
        pointers: Option<&mut Arm64ContextPointers>,
    ) -> Result<VirtualUnwindResult> {
        virtual_unwind(
            env,
            handler_type,
            base,
            pc,
            function.map(|f| &f.function),
            context,
            pointers,
        )
    }

    fn pc(context: &Arm64Context) -> u64 {
        context.pc
    }

    fn set_pc(context: &mut Arm64Context, pc: u64) {
        context.pc = pc;
    }

    fn sp(context: &Arm64Context) -> u64 {
        context.sp
    }

    fn set_return_value(context: &mut Arm64Context, value: u64) {
        context.x[0] = value;
    }

    fn unwound_to_call(context: &Arm64Context) -> bool {
        context.context_flags & CONTEXT_UNWOUND_TO_CALL != 0
    }

    fn call_instruction_size(&self, _env: &UnwindEnv<'_>, _pc: u64) -> u64 {
        4
    }

    fn apply_jump_buffer(
        &self,
        env: &UnwindEnv<'_>,
        context: &mut Arm64Context,
        jump_buffer: u64,
    ) -> Result<()> {
        apply_jump_buffer(env.mem, context, jump_buffer)
    }
}

/// `RtlVirtualUnwind2` for ARM64 code. The handler is reported whatever
/// `handler_type` asks for; the caller filters on the frame's flags.
#[instrument(level = "trace", skip(env, function, context, pointers), fields(sp = context.sp))]
pub fn virtual_unwind(
    env: &UnwindEnv<'_>,
    _handler_type: HandlerType,
    base: u64,
    pc: u64,
    function: Option<&RuntimeFunction>,
    context: &mut Arm64Context,
    pointers: Option<&mut Arm64ContextPointers>,
) -> Result<VirtualUnwindResult> {
    if function.is_none() && pc == context.lr() {
        return Err(Error::BadLeaf { pc });
    }
    context.context_flags |= CONTEXT_UNWOUND_TO_CALL;

    let mut result = VirtualUnwindResult::default();
    let mut final_pc_from_lr = true;
    let mut restore = Restore {
        mem: env.mem,
        context: &mut *context,
        pointers,
    };

    match function {
        None => trace!("leaf function"),
        Some(function) => {
            let offset = (pc.wrapping_sub(base) as u32).wrapping_sub(function.begin) / 4;
            if let Some(info) = function.packed() {
                packed::unwind(&mut restore, &info, offset)?;
            } else {
                let xdata = XData::read(env.mem, base + function.data as u64)?;
                trace!("{xdata}");
                if let Some((handler, data)) = full::unwind(
                    &mut restore,
                    env.config,
                    &xdata,
                    base,
                    offset,
                    &mut final_pc_from_lr,
                )? {
                    result.handler = Some(handler);
                    result.handler_data = data;
                }
            }
        }
    }

    if final_pc_from_lr {
        context.pc = context.lr();
    }
    result.establisher_frame = context.sp;
    Ok(result)
}

/// `_JUMP_BUFFER` offsets.
mod jump_buffer {
    pub const X19: u64 = 0x10;
    pub const FP: u64 = 0x60;
    pub const LR: u64 = 0x68;
    pub const SP: u64 = 0x70;
    pub const FPCR: u64 = 0x78;
    pub const FPSR: u64 = 0x7c;
    pub const D8: u64 = 0x80;
}

fn apply_jump_buffer(mem: &dyn Memory, context: &mut Arm64Context, buf: u64) -> Result<()> {
    use jump_buffer::*;

    for i in 0..10 {
        context.x[19 + i] = mem.read_u64(buf + X19 + i as u64 * 8)?;
    }
    context.set_fp(mem.read_u64(buf + FP)?);
    context.set_lr(mem.read_u64(buf + LR)?);
    context.sp = mem.read_u64(buf + SP)?;
    context.fpcr = mem.read_u32(buf + FPCR)?;
    context.fpsr = mem.read_u32(buf + FPSR)?;
    for i in 0..8 {
        context.v[8 + i] = mem.read_u64(buf + D8 + i as u64 * 8)? as u128;
    }
    context.pc = context.lr();
    Ok(())
}
