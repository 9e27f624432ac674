//! 32-bit ARM (Thumb-2) table-based unwinding.


pub mod codes;
pub mod full;
pub mod packed;

use crate::arch::{Architecture, FunctionEntry, UnwindEnv, VirtualUnwindResult};
use crate::context::{ArmContext, ArmContextPointers, CONTEXT_UNWOUND_TO_CALL};
use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::nt::HandlerType;

use self::codes::Restore;
use self::full::XData;
use self::packed::PackedInfo;

/// ARM `RUNTIME_FUNCTION`. `begin` has the Thumb bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeFunction {
    pub begin: u32,
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

    pub fn start(&self) -> u32 {
        self.begin & !1
    }

    pub fn packed(&self) -> Option<PackedInfo> {
        (self.data & 3 != 0).then(|| PackedInfo::from_bits(self.data))
    }

    /// Length of the function in halfwords.
    pub fn function_length(&self, mem: &dyn Memory, base: u64) -> Result<u32> {
        match self.packed() {
            Some(info) => Ok(info.function_length),
            None => XData::function_length(mem, base + self.data as u64),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Arm;

impl Architecture for Arm {
    type Context = ArmContext;
    type ContextPointers = ArmContextPointers;
    type RuntimeFunction = RuntimeFunction;

    const NAME: &'static str = "arm";
    const FRAME_ALIGNMENT: u64 = 4;

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
        let start = base.wrapping_add(function.start() as u64);
        let len = function.function_length(env.mem, base)?;
        Ok((start, start.wrapping_add(2 * len as u64)))
    }

    fn virtual_unwind(
        &self,
        env: &UnwindEnv<'_>,
        handler_type: HandlerType,
        base: u64,
        pc: u64,
        function: Option<&FunctionEntry<RuntimeFunction>>,
        context: &mut ArmContext,
        pointers: Option<&mut ArmContextPointers>,
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

    fn pc(context: &ArmContext) -> u64 {
        context.pc() as u64
    }

    fn set_pc(context: &mut ArmContext, pc: u64) {
        context.r[ArmContext::PC] = pc as u32;
    }

    fn sp(context: &ArmContext) -> u64 {
        context.sp() as u64
    }

    fn set_return_value(context: &mut ArmContext, value: u64) {
        context.r[0] = value as u32;
    }

    fn unwound_to_call(context: &ArmContext) -> bool {
        context.context_flags & CONTEXT_UNWOUND_TO_CALL != 0
    }

    fn call_instruction_size(&self, _env: &UnwindEnv<'_>, _pc: u64) -> u64 {
        2
    }

    fn apply_jump_buffer(
        &self,
        env: &UnwindEnv<'_>,
        context: &mut ArmContext,
        jump_buffer: u64,
    ) -> Result<()> {
        apply_jump_buffer(env.mem, context, jump_buffer)
    }
}

/// `RtlVirtualUnwind2` for ARM code.
#[instrument(level = "trace", skip(env, function, context, pointers), fields(sp = context.sp()))]
pub fn virtual_unwind(
    env: &UnwindEnv<'_>,
    _handler_type: HandlerType,
    base: u64,
    pc: u64,
    function: Option<&RuntimeFunction>,
    context: &mut ArmContext,
    pointers: Option<&mut ArmContextPointers>,
) -> Result<VirtualUnwindResult> {
    context.r[ArmContext::PC] = 0;
    if function.is_none() && pc == context.lr() as u64 {
        return Err(Error::BadLeaf { pc });
    }

    let mut result = VirtualUnwindResult::default();
    let mut restore = Restore {
        mem: env.mem,
        context: &mut *context,
        pointers,
    };

    match function {
        None => trace!("leaf function"),
        Some(function) => {
            // byte offset into the function; the Thumb bit is set on return
            // addresses and on `begin` but not on a faulting pc
            let offset = ((pc & !1).wrapping_sub(base) as u32).wrapping_sub(function.start());
            if let Some(info) = function.packed() {
                packed::unwind(&mut restore, env.config, &info, offset)?;
            } else {
                let xdata = XData::read(env.mem, base + function.data as u64)?;
                trace!("{xdata}");
                if let Some((handler, data)) =
                    full::unwind(&mut restore, env.config, &xdata, base, offset)?
                {
                    result.handler = Some(handler);
                    result.handler_data = data;
                }
            }
        }
    }

    if context.pc() == 0 {
        context.r[ArmContext::PC] = context.lr();
        context.context_flags |= CONTEXT_UNWOUND_TO_CALL;
    }
    result.establisher_frame = context.sp() as u64;
    Ok(result)
}

/// `_JUMP_BUFFER` offsets.
mod jump_buffer {
    pub const R4: u64 = 0x04;
    pub const SP: u64 = 0x24;
    pub const PC: u64 = 0x28;
    pub const FPSCR: u64 = 0x2c;
    pub const D8: u64 = 0x30;
}

fn apply_jump_buffer(mem: &dyn Memory, context: &mut ArmContext, buf: u64) -> Result<()> {
    use jump_buffer::*;

    for i in 0..8 {
        context.r[4 + i] = mem.read_u32(buf + R4 + i as u64 * 4)?;
    }
    context.r[ArmContext::SP] = mem.read_u32(buf + SP)?;
    context.r[ArmContext::PC] = mem.read_u32(buf + PC)?;
    context.fpscr = mem.read_u32(buf + FPSCR)?;
    for i in 0..8 {
        context.d[8 + i] = mem.read_u64(buf + D8 + i as u64 * 8)?;
    }
    Ok(())
}
