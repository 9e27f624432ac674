//! x86-64 table-based unwinding.


pub mod epilog;
pub mod unwind_info;

use crate::arch::{Architecture, FunctionEntry, UnwindEnv, VirtualUnwindResult};
use crate::context::{X64Context, X64ContextPointers};
use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::nt::HandlerType;

use self::unwind_info::{CodeDisplay, Trailer, UnwindInfo, UnwindOp, UWOP_EPILOG};

pub(crate) const REG_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

/// Indirect descriptors pointing at further indirect descriptors are followed
/// at most this many times.
const MAX_INDIRECTION: usize = 32;

/// `RUNTIME_FUNCTION`. All fields are image relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeFunction {
    pub begin: u32,
    pub end: u32,
    /// The `UNWIND_INFO`, or with bit 0 set, another `RUNTIME_FUNCTION`.
    pub unwind_data: u32,
}

impl RuntimeFunction {
    pub const SIZE: u64 = 12;

    pub fn read(mem: &dyn Memory, address: u64) -> Result<Self> {
        Ok(Self {
            begin: mem.read_u32(address)?,
            end: mem.read_u32(address + 4)?,
            unwind_data: mem.read_u32(address + 8)?,
        })
    }
}

/// Unwinding of native x64 code.
#[derive(Debug, Clone, Copy, Default)]
pub struct X64;

impl Architecture for X64 {
    type Context = X64Context;
    type ContextPointers = X64ContextPointers;
    type RuntimeFunction = RuntimeFunction;

    const NAME: &'static str = "x86_64";
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
        _env: &UnwindEnv<'_>,
        base: u64,
        function: &RuntimeFunction,
    ) -> Result<(u64, u64)> {
        Ok((
            base.wrapping_add(function.begin as u64),
            base.wrapping_add(function.end as u64),
        ))
    }

    fn resolve(
        &self,
        env: &UnwindEnv<'_>,
        base: u64,
        entry: FunctionEntry<RuntimeFunction>,
    ) -> Result<FunctionEntry<RuntimeFunction>> {
        resolve_indirect(env.mem, base, entry)
    }

    fn virtual_unwind(
        &self,
        env: &UnwindEnv<'_>,
        handler_type: HandlerType,
        base: u64,
        pc: u64,
        function: Option<&FunctionEntry<RuntimeFunction>>,
        context: &mut X64Context,
        pointers: Option<&mut X64ContextPointers>,
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

    fn pc(context: &X64Context) -> u64 {
        context.rip
    }

    fn set_pc(context: &mut X64Context, pc: u64) {
        context.rip = pc;
    }

    fn sp(context: &X64Context) -> u64 {
        context.rsp
    }

    fn set_return_value(context: &mut X64Context, value: u64) {
        context.rax = value;
    }

    fn unwound_to_call(_context: &X64Context) -> bool {
        false
    }

    fn call_instruction_size(&self, _env: &UnwindEnv<'_>, _pc: u64) -> u64 {
        0
    }

    fn apply_jump_buffer(
        &self,
        env: &UnwindEnv<'_>,
        context: &mut X64Context,
        jump_buffer: u64,
    ) -> Result<()> {
        apply_jump_buffer(env.mem, context, jump_buffer)
    }
}

/// Follow descriptors whose unwind data points at another descriptor.
pub(crate) fn resolve_indirect(
    mem: &dyn Memory,
    base: u64,
    mut entry: FunctionEntry<RuntimeFunction>,
) -> Result<FunctionEntry<RuntimeFunction>> {
    for _ in 0..MAX_INDIRECTION {
        if entry.function.unwind_data & 1 == 0 {
            return Ok(entry);
        }
        let address = base + (entry.function.unwind_data & !1) as u64;
        trace!(
            "function {:#x}-{:#x} is chained to the entry at {address:#x}",
            base + entry.function.begin as u64,
            base + entry.function.end as u64
        );
        entry = FunctionEntry {
            address,
            function: RuntimeFunction::read(mem, address)?,
        };
    }
    Err(Error::malformed(entry.address, "runtime function chain too deep"))
}

/// `RtlVirtualUnwind2` for x64 code.
#[instrument(level = "trace", skip(env, function, context, pointers), fields(rsp = context.rsp))]
pub fn virtual_unwind(
    env: &UnwindEnv<'_>,
    handler_type: HandlerType,
    base: u64,
    pc: u64,
    function: Option<&RuntimeFunction>,
    context: &mut X64Context,
    mut pointers: Option<&mut X64ContextPointers>,
) -> Result<VirtualUnwindResult> {
    let mem = env.mem;
    let mut frame = context.rsp;
    let mut result = VirtualUnwindResult {
        establisher_frame: context.rsp,
        ..Default::default()
    };

    let Some(function) = function else {
        trace!("leaf function");
        context.rip = mem.read_u64(context.rsp)?;
        context.rsp = context.rsp.wrapping_add(8);
        return Ok(result);
    };

    let mut function = *function;
    let mut machine_frame = false;
    let (info, prolog_offset) = loop {
        let info = UnwindInfo::read(mem, base + function.unwind_data as u64)?;
        trace!("{info}");

        if info.frame_reg != 0 {
            frame = context
                .gpr(info.frame_reg)
                .wrapping_sub(info.frame_offset as u64 * 16);
        }

        let begin = base + function.begin as u64;
        let prolog_offset = if pc >= begin && pc < begin + info.prolog as u64 {
            trace!("inside prolog");
            Some(pc - begin)
        } else {
            if info.count != 0 {
                if let Some(instrs) = epilog::decode(mem, pc, base, &function) {
                    trace!("inside epilog");
                    epilog::apply(mem, &instrs, context, pointers.as_deref_mut())?;
                    result.establisher_frame = if info.frame_reg != 0 {
                        context.rsp.wrapping_sub(8)
                    } else {
                        frame
                    };
                    return Ok(result);
                }
            }
            None
        };

        for code in &info.codes {
            // not executed yet
            if prolog_offset.is_some_and(|offset| offset < code.offset as u64) {
                continue;
            }
            match code.op {
                UnwindOp::PushNonvol { reg } => {
                    let sp = context.rsp;
                    set_gpr(mem, context, pointers.as_deref_mut(), reg, sp)?;
                    context.rsp = context.rsp.wrapping_add(8);
                }
                UnwindOp::Alloc { size } => context.rsp = context.rsp.wrapping_add(size as u64),
                UnwindOp::SetFpreg => {
                    context.rsp = frame;
                    result.establisher_frame = frame;
                }
                UnwindOp::SaveNonvol { reg, offset } => {
                    let address = frame.wrapping_add(offset as u64);
                    set_gpr(mem, context, pointers.as_deref_mut(), reg, address)?;
                }
                UnwindOp::SaveXmm128 { reg, offset } => {
                    let address = frame.wrapping_add(offset as u64);
                    context.flt_save.xmm_registers[reg as usize] = mem.read_u128(address)?;
                    if let Some(pointers) = pointers.as_deref_mut() {
                        pointers.xmm[reg as usize] = Some(address);
                    }
                }
                UnwindOp::PushMachframe { error_code } => {
                    if info.has_chain() {
                        warn!("PUSH_MACHFRAME with chained unwind info");
                        continue;
                    }
                    if code.slot + code.slots < info.count {
                        warn!("PUSH_MACHFRAME is not the last unwind code");
                        continue;
                    }
                    if error_code {
                        context.rsp = context.rsp.wrapping_add(8);
                    }
                    context.rip = mem.read_u64(context.rsp)?;
                    context.rsp = mem.read_u64(context.rsp.wrapping_add(24))?;
                    machine_frame = true;
                }
                UnwindOp::Epilog { .. } if info.version == 2 => {}
                UnwindOp::Epilog { .. } | UnwindOp::Unknown { .. } => {
                    let address = info.address + 4 + code.slot as u64 * 2;
                    trace!("{}", CodeDisplay { info: &info, code });
                    env.config.unsupported_opcode(address, code_number(&code.op))?;
                }
            }
        }

        match info.trailer {
            Trailer::Chain(next) => function = next,
            _ => break (info, prolog_offset),
        }
    };

    if !machine_frame {
        context.rip = mem.read_u64(context.rsp)?;
        context.rsp = context.rsp.wrapping_add(8);
    }
    result.machine_frame_unwound = machine_frame;

    if info.flags & handler_type.bits() == 0 || prolog_offset.is_some() {
        return Ok(result);
    }
    if let Trailer::Handler { rva, data } = info.trailer {
        result.handler = Some(base + rva as u64);
        result.handler_data = data;
    }
    Ok(result)
}

fn code_number(op: &UnwindOp) -> u8 {
    match *op {
        UnwindOp::Unknown { code, .. } => code,
        _ => UWOP_EPILOG,
    }
}

fn set_gpr(
    mem: &dyn Memory,
    context: &mut X64Context,
    pointers: Option<&mut X64ContextPointers>,
    reg: u8,
    address: u64,
) -> Result<()> {
    *context.gpr_mut(reg) = mem.read_u64(address)?;
    if let Some(pointers) = pointers {
        pointers.gpr[reg as usize & 0xf] = Some(address);
    }
    Ok(())
}

/// `_JUMP_BUFFER` offsets.
mod jump_buffer {
    pub const RBX: u64 = 0x08;
    pub const RSP: u64 = 0x10;
    pub const RBP: u64 = 0x18;
    pub const RSI: u64 = 0x20;
    pub const RDI: u64 = 0x28;
    pub const R12: u64 = 0x30;
    pub const RIP: u64 = 0x50;
    pub const MX_CSR: u64 = 0x58;
    pub const FP_CSR: u64 = 0x5c;
    pub const XMM6: u64 = 0x60;
}

fn apply_jump_buffer(mem: &dyn Memory, context: &mut X64Context, buf: u64) -> Result<()> {
    use jump_buffer::*;

    context.rbx = mem.read_u64(buf + RBX)?;
    context.rsp = mem.read_u64(buf + RSP)?;
    context.rbp = mem.read_u64(buf + RBP)?;
    context.rsi = mem.read_u64(buf + RSI)?;
    context.rdi = mem.read_u64(buf + RDI)?;
    for i in 0..4 {
        *context.gpr_mut(12 + i as u8) = mem.read_u64(buf + R12 + i * 8)?;
    }
    context.rip = mem.read_u64(buf + RIP)?;
    context.mx_csr = mem.read_u32(buf + MX_CSR)?;
    context.flt_save.mx_csr = context.mx_csr;
    context.flt_save.control_word = mem.read_u16(buf + FP_CSR)?;
    for i in 0..10 {
        context.flt_save.xmm_registers[6 + i] = mem.read_u128(buf + XMM6 + i as u64 * 16)?;
    }
    Ok(())
}
