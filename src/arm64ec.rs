//! ARM64EC: translation between the x64 view of a thread and the ARM64
//! registers that back it, and the [`Arm64Ec`] unwinding strategy built on it.
//!
//! ARM64EC code keeps its ARM64 registers in fixed x64 slots: integer
//! registers in the x64 general purpose registers, the registers x64 has no
//! room for in the low halves of the x87 slots, and X16/X17 split into 16-bit
//! pieces stored next to them.

use crate::arch::{Architecture, FunctionEntry, UnwindEnv, VirtualUnwindResult};
use crate::arm64::{self, Arm64};
use crate::context::{
    Arm64Context, X64Context, X64ContextPointers, CONTEXT_AMD64_CONTROL,
    CONTEXT_AMD64_FLOATING_POINT, CONTEXT_AMD64_INTEGER, CONTEXT_ARM64_CONTROL,
    CONTEXT_ARM64_FLOATING_POINT, CONTEXT_ARM64_INTEGER, CONTEXT_UNWOUND_TO_CALL,
};
use crate::error::{Error, Result};
use crate::module::{CodeRangeKind, Directory, Module};
use crate::nt::HandlerType;
use crate::x64::{self, X64};

/// (EFLAGS bit, CPSR bit): CF, ZF, SF, OF.
const EFLAGS_CPSR: [(u32, u32); 4] = [
    (0x0001, 0x2000_0000),
    (0x0040, 0x4000_0000),
    (0x0080, 0x8000_0000),
    (0x0800, 0x1000_0000),
];

/// (MXCSR bit, FPSR bit): cumulative exception flags.
const MXCSR_FPSR: [(u32, u32); 6] = [
    (0x0001, 0x0001), // invalid operation
    (0x0004, 0x0002), // divide by zero
    (0x0008, 0x0004), // overflow
    (0x0010, 0x0008), // underflow
    (0x0020, 0x0010), // precision
    (0x0002, 0x0080), // denormal
];

/// (MXCSR bit, FPCR bit) for bits with the same sense on both sides.
const MXCSR_FPCR: [(u32, u32); 4] = [
    (0x0040, 0x0008_0000), // denormals are zero
    (0x4000, 0x0040_0000), // round up
    (0x2000, 0x0080_0000), // round down
    (0x8000, 0x0100_0000), // flush to zero
];

/// (MXCSR mask bit, FPCR trap enable bit). A set mask is a clear enable.
const MXCSR_FPCR_INVERTED: [(u32, u32); 6] = [
    (0x0080, 0x0100), // invalid operation
    (0x0200, 0x0200), // divide by zero
    (0x0400, 0x0400), // overflow
    (0x0800, 0x0800), // underflow
    (0x1000, 0x1000), // precision
    (0x0100, 0x8000), // denormal
];

fn map_bits(value: u32, table: &[(u32, u32)], forward: bool) -> u32 {
    table.iter().fold(0, |acc, &(a, b)| {
        let (from, to) = if forward { (a, b) } else { (b, a) };
        if value & from != 0 {
            acc | to
        } else {
            acc
        }
    })
}

pub fn eflags_to_cpsr(eflags: u32) -> u32 {
    map_bits(eflags, &EFLAGS_CPSR, true)
}

pub fn cpsr_to_eflags(cpsr: u32) -> u32 {
    map_bits(cpsr, &EFLAGS_CPSR, false)
}

pub fn mxcsr_to_fpsr(mxcsr: u32) -> u32 {
    map_bits(mxcsr, &MXCSR_FPSR, true)
}

pub fn mxcsr_to_fpcr(mxcsr: u32) -> u32 {
    let mut fpcr = map_bits(mxcsr, &MXCSR_FPCR, true);
    for &(mask, enable) in &MXCSR_FPCR_INVERTED {
        if mxcsr & mask == 0 {
            fpcr |= enable;
        }
    }
    fpcr
}

pub fn fpcsr_to_mxcsr(fpcr: u32, fpsr: u32) -> u32 {
    let mut mxcsr = map_bits(fpsr, &MXCSR_FPSR, false) | map_bits(fpcr, &MXCSR_FPCR, false);
    for &(mask, enable) in &MXCSR_FPCR_INVERTED {
        if fpcr & enable == 0 {
            mxcsr |= mask;
        }
    }
    mxcsr
}

// Where the registers without an x64 home live: x87 slot index.
const LR_SLOT: usize = 0;
const X6_SLOT: usize = 1;
const X7_SLOT: usize = 2;
const X9_SLOT: usize = 3;
const X10_SLOT: usize = 4;
const X11_SLOT: usize = 5;
const X12_SLOT: usize = 6;
const X15_SLOT: usize = 7;

fn slot_low(ec: &X64Context, slot: usize) -> u64 {
    ec.flt_save.float_registers[slot] as u64
}

/// The 16-bit piece stored right after the 64-bit register in a slot.
fn slot_piece(ec: &X64Context, slot: usize) -> u64 {
    ((ec.flt_save.float_registers[slot] >> 64) & 0xffff) as u64
}

fn set_slot(ec: &mut X64Context, slot: usize, low: u64, piece: u64) {
    ec.flt_save.float_registers[slot] = low as u128 | (((piece & 0xffff) as u128) << 64);
}

/// Build the ARM64 register state from an ARM64EC context.
pub fn context_x64_to_arm(arm: &mut Arm64Context, ec: &X64Context) {
    arm.context_flags =
        CONTEXT_ARM64_CONTROL | CONTEXT_ARM64_INTEGER | CONTEXT_ARM64_FLOATING_POINT;
    arm.cpsr = eflags_to_cpsr(ec.eflags);

    arm.x = [0; 31];
    arm.x[0] = ec.rcx;
    arm.x[1] = ec.rdx;
    arm.x[2] = ec.r8;
    arm.x[3] = ec.r9;
    arm.x[4] = ec.r10;
    arm.x[5] = ec.r11;
    arm.x[6] = slot_low(ec, X6_SLOT);
    arm.x[7] = slot_low(ec, X7_SLOT);
    arm.x[8] = ec.rax;
    arm.x[9] = slot_low(ec, X9_SLOT);
    arm.x[10] = slot_low(ec, X10_SLOT);
    arm.x[11] = slot_low(ec, X11_SLOT);
    arm.x[12] = slot_low(ec, X12_SLOT);
    arm.x[15] = slot_low(ec, X15_SLOT);
    arm.x[16] = slot_piece(ec, LR_SLOT)
        | slot_piece(ec, X6_SLOT) << 16
        | slot_piece(ec, X7_SLOT) << 32
        | slot_piece(ec, X9_SLOT) << 48;
    arm.x[17] = slot_piece(ec, X10_SLOT)
        | slot_piece(ec, X11_SLOT) << 16
        | slot_piece(ec, X12_SLOT) << 32
        | slot_piece(ec, X15_SLOT) << 48;
    arm.x[19] = ec.r12;
    arm.x[20] = ec.r13;
    arm.x[21] = ec.r14;
    arm.x[22] = ec.r15;
    arm.x[25] = ec.rsi;
    arm.x[26] = ec.rdi;
    arm.x[27] = ec.rbx;
    arm.set_fp(ec.rbp);
    arm.set_lr(slot_low(ec, LR_SLOT));
    arm.sp = ec.rsp;
    arm.pc = ec.rip;

    arm.v = [0; 32];
    arm.v[..16].copy_from_slice(&ec.flt_save.xmm_registers);
    arm.fpcr = mxcsr_to_fpcr(ec.mx_csr);
    arm.fpsr = mxcsr_to_fpsr(ec.mx_csr);
}

/// Build an ARM64EC context from ARM64 register state.
pub fn context_arm_to_x64(ec: &mut X64Context, arm: &Arm64Context) {
    *ec = X64Context {
        context_flags: CONTEXT_AMD64_CONTROL
            | CONTEXT_AMD64_INTEGER
            | CONTEXT_AMD64_FLOATING_POINT,
        seg_cs: 0x33,
        seg_ds: 0x2b,
        seg_es: 0x2b,
        seg_fs: 0x53,
        seg_gs: 0x2b,
        seg_ss: 0x2b,
        eflags: 0x202 | cpsr_to_eflags(arm.cpsr),
        rax: arm.x[8],
        rcx: arm.x[0],
        rdx: arm.x[1],
        rbx: arm.x[27],
        rsp: arm.sp,
        rbp: arm.fp(),
        rsi: arm.x[25],
        rdi: arm.x[26],
        r8: arm.x[2],
        r9: arm.x[3],
        r10: arm.x[4],
        r11: arm.x[5],
        r12: arm.x[19],
        r13: arm.x[20],
        r14: arm.x[21],
        r15: arm.x[22],
        rip: arm.pc,
        ..X64Context::default()
    };

    let mxcsr = fpcsr_to_mxcsr(arm.fpcr, arm.fpsr);
    ec.mx_csr = mxcsr;
    ec.flt_save.mx_csr = mxcsr;
    ec.flt_save.mx_csr_mask = 0xffff;
    ec.flt_save.control_word = 0x27f;

    let x16 = arm.x[16];
    let x17 = arm.x[17];
    set_slot(ec, LR_SLOT, arm.lr(), x16);
    set_slot(ec, X6_SLOT, arm.x[6], x16 >> 16);
    set_slot(ec, X7_SLOT, arm.x[7], x16 >> 32);
    set_slot(ec, X9_SLOT, arm.x[9], x16 >> 48);
    set_slot(ec, X10_SLOT, arm.x[10], x17);
    set_slot(ec, X11_SLOT, arm.x[11], x17 >> 16);
    set_slot(ec, X12_SLOT, arm.x[12], x17 >> 32);
    set_slot(ec, X15_SLOT, arm.x[15], x17 >> 48);

    ec.flt_save.xmm_registers.copy_from_slice(&arm.v[..16]);
}

/// A descriptor found in an ARM64EC process: x64 code is described by the
/// exception directory, EC code by the ARM64 table in the image's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcRuntimeFunction {
    X64(x64::RuntimeFunction),
    Arm64(arm64::RuntimeFunction),
}

pub(crate) fn is_ec_code(env: &UnwindEnv<'_>, pc: u64) -> bool {
    env.modules
        .find_module(pc)
        .is_some_and(|module| module.is_ec_code(pc))
}

/// Unwinding in an ARM64EC process. Contexts are always in the x64 layout;
/// frames of EC code are unwound by the ARM64 rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct Arm64Ec;

impl Architecture for Arm64Ec {
    type Context = X64Context;
    type ContextPointers = X64ContextPointers;
    type RuntimeFunction = EcRuntimeFunction;

    const NAME: &'static str = "arm64ec";
    const FRAME_ALIGNMENT: u64 = 8;

    fn runtime_function_size(&self, env: &UnwindEnv<'_>, pc: u64) -> u64 {
        if is_ec_code(env, pc) {
            arm64::RuntimeFunction::SIZE
        } else {
            x64::RuntimeFunction::SIZE
        }
    }

    fn read_runtime_function(
        &self,
        env: &UnwindEnv<'_>,
        pc: u64,
        address: u64,
    ) -> Result<EcRuntimeFunction> {
        Ok(if is_ec_code(env, pc) {
            EcRuntimeFunction::Arm64(arm64::RuntimeFunction::read(env.mem, address)?)
        } else {
            EcRuntimeFunction::X64(x64::RuntimeFunction::read(env.mem, address)?)
        })
    }

    fn function_range(
        &self,
        env: &UnwindEnv<'_>,
        base: u64,
        function: &EcRuntimeFunction,
    ) -> Result<(u64, u64)> {
        match function {
            EcRuntimeFunction::X64(f) => X64.function_range(env, base, f),
            EcRuntimeFunction::Arm64(f) => Arm64.function_range(env, base, f),
        }
    }

    fn resolve(
        &self,
        env: &UnwindEnv<'_>,
        base: u64,
        entry: FunctionEntry<EcRuntimeFunction>,
    ) -> Result<FunctionEntry<EcRuntimeFunction>> {
        let EcRuntimeFunction::X64(function) = entry.function else {
            return Ok(entry);
        };
        let resolved = x64::resolve_indirect(
            env.mem,
            base,
            FunctionEntry {
                address: entry.address,
                function,
            },
        )?;
        Ok(FunctionEntry {
            address: resolved.address,
            function: EcRuntimeFunction::X64(resolved.function),
        })
    }

    fn module_table(&self, _env: &UnwindEnv<'_>, module: &Module, pc: u64) -> Option<Directory> {
        if module.is_ec_code(pc) {
            module.arm64ec.as_ref()?.extra_rfe_table
        } else {
            module.exception_directory
        }
    }

    fn virtual_unwind(
        &self,
        env: &UnwindEnv<'_>,
        handler_type: HandlerType,
        base: u64,
        pc: u64,
        function: Option<&FunctionEntry<EcRuntimeFunction>>,
        context: &mut X64Context,
        pointers: Option<&mut X64ContextPointers>,
    ) -> Result<VirtualUnwindResult> {
        if is_ec_code(env, pc) {
            let function = match function {
                None => None,
                Some(FunctionEntry {
                    function: EcRuntimeFunction::Arm64(f),
                    ..
                }) => Some(f),
                Some(entry) => {
                    return Err(Error::malformed(entry.address, "x64 descriptor for EC code"))
                }
            };
            return unwind_ec_frame(env, handler_type, base, pc, function, context);
        }

        let function = match function {
            None => None,
            Some(FunctionEntry {
                function: EcRuntimeFunction::X64(f),
                ..
            }) => Some(f),
            Some(entry) => {
                return Err(Error::malformed(entry.address, "ARM64 descriptor for x64 code"))
            }
        };
        x64::virtual_unwind(env, handler_type, base, pc, function, context, pointers)
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

    fn unwound_to_call(context: &X64Context) -> bool {
        context.context_flags & CONTEXT_UNWOUND_TO_CALL != 0
    }

    fn call_instruction_size(&self, env: &UnwindEnv<'_>, pc: u64) -> u64 {
        if is_ec_code(env, pc) {
            4
        } else {
            0
        }
    }

    fn apply_jump_buffer(
        &self,
        env: &UnwindEnv<'_>,
        context: &mut X64Context,
        jump_buffer: u64,
    ) -> Result<()> {
        X64.apply_jump_buffer(env, context, jump_buffer)
    }

    /// An x64 frame returning into a native ARM64 thunk is left together with
    /// the thunk.
    fn needs_extra_frame(&self, env: &UnwindEnv<'_>, frame_pc: u64, caller_pc: u64) -> bool {
        if is_ec_code(env, frame_pc) {
            return false;
        }
        env.modules
            .find_module(caller_pc)
            .and_then(|module| module.code_kind(caller_pc))
            == Some(CodeRangeKind::Arm64)
    }
}

/// Unwind a frame of EC code through its ARM64 register view.
fn unwind_ec_frame(
    env: &UnwindEnv<'_>,
    handler_type: HandlerType,
    base: u64,
    pc: u64,
    function: Option<&arm64::RuntimeFunction>,
    context: &mut X64Context,
) -> Result<VirtualUnwindResult> {
    let flags = context.context_flags & !CONTEXT_UNWOUND_TO_CALL;
    let mut arm = Arm64Context::default();
    context_x64_to_arm(&mut arm, context);
    let result = arm64::virtual_unwind(env, handler_type, base, pc, function, &mut arm, None);
    context_arm_to_x64(context, &arm);
    context.context_flags = flags | (arm.context_flags & CONTEXT_UNWOUND_TO_CALL);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_arm() -> Arm64Context {
        let mut arm = Arm64Context {
            context_flags: CONTEXT_ARM64_CONTROL
                | CONTEXT_ARM64_INTEGER
                | CONTEXT_ARM64_FLOATING_POINT,
            cpsr: 0x2000_0000 | 0x8000_0000,
            sp: 0x7fff_0000,
            pc: 0x1_4000_1234,
            // round to minus infinity, overflow and precision traps enabled
            fpcr: 0x0080_0000 | 0x0400 | 0x1000,
            fpsr: 0x0001 | 0x0080,
            ..Default::default()
        };
        for i in 0..31 {
            if ![13, 14, 18, 23, 24, 28].contains(&i) {
                arm.x[i] = 0x1000 + i as u64 * 0x0101_0101_0101;
            }
        }
        for i in 0..16 {
            arm.v[i] = (i as u128) << 70 | 0xabc;
        }
        arm
    }

    #[test]
    fn arm_round_trip() {
        let arm = sample_arm();
        let mut ec = X64Context::default();
        context_arm_to_x64(&mut ec, &arm);

        let mut back = Arm64Context::default();
        context_x64_to_arm(&mut back, &ec);
        similar_asserts::assert_eq!(back, arm);
    }

    #[test]
    fn register_placement() {
        let arm = sample_arm();
        let mut ec = X64Context::default();
        context_arm_to_x64(&mut ec, &arm);

        assert_eq!(ec.rcx, arm.x[0]);
        assert_eq!(ec.rax, arm.x[8]);
        assert_eq!(ec.rbx, arm.x[27]);
        assert_eq!(ec.rbp, arm.fp());
        assert_eq!(ec.r15, arm.x[22]);
        assert_eq!(ec.flt_save.float_registers[0] as u64, arm.lr());
        assert_eq!(
            (ec.flt_save.float_registers[3] >> 64) as u64 & 0xffff,
            arm.x[16] >> 48
        );
        assert_eq!(ec.eflags, 0x202 | 0x1 | 0x80);
        assert_eq!(ec.seg_cs, 0x33);
    }

    #[test]
    fn fp_status_tables() {
        assert_eq!(mxcsr_to_fpsr(0x3f), 0x9f);
        assert_eq!(fpcsr_to_mxcsr(0, 0x9f) & 0x3f, 0x3f);
        // all exceptions masked means no trap enabled
        assert_eq!(mxcsr_to_fpcr(0x1f80), 0);
        assert_eq!(fpcsr_to_mxcsr(0, 0), 0x1f80);
        assert_eq!(mxcsr_to_fpcr(0x1f80 | 0x6000), 0x00c0_0000);
    }

    mod strategy {
        use super::super::*;
        use crate::config::UnwindConfig;
        use crate::memory::SparseMemory;
        use crate::module::{Arm64EcMetadata, CodeRange, ModuleList};

        const BASE: u64 = 0x1_8000_0000;
        const STACK: u64 = 0x7e00;
        const EC_FUNCTION: u64 = BASE + 0x1000;
        const X64_FUNCTION: u64 = BASE + 0x4000;
        const THUNK: u64 = BASE + 0x6000;
        const EC_TABLE: u64 = BASE + 0x8000;
        const X64_TABLE: u64 = BASE + 0x9000;

        fn module() -> Module {
            let range = |start, kind| CodeRange {
                start,
                length: 0x1000,
                kind,
            };
            Module {
                base: BASE,
                size: 0x10000,
                exception_directory: Some(Directory {
                    rva: 0x9000,
                    size: 12,
                }),
                arm64ec: Some(Arm64EcMetadata {
                    code_map: vec![
                        range(0x1000, CodeRangeKind::Arm64Ec),
                        range(0x4000, CodeRangeKind::Amd64),
                        range(0x6000, CodeRangeKind::Arm64),
                    ],
                    extra_rfe_table: Some(Directory {
                        rva: 0x8000,
                        size: 8,
                    }),
                }),
            }
        }

        fn image() -> SparseMemory {
            let mut mem = SparseMemory::new();
            mem.map(BASE, 0x10000);
            mem.map(0x7000, 0x1000);
            // stp x19,x20,[sp,#-16]!; sub sp,sp,#16
            mem.write_u32(EC_TABLE, 0x1000);
            mem.write_u32(EC_TABLE + 4, 1 | 40 << 2 | 2 << 16 | 2 << 23);
            // push rbx
            mem.write_u32(X64_TABLE, 0x4000);
            mem.write_u32(X64_TABLE + 4, 0x4100);
            mem.write_u32(X64_TABLE + 8, 0xa000);
            mem.write(BASE + 0xa000, &[0x01, 0x01, 0x01, 0x00, 0x01, 0x30, 0x00, 0x00]);
            mem
        }

        fn with_env<R>(mem: &SparseMemory, f: impl FnOnce(&UnwindEnv<'_>) -> R) -> R {
            let modules = ModuleList::new();
            modules.load(module());
            let config = UnwindConfig::default();
            f(&UnwindEnv {
                mem,
                modules: &modules,
                config: &config,
            })
        }

        #[test]
        fn ec_code_uses_the_arm64_table() {
            let mem = image();
            with_env(&mem, |env| {
                let module = module();
                assert_eq!(
                    Arm64Ec.module_table(env, &module, EC_FUNCTION),
                    Some(Directory {
                        rva: 0x8000,
                        size: 8
                    })
                );
                assert_eq!(
                    Arm64Ec.module_table(env, &module, X64_FUNCTION),
                    module.exception_directory
                );
                assert_eq!(Arm64Ec.runtime_function_size(env, EC_FUNCTION), 8);
                assert_eq!(Arm64Ec.runtime_function_size(env, X64_FUNCTION), 12);
                assert_eq!(Arm64Ec.call_instruction_size(env, EC_FUNCTION), 4);
                assert_eq!(Arm64Ec.call_instruction_size(env, X64_FUNCTION), 0);
            });
        }

        #[test]
        fn ec_frame_unwinds_through_arm64_view() {
            let mut mem = image();
            mem.write_u64(STACK + 16, 0x1919);
            mem.write_u64(STACK + 24, 0x2020);
            let pc = EC_FUNCTION + 20 * 4;
            let mut context = X64Context {
                rsp: STACK,
                rip: pc,
                ..Default::default()
            };
            set_slot(&mut context, LR_SLOT, X64_FUNCTION + 0x10, 0);

            with_env(&mem, |env| {
                let entry = Arm64Ec
                    .find_function(env, pc, BASE, EC_TABLE, 1)
                    .unwrap()
                    .unwrap();
                assert!(matches!(entry.function, EcRuntimeFunction::Arm64(_)));

                let result = Arm64Ec
                    .virtual_unwind(
                        env,
                        HandlerType::Exception,
                        BASE,
                        pc,
                        Some(&entry),
                        &mut context,
                        None,
                    )
                    .unwrap();
                assert_eq!(result.establisher_frame, STACK + 32);
            });

            // x19 and x20 live in r12 and r13
            assert_eq!(context.r12, 0x1919);
            assert_eq!(context.r13, 0x2020);
            assert_eq!(context.rsp, STACK + 32);
            assert_eq!(context.rip, X64_FUNCTION + 0x10);
            assert!(Arm64Ec::unwound_to_call(&context));
        }

        #[test]
        fn x64_frame_in_hybrid_image() {
            let mut mem = image();
            mem.write_u64(STACK, 0x3333);
            mem.write_u64(STACK + 8, THUNK + 4);
            let pc = X64_FUNCTION + 0x10;
            let mut context = X64Context {
                rsp: STACK,
                rip: pc,
                context_flags: CONTEXT_UNWOUND_TO_CALL,
                ..Default::default()
            };

            with_env(&mem, |env| {
                let entry = Arm64Ec
                    .find_function(env, pc, BASE, X64_TABLE, 1)
                    .unwrap()
                    .unwrap();
                assert!(matches!(entry.function, EcRuntimeFunction::X64(_)));
                Arm64Ec
                    .virtual_unwind(
                        env,
                        HandlerType::Exception,
                        BASE,
                        pc,
                        Some(&entry),
                        &mut context,
                        None,
                    )
                    .unwrap();

                assert!(Arm64Ec.needs_extra_frame(env, pc, context.rip));
                assert!(!Arm64Ec.needs_extra_frame(env, pc, X64_FUNCTION + 0x20));
                assert!(!Arm64Ec.needs_extra_frame(env, EC_FUNCTION, context.rip));
            });

            assert_eq!(context.rbx, 0x3333);
            assert_eq!(context.rip, THUNK + 4);
            assert_eq!(context.rsp, STACK + 16);
        }

        #[test]
        fn descriptor_must_match_code_kind() {
            let mem = image();
            let entry = FunctionEntry {
                address: X64_TABLE,
                function: EcRuntimeFunction::X64(x64::RuntimeFunction::default()),
            };
            let mut context = X64Context::default();

            let err = with_env(&mem, |env| {
                Arm64Ec.virtual_unwind(
                    env,
                    HandlerType::Exception,
                    BASE,
                    EC_FUNCTION,
                    Some(&entry),
                    &mut context,
                    None,
                )
            })
            .unwrap_err();
            assert!(matches!(err, Error::Malformed { address: X64_TABLE, .. }));
        }
    }
}
