//! The architecture seam: everything the lookup and dispatch code needs to
//! know about a particular instruction set, plus the two places where control
//! really leaves Rust, capturing and restoring a live context.

use core::fmt::Debug;

use crate::config::UnwindConfig;
use crate::error::Result;
use crate::memory::Memory;
use crate::module::{Directory, Module, ModuleMap};
use crate::nt::HandlerType;

/// What an unwind step can see of the process.
#[derive(Clone, Copy)]
pub struct UnwindEnv<'a> {
    pub mem: &'a dyn Memory,
    pub modules: &'a dyn ModuleMap,
    pub config: &'a UnwindConfig,
}

/// A resolved descriptor and where it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionEntry<F> {
    pub address: u64,
    pub function: F,
}

/// The outputs of `RtlVirtualUnwind2` besides the updated context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtualUnwindResult {
    /// Language handler for the frame, if it has one of the requested type.
    pub handler: Option<u64>,
    /// Address of the handler-specific data following the handler RVA.
    pub handler_data: u64,
    pub establisher_frame: u64,
    pub machine_frame_unwound: bool,
}

/// One instruction set's unwinding rules.
pub trait Architecture {
    type Context: Clone + Debug + Default + PartialEq;
    type ContextPointers: Clone + Debug + Default;
    type RuntimeFunction: Copy + Debug + PartialEq;

    const NAME: &'static str;
    /// Establisher frames are aligned to this.
    const FRAME_ALIGNMENT: u64;

    fn runtime_function_size(&self, env: &UnwindEnv<'_>, pc: u64) -> u64;

    fn read_runtime_function(
        &self,
        env: &UnwindEnv<'_>,
        pc: u64,
        address: u64,
    ) -> Result<Self::RuntimeFunction>;

    /// The absolute code range `[start, end)` a descriptor covers.
    fn function_range(
        &self,
        env: &UnwindEnv<'_>,
        base: u64,
        function: &Self::RuntimeFunction,
    ) -> Result<(u64, u64)>;

    /// Turn a descriptor found by the binary search into the one to unwind
    /// with.
    fn resolve(
        &self,
        _env: &UnwindEnv<'_>,
        _base: u64,
        entry: FunctionEntry<Self::RuntimeFunction>,
    ) -> Result<FunctionEntry<Self::RuntimeFunction>> {
        Ok(entry)
    }

    /// Binary search a sorted descriptor array.
    fn find_function(
        &self,
        env: &UnwindEnv<'_>,
        pc: u64,
        base: u64,
        table: u64,
        count: u32,
    ) -> Result<Option<FunctionEntry<Self::RuntimeFunction>>> {
        let size = self.runtime_function_size(env, pc);
        let mut min = 0i64;
        let mut max = count as i64 - 1;
        while min <= max {
            let pos = (min + max) / 2;
            let address = table + pos as u64 * size;
            let function = self.read_runtime_function(env, pc, address)?;
            let (start, end) = self.function_range(env, base, &function)?;
            if pc < start {
                max = pos - 1;
            } else if pc >= end {
                min = pos + 1;
            } else {
                return self
                    .resolve(env, base, FunctionEntry { address, function })
                    .map(Some);
            }
        }
        Ok(None)
    }

    /// Where the last function of a table ends, for `RtlAddFunctionTable`.
    fn table_end(&self, env: &UnwindEnv<'_>, base: u64, table: u64, count: u32) -> Result<u64> {
        if count == 0 {
            return Ok(base);
        }
        let size = self.runtime_function_size(env, base);
        let last = table.wrapping_add((count as u64 - 1) * size);
        let function = self.read_runtime_function(env, base, last)?;
        Ok(self.function_range(env, base, &function)?.1)
    }

    /// The exception table of `module` that describes `pc`.
    fn module_table(&self, _env: &UnwindEnv<'_>, module: &Module, _pc: u64) -> Option<Directory> {
        module.exception_directory
    }

    /// `RtlVirtualUnwind2`
    #[allow(clippy::too_many_arguments)]
    fn virtual_unwind(
        &self,
        env: &UnwindEnv<'_>,
        handler_type: HandlerType,
        base: u64,
        pc: u64,
        function: Option<&FunctionEntry<Self::RuntimeFunction>>,
        context: &mut Self::Context,
        pointers: Option<&mut Self::ContextPointers>,
    ) -> Result<VirtualUnwindResult>;

    fn pc(context: &Self::Context) -> u64;
    fn set_pc(context: &mut Self::Context, pc: u64);
    fn sp(context: &Self::Context) -> u64;
    fn set_return_value(context: &mut Self::Context, value: u64);

    /// Whether the context's pc is a return address.
    fn unwound_to_call(context: &Self::Context) -> bool;

    /// How far back from an unwound pc the call instruction starts.
    fn call_instruction_size(&self, env: &UnwindEnv<'_>, pc: u64) -> u64;

    /// Load the non-volatile registers saved by `setjmp` into `context`.
    fn apply_jump_buffer(
        &self,
        env: &UnwindEnv<'_>,
        context: &mut Self::Context,
        jump_buffer: u64,
    ) -> Result<()>;

    /// Whether a target unwind must continue one frame past its end frame.
    fn needs_extra_frame(&self, _env: &UnwindEnv<'_>, _frame_pc: u64, _caller_pc: u64) -> bool {
        false
    }
}

/// Authenticate a return address signed with `pacibsp`. Hosts without pointer
/// authentication leave it untouched, as the hint instruction does on such
/// cores.
#[cfg(target_arch = "aarch64")]
pub(crate) fn pac_auth(lr: u64, sp: u64) -> u64 {
    let mut x17 = lr;
    // SAFETY: `hint 0xe` is autib1716, which only reads x16 and rewrites x17.
    unsafe {
        core::arch::asm!(
            "hint 0xe",
            inout("x17") x17,
            in("x16") sp,
            options(nomem, nostack, preserves_flags),
        );
    }
    x17
}

#[cfg(not(target_arch = "aarch64"))]
pub(crate) fn pac_auth(lr: u64, _sp: u64) -> u64 {
    lr
}

#[cfg(target_arch = "x86_64")]
mod live {
    use core::arch::asm;

    use crate::context::{X64Context, CONTEXT_AMD64_CONTROL, CONTEXT_AMD64_INTEGER};

    /// `RtlCaptureContext`: the registers at the point of the call.
    #[inline(always)]
    pub fn capture_context() -> X64Context {
        let mut regs = [0u64; 19];

        // SAFETY: Only stores into `regs` and rax, which is declared clobbered.
        unsafe {
            asm!(
                "mov [{regs}+0*8], rax",
                "mov [{regs}+1*8], rcx",
                "mov [{regs}+2*8], rdx",
                "mov [{regs}+3*8], rbx",
                "mov [{regs}+4*8], rsp",
                "mov [{regs}+5*8], rbp",
                "mov [{regs}+6*8], rsi",
                "mov [{regs}+7*8], rdi",
                "mov [{regs}+8*8], r8",
                "mov [{regs}+9*8], r9",
                "mov [{regs}+10*8], r10",
                "mov [{regs}+11*8], r11",
                "mov [{regs}+12*8], r12",
                "mov [{regs}+13*8], r13",
                "mov [{regs}+14*8], r14",
                "mov [{regs}+15*8], r15",
                "lea rax, [rip + 0]", // must use rip as a base register
                "mov [{regs}+16*8], rax",
                "pushfq",
                "pop rax",
                "mov [{regs}+17*8], rax",
                "stmxcsr [{regs}+18*8]",
                out("rax") _,
                regs = in(reg) regs.as_mut_ptr(),
            );
        }

        let mut context = X64Context {
            context_flags: CONTEXT_AMD64_CONTROL | CONTEXT_AMD64_INTEGER,
            rip: regs[16],
            eflags: regs[17] as u32,
            mx_csr: regs[18] as u32,
            ..X64Context::default()
        };
        for reg in 0..16 {
            *context.gpr_mut(reg) = regs[reg as usize];
        }
        context.flt_save.mx_csr = context.mx_csr;
        context
    }

    #[repr(C)]
    struct RestoreFrame {
        gpr: [u64; 16],
        rip: u64,
        eflags: u64,
        mx_csr: u32,
        _pad: [u32; 3],
        xmm: [u128; 16],
    }

    /// `RtlRestoreContext`: continue execution in `context`.
    ///
    /// # Safety
    ///
    /// `context` must describe a frame that is still live on this thread's
    /// stack, with every register the target code relies on restored.
    pub unsafe fn restore_context(context: &X64Context) -> ! {
        let mut frame = RestoreFrame {
            gpr: [0; 16],
            rip: context.rip,
            eflags: context.eflags as u64,
            mx_csr: context.mx_csr,
            _pad: [0; 3],
            xmm: context.flt_save.xmm_registers,
        };
        for reg in 0..16 {
            frame.gpr[reg as usize] = context.gpr(reg);
        }

        // SAFETY: The caller guarantees the target stack and code are valid.
        unsafe {
            asm!(
                "ldmxcsr [rdi + 0x90]",
                "movups xmm0, [rdi + 0xa0]",
                "movups xmm1, [rdi + 0xb0]",
                "movups xmm2, [rdi + 0xc0]",
                "movups xmm3, [rdi + 0xd0]",
                "movups xmm4, [rdi + 0xe0]",
                "movups xmm5, [rdi + 0xf0]",
                "movups xmm6, [rdi + 0x100]",
                "movups xmm7, [rdi + 0x110]",
                "movups xmm8, [rdi + 0x120]",
                "movups xmm9, [rdi + 0x130]",
                "movups xmm10, [rdi + 0x140]",
                "movups xmm11, [rdi + 0x150]",
                "movups xmm12, [rdi + 0x160]",
                "movups xmm13, [rdi + 0x170]",
                "movups xmm14, [rdi + 0x180]",
                "movups xmm15, [rdi + 0x190]",
                "mov rsp, [rdi + 0x20]",
                "push qword ptr [rdi + 0x80]",
                "push qword ptr [rdi + 0x88]",
                "mov rax, [rdi + 0x00]",
                "mov rcx, [rdi + 0x08]",
                "mov rdx, [rdi + 0x10]",
                "mov rbx, [rdi + 0x18]",
                "mov rbp, [rdi + 0x28]",
                "mov rsi, [rdi + 0x30]",
                "mov r8, [rdi + 0x40]",
                "mov r9, [rdi + 0x48]",
                "mov r10, [rdi + 0x50]",
                "mov r11, [rdi + 0x58]",
                "mov r12, [rdi + 0x60]",
                "mov r13, [rdi + 0x68]",
                "mov r14, [rdi + 0x70]",
                "mov r15, [rdi + 0x78]",
                "mov rdi, [rdi + 0x38]",
                "popfq",
                "ret",
                in("rdi") &mut frame,
                options(noreturn),
            );
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod live {
    use core::arch::asm;

    use crate::context::{Arm64Context, CONTEXT_ARM64_CONTROL, CONTEXT_ARM64_INTEGER};

    /// `RtlCaptureContext`: the registers at the point of the call.
    #[inline(always)]
    pub fn capture_context() -> Arm64Context {
        let mut regs = [0u64; 36];

        // SAFETY: Only stores into `regs` and x17, which is declared clobbered.
        unsafe {
            asm!(
                "stp x0, x1, [x16, #0x00]",
                "stp x2, x3, [x16, #0x10]",
                "stp x4, x5, [x16, #0x20]",
                "stp x6, x7, [x16, #0x30]",
                "stp x8, x9, [x16, #0x40]",
                "stp x10, x11, [x16, #0x50]",
                "stp x12, x13, [x16, #0x60]",
                "stp x14, x15, [x16, #0x70]",
                "stp x16, x17, [x16, #0x80]",
                "stp x18, x19, [x16, #0x90]",
                "stp x20, x21, [x16, #0xa0]",
                "stp x22, x23, [x16, #0xb0]",
                "stp x24, x25, [x16, #0xc0]",
                "stp x26, x27, [x16, #0xd0]",
                "stp x28, x29, [x16, #0xe0]",
                "str x30, [x16, #0xf0]",
                "mov x17, sp",
                "str x17, [x16, #0xf8]",
                "adr x17, .",
                "str x17, [x16, #0x100]",
                "mrs x17, nzcv",
                "str x17, [x16, #0x108]",
                "mrs x17, fpcr",
                "str x17, [x16, #0x110]",
                "mrs x17, fpsr",
                "str x17, [x16, #0x118]",
                in("x16") regs.as_mut_ptr(),
                out("x17") _,
            );
        }

        let mut context = Arm64Context {
            context_flags: CONTEXT_ARM64_CONTROL | CONTEXT_ARM64_INTEGER,
            sp: regs[31],
            pc: regs[32],
            cpsr: regs[33] as u32,
            fpcr: regs[34] as u32,
            fpsr: regs[35] as u32,
            ..Arm64Context::default()
        };
        context.x.copy_from_slice(&regs[..31]);
        context
    }

    #[repr(C)]
    struct RestoreFrame {
        x: [u64; 31],
        sp: u64,
        pc: u64,
        fpcr: u64,
        fpsr: u64,
        _pad: u64,
        v: [u128; 32],
    }

    /// `RtlRestoreContext`: continue execution in `context`. X16 and X17 are
    /// used to perform the jump and do not keep their context values.
    ///
    /// # Safety
    ///
    /// `context` must describe a frame that is still live on this thread's
    /// stack, with every register the target code relies on restored.
    pub unsafe fn restore_context(context: &Arm64Context) -> ! {
        let mut frame = RestoreFrame {
            x: context.x,
            sp: context.sp,
            pc: context.pc,
            fpcr: context.fpcr as u64,
            fpsr: context.fpsr as u64,
            _pad: 0,
            v: context.v,
        };

        // SAFETY: The caller guarantees the target stack and code are valid.
        unsafe {
            asm!(
                "ldp q0, q1, [x16, #0x120]",
                "ldp q2, q3, [x16, #0x140]",
                "ldp q4, q5, [x16, #0x160]",
                "ldp q6, q7, [x16, #0x180]",
                "ldp q8, q9, [x16, #0x1a0]",
                "ldp q10, q11, [x16, #0x1c0]",
                "ldp q12, q13, [x16, #0x1e0]",
                "ldp q14, q15, [x16, #0x200]",
                "ldp q16, q17, [x16, #0x220]",
                "ldp q18, q19, [x16, #0x240]",
                "ldp q20, q21, [x16, #0x260]",
                "ldp q22, q23, [x16, #0x280]",
                "ldp q24, q25, [x16, #0x2a0]",
                "ldp q26, q27, [x16, #0x2c0]",
                "ldp q28, q29, [x16, #0x2e0]",
                "ldp q30, q31, [x16, #0x300]",
                "ldr x17, [x16, #0x108]",
                "msr fpcr, x17",
                "ldr x17, [x16, #0x110]",
                "msr fpsr, x17",
                "ldr x17, [x16, #0xf8]",
                "mov sp, x17",
                "ldp x0, x1, [x16, #0x00]",
                "ldp x2, x3, [x16, #0x10]",
                "ldp x4, x5, [x16, #0x20]",
                "ldp x6, x7, [x16, #0x30]",
                "ldp x8, x9, [x16, #0x40]",
                "ldp x10, x11, [x16, #0x50]",
                "ldp x12, x13, [x16, #0x60]",
                "ldp x14, x15, [x16, #0x70]",
                "ldr x19, [x16, #0x98]",
                "ldp x20, x21, [x16, #0xa0]",
                "ldp x22, x23, [x16, #0xb0]",
                "ldp x24, x25, [x16, #0xc0]",
                "ldp x26, x27, [x16, #0xd0]",
                "ldp x28, x29, [x16, #0xe0]",
                "ldr x30, [x16, #0xf0]",
                "ldr x17, [x16, #0x100]",
                "br x17",
                in("x16") &mut frame,
                options(noreturn),
            );
        }
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use live::{capture_context, restore_context};

#[cfg(test)]
mod tests {
    #[cfg(target_arch = "x86_64")]
    #[test]
    fn captured_context_is_on_this_stack() {
        use crate::arch::Architecture;
        use crate::x64::X64;

        let local = 0u64;
        let here = &local as *const u64 as u64;
        let context = super::capture_context();
        assert!(X64::sp(&context) <= here && here - X64::sp(&context) < 0x1000);
        assert_ne!(X64::pc(&context), 0);
        assert_eq!(context.mx_csr, context.flt_save.mx_csr);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn captured_context_is_on_this_stack() {
        use crate::arch::Architecture;
        use crate::arm64::Arm64;

        let local = 0u64;
        let here = &local as *const u64 as u64;
        let context = super::capture_context();
        assert!(Arm64::sp(&context) <= here && here - Arm64::sp(&context) < 0x1000);
        assert_ne!(Arm64::pc(&context), 0);
    }
}
