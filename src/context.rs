//! CPU contexts in the shape Windows lays them out.
//!
//! Each context can be read from and written to its `winnt.h` byte layout,
//! since unwind opcodes (`MSFT_OP_CONTEXT`, machine frames) restore whole
//! contexts from the stack.

use crate::error::{Error, Result};
use crate::memory::Memory;

pub const CONTEXT_AMD64: u32 = 0x0010_0000;
pub const CONTEXT_ARM: u32 = 0x0020_0000;
pub const CONTEXT_ARM64: u32 = 0x0040_0000;

pub const CONTEXT_AMD64_CONTROL: u32 = CONTEXT_AMD64 | 0x1;
pub const CONTEXT_AMD64_INTEGER: u32 = CONTEXT_AMD64 | 0x2;
pub const CONTEXT_AMD64_SEGMENTS: u32 = CONTEXT_AMD64 | 0x4;
pub const CONTEXT_AMD64_FLOATING_POINT: u32 = CONTEXT_AMD64 | 0x8;
pub const CONTEXT_AMD64_DEBUG_REGISTERS: u32 = CONTEXT_AMD64 | 0x10;

pub const CONTEXT_ARM64_CONTROL: u32 = CONTEXT_ARM64 | 0x1;
pub const CONTEXT_ARM64_INTEGER: u32 = CONTEXT_ARM64 | 0x2;
pub const CONTEXT_ARM64_FLOATING_POINT: u32 = CONTEXT_ARM64 | 0x4;
pub const CONTEXT_ARM64_DEBUG_REGISTERS: u32 = CONTEXT_ARM64 | 0x8;

pub const CONTEXT_ARM_CONTROL: u32 = CONTEXT_ARM | 0x1;
pub const CONTEXT_ARM_INTEGER: u32 = CONTEXT_ARM | 0x2;
pub const CONTEXT_ARM_FLOATING_POINT: u32 = CONTEXT_ARM | 0x4;

/// Set on a context whose pc is a return address rather than the address of
/// the faulting instruction.
pub const CONTEXT_UNWOUND_TO_CALL: u32 = 0x2000_0000;

fn get_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn get_u32(b: &[u8], off: usize) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&b[off..off + 4]);
    u32::from_le_bytes(buf)
}

fn get_u64(b: &[u8], off: usize) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(buf)
}

fn get_u128(b: &[u8], off: usize) -> u128 {
    let mut buf = [0; 16];
    buf.copy_from_slice(&b[off..off + 16]);
    u128::from_le_bytes(buf)
}

fn put(b: &mut [u8], off: usize, bytes: &[u8]) {
    b[off..off + bytes.len()].copy_from_slice(bytes);
}

fn check_len(bytes: &[u8], size: usize, what: &str) -> Result<()> {
    if bytes.len() < size {
        return Err(Error::malformed(
            0,
            format!("{what} needs {size:#x} bytes, got {:#x}", bytes.len()),
        ));
    }
    Ok(())
}

/// `XMM_SAVE_AREA32`, the legacy FXSAVE image embedded in the x64 context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XSaveFormat {
    pub control_word: u16,
    pub status_word: u16,
    pub tag_word: u8,
    pub error_opcode: u16,
    pub error_offset: u32,
    pub error_selector: u16,
    pub data_offset: u32,
    pub data_selector: u16,
    pub mx_csr: u32,
    pub mx_csr_mask: u32,
    pub float_registers: [u128; 8],
    pub xmm_registers: [u128; 16],
}

/// The x86-64 `CONTEXT`. ARM64EC code uses the same layout
/// (`ARM64EC_NT_CONTEXT`), overlaying the ARM64 registers it has no x64
/// counterpart for onto the x87 area.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct X64Context {
    pub p_home: [u64; 6],
    pub context_flags: u32,
    pub mx_csr: u32,
    pub seg_cs: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,
    pub seg_ss: u16,
    pub eflags: u32,
    /// Dr0-Dr3, Dr6, Dr7
    pub dr: [u64; 6],
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub flt_save: XSaveFormat,
}

impl X64Context {
    pub const SIZE: usize = 0x4d0;

    const GPR_OFFSET: usize = 0x78;
    const FLT_OFFSET: usize = 0x100;

    /// Integer register by x64 encoding number (rax = 0 ... r15 = 15).
    pub fn gpr(&self, reg: u8) -> u64 {
        match reg & 0xf {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    pub fn gpr_mut(&mut self, reg: u8) -> &mut u64 {
        match reg & 0xf {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            _ => &mut self.r15,
        }
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        check_len(b, Self::SIZE, "CONTEXT")?;
        let mut ctx = Self::default();
        for (i, home) in ctx.p_home.iter_mut().enumerate() {
            *home = get_u64(b, i * 8);
        }
        ctx.context_flags = get_u32(b, 0x30);
        ctx.mx_csr = get_u32(b, 0x34);
        ctx.seg_cs = get_u16(b, 0x38);
        ctx.seg_ds = get_u16(b, 0x3a);
        ctx.seg_es = get_u16(b, 0x3c);
        ctx.seg_fs = get_u16(b, 0x3e);
        ctx.seg_gs = get_u16(b, 0x40);
        ctx.seg_ss = get_u16(b, 0x42);
        ctx.eflags = get_u32(b, 0x44);
        for (i, dr) in ctx.dr.iter_mut().enumerate() {
            *dr = get_u64(b, 0x48 + i * 8);
        }
        for reg in 0..16 {
            *ctx.gpr_mut(reg) = get_u64(b, Self::GPR_OFFSET + reg as usize * 8);
        }
        ctx.rip = get_u64(b, 0xf8);

        let f = Self::FLT_OFFSET;
        let flt = &mut ctx.flt_save;
        flt.control_word = get_u16(b, f);
        flt.status_word = get_u16(b, f + 2);
        flt.tag_word = b[f + 4];
        flt.error_opcode = get_u16(b, f + 6);
        flt.error_offset = get_u32(b, f + 8);
        flt.error_selector = get_u16(b, f + 12);
        flt.data_offset = get_u32(b, f + 16);
        flt.data_selector = get_u16(b, f + 20);
        flt.mx_csr = get_u32(b, f + 24);
        flt.mx_csr_mask = get_u32(b, f + 28);
        for (i, st) in flt.float_registers.iter_mut().enumerate() {
            *st = get_u128(b, f + 0x20 + i * 16);
        }
        for (i, xmm) in flt.xmm_registers.iter_mut().enumerate() {
            *xmm = get_u128(b, f + 0xa0 + i * 16);
        }
        Ok(ctx)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = vec![0; Self::SIZE];
        for (i, home) in self.p_home.iter().enumerate() {
            put(&mut b, i * 8, &home.to_le_bytes());
        }
        put(&mut b, 0x30, &self.context_flags.to_le_bytes());
        put(&mut b, 0x34, &self.mx_csr.to_le_bytes());
        put(&mut b, 0x38, &self.seg_cs.to_le_bytes());
        put(&mut b, 0x3a, &self.seg_ds.to_le_bytes());
        put(&mut b, 0x3c, &self.seg_es.to_le_bytes());
        put(&mut b, 0x3e, &self.seg_fs.to_le_bytes());
        put(&mut b, 0x40, &self.seg_gs.to_le_bytes());
        put(&mut b, 0x42, &self.seg_ss.to_le_bytes());
        put(&mut b, 0x44, &self.eflags.to_le_bytes());
        for (i, dr) in self.dr.iter().enumerate() {
            put(&mut b, 0x48 + i * 8, &dr.to_le_bytes());
        }
        for reg in 0..16 {
            put(
                &mut b,
                Self::GPR_OFFSET + reg as usize * 8,
                &self.gpr(reg).to_le_bytes(),
            );
        }
        put(&mut b, 0xf8, &self.rip.to_le_bytes());

        let f = Self::FLT_OFFSET;
        let flt = &self.flt_save;
        put(&mut b, f, &flt.control_word.to_le_bytes());
        put(&mut b, f + 2, &flt.status_word.to_le_bytes());
        b[f + 4] = flt.tag_word;
        put(&mut b, f + 6, &flt.error_opcode.to_le_bytes());
        put(&mut b, f + 8, &flt.error_offset.to_le_bytes());
        put(&mut b, f + 12, &flt.error_selector.to_le_bytes());
        put(&mut b, f + 16, &flt.data_offset.to_le_bytes());
        put(&mut b, f + 20, &flt.data_selector.to_le_bytes());
        put(&mut b, f + 24, &flt.mx_csr.to_le_bytes());
        put(&mut b, f + 28, &flt.mx_csr_mask.to_le_bytes());
        for (i, st) in flt.float_registers.iter().enumerate() {
            put(&mut b, f + 0x20 + i * 16, &st.to_le_bytes());
        }
        for (i, xmm) in flt.xmm_registers.iter().enumerate() {
            put(&mut b, f + 0xa0 + i * 16, &xmm.to_le_bytes());
        }
        b
    }

    pub fn read(mem: &dyn Memory, address: u64) -> Result<Self> {
        Self::from_bytes(&mem.read_vec(address, Self::SIZE)?)
    }
}

/// `ARM64_NT_CONTEXT`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arm64Context {
    pub context_flags: u32,
    pub cpsr: u32,
    /// X0-X28, then Fp (X29) and Lr (X30).
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub v: [u128; 32],
    pub fpcr: u32,
    pub fpsr: u32,
    pub bcr: [u32; 8],
    pub bvr: [u64; 8],
    pub wcr: [u32; 2],
    pub wvr: [u64; 2],
}

impl Arm64Context {
    pub const SIZE: usize = 0x390;

    pub fn fp(&self) -> u64 {
        self.x[29]
    }

    pub fn lr(&self) -> u64 {
        self.x[30]
    }

    pub fn set_fp(&mut self, value: u64) {
        self.x[29] = value;
    }

    pub fn set_lr(&mut self, value: u64) {
        self.x[30] = value;
    }

    /// The low 64 bits of vector register `n`, i.e. `Dn`.
    pub fn d(&self, n: usize) -> u64 {
        self.v[n] as u64
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        check_len(b, Self::SIZE, "ARM64_NT_CONTEXT")?;
        let mut ctx = Self {
            context_flags: get_u32(b, 0),
            cpsr: get_u32(b, 4),
            sp: get_u64(b, 0x100),
            pc: get_u64(b, 0x108),
            fpcr: get_u32(b, 0x310),
            fpsr: get_u32(b, 0x314),
            ..Self::default()
        };
        for (i, x) in ctx.x.iter_mut().enumerate() {
            *x = get_u64(b, 8 + i * 8);
        }
        for (i, v) in ctx.v.iter_mut().enumerate() {
            *v = get_u128(b, 0x110 + i * 16);
        }
        for i in 0..8 {
            ctx.bcr[i] = get_u32(b, 0x318 + i * 4);
            ctx.bvr[i] = get_u64(b, 0x338 + i * 8);
        }
        for i in 0..2 {
            ctx.wcr[i] = get_u32(b, 0x378 + i * 4);
            ctx.wvr[i] = get_u64(b, 0x380 + i * 8);
        }
        Ok(ctx)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = vec![0; Self::SIZE];
        put(&mut b, 0, &self.context_flags.to_le_bytes());
        put(&mut b, 4, &self.cpsr.to_le_bytes());
        for (i, x) in self.x.iter().enumerate() {
            put(&mut b, 8 + i * 8, &x.to_le_bytes());
        }
        put(&mut b, 0x100, &self.sp.to_le_bytes());
        put(&mut b, 0x108, &self.pc.to_le_bytes());
        for (i, v) in self.v.iter().enumerate() {
            put(&mut b, 0x110 + i * 16, &v.to_le_bytes());
        }
        put(&mut b, 0x310, &self.fpcr.to_le_bytes());
        put(&mut b, 0x314, &self.fpsr.to_le_bytes());
        for i in 0..8 {
            put(&mut b, 0x318 + i * 4, &self.bcr[i].to_le_bytes());
            put(&mut b, 0x338 + i * 8, &self.bvr[i].to_le_bytes());
        }
        for i in 0..2 {
            put(&mut b, 0x378 + i * 4, &self.wcr[i].to_le_bytes());
            put(&mut b, 0x380 + i * 8, &self.wvr[i].to_le_bytes());
        }
        b
    }

    pub fn read(mem: &dyn Memory, address: u64) -> Result<Self> {
        Self::from_bytes(&mem.read_vec(address, Self::SIZE)?)
    }
}

/// The 32-bit ARM `CONTEXT`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArmContext {
    pub context_flags: u32,
    /// R0-R12, then Sp, Lr and Pc.
    pub r: [u32; 16],
    pub cpsr: u32,
    pub fpscr: u32,
    pub d: [u64; 32],
    pub bvr: [u32; 8],
    pub bcr: [u32; 8],
    pub wvr: u32,
    pub wcr: u32,
}

impl ArmContext {
    pub const SIZE: usize = 0x1a0;

    pub const SP: usize = 13;
    pub const LR: usize = 14;
    pub const PC: usize = 15;

    pub fn sp(&self) -> u32 {
        self.r[Self::SP]
    }

    pub fn lr(&self) -> u32 {
        self.r[Self::LR]
    }

    pub fn pc(&self) -> u32 {
        self.r[Self::PC]
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        check_len(b, Self::SIZE, "ARM CONTEXT")?;
        let mut ctx = Self {
            context_flags: get_u32(b, 0),
            cpsr: get_u32(b, 0x44),
            fpscr: get_u32(b, 0x48),
            wvr: get_u32(b, 0x190),
            wcr: get_u32(b, 0x194),
            ..Self::default()
        };
        for (i, r) in ctx.r.iter_mut().enumerate() {
            *r = get_u32(b, 4 + i * 4);
        }
        for (i, d) in ctx.d.iter_mut().enumerate() {
            *d = get_u64(b, 0x50 + i * 8);
        }
        for i in 0..8 {
            ctx.bvr[i] = get_u32(b, 0x150 + i * 4);
            ctx.bcr[i] = get_u32(b, 0x170 + i * 4);
        }
        Ok(ctx)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = vec![0; Self::SIZE];
        put(&mut b, 0, &self.context_flags.to_le_bytes());
        for (i, r) in self.r.iter().enumerate() {
            put(&mut b, 4 + i * 4, &r.to_le_bytes());
        }
        put(&mut b, 0x44, &self.cpsr.to_le_bytes());
        put(&mut b, 0x48, &self.fpscr.to_le_bytes());
        for (i, d) in self.d.iter().enumerate() {
            put(&mut b, 0x50 + i * 8, &d.to_le_bytes());
        }
        for i in 0..8 {
            put(&mut b, 0x150 + i * 4, &self.bvr[i].to_le_bytes());
            put(&mut b, 0x170 + i * 4, &self.bcr[i].to_le_bytes());
        }
        put(&mut b, 0x190, &self.wvr.to_le_bytes());
        put(&mut b, 0x194, &self.wcr.to_le_bytes());
        b
    }

    pub fn read(mem: &dyn Memory, address: u64) -> Result<Self> {
        Self::from_bytes(&mem.read_vec(address, Self::SIZE)?)
    }
}

/// `KNONVOLATILE_CONTEXT_POINTERS` for x64: where each register was saved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct X64ContextPointers {
    pub xmm: [Option<u64>; 16],
    pub gpr: [Option<u64>; 16],
}

/// `KNONVOLATILE_CONTEXT_POINTERS_ARM64`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arm64ContextPointers {
    /// X19-X28, Fp, Lr
    pub x19: [Option<u64>; 12],
    /// D8-D15
    pub d8: [Option<u64>; 8],
}

/// `KNONVOLATILE_CONTEXT_POINTERS` for ARM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArmContextPointers {
    /// R4-R11
    pub r4: [Option<u64>; 8],
    pub lr: Option<u64>,
    /// D8-D15
    pub d8: [Option<u64>; 8],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SparseMemory;

    #[test]
    fn x64_layout_offsets() {
        let mut ctx = X64Context {
            context_flags: CONTEXT_AMD64_CONTROL,
            rsp: 0x1111,
            rip: 0x2222,
            r15: 0x3333,
            ..Default::default()
        };
        ctx.flt_save.xmm_registers[15] = 0x4444;
        let bytes = ctx.to_bytes();
        assert_eq!(get_u32(&bytes, 0x30), CONTEXT_AMD64_CONTROL);
        assert_eq!(get_u64(&bytes, 0x98), 0x1111);
        assert_eq!(get_u64(&bytes, 0xf0), 0x3333);
        assert_eq!(get_u64(&bytes, 0xf8), 0x2222);
        assert_eq!(get_u128(&bytes, 0x290), 0x4444);
        assert_eq!(X64Context::from_bytes(&bytes).unwrap(), ctx);
    }

    #[test]
    fn arm64_layout_offsets() {
        let mut ctx = Arm64Context {
            sp: 0x5000,
            pc: 0x6000,
            fpcr: 0x100,
            ..Default::default()
        };
        ctx.set_fp(0x7000);
        ctx.set_lr(0x8000);
        ctx.v[31] = 9;
        ctx.wvr[1] = 10;

        let mut mem = SparseMemory::new();
        mem.write(0x9000, &ctx.to_bytes());
        assert_eq!(mem.read_u64(0x9000 + 0xf0).unwrap(), 0x7000);
        assert_eq!(mem.read_u64(0x9000 + 0xf8).unwrap(), 0x8000);
        assert_eq!(mem.read_u64(0x9000 + 0x100).unwrap(), 0x5000);
        assert_eq!(mem.read_u64(0x9000 + 0x388).unwrap(), 10);
        assert_eq!(Arm64Context::read(&mem, 0x9000).unwrap(), ctx);
    }

    #[test]
    fn arm_layout_offsets() {
        let mut ctx = ArmContext::default();
        ctx.r[ArmContext::SP] = 0x100;
        ctx.r[ArmContext::PC] = 0x200;
        ctx.d[8] = 0x300;
        let bytes = ctx.to_bytes();
        assert_eq!(get_u32(&bytes, 0x38), 0x100);
        assert_eq!(get_u32(&bytes, 0x40), 0x200);
        assert_eq!(get_u64(&bytes, 0x90), 0x300);
        assert_eq!(ArmContext::from_bytes(&bytes).unwrap(), ctx);
    }

    #[test]
    fn short_buffer_is_malformed() {
        assert!(Arm64Context::from_bytes(&[0; 16]).is_err());
    }
}
