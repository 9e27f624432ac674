//! Unwind data of any supported format, for inspection and dumping.

use core::fmt;

use crate::error::Result;
use crate::memory::Memory;
use crate::x64::unwind_info::UnwindInfo;
use crate::{arm, arm64, x64};

/// The instruction set a function table describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    X64,
    Arm64,
    Arm,
}

impl Machine {
    /// Size of one `RUNTIME_FUNCTION` entry.
    pub fn runtime_function_size(self) -> u64 {
        match self {
            Self::X64 => x64::RuntimeFunction::SIZE,
            Self::Arm64 => arm64::RuntimeFunction::SIZE,
            Self::Arm => arm::RuntimeFunction::SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwindData {
    X64(UnwindInfo),
    Arm64Packed(arm64::packed::PackedInfo),
    Arm64Full(arm64::full::XData),
    ArmPacked(arm::packed::PackedInfo),
    ArmFull(arm::full::XData),
}

/// Decode the unwind data of the `RUNTIME_FUNCTION` at `function`.
#[instrument(level = "trace", skip(mem))]
pub fn decode(mem: &dyn Memory, machine: Machine, base: u64, function: u64) -> Result<UnwindData> {
    Ok(match machine {
        Machine::X64 => {
            let function = x64::RuntimeFunction::read(mem, function)?;
            UnwindData::X64(UnwindInfo::read(mem, base + function.unwind_data as u64)?)
        }
        Machine::Arm64 => {
            let function = arm64::RuntimeFunction::read(mem, function)?;
            match function.packed() {
                Some(info) => UnwindData::Arm64Packed(info),
                None => UnwindData::Arm64Full(arm64::full::XData::read(
                    mem,
                    base + function.data as u64,
                )?),
            }
        }
        Machine::Arm => {
            let function = arm::RuntimeFunction::read(mem, function)?;
            match function.packed() {
                Some(info) => UnwindData::ArmPacked(info),
                None => {
                    UnwindData::ArmFull(arm::full::XData::read(mem, base + function.data as u64)?)
                }
            }
        }
    })
}

impl fmt::Display for UnwindData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X64(info) => write!(f, "{info}"),
            Self::Arm64Packed(info) => write!(
                f,
                "packed arm64 length {:#x} RegF {} RegI {} H {} CR {} frame {:#x}",
                info.function_length * 4,
                info.reg_f,
                info.reg_i,
                info.h as u8,
                info.cr,
                info.frame_size * 16
            ),
            Self::Arm64Full(xdata) => write!(f, "{xdata}"),
            Self::ArmPacked(info) => write!(
                f,
                "packed arm length {:#x} Ret {} H {} Reg {} R {} L {} C {} StackAdjust {:#x}",
                info.function_length * 2,
                info.ret,
                info.h as u8,
                info.reg,
                info.r as u8,
                info.l as u8,
                info.c as u8,
                info.stack_adjust
            ),
            Self::ArmFull(xdata) => write!(f, "{xdata}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::memory::SparseMemory;

    const BASE: u64 = 0x1_0000_0000;

    fn image() -> SparseMemory {
        let mut mem = SparseMemory::new();
        mem.map(BASE, 0x3000);
        mem
    }

    #[test]
    fn x64_unwind_info() {
        let mut mem = image();
        mem.write_u32(BASE + 0x2000, 0x1000);
        mem.write_u32(BASE + 0x2004, 0x1040);
        mem.write_u32(BASE + 0x2008, 0x2800);
        mem.write(BASE + 0x2800, &[0x01, 0x04, 0x02, 0x00, 0x04, 0x02, 0x01, 0x50]);

        let data = decode(&mem, Machine::X64, BASE, BASE + 0x2000).unwrap();
        let UnwindData::X64(info) = &data else {
            panic!("{data:?}");
        };
        assert_eq!(info.prolog, 4);
        assert_eq!(info.codes.len(), 2);
    }

    #[test]
    fn x64_bad_version() {
        let mut mem = image();
        mem.write_u32(BASE + 0x2008, 0x2800);
        mem.write_u8(BASE + 0x2800, 0x03);

        let err = decode(&mem, Machine::X64, BASE, BASE + 0x2000).unwrap_err();
        assert_eq!(
            err,
            Error::UnknownVersion {
                address: BASE + 0x2800,
                version: 3
            }
        );
    }

    #[test]
    fn arm64_packed_and_full() {
        let mut mem = image();
        mem.write_u32(BASE + 0x2000, 0x1000);
        mem.write_u32(BASE + 0x2004, 1 | 8 << 2 | 2 << 16);
        mem.write_u32(BASE + 0x2008, 0x1100);
        mem.write_u32(BASE + 0x200c, 0x2800);
        // 0x10 instructions, one code word: stp x29,lr,[sp,#-16]!; end
        mem.write_u32(BASE + 0x2800, 0x10 | 1 << 21 | 1 << 27);
        mem.write(BASE + 0x2804, &[0x81, 0xe4, 0xe4, 0xe4]);

        let packed = decode(&mem, Machine::Arm64, BASE, BASE + 0x2000).unwrap();
        assert!(matches!(packed, UnwindData::Arm64Packed(info) if info.reg_i == 2));
        assert!(packed.to_string().starts_with("packed arm64 length 0x20"));

        let full = decode(&mem, Machine::Arm64, BASE, BASE + 0x2008).unwrap();
        let UnwindData::Arm64Full(xdata) = full else {
            panic!("{full:?}");
        };
        assert_eq!(xdata.function_length, 0x10);
        assert_eq!(xdata.codes, [0x81, 0xe4, 0xe4, 0xe4]);
    }

    #[test]
    fn arm_packed_and_full() {
        let mut mem = image();
        mem.write_u32(BASE + 0x2000, 0x1001);
        mem.write_u32(BASE + 0x2004, 1 | 0x20 << 2 | 2 << 16 | 1 << 20);
        mem.write_u32(BASE + 0x2008, 0x1101);
        mem.write_u32(BASE + 0x200c, 0x2800);
        mem.write_u32(BASE + 0x2800, 0x40 | 1 << 21 | 1 << 28);
        mem.write(BASE + 0x2804, &[0xd7, 0xff, 0xff, 0xff]);

        let packed = decode(&mem, Machine::Arm, BASE, BASE + 0x2000).unwrap();
        assert!(matches!(packed, UnwindData::ArmPacked(info) if info.l && info.reg == 2));

        let full = decode(&mem, Machine::Arm, BASE, BASE + 0x2008).unwrap();
        let UnwindData::ArmFull(xdata) = full else {
            panic!("{full:?}");
        };
        assert_eq!(xdata.function_length, 0x40);
        assert!(xdata.epilog_in_header);
        assert_eq!(Machine::Arm.runtime_function_size(), 8);
    }
}
