//! Decoding of x64 `UNWIND_INFO`.
//!
//! ```text
//! +0  version:3 flags:5
//! +1  size of prolog
//! +2  count of 16-bit code slots
//! +3  frame register:4 frame offset:4 (scaled by 16)
//! +4  codes, padded to an even slot count
//!     then a handler RVA and handler data, or a chained RUNTIME_FUNCTION
//! ```

use core::fmt;

use super::{RuntimeFunction, REG_NAMES};
use crate::error::{Error, Result};
use crate::memory::{Cursor, Memory};
use crate::nt::{UNW_FLAG_CHAININFO, UNW_FLAG_EHANDLER, UNW_FLAG_UHANDLER};

const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;
const UWOP_SAVE_NONVOL: u8 = 4;
const UWOP_SAVE_NONVOL_FAR: u8 = 5;
pub(super) const UWOP_EPILOG: u8 = 6;
const UWOP_SAVE_XMM128: u8 = 8;
const UWOP_SAVE_XMM128_FAR: u8 = 9;
const UWOP_PUSH_MACHFRAME: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOp {
    /// `push %reg`
    PushNonvol { reg: u8 },
    /// `sub $size,%rsp`
    Alloc { size: u32 },
    /// `lea offset(%rsp),%framereg`
    SetFpreg,
    /// `mov %reg,offset(%rsp)`
    SaveNonvol { reg: u8, offset: u32 },
    /// `movaps %xmmN,offset(%rsp)`
    SaveXmm128 { reg: u8, offset: u32 },
    /// The processor pushed an interrupt frame, with an error code if set.
    PushMachframe { error_code: bool },
    /// Version 2 epilog location. The second slot carries the high bits of
    /// the offset when `info` is zero.
    Epilog { info: u8, next: u16 },
    Unknown { code: u8, info: u8 },
}

/// One decoded code and the slots it occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindCode {
    /// Offset of the end of the prolog instruction this code undoes.
    pub offset: u8,
    pub slot: u8,
    pub slots: u8,
    pub op: UnwindOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trailer {
    None,
    Handler { rva: u32, data: u64 },
    Chain(RuntimeFunction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindInfo {
    pub address: u64,
    pub version: u8,
    pub flags: u8,
    pub prolog: u8,
    pub count: u8,
    pub frame_reg: u8,
    pub frame_offset: u8,
    pub codes: Vec<UnwindCode>,
    pub trailer: Trailer,
}

impl UnwindInfo {
    #[instrument(level = "trace", skip(mem))]
    pub fn read(mem: &dyn Memory, address: u64) -> Result<Self> {
        let header = mem.read_vec(address, 4)?;
        let version = header[0] & 7;
        if version != 1 && version != 2 {
            return Err(Error::UnknownVersion { address, version });
        }
        let flags = header[0] >> 3;
        let count = header[2];

        let slots = (count as usize + 1) & !1;
        let trailer_len = if flags & UNW_FLAG_CHAININFO != 0 {
            12
        } else if flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) != 0 {
            4
        } else {
            0
        };
        let body = mem.read_vec(address + 4, slots * 2 + trailer_len)?;
        let mut cursor = Cursor::new(&body, address + 4);

        let codes = parse_codes(&mut cursor, count)?;
        let mut cursor = Cursor::new(&body[slots * 2..], address + 4 + slots as u64 * 2);
        let trailer = if flags & UNW_FLAG_CHAININFO != 0 {
            Trailer::Chain(RuntimeFunction {
                begin: cursor.read_u32()?,
                end: cursor.read_u32()?,
                unwind_data: cursor.read_u32()?,
            })
        } else if trailer_len != 0 {
            let rva = cursor.read_u32()?;
            Trailer::Handler {
                rva,
                data: cursor.address(),
            }
        } else {
            Trailer::None
        };

        Ok(Self {
            address,
            version,
            flags,
            prolog: header[1],
            count,
            frame_reg: header[3] & 0xf,
            frame_offset: header[3] >> 4,
            codes,
            trailer,
        })
    }

    pub fn has_chain(&self) -> bool {
        self.flags & UNW_FLAG_CHAININFO != 0
    }
}

fn parse_codes(cursor: &mut Cursor<'_>, count: u8) -> Result<Vec<UnwindCode>> {
    let mut codes = Vec::with_capacity(count as usize);
    let mut slot = 0u8;
    while slot < count {
        let start = cursor.address();
        let offset = cursor.read_u8()?;
        let byte = cursor.read_u8()?;
        let (code, info) = (byte & 0xf, byte >> 4);

        let slots = match code {
            UWOP_ALLOC_LARGE => 2 + (info != 0) as u8,
            UWOP_SAVE_NONVOL | UWOP_SAVE_XMM128 | UWOP_EPILOG => 2,
            UWOP_SAVE_NONVOL_FAR | UWOP_SAVE_XMM128_FAR => 3,
            _ => 1,
        };
        if slot as u16 + slots as u16 > count as u16 {
            return Err(Error::malformed(
                start,
                format!("unwind code {code} needs {slots} slots, only {} left", count - slot),
            ));
        }

        let op = match code {
            UWOP_PUSH_NONVOL => UnwindOp::PushNonvol { reg: info },
            UWOP_ALLOC_LARGE if info != 0 => UnwindOp::Alloc {
                size: cursor.read_u32()?,
            },
            UWOP_ALLOC_LARGE => UnwindOp::Alloc {
                size: cursor.read_u16()? as u32 * 8,
            },
            UWOP_ALLOC_SMALL => UnwindOp::Alloc {
                size: (info as u32 + 1) * 8,
            },
            UWOP_SET_FPREG => UnwindOp::SetFpreg,
            UWOP_SAVE_NONVOL => UnwindOp::SaveNonvol {
                reg: info,
                offset: cursor.read_u16()? as u32 * 8,
            },
            UWOP_SAVE_NONVOL_FAR => UnwindOp::SaveNonvol {
                reg: info,
                offset: cursor.read_u32()?,
            },
            UWOP_SAVE_XMM128 => UnwindOp::SaveXmm128 {
                reg: info,
                offset: cursor.read_u16()? as u32 * 16,
            },
            UWOP_SAVE_XMM128_FAR => UnwindOp::SaveXmm128 {
                reg: info,
                offset: cursor.read_u32()?,
            },
            UWOP_PUSH_MACHFRAME => UnwindOp::PushMachframe {
                error_code: info != 0,
            },
            UWOP_EPILOG => UnwindOp::Epilog {
                info,
                next: cursor.read_u16()?,
            },
            _ => UnwindOp::Unknown { code, info },
        };

        codes.push(UnwindCode {
            offset,
            slot,
            slots,
            op,
        });
        slot += slots;
    }
    Ok(codes)
}

pub(super) struct CodeDisplay<'a> {
    pub info: &'a UnwindInfo,
    pub code: &'a UnwindCode,
}

impl fmt::Display for CodeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = |r: u8| REG_NAMES[r as usize & 0xf];
        write!(f, "{:#x}: ", self.code.offset)?;
        match self.code.op {
            UnwindOp::PushNonvol { reg: r } => write!(f, "pushq %{}", reg(r)),
            UnwindOp::Alloc { size } => write!(f, "subq ${size:#x},%rsp"),
            UnwindOp::SetFpreg => write!(
                f,
                "leaq {:#x}(%rsp),%{}",
                self.info.frame_offset as u32 * 16,
                reg(self.info.frame_reg)
            ),
            UnwindOp::SaveNonvol { reg: r, offset } => {
                write!(f, "movq %{},{offset:#x}(%rsp)", reg(r))
            }
            UnwindOp::SaveXmm128 { reg: r, offset } => {
                write!(f, "movaps %xmm{r},{offset:#x}(%rsp)")
            }
            UnwindOp::PushMachframe { error_code } => {
                write!(f, "PUSH_MACHFRAME {}", error_code as u8)
            }
            UnwindOp::Epilog { info, next } => {
                let size = if info != 0 {
                    self.code.offset as u32
                } else {
                    ((next as u32 >> 12) << 8) | (next as u32 & 0xff)
                };
                write!(f, "epilog at end - {size:#x}")
            }
            UnwindOp::Unknown { code, .. } => write!(f, "unknown code {code}"),
        }
    }
}

impl fmt::Display for UnwindInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "unwind info at {:#x} version {} flags {:#x} prolog {:#x} bytes",
            self.address, self.version, self.flags, self.prolog
        )?;
        if self.frame_reg != 0 {
            writeln!(
                f,
                "    frame register {} offset {:#x}(%rsp)",
                REG_NAMES[self.frame_reg as usize],
                self.frame_offset as u32 * 16
            )?;
        }
        for code in &self.codes {
            writeln!(f, "    {}", CodeDisplay { info: self, code })?;
        }
        match self.trailer {
            Trailer::None => Ok(()),
            Trailer::Handler { rva, data } => {
                write!(f, "    handler rva {rva:#x} data at {data:#x}")
            }
            Trailer::Chain(next) => write!(
                f,
                "    chained to function {:#x}-{:#x}",
                next.begin, next.end
            ),
        }
    }
}
