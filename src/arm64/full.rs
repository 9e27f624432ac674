//! `.xdata` records: unwind code streams with epilog scopes and an optional
//! language handler.
//!
//! ```text
//! header  FunctionLength:18 Version:2 X:1 E:1 EpilogCount:5 CodeWords:5
//! [ext]   EpilogCount:16 CodeWords:8 (when both header counts are zero)
//! scopes  EpilogCount x { StartOffset:18 Reserved:4 StartIndex:10 } (when !E)
//! codes   CodeWords x 4 bytes
//! [X]     handler RVA, handler data
//! ```

use core::fmt;

use super::codes::{self, Restore};
use crate::config::UnwindConfig;
use crate::error::Result;
use crate::memory::{Cursor, Memory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpilogScope {
    /// In instructions from the start of the function.
    pub offset: u32,
    /// Byte index of the epilog's first code.
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XData {
    pub address: u64,
    /// In instructions.
    pub function_length: u32,
    pub version: u8,
    pub exception_data: bool,
    pub epilog_in_header: bool,
    /// With the epilog in the header, the byte index of its codes instead.
    pub epilog_count: u32,
    pub code_words: u32,
    pub epilogs: Vec<EpilogScope>,
    pub codes_address: u64,
    pub codes: Vec<u8>,
}

impl XData {
    pub fn function_length(mem: &dyn Memory, address: u64) -> Result<u32> {
        Ok(mem.read_u32(address)? & 0x3ffff)
    }

    #[instrument(level = "trace", skip(mem))]
    pub fn read(mem: &dyn Memory, address: u64) -> Result<Self> {
        let header = mem.read_u32(address)?;
        let mut epilog_count = (header >> 22) & 0x1f;
        let mut code_words = header >> 27;
        let epilog_in_header = header & (1 << 21) != 0;

        let mut next = address + 4;
        if epilog_count == 0 && code_words == 0 {
            let ext = mem.read_u32(next)?;
            epilog_count = ext & 0xffff;
            code_words = (ext >> 16) & 0xff;
            next += 4;
        }

        let mut epilogs = Vec::new();
        if !epilog_in_header {
            let bytes = mem.read_vec(next, epilog_count as usize * 4)?;
            let mut cursor = Cursor::new(&bytes, next);
            for _ in 0..epilog_count {
                let scope = cursor.read_u32()?;
                epilogs.push(EpilogScope {
                    offset: scope & 0x3ffff,
                    index: scope >> 22,
                });
            }
            next = cursor.address();
        }

        Ok(Self {
            address,
            function_length: header & 0x3ffff,
            version: ((header >> 18) & 3) as u8,
            exception_data: header & (1 << 20) != 0,
            epilog_in_header,
            epilog_count,
            code_words,
            epilogs,
            codes_address: next,
            codes: mem.read_vec(next, code_words as usize * 4)?,
        })
    }

    fn codes_from(&self, index: u32) -> Vec<codes::Code> {
        let bytes = self.codes.get(index as usize..).unwrap_or_default();
        codes::decode(bytes, self.codes_address + index as u64)
    }

    /// Address of the handler RVA, when there is one.
    pub fn handler_address(&self) -> Option<u64> {
        self.exception_data
            .then_some(self.codes_address + self.codes.len() as u64)
    }
}

/// Unwind through a function described by `xdata`, `offset` instructions in.
/// Returns the handler and its data address, if the record has one.
pub(super) fn unwind(
    restore: &mut Restore<'_, '_>,
    config: &UnwindConfig,
    xdata: &XData,
    base: u64,
    offset: u32,
    final_pc_from_lr: &mut bool,
) -> Result<Option<(u64, u64)>> {
    let code_bytes = xdata.code_words * 4;

    if offset < code_bytes {
        let prolog = xdata.codes_from(0);
        let len = codes::sequence_len(&prolog);
        if offset < len {
            trace!("inside prolog");
            *final_pc_from_lr = codes::process(restore, config, &prolog, len - offset)?;
            return Ok(None);
        }
    }

    if !xdata.epilog_in_header {
        for scope in &xdata.epilogs {
            if offset < scope.offset {
                break;
            }
            if offset - scope.offset < code_bytes.wrapping_sub(scope.index) {
                let epilog = xdata.codes_from(scope.index);
                let len = codes::sequence_len(&epilog);
                if offset <= scope.offset + len {
                    trace!("inside epilog at {:#x}", scope.offset);
                    *final_pc_from_lr =
                        codes::process(restore, config, &epilog, offset - scope.offset)?;
                    return Ok(None);
                }
            }
        }
    } else if xdata.function_length.wrapping_sub(offset)
        <= code_bytes.wrapping_sub(xdata.epilog_count)
    {
        let epilog = xdata.codes_from(xdata.epilog_count);
        let len = codes::sequence_len(&epilog) + 1;
        let start = xdata.function_length.wrapping_sub(len);
        if offset >= start {
            trace!("inside epilog at end of function");
            *final_pc_from_lr = codes::process(restore, config, &epilog, offset - start)?;
            return Ok(None);
        }
    }

    *final_pc_from_lr = codes::process(restore, config, &xdata.codes_from(0), 0)?;

    match xdata.handler_address() {
        Some(address) => {
            let rva = restore.mem.read_u32(address)?;
            Ok(Some((base + rva as u64, address + 4)))
        }
        None => Ok(None),
    }
}

impl fmt::Display for XData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "xdata at {:#x} length {:#x} version {} X {} E {} epilogs {} code words {}",
            self.address,
            self.function_length * 4,
            self.version,
            self.exception_data as u8,
            self.epilog_in_header as u8,
            self.epilog_count,
            self.code_words
        )?;
        for scope in &self.epilogs {
            writeln!(
                f,
                "    epilog at {:#x} codes from {}",
                scope.offset * 4,
                scope.index
            )?;
        }
        for code in self.codes_from(0) {
            writeln!(f, "    {code}")?;
        }
        Ok(())
    }
}
