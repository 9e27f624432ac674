//! ARM `.xdata` records.
//!
//! ```text
//! header  FunctionLength:18 Version:2 X:1 E:1 F:1 EpilogCount:5 CodeWords:4
//! [ext]   EpilogCount:16 CodeWords:8 (when both header counts are zero)
//! scopes  EpilogCount x { StartOffset:18 Res:2 Condition:4 StartIndex:8 }
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
    /// In halfwords from the start of the function.
    pub offset: u32,
    pub condition: u8,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XData {
    pub address: u64,
    /// In halfwords.
    pub function_length: u32,
    pub version: u8,
    pub exception_data: bool,
    pub epilog_in_header: bool,
    /// The function is a fragment without a prolog.
    pub fragment: bool,
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
        let mut epilog_count = (header >> 23) & 0x1f;
        let mut code_words = header >> 28;
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
                    condition: ((scope >> 20) & 0xf) as u8,
                    index: scope >> 24,
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
            fragment: header & (1 << 22) != 0,
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

    pub fn handler_address(&self) -> Option<u64> {
        self.exception_data
            .then_some(self.codes_address + self.codes.len() as u64)
    }
}

/// Unwind through a function described by `xdata` with the pc `offset` bytes
/// in. Epilog conditions are not evaluated.
pub(super) fn unwind(
    restore: &mut Restore<'_, '_>,
    config: &UnwindConfig,
    xdata: &XData,
    base: u64,
    offset: u32,
) -> Result<Option<(u64, u64)>> {
    let code_bytes = xdata.code_words * 4;
    let function_len = 2 * xdata.function_length;

    if offset < code_bytes * 4 && !xdata.fragment {
        let prolog = xdata.codes_from(0);
        let len = codes::sequence_len(&prolog, false);
        if offset < len {
            trace!("inside prolog");
            codes::process(restore, config, &prolog, len - offset)?;
            return Ok(None);
        }
    }

    if !xdata.epilog_in_header {
        for scope in &xdata.epilogs {
            let start = 2 * scope.offset;
            if offset < start {
                break;
            }
            if offset - start < code_bytes.wrapping_sub(scope.index).wrapping_mul(4) {
                let epilog = xdata.codes_from(scope.index);
                let len = codes::sequence_len(&epilog, true);
                if offset <= start + len {
                    trace!("inside epilog at {start:#x}");
                    codes::process(restore, config, &epilog, offset - start)?;
                    return Ok(None);
                }
            }
        }
    } else if function_len.wrapping_sub(offset)
        <= code_bytes.wrapping_sub(xdata.epilog_count).wrapping_mul(4)
    {
        let epilog = xdata.codes_from(xdata.epilog_count);
        let len = codes::sequence_len(&epilog, true);
        let start = function_len.wrapping_sub(len);
        if offset >= start {
            trace!("inside epilog at end of function");
            codes::process(restore, config, &epilog, offset - start)?;
            return Ok(None);
        }
    }

    codes::process(restore, config, &xdata.codes_from(0), 0)?;

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
            "xdata at {:#x} length {:#x} version {} X {} E {} F {} epilogs {} code words {}",
            self.address,
            self.function_length * 2,
            self.version,
            self.exception_data as u8,
            self.epilog_in_header as u8,
            self.fragment as u8,
            self.epilog_count,
            self.code_words
        )?;
        for scope in &self.epilogs {
            writeln!(
                f,
                "    epilog at {:#x} condition {:#x} codes from {}",
                scope.offset * 2,
                scope.condition,
                scope.index
            )?;
        }
        for code in self.codes_from(0) {
            writeln!(f, "    {code}")?;
        }
        Ok(())
    }
}
