//! Loaded PE images and the exception tables they carry.

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::memory::Memory;

const MZ_SIGNATURE: u16 = 0x5a4d;
const PE_POINTER_OFFSET: u64 = 0x3c;
const PE_SIGNATURE: u32 = 0x0000_4550;
const PE32_MAGIC: u16 = 0x10b;
const PE64_MAGIC: u16 = 0x20b;
const OPTIONAL_HEADER_OFFSET: u64 = 0x18;
const SIZE_OF_IMAGE_OFFSET: u64 = 0x50;
const PE32_DIRECTORIES_OFFSET: u64 = 0x60;
const PE64_DIRECTORIES_OFFSET: u64 = 0x70;

const IMAGE_DIRECTORY_ENTRY_EXCEPTION: u64 = 3;
const IMAGE_DIRECTORY_ENTRY_LOAD_CONFIG: u64 = 10;

/// `IMAGE_LOAD_CONFIG_DIRECTORY64.CHPEMetadataPointer`
const CHPE_METADATA_POINTER_OFFSET: u64 = 0xc8;
/// `IMAGE_ARM64EC_METADATA.CodeMap` / `CodeMapCount`
const EC_CODE_MAP_OFFSET: u64 = 0x4;
/// `IMAGE_ARM64EC_METADATA.ExtraRFETable` / `ExtraRFETableSize`
const EC_EXTRA_RFE_TABLE_OFFSET: u64 = 0x40;

/// An `IMAGE_DATA_DIRECTORY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Directory {
    pub rva: u32,
    pub size: u32,
}

impl Directory {
    fn read(mem: &dyn Memory, address: u64) -> Result<Option<Self>> {
        let rva = mem.read_u32(address)?;
        let size = mem.read_u32(address + 4)?;
        Ok((rva != 0 && size != 0).then_some(Self { rva, size }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRangeKind {
    Arm64,
    Arm64Ec,
    Amd64,
}

/// One `IMAGE_CHPE_RANGE_ENTRY` of an ARM64EC code map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRange {
    pub start: u32,
    pub length: u32,
    pub kind: CodeRangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Arm64EcMetadata {
    pub code_map: Vec<CodeRange>,
    /// The table describing the native half of the image.
    pub extra_rfe_table: Option<Directory>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub base: u64,
    pub size: u64,
    pub exception_directory: Option<Directory>,
    pub arm64ec: Option<Arm64EcMetadata>,
}

impl Module {
    pub fn new(base: u64, size: u64, exception_directory: Option<Directory>) -> Self {
        Self {
            base,
            size,
            exception_directory,
            arm64ec: None,
        }
    }

    pub fn contains(&self, pc: u64) -> bool {
        self.base <= pc && pc < self.base + self.size
    }

    /// The ARM64EC code map range containing `pc`, if any.
    pub fn code_kind(&self, pc: u64) -> Option<CodeRangeKind> {
        let ec = self.arm64ec.as_ref()?;
        let rva = pc.wrapping_sub(self.base);
        ec.code_map
            .iter()
            .find(|range| {
                range.start as u64 <= rva && rva < range.start as u64 + range.length as u64
            })
            .map(|range| range.kind)
    }

    /// Whether `pc` is native code of an ARM64EC image.
    pub fn is_ec_code(&self, pc: u64) -> bool {
        matches!(
            self.code_kind(pc),
            Some(CodeRangeKind::Arm64 | CodeRangeKind::Arm64Ec)
        )
    }

    /// Read the headers of an image mapped at `base`.
    #[instrument(skip(mem))]
    pub fn from_image(mem: &dyn Memory, base: u64) -> Result<Self> {
        if mem.read_u16(base)? != MZ_SIGNATURE {
            return Err(Error::malformed(base, "no MZ signature"));
        }
        let nt = base + mem.read_u32(base + PE_POINTER_OFFSET)? as u64;
        if mem.read_u32(nt)? != PE_SIGNATURE {
            return Err(Error::malformed(nt, "no PE signature"));
        }
        let size = mem.read_u32(nt + SIZE_OF_IMAGE_OFFSET)? as u64;
        let optional = nt + OPTIONAL_HEADER_OFFSET;
        let directories = match mem.read_u16(optional)? {
            PE32_MAGIC => optional + PE32_DIRECTORIES_OFFSET,
            PE64_MAGIC => optional + PE64_DIRECTORIES_OFFSET,
            magic => {
                return Err(Error::malformed(
                    optional,
                    format!("unknown optional header magic {magic:#x}"),
                ))
            }
        };

        let exception_directory =
            Directory::read(mem, directories + IMAGE_DIRECTORY_ENTRY_EXCEPTION * 8)?;
        let load_config = Directory::read(mem, directories + IMAGE_DIRECTORY_ENTRY_LOAD_CONFIG * 8)?;
        let arm64ec = match load_config {
            Some(dir) if dir.size as u64 >= CHPE_METADATA_POINTER_OFFSET + 8 => {
                read_arm64ec_metadata(mem, base, base + dir.rva as u64)?
            }
            _ => None,
        };

        debug!(
            "module at {base:#x}, size {size:#x}, exceptions {exception_directory:x?}, arm64ec: {}",
            arm64ec.is_some()
        );
        Ok(Self {
            base,
            size,
            exception_directory,
            arm64ec,
        })
    }
}

fn read_arm64ec_metadata(
    mem: &dyn Memory,
    base: u64,
    load_config: u64,
) -> Result<Option<Arm64EcMetadata>> {
    let metadata = mem.read_u64(load_config + CHPE_METADATA_POINTER_OFFSET)?;
    if metadata == 0 {
        return Ok(None);
    }
    let code_map = base + mem.read_u32(metadata + EC_CODE_MAP_OFFSET)? as u64;
    let count = mem.read_u32(metadata + EC_CODE_MAP_OFFSET + 4)?;
    let mut ranges = Vec::with_capacity(count as usize);
    for i in 0..count as u64 {
        let start = mem.read_u32(code_map + i * 8)?;
        let length = mem.read_u32(code_map + i * 8 + 4)?;
        let kind = match start & 3 {
            0 => CodeRangeKind::Arm64,
            1 => CodeRangeKind::Arm64Ec,
            _ => CodeRangeKind::Amd64,
        };
        ranges.push(CodeRange {
            start: start & !3,
            length,
            kind,
        });
    }
    Ok(Some(Arm64EcMetadata {
        code_map: ranges,
        extra_rfe_table: Directory::read(mem, metadata + EC_EXTRA_RFE_TABLE_OFFSET)?,
    }))
}

/// The loader's view of which image covers an address.
pub trait ModuleMap {
    fn find_module(&self, pc: u64) -> Option<Module>;
}

/// A plain list of loaded modules.
#[derive(Debug, Default)]
pub struct ModuleList {
    modules: RwLock<Vec<Module>>,
}

impl ModuleList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, module: Module) {
        self.modules.write().push(module);
    }

    pub fn unload(&self, base: u64) {
        self.modules.write().retain(|m| m.base != base);
    }
}

impl ModuleMap for ModuleList {
    fn find_module(&self, pc: u64) -> Option<Module> {
        self.modules.read().iter().find(|m| m.contains(pc)).cloned()
    }
}
