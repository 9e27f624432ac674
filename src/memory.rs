//! Access to the memory the unwinder walks: module images holding the unwind
//! tables and the thread stack holding saved registers.
//!
//! Nothing in the crate dereferences raw pointers directly. Live unwinding
//! goes through [`ProcessMemory`], offline unwinding and the tests through
//! [`SparseMemory`].

use std::collections::BTreeMap;

use crate::error::{Error, Result};

pub trait Memory {
    /// Fill `buf` with the bytes at `address`.
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    fn read_u8(&self, address: u64) -> Result<u8> {
        let mut buf = [0; 1];
        self.read(address, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, address: u64) -> Result<u16> {
        let mut buf = [0; 2];
        self.read(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, address: u64) -> Result<u32> {
        let mut buf = [0; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, address: u64) -> Result<u64> {
        let mut buf = [0; 8];
        self.read(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_u128(&self, address: u64) -> Result<u128> {
        let mut buf = [0; 16];
        self.read(address, &mut buf)?;
        Ok(u128::from_le_bytes(buf))
    }

    fn read_vec(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read(address, &mut buf)?;
        Ok(buf)
    }
}

impl<M: Memory + ?Sized> Memory for &M {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read(address, buf)
    }
}

/// Memory made of disjoint byte regions, for captured or synthesized
/// processes.
#[derive(Debug, Clone, Default)]
pub struct SparseMemory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `bytes` to `address`, merging with any region it touches.
    pub fn write(&mut self, address: u64, bytes: &[u8]) {
        let end = address + bytes.len() as u64;
        let touching: Vec<u64> = self
            .regions
            .range(..=end)
            .filter(|(start, data)| **start + data.len() as u64 >= address)
            .map(|(start, _)| *start)
            .collect();

        let new_start = touching.first().map_or(address, |s| (*s).min(address));
        let mut new_end = end;
        for start in &touching {
            new_end = new_end.max(start + self.regions[start].len() as u64);
        }

        let mut merged = vec![0; (new_end - new_start) as usize];
        for start in touching {
            if let Some(data) = self.regions.remove(&start) {
                let off = (start - new_start) as usize;
                merged[off..off + data.len()].copy_from_slice(&data);
            }
        }
        let off = (address - new_start) as usize;
        merged[off..off + bytes.len()].copy_from_slice(bytes);
        self.regions.insert(new_start, merged);
    }

    pub fn write_u8(&mut self, address: u64, value: u8) {
        self.write(address, &[value]);
    }

    pub fn write_u16(&mut self, address: u64, value: u16) {
        self.write(address, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, address: u64, value: u32) {
        self.write(address, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        self.write(address, &value.to_le_bytes());
    }

    /// Map `len` zeroed bytes at `address`, keeping anything already there.
    pub fn map(&mut self, address: u64, len: usize) {
        let existing: Vec<(u64, Vec<u8>)> = self
            .regions
            .range(..address + len as u64)
            .filter(|(start, data)| **start + data.len() as u64 > address)
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        self.write(address, &vec![0; len]);
        for (start, data) in existing {
            self.write(start, &data);
        }
    }
}

impl Memory for SparseMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        let fail = || Error::MemoryAccess { address, len };
        let (start, data) = self.regions.range(..=address).next_back().ok_or_else(fail)?;
        let off = (address - start) as usize;
        let bytes = data.get(off..off + len).ok_or_else(fail)?;
        buf.copy_from_slice(bytes);
        Ok(())
    }
}

/// The memory of the current process.
#[derive(Debug)]
pub struct ProcessMemory {
    _priv: (),
}

impl ProcessMemory {
    /// # Safety
    ///
    /// Every address the unwinder is handed (image bases, table addresses,
    /// stack pointers taken from contexts) must be readable for as long as
    /// this value is used. Null is the only address rejected up front.
    pub unsafe fn new() -> Self {
        Self { _priv: () }
    }
}

impl Memory for ProcessMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        if address == 0 {
            return Err(Error::MemoryAccess {
                address,
                len: buf.len(),
            });
        }
        let src = core::ptr::with_exposed_provenance::<u8>(address as usize);
        // SAFETY: Readability is guaranteed by the contract of `new`.
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }
}

/// A bounds-checked reader over a fetched unwind data blob.
#[derive(Debug, Clone)]
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    /// Address of `data[0]`, for error reporting.
    base: u64,
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8], base: u64) -> Self {
        Self { data, base, pos: 0 }
    }

    pub(crate) fn address(&self) -> u64 {
        self.base + self.pos as u64
    }

    pub(crate) fn read_bytes(&mut self, amount: usize) -> Result<&'a [u8]> {
        let Some(bytes) = self.data.get(self.pos..self.pos + amount) else {
            return Err(Error::malformed(
                self.address(),
                format!(
                    "index out of bounds, tried to read {amount} bytes from {}",
                    self.data.len() - self.pos.min(self.data.len())
                ),
            ));
        };
        self.pos += amount;
        Ok(bytes)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_regions_merge() {
        let mut mem = SparseMemory::new();
        mem.write_u32(0x1000, 0xdead_beef);
        mem.write_u32(0x1004, 0x1234_5678);
        assert_eq!(mem.read_u64(0x1000).unwrap(), 0x1234_5678_dead_beef);

        mem.write_u8(0x1002, 0xaa);
        assert_eq!(mem.read_u32(0x1000).unwrap(), 0xdeaa_beef);
    }

    #[test]
    fn sparse_unmapped_read_fails() {
        let mut mem = SparseMemory::new();
        mem.write_u32(0x1000, 1);
        assert_eq!(
            mem.read_u64(0x1000),
            Err(Error::MemoryAccess {
                address: 0x1000,
                len: 8
            })
        );
        assert!(mem.read_u8(0xfff).is_err());
    }

    #[test]
    fn map_keeps_contents() {
        let mut mem = SparseMemory::new();
        mem.write_u32(0x2010, 7);
        mem.map(0x2000, 0x100);
        assert_eq!(mem.read_u32(0x2010).unwrap(), 7);
        assert_eq!(mem.read_u32(0x20fc).unwrap(), 0);
    }

    #[test]
    fn cursor_bounds() {
        let data = [1, 0, 2, 0, 0, 0];
        let mut cursor = Cursor::new(&data, 0x500);
        assert_eq!(cursor.read_u16().unwrap(), 1);
        assert_eq!(cursor.read_u32().unwrap(), 2);
        assert!(cursor.read_u8().is_err());
    }
}
