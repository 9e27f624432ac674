//! `UNWIND_HISTORY_TABLE`: a small cache of recent function lookups that a
//! caller walking many frames can pass along.

use crate::arch::FunctionEntry;

pub const UNWIND_HISTORY_TABLE_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry<F> {
    pub image_base: u64,
    pub start: u64,
    pub end: u64,
    pub function: FunctionEntry<F>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindHistoryTable<F> {
    entries: Vec<HistoryEntry<F>>,
    /// Lowest and highest pc covered by any entry.
    low_address: u64,
    high_address: u64,
}

impl<F> Default for UnwindHistoryTable<F> {
    fn default() -> Self {
        Self {
            entries: Vec::with_capacity(UNWIND_HISTORY_TABLE_SIZE),
            low_address: u64::MAX,
            high_address: 0,
        }
    }
}

impl<F: Copy> UnwindHistoryTable<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, pc: u64) -> Option<(u64, FunctionEntry<F>)> {
        if pc < self.low_address || pc >= self.high_address {
            return None;
        }
        self.entries
            .iter()
            .find(|e| e.start <= pc && pc < e.end)
            .map(|e| (e.image_base, e.function))
    }

    /// Remember a lookup result. Once the table is full further results are
    /// dropped.
    pub fn insert(&mut self, image_base: u64, start: u64, end: u64, function: FunctionEntry<F>) {
        if self.entries.len() == UNWIND_HISTORY_TABLE_SIZE {
            return;
        }
        self.low_address = self.low_address.min(start);
        self.high_address = self.high_address.max(end);
        self.entries.push(HistoryEntry {
            image_base,
            start,
            end,
            function,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: u64) -> FunctionEntry<u32> {
        FunctionEntry {
            address,
            function: address as u32,
        }
    }

    #[test]
    fn hit_and_miss() {
        let mut table = UnwindHistoryTable::new();
        table.insert(0x10000, 0x11000, 0x11100, entry(0x15000));
        table.insert(0x10000, 0x12000, 0x12080, entry(0x1500c));

        assert_eq!(table.lookup(0x12010), Some((0x10000, entry(0x1500c))));
        assert_eq!(table.lookup(0x11500), None);
        assert_eq!(table.lookup(0x12080), None);
    }

    #[test]
    fn full_table_keeps_old_entries() {
        let mut table = UnwindHistoryTable::new();
        for i in 0..UNWIND_HISTORY_TABLE_SIZE as u64 + 3 {
            table.insert(0, i * 0x100, i * 0x100 + 0x80, entry(i));
        }
        assert_eq!(table.len(), UNWIND_HISTORY_TABLE_SIZE);
        assert_eq!(table.lookup(0x40).map(|(_, e)| e.address), Some(0));
        assert_eq!(table.lookup(0xd40), None);
    }
}
