//! Function tables registered at runtime, mostly by JIT compilers.
//!
//! The registry is shared process state. It is guarded by a single mutex that
//! is only held while the entry list is traversed or modified, never while a
//! host callback runs.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Resolves the `RUNTIME_FUNCTION` covering a pc lazily. Returns the address of
/// the descriptor.
pub type FunctionTableCallback = Arc<dyn Fn(u64) -> Option<u64> + Send + Sync>;

/// Identifies a table added with [`FunctionTableRegistry::add_growable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DynamicTableHandle(u64);

struct DynamicEntry {
    handle: DynamicTableHandle,
    base: u64,
    end: u64,
    /// Address of the descriptor array, or the identifier passed to
    /// [`FunctionTableRegistry::install_callback`].
    table: u64,
    count: u32,
    max_count: u32,
    callback: Option<FunctionTableCallback>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<DynamicEntry>,
    next_handle: u64,
}

/// A table that may cover a pc. `count` descriptors start at `table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicTable {
    pub base: u64,
    pub table: u64,
    pub count: u32,
}

#[derive(Default)]
pub struct FunctionTableRegistry {
    inner: Mutex<Inner>,
}

impl core::fmt::Debug for FunctionTableRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_list()
            .entries(
                inner
                    .entries
                    .iter()
                    .map(|e| (e.base, e.end, e.table, e.count, e.callback.is_some())),
            )
            .finish()
    }
}

impl FunctionTableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(
        &self,
        base: u64,
        end: u64,
        table: u64,
        count: u32,
        max_count: u32,
        callback: Option<FunctionTableCallback>,
    ) -> Result<DynamicTableHandle> {
        let mut inner = self.inner.lock();
        inner.entries.try_reserve(1).map_err(|_| Error::NoMemory)?;
        inner.next_handle += 1;
        let handle = DynamicTableHandle(inner.next_handle);
        inner.entries.push(DynamicEntry {
            handle,
            base,
            end,
            table,
            count,
            max_count,
            callback,
        });
        Ok(handle)
    }

    /// `RtlAddFunctionTable`. `end` is where the last function of the table
    /// ends, which only the architecture knows how to compute.
    #[instrument(skip(self))]
    pub fn add_function_table(&self, table: u64, count: u32, base: u64, end: u64) -> bool {
        self.push(base, end, table, count, 0, None).is_ok()
    }

    /// `RtlInstallFunctionTableCallback`. The identifier must have its two
    /// low bits set.
    #[instrument(skip(self, callback))]
    pub fn install_callback(
        &self,
        table: u64,
        base: u64,
        length: u32,
        callback: FunctionTableCallback,
    ) -> bool {
        if table & 3 != 3 {
            return false;
        }
        let Some(end) = base.checked_add(length as u64) else {
            debug!("callback range at {base:#x} wraps around");
            return false;
        };
        self.push(base, end, table, 0, 0, Some(callback)).is_ok()
    }

    /// `RtlAddGrowableFunctionTable`
    #[instrument(skip(self))]
    pub fn add_growable(
        &self,
        table: u64,
        count: u32,
        max_count: u32,
        base: u64,
        end: u64,
    ) -> Result<DynamicTableHandle> {
        self.push(base, end, table, count, max_count, None)
    }

    /// `RtlGrowFunctionTable`. Counts that shrink the table or exceed its
    /// capacity are ignored.
    pub fn grow(&self, handle: DynamicTableHandle, count: u32) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.handle == handle) {
            if count > entry.count && count <= entry.max_count {
                entry.count = count;
            }
        }
    }

    /// `RtlDeleteGrowableFunctionTable`
    pub fn delete_growable(&self, handle: DynamicTableHandle) {
        let mut inner = self.inner.lock();
        inner.entries.retain(|e| e.handle != handle);
    }

    /// `RtlDeleteFunctionTable`
    pub fn delete_function_table(&self, table: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.iter().position(|e| e.table == table) {
            Some(index) => {
                inner.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Find the table covering `pc`, asking the owner's callback if the entry
    /// has one.
    pub fn lookup(&self, pc: u64) -> Option<DynamicTable> {
        let (base, callback) = {
            let inner = self.inner.lock();
            let entry = inner
                .entries
                .iter()
                .find(|e| e.base <= pc && pc < e.end)?;
            match &entry.callback {
                Some(callback) => (entry.base, callback.clone()),
                None => {
                    return Some(DynamicTable {
                        base: entry.base,
                        table: entry.table,
                        count: entry.count,
                    })
                }
            }
        };

        trace!("calling function table callback for {pc:#x}");
        let table = callback(pc)?;
        Some(DynamicTable {
            base,
            table,
            count: 1,
        })
    }
}
