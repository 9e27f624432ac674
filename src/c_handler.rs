//! `__C_specific_handler`, the language handler of `__try` blocks.

use core::fmt;

use crate::arch::Architecture;
use crate::dispatch::{DispatcherContext, Unwinder};
use crate::error::Result;
use crate::memory::Memory;
use crate::nt::{
    ExceptionDisposition, ExceptionRecord, EXCEPTION_CONTINUE_EXECUTION,
    EXCEPTION_CONTINUE_SEARCH, EXCEPTION_EXECUTE_HANDLER, EXCEPTION_TARGET_UNWIND,
};
use crate::process::HandlerResult;

/// One `__try` block. Addresses are image relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeRecord {
    pub begin: u32,
    pub end: u32,
    /// The `__except` filter, `EXCEPTION_EXECUTE_HANDLER` for a constant
    /// filter, or the `__finally` block when there is no jump target.
    pub handler: u32,
    /// Start of the `__except` block, 0 for `__finally`.
    pub jump_target: u32,
}

impl ScopeRecord {
    pub const SIZE: u64 = 16;

    pub fn contains(&self, base: u64, pc: u64) -> bool {
        base + self.begin as u64 <= pc && pc < base + self.end as u64
    }

    pub fn is_finally(&self) -> bool {
        self.jump_target == 0
    }
}

/// `SCOPE_TABLE`, the handler data of functions using
/// `__C_specific_handler`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeTable {
    pub address: u64,
    pub records: Vec<ScopeRecord>,
}

impl ScopeTable {
    pub fn read(mem: &dyn Memory, address: u64) -> Result<Self> {
        let count = mem.read_u32(address)?;
        let mut records = Vec::with_capacity(count.min(256) as usize);
        for i in 0..count as u64 {
            let record = address + 4 + i * ScopeRecord::SIZE;
            records.push(ScopeRecord {
                begin: mem.read_u32(record)?,
                end: mem.read_u32(record + 4)?,
                handler: mem.read_u32(record + 8)?,
                jump_target: mem.read_u32(record + 12)?,
            });
        }
        Ok(Self { address, records })
    }
}

/// Dumps relative to an image base.
pub struct ScopeTableDisplay<'a> {
    pub table: &'a ScopeTable,
    pub base: u64,
}

impl fmt::Display for ScopeTableDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope table at {:#x}, {} entries", self.table.address, self.table.records.len())?;
        let base = self.base;
        for (i, scope) in self.table.records.iter().enumerate() {
            write!(
                f,
                "\n  {i}: {:#x}-{:#x} handler {:#x} target {:#x}",
                base + scope.begin as u64,
                base + scope.end as u64,
                scope.handler,
                scope.jump_target
            )?;
        }
        Ok(())
    }
}

/// Run the `__finally` blocks around the unwound pc, or find an `__except`
/// block willing to take the exception and unwind to it.
///
/// `dispatch.scope_index` advances past every `__finally` that ran, so a
/// handler called again for the same frame after a collided unwind does not
/// repeat them.
pub fn c_specific_handler<A: Architecture>(
    unwinder: &Unwinder<'_, A>,
    record: &mut ExceptionRecord,
    frame: u64,
    context: &A::Context,
    dispatch: &mut DispatcherContext<A>,
) -> Result<HandlerResult<A::Context>> {
    let process = unwinder.process();
    let env = process.env();
    let table = ScopeTable::read(env.mem, dispatch.handler_data)?;
    let base = dispatch.image_base;
    let mut pc = dispatch.control_pc;
    if dispatch.control_pc_is_unwound {
        pc = pc.wrapping_sub(process.arch.call_instruction_size(&env, pc));
    }
    trace!("frame {frame:#x} pc {pc:#x} {}", ScopeTableDisplay { table: &table, base });

    let start = dispatch.scope_index as usize;
    let scopes = table.records.iter().enumerate().skip(start);

    if record.is_unwinding() {
        for (i, scope) in scopes {
            if !scope.contains(base, pc) || !scope.is_finally() {
                continue;
            }
            if record.flags & EXCEPTION_TARGET_UNWIND != 0 && scope.contains(base, dispatch.target_ip) {
                break;
            }
            let handler = base + scope.handler as u64;
            dispatch.scope_index = i as u32 + 1;
            trace!("scope {i} calling __finally {handler:#x} frame {frame:#x}");
            process.invoker.call_termination_handler(handler, true, frame);
        }
        return Ok(ExceptionDisposition::ContinueSearch.into());
    }

    for (i, scope) in scopes {
        if !scope.contains(base, pc) || scope.is_finally() {
            continue;
        }
        if scope.handler as i32 != EXCEPTION_EXECUTE_HANDLER {
            let filter = base + scope.handler as u64;
            trace!("scope {i} calling filter {filter:#x} frame {frame:#x}");
            match process.invoker.call_exception_filter(filter, record, context, frame) {
                EXCEPTION_CONTINUE_SEARCH => continue,
                EXCEPTION_CONTINUE_EXECUTION => {
                    return Ok(ExceptionDisposition::ContinueExecution.into())
                }
                EXCEPTION_EXECUTE_HANDLER => {}
                other => debug!("filter {filter:#x} returned {other}, unwinding"),
            }
        }

        let target = base + scope.jump_target as u64;
        trace!("unwinding to target {target:#x}");
        let code = record.code.0 as u64;
        let start = dispatch.context_record.clone();
        let mut history = dispatch.history_table.take();
        let resume =
            unwinder.unwind_ex(Some(frame), target, Some(record), code, start, history.as_mut());
        dispatch.history_table = history;
        return Ok(HandlerResult::Resume(resume?));
    }
    Ok(ExceptionDisposition::ContinueSearch.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm64::Arm64;
    use crate::context::Arm64Context;
    use crate::memory::SparseMemory;
    use crate::module::ModuleList;
    use crate::nt::{NtStatus, EXCEPTION_UNWINDING};
    use crate::process::{Process, Teb};
    use crate::testing::{Call, MockInvoker};

    const BASE: u64 = 0x1_0000_0000;
    const TABLE: u64 = BASE + 0x3000;

    fn scopes(records: &[[u32; 4]]) -> SparseMemory {
        let mut mem = SparseMemory::new();
        mem.map(BASE, 0x4000);
        mem.write_u32(TABLE, records.len() as u32);
        for (i, r) in records.iter().enumerate() {
            for (j, value) in r.iter().enumerate() {
                mem.write_u32(TABLE + 4 + i as u64 * 16 + j as u64 * 4, *value);
            }
        }
        mem
    }

    fn arm64_process(mem: SparseMemory, invoker: MockInvoker<Arm64>) -> Process<Arm64> {
        Process::new(Arm64, Box::new(mem), Box::new(ModuleList::new()), Box::new(invoker))
    }

    fn dispatch(pc: u64, unwound: bool) -> DispatcherContext<Arm64> {
        let mut dispatch = DispatcherContext::new(Arm64Context::default());
        dispatch.control_pc = pc;
        dispatch.control_pc_is_unwound = unwound;
        dispatch.image_base = BASE;
        dispatch.handler_data = TABLE;
        dispatch
    }

    #[test]
    fn scope_table_dump() {
        let mem = scopes(&[[0x1000, 0x1080, 0x1090, 0], [0x1000, 0x1100, 1, 0x1200]]);
        let table = ScopeTable::read(&mem, TABLE).unwrap();
        assert!(table.records[0].is_finally());
        assert!(table.records[1].contains(BASE, BASE + 0x10ff));
        assert!(!table.records[1].contains(BASE, BASE + 0x1100));
        let dump = ScopeTableDisplay { table: &table, base: BASE }.to_string();
        assert!(dump.contains("1: 0x100001000-0x100001100 handler 0x1 target 0x1200"));
    }

    #[test]
    fn finally_blocks_run_once() {
        let mem = scopes(&[
            [0x1000, 0x1080, 0x1090, 0],
            [0x1000, 0x1100, 0x10a0, 0],
            [0x2000, 0x2100, 0x20a0, 0],
        ]);
        let invoker = MockInvoker::new();
        let calls = invoker.calls();
        let process = arm64_process(mem, invoker);
        let teb = Teb::new(0x7000, 0x8000);
        let unwinder = Unwinder::new(&process, &teb);

        let mut record = ExceptionRecord::unwind(0);
        record.flags |= EXCEPTION_UNWINDING;
        let mut dispatch = dispatch(BASE + 0x1040, false);
        let context = Arm64Context::default();

        for _ in 0..2 {
            let result =
                c_specific_handler(&unwinder, &mut record, 0x7f00, &context, &mut dispatch).unwrap();
            assert_eq!(result, HandlerResult::Disposition(1));
        }
        assert_eq!(dispatch.scope_index, 2);
        assert_eq!(
            *calls.lock(),
            [
                Call::Termination {
                    handler: BASE + 0x1090,
                    abnormal: true,
                    frame: 0x7f00
                },
                Call::Termination {
                    handler: BASE + 0x10a0,
                    abnormal: true,
                    frame: 0x7f00
                },
            ]
        );
    }

    #[test]
    fn unwound_pc_points_into_the_call() {
        // the return address is the first instruction after the scope
        let mem = scopes(&[[0x1000, 0x1040, 0x1090, 0]]);
        let invoker = MockInvoker::new();
        let calls = invoker.calls();
        let process = arm64_process(mem, invoker);
        let teb = Teb::new(0x7000, 0x8000);
        let unwinder = Unwinder::new(&process, &teb);
        let mut record = ExceptionRecord::unwind(0);
        record.flags |= EXCEPTION_UNWINDING;
        let context = Arm64Context::default();

        let mut faulting = dispatch(BASE + 0x1040, false);
        c_specific_handler(&unwinder, &mut record, 0x7f00, &context, &mut faulting).unwrap();
        assert!(calls.lock().is_empty());

        let mut returning = dispatch(BASE + 0x1040, true);
        c_specific_handler(&unwinder, &mut record, 0x7f00, &context, &mut returning).unwrap();
        assert_eq!(calls.lock().len(), 1);
    }

    #[test]
    fn target_unwind_stops_at_the_target_scope() {
        let mem = scopes(&[[0x1000, 0x1100, 0x1190, 0], [0x1000, 0x1200, 0x1290, 0]]);
        let invoker = MockInvoker::new();
        let calls = invoker.calls();
        let process = arm64_process(mem, invoker);
        let teb = Teb::new(0x7000, 0x8000);
        let unwinder = Unwinder::new(&process, &teb);

        let mut record = ExceptionRecord::unwind(0);
        record.flags |= EXCEPTION_UNWINDING | EXCEPTION_TARGET_UNWIND;
        let mut dispatch = dispatch(BASE + 0x1010, false);
        dispatch.target_ip = BASE + 0x1050;
        c_specific_handler(&unwinder, &mut record, 0x7f00, &Arm64Context::default(), &mut dispatch)
            .unwrap();
        assert!(calls.lock().is_empty());
        assert_eq!(dispatch.scope_index, 0);
    }

    #[test]
    fn filters_decide_the_search() {
        let mem = scopes(&[
            [0x1000, 0x1100, 0x1180, 0],
            [0x1000, 0x1100, 0x1200, 0x1290],
            [0x1000, 0x1100, 0x1300, 0x1390],
        ]);
        let invoker = MockInvoker::new()
            .with_filter(BASE + 0x1200, EXCEPTION_CONTINUE_SEARCH)
            .with_filter(BASE + 0x1300, EXCEPTION_CONTINUE_EXECUTION);
        let calls = invoker.calls();
        let process = arm64_process(mem, invoker);
        let teb = Teb::new(0x7000, 0x8000);
        let unwinder = Unwinder::new(&process, &teb);

        let mut record = ExceptionRecord::new(NtStatus::ACCESS_VIOLATION, 0, BASE + 0x1010);
        let mut dispatch = dispatch(BASE + 0x1010, false);
        let result = c_specific_handler(
            &unwinder,
            &mut record,
            0x7f00,
            &Arm64Context::default(),
            &mut dispatch,
        )
        .unwrap();

        // the __finally is skipped while searching
        assert_eq!(result, HandlerResult::Disposition(0));
        assert_eq!(
            *calls.lock(),
            [
                Call::Filter {
                    filter: BASE + 0x1200,
                    frame: 0x7f00
                },
                Call::Filter {
                    filter: BASE + 0x1300,
                    frame: 0x7f00
                },
            ]
        );
    }
}
