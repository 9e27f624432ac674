//! A scripted [`HandlerInvoker`] recording every call it gets.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arch::Architecture;
use crate::c_handler::c_specific_handler;
use crate::dispatch::{DispatcherContext, Unwinder};
use crate::error::Result;
use crate::nt::{ExceptionDisposition, ExceptionRecord, EXCEPTION_EXECUTE_HANDLER};
use crate::process::{HandlerInvoker, HandlerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Language { handler: u64, frame: u64, flags: u32 },
    Filter { filter: u64, frame: u64 },
    Termination { handler: u64, abnormal: bool, frame: u64 },
    Consolidate { callback: u64 },
}

pub type CustomHandler<A> = Box<
    dyn Fn(&Unwinder<'_, A>, &mut ExceptionRecord, &mut DispatcherContext<A>) -> u32 + Send + Sync,
>;

pub enum Behavior<A: Architecture> {
    CSpecific,
    Disposition(u32),
    Custom(CustomHandler<A>),
}

pub struct MockInvoker<A: Architecture> {
    handlers: HashMap<u64, Behavior<A>>,
    filters: HashMap<u64, i32>,
    consolidate_target: u64,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl<A: Architecture> MockInvoker<A> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            filters: HashMap::new(),
            consolidate_target: 0,
            calls: Arc::default(),
        }
    }

    pub fn with_handler(mut self, address: u64, behavior: Behavior<A>) -> Self {
        self.handlers.insert(address, behavior);
        self
    }

    /// Filters not set here return `EXCEPTION_EXECUTE_HANDLER`.
    pub fn with_filter(mut self, address: u64, result: i32) -> Self {
        self.filters.insert(address, result);
        self
    }

    pub fn with_consolidate_target(mut self, target: u64) -> Self {
        self.consolidate_target = target;
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<Call>>> {
        self.calls.clone()
    }
}

impl<A: Architecture> HandlerInvoker<A> for MockInvoker<A> {
    fn call_language_handler(
        &self,
        unwinder: &Unwinder<'_, A>,
        handler: u64,
        record: &mut ExceptionRecord,
        frame: u64,
        context: &A::Context,
        dispatch: &mut DispatcherContext<A>,
    ) -> Result<HandlerResult<A::Context>> {
        self.calls.lock().push(Call::Language {
            handler,
            frame,
            flags: record.flags,
        });
        match self.handlers.get(&handler) {
            Some(Behavior::CSpecific) => c_specific_handler(unwinder, record, frame, context, dispatch),
            Some(Behavior::Disposition(raw)) => Ok(HandlerResult::Disposition(*raw)),
            Some(Behavior::Custom(f)) => Ok(HandlerResult::Disposition(f(unwinder, record, dispatch))),
            None => Ok(ExceptionDisposition::ContinueSearch.into()),
        }
    }

    fn call_exception_filter(
        &self,
        filter: u64,
        _record: &ExceptionRecord,
        _context: &A::Context,
        frame: u64,
    ) -> i32 {
        self.calls.lock().push(Call::Filter { filter, frame });
        self.filters
            .get(&filter)
            .copied()
            .unwrap_or(EXCEPTION_EXECUTE_HANDLER)
    }

    fn call_termination_handler(&self, handler: u64, abnormal: bool, frame: u64) {
        self.calls.lock().push(Call::Termination {
            handler,
            abnormal,
            frame,
        });
    }

    fn call_consolidate(
        &self,
        callback: u64,
        _record: &ExceptionRecord,
        _context: &A::Context,
    ) -> Result<u64> {
        self.calls.lock().push(Call::Consolidate { callback });
        Ok(self.consolidate_target)
    }
}
