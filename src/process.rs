//! The process an unwind runs in: its memory, loaded modules, dynamic
//! function tables and the host side that actually runs handlers.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::arch::{Architecture, UnwindEnv};
use crate::config::UnwindConfig;
use crate::dispatch::{DispatcherContext, Unwinder};
use crate::error::Result;
use crate::memory::Memory;
use crate::module::ModuleMap;
use crate::nt::{ExceptionDisposition, ExceptionRecord, NtStatus};
use crate::registry::FunctionTableRegistry;

/// What a language handler did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerResult<C> {
    /// The raw `EXCEPTION_DISPOSITION` it returned.
    Disposition(u32),
    /// It unwound the stack itself. Execution continues in this context
    /// instead of returning to the dispatcher.
    Resume(C),
}

impl<C> From<ExceptionDisposition> for HandlerResult<C> {
    fn from(disposition: ExceptionDisposition) -> Self {
        Self::Disposition(disposition as u32)
    }
}

/// Runs code of the unwound program on behalf of the dispatcher.
pub trait HandlerInvoker<A: Architecture> {
    /// `call_unwind_handler`: call the language handler at `handler` as
    /// `handler(record, frame, context, dispatch)`.
    fn call_language_handler(
        &self,
        unwinder: &Unwinder<'_, A>,
        handler: u64,
        record: &mut ExceptionRecord,
        frame: u64,
        context: &A::Context,
        dispatch: &mut DispatcherContext<A>,
    ) -> Result<HandlerResult<A::Context>>;

    /// `__C_ExecuteExceptionFilter` for an `__except` filter. Returns the
    /// filter's `EXCEPTION_*` result.
    fn call_exception_filter(
        &self,
        filter: u64,
        record: &ExceptionRecord,
        context: &A::Context,
        frame: u64,
    ) -> i32;

    /// Run a `__finally` block.
    fn call_termination_handler(&self, handler: u64, abnormal: bool, frame: u64);

    /// Call the callback of a `STATUS_UNWIND_CONSOLIDATE` unwind with the
    /// record and the non-volatile registers. Returns where to resume.
    fn call_consolidate(
        &self,
        callback: u64,
        record: &ExceptionRecord,
        context: &A::Context,
    ) -> Result<u64>;
}

/// `EXCEPTION_REGISTRATION_RECORD`: a frame-based handler on the legacy
/// per-thread list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub frame: u64,
    pub handler: u64,
}

/// The parts of the thread environment block unwinding looks at.
#[derive(Debug, Default)]
pub struct Teb {
    /// Highest stack address, exclusive.
    pub stack_base: u64,
    pub stack_limit: u64,
    /// Innermost first.
    exception_list: Mutex<Vec<RegistrationRecord>>,
}

impl Teb {
    pub fn new(stack_limit: u64, stack_base: u64) -> Self {
        Self {
            stack_base,
            stack_limit,
            exception_list: Mutex::default(),
        }
    }

    /// The stack bounds of the calling thread.
    #[cfg(target_os = "linux")]
    pub fn current() -> Option<Self> {
        let mut attr = core::mem::MaybeUninit::<libc::pthread_attr_t>::uninit();
        let mut addr = core::ptr::null_mut();
        let mut size = 0;
        // SAFETY: The attribute object is initialized by pthread_getattr_np
        // before it is read and destroyed afterwards.
        let ret = unsafe {
            match libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) {
                0 => {
                    let ret = libc::pthread_attr_getstack(attr.as_ptr(), &mut addr, &mut size);
                    libc::pthread_attr_destroy(attr.as_mut_ptr());
                    ret
                }
                err => err,
            }
        };
        if ret != 0 {
            crate::stdext::with_os_error_str(ret, |msg| warn!("cannot get stack bounds: {msg}"));
            return None;
        }
        let limit = addr as u64;
        Some(Self::new(limit, limit + size as u64))
    }

    /// Whether `frame` can be an establisher frame on this stack.
    pub fn is_valid_frame(&self, frame: u64, alignment: u64) -> bool {
        frame % alignment == 0 && frame >= self.stack_limit && frame <= self.stack_base
    }

    /// `__wine_push_frame`
    pub fn push_frame(&self, record: RegistrationRecord) {
        self.exception_list.lock().insert(0, record);
    }

    /// `__wine_pop_frame`
    pub fn pop_frame(&self) -> Option<RegistrationRecord> {
        let mut list = self.exception_list.lock();
        (!list.is_empty()).then(|| list.remove(0))
    }

    pub fn top_frame(&self) -> Option<RegistrationRecord> {
        self.exception_list.lock().first().copied()
    }

    pub fn frames(&self) -> Vec<RegistrationRecord> {
        self.exception_list.lock().clone()
    }
}

/// A function table covering a pc, as `RtlLookupFunctionTable` reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionTable {
    pub base: u64,
    pub table: u64,
    /// In bytes.
    pub size: u32,
}

pub type RaiseHook = Box<dyn Fn(NtStatus, Option<&ExceptionRecord>) + Send + Sync>;

pub struct Process<A: Architecture> {
    pub arch: A,
    pub memory: Box<dyn Memory>,
    pub modules: Box<dyn ModuleMap>,
    pub registry: Arc<FunctionTableRegistry>,
    pub invoker: Box<dyn HandlerInvoker<A>>,
    pub config: UnwindConfig,
    raise_hook: Option<RaiseHook>,
}

impl<A: Architecture> Process<A> {
    pub fn new(
        arch: A,
        memory: Box<dyn Memory>,
        modules: Box<dyn ModuleMap>,
        invoker: Box<dyn HandlerInvoker<A>>,
    ) -> Self {
        Self {
            arch,
            memory,
            modules,
            registry: Arc::default(),
            invoker,
            config: UnwindConfig::default(),
            raise_hook: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<FunctionTableRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_config(mut self, config: UnwindConfig) -> Self {
        self.config = config;
        self
    }

    /// Install the host's exception dispatcher. It receives fatal statuses
    /// and must not return.
    pub fn with_raise_hook(mut self, hook: RaiseHook) -> Self {
        self.raise_hook = Some(hook);
        self
    }

    pub fn env(&self) -> UnwindEnv<'_> {
        UnwindEnv {
            mem: &*self.memory,
            modules: &*self.modules,
            config: &self.config,
        }
    }

    /// `RtlAddFunctionTable`. The covered range ends where the last function
    /// of the table does.
    #[instrument(skip(self))]
    pub fn add_function_table(&self, table: u64, count: u32, base: u64) -> bool {
        match self.arch.table_end(&self.env(), base, table, count) {
            Ok(end) => self.registry.add_function_table(table, count, base, end),
            Err(err) => {
                warn!("cannot read function table at {table:#x}: {err}");
                false
            }
        }
    }

    /// `RtlLookupFunctionTable`
    pub fn lookup_function_table(&self, pc: u64) -> Option<FunctionTable> {
        let env = self.env();
        if let Some(module) = env.modules.find_module(pc) {
            if let Some(dir) = self.arch.module_table(&env, &module, pc) {
                return Some(FunctionTable {
                    base: module.base,
                    table: module.base + dir.rva as u64,
                    size: dir.size,
                });
            }
        }
        let dynamic = self.registry.lookup(pc)?;
        let size = self.arch.runtime_function_size(&env, pc) as u32;
        Some(FunctionTable {
            base: dynamic.base,
            table: dynamic.table,
            size: dynamic.count * size,
        })
    }

    /// Give up on the current thread of execution with `status`.
    pub fn raise_status(&self, status: NtStatus, record: Option<&ExceptionRecord>) -> ! {
        error!("raising {status} for {record:x?}");
        if let Some(hook) = &self.raise_hook {
            hook(status, record);
        }
        crate::stdext::abort()
    }
}

impl<A: Architecture + core::fmt::Debug> core::fmt::Debug for Process<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("arch", &self.arch)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
