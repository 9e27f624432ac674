//! Frame-by-frame dispatch: function lookup, the search for an exception
//! handler, and full unwinds to a target frame.
//!
//! Nothing here transfers control. Where the system routines would jump to a
//! new context, these functions return it, and [`Unwinder::rtl_unwind_ex`]
//! performs the actual jump on the running thread.


use crate::arch::{Architecture, FunctionEntry, UnwindEnv, VirtualUnwindResult};
use crate::error::{Error, Result};
use crate::history::UnwindHistoryTable;
use crate::nt::{
    ExceptionDisposition, ExceptionRecord, HandlerType, NtStatus, EXCEPTION_COLLIDED_UNWIND,
    EXCEPTION_EXIT_UNWIND, EXCEPTION_NESTED_CALL, EXCEPTION_NONCONTINUABLE,
    EXCEPTION_STACK_INVALID, EXCEPTION_TARGET_UNWIND, EXCEPTION_UNWINDING,
};
use crate::process::{HandlerResult, Process, Teb};

/// `DISPATCHER_CONTEXT`
#[derive(Debug, Clone)]
pub struct DispatcherContext<A: Architecture> {
    pub control_pc: u64,
    pub image_base: u64,
    pub function_entry: Option<FunctionEntry<A::RuntimeFunction>>,
    pub establisher_frame: u64,
    pub target_ip: u64,
    /// The context handed to handlers, and the one a nested unwind starts
    /// from.
    pub context_record: A::Context,
    pub language_handler: Option<u64>,
    pub handler_data: u64,
    /// First scope `__C_specific_handler` still has to look at.
    pub scope_index: u32,
    /// `control_pc` is a return address rather than the faulting pc.
    pub control_pc_is_unwound: bool,
    /// Lookup cache of the search phase, handed on to the unwind a handler
    /// starts from it.
    pub history_table: Option<UnwindHistoryTable<A::RuntimeFunction>>,
}

impl<A: Architecture> DispatcherContext<A> {
    pub fn new(context: A::Context) -> Self {
        Self {
            control_pc: A::pc(&context),
            image_base: 0,
            function_entry: None,
            establisher_frame: A::sp(&context),
            target_ip: 0,
            context_record: context,
            language_handler: None,
            handler_data: 0,
            scope_index: 0,
            control_pc_is_unwound: false,
            history_table: None,
        }
    }
}

/// How the search for an exception handler ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome<C> {
    /// A filter asked to retry the faulting instruction.
    ContinueExecution,
    /// A handler unwound to its `__except` block, which runs in this context.
    Resume(C),
    /// No frame handled the exception.
    Unhandled,
}

enum UnwindDisposition<C> {
    ContinueSearch,
    Collided,
    Resume(C),
}

pub type History<'h, A> = Option<&'h mut UnwindHistoryTable<<A as Architecture>::RuntimeFunction>>;

/// The dispatcher for one thread of a process.
pub struct Unwinder<'a, A: Architecture> {
    process: &'a Process<A>,
    teb: &'a Teb,
}

impl<'a, A: Architecture> Unwinder<'a, A> {
    pub fn new(process: &'a Process<A>, teb: &'a Teb) -> Self {
        Self { process, teb }
    }

    pub fn process(&self) -> &'a Process<A> {
        self.process
    }

    pub fn teb(&self) -> &'a Teb {
        self.teb
    }

    fn env(&self) -> UnwindEnv<'a> {
        self.process.env()
    }

    /// `RtlLookupFunctionEntry`: the descriptor covering `pc` and the base
    /// address its RVAs are relative to.
    #[instrument(level = "trace", skip(self, history), fields(arch = A::NAME))]
    pub fn lookup_function_entry(
        &self,
        pc: u64,
        history: History<'_, A>,
    ) -> Result<Option<(u64, FunctionEntry<A::RuntimeFunction>)>> {
        if let Some(hit) = history.as_deref().and_then(|h| h.lookup(pc)) {
            trace!("history table hit");
            return Ok(Some(hit));
        }

        let env = self.env();
        let arch = &self.process.arch;
        let module_table = env
            .modules
            .find_module(pc)
            .and_then(|module| Some((module.base, arch.module_table(&env, &module, pc)?)));

        let found = match module_table {
            Some((base, dir)) => {
                let count = dir.size as u64 / arch.runtime_function_size(&env, pc);
                arch.find_function(&env, pc, base, base + dir.rva as u64, count as u32)?
                    .map(|entry| (base, entry))
            }
            None => match self.process.registry.lookup(pc) {
                Some(dynamic) => arch
                    .find_function(&env, pc, dynamic.base, dynamic.table, dynamic.count)?
                    .map(|entry| (dynamic.base, entry)),
                None => None,
            },
        };

        if let (Some(history), Some((base, entry))) = (history, found) {
            let (start, end) = arch.function_range(&env, base, &entry.function)?;
            history.insert(base, start, end, entry);
        }
        Ok(found)
    }

    /// `RtlVirtualUnwind2`
    pub fn virtual_unwind2(
        &self,
        handler_type: HandlerType,
        base: u64,
        pc: u64,
        function: Option<&FunctionEntry<A::RuntimeFunction>>,
        context: &mut A::Context,
        pointers: Option<&mut A::ContextPointers>,
    ) -> Result<VirtualUnwindResult> {
        self.process.arch.virtual_unwind(
            &self.env(),
            handler_type,
            base,
            pc,
            function,
            context,
            pointers,
        )
    }

    /// `RtlVirtualUnwind`: on failure the pc is cleared and no handler is
    /// reported.
    pub fn virtual_unwind(
        &self,
        handler_type: HandlerType,
        base: u64,
        pc: u64,
        function: Option<&FunctionEntry<A::RuntimeFunction>>,
        context: &mut A::Context,
        pointers: Option<&mut A::ContextPointers>,
    ) -> VirtualUnwindResult {
        match self.virtual_unwind2(handler_type, base, pc, function, context, pointers) {
            Ok(result) => result,
            Err(err) => {
                debug!("virtual unwind at {pc:#x} failed: {err}");
                A::set_pc(context, 0);
                VirtualUnwindResult::default()
            }
        }
    }

    /// Unwind `context` by one frame, describing the frame in `dispatch`.
    fn unwind_frame(
        &self,
        handler_type: HandlerType,
        dispatch: &mut DispatcherContext<A>,
        context: &mut A::Context,
        history: History<'_, A>,
    ) -> Result<()> {
        let env = self.env();
        dispatch.image_base = 0;
        dispatch.scope_index = 0;
        dispatch.control_pc = A::pc(context);
        dispatch.control_pc_is_unwound = A::unwound_to_call(context);
        let mut pc = dispatch.control_pc;
        if dispatch.control_pc_is_unwound {
            pc = pc.wrapping_sub(self.process.arch.call_instruction_size(&env, pc));
        }

        let found = self.lookup_function_entry(pc, history)?;
        if let Some((base, _)) = found {
            dispatch.image_base = base;
        }
        dispatch.function_entry = found.map(|(_, entry)| entry);

        let result = self.virtual_unwind2(
            handler_type,
            dispatch.image_base,
            pc,
            dispatch.function_entry.as_ref(),
            context,
            None,
        )?;
        dispatch.language_handler = result.handler;
        dispatch.handler_data = result.handler_data;
        dispatch.establisher_frame = result.establisher_frame;
        Ok(())
    }

    /// Replay the unwind of the frame a collided handler described.
    fn unwind_collided(&self, dispatch: &DispatcherContext<A>) -> A::Context {
        let mut context = dispatch.context_record.clone();
        self.virtual_unwind(
            HandlerType::None,
            dispatch.image_base,
            dispatch.control_pc,
            dispatch.function_entry.as_ref(),
            &mut context,
            None,
        );
        context
    }

    fn call_unwind_handler(
        &self,
        handler: u64,
        record: &mut ExceptionRecord,
        dispatch: &mut DispatcherContext<A>,
    ) -> Result<UnwindDisposition<A::Context>> {
        let frame = dispatch.establisher_frame;
        let context = dispatch.context_record.clone();
        trace!("calling unwind handler {handler:#x} frame {frame:#x}");
        let result = self.process.invoker.call_language_handler(
            self, handler, record, frame, &context, dispatch,
        )?;
        trace!("handler {handler:#x} returned {result:x?}");

        match result {
            HandlerResult::Resume(context) => Ok(UnwindDisposition::Resume(context)),
            HandlerResult::Disposition(raw) => match ExceptionDisposition::from_raw(raw) {
                Some(ExceptionDisposition::ContinueSearch) => Ok(UnwindDisposition::ContinueSearch),
                Some(ExceptionDisposition::CollidedUnwind) => Ok(UnwindDisposition::Collided),
                _ => {
                    error!("unwind handler {handler:#x} returned {raw}");
                    Err(Error::InvalidDisposition(raw))
                }
            },
        }
    }

    /// `RtlUnwindEx`: unwind from `context` to `end_frame`, running the
    /// termination handlers of every frame on the way. Returns the context
    /// execution continues in, at `target_ip` unless the record asks for a
    /// consolidation or a longjmp.
    ///
    /// Without an end frame the whole stack is unwound.
    pub fn unwind_ex(
        &self,
        end_frame: Option<u64>,
        target_ip: u64,
        record: Option<&mut ExceptionRecord>,
        retval: u64,
        context: A::Context,
        mut history: History<'_, A>,
    ) -> Result<A::Context> {
        let _span = info_span!("unwind_ex", arch = A::NAME, ?end_frame, target_ip).entered();

        let mut local = ExceptionRecord::unwind(A::pc(&context));
        let record = record.unwrap_or(&mut local);
        record.flags |= EXCEPTION_UNWINDING;
        if end_frame.is_none() {
            record.flags |= EXCEPTION_EXIT_UNWIND;
        }
        let end = end_frame.unwrap_or(0);
        let env = self.env();

        let mut new_context = context.clone();
        let mut dispatch = DispatcherContext::new(context);
        dispatch.target_ip = target_ip;

        let mut collided = false;
        let mut frames = 0;
        'frames: loop {
            if !collided {
                if A::pc(&new_context) == 0 {
                    debug!("reached the end of the call chain");
                    break;
                }
                if frames == self.process.config.max_frames {
                    warn!("giving up after {frames} frames");
                    record.flags |= EXCEPTION_STACK_INVALID;
                    break;
                }
                frames += 1;
                self.unwind_frame(
                    HandlerType::Unwind,
                    &mut dispatch,
                    &mut new_context,
                    history.as_deref_mut(),
                )?;
            }
            collided = false;
            trace!(
                "frame {:#x} pc {:#x} handler {:x?}",
                dispatch.establisher_frame,
                dispatch.control_pc,
                dispatch.language_handler
            );

            if dispatch.establisher_frame == 0 {
                break;
            }
            if !self
                .teb
                .is_valid_frame(dispatch.establisher_frame, A::FRAME_ALIGNMENT)
            {
                error!(
                    "invalid frame {:#x} ({:#x}-{:#x})",
                    dispatch.establisher_frame, self.teb.stack_limit, self.teb.stack_base
                );
                record.flags |= EXCEPTION_STACK_INVALID;
                break;
            }

            if let Some(handler) = dispatch.language_handler {
                if end_frame.is_some() && dispatch.establisher_frame > end {
                    error!("invalid end frame {:#x}/{end:#x}", dispatch.establisher_frame);
                    return Err(Error::InvalidUnwindTarget {
                        frame: dispatch.establisher_frame,
                        end_frame: end,
                    });
                }
                if dispatch.establisher_frame == end {
                    record.flags |= EXCEPTION_TARGET_UNWIND;
                }
                match self.call_unwind_handler(handler, record, &mut dispatch)? {
                    UnwindDisposition::ContinueSearch => {}
                    UnwindDisposition::Collided => {
                        new_context = self.unwind_collided(&dispatch);
                        record.flags |= EXCEPTION_COLLIDED_UNWIND;
                        collided = true;
                        continue;
                    }
                    UnwindDisposition::Resume(context) => return Ok(context),
                }
                record.flags &= !EXCEPTION_COLLIDED_UNWIND;
            } else {
                let establisher = dispatch.establisher_frame;
                while let Some(teb_frame) = self.teb.top_frame() {
                    if teb_frame.frame >= A::sp(&new_context) || teb_frame.frame >= end {
                        break;
                    }
                    trace!("found registration frame {teb_frame:x?}");
                    dispatch.establisher_frame = teb_frame.frame;
                    let disposition =
                        self.call_unwind_handler(teb_frame.handler, record, &mut dispatch)?;
                    self.teb.pop_frame();
                    match disposition {
                        UnwindDisposition::ContinueSearch => {}
                        UnwindDisposition::Collided => {
                            new_context = self.unwind_collided(&dispatch);
                            record.flags |= EXCEPTION_COLLIDED_UNWIND;
                            collided = true;
                            continue 'frames;
                        }
                        UnwindDisposition::Resume(context) => return Ok(context),
                    }
                }
                if self.teb.top_frame().is_some_and(|f| f.frame == end)
                    && end < A::sp(&new_context)
                {
                    break;
                }
                dispatch.establisher_frame = establisher;
            }

            if dispatch.establisher_frame == end {
                if self.process.arch.needs_extra_frame(
                    &env,
                    dispatch.control_pc,
                    A::pc(&new_context),
                ) {
                    trace!("leaving {:#x} through its caller", dispatch.control_pc);
                    dispatch.context_record = new_context;
                }
                break;
            }
            dispatch.context_record = new_context.clone();
        }

        let mut context = dispatch.context_record;
        if record.code != NtStatus::UNWIND_CONSOLIDATE {
            A::set_pc(&mut context, target_ip);
        }
        A::set_return_value(&mut context, retval);
        self.prepare_restore(context, record)
    }

    /// `RtlUnwind`
    pub fn unwind(
        &self,
        end_frame: Option<u64>,
        target_ip: u64,
        record: Option<&mut ExceptionRecord>,
        retval: u64,
        context: A::Context,
    ) -> Result<A::Context> {
        self.unwind_ex(end_frame, target_ip, record, retval, context, None)
    }

    /// `_local_unwind`
    pub fn local_unwind(&self, frame: u64, target_ip: u64, context: A::Context) -> Result<A::Context> {
        self.unwind(Some(frame), target_ip, None, 0, context)
    }

    /// The part of `RtlRestoreContext` that decides where execution resumes.
    pub fn prepare_restore(&self, mut context: A::Context, record: &ExceptionRecord) -> Result<A::Context> {
        if record.number_parameters < 1 {
            return Ok(context);
        }
        if record.code == NtStatus::LONGJUMP {
            let jump_buffer = record.information[0];
            trace!("longjmp through {jump_buffer:#x}");
            self.process
                .arch
                .apply_jump_buffer(&self.env(), &mut context, jump_buffer)?;
        } else if record.code == NtStatus::UNWIND_CONSOLIDATE {
            let callback = record.information[0];
            let target = self
                .process
                .invoker
                .call_consolidate(callback, record, &context)?;
            trace!("consolidate callback {callback:#x} resumes at {target:#x}");
            A::set_pc(&mut context, target);
        }
        Ok(context)
    }

    /// `call_seh_handlers`: walk the stack from `context` offering the
    /// exception to each frame's exception handler.
    pub fn call_seh_handlers(
        &self,
        record: &mut ExceptionRecord,
        context: &A::Context,
    ) -> Result<SearchOutcome<A::Context>> {
        let _span = info_span!("call_seh_handlers", arch = A::NAME, code = %record.code).entered();

        let mut walk = context.clone();
        let mut frame_context = context.clone();
        let mut dispatch = DispatcherContext::<A>::new(context.clone());
        dispatch.history_table = Some(UnwindHistoryTable::new());
        let teb_frames = self.teb.frames();
        let mut teb_index = 0;

        let mut collided = false;
        for _ in 0..self.process.config.max_frames {
            if !collided {
                if A::pc(&walk) == 0 {
                    debug!("reached the end of the call chain");
                    break;
                }
                let mut history = dispatch.history_table.take();
                let unwound = self.unwind_frame(
                    HandlerType::Exception,
                    &mut dispatch,
                    &mut walk,
                    history.as_mut(),
                );
                dispatch.history_table = history;
                unwound?;
                dispatch.context_record = frame_context.clone();
            }
            collided = false;

            if dispatch.establisher_frame == 0 {
                break;
            }
            if !self
                .teb
                .is_valid_frame(dispatch.establisher_frame, A::FRAME_ALIGNMENT)
            {
                error!(
                    "invalid frame {:#x} ({:#x}-{:#x})",
                    dispatch.establisher_frame, self.teb.stack_limit, self.teb.stack_base
                );
                record.flags |= EXCEPTION_STACK_INVALID;
                break;
            }

            let mut handlers = Vec::new();
            if let Some(handler) = dispatch.language_handler {
                handlers.push((handler, dispatch.establisher_frame));
            } else {
                while let Some(teb_frame) = teb_frames.get(teb_index) {
                    if !self.teb.is_valid_frame(teb_frame.frame, A::FRAME_ALIGNMENT)
                        || teb_frame.frame >= A::sp(&walk)
                    {
                        break;
                    }
                    handlers.push((teb_frame.handler, teb_frame.frame));
                    teb_index += 1;
                }
            }

            for (handler, frame) in handlers {
                trace!("calling handler {handler:#x} frame {frame:#x}");
                let result = self.process.invoker.call_language_handler(
                    self,
                    handler,
                    record,
                    frame,
                    &frame_context,
                    &mut dispatch,
                )?;
                record.flags &= EXCEPTION_NONCONTINUABLE;
                trace!("handler {handler:#x} returned {result:x?}");

                let raw = match result {
                    HandlerResult::Resume(context) => return Ok(SearchOutcome::Resume(context)),
                    HandlerResult::Disposition(raw) => raw,
                };
                match ExceptionDisposition::from_raw(raw) {
                    Some(ExceptionDisposition::ContinueExecution) => {
                        if record.flags & EXCEPTION_NONCONTINUABLE != 0 {
                            return Err(Error::Noncontinuable);
                        }
                        return Ok(SearchOutcome::ContinueExecution);
                    }
                    Some(ExceptionDisposition::ContinueSearch) => {}
                    Some(ExceptionDisposition::NestedException) => {
                        debug!("nested exception in frame {frame:#x}");
                        record.flags |= EXCEPTION_NESTED_CALL;
                    }
                    Some(ExceptionDisposition::CollidedUnwind) => {
                        frame_context = dispatch.context_record.clone();
                        walk = self.unwind_collided(&dispatch);
                        record.flags |= EXCEPTION_COLLIDED_UNWIND;
                        collided = true;
                        break;
                    }
                    None => {
                        error!("handler {handler:#x} returned {raw}");
                        return Err(Error::InvalidDisposition(raw));
                    }
                }
            }

            if !collided && A::sp(&walk) == self.teb.stack_base {
                break;
            }
        }
        Ok(SearchOutcome::Unhandled)
    }

    /// `RtlWalkFrameChain`: the return addresses of up to `count` frames
    /// starting at `context`, skipping as many as the high byte of `flags`
    /// says.
    pub fn walk_frame_chain(&self, context: &A::Context, count: usize, flags: u32) -> Vec<u64> {
        let skip = (flags >> 8) as usize;
        let mut context = context.clone();
        let mut dispatch = DispatcherContext::<A>::new(context.clone());
        let mut pcs = Vec::new();

        for i in 0..count.min(self.process.config.max_frames) {
            let sp = A::sp(&context);
            if let Err(err) = self.unwind_frame(HandlerType::None, &mut dispatch, &mut context, None) {
                debug!("frame walk stopped: {err}");
                break;
            }
            if A::pc(&context) == 0 {
                break;
            }
            let frame = dispatch.establisher_frame;
            if frame == 0 || !self.teb.is_valid_frame(frame, A::FRAME_ALIGNMENT) {
                break;
            }
            if A::sp(&context) <= sp || A::sp(&context) == self.teb.stack_base {
                break;
            }
            if i >= skip {
                pcs.push(A::pc(&context));
            }
        }
        pcs
    }
}

/// `RtlUnwindEx` on the running thread.
macro_rules! live_unwind {
    ($arch:ty) => {
        impl Unwinder<'_, $arch> {
            /// Unwind the calling thread to `end_frame` and continue at
            /// `target_ip`. Failures go to [`Process::raise_status`].
            ///
            /// # Safety
            ///
            /// The process must read this process's memory, and every frame
            /// between the caller and `end_frame` must be described by its
            /// function tables.
            pub unsafe fn rtl_unwind_ex(
                &self,
                end_frame: Option<u64>,
                target_ip: u64,
                record: Option<&mut ExceptionRecord>,
                retval: u64,
            ) -> ! {
                let context = crate::arch::capture_context();
                match self.unwind_ex(end_frame, target_ip, record, retval, context, None) {
                    // SAFETY: The frames the context describes are live per
                    // the caller's guarantee.
                    Ok(context) => unsafe { crate::arch::restore_context(&context) },
                    Err(err) => self.process.raise_status(err.status(), None),
                }
            }
        }
    };
}

#[cfg(target_arch = "x86_64")]
live_unwind!(crate::x64::X64);
#[cfg(target_arch = "aarch64")]
live_unwind!(crate::arm64::Arm64);
