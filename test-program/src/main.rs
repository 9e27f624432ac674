//! Dispatches an access violation through a small synthetic x64 image:
//! `main` calls `guarded`, whose `__try`/`__except` wraps a call to
//! `cleanup`, whose `__try`/`__finally` wraps a call to `fault`.

use ntunwind::c_handler::c_specific_handler;
use ntunwind::context::X64Context;
use ntunwind::memory::SparseMemory;
use ntunwind::module::ModuleList;
use ntunwind::nt::{ExceptionRecord, NtStatus, EXCEPTION_EXECUTE_HANDLER};
use ntunwind::unwind_data::{self, Machine};
use ntunwind::{
    DispatcherContext, HandlerInvoker, HandlerResult, Process, SearchOutcome, Teb, Unwinder, X64,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const BASE: u64 = 0x1_4000_0000;
const TABLE: u64 = BASE + 0x3800;
const C_HANDLER: u64 = BASE + 0x2000;

const STACK_LIMIT: u64 = 0x7000;
const STACK_BASE: u64 = 0x8000;

struct Host;

impl HandlerInvoker<X64> for Host {
    fn call_language_handler(
        &self,
        unwinder: &Unwinder<'_, X64>,
        handler: u64,
        record: &mut ExceptionRecord,
        frame: u64,
        context: &X64Context,
        dispatch: &mut DispatcherContext<X64>,
    ) -> ntunwind::Result<HandlerResult<X64Context>> {
        assert_eq!(handler, C_HANDLER);
        c_specific_handler(unwinder, record, frame, context, dispatch)
    }

    fn call_exception_filter(
        &self,
        filter: u64,
        record: &ExceptionRecord,
        _context: &X64Context,
        frame: u64,
    ) -> i32 {
        tracing::info!(filter, frame, code = %record.code, "filter");
        EXCEPTION_EXECUTE_HANDLER
    }

    fn call_termination_handler(&self, handler: u64, abnormal: bool, frame: u64) {
        tracing::info!(handler, abnormal, frame, "__finally");
    }

    fn call_consolidate(
        &self,
        _callback: u64,
        _record: &ExceptionRecord,
        _context: &X64Context,
    ) -> ntunwind::Result<u64> {
        unreachable!()
    }
}

fn image() -> SparseMemory {
    let mut mem = SparseMemory::new();
    mem.map(BASE, 0x4000);
    mem.map(STACK_LIMIT, 0x2000);

    // push rbx; sub rsp, 0x20
    let prolog = [5, 0x32, 1, 0x30];
    let functions: [(u32, u32, u8, Option<[u32; 4]>); 4] = [
        (0x1000, 0x1080, 0, None),
        (0x1100, 0x1200, 2, Some([0x1100, 0x1180, 0x1190, 0])),
        (0x1300, 0x1400, 3, Some([0x1300, 0x1380, 0x1390, 0x13a0])),
        (0x1500, 0x1600, 0, None),
    ];
    for (i, (begin, end, flags, scope)) in functions.into_iter().enumerate() {
        let info = BASE + 0x3000 + i as u64 * 0x20;
        mem.write(info, &[1 | flags << 3, 5, 2, 0]);
        mem.write(info + 4, &prolog);
        if let Some(scope) = scope {
            mem.write_u32(info + 8, (C_HANDLER - BASE) as u32);
            mem.write_u32(info + 12, 1);
            for (j, value) in scope.into_iter().enumerate() {
                mem.write_u32(info + 16 + j as u64 * 4, value);
            }
        }

        let entry = TABLE + i as u64 * 12;
        mem.write_u32(entry, begin);
        mem.write_u32(entry + 4, end);
        mem.write_u32(entry + 8, (info - BASE) as u32);
    }

    // each frame: 0x20 locals, saved rbx, return address
    let mut rsp = 0x7f00;
    for (ret, rbx) in [(0x1120, 0x11), (0x1320, 0x22), (0x1520, 0x33), (0, 0)] {
        mem.write_u64(rsp + 0x20, rbx);
        mem.write_u64(rsp + 0x28, if ret == 0 { 0 } else { BASE + ret });
        rsp += 0x30;
    }
    mem
}

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::TRACE.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    let mem = image();
    for i in 0..4 {
        let data = unwind_data::decode(&mem, Machine::X64, BASE, TABLE + i * 12).unwrap();
        println!("{data}");
    }

    let process = Process::new(X64, Box::new(mem), Box::new(ModuleList::new()), Box::new(Host));
    assert!(process.add_function_table(TABLE, 4, BASE));
    let teb = Teb::new(STACK_LIMIT, STACK_BASE);
    let unwinder = Unwinder::new(&process, &teb);

    let context = X64Context {
        rip: BASE + 0x1020,
        rsp: 0x7f00,
        ..X64Context::default()
    };
    let frames = unwinder.walk_frame_chain(&context, 16, 0);
    println!("backtrace: {frames:#x?}");

    let mut record = ExceptionRecord::new(NtStatus::ACCESS_VIOLATION, 0, context.rip);
    match unwinder.call_seh_handlers(&mut record, &context).unwrap() {
        SearchOutcome::Resume(context) => println!(
            "resuming at {:#x} rsp {:#x} rbx {:#x} rax {:#x}",
            context.rip, context.rsp, context.rbx, context.rax
        ),
        outcome => println!("{outcome:?}"),
    }
}
