use super::codes::{decode, sequence_len, Op};
use super::*;
use crate::config::{OpcodePolicy, UnwindConfig};
use crate::memory::SparseMemory;
use crate::module::ModuleList;

const BASE: u64 = 0x1_8000_0000;
const STACK: u64 = 0x7e00;
const LR: u64 = BASE + 0x3000;

fn image() -> SparseMemory {
    let mut mem = SparseMemory::new();
    mem.map(BASE, 0x4000);
    mem.map(0x7000, 0x1000);
    mem
}

fn packed_bits(len: u32, reg_f: u32, reg_i: u32, h: bool, cr: u32, frame_size: u32) -> u32 {
    1 | len << 2 | reg_f << 13 | reg_i << 16 | (h as u32) << 20 | cr << 21 | frame_size << 23
}

fn xdata_header(len: u32, x: bool, e: bool, epilogs: u32, code_words: u32) -> u32 {
    len | (x as u32) << 20 | (e as u32) << 21 | epilogs << 22 | code_words << 27
}

fn unwind_with(
    mem: &SparseMemory,
    config: &UnwindConfig,
    pc: u64,
    function: Option<&RuntimeFunction>,
    context: &mut Arm64Context,
    pointers: Option<&mut Arm64ContextPointers>,
) -> Result<VirtualUnwindResult> {
    let modules = ModuleList::new();
    let env = UnwindEnv {
        mem,
        modules: &modules,
        config,
    };
    context.pc = pc;
    virtual_unwind(&env, HandlerType::Exception, BASE, pc, function, context, pointers)
}

fn unwind(
    mem: &SparseMemory,
    pc: u64,
    function: Option<&RuntimeFunction>,
    context: &mut Arm64Context,
) -> Result<VirtualUnwindResult> {
    unwind_with(mem, &UnwindConfig::default(), pc, function, context, None)
}

fn fresh_context() -> Arm64Context {
    let mut context = Arm64Context {
        sp: STACK,
        ..Default::default()
    };
    context.set_lr(LR);
    context
}

#[test]
fn leaf_returns_to_lr() {
    let mem = image();
    let mut context = fresh_context();

    let result = unwind(&mem, BASE + 0x100, None, &mut context).unwrap();

    assert_eq!(context.pc, LR);
    assert_eq!(context.sp, STACK);
    assert!(Arm64::unwound_to_call(&context));
    assert_eq!(result.establisher_frame, STACK);
    assert_eq!(result.handler, None);
}

#[test]
fn leaf_returning_into_itself() {
    let mem = image();
    let mut context = fresh_context();

    let err = unwind(&mem, LR, None, &mut context).unwrap_err();
    assert_eq!(err, Error::BadLeaf { pc: LR });
    assert_eq!(err.status(), crate::nt::NtStatus::BAD_FUNCTION_TABLE);
}

// stp x19,x20,[sp,#-16]!
// sub sp,sp,#16
fn saves_x19_x20() -> (SparseMemory, RuntimeFunction) {
    let mut mem = image();
    mem.write_u64(STACK + 16, 0x1919);
    mem.write_u64(STACK + 24, 0x2020);
    let function = RuntimeFunction {
        begin: 0x1000,
        data: packed_bits(40, 0, 2, false, 0, 2),
    };
    (mem, function)
}

#[test]
fn packed_body() {
    let (mem, function) = saves_x19_x20();
    let mut context = fresh_context();
    let mut pointers = Arm64ContextPointers::default();

    let result = unwind_with(
        &mem,
        &UnwindConfig::default(),
        BASE + 0x1000 + 20 * 4,
        Some(&function),
        &mut context,
        Some(&mut pointers),
    )
    .unwrap();

    assert_eq!(context.x[19], 0x1919);
    assert_eq!(context.x[20], 0x2020);
    assert_eq!(context.sp, STACK + 32);
    assert_eq!(context.pc, LR);
    assert_eq!(result.establisher_frame, STACK + 32);
    assert_eq!(pointers.x19[0], Some(STACK + 16));
    assert_eq!(pointers.x19[1], Some(STACK + 24));
}

#[test]
fn packed_prolog_stops_before_stack_allocation() {
    let (mut mem, function) = saves_x19_x20();
    mem.write_u64(STACK, 0x1900);
    mem.write_u64(STACK + 8, 0x2000);
    let mut context = fresh_context();

    // the sub has not run yet
    unwind(&mem, BASE + 0x1000 + 4, Some(&function), &mut context).unwrap();

    assert_eq!(context.x[19], 0x1900);
    assert_eq!(context.x[20], 0x2000);
    assert_eq!(context.sp, STACK + 16);
}

#[test]
fn packed_prolog_at_entry_restores_nothing() {
    let (mem, function) = saves_x19_x20();
    let mut context = fresh_context();

    unwind(&mem, BASE + 0x1000, Some(&function), &mut context).unwrap();

    assert_eq!(context.x[19], 0);
    assert_eq!(context.sp, STACK);
    assert_eq!(context.pc, LR);
}

#[test]
fn packed_chained_frame() {
    let mut mem = image();
    let fp = STACK + 0x20;
    mem.write_u64(fp, 0x7f80);
    mem.write_u64(fp + 8, BASE + 0x2222);
    let function = RuntimeFunction {
        begin: 0x1000,
        data: packed_bits(64, 0, 0, false, 3, 2),
    };
    let mut context = fresh_context();
    context.set_fp(fp);

    unwind(&mem, BASE + 0x1000 + 30 * 4, Some(&function), &mut context).unwrap();

    assert_eq!(context.fp(), 0x7f80);
    assert_eq!(context.pc, BASE + 0x2222);
    assert_eq!(context.sp, fp + 32);
}

#[test]
fn packed_float_registers() {
    let mut mem = image();
    // stp d8,d9,[sp,#-16]! with no integer registers
    mem.write_u64(STACK, 0x8888);
    mem.write_u64(STACK + 8, 0x9999);
    let function = RuntimeFunction {
        begin: 0x1000,
        data: packed_bits(40, 1, 0, false, 0, 1),
    };
    let mut context = fresh_context();
    context.v[8] = 0xffff_0000_0000_0000_0000_0000_0000_0000;

    unwind(&mem, BASE + 0x1000 + 20 * 4, Some(&function), &mut context).unwrap();

    assert_eq!(context.d(8), 0x8888);
    assert_eq!(context.d(9), 0x9999);
    // only the low half is saved
    assert_eq!(context.v[8] >> 64, 0xffff_0000_0000_0000);
    assert_eq!(context.sp, STACK + 16);
}

// set_fp; save_fplr_x #16; end; nop
const CODES: [u8; 4] = [0xe1, 0x81, 0xe4, 0xe3];
const XDATA: u64 = BASE + 0x2000;

fn full_image(header: u32, scopes: &[u32]) -> SparseMemory {
    let mut mem = image();
    mem.write_u32(XDATA, header);
    let mut at = XDATA + 4;
    for scope in scopes {
        mem.write_u32(at, *scope);
        at += 4;
    }
    mem.write(at, &CODES);
    mem.write_u32(at + 4, 0x1800);
    mem.write_u64(at + 8, 0xda7a);
    mem
}

fn full_function() -> RuntimeFunction {
    RuntimeFunction {
        begin: 0x1000,
        data: 0x2000,
    }
}

#[test]
fn full_body_reports_handler() {
    let mut mem = full_image(xdata_header(16, true, true, 1, 1), &[]);
    let fp = STACK + 0x40;
    mem.write_u64(fp, 0x7fc0);
    mem.write_u64(fp + 8, BASE + 0x2468);
    let mut context = fresh_context();
    context.set_fp(fp);

    let result = unwind(&mem, BASE + 0x1000 + 8 * 4, Some(&full_function()), &mut context).unwrap();

    assert_eq!(context.sp, fp + 16);
    assert_eq!(context.fp(), 0x7fc0);
    assert_eq!(context.pc, BASE + 0x2468);
    assert_eq!(result.handler, Some(BASE + 0x1800));
    assert_eq!(result.handler_data, XDATA + 12);
}

#[test]
fn full_prolog_skips_unexecuted_codes() {
    let mut mem = full_image(xdata_header(16, true, true, 1, 1), &[]);
    mem.write_u64(STACK, 0x7fc0);
    mem.write_u64(STACK + 8, BASE + 0x2468);
    let mut context = fresh_context();
    context.set_fp(0x1111);

    // after the stp, before mov x29,sp
    let result = unwind(&mem, BASE + 0x1000 + 4, Some(&full_function()), &mut context).unwrap();

    assert_eq!(context.sp, STACK + 16);
    assert_eq!(context.fp(), 0x7fc0);
    assert_eq!(context.pc, BASE + 0x2468);
    assert_eq!(result.handler, None);
}

#[test]
fn full_epilog_in_header() {
    let mut mem = full_image(xdata_header(16, true, true, 1, 1), &[]);
    mem.write_u64(STACK, 0x7fc0);
    mem.write_u64(STACK + 8, BASE + 0x2468);

    // at the ldp x29,lr,[sp],#16
    let mut context = fresh_context();
    unwind(&mem, BASE + 0x1000 + 14 * 4, Some(&full_function()), &mut context).unwrap();
    assert_eq!(context.sp, STACK + 16);
    assert_eq!(context.pc, BASE + 0x2468);

    // at the ret
    let mut context = fresh_context();
    let result = unwind(&mem, BASE + 0x1000 + 15 * 4, Some(&full_function()), &mut context).unwrap();
    assert_eq!(context.sp, STACK);
    assert_eq!(context.pc, LR);
    assert_eq!(result.handler, None);
}

#[test]
fn full_epilog_scope() {
    // one epilog at instruction 10 using the codes from index 1
    let mut mem = full_image(xdata_header(16, false, false, 1, 1), &[10 | 1 << 22]);
    mem.write_u64(STACK, 0x7fc0);
    mem.write_u64(STACK + 8, BASE + 0x2468);
    let mut context = fresh_context();
    context.set_fp(0x1111);

    unwind(&mem, BASE + 0x1000 + 10 * 4, Some(&full_function()), &mut context).unwrap();

    assert_eq!(context.sp, STACK + 16);
    assert_eq!(context.fp(), 0x7fc0);
}

#[test]
fn extended_header_counts() {
    let mut mem = image();
    mem.write_u32(XDATA, xdata_header(0x20, false, false, 0, 0));
    mem.write_u32(XDATA + 4, 2 | 1 << 16);
    mem.write_u32(XDATA + 8, 4);
    mem.write_u32(XDATA + 12, 8 | 2 << 22);
    mem.write(XDATA + 16, &CODES);

    let xdata = XData::read(&mem, XDATA).unwrap();
    assert_eq!(xdata.epilog_count, 2);
    assert_eq!(xdata.code_words, 1);
    assert_eq!(
        xdata.epilogs,
        vec![
            full::EpilogScope { offset: 4, index: 0 },
            full::EpilogScope { offset: 8, index: 2 }
        ]
    );
    assert_eq!(xdata.codes, CODES.to_vec());
    assert_eq!(xdata.handler_address(), None);
}

fn codes_image(codes: &[u8]) -> SparseMemory {
    let mut mem = image();
    mem.write_u32(XDATA, xdata_header(16, false, true, 0, 1));
    mem.write(XDATA + 4, codes);
    mem
}

#[test]
fn save_next_extends_pair() {
    let mut mem = codes_image(&[0xe6, 0xc8, 0x00, 0xe4]);
    for i in 0..4 {
        mem.write_u64(STACK + i * 8, 0x19 + i);
    }
    let mut context = fresh_context();

    unwind(&mem, BASE + 0x1000 + 8 * 4, Some(&full_function()), &mut context).unwrap();

    assert_eq!(&context.x[19..23], &[0x19, 0x1a, 0x1b, 0x1c]);
    assert_eq!(context.sp, STACK);
}

#[test]
fn machine_frame() {
    let mut mem = codes_image(&[0xe9, 0xe4, 0xe3, 0xe3]);
    mem.write_u64(STACK, 0x7ff0);
    mem.write_u64(STACK + 8, BASE + 0x1abc);
    let mut context = fresh_context();

    unwind(&mem, BASE + 0x1000 + 8 * 4, Some(&full_function()), &mut context).unwrap();

    assert_eq!(context.pc, BASE + 0x1abc);
    assert_eq!(context.sp, 0x7ff0);
    assert!(!Arm64::unwound_to_call(&context));
}

#[test]
fn clear_unwound_to_call() {
    let mem = codes_image(&[0xec, 0xe4, 0xe3, 0xe3]);
    let mut context = fresh_context();

    unwind(&mem, BASE + 0x1000 + 8 * 4, Some(&full_function()), &mut context).unwrap();

    assert_eq!(context.pc, LR);
    assert!(!Arm64::unwound_to_call(&context));
}

#[test]
fn unknown_code_policy() {
    // alloc_s 32; unknown; alloc_s 32; end
    let mem = codes_image(&[0x02, 0xf0, 0x02, 0xe4]);

    let mut context = fresh_context();
    unwind(&mem, BASE + 0x1000 + 8 * 4, Some(&full_function()), &mut context).unwrap();
    assert_eq!(context.sp, STACK + 32);

    let strict = UnwindConfig::default().with_opcode_policy(OpcodePolicy::Strict);
    let mut context = fresh_context();
    let err = unwind_with(
        &mem,
        &strict,
        BASE + 0x1000 + 8 * 4,
        Some(&full_function()),
        &mut context,
        None,
    )
    .unwrap_err();
    assert_eq!(
        err,
        Error::UnsupportedOpcode {
            address: XDATA + 5,
            code: 0xf0
        }
    );
}

#[test]
fn sequence_length_ignores_custom_codes() {
    let codes = decode(&[0xe9, 0x81, 0xc8, 0x00, 0xe4, 0x02], 0x100);
    assert_eq!(sequence_len(&codes), 2);
    assert_eq!(codes[2].op, Op::SaveRegp { reg: 19, offset: 0 });
    assert_eq!(codes[2].address, 0x102);
    assert_eq!(codes[3].op, Op::End);

    let truncated = decode(&[0x02, 0xe0, 0x00], 0);
    assert_eq!(truncated[1].op, Op::Truncated);
}

#[test]
fn codes_display_as_instructions() {
    let codes = decode(&[0x81, 0xd0, 0x42, 0xe1], 0x10);
    let lines: Vec<String> = codes.iter().map(ToString::to_string).collect();
    assert_eq!(
        lines,
        [
            "0x10: stp x29,lr,[sp,#-0x10]!",
            "0x11: str x20,[sp,#0x10]",
            "0x13: mov x29,sp",
        ]
    );
}

#[test]
fn function_range_uses_xdata_length() {
    let mem = full_image(xdata_header(16, true, true, 1, 1), &[]);
    let modules = ModuleList::new();
    let config = UnwindConfig::default();
    let env = UnwindEnv {
        mem: &mem,
        modules: &modules,
        config: &config,
    };

    let range = Arm64.function_range(&env, BASE, &full_function()).unwrap();
    assert_eq!(range, (BASE + 0x1000, BASE + 0x1040));

    let packed = RuntimeFunction {
        begin: 0x1100,
        data: packed_bits(3, 0, 0, false, 0, 0),
    };
    let range = Arm64.function_range(&env, BASE, &packed).unwrap();
    assert_eq!(range, (BASE + 0x1100, BASE + 0x110c));
}

#[test]
fn jump_buffer() {
    let mut mem = image();
    let buf = 0x7400;
    for i in 0..10 {
        mem.write_u64(buf + 0x10 + i * 8, 0x100 + i);
    }
    mem.write_u64(buf + 0x60, 0x7f00);
    mem.write_u64(buf + 0x68, BASE + 0x1234);
    mem.write_u64(buf + 0x70, 0x7e80);
    mem.write_u32(buf + 0x78, 0x0300_0000);
    mem.write_u64(buf + 0x80 + 7 * 8, 0x1515);

    let mut context = Arm64Context::default();
    apply_jump_buffer(&mem, &mut context, buf).unwrap();

    assert_eq!(context.x[19], 0x100);
    assert_eq!(context.x[28], 0x109);
    assert_eq!(context.fp(), 0x7f00);
    assert_eq!(context.pc, BASE + 0x1234);
    assert_eq!(context.sp, 0x7e80);
    assert_eq!(context.fpcr, 0x0300_0000);
    assert_eq!(context.d(15), 0x1515);
}
