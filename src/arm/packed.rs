//! Packed ARM unwind data. The prolog and epilog are synthesized as unwind
//! code streams and then run like full `.xdata` codes.

use super::codes::{self, Restore};
use crate::config::UnwindConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedInfo {
    pub flag: u8,
    /// In halfwords.
    pub function_length: u32,
    /// 0: `pop {pc}`, 1: 16-bit branch, 2: 32-bit branch, 3: no epilog.
    pub ret: u8,
    /// Argument registers are homed.
    pub h: bool,
    pub reg: u8,
    /// Set when `reg` describes float registers rather than integer ones.
    pub r: bool,
    /// Lr is saved.
    pub l: bool,
    /// R11 is a frame pointer.
    pub c: bool,
    pub stack_adjust: u32,
}

impl PackedInfo {
    pub fn from_bits(data: u32) -> Self {
        Self {
            flag: (data & 3) as u8,
            function_length: (data >> 2) & 0x7ff,
            ret: ((data >> 13) & 3) as u8,
            h: data & (1 << 15) != 0,
            reg: ((data >> 16) & 7) as u8,
            r: data & (1 << 19) != 0,
            l: data & (1 << 20) != 0,
            c: data & (1 << 21) != 0,
            stack_adjust: data >> 22,
        }
    }
}

/// Prolog and epilog unwind codes equivalent to `info`.
pub fn synthesize(info: &PackedInfo) -> (Vec<u8>, Vec<u8>) {
    let mut stack = info.stack_adjust;
    let (mut pf, mut ef) = (false, false);
    if info.stack_adjust >= 0x3f4 {
        // folded into the push/pop
        pf = info.stack_adjust & 4 != 0;
        ef = info.stack_adjust & 8 != 0;
        stack = (info.stack_adjust & 3) + 1;
    }

    let reg_range = |folded: bool| {
        let (mut first, mut last) = (4, info.reg as u32 + 4);
        if folded {
            first = !info.stack_adjust & 3;
            if info.r {
                last = 3;
            }
        }
        ((first..=last).fold(0u32, |mask, i| mask | 1 << i), last + 1 - first)
    };

    let mut prolog_mask = 0u32;
    let mut epilog_mask = 0u32;
    let mut fp_offset = 0;
    if !info.r || pf {
        (prolog_mask, fp_offset) = reg_range(pf);
    }
    if !info.r || ef {
        epilog_mask = reg_range(ef).0;
    }
    if info.c {
        prolog_mask |= 1 << 11;
        epilog_mask |= 1 << 11;
    }
    if info.l {
        prolog_mask |= 1 << 14;
        if info.ret != 0 {
            epilog_mask |= 1 << 14;
        } else if !info.h {
            epilog_mask |= 1 << 15;
        }
    }

    let push_stack = |codes: &mut Vec<u8>| {
        if stack <= 0x7f {
            codes.push(stack as u8);
        } else {
            codes.push(0xe8 | (stack >> 8) as u8);
            codes.push(stack as u8);
        }
    };

    let mut prolog = Vec::with_capacity(10);
    if stack != 0 && !pf {
        push_stack(&mut prolog);
    }
    if info.r && info.reg != 7 {
        prolog.push(0xe0 | info.reg);
    }
    if info.c {
        // mov r11,sp or add r11,sp,#x
        prolog.push(if fp_offset == 0 { 0xfb } else { 0xfc });
    }
    if prolog_mask & 0xf00 != 0 {
        let mut bits = prolog_mask & 0x1fff;
        if prolog_mask & (1 << 14) != 0 {
            bits |= 0x2000;
        }
        prolog.extend([0x80 | (bits >> 8) as u8, bits as u8]);
    } else if prolog_mask != 0 {
        let mut bits = prolog_mask & 0xff;
        if prolog_mask & (1 << 14) != 0 {
            bits |= 0x100;
        }
        prolog.extend([0xec | (bits >> 8) as u8, bits as u8]);
    }
    if info.h {
        // push {r0-r3}
        prolog.push(0x04);
    }
    prolog.push(0xff);

    let mut epilog = Vec::with_capacity(20);
    if stack != 0 && !ef {
        push_stack(&mut epilog);
    }
    if info.r && info.reg != 7 {
        epilog.push(0xe0 | info.reg);
    }
    if epilog_mask & 0x7f00 != 0 {
        let mut bits = epilog_mask & 0x1fff;
        if epilog_mask & (3 << 14) != 0 {
            bits |= 0x2000;
        }
        epilog.extend([0x80 | (bits >> 8) as u8, bits as u8]);
    } else if epilog_mask != 0 {
        let mut bits = epilog_mask & 0xff;
        if epilog_mask & (1 << 15) != 0 {
            bits |= 0x100;
        }
        epilog.extend([0xec | (bits >> 8) as u8, bits as u8]);
    }
    if info.h {
        if info.l && info.ret == 0 {
            // ldr lr,[sp],#20
            epilog.extend([0xef, 5]);
        } else {
            epilog.push(0x04);
        }
    }
    epilog.push(match info.ret {
        1 => 0xfd,
        2 => 0xfe,
        _ => 0xff,
    });

    (prolog, epilog)
}

pub(super) fn unwind(
    restore: &mut Restore<'_, '_>,
    config: &UnwindConfig,
    info: &PackedInfo,
    offset: u32,
) -> Result<()> {
    let (prolog, epilog) = synthesize(info);
    trace!(?info, ?prolog, ?epilog, "packed unwind");
    let prolog_codes = codes::decode(&prolog, 0);
    let epilog_codes = codes::decode(&epilog, 0);

    if info.flag == 1 && offset < 4 * prolog.len() as u32 {
        let len = codes::sequence_len(&prolog_codes, false);
        if offset < len {
            trace!("inside prolog");
            return codes::process(restore, config, &prolog_codes, len - offset);
        }
    }

    let function_len = 2 * info.function_length;
    if info.ret != 3 && function_len.wrapping_sub(offset) <= 4 * epilog.len() as u32 {
        let len = codes::sequence_len(&epilog_codes, true);
        let start = function_len.wrapping_sub(len);
        if offset >= start {
            trace!("inside epilog");
            return codes::process(restore, config, &epilog_codes, offset - start);
        }
    }

    codes::process(restore, config, &prolog_codes, 0)
}
