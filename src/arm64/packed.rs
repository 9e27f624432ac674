//! Packed unwind data: a canonical prolog described entirely by the bits of
//! the `.pdata` entry.
//!
//! ```text
//! [pacibsp]                        CR == 2
//! stp x19,x20,[sp,#-regsave]!      RegI integer registers, lr if CR == 1
//! stp x21,x22,[sp,#16] ...
//! stp d8,d9,[sp,#...] ...          RegF + 1 float registers if RegF != 0
//! stp x0,x1,[sp,#...] ...          H: home the argument registers
//! stp x29,lr,[sp,#-local]! / sub  CR == 2 or 3 chains the frame
//! mov x29,sp
//! sub sp,sp,#local
//! ```

use super::codes::Restore;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedInfo {
    /// 1 for a function with prolog and epilog, 2 for a fragment without a
    /// prolog.
    pub flag: u8,
    /// In instructions.
    pub function_length: u32,
    pub reg_f: u8,
    pub reg_i: u8,
    pub h: bool,
    pub cr: u8,
    /// In units of 16 bytes.
    pub frame_size: u32,
}

impl PackedInfo {
    pub fn from_bits(data: u32) -> Self {
        Self {
            flag: (data & 3) as u8,
            function_length: (data >> 2) & 0x7ff,
            reg_f: ((data >> 13) & 7) as u8,
            reg_i: ((data >> 16) & 0xf) as u8,
            h: data & (1 << 20) != 0,
            cr: ((data >> 21) & 3) as u8,
            frame_size: data >> 23,
        }
    }
}

/// Frame layout derived from the packed fields, in bytes unless noted.
#[derive(Debug)]
struct Layout {
    int_size: u32,
    fp_size: u32,
    local_size: u32,
    int_regs: i32,
    fp_regs: i32,
    saved_regs: i32,
    local_size_regs: i32,
}

impl Layout {
    fn new(info: &PackedInfo) -> Self {
        let mut int_size = info.reg_i as u32 * 8;
        let mut fp_size = info.reg_f as u32 * 8;
        if info.cr == 1 {
            int_size += 8;
        }
        if info.reg_f != 0 {
            fp_size += 8;
        }
        let regsave = (int_size + fp_size + 8 * 8 * info.h as u32 + 0xf) & !0xf;
        let local_size = (info.frame_size * 16).wrapping_sub(regsave);
        Self {
            int_size,
            fp_size,
            local_size,
            int_regs: (int_size / 8) as i32,
            fp_regs: (fp_size / 8) as i32,
            saved_regs: (regsave / 8) as i32,
            local_size_regs: (local_size / 8) as i32,
        }
    }

    /// Prolog instructions excluding the argument homing ones.
    fn prolog_len(&self, cr: u8) -> u32 {
        let mut len = (self.int_size + 8) / 16 + (self.fp_size + 8) / 16;
        let stack_adjust = |len: &mut u32| {
            if self.local_size != 0 {
                *len += 1;
            }
            if self.local_size > 4088 {
                *len += 1;
            }
        };
        match cr {
            2 | 3 => {
                // pacibsp
                if cr == 2 {
                    len += 1;
                }
                // mov x29,sp and stp x29,lr
                len += 2;
                if self.local_size > 512 {
                    stack_adjust(&mut len);
                }
            }
            _ => stack_adjust(&mut len),
        }
        len
    }
}

/// How many instructions to treat as not executed, given that the pc is
/// `offset` instructions into the function.
fn instructions_to_skip(info: &PackedInfo, layout: &Layout, offset: u32) -> (u32, u32) {
    let mut h_size = info.h as u32 * 4;
    if info.flag != 1 || (offset >= 17 && offset < info.function_length.wrapping_sub(15)) {
        return (0, h_size);
    }
    let len = layout.prolog_len(info.cr);
    let epilog_start = info.function_length.wrapping_sub(len + 1);
    let skip = if offset < len + h_size {
        len + h_size - offset
    } else if offset >= epilog_start {
        h_size = 0;
        offset - epilog_start
    } else {
        0
    };
    (skip, h_size)
}

pub(super) fn unwind(restore: &mut Restore<'_, '_>, info: &PackedInfo, offset: u32) -> Result<()> {
    let layout = Layout::new(info);
    let (skip, h_size) = instructions_to_skip(info, &layout, offset);
    trace!(?info, ?layout, skip, "packed unwind");

    let int_regs = layout.int_regs;
    let saved_regs = layout.saved_regs;
    let reg_i = info.reg_i as i32;
    let reg_f = info.reg_f as u32;

    if skip == 0 {
        if info.cr == 2 || info.cr == 3 {
            restore.context.sp = restore.context.fp();
            restore.restore_regs(29, 2, 0)?;
        }
        restore.context.sp = restore.context.sp.wrapping_add(layout.local_size as u64);
        if layout.fp_size != 0 {
            restore.restore_fpregs(8, layout.fp_regs as u32, int_regs)?;
        }
        if info.cr == 1 {
            restore.restore_regs(30, 1, int_regs - 1)?;
        }
        restore.restore_regs(19, reg_i as u32, -saved_regs)?;
    } else {
        let mut pos = 0u32;
        let mut due = || {
            let run = pos >= skip;
            pos += 1;
            run
        };

        let mut adjust_stack = true;
        if info.cr == 2 || info.cr == 3 {
            if due() {
                restore.context.sp = restore.context.fp();
            }
            if layout.local_size <= 512 {
                if due() {
                    restore.restore_regs(29, 2, -layout.local_size_regs)?;
                }
                adjust_stack = false;
            } else if due() {
                restore.restore_regs(29, 2, 0)?;
            }
        }
        if adjust_stack && layout.local_size != 0 {
            if due() {
                let size = ((layout.local_size - 1) % 4088 + 1) as u64;
                restore.context.sp = restore.context.sp.wrapping_add(size);
            }
            if layout.local_size > 4088 && due() {
                restore.context.sp = restore.context.sp.wrapping_add(4088);
            }
        }

        let mut pos = pos + h_size;
        let mut due = || {
            let run = pos >= skip;
            pos += 1;
            run
        };

        if layout.fp_size != 0 {
            if reg_f % 2 == 0 && due() {
                // odd number of float registers
                restore.restore_fpregs(8 + reg_f, 1, int_regs + layout.fp_regs - 1)?;
            }
            for i in (0..(reg_f + 1) / 2).rev() {
                if !due() {
                    continue;
                }
                if i == 0 && layout.int_size == 0 {
                    restore.restore_fpregs(8, 2, -saved_regs)?;
                } else {
                    restore.restore_fpregs(8 + 2 * i, 2, int_regs + 2 * i as i32)?;
                }
            }
        }

        if reg_i % 2 != 0 {
            if due() {
                // stp xn,lr
                if info.cr == 1 {
                    restore.restore_regs(30, 1, int_regs - 1)?;
                }
                let pos = if reg_i > 1 { reg_i - 1 } else { -saved_regs };
                restore.restore_regs(18 + reg_i as u32, 1, pos)?;
            }
        } else if info.cr == 1 && due() {
            // str lr
            let pos = if reg_i != 0 { int_regs - 1 } else { -saved_regs };
            restore.restore_regs(30, 1, pos)?;
        }

        for i in (0..reg_i / 2).rev() {
            if !due() {
                continue;
            }
            if i != 0 {
                restore.restore_regs(19 + 2 * i as u32, 2, 2 * i)?;
            } else {
                restore.restore_regs(19, 2, -saved_regs)?;
            }
        }
    }

    if info.cr == 2 {
        restore.pac_auth();
    }
    Ok(())
}
