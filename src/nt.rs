//! NT exception ABI values shared by every architecture.
#![allow(nonstandard_style)] // Names follow winnt.h

use core::fmt;

/// An `NTSTATUS` value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NtStatus(pub u32);

impl NtStatus {
    pub const SUCCESS: Self = Self(0);
    pub const LONGJUMP: Self = Self(0x8000_0026);
    pub const UNWIND_CONSOLIDATE: Self = Self(0x8000_0029);
    pub const ACCESS_VIOLATION: Self = Self(0xc000_0005);
    pub const INVALID_PARAMETER: Self = Self(0xc000_000d);
    pub const NO_MEMORY: Self = Self(0xc000_0017);
    pub const NONCONTINUABLE_EXCEPTION: Self = Self(0xc000_0025);
    pub const INVALID_DISPOSITION: Self = Self(0xc000_0026);
    pub const UNWIND: Self = Self(0xc000_0027);
    pub const INVALID_UNWIND_TARGET: Self = Self(0xc000_0029);
    pub const BAD_FUNCTION_TABLE: Self = Self(0xc000_00ff);
    pub const UNHANDLED_EXCEPTION: Self = Self(0xc000_0144);

    pub fn is_error(self) -> bool {
        self.0 >> 30 == 3
    }
}

impl fmt::Debug for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NtStatus({:#010x})", self.0)
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

pub const EXCEPTION_NONCONTINUABLE: u32 = 0x01;
pub const EXCEPTION_UNWINDING: u32 = 0x02;
pub const EXCEPTION_EXIT_UNWIND: u32 = 0x04;
pub const EXCEPTION_STACK_INVALID: u32 = 0x08;
pub const EXCEPTION_NESTED_CALL: u32 = 0x10;
pub const EXCEPTION_TARGET_UNWIND: u32 = 0x20;
pub const EXCEPTION_COLLIDED_UNWIND: u32 = 0x40;
pub const EXCEPTION_UNWIND: u32 = EXCEPTION_UNWINDING | EXCEPTION_EXIT_UNWIND;

pub const EXCEPTION_MAXIMUM_PARAMETERS: usize = 15;

/// Filter results returned by `__except` filter expressions.
pub const EXCEPTION_EXECUTE_HANDLER: i32 = 1;
pub const EXCEPTION_CONTINUE_SEARCH: i32 = 0;
pub const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;

/// Which kind of handler the caller of a virtual unwind is interested in.
///
/// Bit values match the `UNW_FLAG_*` flags of x64 `UNWIND_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    /// `UNW_FLAG_NHANDLER`
    None = 0,
    /// `UNW_FLAG_EHANDLER`: exception filters, used while searching.
    Exception = 1,
    /// `UNW_FLAG_UHANDLER`: termination handlers, used while unwinding.
    Unwind = 2,
}

impl HandlerType {
    pub fn bits(self) -> u8 {
        self as u8
    }
}

pub const UNW_FLAG_NHANDLER: u8 = 0;
pub const UNW_FLAG_EHANDLER: u8 = 1;
pub const UNW_FLAG_UHANDLER: u8 = 2;
pub const UNW_FLAG_CHAININFO: u8 = 4;

/// The raw `EXCEPTION_DISPOSITION` a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionDisposition {
    ContinueExecution = 0,
    ContinueSearch = 1,
    NestedException = 2,
    CollidedUnwind = 3,
}

impl ExceptionDisposition {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::ContinueExecution,
            1 => Self::ContinueSearch,
            2 => Self::NestedException,
            3 => Self::CollidedUnwind,
            _ => return None,
        })
    }
}

/// `EXCEPTION_RECORD`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRecord {
    pub code: NtStatus,
    pub flags: u32,
    /// Address of a chained record, 0 if none.
    pub record: u64,
    pub address: u64,
    pub number_parameters: u32,
    pub information: [u64; EXCEPTION_MAXIMUM_PARAMETERS],
}

impl ExceptionRecord {
    pub fn new(code: NtStatus, flags: u32, address: u64) -> Self {
        Self {
            code,
            flags,
            record: 0,
            address,
            number_parameters: 0,
            information: [0; EXCEPTION_MAXIMUM_PARAMETERS],
        }
    }

    /// The record `RtlUnwindEx` synthesizes when the caller passes none.
    pub fn unwind(address: u64) -> Self {
        Self::new(NtStatus::UNWIND, 0, address)
    }

    pub fn with_parameters(mut self, params: &[u64]) -> Self {
        let n = params.len().min(EXCEPTION_MAXIMUM_PARAMETERS);
        self.information[..n].copy_from_slice(&params[..n]);
        self.number_parameters = n as u32;
        self
    }

    pub fn is_unwinding(&self) -> bool {
        self.flags & EXCEPTION_UNWIND != 0
    }
}
