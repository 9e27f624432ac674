//! Table-based exception unwinding and dispatch for Windows images on x86-64,
//! ARM64, ARM64EC and ARMv7.
//!
//! The crate reads the unwind tables of PE images (`RUNTIME_FUNCTION` and
//! the unwind data they point at), unwinds register contexts frame by frame,
//! and drives the two phases of structured exception handling on top of
//! that: searching for a handler and unwinding to it.

#[macro_use]
extern crate tracing;

mod stdext;
#[cfg(test)]
pub(crate) mod testing;

pub mod arch;
pub mod arm;
pub mod arm64;
pub mod arm64ec;
pub mod c_handler;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod memory;
pub mod module;
pub mod nt;
pub mod process;
pub mod registry;
pub mod unwind_data;
pub mod x64;

pub use arch::{Architecture, FunctionEntry, UnwindEnv, VirtualUnwindResult};
pub use arm::Arm;
pub use arm64::Arm64;
pub use arm64ec::Arm64Ec;
pub use config::{OpcodePolicy, UnwindConfig};
pub use dispatch::{DispatcherContext, SearchOutcome, Unwinder};
pub use error::{Error, Result};
pub use history::UnwindHistoryTable;
pub use process::{HandlerInvoker, HandlerResult, Process, Teb};
pub use x64::X64;
