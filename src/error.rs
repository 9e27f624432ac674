use thiserror::Error;

use crate::nt::NtStatus;

/// Everything that can stop an unwind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("unknown unwind info version {version} at {address:#x}")]
    UnknownVersion { address: u64, version: u8 },
    #[error("leaf function at {pc:#x} returns into itself")]
    BadLeaf { pc: u64 },
    #[error("malformed unwind data at {address:#x}: {reason}")]
    Malformed { address: u64, reason: String },
    #[error("unsupported unwind code {code:#x} at {address:#x}")]
    UnsupportedOpcode { address: u64, code: u8 },
    #[error("cannot read {len} bytes at {address:#x}")]
    MemoryAccess { address: u64, len: usize },
    #[error("handler returned invalid disposition {0}")]
    InvalidDisposition(u32),
    #[error("unwind target frame {end_frame:#x} lies below establisher frame {frame:#x}")]
    InvalidUnwindTarget { frame: u64, end_frame: u64 },
    #[error("handler asked to continue a noncontinuable exception")]
    Noncontinuable,
    #[error("out of memory while registering a function table")]
    NoMemory,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("exception {0} raised")]
    Raised(NtStatus),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

impl Error {
    pub(crate) fn malformed(address: u64, reason: impl Into<String>) -> Self {
        Self::Malformed {
            address,
            reason: reason.into(),
        }
    }

    /// The `NTSTATUS` reported at the ABI boundary.
    pub fn status(&self) -> NtStatus {
        match self {
            Self::UnknownVersion { .. }
            | Self::BadLeaf { .. }
            | Self::Malformed { .. }
            | Self::UnsupportedOpcode { .. } => NtStatus::BAD_FUNCTION_TABLE,
            Self::MemoryAccess { .. } => NtStatus::ACCESS_VIOLATION,
            Self::InvalidDisposition(_) => NtStatus::INVALID_DISPOSITION,
            Self::InvalidUnwindTarget { .. } => NtStatus::INVALID_UNWIND_TARGET,
            Self::Noncontinuable => NtStatus::NONCONTINUABLE_EXCEPTION,
            Self::NoMemory => NtStatus::NO_MEMORY,
            Self::InvalidParameter(_) => NtStatus::INVALID_PARAMETER,
            Self::Raised(status) => *status,
        }
    }
}
