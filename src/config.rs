use crate::error::{Error, Result};

/// What to do with an unwind code the decoder does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpcodePolicy {
    /// Log a warning and skip the code.
    #[default]
    Lenient,
    /// Fail the virtual unwind with [`Error::UnsupportedOpcode`].
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindConfig {
    pub opcode_policy: OpcodePolicy,
    /// Upper bound on the frames a single walk visits.
    pub max_frames: usize,
}

impl Default for UnwindConfig {
    fn default() -> Self {
        Self {
            opcode_policy: OpcodePolicy::default(),
            max_frames: 1024,
        }
    }
}

impl UnwindConfig {
    pub fn with_opcode_policy(mut self, policy: OpcodePolicy) -> Self {
        self.opcode_policy = policy;
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    pub(crate) fn unsupported_opcode(&self, address: u64, code: u8) -> Result<()> {
        match self.opcode_policy {
            OpcodePolicy::Lenient => {
                warn!("unsupported unwind code {code:#x} at {address:#x}");
                Ok(())
            }
            OpcodePolicy::Strict => Err(Error::UnsupportedOpcode { address, code }),
        }
    }
}
