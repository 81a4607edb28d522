use std::time::Duration;

use thiserror::Error;

/// Errors produced while invoking or parsing `nvidia-smi`.
#[derive(Debug, Error)]
pub enum SmiError {
    /// The tool could not be spawned, or exited with a non-zero status.
    /// `output` carries the tool's combined stdout/stderr (or the spawn error).
    #[error("`{command}` failed: {output}")]
    ToolInvocation { command: String, output: String },

    /// The tool did not exit within the configured command timeout.
    #[error("`{command}` timed out after {timeout:?}")]
    ToolTimeout { command: String, timeout: Duration },

    /// The tool exited successfully but printed no data lines.
    #[error("no units sampled")]
    EmptyResult,

    /// Unit discovery found no GPUs on the host.
    #[error("can't fetch metrics on 0 GPUs")]
    NoUnits,
}

impl SmiError {
    /// Whether this error means the tool itself is unusable, as opposed to a
    /// single flaky reading.
    pub fn is_invocation_failure(&self) -> bool {
        matches!(self, SmiError::ToolInvocation { .. } | SmiError::ToolTimeout { .. })
    }
}

pub type SmiResult<T> = std::result::Result<T, SmiError>;
