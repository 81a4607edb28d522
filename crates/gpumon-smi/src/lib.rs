//! `nvidia-smi` access for gpumon.
//!
//! Every reading the collector publishes comes from one invocation of the
//! diagnostic tool in CSV mode:
//!
//! ```text
//! nvidia-smi [--id=<n>] --query-gpu=<field> -u --format=csv,noheader
//! ```
//!
//! The tool prints one line per GPU (`"45 %"`, `"1024 MiB"`, ...). The
//! [`Sampler`] turns that text into a single [`Reading`]: the truncating
//! integer mean of the leading numeric tokens plus the last unit seen.
//!
//! Process execution sits behind the [`CommandRunner`] trait so the parsing
//! and discovery logic can be exercised with [`ScriptedRunner`].

pub mod error;
pub mod parse;
pub mod runner;
pub mod sampler;
pub mod slot;

pub use error::{SmiError, SmiResult};
pub use parse::{data_lines, parse_reading, Reading};
pub use runner::{CommandRunner, ProcessRunner, ScriptedRunner};
pub use sampler::Sampler;
pub use slot::UnitSlot;
