//! Tools the model can call, and the engine that runs them.
//!
//! # Submodules
//!
//! - [`core`]: [`Tool`] trait, [`Capability`], [`ToolRegistry`] and boundary
//!   validation of raw calls.
//! - [`policy`]: [`CommandPolicy`] allow-list for external programs.
//! - [`builtin`]: `read_file`, `write_file`, `edit_file`, `list_files`,
//!   `run_command`. Register all at once with
//!   [`ToolRegistry::with_builtin_tools()`].
//! - [`dag`]: independence groups from `depends_on` and resource keys.
//! - [`engine`]: [`ToolExecutionEngine`], bounded concurrency, timeouts
//!   and abort handling.

pub mod builtin;
pub mod core;
pub mod dag;
pub mod engine;
pub mod policy;

pub use core::{
    Capability, DEFAULT_MAX_RESULT_BYTES, TimeoutClass, Tool, ToolFuture, ToolRegistry,
    ValidatedCall, parse_args, truncate_result,
};
pub use engine::{ToolExecutionEngine, ToolsConfig};
pub use policy::CommandPolicy;
