//! Context window management: token estimates, layout, summarization.
//!
//! The context window is the scarcest resource of a long-running session.
//! This module keeps every request under the model's ceiling:
//!
//! 1. **[`tokens`]**: [`TokenCounter`] estimates token size per model family.
//! 2. **[`layout`]**: pinned prefix, summary and verbatim turns, assembled
//!    into a [`ContextWindow`].
//! 3. **[`summarizer`]**: extractive, incremental folding of older turns.
//! 4. **[`file_tracker`]**: files touched by tool calls, kept through
//!    summarization.
//! 5. **[`manager`]**: the [`ContextManager`] that owns the turn history and
//!    decides when to summarize.

pub mod file_tracker;
pub mod layout;
pub mod manager;
pub mod summarizer;
pub mod tokens;

pub use layout::{ContextBreakdown, ContextWindow, PinnedPrefix};
pub use manager::{ContextConfig, ContextManager, ContextSnapshot};
pub use summarizer::{Summarizer, SummaryDigest, SummaryLimits};
pub use tokens::{DEFAULT_CHARS_PER_TOKEN, TokenCounter};
