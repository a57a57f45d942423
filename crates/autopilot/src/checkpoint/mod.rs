//! Durable checkpoints of session state.
//!
//! [`CheckpointManager`] serializes the complete session state into a
//! checksummed, sequenced [`Checkpoint`] and hands the bytes to a
//! [`CheckpointStore`]. On recovery the newest checkpoint that verifies wins.

pub mod manager;
pub mod store;

pub use manager::{Checkpoint, CheckpointId, CheckpointManager};
pub use store::{CheckpointReason, CheckpointStore, FsCheckpointStore, IndexEntry};
