//! Autotune Tracker - client for the external experiment-tracking service
//!
//! Everything the control loop reads from or writes to the tracker goes
//! through here:
//! - traces: completed voice-agent conversations pulled for analysis
//! - datasets: frozen train/test rows that drive simulated callers
//! - experiments: handles that scored evaluation rows attach to
//! - prompts: the registry of candidate and promoted system prompts

pub mod client;
pub mod datasets;
pub mod traces;

pub use client::{PromptRecord, TrackerClient, TrackerError};
pub use datasets::{CaseInput, DatasetRow, SimulatedUserProfile};
pub use traces::{ToolCallRecord, Trace, TraceTurn};
