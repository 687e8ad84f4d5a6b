//! Request scheduling for continuous batching.
//!
//! This module handles:
//! - Engine state: running/waiting queues, request states, statistics
//! - Admission from the waiting queue
//! - Post-step streaming and reclamation of finished requests
//! - Preemption of the lowest-priority running request

pub mod post_step;
pub mod preempt;
pub mod reclaim;
pub mod state;

pub use post_step::{process_step, RequestStreamOutput};
pub use preempt::{build_replay_inputs, preempt_last_running};
pub use reclaim::reclaim_finished;
pub use state::{EngineState, EngineStats};
