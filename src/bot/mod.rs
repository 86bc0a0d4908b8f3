//! Bot driver: the control loop and how it reacts to failures.

mod classifier;
mod control_loop;
mod traits;

pub use classifier::{
    BackoffAction, BackoffDecision, BackoffPolicy, FailureKind, ANALYSIS_PERIOD_STEP_MS,
    BAN_DURATION, FATAL_EXIT_CODE,
};
pub use control_loop::{ControlLoop, LoopExit};
pub use traits::{LendingEngine, LogNotifier, LogStatusSink, NotificationSink, StatusSink, StatusSnapshot};
