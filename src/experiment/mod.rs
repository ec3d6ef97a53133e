//! Scan execution.
//!
//! - [`sweep`]: the sweep coordinator and its abort signal
//! - [`state`]: sweep state machine and position tracking
//! - [`summary`]: what a finished (or aborted) sweep reports

pub mod state;
pub mod summary;
pub mod sweep;

pub use state::{SweepPosition, SweepState};
pub use summary::{FailedWrite, ScanSummary};
pub use sweep::{AbortSignal, SweepCoordinator, SweepPlan};
