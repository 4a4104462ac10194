pub mod call_state;
pub mod jobs;

pub use call_state::{CallState, CallStateStore, WarningStage};
pub use jobs::{JobResult, JobStore};
