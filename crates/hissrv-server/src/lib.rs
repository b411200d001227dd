pub mod api;
pub mod error;
pub mod health;
pub mod scheduler;
pub mod state;

pub use api::create_router;
pub use error::ApiError;
pub use health::HealthMonitor;
pub use scheduler::{
    JobContext, JobKind, JobRun, JobRunStatus, JobStatus, JobTrigger, Scheduler, SchedulerError,
    SchedulerStatus,
};
pub use state::AppState;
