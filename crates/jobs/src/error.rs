use thiserror::Error;

/// Errors surfaced by the job controller's control surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job already running")]
    AlreadyRunning,
    #[error("job not running")]
    NotRunning,
}
