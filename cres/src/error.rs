use thiserror::Error;

/// Every fallible entry point of the engine returns this. `UNDERFLOW`
/// never surfaces here -- spec says it's repaired in place and logged,
/// see the `log::warn!` call sites in [`crate::lifecycle`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CresError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("job {job_id} not found in partition {partition}")]
    NotFound { job_id: u32, partition: usize },

    #[error("state invariant violated: {0}")]
    StateInvariant(String),

    #[error("no fit: {0}")]
    NoFit(String),
}

pub type Result<T> = std::result::Result<T, CresError>;
