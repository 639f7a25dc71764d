pub mod config;
pub mod types;

// Re-export commonly used types for convenience
pub use config::{Backend, Config};
pub use types::{
    ExecutionResult, Language, QueueStats, RawOutcome, ResourceConstraints, Submission,
    SubmissionId, SubmissionRequest, SubmissionStatus, Summary, TestVerdict, Verdict,
};
