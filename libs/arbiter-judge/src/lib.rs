//! Arbiter judging core
//!
//! Submissions go through the [`Scheduler`], which hands each one to the
//! [`JudgeService`]. The service runs every test case in a pooled sandbox and
//! turns the raw outcomes into verdicts.

pub mod artifact;
pub mod checker;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod language;
pub mod metrics;
pub mod pool;
pub mod problem;
pub mod sandbox;
pub mod scheduler;
pub mod service;

pub use artifact::{ArtifactStore, DirArtifactStore, MemoryArtifactStore};
pub use error::{JudgeError, Result, SandboxError};
pub use language::{LanguageProfile, LanguageRegistry};
pub use pool::ContainerPool;
pub use problem::{FsProblemRepository, ProblemRepository, ProblemSummary};
pub use sandbox::{provider_for, IsolationProvider};
pub use scheduler::Scheduler;
pub use service::JudgeService;
