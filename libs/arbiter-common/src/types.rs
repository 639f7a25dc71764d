use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type SubmissionId = Uuid;

/// Strongly-typed language enum
/// Single source of truth for what the judge accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Cpp,
}

impl Language {
    /// Returns all language variants
    pub fn all_variants() -> &'static [Language] {
        &[Language::Python, Language::Cpp]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Cpp => "cpp",
        }
    }
}

/// Returned when a language name is not in the lookup table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLanguage(pub String);

impl fmt::Display for UnknownLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported language: {}", self.0)
    }
}

impl std::error::Error for UnknownLanguage {}

impl FromStr for Language {
    type Err = UnknownLanguage;

    /// Case-insensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "cpp" => Ok(Language::Cpp),
            _ => Err(UnknownLanguage(s.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-problem limits, loaded once per submission before any execution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceConstraints {
    pub time_limit_secs: f64,
    pub memory_limit_mb: u64,
    pub test_count: u32,
}

/// Raw outcome of one sandboxed run, before output comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawOutcome {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "TLE")]
    Tle,
    #[serde(rename = "MLE")]
    Mle,
    #[serde(rename = "RTE")]
    Rte,
}

/// Output of the sandbox executor for a single test
///
/// `memory_used_mb` is approximate. When `memory_advisory` is set the figure
/// is a heuristic estimate rather than an isolation-layer reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub test_id: String,
    pub outcome: RawOutcome,
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    pub time_used_secs: f64,
    pub memory_used_mb: u64,
    #[serde(default)]
    pub memory_advisory: bool,
}

impl ExecutionResult {
    /// RTE-class result for a test that never got to run
    pub fn failed(test_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            outcome: RawOutcome::Rte,
            output: reason.into(),
            stderr: String::new(),
            time_used_secs: 0.0,
            memory_used_mb: 0,
            memory_advisory: true,
        }
    }
}

/// Final judgment of one test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "Accepted")]
    Accepted,
    #[serde(rename = "Wrong Answer")]
    WrongAnswer,
    #[serde(rename = "Time Limit Exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "Memory Limit Exceeded")]
    MemoryLimitExceeded,
    #[serde(rename = "Runtime Error")]
    RuntimeError,
    #[serde(rename = "Missing Output File")]
    MissingOutputFile,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }

    /// Short label used for metric dimensions
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::MemoryLimitExceeded => "MLE",
            Verdict::RuntimeError => "RTE",
            Verdict::MissingOutputFile => "MOF",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Verdict::Accepted => "Accepted",
            Verdict::WrongAnswer => "Wrong Answer",
            Verdict::TimeLimitExceeded => "Time Limit Exceeded",
            Verdict::MemoryLimitExceeded => "Memory Limit Exceeded",
            Verdict::RuntimeError => "Runtime Error",
            Verdict::MissingOutputFile => "Missing Output File",
        };
        f.write_str(text)
    }
}

/// Per-test entry exposed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestVerdict {
    pub test: String,
    pub verdict: Verdict,
    pub time_used_secs: f64,
    pub memory_used_mb: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

impl Summary {
    /// `passed` counts Accepted, everything else is a failure
    pub fn from_verdicts(results: &[TestVerdict]) -> Self {
        let passed = results.iter().filter(|r| r.verdict.is_accepted()).count();
        Self {
            total: results.len(),
            passed,
            failed: results.len() - passed,
        }
    }
}

/// Submission state machine
/// queued → processing → {completed | error}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionStatus::Completed | SubmissionStatus::Error)
    }
}

/// What a caller hands to the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub language: Language,
    pub problem_id: String,
    /// Stable identifier in the code artifact store
    pub code_ref: String,
}

/// Submission record owned by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub language: Language,
    pub problem_id: String,
    pub code_ref: String,
    pub status: SubmissionStatus,
    pub progress: u8,
    pub results: Vec<TestVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn new(id: SubmissionId, request: SubmissionRequest) -> Self {
        Self {
            id,
            language: request.language,
            problem_id: request.problem_id,
            code_ref: request.code_ref,
            status: SubmissionStatus::Queued,
            progress: 0,
            results: Vec::new(),
            summary: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Progress never decreases and never moves once terminal
    pub fn advance(&mut self, progress: u8) {
        if self.status.is_terminal() {
            return;
        }
        self.progress = self.progress.max(progress.min(100));
    }

    pub fn mark_processing(&mut self) {
        if self.status == SubmissionStatus::Queued {
            self.status = SubmissionStatus::Processing;
            self.started_at = Some(Utc::now());
        }
    }

    /// Returns false if the submission was already terminal
    pub fn complete(&mut self, results: Vec<TestVerdict>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.summary = Some(Summary::from_verdicts(&results));
        self.results = results;
        self.progress = 100;
        self.status = SubmissionStatus::Completed;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Returns false if the submission was already terminal
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.error = Some(message.into());
        self.status = SubmissionStatus::Error;
        self.completed_at = Some(Utc::now());
        true
    }
}

/// Queue statistics for observability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_length: usize,
    pub active_workers: usize,
    pub max_workers: usize,
    pub total_submissions: usize,
}
