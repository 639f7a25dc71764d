//! Problem repository: constraints, test list and optional checker per problem.
//!
//! On-disk layout:
//!
//! ```text
//! problems/<id>/data.json        {"time_limit": 2, "memory_limit": 256, "tests": 3, "checker": "tokens"}
//! problems/<id>/input/*.in       optional, paired with tests in sorted order
//! problems/<id>/output/<name>.out
//! problems/<id>/metadata.json    optional, {"title": ...}
//! ```
//!
//! A problem always has exactly `tests` cases. Case `i` takes the `i`-th
//! input file when there is one; otherwise it runs without input and its
//! expected output is `output/<i>.out`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arbiter_common::ResourceConstraints;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::checker::{self, Checker};
use crate::error::{JudgeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    /// 1-based position in declared order
    pub ordinal: usize,
    /// Identifier reported in results: input file name or the ordinal
    pub name: String,
    pub input: Option<PathBuf>,
    pub expected: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Problem {
    pub id: String,
    pub constraints: ResourceConstraints,
    pub tests: Vec<TestCase>,
    pub checker: Option<Arc<dyn Checker>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProblemSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub time_limit_secs: f64,
    pub memory_limit_mb: u64,
    pub tests: usize,
}

#[async_trait]
pub trait ProblemRepository: Send + Sync {
    async fn load(&self, problem_id: &str) -> Result<Problem>;

    async fn read_input(&self, test: &TestCase) -> Result<Option<Vec<u8>>>;

    /// `None` when the expected output is absent or unreadable
    async fn read_expected(&self, test: &TestCase) -> Option<String>;

    async fn list_problems(&self) -> Result<Vec<ProblemSummary>>;

    /// Free-form problem metadata, `MissingArtifact` when there is none
    async fn metadata(&self, problem_id: &str) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct FsProblemRepository {
    root: PathBuf,
}

impl FsProblemRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn problem_dir(&self, problem_id: &str) -> Result<PathBuf> {
        let valid = !problem_id.is_empty()
            && problem_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(JudgeError::MissingArtifact(format!(
                "invalid problem id: {:?}",
                problem_id
            )));
        }
        Ok(self.root.join(problem_id))
    }
}

/// data.json values arrive as numbers or strings
fn number_field(data: &Value, key: &str) -> Result<f64> {
    let value = data
        .get(key)
        .ok_or_else(|| JudgeError::InvalidConstraints(format!("missing {}", key)))?;
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|n| n.is_finite() && *n >= 0.0)
        .ok_or_else(|| JudgeError::InvalidConstraints(format!("{} is not a number: {}", key, value)))
}

pub fn parse_constraints(data: &Value) -> Result<ResourceConstraints> {
    let time_limit_secs = number_field(data, "time_limit")?;
    let memory_limit_mb = number_field(data, "memory_limit")?.trunc() as u64;
    let test_count = number_field(data, "tests")?.trunc() as u32;

    if time_limit_secs <= 0.0 {
        return Err(JudgeError::InvalidConstraints(
            "time_limit must be positive".to_string(),
        ));
    }
    if memory_limit_mb == 0 {
        return Err(JudgeError::InvalidConstraints(
            "memory_limit must be positive".to_string(),
        ));
    }

    Ok(ResourceConstraints {
        time_limit_secs,
        memory_limit_mb,
        test_count,
    })
}

async fn read_json(path: &Path) -> Result<Value> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| JudgeError::MissingArtifact(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| JudgeError::InvalidConstraints(format!("{}: {}", path.display(), e)))
}

async fn sorted_inputs(input_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(input_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(JudgeError::MissingArtifact(format!("{}: {}", input_dir.display(), e))),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| JudgeError::MissingArtifact(e.to_string()))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".in") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[async_trait]
impl ProblemRepository for FsProblemRepository {
    async fn load(&self, problem_id: &str) -> Result<Problem> {
        let dir = self.problem_dir(problem_id)?;
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(JudgeError::MissingArtifact(format!(
                "problem {} not found",
                problem_id
            )));
        }

        let output_dir = dir.join("output");
        if !tokio::fs::try_exists(&output_dir).await.unwrap_or(false) {
            return Err(JudgeError::MissingArtifact(
                "Problem output directory not found".to_string(),
            ));
        }

        let data_path = dir.join("data.json");
        if !tokio::fs::try_exists(&data_path).await.unwrap_or(false) {
            return Err(JudgeError::MissingArtifact(
                "Missing data.json in problem folder".to_string(),
            ));
        }
        let data = read_json(&data_path).await?;
        let constraints = parse_constraints(&data)?;

        let input_dir = dir.join("input");
        let inputs = sorted_inputs(&input_dir).await?;
        let declared = constraints.test_count as usize;
        if !inputs.is_empty() && inputs.len() != declared {
            warn!(
                problem_id,
                declared,
                found = inputs.len(),
                "test count in data.json disagrees with input files"
            );
        }

        // The declared count wins: surplus inputs are ignored, missing ones
        // become input-less numbered cases.
        let mut inputs = inputs.into_iter();
        let tests: Vec<TestCase> = (1..=declared)
            .map(|ordinal| match inputs.next() {
                Some(name) => {
                    let stem = name.trim_end_matches(".in");
                    TestCase {
                        ordinal,
                        input: Some(input_dir.join(&name)),
                        expected: output_dir.join(format!("{}.out", stem)),
                        name,
                    }
                }
                None => TestCase {
                    ordinal,
                    name: ordinal.to_string(),
                    input: None,
                    expected: output_dir.join(format!("{}.out", ordinal)),
                },
            })
            .collect();

        let checker = match data.get("checker").and_then(Value::as_str) {
            Some(name) => Some(checker::builtin(name).ok_or_else(|| {
                JudgeError::InvalidConstraints(format!("unknown checker: {}", name))
            })?),
            None => None,
        };

        debug!(problem_id, tests = tests.len(), "problem loaded");

        Ok(Problem {
            id: problem_id.to_string(),
            constraints,
            tests,
            checker,
        })
    }

    async fn read_input(&self, test: &TestCase) -> Result<Option<Vec<u8>>> {
        match &test.input {
            Some(path) => tokio::fs::read(path)
                .await
                .map(Some)
                .map_err(|e| JudgeError::MissingArtifact(format!("{}: {}", path.display(), e))),
            None => Ok(None),
        }
    }

    async fn read_expected(&self, test: &TestCase) -> Option<String> {
        match tokio::fs::read(&test.expected).await {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                debug!(test = %test.name, error = %e, "expected output unavailable");
                None
            }
        }
    }

    async fn list_problems(&self) -> Result<Vec<ProblemSummary>> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            JudgeError::MissingArtifact(format!("{}: {}", self.root.display(), e))
        })?;

        let mut problems = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| JudgeError::MissingArtifact(e.to_string()))?
        {
            let id = entry.file_name().to_string_lossy().into_owned();
            let problem = match self.load(&id).await {
                Ok(problem) => problem,
                Err(e) => {
                    debug!(problem_id = %id, error = %e, "skipping directory");
                    continue;
                }
            };
            let title = read_json(&entry.path().join("metadata.json"))
                .await
                .ok()
                .and_then(|meta| meta.get("title").and_then(Value::as_str).map(String::from));

            problems.push(ProblemSummary {
                id,
                title,
                time_limit_secs: problem.constraints.time_limit_secs,
                memory_limit_mb: problem.constraints.memory_limit_mb,
                tests: problem.tests.len(),
            });
        }
        problems.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(problems)
    }

    async fn metadata(&self, problem_id: &str) -> Result<Value> {
        let path = self.problem_dir(problem_id)?.join("metadata.json");
        if !path.is_file() {
            return Err(JudgeError::MissingArtifact(
                "Problem metadata not found".to_string(),
            ));
        }
        read_json(&path).await
    }
}
