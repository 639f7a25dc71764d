//! One submission, start to finish, minus the queueing.

use std::sync::Arc;

use arbiter_common::{Config, Submission, TestVerdict};
use tracing::{debug, info};

use crate::artifact::ArtifactStore;
use crate::engine::TestRunner;
use crate::error::{JudgeError, Result};
use crate::evaluator;
use crate::executor::{ExecutorSettings, SandboxExecutor};
use crate::language::LanguageRegistry;
use crate::metrics;
use crate::pool::ContainerPool;
use crate::problem::{FsProblemRepository, ProblemRepository};
use crate::sandbox::{IsolationProvider, SandboxLimits};

/// Progress checkpoints reported while judging
pub mod progress {
    pub const PROBLEM_LOADED: u8 = 20;
    pub const CODE_LOADED: u8 = 30;
    pub const TESTS_STARTED: u8 = 40;
    pub const TESTS_FINISHED: u8 = 70;
    pub const JUDGED: u8 = 90;

    /// Linear position inside the test phase
    pub fn during_tests(done: usize, total: usize) -> u8 {
        if total == 0 {
            return TESTS_FINISHED;
        }
        let span = (TESTS_FINISHED - TESTS_STARTED) as usize;
        TESTS_STARTED + (span * done.min(total) / total) as u8
    }
}

pub struct JudgeService {
    registry: Arc<LanguageRegistry>,
    problems: Arc<dyn ProblemRepository>,
    artifacts: Arc<dyn ArtifactStore>,
    runner: TestRunner,
}

impl JudgeService {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        problems: Arc<dyn ProblemRepository>,
        artifacts: Arc<dyn ArtifactStore>,
        runner: TestRunner,
    ) -> Self {
        Self {
            registry,
            problems,
            artifacts,
            runner,
        }
    }

    /// Full wiring from configuration
    pub fn from_config(
        config: &Config,
        provider: Arc<dyn IsolationProvider>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let registry = Arc::new(LanguageRegistry::from_config(config));
        let pool = ContainerPool::new(
            Arc::clone(&provider),
            Arc::clone(&registry),
            config.pool_freshness,
            SandboxLimits::new(config.default_time_limit_secs, config.default_memory_limit_mb),
        );
        let executor = Arc::new(SandboxExecutor::new(
            provider,
            ExecutorSettings::from_config(config),
        ));
        let problems = Arc::new(FsProblemRepository::new(config.problems_dir.clone()));

        Self::new(registry, problems, artifacts, TestRunner::new(pool, executor))
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn problems(&self) -> &Arc<dyn ProblemRepository> {
        &self.problems
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    pub fn pool(&self) -> &ContainerPool {
        self.runner.pool()
    }

    /// Runs every test and judges it
    ///
    /// Errors abort the whole submission: unknown language, missing problem
    /// pieces, bad constraints or an unreadable code artifact. Per-test
    /// failures are already folded into verdicts.
    pub async fn judge(
        &self,
        submission: &Submission,
        report: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<Vec<TestVerdict>> {
        let profile = self.registry.get(submission.language)?;

        let problem = self.problems.load(&submission.problem_id).await?;
        report(progress::PROBLEM_LOADED);

        let code = self.artifacts.load(&submission.code_ref).await?;
        report(progress::CODE_LOADED);

        info!(
            submission_id = %submission.id,
            problem_id = %problem.id,
            language = %submission.language,
            tests = problem.tests.len(),
            time_limit_secs = problem.constraints.time_limit_secs,
            memory_limit_mb = problem.constraints.memory_limit_mb,
            "judging submission"
        );

        report(progress::TESTS_STARTED);
        let on_test = |done: usize, total: usize| report(progress::during_tests(done, total));
        let results = self
            .runner
            .run_all(profile, &code, &problem, self.problems.as_ref(), &on_test)
            .await;
        report(progress::TESTS_FINISHED);

        let mut verdicts = Vec::with_capacity(results.len());
        for (test, result) in problem.tests.iter().zip(&results) {
            let expected = self.problems.read_expected(test).await;
            if expected.is_none() {
                debug!(
                    submission_id = %submission.id,
                    error = %JudgeError::MissingExpectedOutput(test.name.clone()),
                    "judging without reference output"
                );
            }
            let verdict = evaluator::judge_test(result, expected.as_deref(), problem.checker.as_deref());
            metrics::record_test(verdict.verdict.label(), result.time_used_secs);
            debug!(
                submission_id = %submission.id,
                test = %verdict.test,
                verdict = %verdict.verdict,
                time_used_secs = verdict.time_used_secs,
                memory_used_mb = verdict.memory_used_mb,
                "test judged"
            );
            verdicts.push(verdict);
        }
        report(progress::JUDGED);

        Ok(verdicts)
    }
}
