/// Test-case Iterator - Ordered Per-Test Execution
///
/// **Core Responsibility:**
/// Build a submission once, then drive its tests through pool + executor
/// and return one `ExecutionResult` per declared test, in declared order.
///
/// **Critical Architectural Boundary:**
/// - Does NOT judge outputs, that is the evaluator's job
/// - A failing test never stops the iteration: creation, transfer and
///   input faults become an RTE-class result for that test only
/// - A failed build becomes an RTE result carrying the diagnostics for
///   every test, nothing is run
///
/// Tests run one at a time by default. `parallelism > 1` overlaps runs but
/// results are still yielded in declared order.
use std::sync::Arc;

use arbiter_common::ExecutionResult;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::executor::{self, Build, BuildOutcome, Program, RunOutcome, SandboxExecutor};
use crate::language::LanguageProfile;
use crate::pool::ContainerPool;
use crate::problem::{Problem, ProblemRepository, TestCase};

/// Called after each finished test with (done, total)
pub type ProgressFn<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

pub struct TestRunner {
    pool: ContainerPool,
    executor: Arc<SandboxExecutor>,
    parallelism: usize,
}

impl TestRunner {
    pub fn new(pool: ContainerPool, executor: Arc<SandboxExecutor>) -> Self {
        Self {
            pool,
            executor,
            parallelism: 1,
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn pool(&self) -> &ContainerPool {
        &self.pool
    }

    pub async fn run_all(
        &self,
        profile: &LanguageProfile,
        code: &[u8],
        problem: &Problem,
        problems: &dyn ProblemRepository,
        on_progress: ProgressFn<'_>,
    ) -> Vec<ExecutionResult> {
        let total = problem.tests.len();
        let program = match self.build(profile, code).await {
            Ok(program) => program,
            Err(failure) => {
                let results: Vec<_> = problem
                    .tests
                    .iter()
                    .map(|test| failure.result(&test.name))
                    .collect();
                on_progress(total, total);
                return results;
            }
        };

        let runs: Vec<_> = problem
            .tests
            .iter()
            .map(|test| self.run_one(profile, &program, problem, problems, test))
            .collect();

        let mut results = Vec::with_capacity(total);
        let finished = stream::iter(runs).buffered(self.parallelism);
        tokio::pin!(finished);
        while let Some(result) = finished.next().await {
            results.push(result);
            on_progress(results.len(), total);
        }
        results
    }

    /// Compiles in a sandbox of its own so the compiler is never charged
    /// against a test's limits
    async fn build(
        &self,
        profile: &LanguageProfile,
        code: &[u8],
    ) -> std::result::Result<Program, BuildFailure> {
        if profile.compile.is_none() {
            return Ok(Program::interpreted(profile, code));
        }

        let limits = self.executor.settings().compile_limits();
        let mut lease = self
            .pool
            .acquire_limits(profile.language, limits)
            .await
            .map_err(|e| {
                warn!(error = %e, "no sandbox for build");
                BuildFailure::new(e.to_string(), String::new())
            })?;

        let outcome = match lease.handle_mut() {
            Some(handle) => self.executor.build(handle, profile, code).await,
            None => {
                self.pool.release(lease, false).await;
                return Err(BuildFailure::new("sandbox lease was empty", String::new()));
            }
        };

        match outcome {
            Ok(BuildOutcome { build, healthy }) => {
                self.pool.release(lease, healthy).await;
                match build {
                    Build::Ready(program) => Ok(program),
                    Build::Failed { message, stderr } => {
                        debug!(language = %profile.language, "build failed");
                        Err(BuildFailure::new(message, stderr))
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "build execution failed");
                self.pool.release(lease, false).await;
                Err(BuildFailure::new(e.to_string(), String::new()))
            }
        }
    }

    async fn run_one(
        &self,
        profile: &LanguageProfile,
        program: &Program,
        problem: &Problem,
        problems: &dyn ProblemRepository,
        test: &TestCase,
    ) -> ExecutionResult {
        let input = match problems.read_input(test).await {
            Ok(input) => input,
            Err(e) => {
                warn!(test = %test.name, error = %e, "input unreadable");
                return ExecutionResult::failed(&test.name, e.to_string());
            }
        };

        let mut lease = match self.pool.acquire(profile.language, &problem.constraints).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(test = %test.name, error = %e, "no sandbox for test");
                return ExecutionResult::failed(&test.name, e.to_string());
            }
        };

        let outcome = match lease.handle_mut() {
            Some(handle) => Some(
                self.executor
                    .execute(
                        handle,
                        profile,
                        program,
                        input.as_deref(),
                        &problem.constraints,
                        &test.name,
                    )
                    .await,
            ),
            None => None,
        };
        let Some(outcome) = outcome else {
            self.pool.release(lease, false).await;
            return ExecutionResult::failed(&test.name, "sandbox lease was empty");
        };

        match outcome {
            Ok(RunOutcome { result, healthy }) => {
                debug!(test = %test.name, outcome = ?result.outcome, healthy, "test finished");
                self.pool.release(lease, healthy).await;
                result
            }
            Err(e) => {
                warn!(test = %test.name, error = %e, "test execution failed");
                self.pool.release(lease, false).await;
                ExecutionResult::failed(&test.name, e.to_string())
            }
        }
    }
}

/// Why no program could be produced, reported against every test
struct BuildFailure {
    message: String,
    stderr: String,
}

impl BuildFailure {
    fn new(message: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stderr: stderr.into(),
        }
    }

    fn result(&self, test_id: &str) -> ExecutionResult {
        executor::build_failure(test_id, &self.message, &self.stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorSettings;
    use crate::language::LanguageRegistry;
    use crate::problem::tests::write_problem;
    use crate::problem::FsProblemRepository;
    use crate::sandbox::fake::{FakeProvider, FakeRun};
    use crate::sandbox::SandboxLimits;
    use arbiter_common::{Language, RawOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn runner(provider: Arc<FakeProvider>) -> TestRunner {
        let registry = Arc::new(
            LanguageRegistry::empty()
                .with_profile(LanguageProfile::python("img"))
                .with_profile(LanguageProfile::cpp("img")),
        );
        let pool = ContainerPool::new(
            provider.clone(),
            registry,
            Duration::from_secs(30),
            SandboxLimits::new(2.0, 256),
        );
        let executor = Arc::new(SandboxExecutor::new(provider, ExecutorSettings::default()));
        TestRunner::new(pool, executor)
    }

    #[tokio::test]
    async fn test_results_in_declared_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_problem(
            tmp.path(),
            "1",
            r#"{"time_limit": 1, "memory_limit": 64, "tests": 3}"#,
            &[
                ("03", Some("three"), Some("three")),
                ("01", Some("one"), Some("one")),
                ("02", Some("two"), Some("two")),
            ],
        );
        let repo = FsProblemRepository::new(tmp.path());
        let problem = repo.load("1").await.unwrap();

        // Earlier tests take longer so overlapping runs finish out of order
        let provider = Arc::new(FakeProvider::new(|inv| {
            let delay = match inv.stdin.as_str() {
                "one" => 60,
                "two" => 30,
                _ => 0,
            };
            FakeRun {
                duration: Duration::from_millis(delay),
                ..FakeRun::ok(&inv.stdin)
            }
        }));
        let runner = runner(provider).with_parallelism(3);
        let calls = AtomicUsize::new(0);
        let progress = |done: usize, total: usize| {
            assert_eq!(total, 3);
            calls.fetch_add(1, Ordering::SeqCst);
            assert!(done <= total);
        };

        let results = runner
            .run_all(&LanguageProfile::python("img"), b"code", &problem, &repo, &progress)
            .await;

        let ids: Vec<_> = results.iter().map(|r| r.test_id.as_str()).collect();
        assert_eq!(ids, vec!["01.in", "02.in", "03.in"]);
        let outputs: Vec<_> = results.iter().map(|r| r.output.as_str()).collect();
        assert_eq!(outputs, vec!["one", "two", "three"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_creation_failure_degrades_per_test() {
        let tmp = tempfile::tempdir().unwrap();
        write_problem(
            tmp.path(),
            "1",
            r#"{"time_limit": 1, "memory_limit": 64, "tests": 2}"#,
            &[("1", None, Some("x")), ("2", None, Some("y"))],
        );
        let repo = FsProblemRepository::new(tmp.path());
        let problem = repo.load("1").await.unwrap();

        let provider = Arc::new(FakeProvider::echo());
        provider.fail_create.store(true, Ordering::SeqCst);
        let results = runner(provider)
            .run_all(&LanguageProfile::python("img"), b"code", &problem, &repo, &|_, _| {})
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcome == RawOutcome::Rte));
        assert_eq!(results[1].test_id, "2");
    }

    #[tokio::test]
    async fn test_unhealthy_run_does_not_stop_iteration() {
        let tmp = tempfile::tempdir().unwrap();
        write_problem(
            tmp.path(),
            "1",
            r#"{"time_limit": 0.1, "memory_limit": 64, "tests": 2}"#,
            &[("1", Some("slow"), Some("")), ("2", Some("fast"), Some("fast"))],
        );
        let repo = FsProblemRepository::new(tmp.path());
        let problem = repo.load("1").await.unwrap();

        let provider = Arc::new(FakeProvider::new(|inv| {
            if inv.stdin == "slow" {
                FakeRun::sleeping(Duration::from_secs(5))
            } else {
                FakeRun::ok(&inv.stdin)
            }
        }));
        let results = runner(provider.clone())
            .run_all(&LanguageProfile::python("img"), b"code", &problem, &repo, &|_, _| {})
            .await;

        assert_eq!(results[0].outcome, RawOutcome::Tle);
        assert_eq!(results[1].outcome, RawOutcome::Ok);
        assert_eq!(results[1].output, "fast");
        // Killed handle was torn down, at most the background warm one is left
        assert!(provider.live_handles() <= 1);
        assert!(provider.destroyed.load(Ordering::SeqCst) >= 1);
    }

    const MIB: u64 = 1024 * 1024;

    #[tokio::test]
    async fn test_warm_handle_enforces_problem_memory_limit() {
        let tmp = tempfile::tempdir().unwrap();
        write_problem(
            tmp.path(),
            "tight",
            r#"{"time_limit": 1, "memory_limit": 16, "tests": 2}"#,
            &[("1", None, Some("")), ("2", None, Some(""))],
        );
        let repo = FsProblemRepository::new(tmp.path());
        let problem = repo.load("tight").await.unwrap();

        // 50MiB fits the 256MB warm handle but not the problem
        let provider = Arc::new(FakeProvider::new(|_| {
            FakeRun::ok("").with_peak(Some(50 * MIB))
        }));
        let runner = runner(provider.clone());
        runner.pool().prewarm_now(&[Language::Python]).await;

        let results = runner
            .run_all(&LanguageProfile::python("img"), b"code", &problem, &repo, &|_, _| {})
            .await;

        let outcomes: Vec<_> = results.iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![RawOutcome::Mle, RawOutcome::Mle]);
        assert!(results.iter().all(|r| r.memory_used_mb <= 16));
        assert!(provider.recaps.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_compiled_once_per_submission() {
        let tmp = tempfile::tempdir().unwrap();
        write_problem(
            tmp.path(),
            "1",
            r#"{"time_limit": 1, "memory_limit": 16, "tests": 3}"#,
            &[
                ("a", Some("1"), Some("1")),
                ("b", Some("2"), Some("2")),
                ("c", Some("3"), Some("3")),
            ],
        );
        let repo = FsProblemRepository::new(tmp.path());
        let problem = repo.load("1").await.unwrap();

        let compiles = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&compiles);
        let provider = Arc::new(FakeProvider::new(move |inv| {
            if inv.is_compile() {
                counter.fetch_add(1, Ordering::SeqCst);
                // Compiler needs more than the problem allows
                FakeRun::ok("").with_peak(Some(200 * MIB))
            } else {
                FakeRun::ok(&inv.stdin).with_peak(Some(2 * MIB))
            }
        }));
        let results = runner(provider.clone())
            .with_parallelism(2)
            .run_all(&LanguageProfile::cpp("img"), b"int main() {}", &problem, &repo, &|_, _| {})
            .await;

        assert_eq!(compiles.load(Ordering::SeqCst), 1);
        let outputs: Vec<_> = results.iter().map(|r| r.output.as_str()).collect();
        assert_eq!(outputs, vec!["1", "2", "3"]);
        assert!(results.iter().all(|r| r.outcome == RawOutcome::Ok));
    }

    #[tokio::test]
    async fn test_build_failure_reported_for_every_test() {
        let tmp = tempfile::tempdir().unwrap();
        write_problem(
            tmp.path(),
            "1",
            r#"{"time_limit": 1, "memory_limit": 64, "tests": 2}"#,
            &[("1", None, Some("x")), ("2", None, Some("y"))],
        );
        let repo = FsProblemRepository::new(tmp.path());
        let problem = repo.load("1").await.unwrap();

        let provider = Arc::new(FakeProvider::new(|inv| {
            assert!(inv.is_compile(), "nothing runs after a failed build");
            FakeRun::exit(1, "main.cpp:1:5: error: 'x' was not declared")
        }));
        let calls = AtomicUsize::new(0);
        let progress = |done: usize, total: usize| {
            assert_eq!(done, total);
            calls.fetch_add(1, Ordering::SeqCst);
        };
        let results = runner(provider)
            .run_all(&LanguageProfile::cpp("img"), b"int main() { x; }", &problem, &repo, &progress)
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[1].test_id, "2");
        assert!(results
            .iter()
            .all(|r| r.outcome == RawOutcome::Rte && r.output.contains("not declared")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
