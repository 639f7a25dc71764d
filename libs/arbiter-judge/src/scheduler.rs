/// Submission Scheduler - Bounded Worker Pool
///
/// **Core Responsibility:**
/// Admit submissions, run at most `max_workers` of them at once, and keep
/// every submission's record for status readers.
///
/// **State machine:**
/// queued → processing → {completed | error}
///
/// **Guarantees:**
/// - FIFO admission; completion order is not guaranteed
/// - Work conserving: a finishing worker immediately claims the next id
/// - A failing (or panicking) submission only ever affects itself
/// - Only the owning worker writes a submission; readers get snapshots
///
/// The scheduler is an explicitly constructed value. `shutdown` stops
/// admission, fails whatever is still queued, waits for in-flight work and
/// tears the sandbox pool down.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use arbiter_common::{
    QueueStats, Submission, SubmissionId, SubmissionRequest, SubmissionStatus, TestVerdict,
};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{JudgeError, Result};
use crate::metrics;
use crate::service::JudgeService;

const STARTED_PROGRESS: u8 = 10;

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<SubmissionId>,
    /// Ids holding a worker slot; a slot is freed in the same critical
    /// section that makes its submission terminal
    running: HashSet<SubmissionId>,
}

impl DispatchState {
    fn active(&self) -> usize {
        self.running.len()
    }

    fn release(&mut self, id: SubmissionId) {
        self.running.remove(&id);
        metrics::set_queue_gauges(self.queue.len(), self.active());
    }
}

struct Inner {
    service: Arc<JudgeService>,
    max_workers: usize,
    dispatch: Mutex<DispatchState>,
    submissions: RwLock<HashMap<SubmissionId, Submission>>,
    accepting: AtomicBool,
    /// Signalled whenever a worker finishes
    worker_done: Notify,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Inner {
    fn dispatch_state(&self) -> std::sync::MutexGuard<'_, DispatchState> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<F>(&self, id: SubmissionId, f: F)
    where
        F: FnOnce(&mut Submission),
    {
        let mut submissions = self
            .submissions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(submission) = submissions.get_mut(&id) {
            f(submission);
        }
    }

    /// Claims queued ids while worker capacity is free
    fn dispatch(self: &Arc<Self>) {
        loop {
            let id = {
                let mut state = self.dispatch_state();
                if state.active() >= self.max_workers {
                    break;
                }
                let Some(id) = state.queue.pop_front() else {
                    break;
                };
                state.running.insert(id);
                metrics::set_queue_gauges(state.queue.len(), state.active());
                id
            };
            self.spawn_worker(id);
        }
    }

    fn spawn_worker(self: &Arc<Self>, id: SubmissionId) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            // Nested task so a panic surfaces as a JoinError instead of
            // leaking the worker slot
            let job = tokio::spawn(Arc::clone(&inner).process(id));
            if let Err(e) = job.await {
                error!(submission_id = %id, error = %e, "worker crashed");
                let mut code_ref = None;
                inner.update(id, |s| code_ref = Some(s.code_ref.clone()));
                if let Some(code_ref) = code_ref {
                    inner.service.artifacts().discard(&code_ref).await;
                }
                inner.finish(
                    id,
                    Err(JudgeError::InternalScheduling(format!("worker crashed: {}", e))),
                );
            }

            // No-op when finish already freed the slot
            inner.dispatch_state().release(id);
            inner.worker_done.notify_waiters();
            inner.dispatch();
        });
    }

    async fn process(self: Arc<Self>, id: SubmissionId) {
        let mut snapshot = None;
        self.update(id, |submission| {
            submission.mark_processing();
            submission.advance(STARTED_PROGRESS);
            snapshot = Some(submission.clone());
        });
        let Some(submission) = snapshot else {
            warn!(submission_id = %id, "claimed submission vanished");
            return;
        };

        let report = |progress: u8| self.update(id, |s| s.advance(progress));
        let outcome = self.service.judge(&submission, &report).await;

        self.service.artifacts().discard(&submission.code_ref).await;
        self.finish(id, outcome);
    }

    /// Terminal transition plus slot release, atomic for stats readers
    fn finish(&self, id: SubmissionId, outcome: Result<Vec<TestVerdict>>) {
        let mut state = self.dispatch_state();
        self.update(id, |submission| {
            let language = submission.language.as_str();
            match outcome {
                Ok(results) => {
                    if submission.complete(results) {
                        metrics::record_submission_finished(language, "completed");
                        if let Some(summary) = &submission.summary {
                            info!(
                                submission_id = %id,
                                total = summary.total,
                                passed = summary.passed,
                                failed = summary.failed,
                                "submission completed"
                            );
                        }
                    }
                }
                Err(e) => {
                    if submission.fail(e.to_string()) {
                        metrics::record_submission_finished(language, "error");
                        warn!(submission_id = %id, error = %e, "submission failed");
                    }
                }
            }
        });
        state.release(id);
    }
}

impl Scheduler {
    pub fn new(service: Arc<JudgeService>, max_workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                service,
                max_workers: max_workers.max(1),
                dispatch: Mutex::new(DispatchState::default()),
                submissions: RwLock::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                worker_done: Notify::new(),
            }),
        }
    }

    pub fn service(&self) -> &Arc<JudgeService> {
        &self.inner.service
    }

    /// Enqueues a submission and starts it right away if a worker is free
    ///
    /// Must be called from within a Tokio runtime. Unsupported languages are
    /// rejected here, before anything is queued or allocated.
    pub fn add_submission(&self, request: SubmissionRequest) -> Result<SubmissionId> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(JudgeError::InternalScheduling(
                "scheduler is shutting down".to_string(),
            ));
        }
        self.inner.service.registry().get(request.language)?;

        let id = Uuid::new_v4();
        let language = request.language;
        self.inner
            .submissions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Submission::new(id, request));
        {
            let mut state = self.inner.dispatch_state();
            state.queue.push_back(id);
            metrics::set_queue_gauges(state.queue.len(), state.active());
        }
        metrics::record_submission(language.as_str());
        info!(submission_id = %id, %language, "submission queued");

        self.inner.dispatch();
        Ok(id)
    }

    pub fn get_status(&self, id: SubmissionId) -> Option<Submission> {
        self.inner
            .submissions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn get_queue_stats(&self) -> QueueStats {
        let (queue_length, active_workers) = {
            let state = self.inner.dispatch_state();
            (state.queue.len(), state.active())
        };
        let total_submissions = self
            .inner
            .submissions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();

        QueueStats {
            queue_length,
            active_workers,
            max_workers: self.inner.max_workers,
            total_submissions,
        }
    }

    /// Every known submission, newest first
    pub fn list_submissions(&self) -> Vec<Submission> {
        let mut all: Vec<Submission> = self
            .inner
            .submissions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Drops terminal submissions outside the newest `keep`, returns how many
    pub fn retain_latest(&self, keep: usize) -> usize {
        let mut submissions = self
            .inner
            .submissions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut by_age: Vec<(SubmissionId, chrono::DateTime<chrono::Utc>, SubmissionStatus)> =
            submissions
                .values()
                .map(|s| (s.id, s.created_at, s.status))
                .collect();
        by_age.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = 0;
        for (id, _, status) in by_age.into_iter().skip(keep) {
            if status.is_terminal() {
                submissions.remove(&id);
                removed += 1;
            }
        }
        removed
    }

    /// Waits until `id` is terminal, `None` for an unknown id
    pub async fn wait_for(&self, id: SubmissionId) -> Option<Submission> {
        loop {
            let notified = self.inner.worker_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let submission = self.get_status(id)?;
            if submission.status.is_terminal() {
                return Some(submission);
            }
            notified.await;
        }
    }

    pub async fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::AcqRel) {
            return;
        }

        let abandoned: Vec<SubmissionId> = {
            let mut state = self.inner.dispatch_state();
            let ids = state.queue.drain(..).collect();
            metrics::set_queue_gauges(0, state.active());
            ids
        };
        for &id in &abandoned {
            let mut code_ref = None;
            self.inner.update(id, |submission| {
                if submission.fail("Scheduler shut down before processing") {
                    metrics::record_submission_finished(submission.language.as_str(), "error");
                }
                code_ref = Some(submission.code_ref.clone());
            });
            if let Some(code_ref) = code_ref {
                self.inner.service.artifacts().discard(&code_ref).await;
            }
        }
        info!(abandoned = abandoned.len(), "scheduler draining");

        loop {
            let notified = self.inner.worker_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.dispatch_state().active() == 0 {
                break;
            }
            notified.await;
        }

        self.inner.service.pool().shutdown().await;
        info!("scheduler stopped");
    }
}
