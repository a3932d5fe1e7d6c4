//! Single-worker FIFO job queue
//!
//! Jobs run strictly one at a time in submission order. The worker task is
//! spawned on the first [`TransferQueue::enqueue`] and lives for the rest of
//! the process; if it ever dies, the next enqueue starts a fresh one. Each job
//! runs in its own task so that a panic fails that job only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::core::job::{Completion, Job, JobFailure, JobId, JobOutcome, JobState};
use crate::core::progress::{render_failed, render_queued, render_starting};
use crate::core::ticket::{StatusReporter, TicketSink};

/// The work done for each job once it reaches the head of the queue.
///
/// `status` is bound to the job's ticket. The handler reports its own
/// progress and success; failures are rendered by the queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        id: JobId,
        job: Job,
        status: Arc<StatusReporter>,
    ) -> Result<Completion, JobFailure>;
}

/// Returned by [`TransferQueue::enqueue`]
#[derive(Debug)]
pub struct Submission {
    pub id: JobId,
    /// 1 means the job starts right away
    pub position: usize,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl Submission {
    /// Wait for the job to finish; `None` if the worker died while running it
    pub async fn outcome(self) -> Option<JobOutcome> {
        self.outcome.await.ok()
    }
}

/// One line of [`TransferQueue::snapshot`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntryView {
    pub id: JobId,
    pub position: usize,
    pub state: JobState,
    pub owner: String,
    pub description: String,
}

struct Entry {
    id: JobId,
    job: Job,
    status: Arc<StatusReporter>,
    /// Fires once the queued card is on the ticket
    announced: oneshot::Receiver<()>,
    outcome: oneshot::Sender<JobOutcome>,
}

struct ActiveJob {
    id: JobId,
    owner: String,
    description: String,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Entry>,
    active: Option<ActiveJob>,
}

struct Shared {
    state: Mutex<QueueState>,
    wakeup: Notify,
    handler: Arc<dyn JobHandler>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// FIFO queue with exactly one worker
pub struct TransferQueue {
    shared: Arc<Shared>,
    tickets: Arc<dyn TicketSink>,
    status_max_tries: u32,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransferQueue {
    pub fn new(
        handler: Arc<dyn JobHandler>,
        tickets: Arc<dyn TicketSink>,
        status_max_tries: u32,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                wakeup: Notify::new(),
                handler,
            }),
            tickets,
            status_max_tries,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(None),
        }
    }

    /// Queue `job` behind everything already submitted.
    ///
    /// The returned position counts the waiting jobs, the running one and
    /// this one. The ticket shows the position (or `Preparing…` when the job
    /// starts right away) before the worker may touch it.
    pub async fn enqueue(&self, job: Job) -> Submission {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let status = Arc::new(StatusReporter::new(
            self.tickets.clone(),
            job.ticket.clone(),
            self.status_max_tries,
        ));
        let (announce_tx, announced) = oneshot::channel();
        let (outcome_tx, outcome) = oneshot::channel();

        log::info!("📥 Job {id} queued: {}", job.source.describe());
        let position = {
            let mut state = self.shared.lock();
            let position = state.pending.len() + usize::from(state.active.is_some()) + 1;
            state.pending.push_back(Entry {
                id,
                job,
                status: status.clone(),
                announced,
                outcome: outcome_tx,
            });
            position
        };
        self.shared.wakeup.notify_one();
        self.ensure_worker();

        status.show(&render_queued(position)).await;
        let _ = announce_tx.send(());

        Submission {
            id,
            position,
            outcome,
        }
    }

    /// The running job (if any) followed by the waiting ones, in order
    pub fn snapshot(&self) -> Vec<QueueEntryView> {
        let state = self.shared.lock();
        let mut views = Vec::with_capacity(state.pending.len() + 1);
        if let Some(active) = &state.active {
            views.push(QueueEntryView {
                id: active.id,
                position: 1,
                state: JobState::Processing,
                owner: active.owner.clone(),
                description: active.description.clone(),
            });
        }
        let offset = views.len();
        views.extend(state.pending.iter().enumerate().map(|(i, entry)| QueueEntryView {
            id: entry.id,
            position: offset + i + 1,
            state: JobState::Queued,
            owner: entry.job.owner.clone(),
            description: entry.job.source.describe().to_string(),
        }));
        views
    }

    /// Whether a worker task is currently alive
    pub fn worker_running(&self) -> bool {
        self.worker_slot()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start the worker unless one is alive
    fn ensure_worker(&self) {
        let mut slot = self.worker_slot();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        if slot.is_some() {
            log::warn!("⚠️  Queue worker had stopped, restarting it");
            // whatever it was running will never report back
            self.shared.lock().active = None;
        }
        *slot = Some(tokio::spawn(run_worker(self.shared.clone())));
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.worker_slot().take() {
            handle.abort();
        }
    }
}

async fn run_worker(shared: Arc<Shared>) {
    log::debug!("Queue worker started");
    loop {
        let entry = next_entry(&shared).await;
        let id = entry.id;
        let outcome = process(&shared, entry.id, entry.job, &entry.status, entry.announced).await;

        match &outcome.result {
            Ok(completion) => log::info!("🏁 Job {id} completed: {}", completion.file_name),
            Err(failure) => {
                log::error!("❌ Job {id} failed: {failure}");
                entry
                    .status
                    .show(&render_failed(failure.stage, &failure.message))
                    .await;
            }
        }

        shared.lock().active = None;
        let _ = entry.outcome.send(outcome);
    }
}

/// Pop the head of the queue and mark it active, waiting while empty
async fn next_entry(shared: &Shared) -> Entry {
    loop {
        {
            let mut state = shared.lock();
            if let Some(entry) = state.pending.pop_front() {
                state.active = Some(ActiveJob {
                    id: entry.id,
                    owner: entry.job.owner.clone(),
                    description: entry.job.source.describe().to_string(),
                });
                return entry;
            }
        }
        shared.wakeup.notified().await;
    }
}

async fn process(
    shared: &Shared,
    id: JobId,
    job: Job,
    status: &Arc<StatusReporter>,
    announced: oneshot::Receiver<()>,
) -> JobOutcome {
    // keep the queued card from overwriting the starting card
    let _ = announced.await;

    if job.cancel.is_cancelled() {
        return JobOutcome::failed(
            id,
            JobFailure {
                stage: None,
                message: "Cancelled before it started".to_string(),
            },
        );
    }

    status.show(&render_starting()).await;
    log::info!("▶️  Job {id} started: {}", job.source.describe());

    let handler = shared.handler.clone();
    let task_status = status.clone();
    let task = tokio::spawn(async move { handler.handle(id, job, task_status).await });

    match task.await {
        Ok(Ok(completion)) => JobOutcome::completed(id, completion),
        Ok(Err(failure)) => JobOutcome::failed(id, failure),
        Err(join_error) => {
            let message = if join_error.is_panic() {
                "Internal error while processing this job".to_string()
            } else {
                "Job was aborted".to_string()
            };
            JobOutcome::failed(id, JobFailure { stage: None, message })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::destination::RemoteFile;
    use crate::core::progress::Stage;
    use crate::core::source::Source;
    use crate::core::ticket::{TicketError, TicketId};
    use std::time::Duration;
    use tokio::sync::{mpsc, Semaphore};

    #[derive(Default)]
    struct RecordingTickets {
        texts: Mutex<Vec<(TicketId, String)>>,
    }

    impl RecordingTickets {
        fn texts_for(&self, ticket: &str) -> Vec<String> {
            self.texts
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t.0 == ticket)
                .map(|(_, text)| text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl TicketSink for RecordingTickets {
        async fn update(&self, ticket: &TicketId, text: &str) -> Result<(), TicketError> {
            self.texts.lock().unwrap().push((ticket.clone(), text.to_string()));
            Ok(())
        }

        async fn post_new(&self, near: &TicketId, _text: &str) -> Result<TicketId, TicketError> {
            Ok(near.clone())
        }
    }

    /// Announces each start, then waits for a permit before finishing.
    /// URLs ending in `/fail` fail and `/panic` panic.
    struct GatedHandler {
        gate: Semaphore,
        started: mpsc::UnboundedSender<JobId>,
    }

    #[async_trait]
    impl JobHandler for GatedHandler {
        async fn handle(
            &self,
            id: JobId,
            job: Job,
            _status: Arc<StatusReporter>,
        ) -> Result<Completion, JobFailure> {
            let _ = self.started.send(id);
            self.gate.acquire().await.unwrap().forget();

            let url = job.source.describe().to_string();
            if url.ends_with("/panic") {
                panic!("handler blew up");
            }
            if url.ends_with("/fail") {
                return Err(JobFailure {
                    stage: Some(Stage::Download),
                    message: "<b>boom</b>".to_string(),
                });
            }
            Ok(Completion {
                file_name: "f.bin".to_string(),
                size: 1,
                remote: RemoteFile {
                    id: id.to_string(),
                    name: "f.bin".to_string(),
                    size: Some(1),
                    link: None,
                },
            })
        }
    }

    fn setup() -> (
        TransferQueue,
        Arc<GatedHandler>,
        Arc<RecordingTickets>,
        mpsc::UnboundedReceiver<JobId>,
    ) {
        let (started, started_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(GatedHandler {
            gate: Semaphore::new(0),
            started,
        });
        let tickets = Arc::new(RecordingTickets::default());
        let queue = TransferQueue::new(handler.clone(), tickets.clone(), 4);
        (queue, handler, tickets, started_rx)
    }

    fn job(url: &str, ticket: &str) -> Job {
        Job::new(Source::Url(url.to_string()), "carol", TicketId(ticket.to_string()))
    }

    #[tokio::test]
    async fn test_jobs_run_one_at_a_time_in_order() {
        let (queue, handler, tickets, mut started) = setup();

        let first = queue.enqueue(job("https://a.example/1", "t1")).await;
        assert_eq!(first.position, 1);
        assert_eq!(started.recv().await, Some(first.id));

        let second = queue.enqueue(job("https://a.example/2", "t2")).await;
        let third = queue.enqueue(job("https://a.example/3", "t3")).await;
        assert_eq!((second.position, third.position), (2, 3));

        let snapshot = queue.snapshot();
        assert_eq!(
            snapshot.iter().map(|v| (v.id, v.position, v.state)).collect::<Vec<_>>(),
            vec![
                (first.id, 1, JobState::Processing),
                (second.id, 2, JobState::Queued),
                (third.id, 3, JobState::Queued),
            ]
        );

        // nothing else starts while the first job holds the worker
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.try_recv().is_err());

        handler.gate.add_permits(1);
        assert!(first.outcome().await.unwrap().is_success());
        assert_eq!(started.recv().await, Some(second.id));

        handler.gate.add_permits(2);
        assert!(second.outcome().await.unwrap().is_success());
        assert_eq!(started.recv().await, Some(third.id));
        assert!(third.outcome().await.unwrap().is_success());

        assert_eq!(tickets.texts_for("t1"), vec!["Preparing…", "⏳ Starting…"]);
        let t2 = tickets.texts_for("t2");
        assert!(t2[0].contains("Position #2"));
        assert_eq!(t2[1], "⏳ Starting…");
        assert!(queue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_failures_and_panics_do_not_stop_the_worker() {
        let (queue, handler, tickets, _started) = setup();
        handler.gate.add_permits(3);

        let failing = queue.enqueue(job("https://a.example/fail", "t1")).await;
        let panicking = queue.enqueue(job("https://a.example/panic", "t2")).await;
        let fine = queue.enqueue(job("https://a.example/ok", "t3")).await;

        let outcome = failing.outcome().await.unwrap();
        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(
            tickets.texts_for("t1").last().unwrap(),
            "❌ Download failed: &lt;b&gt;boom&lt;/b&gt;"
        );

        let outcome = panicking.outcome().await.unwrap();
        assert_eq!(outcome.state, JobState::Failed);
        assert!(tickets.texts_for("t2").last().unwrap().starts_with("❌ Failed:"));

        assert!(fine.outcome().await.unwrap().is_success());
        assert!(queue.worker_running());
    }

    #[tokio::test]
    async fn test_cancelled_queued_job_never_starts() {
        let (queue, handler, _tickets, mut started) = setup();

        let first = queue.enqueue(job("https://a.example/1", "t1")).await;
        assert_eq!(started.recv().await, Some(first.id));

        let doomed = job("https://a.example/2", "t2");
        let cancel = doomed.cancel.clone();
        let second = queue.enqueue(doomed).await;
        cancel.cancel();

        handler.gate.add_permits(1);
        assert!(first.outcome().await.unwrap().is_success());

        let outcome = second.outcome().await.unwrap();
        assert_eq!(outcome.state, JobState::Failed);
        assert!(outcome.result.unwrap_err().message.contains("Cancelled"));
        assert!(started.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_worker_is_restarted_on_enqueue() {
        let (queue, handler, _tickets, mut started) = setup();
        handler.gate.add_permits(2);

        let first = queue.enqueue(job("https://a.example/1", "t1")).await;
        assert!(first.outcome().await.unwrap().is_success());
        assert!(started.recv().await.is_some());

        let mut handle = queue.worker_slot().take().unwrap();
        handle.abort();
        let _ = (&mut handle).await;
        *queue.worker_slot() = Some(handle);
        assert!(!queue.worker_running());

        let second = queue.enqueue(job("https://a.example/2", "t2")).await;
        assert_eq!(second.position, 1);
        assert!(second.outcome().await.unwrap().is_success());
        assert!(queue.worker_running());
    }
}
