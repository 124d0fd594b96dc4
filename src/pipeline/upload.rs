//! Bounded upload queue drained by a single worker.
//!
//! Uploads run strictly one at a time in submission order. A reconciler
//! periodically rewrites the status messages of tasks still waiting so users
//! see their current position.

use super::download::TempFile;
use super::governor::{CallOutcome, RateGovernor};
use super::{status, PipelineError};
use crate::chat::{AudioUpload, ChatClient, ChatError, DeliveredAudio, MessageRef};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of tasks that may wait for upload.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;
/// Default tick of the status reconciler.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome handed to the completion callback and the submitter
pub type UploadResult = Result<DeliveredAudio, PipelineError>;

/// Runs once per task, after the upload finished, failed or was canceled
pub type CompletionCallback =
    Box<dyn FnOnce(UploadResult) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Default)]
struct StatusSlot {
    message: Option<MessageRef>,
    running: bool,
}

/// Shared, re-anchorable reference to a task's status message
#[derive(Debug, Clone, Default)]
pub struct StatusHandle(Arc<Mutex<StatusSlot>>);

impl StatusHandle {
    /// Handle pointing at `message`
    #[must_use]
    pub fn new(message: Option<MessageRef>) -> Self {
        Self(Arc::new(Mutex::new(StatusSlot {
            message,
            running: false,
        })))
    }

    /// Current status message
    #[must_use]
    pub fn get(&self) -> Option<MessageRef> {
        self.0.lock().message
    }

    /// Point at another message
    pub fn set(&self, message: Option<MessageRef>) {
        self.0.lock().message = message;
    }

    /// Detach and return the current message
    pub fn take(&self) -> Option<MessageRef> {
        self.0.lock().message.take()
    }

    fn mark_running(&self) {
        self.0.lock().running = true;
    }

    fn is_running(&self) -> bool {
        self.0.lock().running
    }
}

/// How the audio reaches the chat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTarget {
    /// Send a new audio message
    SendNew,
    /// Replace the status message's content with the audio
    ReplaceStatus,
}

/// A prepared item waiting for delivery
pub struct UploadTask {
    /// Cancellation of the originating request, checked before the upload starts
    pub cancel: CancellationToken,
    /// Destination chat
    pub chat_id: i64,
    /// Status message of the request
    pub status: StatusHandle,
    /// Payload
    pub audio: AudioUpload,
    /// Delivery mode
    pub target: UploadTarget,
    /// HTML label used in status texts
    pub label: String,
    /// Temporary files released once the task completes
    pub cleanup: Vec<Arc<TempFile>>,
    /// Completion callback
    pub on_complete: Option<CompletionCallback>,
}

impl UploadTask {
    /// A task sending `audio` as a new message
    #[must_use]
    pub fn new(chat_id: i64, audio: AudioUpload, label: impl Into<String>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            chat_id,
            status: StatusHandle::default(),
            audio,
            target: UploadTarget::SendNew,
            label: label.into(),
            cleanup: Vec::new(),
            on_complete: None,
        }
    }

    /// Attach the request's cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attach the request's status message
    #[must_use]
    pub fn with_status(mut self, status: StatusHandle, target: UploadTarget) -> Self {
        self.status = status;
        self.target = target;
        self
    }

    /// Release `file` when the task completes
    #[must_use]
    pub fn with_cleanup(mut self, file: Arc<TempFile>) -> Self {
        self.cleanup.push(file);
        self
    }

    /// Run `callback` with the outcome
    #[must_use]
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(UploadResult) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

/// Receipt of an accepted task
#[derive(Debug)]
pub struct UploadTicket {
    /// Tasks ahead of this one at submission time
    pub position: usize,
    done: oneshot::Receiver<UploadResult>,
}

impl UploadTicket {
    /// Wait for the task to finish.
    ///
    /// # Errors
    ///
    /// Returns the upload error, or `Closed` if the worker went away.
    pub async fn wait(self) -> UploadResult {
        self.done.await.unwrap_or(Err(PipelineError::Closed))
    }
}

struct Pending {
    task: UploadTask,
    done: oneshot::Sender<UploadResult>,
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Pending>,
    dirty: bool,
    closed: bool,
}

/// Bounded FIFO of upload tasks
pub struct UploadQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    gate: Semaphore,
}

impl UploadQueue {
    /// Create a queue holding at most `capacity` waiting tasks (at least one)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            gate: Semaphore::new(1),
        }
    }

    /// Queue a task without blocking.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` if `capacity` tasks are already waiting (the queue
    /// is left untouched), or `Closed` after shutdown.
    pub fn submit(&self, task: UploadTask) -> Result<UploadTicket, PipelineError> {
        let (tx, rx) = oneshot::channel();
        let position = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PipelineError::Closed);
            }
            if state.tasks.len() >= self.capacity {
                warn!(
                    chat_id = task.chat_id,
                    capacity = self.capacity,
                    "Upload queue is full"
                );
                return Err(PipelineError::QueueFull {
                    capacity: self.capacity,
                });
            }
            let position = state.tasks.len();
            state.tasks.push_back(Pending { task, done: tx });
            state.dirty = true;
            position
        };
        debug!(position, "Upload task queued");
        self.notify.notify_one();
        Ok(UploadTicket { position, done: rx })
    }

    /// Number of tasks waiting (the running task excluded)
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Whether no task is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of waiting tasks
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn pop(&self) -> Option<Pending> {
        let mut state = self.state.lock();
        let next = state.tasks.pop_front()?;
        state.dirty = true;
        next.task.status.mark_running();
        Some(next)
    }

    fn close_and_drain(&self) -> Vec<Pending> {
        let mut state = self.state.lock();
        state.closed = true;
        state.tasks.drain(..).collect()
    }

    /// Spawn the single upload worker
    pub fn spawn_worker(
        self: &Arc<Self>,
        chat: Arc<dyn ChatClient>,
        governor: Arc<RateGovernor>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run_worker(chat, governor, shutdown).await })
    }

    /// Process tasks until `shutdown` fires; remaining tasks complete as canceled
    pub async fn run_worker(
        &self,
        chat: Arc<dyn ChatClient>,
        governor: Arc<RateGovernor>,
        shutdown: CancellationToken,
    ) {
        info!(capacity = self.capacity, "Upload worker started");
        loop {
            let Some(pending) = self.pop() else {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = self.notify.notified() => {}
                }
                continue;
            };

            let result = if pending.task.cancel.is_cancelled() {
                debug!(chat_id = pending.task.chat_id, "Upload task canceled before start");
                Err(PipelineError::Canceled)
            } else {
                self.execute(&pending.task, chat.as_ref(), &governor, &shutdown)
                    .await
            };
            complete(pending, result).await;
        }

        let remaining = self.close_and_drain();
        if !remaining.is_empty() {
            info!(count = remaining.len(), "Canceling queued uploads on shutdown");
        }
        for pending in remaining {
            complete(pending, Err(PipelineError::Canceled)).await;
        }
        info!("Upload worker stopped");
    }

    async fn execute(
        &self,
        task: &UploadTask,
        chat: &dyn ChatClient,
        governor: &RateGovernor,
        shutdown: &CancellationToken,
    ) -> UploadResult {
        let _gate = self.gate.acquire().await.map_err(|_| PipelineError::Closed)?;
        // Once running, only shutdown interrupts the upload.
        let cancel = shutdown.child_token();

        if let Some(message) = task.status.get() {
            let text = status::uploading(&task.label);
            if let Err(e) = governor
                .best_effort(message.chat_id, &cancel, || {
                    chat.edit_message_text(message, &text)
                })
                .await
            {
                debug!(error = %e, "Failed to show uploading status");
            }
        }

        let audio = &task.audio;
        let chat_id = task.chat_id;
        let outcome = match (task.target, task.status.get()) {
            (UploadTarget::ReplaceStatus, Some(message)) => {
                governor
                    .with_retry(chat_id, &cancel, || chat.edit_message_media(message, audio))
                    .await
            }
            _ => {
                governor
                    .with_retry(chat_id, &cancel, || chat.send_audio(chat_id, audio))
                    .await
            }
        };

        match outcome {
            Ok(CallOutcome::Done(delivered)) => {
                info!(chat_id, message_id = delivered.message.message_id, "Audio delivered");
                Ok(delivered)
            }
            Ok(other) => Err(match other {
                CallOutcome::Dropped => PipelineError::Canceled,
                _ => PipelineError::Chat(ChatError::NotModified),
            }),
            Err(e) => {
                warn!(chat_id, error = %e, "Audio delivery failed");
                Err(e)
            }
        }
    }

    /// Rewrite status messages of waiting tasks if the queue changed.
    ///
    /// Returns the number of status messages touched.
    pub async fn reconcile_once(
        &self,
        chat: &dyn ChatClient,
        governor: &RateGovernor,
        cancel: &CancellationToken,
    ) -> usize {
        let snapshot: Vec<(usize, i64, StatusHandle, String)> = {
            let mut state = self.state.lock();
            if !state.dirty {
                return 0;
            }
            state.dirty = false;
            state
                .tasks
                .iter()
                .enumerate()
                .map(|(ahead, p)| {
                    (ahead, p.task.chat_id, p.task.status.clone(), p.task.label.clone())
                })
                .collect()
        };

        let mut touched = 0;
        for (ahead, chat_id, handle, label) in snapshot {
            if handle.is_running() {
                continue;
            }
            let text = status::queued_for_upload(&label, ahead);
            match handle.get() {
                Some(message) => {
                    let (text, slot) = (text.as_str(), &handle);
                    let edited = governor
                        .best_effort(chat_id, cancel, move || async move {
                            // the worker may have started the task while we waited
                            if slot.is_running() {
                                return Ok(false);
                            }
                            chat.edit_message_text(message, text).await.map(|()| true)
                        })
                        .await;
                    match edited {
                        Ok(CallOutcome::Done(false)) => {}
                        Ok(_) => touched += 1,
                        Err(PipelineError::Chat(ChatError::MessageNotFound)) => {
                            debug!(chat_id, "Status message gone, sending a new one");
                            if reanchor(chat, governor, cancel, chat_id, text, &handle).await {
                                touched += 1;
                            }
                        }
                        Err(e) => debug!(chat_id, error = %e, "Status refresh failed"),
                    }
                }
                None => {
                    if reanchor(chat, governor, cancel, chat_id, &text, &handle).await {
                        touched += 1;
                    }
                }
            }
        }
        touched
    }

    /// Spawn the periodic status reconciler
    pub fn spawn_reconciler(
        self: &Arc<Self>,
        chat: Arc<dyn ChatClient>,
        governor: Arc<RateGovernor>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        queue.reconcile_once(chat.as_ref(), &governor, &shutdown).await;
                    }
                }
            }
            debug!("Status reconciler stopped");
        })
    }
}

async fn reanchor(
    chat: &dyn ChatClient,
    governor: &RateGovernor,
    cancel: &CancellationToken,
    chat_id: i64,
    text: &str,
    handle: &StatusHandle,
) -> bool {
    match governor
        .best_effort(chat_id, cancel, move || async move {
            if handle.is_running() {
                return Ok(None);
            }
            chat.send_message(chat_id, text).await.map(Some)
        })
        .await
    {
        Ok(CallOutcome::Done(Some(message))) => {
            handle.set(Some(message));
            true
        }
        Ok(_) => false,
        Err(e) => {
            debug!(chat_id, error = %e, "Failed to send replacement status");
            false
        }
    }
}

async fn complete(pending: Pending, result: UploadResult) {
    let Pending { mut task, done } = pending;
    if let Some(callback) = task.on_complete.take() {
        callback(result.clone()).await;
    }
    task.cleanup.clear();
    // the submitter may have stopped listening
    let _ = done.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::AudioSource;
    use crate::pipeline::governor::{BucketConfig, GovernorConfig};
    use crate::testing::{ChatCall, FakeChat};
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn governor() -> Arc<RateGovernor> {
        let config = GovernorConfig {
            per_chat: BucketConfig {
                rate_per_sec: 1000.0,
                burst: 100,
            },
            global: None,
            ..GovernorConfig::default()
        };
        Arc::new(RateGovernor::new(config).expect("valid governor"))
    }

    fn audio(title: &str) -> AudioUpload {
        AudioUpload {
            source: AudioSource::FileId(format!("file-{title}")),
            title: title.to_string(),
            performer: "Artist".to_string(),
            duration_secs: Some(180),
            caption: None,
        }
    }

    fn task(chat_id: i64, title: &str) -> UploadTask {
        UploadTask::new(chat_id, audio(title), title)
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let queue = Arc::new(UploadQueue::new(2));
        let chat = Arc::new(FakeChat::new());

        let first = queue.submit(task(1, "a")).expect("first accepted");
        let second = queue.submit(task(1, "b")).expect("second accepted");
        assert_eq!(second.position, 1);
        assert!(matches!(
            queue.submit(task(1, "c")),
            Err(PipelineError::QueueFull { capacity: 2 })
        ));
        assert_eq!(queue.len(), 2);

        let shutdown = CancellationToken::new();
        let worker = queue.spawn_worker(chat.clone(), governor(), shutdown.clone());
        first.wait().await.expect("first delivered");

        let fourth = queue.submit(task(1, "d")).expect("slot freed");
        second.wait().await.expect("second delivered");
        fourth.wait().await.expect("fourth delivered");

        shutdown.cancel();
        worker.await.expect("worker join");
    }

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let queue = Arc::new(UploadQueue::new(8));
        let chat = Arc::new(FakeChat::new());
        let tickets: Vec<_> = ["one", "two", "three"]
            .iter()
            .map(|t| queue.submit(task(5, t)).expect("accepted"))
            .collect();

        let shutdown = CancellationToken::new();
        queue.spawn_worker(chat.clone(), governor(), shutdown.clone());
        for ticket in tickets {
            ticket.wait().await.expect("delivered");
        }
        shutdown.cancel();

        let titles: Vec<String> = chat
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                ChatCall::SendAudio { title, .. } => Some(title),
                _ => None,
            })
            .collect();
        assert_eq!(titles, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn canceled_task_still_runs_its_callback() {
        let queue = Arc::new(UploadQueue::new(4));
        let chat = Arc::new(FakeChat::new());
        let callbacks = Arc::new(AtomicUsize::new(0));

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("x.mp3");
        std::fs::write(&path, b"data").expect("write");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let seen = Arc::clone(&callbacks);
        let ticket = queue
            .submit(
                task(1, "gone")
                    .with_cancel(cancel)
                    .with_cleanup(Arc::new(TempFile::new(&path)))
                    .on_complete(move |result| {
                        async move {
                            assert_eq!(result, Err(PipelineError::Canceled));
                            seen.fetch_add(1, Ordering::SeqCst);
                        }
                        .boxed()
                    }),
            )
            .expect("accepted");

        let shutdown = CancellationToken::new();
        queue.spawn_worker(chat.clone(), governor(), shutdown.clone());

        assert_eq!(ticket.wait().await, Err(PipelineError::Canceled));
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
        assert!(chat.calls().is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn replace_status_edits_the_status_message() {
        let queue = Arc::new(UploadQueue::new(4));
        let chat = Arc::new(FakeChat::new());
        let status = chat.send_message(3, "queued").await.expect("status");

        let ticket = queue
            .submit(
                task(3, "song")
                    .with_status(StatusHandle::new(Some(status)), UploadTarget::ReplaceStatus),
            )
            .expect("accepted");
        let shutdown = CancellationToken::new();
        queue.spawn_worker(chat.clone(), governor(), shutdown.clone());

        let delivered = ticket.wait().await.expect("delivered");
        assert_eq!(delivered.message, status);
        assert!(chat
            .calls()
            .iter()
            .any(|c| matches!(c, ChatCall::EditMedia { message, .. } if *message == status)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn reconciler_refreshes_only_when_dirty_and_reanchors() {
        let queue = UploadQueue::new(4);
        let chat = FakeChat::new();
        let gov = governor();
        let cancel = CancellationToken::new();

        let first = chat.send_message(1, "queued").await.expect("status");
        let second = chat.send_message(2, "queued").await.expect("status");
        let second_handle = StatusHandle::new(Some(second));
        let _a = queue
            .submit(task(1, "a").with_status(StatusHandle::new(Some(first)), UploadTarget::SendNew))
            .expect("accepted");
        let _b = queue
            .submit(task(2, "b").with_status(second_handle.clone(), UploadTarget::SendNew))
            .expect("accepted");
        chat.delete_message(second).await.expect("deleted");

        assert_eq!(queue.reconcile_once(&chat, &gov, &cancel).await, 2);
        assert_eq!(queue.reconcile_once(&chat, &gov, &cancel).await, 0);

        let anchored = second_handle.get().expect("re-anchored");
        assert_ne!(anchored, second);
        assert_eq!(anchored.chat_id, 2);
    }

    #[tokio::test]
    async fn reconciler_skips_tasks_started_while_it_waited() {
        let queue = Arc::new(UploadQueue::new(4));
        let chat = Arc::new(FakeChat::new());
        let config = GovernorConfig {
            per_chat: BucketConfig {
                rate_per_sec: 5.0,
                burst: 1,
            },
            global: None,
            ..GovernorConfig::default()
        };
        let gov = Arc::new(RateGovernor::new(config).expect("valid governor"));
        let cancel = CancellationToken::new();

        let status = chat.send_message(1, "queued").await.expect("status");
        let _ticket = queue
            .submit(task(1, "a").with_status(StatusHandle::new(Some(status)), UploadTarget::SendNew))
            .expect("accepted");
        gov.wait(1, &cancel).await.expect("token");

        let refresh = {
            let queue = Arc::clone(&queue);
            let chat = Arc::clone(&chat);
            let gov = Arc::clone(&gov);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.reconcile_once(chat.as_ref(), &gov, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = queue.pop().expect("task");

        assert_eq!(refresh.await.expect("join"), 0);
        assert!(!chat
            .calls()
            .iter()
            .any(|c| matches!(c, ChatCall::EditText { .. })));
        drop(started);
    }

    #[test]
    fn worker_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let queue = UploadQueue::new(1);
        let chat: Arc<dyn ChatClient> = Arc::new(FakeChat::new());
        let worker = queue.run_worker(chat, governor(), CancellationToken::new());
        assert_send(&worker);
    }

    #[tokio::test]
    async fn shutdown_cancels_waiting_tasks() {
        let queue = Arc::new(UploadQueue::new(4));
        let chat = Arc::new(FakeChat::new());
        let ticket = queue.submit(task(1, "late")).expect("accepted");

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        queue
            .run_worker(chat.clone(), governor(), shutdown)
            .await;

        // the worker may pick the task before noticing shutdown
        let result = ticket.wait().await;
        assert!(result.is_ok() || result == Err(PipelineError::Canceled));
        assert!(matches!(
            queue.submit(task(1, "after")),
            Err(PipelineError::Closed)
        ));
    }
}
