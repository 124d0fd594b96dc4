//! The delivery pipeline
//!
//! A request flows through the admission controller, coalesced upstream
//! fetches and a download, then waits in the upload queue until the single
//! worker delivers it. Every outbound chat call goes through the governor.

/// Download admission control.
pub mod admission;
/// Request coalescing.
pub mod coalesce;
/// Streaming downloads.
pub mod download;
mod error;
/// Rate-limited retry governor.
pub mod governor;
/// Status texts.
pub mod status;
/// Upload queue and worker.
pub mod upload;

pub use admission::{AdmissionController, AdmissionSlot, PositionCallback};
pub use coalesce::{CallKey, CallOp, Coalescer};
pub use download::{Downloader, TempFile};
pub use error::{ErrorKind, PipelineError};
pub use self::governor::{BucketConfig, CallOutcome, GovernorConfig, RateGovernor};
pub use upload::{
    StatusHandle, UploadQueue, UploadResult, UploadTarget, UploadTask, UploadTicket,
};

use crate::chat::{AudioSource, AudioUpload, ChatClient, DeliveredAudio};
use crate::platform::{DownloadInfo, PlatformRegistry, Quality, Track};
use crate::state::{InteractionState, StoreConfig};
use crate::storage::{CachedSong, SongCache, SongKey};
use crate::utils::track_label;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default number of concurrent downloads.
pub const DEFAULT_DOWNLOAD_POOL_SIZE: usize = 4;
/// Default timeout of a single download.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Typed settings of the delivery pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Outbound rate limiting
    pub governor: GovernorConfig,
    /// Concurrent downloads
    pub download_pool_size: usize,
    /// Tasks that may wait for upload
    pub upload_queue_capacity: usize,
    /// Tick of the queued-status reconciler
    pub status_reconcile_interval: Duration,
    /// Where downloads are written
    pub download_dir: PathBuf,
    /// Timeout of a single download
    pub download_timeout: Duration,
    /// Interaction store windows
    pub stores: StoreConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            governor: GovernorConfig::default(),
            download_pool_size: DEFAULT_DOWNLOAD_POOL_SIZE,
            upload_queue_capacity: upload::DEFAULT_QUEUE_CAPACITY,
            status_reconcile_interval: upload::DEFAULT_RECONCILE_INTERVAL,
            download_dir: std::env::temp_dir().join("oxide-music"),
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            stores: StoreConfig::default(),
        }
    }
}

/// A "fetch and deliver track X" request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    /// Requesting chat
    pub chat_id: i64,
    /// Platform name
    pub platform: String,
    /// Track id on the platform
    pub track_id: String,
    /// Requested quality
    pub quality: Quality,
    /// Delivery mode
    pub target: UploadTarget,
}

impl DeliveryRequest {
    /// Request a track in standard quality, sent as a new message
    #[must_use]
    pub fn new(chat_id: i64, platform: impl Into<String>, track_id: impl Into<String>) -> Self {
        Self {
            chat_id,
            platform: platform.into(),
            track_id: track_id.into(),
            quality: Quality::default(),
            target: UploadTarget::SendNew,
        }
    }

    /// Change the requested quality
    #[must_use]
    pub const fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }
}

/// Best-effort status message updates bound to the service lifetime
#[derive(Clone)]
struct StatusReporter {
    chat: Arc<dyn ChatClient>,
    governor: Arc<RateGovernor>,
    cancel: CancellationToken,
}

impl StatusReporter {
    async fn open(&self, chat_id: i64, text: &str) -> StatusHandle {
        let sent = self
            .governor
            .with_retry(chat_id, &self.cancel, || self.chat.send_message(chat_id, text))
            .await;
        match sent {
            Ok(outcome) => StatusHandle::new(outcome.into_option()),
            Err(e) => {
                warn!(chat_id, error = %e, "Failed to send status message");
                StatusHandle::default()
            }
        }
    }

    async fn show(&self, status: &StatusHandle, text: &str) {
        let Some(message) = status.get() else {
            return;
        };
        let result = self
            .governor
            .best_effort(message.chat_id, &self.cancel, || {
                self.chat.edit_message_text(message, text)
            })
            .await;
        if let Err(e) = result {
            debug!(chat_id = message.chat_id, error = %e, "Status update failed");
        }
    }

    async fn clear(&self, status: &StatusHandle) {
        let Some(message) = status.take() else {
            return;
        };
        let result = self
            .governor
            .best_effort(message.chat_id, &self.cancel, || {
                self.chat.delete_message(message)
            })
            .await;
        if let Err(e) = result {
            debug!(chat_id = message.chat_id, error = %e, "Failed to delete status message");
        }
    }
}

/// Owns every pipeline component; handlers share it through an `Arc`
pub struct DeliveryService {
    platforms: PlatformRegistry,
    songs: Arc<dyn SongCache>,
    chat: Arc<dyn ChatClient>,
    governor: Arc<RateGovernor>,
    admission: AdmissionController,
    uploads: Arc<UploadQueue>,
    tracks: Coalescer<CallKey, Track>,
    download_infos: Coalescer<CallKey, DownloadInfo>,
    prepared: Coalescer<CallKey, Arc<TempFile>>,
    downloader: Arc<Downloader>,
    state: InteractionState,
    reporter: StatusReporter,
    reconcile_interval: Duration,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl DeliveryService {
    /// Build the service; background tasks start with [`Self::start`]
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` for invalid settings.
    pub fn new(
        config: &PipelineConfig,
        chat: Arc<dyn ChatClient>,
        platforms: PlatformRegistry,
        songs: Arc<dyn SongCache>,
    ) -> Result<Self, PipelineError> {
        let governor = Arc::new(RateGovernor::new(config.governor)?);
        let shutdown = CancellationToken::new();
        let reporter = StatusReporter {
            chat: Arc::clone(&chat),
            governor: Arc::clone(&governor),
            cancel: shutdown.clone(),
        };

        Ok(Self {
            platforms,
            songs,
            chat,
            governor,
            admission: AdmissionController::new(config.download_pool_size),
            uploads: Arc::new(UploadQueue::new(config.upload_queue_capacity)),
            tracks: Coalescer::new(),
            download_infos: Coalescer::new(),
            prepared: Coalescer::new(),
            downloader: Arc::new(Downloader::new(
                &config.download_dir,
                config.download_timeout,
            )?),
            state: InteractionState::new(config.stores),
            reporter,
            reconcile_interval: config.status_reconcile_interval,
            shutdown,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Build the service and spawn the upload worker, status reconciler and
    /// throttle sweeper
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` for invalid settings.
    pub fn start(
        config: &PipelineConfig,
        chat: Arc<dyn ChatClient>,
        platforms: PlatformRegistry,
        songs: Arc<dyn SongCache>,
    ) -> Result<Arc<Self>, PipelineError> {
        let service = Arc::new(Self::new(config, chat, platforms, songs)?);
        let handles = vec![
            service.uploads.spawn_worker(
                Arc::clone(&service.chat),
                Arc::clone(&service.governor),
                service.shutdown.clone(),
            ),
            service.uploads.spawn_reconciler(
                Arc::clone(&service.chat),
                Arc::clone(&service.governor),
                service.reconcile_interval,
                service.shutdown.clone(),
            ),
            service.governor.spawn_sweeper(service.shutdown.clone()),
        ];
        service.background.lock().extend(handles);
        info!(
            pool = service.admission.pool_size(),
            queue = service.uploads.capacity(),
            "Delivery service started"
        );
        Ok(service)
    }

    /// Stop background tasks; queued uploads complete as canceled
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.admission.close();
        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Delivery service stopped");
    }

    /// Fresh cancellation token for work that must outlive the triggering event.
    ///
    /// Only service shutdown cancels it.
    #[must_use]
    pub fn detached(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Process `request` in the background, detached from the caller.
    ///
    /// Returns the request's own token, which cancels it.
    pub fn dispatch(self: &Arc<Self>, request: DeliveryRequest) -> CancellationToken {
        let cancel = self.detached();
        let service = Arc::clone(self);
        let token = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = service.process(request, token).await {
                debug!(error = %e, "Delivery ended without success");
            }
        });
        cancel
    }

    /// Process a request to completion.
    ///
    /// Failures are also shown to the user in the status message.
    ///
    /// # Errors
    ///
    /// Returns the pipeline error that ended the request.
    #[instrument(skip(self, cancel), fields(chat_id = request.chat_id, platform = %request.platform, track_id = %request.track_id))]
    pub async fn process(
        &self,
        request: DeliveryRequest,
        cancel: CancellationToken,
    ) -> Result<DeliveredAudio, PipelineError> {
        let status = self
            .reporter
            .open(request.chat_id, &status::accepted())
            .await;

        match self.prepare(&request, &status, &cancel).await {
            Ok(ticket) => ticket.wait().await,
            Err(e) => {
                warn!(error = %e, "Delivery failed before upload");
                self.reporter.show(&status, &status::failed(&e)).await;
                Err(e)
            }
        }
    }

    async fn prepare(
        &self,
        request: &DeliveryRequest,
        status: &StatusHandle,
        cancel: &CancellationToken,
    ) -> Result<UploadTicket, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Canceled);
        }

        if let Some(song) = self.cached_song(request).await {
            info!(file_id = %song.file_id, "Cache hit, resending stored file");
            return self.enqueue_cached(request, song, status, cancel);
        }

        let platform = self.platforms.get(&request.platform)?;

        let slot = self
            .acquire_with_status(cancel, status)
            .await?;

        let track = {
            let platform = Arc::clone(&platform);
            let id = request.track_id.clone();
            cancellable(
                cancel,
                self.tracks.run(
                    CallKey::track(&request.platform, &request.track_id),
                    move || async move { platform.get_track(&id).await.map_err(PipelineError::from) },
                ),
            )
            .await?
        };

        let label = track_label(&track.artist, &track.title);
        self.reporter
            .show(status, &status::downloading(&label))
            .await;

        let info = {
            let platform = Arc::clone(&platform);
            let id = request.track_id.clone();
            let quality = request.quality;
            cancellable(
                cancel,
                self.download_infos.run(
                    CallKey::download_info(&request.platform, &request.track_id, quality),
                    move || async move {
                        platform
                            .get_download_info(&id, quality)
                            .await
                            .map_err(PipelineError::from)
                    },
                ),
            )
            .await?
        };

        let file = {
            let downloader = Arc::clone(&self.downloader);
            let fetch_cancel = self.detached();
            cancellable(
                cancel,
                self.prepared.run(
                    CallKey::prepared(&request.platform, &request.track_id, request.quality),
                    move || async move {
                        downloader.fetch(&info, &fetch_cancel).await.map(Arc::new)
                    },
                ),
            )
            .await?
        };
        drop(slot);

        let audio = AudioUpload {
            source: AudioSource::File(file.path().to_path_buf()),
            title: track.title.clone(),
            performer: track.artist.clone(),
            duration_secs: track.duration_secs,
            caption: None,
        };
        let key = SongKey::new(&request.platform, &request.track_id, request.quality);
        let task = UploadTask::new(request.chat_id, audio, label)
            .with_cancel(cancel.clone())
            .with_status(status.clone(), request.target)
            .with_cleanup(file)
            .on_complete(self.on_fresh_upload(key, track, status.clone(), request.target));

        self.enqueue_upload(task)
    }

    async fn cached_song(&self, request: &DeliveryRequest) -> Option<CachedSong> {
        match self
            .songs
            .find_by_key(&request.platform, &request.track_id, request.quality)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Song cache lookup failed, downloading instead");
                None
            }
        }
    }

    fn enqueue_cached(
        &self,
        request: &DeliveryRequest,
        song: CachedSong,
        status: &StatusHandle,
        cancel: &CancellationToken,
    ) -> Result<UploadTicket, PipelineError> {
        let audio = AudioUpload {
            source: AudioSource::FileId(song.file_id.clone()),
            title: song.title.clone(),
            performer: song.artist.clone(),
            duration_secs: song.duration_secs,
            caption: None,
        };
        let label = track_label(&song.artist, &song.title);
        let songs = Arc::clone(&self.songs);
        let reporter = self.reporter.clone();
        let handle = status.clone();
        let target = request.target;

        let task = UploadTask::new(request.chat_id, audio, label)
            .with_cancel(cancel.clone())
            .with_status(status.clone(), request.target)
            .on_complete(move |result| {
                async move {
                    match result {
                        Ok(_) => {
                            if let Err(e) = songs.increment_send_count(&song.key).await {
                                warn!(error = %e, "Failed to bump send count");
                            }
                            if target == UploadTarget::SendNew {
                                reporter.clear(&handle).await;
                            }
                        }
                        Err(e) => reporter.show(&handle, &status::failed(&e)).await,
                    }
                }
                .boxed()
            });

        self.enqueue_upload(task)
    }

    fn on_fresh_upload(
        &self,
        key: SongKey,
        track: Track,
        handle: StatusHandle,
        target: UploadTarget,
    ) -> impl FnOnce(UploadResult) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync + 'static
    {
        let songs = Arc::clone(&self.songs);
        let reporter = self.reporter.clone();
        move |result| {
            async move {
                match result {
                    Ok(delivered) => {
                        if let Some(file_id) = delivered.file_id {
                            let song = CachedSong {
                                key,
                                file_id,
                                title: track.title,
                                artist: track.artist,
                                duration_secs: track.duration_secs,
                                send_count: 1,
                            };
                            if let Err(e) = songs.create(song).await {
                                warn!(error = %e, "Failed to cache delivered song");
                            }
                        }
                        if target == UploadTarget::SendNew {
                            reporter.clear(&handle).await;
                        }
                    }
                    Err(e) => reporter.show(&handle, &status::failed(&e)).await,
                }
            }
            .boxed()
        }
    }

    async fn acquire_with_status(
        &self,
        cancel: &CancellationToken,
        status: &StatusHandle,
    ) -> Result<AdmissionSlot, PipelineError> {
        let (tx, mut rx) = watch::channel(None::<usize>);
        let on_position: PositionCallback = Arc::new(move |ahead: usize| {
            tx.send_replace(Some(ahead));
        });

        let reporter = self.reporter.clone();
        let handle = status.clone();
        let updater = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let ahead = *rx.borrow_and_update();
                if let Some(ahead) = ahead {
                    reporter.show(&handle, &status::waiting_for_slot(ahead)).await;
                }
            }
        });

        let slot = self.acquire_download_slot(cancel, on_position).await;
        if let Err(e) = updater.await {
            debug!(error = %e, "Position updater ended abnormally");
        }
        slot
    }

    /// Wait for a download slot, reporting queue positions to `on_position`.
    ///
    /// # Errors
    ///
    /// Returns `Canceled` if `cancel` fires first.
    pub async fn acquire_download_slot(
        &self,
        cancel: &CancellationToken,
        on_position: PositionCallback,
    ) -> Result<AdmissionSlot, PipelineError> {
        self.admission.acquire(cancel, on_position).await
    }

    /// Queue a prepared item for delivery.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` immediately when the upload queue is saturated.
    pub fn enqueue_upload(&self, task: UploadTask) -> Result<UploadTicket, PipelineError> {
        self.uploads.submit(task)
    }

    /// Pagination and cross-reference stores
    #[must_use]
    pub const fn interaction_state(&self) -> &InteractionState {
        &self.state
    }

    /// The outbound rate governor
    #[must_use]
    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    /// The download admission controller
    #[must_use]
    pub const fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// The upload queue
    #[must_use]
    pub fn uploads(&self) -> &UploadQueue {
        &self.uploads
    }
}

async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(PipelineError::Canceled),
        result = fut => result,
    }
}
