//! Download Manager
//!
//! Runs one supervised downloader process per request: relays its output as events,
//! enforces the stall timeout, records completed downloads and handles cancellation.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SupervisorConfig;
use crate::db::{DownloadRecord, DownloadStore};
use crate::errors::{Result, SupervisorError};
use crate::events::{emit_event, SupervisorEvent};
use crate::interpreter::{OutputEvent, OutputInterpreter};
use crate::metadata::{MetadataFetcher, TrackMetadata};
use crate::process::{self, ProcessOptions};
use crate::services::{ServiceProfile, ServiceRegistry};
use crate::settings::SettingsProvider;
use crate::url_utils;
use crate::watchdog::StallWatchdog;

/// Size of one stderr read. Each read is classified on its own.
const STDERR_CHUNK_SIZE: usize = 4096;

/// How long output still buffered in the pipes may keep arriving after the downloader exits.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// A request to download one URL from one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Service key, e.g. `qobuz`.
    pub service: String,
    pub url: String,
    /// Passed to the downloader verbatim.
    pub quality: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Finalizing,
    Completed,
    Failed,
}

/// One in-flight download, owned by its task.
#[derive(Debug)]
struct DownloadSession {
    order: u64,
    service: &'static str,
    track_id: Option<String>,
    download_location: Option<PathBuf>,
    state: SessionState,
}

impl DownloadSession {
    fn new(order: u64, service: &'static str) -> Self {
        Self {
            order,
            service,
            track_id: None,
            download_location: None,
            state: SessionState::Starting,
        }
    }

    fn transition(&mut self, next: SessionState) {
        log::info!(
            "Download {} ({}): {:?} -> {:?}",
            self.order,
            self.service,
            self.state,
            next
        );
        self.state = next;
    }
}

/// Collaborators handed to every session task.
#[derive(Clone)]
struct SessionContext {
    config: Arc<SupervisorConfig>,
    fetcher: MetadataFetcher,
    process_options: ProcessOptions,
    settings: Arc<dyn SettingsProvider>,
    store: Arc<dyn DownloadStore>,
    event_tx: mpsc::Sender<SupervisorEvent>,
}

/// Download manager that handles execution and lifecycle.
pub struct DownloadManager {
    registry: Arc<ServiceRegistry>,
    ctx: SessionContext,
    next_order: AtomicU64,
    active_downloads: Arc<RwLock<HashMap<u64, broadcast::Sender<()>>>>,
}

impl DownloadManager {
    pub fn new(
        config: Arc<SupervisorConfig>,
        registry: Arc<ServiceRegistry>,
        settings: Arc<dyn SettingsProvider>,
        store: Arc<dyn DownloadStore>,
        event_tx: mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        let process_options = ProcessOptions::from_config(&config);
        let fetcher = MetadataFetcher::new(config.clone());
        Self {
            registry,
            ctx: SessionContext {
                config,
                fetcher,
                process_options,
                settings,
                store,
                event_tx,
            },
            next_order: AtomicU64::new(1),
            active_downloads: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Override how the downloader and the metadata scripts are launched.
    pub fn with_process_options(mut self, options: ProcessOptions) -> Self {
        self.ctx.fetcher = self.ctx.fetcher.with_options(options.clone());
        self.ctx.process_options = options;
        self
    }

    /// Start a download session and return its order number.
    ///
    /// An unknown service is rejected before an order is allocated or any event is
    /// sent. Everything after that is reported through the event channel by the
    /// session task: `download-info` first, ending with exactly one
    /// `download-complete` or `download-error`. Never waits on the event channel.
    pub async fn start(&self, request: DownloadRequest) -> Result<u64> {
        let profile = self.registry.profile_for(&request.service)?.clone();
        let order = self.next_order.fetch_add(1, Ordering::SeqCst);

        log::info!(
            "Starting download {}: {} {} (quality {})",
            order,
            profile.key(),
            request.url,
            request.quality
        );

        // Register before the task exists so a cancel is never lost.
        let (cancel_tx, _) = broadcast::channel::<()>(1);
        let cancel_rx = cancel_tx.subscribe();
        self.active_downloads.write().await.insert(order, cancel_tx);

        let session = DownloadSession::new(order, profile.key());
        let ctx = self.ctx.clone();
        let active_downloads = self.active_downloads.clone();

        tokio::spawn(async move {
            run_session(session, profile, request, ctx, cancel_rx, active_downloads).await;
        });

        Ok(order)
    }

    /// Start one session per URL found in `text`. Duplicates are dropped.
    pub async fn start_batch(&self, service: &str, quality: &str, text: &str) -> Result<Vec<u64>> {
        // Fail fast on the service before any session starts.
        self.registry.profile_for(service)?;

        let urls = url_utils::extract_urls(text);
        if urls.is_empty() {
            log::warn!("No URLs found in input");
        }

        let mut orders = Vec::with_capacity(urls.len());
        for url in urls {
            let order = self
                .start(DownloadRequest {
                    service: service.to_string(),
                    url,
                    quality: quality.to_string(),
                })
                .await?;
            orders.push(order);
        }
        Ok(orders)
    }

    /// Cancel a running session. Returns `false` if it is not active.
    pub async fn cancel(&self, order: u64) -> bool {
        match self.active_downloads.read().await.get(&order) {
            Some(cancel_tx) => {
                let _ = cancel_tx.send(());
                log::info!("Sent cancel signal to download {}", order);
                true
            }
            None => false,
        }
    }

    /// Check if a download is currently active.
    pub async fn is_active(&self, order: u64) -> bool {
        self.active_downloads.read().await.contains_key(&order)
    }

    /// Get count of active downloads.
    pub async fn active_count(&self) -> usize {
        self.active_downloads.read().await.len()
    }

    /// Cancel every active session.
    pub async fn shutdown(&self) {
        let orders: Vec<u64> = self.active_downloads.read().await.keys().copied().collect();
        for order in orders {
            self.cancel(order).await;
        }
    }
}

/// Drive one session to its terminal event.
async fn run_session(
    mut session: DownloadSession,
    profile: ServiceProfile,
    request: DownloadRequest,
    ctx: SessionContext,
    cancel_rx: broadcast::Receiver<()>,
    active_downloads: Arc<RwLock<HashMap<u64, broadcast::Sender<()>>>>,
) {
    // Sent from the task so `start` never waits on a full event channel.
    emit_event(
        &ctx.event_tx,
        SupervisorEvent::DownloadInfo {
            title: format!("{} Download", profile.display_name()),
            order: session.order,
        },
    )
    .await;

    let mut result = execute_download(&mut session, &profile, &request, &ctx, cancel_rx).await;

    if result.is_ok() {
        session.transition(SessionState::Finalizing);
        result = finalize_download(&mut session, &profile, &ctx).await;
    }

    active_downloads.write().await.remove(&session.order);

    match result {
        Ok(()) => {
            session.transition(SessionState::Completed);
            emit_event(
                &ctx.event_tx,
                SupervisorEvent::DownloadComplete {
                    order: session.order,
                },
            )
            .await;
        }
        Err(e) => {
            log::error!("Download {} failed: {}", session.order, e);
            session.transition(SessionState::Failed);
            emit_event(
                &ctx.event_tx,
                SupervisorEvent::DownloadError {
                    order: session.order,
                    message: e.to_string(),
                },
            )
            .await;
        }
    }
}

/// One read from the downloader's pipes.
#[derive(Debug)]
enum StreamOutput {
    /// A stdout line without its terminator.
    Line(String),
    /// One stderr read.
    Stderr(String),
}

/// Pipe reader tasks of one child, aborted when the session is done with them.
///
/// A grandchild that inherited the pipes can keep them open long after the downloader
/// exits; the readers must not outlive the session because of it.
struct OutputReaders {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for OutputReaders {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Read stdout line by line. Lines are split on raw bytes and decoded lossily, so a
/// stray non-UTF-8 byte costs one garbled line instead of the rest of the stream.
fn spawn_stdout_reader(
    order: u64,
    stdout: ChildStdout,
    tx: mpsc::UnboundedSender<StreamOutput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
                    if tx.send(StreamOutput::Line(line.to_string())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Error reading stdout of download {}: {}", order, e);
                    break;
                }
            }
        }
    })
}

fn spawn_stderr_reader(
    order: u64,
    mut stderr: ChildStderr,
    tx: mpsc::UnboundedSender<StreamOutput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; STDERR_CHUNK_SIZE];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                    if tx.send(StreamOutput::Stderr(chunk)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Error reading stderr of download {}: {}", order, e);
                    break;
                }
            }
        }
    })
}

type PendingFetch<'a> = Pin<Box<dyn Future<Output = Result<TrackMetadata>> + Send + 'a>>;

/// Resolves with the in-flight fetch, or never when there is none.
async fn next_fetch_result(fetch: &mut Option<PendingFetch<'_>>) -> Result<TrackMetadata> {
    match fetch.as_mut() {
        Some(pending) => pending.await,
        None => std::future::pending().await,
    }
}

/// Run the downloader until it exits, is cancelled or stalls.
///
/// Output is relayed in the order it was produced. While a metadata fetch is in
/// flight, later output is queued behind it; cancellation, the stall deadline and
/// the readers keep running.
async fn execute_download(
    session: &mut DownloadSession,
    profile: &ServiceProfile,
    request: &DownloadRequest,
    ctx: &SessionContext,
    mut cancel_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let args = vec![
        "-q".to_string(),
        request.quality.clone(),
        "url".to_string(),
        request.url.clone(),
    ];

    let mut watchdog = StallWatchdog::new(ctx.config.stall_timeout());
    watchdog.arm();

    let mut child = match process::spawn(&ctx.config.downloader, &args, &ctx.process_options) {
        Ok(child) => child,
        Err(e) => {
            watchdog.disarm();
            return Err(e);
        }
    };
    session.transition(SessionState::Running);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SupervisorError::SpawnFailed("Failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SupervisorError::SpawnFailed("Failed to capture stderr".to_string()))?;

    let (output_tx, mut output_rx) = mpsc::unbounded_channel();
    let _readers = OutputReaders {
        handles: vec![
            spawn_stdout_reader(session.order, stdout, output_tx.clone()),
            spawn_stderr_reader(session.order, stderr, output_tx),
        ],
    };

    let interpreter = OutputInterpreter::new(profile, &ctx.config.error_dictionary);
    let fetcher = &ctx.fetcher;

    let mut backlog: VecDeque<OutputEvent> = VecDeque::new();
    let mut fetch: Option<PendingFetch<'_>> = None;
    let mut exit_status: Option<ExitStatus> = None;
    let mut drain_deadline: Option<Instant> = None;
    let mut output_open = true;
    let mut cancel_closed = false;

    loop {
        while fetch.is_none() {
            match backlog.pop_front() {
                Some(OutputEvent::TrackIdentified(track_id)) => {
                    log::info!(
                        "Download {} fetching details for track {}",
                        session.order,
                        track_id
                    );
                    let service = profile.key();
                    fetch = Some(Box::pin(async move {
                        fetcher.fetch(service, &track_id).await
                    }));
                }
                Some(event) => relay_output_event(event, session.order, ctx).await,
                None => break,
            }
        }

        if let Some(status) = exit_status {
            if fetch.is_none() && !output_open {
                log::info!(
                    "Download {} process closed with code {:?}",
                    session.order,
                    status.code()
                );
                if !status.success() {
                    return Err(SupervisorError::ProcessExitedNonZero(status.code()));
                }
                return Ok(());
            }
        }

        // Biased: buffered output is taken before an expired deadline is honored.
        tokio::select! {
            biased;

            signal = cancel_rx.recv(), if !cancel_closed => match signal {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    log::info!("Download {} received cancel signal", session.order);
                    watchdog.disarm();
                    if let Err(e) = child.kill().await {
                        log::warn!("Failed to kill download {}: {}", session.order, e);
                    }
                    return Err(SupervisorError::Cancelled);
                }
                Err(broadcast::error::RecvError::Closed) => cancel_closed = true,
            },
            result = next_fetch_result(&mut fetch), if fetch.is_some() => {
                fetch = None;
                relay_fetch_result(result, session.order, profile, ctx).await;
            }
            output = output_rx.recv(), if output_open => match output {
                Some(StreamOutput::Line(line)) => {
                    watchdog.reset();
                    log::debug!("Download {} stdout: {}", session.order, line);
                    for event in interpreter.classify_line(&line, session.track_id.as_deref()) {
                        match event {
                            OutputEvent::Unclassified => {}
                            OutputEvent::TrackIdentified(ref track_id) => {
                                log::info!("Download {} detected track {}", session.order, track_id);
                                session.track_id = Some(track_id.clone());
                                backlog.push_back(event);
                            }
                            _ => backlog.push_back(event),
                        }
                    }
                }
                Some(StreamOutput::Stderr(chunk)) => {
                    watchdog.reset();
                    log::warn!("Download {} stderr: {}", session.order, chunk.trim_end());
                    backlog.push_back(interpreter.classify_stderr(&chunk));
                }
                None => output_open = false,
            },
            status = child.wait(), if exit_status.is_none() => {
                watchdog.disarm();
                exit_status = Some(status?);
                drain_deadline = Some(Instant::now() + EXIT_DRAIN_GRACE);
            }
            _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                if output_open && drain_deadline.is_some() =>
            {
                log::warn!(
                    "Download {} exited but its output is still held open, not waiting for it",
                    session.order
                );
                output_open = false;
            }
            _ = watchdog.expired() => {
                if watchdog.try_fire() {
                    log::error!(
                        "Download {} produced no output for {:?}, assuming it waits for credentials",
                        session.order,
                        watchdog.timeout()
                    );
                    if let Err(e) = child.kill().await {
                        log::warn!("Failed to kill download {}: {}", session.order, e);
                    }
                    return Err(SupervisorError::CredentialTimeout);
                }
            }
        }
    }
}

/// Turn one classified unit of output into caller events.
async fn relay_output_event(event: OutputEvent, order: u64, ctx: &SessionContext) {
    match event {
        OutputEvent::ProgressUpdate(progress) => {
            emit_event(
                &ctx.event_tx,
                SupervisorEvent::DownloadUpdate { progress, order },
            )
            .await;
        }
        OutputEvent::ErrorDetected(message) => {
            log::warn!("Download {} reported: {}", order, message);
            emit_event(
                &ctx.event_tx,
                SupervisorEvent::RuntimeError { order, message },
            )
            .await;
        }
        OutputEvent::TrackIdentified(_) | OutputEvent::Unclassified => {}
    }
}

async fn relay_fetch_result(
    result: Result<TrackMetadata>,
    order: u64,
    profile: &ServiceProfile,
    ctx: &SessionContext,
) {
    match result {
        Ok(details) => {
            emit_event(
                &ctx.event_tx,
                SupervisorEvent::Details {
                    channel: profile.details_channel().to_string(),
                    order,
                    payload: profile.to_details_event(details.as_value(), order),
                },
            )
            .await;
        }
        Err(e) => {
            log::error!("Download {}: {}", order, e.details_message());
            emit_event(
                &ctx.event_tx,
                SupervisorEvent::RuntimeError {
                    order,
                    message: e.details_message(),
                },
            )
            .await;
        }
    }
}

/// Resolve the download location and record the finished track.
///
/// Only a settings failure fails the session. Metadata and persistence problems are
/// logged, since the file itself was downloaded.
async fn finalize_download(
    session: &mut DownloadSession,
    profile: &ServiceProfile,
    ctx: &SessionContext,
) -> Result<()> {
    let location = ctx
        .settings
        .download_location()
        .map_err(|e| SupervisorError::FinalizeFailed(format!("{:#}", e)))?;
    session.download_location = Some(location);

    let (track_id, location) = match (&session.track_id, &session.download_location) {
        (Some(track_id), Some(location)) => (track_id.as_str(), location.as_path()),
        _ => {
            log::info!(
                "Download {} finished without a track id, nothing to record",
                session.order
            );
            return Ok(());
        }
    };

    match save_completed_download(profile, ctx, track_id, location).await {
        Ok(id) => log::info!(
            "Download {} recorded as row {} in {}",
            session.order,
            id,
            location.display()
        ),
        Err(e) => log::error!("Error saving download info for {}: {}", session.order, e),
    }
    Ok(())
}

/// Metadata is fetched again rather than reused from the stream, so the stored record
/// reflects what the script reports at completion.
async fn save_completed_download(
    profile: &ServiceProfile,
    ctx: &SessionContext,
    track_id: &str,
    location: &Path,
) -> Result<i64> {
    let details = ctx.fetcher.fetch(profile.key(), track_id).await?;
    let info = profile.to_download_info(details.as_value())?;
    let record = DownloadRecord::new(info, location, profile.key());

    ctx.store
        .save_download(&record)
        .await
        .map_err(|e| SupervisorError::PersistenceFailed(format!("{:#}", e)))
}
