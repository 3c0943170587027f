use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vidfetch_core::core::events::{JobPhase, ProgressEvent};
use vidfetch_core::core::update_throttle::UpdateThrottle;
use vidfetch_core::core::url_cleaner::{canonicalize, CanonicalUrl};
use vidfetch_core::models::{Artifact, DownloadJob, JobId, Settings};
use vidfetch_core::DownloadError;

use crate::core::extractor::{
    ExtractOutcome, ExtractRequest, Extractor, ExtractorEvent, RefreshOutcome,
};
use crate::core::file_store::FileStore;

const EVENT_BUFFER: usize = 64;
const PROGRESS_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_file_size: u64,
    pub job_timeout: Duration,
    pub update_timeout: Duration,
    pub max_concurrent: usize,
    pub max_url_length: usize,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_file_size: settings.download.max_file_size_bytes,
            job_timeout: settings.download_timeout(),
            update_timeout: settings.update_timeout(),
            max_concurrent: settings.download.max_concurrent,
            max_url_length: settings.download.max_url_length,
        }
    }
}

/// The caller's side of a running job. Dropping `events` cancels the job.
pub struct JobHandle {
    pub job_id: JobId,
    pub events: mpsc::Receiver<ProgressEvent>,
}

struct TrackedJob {
    job: DownloadJob,
    cancel: CancellationToken,
}

struct Inner {
    config: OrchestratorConfig,
    extractor: Arc<dyn Extractor>,
    throttle: Arc<UpdateThrottle>,
    store: FileStore,
    permits: Arc<Semaphore>,
    jobs: Mutex<HashMap<JobId, TrackedJob>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

pub struct ProgressThrottle {
    last_emit: Instant,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub fn new(min_interval_ms: u64) -> Self {
        let min_interval = Duration::from_millis(min_interval_ms);
        Self {
            last_emit: Instant::now()
                .checked_sub(min_interval)
                .unwrap_or_else(Instant::now),
            min_interval,
        }
    }

    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_emit) >= self.min_interval {
            self.last_emit = now;
            true
        } else {
            false
        }
    }
}

/// Writes one job's events. Keeps status events in phase order and makes
/// sure exactly one terminal event goes out.
struct JobSink {
    job_id: JobId,
    phase: JobPhase,
    tx: mpsc::Sender<ProgressEvent>,
    inner: Arc<Inner>,
}

impl JobSink {
    async fn status(&mut self, phase: JobPhase, message: impl Into<String>, percent: Option<f64>) {
        if phase.is_terminal() || !self.phase.can_advance_to(phase) {
            debug!("Job {} ignoring {:?} after {:?}", self.job_id, phase, self.phase);
            return;
        }

        if phase != self.phase {
            if let Some(tracked) = self.inner.jobs.lock().await.get_mut(&self.job_id) {
                tracked.job.advance(phase);
            }
            self.phase = phase;
        }

        let event = ProgressEvent::status(self.job_id, phase, message, percent);
        let _ = self.tx.send(event).await;
    }

    async fn finish(self, result: Result<Artifact, DownloadError>) {
        let event = match &result {
            Ok(artifact) => ProgressEvent::Complete {
                job_id: self.job_id,
                download_id: artifact.id,
                platform: artifact.platform,
                filename: artifact.filename.clone(),
                size_bytes: artifact.size_bytes,
                timestamp: Utc::now(),
            },
            Err(err) => ProgressEvent::failed(self.job_id, err),
        };

        match &result {
            Ok(artifact) => info!("Job {} complete: {}", self.job_id, artifact.id),
            Err(DownloadError::Cancelled) => info!("Job {} cancelled", self.job_id),
            Err(err) => warn!("Job {} failed: {}", self.job_id, err),
        }

        let finished = self.inner.jobs.lock().await.remove(&self.job_id);
        if let Some(TrackedJob { mut job, .. }) = finished {
            match &result {
                Ok(artifact) => {
                    job.advance(JobPhase::Complete);
                    job.artifact = Some(artifact.clone());
                }
                Err(err) => {
                    job.advance(JobPhase::Failed);
                    job.failure = Some(err.to_string());
                }
            }
            debug!(?job, "Job {} left the table", self.job_id);
        }

        if self.tx.send(event).await.is_err() {
            debug!("Job {} finished with no listener", self.job_id);
        }
    }
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        extractor: Arc<dyn Extractor>,
        throttle: Arc<UpdateThrottle>,
        store: FileStore,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                extractor,
                throttle,
                store,
                permits,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &FileStore {
        &self.inner.store
    }

    /// Canonicalizes `raw` and starts a job for it. Invalid input is
    /// rejected before any job exists.
    pub async fn submit(&self, raw: &str) -> Result<JobHandle, DownloadError> {
        let url = canonicalize(raw, self.inner.config.max_url_length)?;
        self.start(url).await
    }

    pub async fn start(&self, url: CanonicalUrl) -> Result<JobHandle, DownloadError> {
        let permit = self
            .inner
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| DownloadError::ServerBusy)?;

        let job = DownloadJob::new(url.clone());
        let job_id = job.id;
        let cancel = CancellationToken::new();

        self.inner.jobs.lock().await.insert(
            job_id,
            TrackedJob {
                job,
                cancel: cancel.clone(),
            },
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let sink = JobSink {
            job_id,
            phase: JobPhase::Validating,
            tx,
            inner: self.inner.clone(),
        };

        info!("Job {} started for {}", job_id, url);
        tokio::spawn(run_job(self.inner.clone(), sink, url, cancel, permit));

        Ok(JobHandle { job_id, events: rx })
    }

    pub async fn job(&self, id: JobId) -> Option<DownloadJob> {
        self.inner.jobs.lock().await.get(&id).map(|t| t.job.clone())
    }

    pub async fn cancel(&self, id: JobId) -> bool {
        match self.inner.jobs.lock().await.get(&id) {
            Some(tracked) => {
                tracked.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn active_jobs(&self) -> usize {
        self.inner.jobs.lock().await.len()
    }

    /// Runs an extractor refresh if the throttle window allows one. Never
    /// fails; problems are logged. Returns whether a refresh was attempted.
    pub async fn refresh_if_due(&self) -> bool {
        refresh_if_due(&self.inner).await
    }

    /// Starts [`refresh_if_due`](Self::refresh_if_due) in the background.
    pub fn spawn_refresh(&self) -> JoinHandle<bool> {
        let inner = self.inner.clone();
        tokio::spawn(async move { refresh_if_due(&inner).await })
    }
}

async fn refresh_if_due(inner: &Inner) -> bool {
    if !inner.throttle.should_refresh(Utc::now()).await {
        return false;
    }

    let name = inner.extractor.name().to_string();
    match tokio::time::timeout(inner.config.update_timeout, inner.extractor.refresh()).await {
        Ok(Ok(RefreshOutcome::Updated { version })) => {
            info!("{} updated to {}", name, version.as_deref().unwrap_or("latest"));
        }
        Ok(Ok(RefreshOutcome::UpToDate)) => info!("{} is up to date", name),
        Ok(Ok(RefreshOutcome::Completed)) => info!("{} update check completed", name),
        Ok(Err(e)) => warn!("{}", DownloadError::UpdateCheckFailed(e.to_string())),
        Err(_) => warn!(
            "{} update check timed out after {}s, continuing with current version",
            name,
            inner.config.update_timeout.as_secs()
        ),
    }

    inner.throttle.mark_refreshed(Utc::now()).await;
    true
}

async fn run_job(
    inner: Arc<Inner>,
    mut sink: JobSink,
    url: CanonicalUrl,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let staging = inner.store.staging_dir().join(sink.job_id.to_string());
    let watcher = sink.tx.clone();
    let job_timeout = inner.config.job_timeout;

    sink.status(JobPhase::Validating, JobPhase::Validating.default_message(), None)
        .await;

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        _ = watcher.closed() => Err(DownloadError::Cancelled),
        outcome = tokio::time::timeout(job_timeout, execute(&inner, &mut sink, &url, &staging)) => {
            outcome.unwrap_or(Err(DownloadError::Timeout {
                seconds: job_timeout.as_secs(),
            }))
        }
    };
    drop(watcher);

    match tokio::fs::remove_dir_all(&staging).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove staging dir {}: {}", staging.display(), e),
    }

    sink.finish(result).await;
}

async fn execute(
    inner: &Inner,
    sink: &mut JobSink,
    url: &CanonicalUrl,
    staging: &Path,
) -> Result<Artifact, DownloadError> {
    let max_size = inner.config.max_file_size;

    sink.status(
        JobPhase::CheckingUpdate,
        JobPhase::CheckingUpdate.default_message(),
        None,
    )
    .await;
    refresh_if_due(inner).await;

    sink.status(
        JobPhase::Downloading,
        format!("Connecting to {}...", url.platform().name()),
        None,
    )
    .await;

    tokio::fs::create_dir_all(staging).await.map_err(|e| {
        error!("Cannot create staging dir {}: {}", staging.display(), e);
        DownloadError::Internal
    })?;

    let request = ExtractRequest {
        url: url.clone(),
        output_dir: staging.to_path_buf(),
        max_file_size: max_size,
    };

    let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
    let extract = inner.extractor.extract(&request, event_tx);
    tokio::pin!(extract);

    let mut throttle = ProgressThrottle::new(PROGRESS_INTERVAL_MS);

    let outcome = loop {
        tokio::select! {
            biased;
            Some(event) = event_rx.recv() => {
                forward_event(sink, &mut throttle, event, max_size).await?;
            }
            outcome = &mut extract => break outcome,
        }
    };

    while let Ok(event) = event_rx.try_recv() {
        forward_event(sink, &mut throttle, event, max_size).await?;
    }

    let (output, title) = match outcome {
        Ok(ExtractOutcome::Finished { output, title }) => (output, title),
        Ok(ExtractOutcome::Failed { reason }) => {
            return Err(DownloadError::ExtractionFailed(reason));
        }
        Err(e) => {
            error!("{} failed for {}: {:#}", inner.extractor.name(), url, e);
            return Err(DownloadError::ExtractionFailed("Download failed".to_string()));
        }
    };

    let size = tokio::fs::metadata(&output)
        .await
        .map(|m| m.len())
        .map_err(|e| {
            error!("Extractor output {} unreadable: {}", output.display(), e);
            DownloadError::Internal
        })?;
    if size > max_size {
        warn!("Output {} is {} bytes, over the limit", output.display(), size);
        return Err(DownloadError::file_too_large(max_size));
    }

    inner
        .store
        .register(&output, url.platform(), &display_name(&title, &output))
        .await
}

async fn forward_event(
    sink: &mut JobSink,
    throttle: &mut ProgressThrottle,
    event: ExtractorEvent,
    max_size: u64,
) -> Result<(), DownloadError> {
    match event {
        ExtractorEvent::MaxFilesizeExceeded => Err(DownloadError::file_too_large(max_size)),
        ExtractorEvent::Downloading { total_bytes: Some(total), .. } if total > max_size => {
            warn!("Job {} reports {} bytes, over the limit", sink.job_id, total);
            Err(DownloadError::file_too_large(max_size))
        }
        ExtractorEvent::Downloading { percent, .. } => {
            let done = percent.is_some_and(|p| p >= 100.0);
            if sink.phase != JobPhase::Downloading || done || throttle.should_emit() {
                let message = match percent {
                    Some(p) => format!("Downloading video... {:.1}%", p),
                    None => JobPhase::Downloading.default_message().to_string(),
                };
                sink.status(JobPhase::Downloading, message, percent).await;
            }
            Ok(())
        }
        ExtractorEvent::Merging => {
            sink.status(JobPhase::Merging, JobPhase::Merging.default_message(), None)
                .await;
            Ok(())
        }
        ExtractorEvent::Converting => {
            sink.status(
                JobPhase::Converting,
                JobPhase::Converting.default_message(),
                None,
            )
            .await;
            Ok(())
        }
        ExtractorEvent::Error { message } => {
            warn!("Job {} extractor error: {}", sink.job_id, message);
            Ok(())
        }
    }
}

fn display_name(title: &str, output: &Path) -> String {
    let ext = output
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp4");
    format!("{}.{}", title, ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeDelta;
    use vidfetch_core::error::ErrorKind;
    use vidfetch_core::ValidationError;

    use crate::core::file_store::StoreConfig;

    const MB: u64 = 1024 * 1024;

    #[derive(Clone)]
    enum Script {
        Produce {
            events: Vec<ExtractorEvent>,
            name: &'static str,
            bytes: usize,
        },
        Fail(&'static str),
        Hang,
    }

    enum RefreshScript {
        Ok,
        Err,
        Hang,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct FakeExtractor {
        script: Script,
        refresh: RefreshScript,
        refreshes: AtomicUsize,
        extracts: AtomicUsize,
        dropped: Arc<AtomicBool>,
    }

    impl FakeExtractor {
        fn new(script: Script) -> Self {
            Self {
                script,
                refresh: RefreshScript::Ok,
                refreshes: AtomicUsize::new(0),
                extracts: AtomicUsize::new(0),
                dropped: Arc::new(AtomicBool::new(false)),
            }
        }

        fn with_refresh(mut self, refresh: RefreshScript) -> Self {
            self.refresh = refresh;
            self
        }
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        fn name(&self) -> &str {
            "fake"
        }

        async fn refresh(&self) -> anyhow::Result<RefreshOutcome> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            match self.refresh {
                RefreshScript::Ok => Ok(RefreshOutcome::UpToDate),
                RefreshScript::Err => Err(anyhow::anyhow!("network unreachable")),
                RefreshScript::Hang => std::future::pending().await,
            }
        }

        async fn extract(
            &self,
            request: &ExtractRequest,
            events: mpsc::Sender<ExtractorEvent>,
        ) -> anyhow::Result<ExtractOutcome> {
            self.extracts.fetch_add(1, Ordering::SeqCst);
            match self.script.clone() {
                Script::Produce { events: script, name, bytes } => {
                    for event in script {
                        let _ = events.send(event).await;
                    }
                    let output = request.output_dir.join(name);
                    tokio::fs::write(&output, vec![0u8; bytes]).await?;
                    Ok(ExtractOutcome::Finished {
                        output,
                        title: name.trim_end_matches(".mp4").replace('_', " "),
                    })
                }
                Script::Fail(reason) => Ok(ExtractOutcome::Failed {
                    reason: reason.to_string(),
                }),
                Script::Hang => {
                    let _flag = DropFlag(self.dropped.clone());
                    let _ = events
                        .send(ExtractorEvent::Downloading {
                            percent: Some(0.0),
                            total_bytes: None,
                        })
                        .await;
                    std::future::pending().await
                }
            }
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        extractor: Arc<FakeExtractor>,
        throttle: Arc<UpdateThrottle>,
        _dir: tempfile::TempDir,
    }

    async fn harness(extractor: FakeExtractor, tweak: impl FnOnce(&mut OrchestratorConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(StoreConfig {
            root: dir.path().join("downloads"),
            max_age: Duration::from_secs(3600),
            grace: Duration::from_secs(60),
            max_file_size: MB,
        })
        .await
        .unwrap();

        let mut config = OrchestratorConfig {
            max_file_size: MB,
            job_timeout: Duration::from_secs(5),
            update_timeout: Duration::from_secs(1),
            max_concurrent: 4,
            max_url_length: 2000,
        };
        tweak(&mut config);

        let extractor = Arc::new(extractor);
        let throttle = Arc::new(UpdateThrottle::new(Duration::from_secs(600)));
        let orchestrator = Orchestrator::new(config, extractor.clone(), throttle.clone(), store);
        Harness {
            orchestrator,
            extractor,
            throttle,
            _dir: dir,
        }
    }

    fn produce(events: Vec<ExtractorEvent>, bytes: usize) -> Script {
        Script::Produce {
            events,
            name: "My_Clip.mp4",
            bytes,
        }
    }

    fn pct(p: f64) -> ExtractorEvent {
        ExtractorEvent::Downloading {
            percent: Some(p),
            total_bytes: None,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("job stalled")
        {
            events.push(event);
        }
        events
    }

    async fn run(h: &Harness, raw: &str) -> Vec<ProgressEvent> {
        let handle = h.orchestrator.submit(raw).await.unwrap();
        collect(handle.events).await
    }

    fn phases(events: &[ProgressEvent]) -> Vec<JobPhase> {
        let mut out: Vec<JobPhase> = Vec::new();
        for event in events {
            if let ProgressEvent::Status { phase, .. } = event {
                if out.last() != Some(phase) {
                    out.push(*phase);
                }
            }
        }
        out
    }

    fn error_kind(events: &[ProgressEvent]) -> Option<ErrorKind> {
        match events.last() {
            Some(ProgressEvent::Error { kind, .. }) => Some(*kind),
            _ => None,
        }
    }

    fn assert_single_terminal(events: &[ProgressEvent]) {
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert!(events.last().is_some_and(ProgressEvent::is_terminal));
    }

    async fn stored_files(h: &Harness) -> usize {
        let mut entries = tokio::fs::read_dir(h.orchestrator.store().root()).await.unwrap();
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_type().await.unwrap().is_file() {
                count += 1;
            }
        }
        count
    }

    async fn wait_idle(h: &Harness) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.orchestrator.active_jobs().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job never left the table");
    }

    async fn wait_for_download(rx: &mut mpsc::Receiver<ProgressEvent>) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let ProgressEvent::Status { percent: Some(_), .. } = event {
                return;
            }
        }
    }

    #[tokio::test]
    async fn happy_path_runs_phases_in_order() {
        let h = harness(
            FakeExtractor::new(produce(
                vec![
                    ExtractorEvent::Downloading {
                        percent: Some(10.0),
                        total_bytes: Some(4096),
                    },
                    pct(100.0),
                    ExtractorEvent::Merging,
                ],
                2048,
            )),
            |_| {},
        )
        .await;

        let events = run(&h, "https://youtu.be/abc123def45").await;

        assert_eq!(
            phases(&events),
            vec![
                JobPhase::Validating,
                JobPhase::CheckingUpdate,
                JobPhase::Downloading,
                JobPhase::Merging,
            ]
        );
        assert_single_terminal(&events);
        let Some(ProgressEvent::Complete { download_id, filename, size_bytes, .. }) = events.last() else {
            panic!("expected complete, got {:?}", events.last());
        };
        assert_eq!(filename, "My Clip.mp4");
        assert_eq!(*size_bytes, 2048);
        assert!(h.orchestrator.store().get(*download_id).await.is_some());
        assert_eq!(h.orchestrator.active_jobs().await, 0);
        assert_eq!(h.extractor.refreshes.load(Ordering::SeqCst), 1);

        let job_id = events[0].job_id();
        assert!(!h.orchestrator.store().staging_dir().join(job_id.to_string()).exists());
    }

    #[tokio::test]
    async fn refresh_runs_once_per_window() {
        let h = harness(FakeExtractor::new(produce(vec![], 16)), |_| {}).await;

        run(&h, "https://youtu.be/firstvideo1").await;
        run(&h, "https://youtu.be/secondvideo").await;

        assert_eq!(h.extractor.refreshes.load(Ordering::SeqCst), 1);
        assert!(!h.orchestrator.refresh_if_due().await);
    }

    #[tokio::test]
    async fn extractor_failure_is_reported() {
        let h = harness(
            FakeExtractor::new(Script::Fail("Download failed: Video is unavailable")),
            |_| {},
        )
        .await;

        let events = run(&h, "https://www.instagram.com/reel/xyz/").await;

        assert_single_terminal(&events);
        match events.last() {
            Some(ProgressEvent::Error { kind, error, .. }) => {
                assert_eq!(*kind, ErrorKind::ExtractionFailed);
                assert_eq!(error, "Download failed: Video is unavailable");
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn reported_size_over_limit_aborts() {
        let h = harness(
            FakeExtractor::new(produce(
                vec![ExtractorEvent::Downloading {
                    percent: Some(1.0),
                    total_bytes: Some(10 * MB),
                }],
                16,
            )),
            |_| {},
        )
        .await;

        let events = run(&h, "https://youtu.be/bigvideo123").await;

        assert_eq!(error_kind(&events), Some(ErrorKind::FileTooLarge));
        assert_eq!(h.orchestrator.store().len().await, 0);
        assert_eq!(stored_files(&h).await, 0);
    }

    #[tokio::test]
    async fn oversized_output_leaves_nothing_behind() {
        let h = harness(
            FakeExtractor::new(produce(vec![pct(100.0)], (2 * MB) as usize)),
            |_| {},
        )
        .await;

        let events = run(&h, "https://youtu.be/bigvideo123").await;

        assert_eq!(error_kind(&events), Some(ErrorKind::FileTooLarge));
        assert_eq!(h.orchestrator.store().len().await, 0);
        assert_eq!(stored_files(&h).await, 0);
        let job_id = events[0].job_id();
        assert!(!h.orchestrator.store().staging_dir().join(job_id.to_string()).exists());
    }

    #[tokio::test]
    async fn empty_output_is_not_registered() {
        let h = harness(FakeExtractor::new(produce(vec![pct(100.0)], 0)), |_| {}).await;

        let events = run(&h, "https://youtu.be/abcdefghijk").await;

        assert_single_terminal(&events);
        match events.last() {
            Some(ProgressEvent::Error { kind, error, .. }) => {
                assert_eq!(*kind, ErrorKind::ExtractionFailed);
                assert_eq!(error, "Downloaded file is empty");
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(h.orchestrator.store().len().await, 0);
        assert_eq!(stored_files(&h).await, 0);
    }

    #[tokio::test]
    async fn extractor_error_lines_stay_out_of_events() {
        let h = harness(
            FakeExtractor::new(produce(
                vec![
                    ExtractorEvent::Error {
                        message: "unable to write /srv/secret/path".to_string(),
                    },
                    pct(100.0),
                ],
                16,
            )),
            |_| {},
        )
        .await;

        let events = run(&h, "https://youtu.be/abcdefghijk").await;

        assert!(matches!(events.last(), Some(ProgressEvent::Complete { .. })));
        let text = serde_json::to_string(&events).unwrap();
        assert!(!text.contains("/srv/secret"));
    }

    #[tokio::test]
    async fn max_filesize_notice_fails_job() {
        let h = harness(
            FakeExtractor::new(produce(vec![ExtractorEvent::MaxFilesizeExceeded], 0)),
            |_| {},
        )
        .await;

        let events = run(&h, "https://youtu.be/bigvideo123").await;
        assert_eq!(error_kind(&events), Some(ErrorKind::FileTooLarge));
        assert_eq!(h.orchestrator.store().len().await, 0);
    }

    #[tokio::test]
    async fn timeout_stops_extractor() {
        let h = harness(FakeExtractor::new(Script::Hang), |c| {
            c.job_timeout = Duration::from_millis(200);
        })
        .await;

        let events = run(&h, "https://x.com/user/status/123").await;

        assert_single_terminal(&events);
        assert_eq!(error_kind(&events), Some(ErrorKind::Timeout));
        assert!(h.extractor.dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rejects_jobs_over_ceiling() {
        let h = harness(FakeExtractor::new(Script::Hang), |c| c.max_concurrent = 1).await;

        let first = h.orchestrator.submit("https://youtu.be/firstvideo1").await.unwrap();
        let second = h.orchestrator.submit("https://youtu.be/secondvideo").await;
        assert!(matches!(second.err(), Some(DownloadError::ServerBusy)));

        assert!(h.orchestrator.cancel(first.job_id).await);
        let events = collect(first.events).await;
        assert_eq!(error_kind(&events), Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn dropping_receiver_cancels_job() {
        let h = harness(FakeExtractor::new(Script::Hang), |_| {}).await;

        let mut handle = h.orchestrator.submit("https://youtu.be/abcdefghijk").await.unwrap();
        wait_for_download(&mut handle.events).await;
        assert_eq!(
            h.orchestrator.job(handle.job_id).await.map(|j| j.phase),
            Some(JobPhase::Downloading)
        );
        drop(handle);

        wait_idle(&h).await;
        assert!(h.extractor.dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn late_download_progress_is_suppressed() {
        let h = harness(
            FakeExtractor::new(produce(
                vec![
                    pct(100.0),
                    ExtractorEvent::Merging,
                    pct(50.0),
                    ExtractorEvent::Converting,
                ],
                16,
            )),
            |_| {},
        )
        .await;

        let events = run(&h, "https://youtu.be/abcdefghijk").await;

        assert_eq!(
            phases(&events),
            vec![
                JobPhase::Validating,
                JobPhase::CheckingUpdate,
                JobPhase::Downloading,
                JobPhase::Merging,
                JobPhase::Converting,
            ]
        );
        assert!(matches!(events.last(), Some(ProgressEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn invalid_url_never_starts_a_job() {
        let h = harness(FakeExtractor::new(produce(vec![], 16)), |_| {}).await;

        let result = h
            .orchestrator
            .submit("https://evil.example.com/watch?v=x")
            .await;

        assert!(matches!(
            result.err(),
            Some(DownloadError::Validation(ValidationError::UnsupportedHost))
        ));
        assert_eq!(h.orchestrator.active_jobs().await, 0);
        assert_eq!(h.extractor.extracts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_refresh_does_not_fail_job() {
        let h = harness(
            FakeExtractor::new(produce(vec![], 16)).with_refresh(RefreshScript::Err),
            |_| {},
        )
        .await;

        let events = run(&h, "https://youtu.be/abcdefghijk").await;
        assert!(matches!(events.last(), Some(ProgressEvent::Complete { .. })));
        assert!(h.throttle.snapshot().await.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn hung_refresh_is_bounded() {
        let h = harness(
            FakeExtractor::new(produce(vec![], 16)).with_refresh(RefreshScript::Hang),
            |c| c.update_timeout = Duration::from_millis(100),
        )
        .await;

        let events = run(&h, "https://youtu.be/abcdefghijk").await;
        assert!(matches!(events.last(), Some(ProgressEvent::Complete { .. })));
        assert_eq!(h.extractor.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn background_refresh_does_not_hold_up_jobs() {
        let h = harness(
            FakeExtractor::new(produce(vec![], 16)).with_refresh(RefreshScript::Hang),
            |c| c.update_timeout = Duration::from_secs(1),
        )
        .await;

        let refresh = h.orchestrator.spawn_refresh();
        while h.extractor.refreshes.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let events = run(&h, "https://youtu.be/abcdefghijk").await;
        assert!(matches!(events.last(), Some(ProgressEvent::Complete { .. })));
        assert!(!refresh.is_finished());

        assert!(refresh.await.unwrap());
        assert_eq!(h.extractor.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn youtube_link_downloads_and_expires_after_first_read() {
        let h = harness(
            FakeExtractor::new(produce(vec![pct(100.0), ExtractorEvent::Merging], 64)),
            |_| {},
        )
        .await;

        let url = canonicalize("https://www.youtube.com/watch?v=abc123def45&list=xyz", 2000).unwrap();
        assert_eq!(url.as_str(), "https://www.youtube.com/watch?v=abc123def45");

        let handle = h.orchestrator.start(url).await.unwrap();
        let events = collect(handle.events).await;

        let observed = phases(&events);
        assert!(observed.ends_with(&[JobPhase::Downloading, JobPhase::Merging]));
        let Some(ProgressEvent::Complete { download_id, .. }) = events.last() else {
            panic!("expected complete, got {:?}", events.last());
        };

        let store = h.orchestrator.store();
        let first_read = Utc::now();
        let reader = store.open_for_read_at(*download_id, first_read).await.unwrap();
        assert_eq!(reader.artifact.size_bytes, 64);

        let later = first_read + TimeDelta::seconds(61);
        let err = store.open_for_read_at(*download_id, later).await.err();
        assert!(matches!(err, Some(DownloadError::NotFound)));
    }
}
