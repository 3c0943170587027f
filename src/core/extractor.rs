use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;
use vidfetch_core::core::url_cleaner::CanonicalUrl;

/// What an extraction run is asked to do.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub url: CanonicalUrl,
    /// Private staging directory; the run may write anything here.
    pub output_dir: PathBuf,
    pub max_file_size: u64,
}

/// Progress reported by a running extractor, already parsed from its output.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractorEvent {
    Downloading {
        percent: Option<f64>,
        total_bytes: Option<u64>,
    },
    Merging,
    Converting,
    MaxFilesizeExceeded,
    /// An `ERROR:` line from the tool. Raw text; never shown to callers.
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractOutcome {
    Finished { output: PathBuf, title: String },
    /// The tool exited unsuccessfully. `reason` is safe to show to callers.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated { version: Option<String> },
    UpToDate,
    Completed,
}

/// The external media tool. Dropping a pending `extract` or `refresh`
/// future must stop the underlying process.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;
    async fn refresh(&self) -> anyhow::Result<RefreshOutcome>;
    async fn extract(
        &self,
        request: &ExtractRequest,
        events: mpsc::Sender<ExtractorEvent>,
    ) -> anyhow::Result<ExtractOutcome>;
}
