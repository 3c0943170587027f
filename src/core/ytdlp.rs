use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use anyhow::anyhow;
use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use vidfetch_core::fs_paths;

use crate::core::extractor::{
    ExtractOutcome, ExtractRequest, Extractor, ExtractorEvent, RefreshOutcome,
};
use crate::core::process;

const OUTPUT_TEMPLATE: &str = "%(title).100B.%(ext)s";
const STDERR_TAIL_LINES: usize = 20;

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)%").unwrap());
static TOTAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"of\s+~?\s*(\d+(?:\.\d+)?)\s*([KMGT]?i?B)\b").unwrap());
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4}\.\d{1,2}\.\d{1,2}(?:\.\d+)?)").unwrap());

fn bin_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else {
        "yt-dlp"
    }
}

fn managed_ytdlp_path() -> PathBuf {
    fs_paths::managed_bin_dir().join(bin_name())
}

pub async fn find_ytdlp() -> Option<PathBuf> {
    if let Ok(status) = process::command(bin_name())
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        if status.success() {
            return Some(PathBuf::from(bin_name()));
        }
    }

    let managed = managed_ytdlp_path();
    if managed.exists() {
        return Some(managed);
    }

    None
}

/// Locates yt-dlp, downloading the latest release into the managed bin
/// directory when it is not installed.
pub async fn ensure_ytdlp() -> anyhow::Result<PathBuf> {
    if let Some(path) = find_ytdlp().await {
        return Ok(path);
    }

    download_ytdlp_binary().await
}

async fn download_ytdlp_binary() -> anyhow::Result<PathBuf> {
    let target = managed_ytdlp_path();

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let download_url = if cfg!(target_os = "windows") {
        "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp.exe"
    } else if cfg!(target_os = "macos") {
        "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_macos"
    } else {
        "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp"
    };

    info!("yt-dlp not found, downloading {}", download_url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()?;

    let response = client.get(download_url).send().await?;

    if !response.status().is_success() {
        return Err(anyhow!("Failed to download yt-dlp: HTTP {}", response.status()));
    }

    let bytes = response.bytes().await?;
    tokio::fs::write(&target, &bytes).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        tokio::fs::set_permissions(&target, perms).await?;
    }

    info!("yt-dlp installed to {}", target.display());
    Ok(target)
}

pub fn build_download_args(request: &ExtractRequest) -> Vec<String> {
    let output_template = request
        .output_dir
        .join(OUTPUT_TEMPLATE)
        .to_string_lossy()
        .to_string();

    let mut args: Vec<String> = [
        "-f",
        "bv*+ba/b",
        "-S",
        "res,vcodec:h264,acodec:aac",
        "--merge-output-format",
        "mp4",
        "--restrict-filenames",
        "--no-playlist",
        "--newline",
        "--progress",
        "--retries",
        "3",
        "--socket-timeout",
        "30",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push("--max-filesize".to_string());
    args.push(request.max_file_size.to_string());
    args.extend(request.url.platform().extractor_args().iter().map(|s| s.to_string()));
    args.extend(["-o".to_string(), output_template, request.url.as_str().to_string()]);
    args
}

pub fn parse_output_line(line: &str) -> Option<ExtractorEvent> {
    let line = line.trim();

    if let Some(message) = line.strip_prefix("ERROR:") {
        return Some(ExtractorEvent::Error {
            message: message.trim().to_string(),
        });
    }

    if let Some(rest) = line.strip_prefix("[download]") {
        if rest.contains("larger than max-filesize") {
            return Some(ExtractorEvent::MaxFilesizeExceeded);
        }
        if rest.contains("has already been downloaded") {
            return Some(ExtractorEvent::Downloading {
                percent: Some(100.0),
                total_bytes: None,
            });
        }
        let percent = PERCENT_RE
            .captures(rest)
            .and_then(|c| c[1].parse::<f64>().ok())
            .map(|p| p.min(100.0));
        let total_bytes = TOTAL_RE
            .captures(rest)
            .and_then(|c| parse_size(&c[1], &c[2]));
        if percent.is_none() && !rest.trim_start().starts_with("Destination:") {
            return None;
        }
        return Some(ExtractorEvent::Downloading {
            percent,
            total_bytes,
        });
    }

    if line.starts_with("[Merger]") {
        return Some(ExtractorEvent::Merging);
    }

    if line.starts_with("[VideoConvertor]")
        || line.starts_with("[VideoRemuxer]")
        || line.starts_with("[ExtractAudio]")
        || line.starts_with("[Fixup")
    {
        return Some(ExtractorEvent::Converting);
    }

    None
}

fn parse_size(value: &str, unit: &str) -> Option<u64> {
    let value: f64 = value.parse().ok()?;
    let multiplier: f64 = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

/// Turns the tail of yt-dlp's stderr into a message that is safe to show.
pub fn diagnose_failure(stderr: &[String]) -> String {
    let text = stderr.join("\n").to_lowercase();

    let reason = if text.contains("private video") {
        "This video is private"
    } else if text.contains("confirm your age")
        || text.contains("age-restricted")
        || text.contains("inappropriate for some users")
    {
        "This video is age-restricted"
    } else if text.contains("not available in your country") || text.contains("geo restrict") {
        "This video is not available in the server's region"
    } else if text.contains("requested format is not available") {
        "No downloadable format was found"
    } else if text.contains("video unavailable")
        || text.contains("is not available")
        || text.contains("has been removed")
    {
        "Video is unavailable"
    } else if text.contains("429") || text.contains("too many requests") {
        "The platform is rate-limiting requests, try again later"
    } else if text.contains("unsupported url") {
        "This URL is not supported"
    } else if text.contains("login required")
        || text.contains("sign in")
        || text.contains("log in")
        || text.contains("cookies")
    {
        "The platform requires a login to access this video"
    } else if text.contains("timed out") || text.contains("unable to connect") {
        "Could not reach the platform"
    } else {
        return "Download failed".to_string();
    };

    format!("Download failed: {}", reason)
}

/// Diagnoses from the `ERROR:` lines when there are any, else from the tail.
fn failure_reason(errors: &[String], tail: &[String]) -> String {
    if errors.is_empty() {
        diagnose_failure(tail)
    } else {
        diagnose_failure(errors)
    }
}

pub fn classify_update_output(stdout: &str) -> RefreshOutcome {
    let version = || VERSION_RE.captures(stdout).map(|c| c[1].to_string());

    if stdout.contains("Updated yt-dlp to") || stdout.contains("Successfully installed") {
        RefreshOutcome::Updated { version: version() }
    } else if stdout.contains("is up to date") || stdout.contains("Requirement already satisfied") {
        RefreshOutcome::UpToDate
    } else {
        RefreshOutcome::Completed
    }
}

fn is_partial(name: &str) -> bool {
    name.starts_with('.')
        || name.ends_with(".part")
        || name.ends_with(".ytdl")
        || name.ends_with(".temp")
        || name.contains(".part-Frag")
}

/// Newest finished file in `output_dir`, ignoring partial downloads.
pub async fn find_downloaded_file(output_dir: &Path) -> anyhow::Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(output_dir).await?;
    let mut best: Option<(PathBuf, std::time::SystemTime)> = None;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if is_partial(name) {
            continue;
        }
        let meta = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
        match &best {
            Some((_, best_time)) if modified <= *best_time => {}
            _ => best = Some((path, modified)),
        }
    }

    best.map(|(p, _)| p)
        .ok_or_else(|| anyhow!("no downloaded file in {:?}", output_dir))
}

/// `--restrict-filenames` turns spaces into underscores; undo that for the
/// name shown to users.
fn title_from_output(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video")
        .replace('_', " ")
}

pub struct YtDlp {
    binary: PathBuf,
    update_command: Option<Vec<String>>,
}

impl YtDlp {
    pub fn new(binary: PathBuf, update_command: Option<Vec<String>>) -> Self {
        Self {
            binary,
            update_command,
        }
    }

    fn refresh_command(&self) -> tokio::process::Command {
        match self.update_command.as_deref() {
            Some([program, args @ ..]) => {
                let mut cmd = process::command(program);
                cmd.args(args);
                cmd
            }
            _ => {
                let mut cmd = process::command(&self.binary);
                cmd.arg("-U");
                cmd
            }
        }
    }
}

#[async_trait]
impl Extractor for YtDlp {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn refresh(&self) -> anyhow::Result<RefreshOutcome> {
        let output = self
            .refresh_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| anyhow!("failed to run update command: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "update command exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(classify_update_output(&stdout))
    }

    async fn extract(
        &self,
        request: &ExtractRequest,
        events: mpsc::Sender<ExtractorEvent>,
    ) -> anyhow::Result<ExtractOutcome> {
        let args = build_download_args(request);
        debug!("yt-dlp {:?}", args);

        let mut child = process::command(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("failed to start yt-dlp: {}", e))?;

        let stdout = child.stdout.take().ok_or_else(|| anyhow!("yt-dlp stdout unavailable"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("yt-dlp stderr unavailable"))?;

        let stdout_events = events.clone();
        let read_stdout = async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(event) = parse_output_line(&line) {
                    if stdout_events.send(event).await.is_err() {
                        break;
                    }
                }
            }
        };

        let read_stderr = async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut errors: Vec<String> = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_output_line(&line) {
                    Some(ExtractorEvent::Error { message }) => {
                        if errors.len() < STDERR_TAIL_LINES {
                            errors.push(message.clone());
                        }
                        let _ = events.send(ExtractorEvent::Error { message }).await;
                    }
                    Some(event) => {
                        let _ = events.send(event).await;
                    }
                    None => {}
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            (tail, errors)
        };

        let (status, (), (tail, errors)) = tokio::join!(child.wait(), read_stdout, read_stderr);
        let status = status.map_err(|e| anyhow!("yt-dlp process failed: {}", e))?;

        if !status.success() {
            let tail: Vec<String> = tail.into();
            error!(
                code = ?status.code(),
                "yt-dlp failed for {}: {}",
                request.url,
                tail.join(" | ")
            );
            return Ok(ExtractOutcome::Failed {
                reason: failure_reason(&errors, &tail),
            });
        }

        let output = find_downloaded_file(&request.output_dir).await?;
        let title = title_from_output(&output);
        Ok(ExtractOutcome::Finished { output, title })
    }
}
