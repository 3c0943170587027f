use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::fs_paths;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub files: FileSettings,
    pub download: DownloadSettings,
    pub extractor: ExtractorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSettings {
    pub download_dir: PathBuf,
    pub max_file_age_secs: u64,
    pub cleanup_interval_secs: u64,
    pub post_serve_delete_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    pub max_file_size_bytes: u64,
    pub timeout_secs: u64,
    pub max_concurrent: usize,
    pub max_url_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorSettings {
    pub ytdlp_path: Option<PathBuf>,
    pub update_check_interval_secs: u64,
    pub update_timeout_secs: u64,
    pub update_command: Option<Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".into(),
                port: 8000,
            },
            files: FileSettings {
                download_dir: fs_paths::default_download_dir(),
                max_file_age_secs: 3600,
                cleanup_interval_secs: 300,
                post_serve_delete_delay_secs: 60,
            },
            download: DownloadSettings {
                max_file_size_bytes: 500 * MB,
                timeout_secs: 300,
                max_concurrent: 4,
                max_url_length: 2000,
            },
            extractor: ExtractorSettings {
                ytdlp_path: None,
                update_check_interval_secs: 600,
                update_timeout_secs: 120,
                update_command: None,
            },
        }
    }
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from `lookup`, falling back to defaults for unset or
    /// blank variables.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut settings = Self::default();

        if let Some(host) = get("HOST") {
            settings.server.host = host;
        }
        if let Some(port) = parse(&get, "PORT")? {
            settings.server.port = port;
        }

        if let Some(dir) = get("DOWNLOAD_DIR") {
            settings.files.download_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse(&get, "MAX_FILE_AGE_SECONDS")? {
            settings.files.max_file_age_secs = v;
        }
        if let Some(v) = parse(&get, "CLEANUP_INTERVAL_SECONDS")? {
            settings.files.cleanup_interval_secs = v;
        }
        if let Some(v) = parse(&get, "POST_SERVE_DELETE_DELAY")? {
            settings.files.post_serve_delete_delay_secs = v;
        }

        if let Some(mb) = parse::<u64, _>(&get, "MAX_FILE_SIZE_MB")? {
            settings.download.max_file_size_bytes = mb
                .checked_mul(MB)
                .ok_or_else(|| anyhow!("MAX_FILE_SIZE_MB is too large"))?;
        }
        if let Some(v) = parse(&get, "DOWNLOAD_TIMEOUT_SECONDS")? {
            settings.download.timeout_secs = v;
        }
        if let Some(v) = parse(&get, "MAX_CONCURRENT_DOWNLOADS")? {
            settings.download.max_concurrent = v;
        }
        if let Some(v) = parse(&get, "MAX_URL_LENGTH")? {
            settings.download.max_url_length = v;
        }

        if let Some(path) = get("YTDLP_PATH") {
            settings.extractor.ytdlp_path = Some(PathBuf::from(path));
        }
        if let Some(v) = parse(&get, "YTDLP_UPDATE_CHECK_INTERVAL")? {
            settings.extractor.update_check_interval_secs = v;
        }
        if let Some(v) = parse(&get, "YTDLP_UPDATE_TIMEOUT_SECONDS")? {
            settings.extractor.update_timeout_secs = v;
        }
        if let Some(cmd) = get("YTDLP_UPDATE_COMMAND") {
            settings.extractor.update_command =
                Some(cmd.split_whitespace().map(str::to_string).collect());
        }

        if settings.download.max_concurrent == 0 {
            return Err(anyhow!("MAX_CONCURRENT_DOWNLOADS must be at least 1"));
        }
        if settings.files.cleanup_interval_secs == 0 {
            return Err(anyhow!("CLEANUP_INTERVAL_SECONDS must be at least 1"));
        }

        Ok(settings)
    }

    pub fn max_file_age(&self) -> Duration {
        Duration::from_secs(self.files.max_file_age_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.files.cleanup_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.files.post_serve_delete_delay_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download.timeout_secs)
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.extractor.update_check_interval_secs)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.extractor.update_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse<T, G>(get: &G, key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("invalid value for {}: {:?}", key, raw))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> anyhow::Result<Settings> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = from_pairs(&[]).unwrap();
        assert_eq!(s.files.max_file_age_secs, 3600);
        assert_eq!(s.files.cleanup_interval_secs, 300);
        assert_eq!(s.files.post_serve_delete_delay_secs, 60);
        assert_eq!(s.download.max_file_size_bytes, 500 * 1024 * 1024);
        assert_eq!(s.download.timeout_secs, 300);
        assert_eq!(s.extractor.update_check_interval_secs, 600);
        assert_eq!(s.bind_addr(), "0.0.0.0:8000");
    }

    #[test]
    fn env_overrides_are_applied() {
        let s = from_pairs(&[
            ("MAX_FILE_AGE_SECONDS", "120"),
            ("MAX_FILE_SIZE_MB", "10"),
            ("YTDLP_UPDATE_CHECK_INTERVAL", " 30 "),
            ("YTDLP_UPDATE_COMMAND", "pip install --upgrade yt-dlp"),
            ("PORT", "9000"),
        ])
        .unwrap();
        assert_eq!(s.max_file_age(), Duration::from_secs(120));
        assert_eq!(s.download.max_file_size_bytes, 10 * 1024 * 1024);
        assert_eq!(s.update_check_interval(), Duration::from_secs(30));
        assert_eq!(s.server.port, 9000);
        assert_eq!(
            s.extractor.update_command.as_deref().map(|c| c.len()),
            Some(4)
        );
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let s = from_pairs(&[("MAX_FILE_SIZE_MB", "  ")]).unwrap();
        assert_eq!(s.download.max_file_size_bytes, 500 * 1024 * 1024);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = from_pairs(&[("MAX_FILE_AGE_SECONDS", "an hour")]).unwrap_err();
        assert!(err.to_string().contains("MAX_FILE_AGE_SECONDS"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(from_pairs(&[("MAX_CONCURRENT_DOWNLOADS", "0")]).is_err());
    }
}
