use std::path::PathBuf;

const APP_DIR: &str = "vidfetch";

pub fn app_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VIDFETCH_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".").join(APP_DIR))
}

/// Where a downloaded copy of the extractor lives when none is on `PATH`.
pub fn managed_bin_dir() -> PathBuf {
    app_data_dir().join("bin")
}

pub fn default_download_dir() -> PathBuf {
    app_data_dir().join("downloads")
}
