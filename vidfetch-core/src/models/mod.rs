pub mod artifact;
pub mod job;
pub mod platform;
pub mod settings;

pub use artifact::Artifact;
pub use job::{DownloadJob, JobId};
pub use platform::Platform;
pub use settings::Settings;
