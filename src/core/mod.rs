pub mod extractor;
pub mod file_store;
pub mod filename;
pub mod orchestrator;
pub mod process;
pub mod ytdlp;
