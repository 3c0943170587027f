pub mod events;
pub mod update_throttle;
pub mod url_cleaner;
