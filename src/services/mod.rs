pub mod background;
pub mod credentials;
pub mod downloader;
pub mod library;
pub mod matching;
pub mod queue;
pub mod reconcile;
