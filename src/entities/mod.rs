pub mod credential;
pub mod download_job;
pub mod download_record;
pub mod playlist_subscription;
