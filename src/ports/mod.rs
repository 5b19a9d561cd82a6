pub mod library;
pub mod platform;
pub mod playlist_source;
pub mod session;
