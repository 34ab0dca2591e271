pub mod gallerydl;
pub mod registry;
pub mod ytdlp;
