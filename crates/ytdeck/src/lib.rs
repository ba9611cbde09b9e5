//! ytdeck: browse a channel or playlist and download its videos with yt-dlp
//! from a browser.
//!
//! Listing and downloading are delegated to yt-dlp subprocesses; this crate
//! tracks those subprocesses and relays their progress over HTTP.

pub mod download;
pub mod error;
pub mod protocol;
pub mod server;
pub mod utils;
