#![forbid(unsafe_code)]

//! Building blocks of the vidshelf server: the JSON catalog, the yt-dlp
//! wrapper, thumbnail caching, download orchestration and the HTML pages.

pub mod catalog;
pub mod config;
pub mod downloads;
pub mod library;
pub mod pages;
pub mod thumbnail;
pub mod ytdlp;
