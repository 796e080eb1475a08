//! # Guild Player
//!
//! Reproducción de audio por guild para bots de Discord: colas FIFO,
//! transcodificación con ffmpeg, una sesión de reproducción por guild y un
//! scheduler que lo coordina todo.

pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod error;
pub mod sources;
pub mod voice;
