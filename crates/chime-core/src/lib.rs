//! Chime Core - Shared library for the Chime audio server

pub mod types;
pub mod error;
pub mod params;
pub mod config;
pub mod provider;
pub mod cblk;
pub mod resampler;
pub mod mixer;
pub mod hal;
pub mod track;
pub mod thread;
pub mod server;

pub use error::{AudioError, AudioResult};
pub use server::{AudioServer, InputId, OutputId};
pub use types::*;
