//! Server configuration
//!
//! Policy tuning values (retry budgets, standby timeout, sleep times) are
//! deliberately configuration, not constants: they bound behavior but the
//! exact numbers are not load-bearing. Defaults match the values the
//! server has shipped with.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::resampler::Quality;
use crate::types::{AudioFormat, ChannelLayout, PcmSpec};

/// Which hardware device implementation to open at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HalKind {
    /// Simulated device: writes are paced with sleeps, reads return silence
    #[default]
    Stub,
    /// Real device through the cross-platform backend
    Generic,
}

/// Top-level configuration for the audio server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Hardware device to open; open failure falls back to `Stub`
    pub hal: HalKind,

    /// Directory for PCM tee files; every opened output mirrors what it
    /// writes to the device into `output-N.pcm` there
    pub dump_path: Option<std::path::PathBuf>,

    /// Native output sample rate when the device has no opinion
    pub sample_rate: u32,

    /// Frames per mix block
    pub frame_count: usize,

    /// Resampler quality tier for tracks not at the device rate
    pub resampler_quality: Quality,

    /// Idle time with no active tracks before hardware standby, in ms
    pub standby_timeout_ms: u64,

    /// Mix cycles a starving track survives before eviction
    pub max_track_retries: u32,

    /// Retry budget for direct-output tracks (no mixer in front of them)
    pub max_direct_retries: u32,

    /// Lower bound for the playback loop's bounded sleeps, in us
    pub min_sleep_us: u64,

    /// Consecutive-underrun sleep halvings before the back-off stops
    pub max_sleep_shift: u32,

    /// Record loop pause after a read error or full client buffer, in us
    pub record_sleep_us: u64,

    /// Minimum interval between repeated late-write warnings, in ms
    pub warning_throttle_ms: u64,

    /// Whether clients may open capture tracks at all
    pub capture_allowed: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hal: HalKind::Stub,
            dump_path: None,
            sample_rate: 44100,
            frame_count: 1024,
            resampler_quality: Quality::Low,
            standby_timeout_ms: 3000,
            max_track_retries: 50,
            max_direct_retries: 2,
            min_sleep_us: 5000,
            max_sleep_shift: 2,
            record_sleep_us: 5000,
            warning_throttle_ms: 5000,
            capture_allowed: true,
        }
    }
}

impl ServerConfig {
    /// PCM spec of the mix bus (always stereo 16-bit at the device rate)
    pub fn mix_spec(&self) -> PcmSpec {
        PcmSpec::new(self.sample_rate, AudioFormat::Pcm16, ChannelLayout::Stereo)
    }
}

/// Load configuration from a YAML file
///
/// Missing file returns defaults; an unparseable file logs a warning and
/// returns defaults rather than refusing to start the server.
pub fn load_config<T>(path: &Path) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("load_config: {:?} doesn't exist, using defaults", path);
        return T::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<T>(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("load_config: failed to parse {:?}: {}, using defaults", path, e);
                T::default()
            }
        },
        Err(e) => {
            log::warn!("load_config: failed to read {:?}: {}, using defaults", path, e);
            T::default()
        }
    }
}

/// Save configuration to a YAML file, creating parent directories
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {:?}", parent))?;
    }
    let yaml = serde_yaml::to_string(config).context("failed to serialize config")?;
    std::fs::write(path, yaml).with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_bounded_and_nonzero() {
        let cfg = ServerConfig::default();
        assert!(cfg.max_track_retries > 0);
        assert!(cfg.standby_timeout_ms > 0);
        assert!(cfg.frame_count > 0);
        assert_eq!(cfg.mix_spec().frame_size(), 4);
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chime.yaml");

        let mut cfg = ServerConfig::default();
        cfg.standby_timeout_ms = 1234;
        cfg.hal = HalKind::Generic;
        save_config(&cfg, &path).unwrap();

        let loaded: ServerConfig = load_config(&path);
        assert_eq!(loaded.standby_timeout_ms, 1234);
        assert_eq!(loaded.hal, HalKind::Generic);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let loaded: ServerConfig = load_config(Path::new("/nonexistent/chime.yaml"));
        assert_eq!(loaded.standby_timeout_ms, ServerConfig::default().standby_timeout_ms);
    }
}
