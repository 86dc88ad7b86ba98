//! Server configuration.
//!
//! Loaded from the first of a fixed list of candidate paths, falling back to
//! `Default::default()` with a warning. Unknown keys are rejected so a typo
//! in a config file fails loudly instead of silently taking the default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_rtp_base_port")]
    pub rtp_base_port: u16,

    #[serde(default = "default_control_port")]
    pub control_port: u16,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default = "default_max_output_channels")]
    pub max_output_channels: usize,

    #[serde(default)]
    pub basic_channels: Vec<u32>,

    #[serde(default)]
    pub discrete_channels: Vec<u32>,

    #[serde(default = "default_volume")]
    pub initial_global_volume: f32,

    #[serde(default)]
    pub initial_global_delay_ms: f32,

    #[serde(default = "default_max_delay_ms")]
    pub max_global_delay_ms: f32,

    #[serde(default = "default_max_delay_ms")]
    pub max_client_delay_ms: f32,

    #[serde(default = "default_meter_interval_ms")]
    pub meter_publish_interval_ms: u32,

    #[serde(default = "default_queue_depth")]
    pub packet_queue_depth: usize,

    #[serde(default = "default_skew_threshold")]
    pub clock_skew_threshold: u32,

    pub renderer_host: Option<String>,

    #[serde(default)]
    pub renderer_port: Option<u16>,

    #[serde(default = "default_true")]
    pub verify_patch_version: bool,
}

fn default_sample_rate() -> u32 {
    48_000
}
fn default_buffer_size() -> usize {
    256
}
fn default_rtp_base_port() -> u16 {
    50_000
}
fn default_control_port() -> u16 {
    7000
}
fn default_max_clients() -> usize {
    32
}
fn default_max_output_channels() -> usize {
    16
}
fn default_volume() -> f32 {
    1.0
}
fn default_max_delay_ms() -> f32 {
    1000.0
}
fn default_meter_interval_ms() -> u32 {
    100
}
fn default_queue_depth() -> usize {
    4
}
fn default_skew_threshold() -> u32 {
    default_buffer_size() as u32
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            buffer_size: default_buffer_size(),
            rtp_base_port: default_rtp_base_port(),
            control_port: default_control_port(),
            max_clients: default_max_clients(),
            max_output_channels: default_max_output_channels(),
            basic_channels: (0..2).collect(),
            discrete_channels: Vec::new(),
            initial_global_volume: default_volume(),
            initial_global_delay_ms: 0.0,
            max_global_delay_ms: default_max_delay_ms(),
            max_client_delay_ms: default_max_delay_ms(),
            meter_publish_interval_ms: default_meter_interval_ms(),
            packet_queue_depth: default_queue_depth(),
            clock_skew_threshold: default_skew_threshold(),
            renderer_host: None,
            renderer_port: None,
            verify_patch_version: true,
        }
    }
}

impl ServerConfig {
    pub fn load() -> Result<Self> {
        let candidates = ["config.toml", "/etc/sam/config.toml", "~/.config/sam/config.toml"];

        for path in candidates {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::load_from_file(expanded.as_ref());
            }
        }

        tracing::warn!("no config.toml found, using default configuration");
        Ok(Self::default())
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let config: ServerConfig = toml::from_str(&content).with_context(|| format!("parsing {path}"))?;
        tracing::info!("configuration loaded from {path}");
        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("serializing configuration")?;
        fs::write(path, content).with_context(|| format!("writing {path}"))?;
        Ok(())
    }

    /// `buffer_size` converted to samples used as the default jitter-buffer
    /// depth contribution (queue_depth * buffer_size).
    pub fn jitter_buffer_samples(&self) -> u32 {
        (self.packet_queue_depth * self.buffer_size) as u32
    }
}
