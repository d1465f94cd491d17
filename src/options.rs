//! Deployment options for stream opening.
//!
//! Defaults are conservative; deployments override them in code, through the
//! environment, or through a JSON profile pointed at by `HWSTREAM_PROFILE`.

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

pub const PROFILE_ENV: &str = "HWSTREAM_PROFILE";
pub const OUTPUT_OFFSET_ENV: &str = "HWSTREAM_OUTPUT_OFFSET";
pub const POSITIONAL_FALLBACK_ENV: &str = "HWSTREAM_POSITIONAL_FALLBACK";
pub const PREFERRED_BUFFER_ENV: &str = "HWSTREAM_PREFERRED_BUFFER";

/// How the host buffer frame count is chosen at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferSizePolicy {
    /// Select from the device constraints and the suggested latency.
    Latency,
    /// Always take the driver's preferred size. Trades latency precision for
    /// robustness against drivers that misreport their size range.
    PreferredOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Route default output requests to physical channels
    /// `[offset, offset + n)`, keeping `[0, offset)` allocated but silent.
    /// Ignored when explicit selectors are given, and dropped entirely when
    /// the device has fewer than `offset + n` output channels.
    pub output_channel_offset: usize,

    /// When a granted slot cannot be matched by stamped channel number,
    /// fall back to positional assignment instead of failing the open.
    /// Off by default: positional assignment silently misroutes audio on
    /// drivers that reorder their grants.
    pub positional_fallback: bool,

    pub buffer_size_policy: BufferSizePolicy,

    /// Target buffering latency per direction, seconds. The larger of the
    /// two drives host buffer size selection.
    pub suggested_input_latency: f64,
    pub suggested_output_latency: f64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            output_channel_offset: 0,
            positional_fallback: false,
            buffer_size_policy: BufferSizePolicy::Latency,
            suggested_input_latency: 0.0,
            suggested_output_latency: 0.0,
        }
    }
}

impl StreamOptions {
    /// Apply environment overrides on top of `self`. A profile file named by
    /// `HWSTREAM_PROFILE` is loaded first, then single-value variables win.
    pub fn from_env(mut self) -> Self {
        if let Ok(path) = std::env::var(PROFILE_ENV)
            && let Ok(profile) = Self::load_profile(&path)
        {
            self = profile;
        }
        if let Some(offset) = env_usize(OUTPUT_OFFSET_ENV) {
            self.output_channel_offset = offset;
        }
        if env_flag(POSITIONAL_FALLBACK_ENV) {
            self.positional_fallback = true;
        }
        if env_flag(PREFERRED_BUFFER_ENV) {
            self.buffer_size_policy = BufferSizePolicy::PreferredOnly;
        }
        self
    }

    /// Load options from a JSON profile. Missing fields take their defaults.
    pub fn load_profile(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut raw = String::new();
        std::fs::File::open(path)?.read_to_string(&mut raw)?;
        serde_json::from_str(&raw).map_err(std::io::Error::other)
    }
}

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        })
        .unwrap_or(false)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse().ok()
}
