// SPDX-License-Identifier: CEPL-1.0
//! `triad.toml` model.
//!
//! Every field has a default so a partial (or absent) file still yields a
//! runnable configuration: an 800x600 window, three back buffers.

use serde::Deserialize;
use std::{fs, io, path::Path};
use thiserror::Error;
use tracing::warn;
use triad_render::pipeline::{MAX_BUFFERS, MIN_BUFFERS};
use triad_render::FeatureLevel;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("window size must be non-zero, got {width}x{height}")]
    ZeroSize { width: u32, height: u32 },
    #[error("buffer_count must be in {min}..={max}, got {0}", min = MIN_BUFFERS, max = MAX_BUFFERS)]
    BufferCount(u32),
    #[error("unknown feature level {0:?}")]
    FeatureLevel(String),
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WindowCfg {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub fullscreen: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RenderCfg {
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    #[serde(default = "default_vsync")]
    pub vsync: bool,
    #[serde(default = "default_feature_level")]
    pub feature_level: String,
    /// 0 waits forever.
    #[serde(default = "default_fence_timeout_ms")]
    pub fence_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub window: WindowCfg,
    #[serde(default)]
    pub render: RenderCfg,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            title: default_title(),
            width: default_width(),
            height: default_height(),
            fullscreen: false,
        }
    }
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            buffer_count: default_buffer_count(),
            clear_color: default_clear(),
            vsync: default_vsync(),
            feature_level: default_feature_level(),
            fence_timeout_ms: default_fence_timeout_ms(),
        }
    }
}

fn default_title() -> String {
    "Triad".to_string()
}
fn default_width() -> u32 {
    800
}
fn default_height() -> u32 {
    600
}
fn default_buffer_count() -> u32 {
    3
}
fn default_clear() -> [f32; 4] {
    [0.0, 0.2, 0.4, 1.0]
}
fn default_vsync() -> bool {
    true
}
fn default_feature_level() -> String {
    "11_0".to_string()
}
fn default_fence_timeout_ms() -> u64 {
    5000
}

impl EngineConfig {
    pub fn from_toml_str(s: &str, origin: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig = toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Strict load: any I/O, parse or validation problem is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&s, &path.display().to_string())
    }

    /// Lenient load used at startup: a missing file means defaults, a bad
    /// file is reported and replaced by defaults.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Self::default()
            }
            Err(e) => {
                warn!("{e}; using defaults");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.window;
        if w.width == 0 || w.height == 0 {
            return Err(ConfigError::ZeroSize {
                width: w.width,
                height: w.height,
            });
        }
        let n = self.render.buffer_count;
        if !(MIN_BUFFERS..=MAX_BUFFERS).contains(&n) {
            return Err(ConfigError::BufferCount(n));
        }
        self.render.feature_level()?;
        Ok(())
    }
}

impl RenderCfg {
    pub fn feature_level(&self) -> Result<FeatureLevel, ConfigError> {
        self.feature_level
            .parse()
            .map_err(|_| ConfigError::FeatureLevel(self.feature_level.clone()))
    }
}
