use serde::Deserialize;
use std::path::Path;

use crate::grafana::ApiFlavor;

/// Top-level config loaded from `collector.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CollectorConfig {
    #[serde(default)]
    pub grafana: GrafanaConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrafanaConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Flavor used when a route doesn't pin one.
    #[serde(default)]
    pub api_flavor: ApiFlavor,
    /// Per-panel render timeout.
    #[serde(default = "default_render_timeout")]
    pub render_timeout_secs: u64,
}

impl Default for GrafanaConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_flavor: ApiFlavor::default(),
            render_timeout_secs: default_render_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_render_timeout() -> u64 {
    60
}

/// Page geometry and typography for the generated document, in points.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LayoutConfig {
    #[serde(default)]
    pub font: FontConfig,
    #[serde(default)]
    pub rect: RectTable,
    #[serde(default)]
    pub position: PositionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FontConfig {
    /// One of the PDF base families: helvetica, times, courier. These cover
    /// Latin-1 only; other characters (CJK titles included) print as `?`.
    #[serde(default = "default_font_family")]
    pub family: String,
    #[serde(default = "default_font_size")]
    pub size: f64,
}

impl Default for FontConfig {
    fn default() -> Self {
        Self {
            family: default_font_family(),
            size: default_font_size(),
        }
    }
}

fn default_font_family() -> String {
    "helvetica".to_string()
}

fn default_font_size() -> f64 {
    14.0
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RectConfig {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RectTable {
    #[serde(default = "default_page")]
    pub page: RectConfig,
    #[serde(default = "default_graph")]
    pub graph: RectConfig,
    #[serde(default = "default_singlestat")]
    pub singlestat: RectConfig,
}

impl Default for RectTable {
    fn default() -> Self {
        Self {
            page: default_page(),
            graph: default_graph(),
            singlestat: default_singlestat(),
        }
    }
}

// A4 portrait
fn default_page() -> RectConfig {
    RectConfig { width: 595.28, height: 841.89 }
}

fn default_graph() -> RectConfig {
    RectConfig { width: 500.0, height: 250.0 }
}

fn default_singlestat() -> RectConfig {
    RectConfig { width: 300.0, height: 150.0 }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionConfig {
    /// Left edge of text and images.
    #[serde(default = "default_x")]
    pub x: f64,
    /// Where the header text starts on the first page.
    #[serde(default = "default_top")]
    pub top: f64,
    /// Top of the first image on a page.
    #[serde(default = "default_y1")]
    pub y1: f64,
    /// Top of the second image on a page.
    #[serde(default = "default_y2")]
    pub y2: f64,
    /// Line height between header lines.
    #[serde(default = "default_br")]
    pub br: f64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            x: default_x(),
            top: default_top(),
            y1: default_y1(),
            y2: default_y2(),
            br: default_br(),
        }
    }
}

fn default_x() -> f64 {
    48.0
}

fn default_top() -> f64 {
    40.0
}

fn default_y1() -> f64 {
    120.0
}

fn default_y2() -> f64 {
    450.0
}

fn default_br() -> f64 {
    24.0
}

impl CollectorConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: CollectorConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}
