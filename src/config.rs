use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::types::Category;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub datasets: Vec<DatasetSource>,
    pub map: MapConfig,
    #[serde(default)]
    pub geocoder: GeocoderConfig,
    #[serde(default)]
    pub style: StyleConfig,
    pub render: RenderConfig,
    pub server: ServerConfig,
}

/// One JSON dataset endpoint. Declaration order in the config file is the
/// concatenation order of the loaded records.
#[derive(Debug, Deserialize, Clone)]
pub struct DatasetSource {
    pub name: String,
    pub url: String,
    /// Explicit category tag for every record of this source. Leaving it out
    /// falls back to per-record field inference in the loader.
    pub category: Option<Category>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MapConfig {
    pub center_lat: f64,
    pub center_lon: f64,
    pub zoom: u8,
    /// XYZ template for the basemap, passed through to the frontend.
    pub tile_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocoderConfig {
    pub endpoint: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        GeocoderConfig {
            endpoint: "https://nominatim.openstreetmap.org/search".to_string(),
            user_agent: concat!("mapa-social/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 10,
        }
    }
}

/// Marker appearance per category. Injected into the renderer at
/// construction; nothing mutates these after load.
#[derive(Debug, Deserialize, Clone)]
pub struct MarkerStyle {
    pub color: String, // Hex code
    pub radius: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StyleConfig {
    pub student: MarkerStyle,
    pub lodging: MarkerStyle,
    pub beneficiary: MarkerStyle,
}

impl StyleConfig {
    pub fn for_category(&self, category: Category) -> &MarkerStyle {
        match category {
            Category::Student => &self.student,
            Category::Lodging => &self.lodging,
            Category::Beneficiary => &self.beneficiary,
        }
    }
}

impl Default for StyleConfig {
    fn default() -> Self {
        StyleConfig {
            student: MarkerStyle { color: "#2b7bba".to_string(), radius: 4 },
            lodging: MarkerStyle { color: "#2ca25f".to_string(), radius: 4 },
            beneficiary: MarkerStyle { color: "#d95f0e".to_string(), radius: 4 },
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderConfig {
    pub tile_dir: PathBuf,
    pub min_zoom: u8,
    pub max_zoom: u8,
    #[serde(default = "default_heatmap_radius")]
    pub heatmap_radius: u32,
    #[serde(default = "default_heatmap_blur")]
    pub heatmap_blur: u32,
    /// Grid cell edge in pixels used to group markers in cluster mode.
    #[serde(default = "default_cluster_cell")]
    pub cluster_cell: u32,
}

fn default_heatmap_radius() -> u32 {
    25
}

fn default_heatmap_blur() -> u32 {
    15
}

fn default_cluster_cell() -> u32 {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml_src = r#"
            [[datasets]]
            name = "beneficiarios"
            url = "http://localhost/enderecos.json"
            category = "beneficiary"

            [[datasets]]
            name = "alunos"
            url = "http://localhost/enderecos_alunos.json"

            [map]
            center_lat = -9.5713
            center_lon = -36.7819
            zoom = 9
            tile_url = "https://tile.openstreetmap.org/{z}/{x}/{y}.png"

            [render]
            tile_dir = "tiles"
            min_zoom = 6
            max_zoom = 12

            [server]
            port = 3000
        "#;

        let config: AppConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.datasets.len(), 2);
        assert_eq!(config.datasets[0].category, Some(Category::Beneficiary));
        assert_eq!(config.datasets[1].category, None);
        assert_eq!(config.render.heatmap_radius, 25);
        assert_eq!(config.render.cluster_cell, 64);
        assert_eq!(config.server.static_dir, PathBuf::from("static"));
        assert!(config.geocoder.endpoint.contains("nominatim"));
    }
}
