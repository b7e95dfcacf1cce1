use crate::config::{AppConfig, RenderConfig, StyleConfig};
use crate::layers::LayerBackend;
use crate::types::{Category, DisplayMode, PointRecord};
use anyhow::{Context, Result};
use image::{ImageBuffer, Rgba, RgbaImage};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::fs;
use tracing::info;

// Constants for Web Mercator
const TILE_SIZE: u32 = 256;

// Cluster disc colors by member count, matching the usual marker-cluster
// green / yellow / orange buckets.
const CLUSTER_SMALL: Rgba<u8> = Rgba([110, 204, 57, 230]);
const CLUSTER_MEDIUM: Rgba<u8> = Rgba([240, 194, 12, 230]);
const CLUSTER_LARGE: Rgba<u8> = Rgba([241, 128, 23, 230]);

/// Raster layer backend: an attached layer is a prepared point set, and tiles
/// are rendered from it on demand as 256px transparent RGBA overlays.
pub struct RasterBackend {
    marker_styles: HashMap<Category, (Rgba<u8>, u32)>,
    heatmap_radius: u32,
    heatmap_blur: u32,
    cluster_cell: u32,
    layers: HashMap<u64, PreparedLayer>,
    next_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(u64);

struct PreparedLayer {
    mode: DisplayMode,
    points: Vec<PointRecord>,
}

impl RasterBackend {
    pub fn new(style: &StyleConfig, render: &RenderConfig) -> Self {
        let marker_styles = Category::ALL
            .iter()
            .map(|&category| {
                let s = style.for_category(category);
                (category, (hex_to_rgba(&s.color), s.radius))
            })
            .collect();

        RasterBackend {
            marker_styles,
            heatmap_radius: render.heatmap_radius,
            heatmap_blur: render.heatmap_blur,
            cluster_cell: render.cluster_cell,
            layers: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Renders one overlay tile for an attached layer. `None` for an unknown
    /// handle; an empty (fully transparent) image when no point touches the
    /// tile.
    pub fn render_tile(&self, handle: LayerId, zoom: u8, x: u32, y: u32) -> Option<RgbaImage> {
        let layer = self.layers.get(&handle.0)?;
        let img = match layer.mode {
            DisplayMode::Markers => self.render_markers_tile(&layer.points, zoom, x, y),
            DisplayMode::Heatmap => self.render_heatmap_tile(&layer.points, zoom, x, y),
            DisplayMode::Cluster => self.render_cluster_tile(&layer.points, zoom, x, y),
        };
        Some(img)
    }

    fn render_markers_tile(&self, points: &[PointRecord], zoom: u8, x: u32, y: u32) -> RgbaImage {
        let mut img = ImageBuffer::new(TILE_SIZE, TILE_SIZE);
        let (ox, oy) = (x as f64 * TILE_SIZE as f64, y as f64 * TILE_SIZE as f64);

        for point in points {
            let (color, radius) = self.marker_styles[&point.category];
            let (gx, gy) = world_pixel(point.lat(), point.lon(), zoom);
            let (lx, ly) = (gx - ox, gy - oy);
            let reach = radius as f64 + 1.0;
            if lx < -reach
                || ly < -reach
                || lx > TILE_SIZE as f64 + reach
                || ly > TILE_SIZE as f64 + reach
            {
                continue;
            }
            fill_disc(&mut img, lx, ly, radius as f64, color);
        }

        img
    }

    fn render_heatmap_tile(&self, points: &[PointRecord], zoom: u8, x: u32, y: u32) -> RgbaImage {
        let (ox, oy) = (x as f64 * TILE_SIZE as f64, y as f64 * TILE_SIZE as f64);
        let reach = (self.heatmap_radius + self.heatmap_blur) as f64;

        // Accumulate density first, colorize after.
        let mut acc = vec![0.0f64; (TILE_SIZE * TILE_SIZE) as usize];

        for point in points {
            let (gx, gy) = world_pixel(point.lat(), point.lon(), zoom);
            let (cx, cy) = (gx - ox, gy - oy);
            if cx < -reach
                || cy < -reach
                || cx > TILE_SIZE as f64 + reach
                || cy > TILE_SIZE as f64 + reach
            {
                continue;
            }

            let x0 = ((cx - reach).floor().max(0.0)) as u32;
            let x1 = ((cx + reach).ceil().min(TILE_SIZE as f64 - 1.0)) as u32;
            let y0 = ((cy - reach).floor().max(0.0)) as u32;
            let y1 = ((cy + reach).ceil().min(TILE_SIZE as f64 - 1.0)) as u32;

            for py in y0..=y1 {
                for px in x0..=x1 {
                    let d = ((px as f64 - cx).powi(2) + (py as f64 - cy).powi(2)).sqrt();
                    let t = 1.0 - (d / reach).min(1.0);
                    acc[(py * TILE_SIZE + px) as usize] += t * t;
                }
            }
        }

        let mut img = ImageBuffer::new(TILE_SIZE, TILE_SIZE);
        for py in 0..TILE_SIZE {
            for px in 0..TILE_SIZE {
                let v = (acc[(py * TILE_SIZE + px) as usize] * 0.6).min(1.0);
                if v > 0.02 {
                    img.put_pixel(px, py, heat_color(v));
                }
            }
        }

        img
    }

    fn render_cluster_tile(&self, points: &[PointRecord], zoom: u8, x: u32, y: u32) -> RgbaImage {
        let mut img = ImageBuffer::new(TILE_SIZE, TILE_SIZE);
        let (ox, oy) = (x as f64 * TILE_SIZE as f64, y as f64 * TILE_SIZE as f64);

        for cluster in cluster_points(points, zoom, self.cluster_cell) {
            let (lx, ly) = (cluster.world.0 - ox, cluster.world.1 - oy);
            let (color, radius) = if cluster.count == 1 {
                let (color, radius) = self.marker_styles[&cluster.category];
                (color, radius as f64)
            } else {
                let color = match cluster.count {
                    0..=9 => CLUSTER_SMALL,
                    10..=99 => CLUSTER_MEDIUM,
                    _ => CLUSTER_LARGE,
                };
                // Disc grows with the log of the member count.
                (color, (8.0 + (cluster.count as f64).ln() * 2.5).min(20.0))
            };

            if lx < -radius - 1.0
                || ly < -radius - 1.0
                || lx > TILE_SIZE as f64 + radius + 1.0
                || ly > TILE_SIZE as f64 + radius + 1.0
            {
                continue;
            }
            fill_disc(&mut img, lx, ly, radius, color);
        }

        img
    }
}

impl LayerBackend for RasterBackend {
    type Handle = LayerId;

    fn attach(&mut self, mode: DisplayMode, points: &[PointRecord]) -> LayerId {
        self.next_id += 1;
        self.layers.insert(self.next_id, PreparedLayer { mode, points: points.to_vec() });
        LayerId(self.next_id)
    }

    fn detach(&mut self, handle: LayerId) {
        self.layers.remove(&handle.0);
    }
}

/// One grid cell of nearby markers at a given zoom.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Centroid in world-pixel coordinates at the clustering zoom.
    pub world: (f64, f64),
    pub count: usize,
    /// Category of the first member; meaningful when `count == 1`.
    pub category: Category,
}

/// Buckets points into `cell`-pixel grid cells at `zoom`. Deterministic:
/// cells are emitted in key order and centroids are member averages.
pub fn cluster_points(points: &[PointRecord], zoom: u8, cell: u32) -> Vec<Cluster> {
    let cell = cell.max(1) as f64;
    let mut cells: BTreeMap<(i64, i64), (f64, f64, usize, Category)> = BTreeMap::new();

    for point in points {
        let (gx, gy) = world_pixel(point.lat(), point.lon(), zoom);
        let key = ((gx / cell).floor() as i64, (gy / cell).floor() as i64);
        let entry = cells.entry(key).or_insert((0.0, 0.0, 0, point.category));
        entry.0 += gx;
        entry.1 += gy;
        entry.2 += 1;
    }

    cells
        .into_values()
        .map(|(sx, sy, count, category)| Cluster {
            world: (sx / count as f64, sy / count as f64),
            count,
            category,
        })
        .collect()
}

/// Pre-renders the overlay pyramid for every display mode into
/// `tile_dir/{mode}/{z}/{x}/{y}.png`. Fully transparent tiles are skipped.
pub fn generate_tiles(config: &AppConfig, points: &[PointRecord]) -> Result<()> {
    if points.is_empty() {
        info!("No points loaded, nothing to render");
        return Ok(());
    }

    info!(
        "Generating tiles from min_zoom {} to max_zoom {}...",
        config.render.min_zoom, config.render.max_zoom
    );

    for mode in DisplayMode::ALL {
        let mut backend = RasterBackend::new(&config.style, &config.render);
        let handle = backend.attach(mode, points);
        info!("Rendering mode: {}", mode);

        (config.render.min_zoom..=config.render.max_zoom)
            .into_par_iter()
            .try_for_each(|zoom| render_zoom_level(config, &backend, handle, mode, zoom, points))?;
    }

    Ok(())
}

fn render_zoom_level(
    config: &AppConfig,
    backend: &RasterBackend,
    handle: LayerId,
    mode: DisplayMode,
    zoom: u8,
    points: &[PointRecord],
) -> Result<()> {
    let ((x0, y0), (x1, y1)) = tile_bounds(points, zoom);
    let z_dir = config.render.tile_dir.join(mode.as_str()).join(zoom.to_string());

    for tx in x0..=x1 {
        for ty in y0..=y1 {
            let Some(img) = backend.render_tile(handle, zoom, tx, ty) else { continue };
            if img.pixels().all(|p| p[3] == 0) {
                continue;
            }
            let x_dir = z_dir.join(tx.to_string());
            fs::create_dir_all(&x_dir)
                .with_context(|| format!("Failed to create tile directory: {:?}", x_dir))?;
            let path = x_dir.join(format!("{}.png", ty));
            img.save(&path).with_context(|| format!("Failed to save tile {:?}", path))?;
        }
    }

    Ok(())
}

/// Inclusive tile range covering every point at `zoom`, padded by one tile so
/// discs spilling over an edge still get drawn.
fn tile_bounds(points: &[PointRecord], zoom: u8) -> ((u32, u32), (u32, u32)) {
    let max_tile = (1u32 << zoom) - 1;
    let mut min = (u32::MAX, u32::MAX);
    let mut max = (0u32, 0u32);

    for point in points {
        let (tx, ty) = tile_for(point.lat(), point.lon(), zoom);
        min.0 = min.0.min(tx);
        min.1 = min.1.min(ty);
        max.0 = max.0.max(tx);
        max.1 = max.1.max(ty);
    }

    (
        (min.0.saturating_sub(1), min.1.saturating_sub(1)),
        ((max.0 + 1).min(max_tile), (max.1 + 1).min(max_tile)),
    )
}

pub fn tile_for(lat: f64, lon: f64, zoom: u8) -> (u32, u32) {
    let (gx, gy) = world_pixel(lat, lon, zoom);
    let max_tile = (1u32 << zoom) - 1;
    (
        ((gx / TILE_SIZE as f64) as u32).min(max_tile),
        ((gy / TILE_SIZE as f64) as u32).min(max_tile),
    )
}

// Coordinate conversions
fn world_pixel(lat: f64, lon: f64, zoom: u8) -> (f64, f64) {
    let n = 2.0_f64.powi(zoom as i32);
    let x = (lon + 180.0) / 360.0 * n * TILE_SIZE as f64;
    let lat_rad = lat.to_radians();
    let y = (1.0 - (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() / PI) / 2.0 * n * TILE_SIZE as f64;
    (x, y)
}

fn fill_disc(img: &mut RgbaImage, cx: f64, cy: f64, radius: f64, color: Rgba<u8>) {
    let x0 = (cx - radius).floor().max(0.0) as u32;
    let x1 = (cx + radius).ceil().min(TILE_SIZE as f64 - 1.0) as u32;
    let y0 = (cy - radius).floor().max(0.0) as u32;
    let y1 = (cy + radius).ceil().min(TILE_SIZE as f64 - 1.0) as u32;

    for py in y0..=y1 {
        for px in x0..=x1 {
            let d2 = (px as f64 - cx).powi(2) + (py as f64 - cy).powi(2);
            if d2 <= radius * radius {
                img.put_pixel(px, py, color);
            }
        }
    }
}

/// Blue → cyan → green → yellow → red ramp, alpha scaled by intensity.
fn heat_color(t: f64) -> Rgba<u8> {
    const STOPS: [(f64, [f64; 3]); 5] = [
        (0.0, [0.0, 0.0, 255.0]),
        (0.25, [0.0, 255.0, 255.0]),
        (0.5, [0.0, 255.0, 0.0]),
        (0.75, [255.0, 255.0, 0.0]),
        (1.0, [255.0, 0.0, 0.0]),
    ];

    let t = t.clamp(0.0, 1.0);
    let mut rgb = STOPS[STOPS.len() - 1].1;
    for window in STOPS.windows(2) {
        let (t0, c0) = window[0];
        let (t1, c1) = window[1];
        if t <= t1 {
            let f = if t1 > t0 { (t - t0) / (t1 - t0) } else { 0.0 };
            rgb = [
                c0[0] + (c1[0] - c0[0]) * f,
                c0[1] + (c1[1] - c0[1]) * f,
                c0[2] + (c1[2] - c0[2]) * f,
            ];
            break;
        }
    }

    Rgba([rgb[0] as u8, rgb[1] as u8, rgb[2] as u8, (t * 255.0) as u8])
}

pub fn hex_to_rgba(hex: &str) -> Rgba<u8> {
    let hex = hex.trim_start_matches('#');
    let r = u8::from_str_radix(hex.get(0..2).unwrap_or("00"), 16).unwrap_or(0);
    let g = u8::from_str_radix(hex.get(2..4).unwrap_or("00"), 16).unwrap_or(0);
    let b = u8::from_str_radix(hex.get(4..6).unwrap_or("00"), 16).unwrap_or(0);
    Rgba([r, g, b, 255])
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Point;

    fn record(lat: f64, lon: f64, category: Category) -> PointRecord {
        PointRecord { position: Point::new(lon, lat), label: String::new(), category }
    }

    fn backend() -> RasterBackend {
        RasterBackend::new(&StyleConfig::default(), &test_render_config())
    }

    fn test_render_config() -> RenderConfig {
        RenderConfig {
            tile_dir: "tiles".into(),
            min_zoom: 0,
            max_zoom: 4,
            heatmap_radius: 10,
            heatmap_blur: 5,
            cluster_cell: 64,
        }
    }

    #[test]
    fn world_pixel_maps_the_origin_to_the_tile_center() {
        let (x, y) = world_pixel(0.0, 0.0, 0);
        assert!((x - 128.0).abs() < 1e-9);
        assert!((y - 128.0).abs() < 1e-9);

        let (x, y) = world_pixel(0.0, 0.0, 1);
        assert!((x - 256.0).abs() < 1e-9);
        assert!((y - 256.0).abs() < 1e-9);
    }

    #[test]
    fn hex_parsing() {
        assert_eq!(hex_to_rgba("#ff0000"), Rgba([255, 0, 0, 255]));
        assert_eq!(hex_to_rgba("00ff7f"), Rgba([0, 255, 127, 255]));
        assert_eq!(hex_to_rgba("#xyz"), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn marker_tile_is_painted_where_the_point_falls() {
        let mut backend = backend();
        let points = vec![record(-9.6, -35.7, Category::Lodging)];
        let handle = backend.attach(DisplayMode::Markers, &points);

        let zoom = 8;
        let (tx, ty) = tile_for(-9.6, -35.7, zoom);
        let img = backend.render_tile(handle, zoom, tx, ty).unwrap();
        assert!(img.pixels().any(|p| p[3] != 0), "marker tile is empty");

        // A tile on the other side of the world stays transparent.
        let far = backend.render_tile(handle, zoom, (tx + 128) % 256, ty).unwrap();
        assert!(far.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn detached_layer_no_longer_renders() {
        let mut backend = backend();
        let points = vec![record(-9.6, -35.7, Category::Student)];
        let handle = backend.attach(DisplayMode::Markers, &points);
        assert_eq!(backend.layer_count(), 1);

        backend.detach(handle);
        assert_eq!(backend.layer_count(), 0);
        assert!(backend.render_tile(handle, 8, 0, 0).is_none());
    }

    #[test]
    fn heatmap_density_peaks_at_the_point() {
        let mut backend = backend();
        let points = vec![record(-9.6, -35.7, Category::Student)];
        let handle = backend.attach(DisplayMode::Heatmap, &points);

        let zoom = 8;
        let (tx, ty) = tile_for(-9.6, -35.7, zoom);
        let img = backend.render_tile(handle, zoom, tx, ty).unwrap();

        let (gx, gy) = world_pixel(-9.6, -35.7, zoom);
        let px = (gx - tx as f64 * 256.0) as u32;
        let py = (gy - ty as f64 * 256.0) as u32;
        let center_alpha = img.get_pixel(px, py)[3];
        let edge_alpha = img.get_pixel((px + 100) % 256, py)[3];
        assert!(center_alpha > edge_alpha);
        assert!(center_alpha > 0);
    }

    #[test]
    fn nearby_points_share_a_cluster_cell() {
        let points = vec![
            record(-9.6000, -35.7000, Category::Student),
            record(-9.6001, -35.7001, Category::Lodging),
            record(9.0, 35.0, Category::Beneficiary),
        ];
        let clusters = cluster_points(&points, 6, 64);
        assert_eq!(clusters.len(), 2);
        let big = clusters.iter().find(|c| c.count == 2).expect("merged cluster");
        let single = clusters.iter().find(|c| c.count == 1).unwrap();
        assert_eq!(single.category, Category::Beneficiary);

        // Centroid sits between the two members.
        let a = world_pixel(-9.6000, -35.7000, 6);
        let b = world_pixel(-9.6001, -35.7001, 6);
        assert!(big.world.0 >= a.0.min(b.0) && big.world.0 <= a.0.max(b.0));
    }

    #[test]
    fn high_zoom_splits_clusters_apart() {
        let points = vec![
            record(-9.60, -35.70, Category::Student),
            record(-9.65, -35.75, Category::Student),
        ];
        let low = cluster_points(&points, 4, 64);
        let high = cluster_points(&points, 14, 64);
        assert_eq!(low.len(), 1);
        assert_eq!(high.len(), 2);
    }

    #[test]
    fn tile_bounds_pad_by_one_tile() {
        let points = vec![record(-9.6, -35.7, Category::Student)];
        let zoom = 8;
        let (tx, ty) = tile_for(-9.6, -35.7, zoom);
        let ((x0, y0), (x1, y1)) = tile_bounds(&points, zoom);
        assert_eq!((x0, y0), (tx - 1, ty - 1));
        assert_eq!((x1, y1), (tx + 1, ty + 1));
    }
}
