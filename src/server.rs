use crate::config::AppConfig;
use crate::geocode::{GeocodeOutcome, Geocoder};
use crate::layers::MapView;
use crate::render::RasterBackend;
use crate::types::{Category, DisplayMode, PointRecord};
use crate::view::{CategoryFlags, ViewState};
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use geo::Point;
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

// Wrapper for RTree indexing into the raw point list.
struct IndexedPoint {
    position: [f64; 2],
    index: usize,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.position[0] - point[0];
        let dy = self.position[1] - point[1];
        dx * dx + dy * dy
    }
}

pub struct AppState {
    view: RwLock<MapView<RasterBackend>>,
    tree: RTree<IndexedPoint>,
    geocoder: Geocoder,
    config: AppConfig,
}

#[derive(Serialize)]
struct PointDto {
    lat: f64,
    lon: f64,
    label: String,
    category: Category,
}

impl PointDto {
    fn from_record(record: &PointRecord) -> Self {
        PointDto {
            lat: record.lat(),
            lon: record.lon(),
            label: record.label.clone(),
            category: record.category,
        }
    }
}

#[derive(Serialize)]
struct StateDto {
    mode: DisplayMode,
    flags: CategoryFlags,
    center: CenterDto,
    zoom: u8,
    tile_url: String,
    visible_count: usize,
    total_count: usize,
}

#[derive(Serialize)]
struct CenterDto {
    lat: f64,
    lon: f64,
}

fn state_dto(view: &MapView<RasterBackend>, config: &AppConfig) -> StateDto {
    let state = view.state();
    StateDto {
        mode: state.mode,
        flags: state.flags,
        center: CenterDto { lat: state.center.y(), lon: state.center.x() },
        zoom: state.zoom,
        tile_url: config.map.tile_url.clone(),
        visible_count: view.visible_points().len(),
        total_count: view.raw_points().len(),
    }
}

pub async fn start_server(
    config: AppConfig,
    points: Vec<PointRecord>,
    client: reqwest::Client,
) -> Result<()> {
    info!("Building spatial index for {} points...", points.len());
    let tree = RTree::bulk_load(
        points
            .iter()
            .enumerate()
            .map(|(index, p)| IndexedPoint { position: [p.lon(), p.lat()], index })
            .collect(),
    );

    let backend = RasterBackend::new(&config.style, &config.render);
    let initial = ViewState::new(
        Point::new(config.map.center_lon, config.map.center_lat),
        config.map.zoom,
    );
    let view = MapView::new(backend, points, initial);
    let geocoder = Geocoder::new(client, &config.geocoder);

    let port = config.server.port;
    let static_dir = config.server.static_dir.clone();
    let state = Arc::new(AppState { view: RwLock::new(view), tree, geocoder, config });

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting server on http://{}", addr);

    let app = Router::new()
        .route("/api/state", get(state_handler))
        .route("/api/points", get(points_handler))
        .route("/api/mode", post(mode_handler))
        .route("/api/visibility", post(visibility_handler))
        .route("/api/center", post(center_handler))
        .route("/api/geocode", get(geocode_handler))
        .route("/api/query", get(query_handler))
        .route("/tiles/:mode/:z/:x/:y", get(tile_handler))
        .nest_service("/", ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn state_handler(State(state): State<Arc<AppState>>) -> Json<StateDto> {
    let view = state.view.read().await;
    Json(state_dto(&view, &state.config))
}

async fn points_handler(State(state): State<Arc<AppState>>) -> Json<Vec<PointDto>> {
    let view = state.view.read().await;
    Json(view.visible_points().iter().map(PointDto::from_record).collect())
}

#[derive(Deserialize)]
struct ModeRequest {
    mode: DisplayMode,
}

async fn mode_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ModeRequest>,
) -> Json<StateDto> {
    let mut view = state.view.write().await;
    view.set_mode(req.mode);
    Json(state_dto(&view, &state.config))
}

#[derive(Deserialize)]
struct VisibilityRequest {
    category: Category,
    visible: bool,
}

async fn visibility_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VisibilityRequest>,
) -> Json<StateDto> {
    let mut view = state.view.write().await;
    view.set_visibility(req.category, req.visible);
    Json(state_dto(&view, &state.config))
}

#[derive(Deserialize)]
struct CenterRequest {
    lat: f64,
    lon: f64,
}

async fn center_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CenterRequest>,
) -> Result<Json<StateDto>, (StatusCode, String)> {
    let mut view = state.view.write().await;
    view.set_center(req.lat, req.lon)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(state_dto(&view, &state.config)))
}

#[derive(Deserialize)]
struct GeocodeParams {
    q: String,
}

#[derive(Serialize)]
struct GeocodeError {
    error: String,
}

async fn geocode_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GeocodeParams>,
) -> Result<Json<CenterDto>, (StatusCode, Json<GeocodeError>)> {
    if params.q.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(GeocodeError { error: "empty address".to_string() }),
        ));
    }

    match state.geocoder.search(&params.q).await {
        Ok(GeocodeOutcome::Found(point)) => {
            let mut view = state.view.write().await;
            // The outcome was validated by the geocoder, so this cannot fail
            // for a Nominatim hit; a bad hit is surfaced instead of applied.
            if let Err(e) = view.set_center(point.y(), point.x()) {
                return Err((
                    StatusCode::BAD_GATEWAY,
                    Json(GeocodeError { error: e.to_string() }),
                ));
            }
            Ok(Json(CenterDto { lat: point.y(), lon: point.x() }))
        }
        // Not-found leaves the current center untouched.
        Ok(GeocodeOutcome::NotFound) => Err((
            StatusCode::NOT_FOUND,
            Json(GeocodeError { error: "address not found".to_string() }),
        )),
        Err(e) => {
            error!("Geocoding failed: {:#}", e);
            Err((
                StatusCode::BAD_GATEWAY,
                Json(GeocodeError { error: "geocoding failed".to_string() }),
            ))
        }
    }
}

#[derive(Deserialize)]
struct QueryParams {
    lat: f64,
    lon: f64,
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Option<PointDto>> {
    let view = state.view.read().await;
    let flags = view.state().flags;

    // Nearest raw point whose category is currently visible.
    let hit = state
        .tree
        .nearest_neighbor_iter(&[params.lon, params.lat])
        .map(|candidate| &view.raw_points()[candidate.index])
        .find(|record| flags.enabled(record.category));

    Json(hit.map(PointDto::from_record))
}

async fn tile_handler(
    State(state): State<Arc<AppState>>,
    Path((mode, z, x, y)): Path<(String, u8, u32, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mode: DisplayMode = mode
        .parse()
        .map_err(|_| (StatusCode::NOT_FOUND, format!("unknown display mode: {}", mode)))?;
    let y: u32 = y
        .strip_suffix(".png")
        .unwrap_or(&y)
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "bad tile coordinate".to_string()))?;

    let view = state.view.read().await;
    if view.state().mode != mode {
        // Only the active display mode has a layer attached.
        return Err((StatusCode::NOT_FOUND, format!("{} layer is not attached", mode)));
    }

    let img = view
        .overlay()
        .and_then(|handle| view.backend().render_tile(*handle, z, x, y))
        .ok_or_else(|| (StatusCode::NOT_FOUND, "no layer attached".to_string()))?;

    let mut buf = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("tile encoding failed: {}", e)))?;

    Ok(([(header::CONTENT_TYPE, "image/png")], buf))
}
