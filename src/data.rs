use crate::config::{AppConfig, DatasetSource};
use crate::types::{Category, PointRecord};
use anyhow::{Context, Result};
use geo::Point;
use serde_json::Value;
use tracing::{info, warn};

/// Fetches every configured dataset and concatenates the normalized records
/// in config declaration order.
///
/// Partial-success semantics: a source that fails to fetch or parse is logged
/// and skipped; the map degrades to fewer points rather than failing.
pub async fn load_data(config: &AppConfig, client: &reqwest::Client) -> Vec<PointRecord> {
    info!("Loading {} datasets...", config.datasets.len());

    // One concurrent fetch per source; results are consumed in declaration
    // order so the concatenation is stable.
    let handles: Vec<_> = config
        .datasets
        .iter()
        .cloned()
        .map(|source| {
            let client = client.clone();
            tokio::spawn(async move {
                let result = fetch_dataset(&client, &source).await;
                (source, result)
            })
        })
        .collect();

    let mut points = Vec::new();
    for handle in handles {
        let (source, result) = match handle.await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Dataset fetch task panicked: {}", e);
                continue;
            }
        };
        match result {
            Ok(raw) => {
                let records = normalize_source(&source, &raw);
                info!(
                    "Dataset '{}': {} of {} records usable",
                    source.name,
                    records.len(),
                    raw.len()
                );
                points.extend(records);
            }
            Err(e) => warn!("Dataset '{}' failed, continuing without it: {:#}", source.name, e),
        }
    }

    info!("Loaded {} points total", points.len());
    points
}

async fn fetch_dataset(client: &reqwest::Client, source: &DatasetSource) -> Result<Vec<Value>> {
    let body: Value = client
        .get(&source.url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch dataset: {}", source.url))?
        .error_for_status()
        .with_context(|| format!("Dataset request rejected: {}", source.url))?
        .json()
        .await
        .with_context(|| format!("Failed to parse dataset JSON: {}", source.url))?;

    match body {
        Value::Array(items) => Ok(items),
        _ => {
            warn!("Dataset '{}' payload is not an array, treating as empty", source.name);
            Ok(Vec::new())
        }
    }
}

/// Turns one source's raw records into tagged [`PointRecord`]s, dropping
/// anything without a finite coordinate pair.
pub fn normalize_source(source: &DatasetSource, records: &[Value]) -> Vec<PointRecord> {
    records
        .iter()
        .filter_map(|record| normalize_record(source, record))
        .collect()
}

fn normalize_record(source: &DatasetSource, record: &Value) -> Option<PointRecord> {
    let (lat, lon) = coordinate_pair(record)?;

    let category = match source.category {
        Some(tag) => tag,
        None => infer_category(record).unwrap_or_else(|| {
            // The fallback bucket is student; make the misclassification
            // candidates visible instead of silently absorbing them.
            warn!(
                "Record in '{}' matches no category field, defaulting to student: {}",
                source.name, record
            );
            Category::Student
        }),
    };

    Some(PointRecord {
        position: Point::new(lon, lat),
        label: label_for(record, category),
        category,
    })
}

/// Reads `coordenadas.lat` / `coordenadas.lon`, accepting JSON numbers or
/// numeric strings. `None` for anything missing or non-finite.
fn coordinate_pair(record: &Value) -> Option<(f64, f64)> {
    let coords = record.get("coordenadas")?;
    let lat = numeric_field(coords.get("lat")?)?;
    let lon = numeric_field(coords.get("lon")?)?;
    if lat.is_finite() && lon.is_finite() {
        Some((lat, lon))
    } else {
        None
    }
}

fn numeric_field(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Field-presence inference, used only for sources without an explicit tag:
/// a `nome` field marks a lodging, a `code` field a beneficiary.
fn infer_category(record: &Value) -> Option<Category> {
    if record.get("nome").and_then(Value::as_str).is_some() {
        Some(Category::Lodging)
    } else if record.get("code").is_some() {
        Some(Category::Beneficiary)
    } else {
        None
    }
}

fn label_for(record: &Value, category: Category) -> String {
    match category {
        Category::Lodging => record
            .get("nome")
            .and_then(Value::as_str)
            .unwrap_or("Hospedagem")
            .to_string(),
        Category::Beneficiary => match record.get("code") {
            Some(Value::String(s)) => format!("Beneficiário {}", s),
            Some(Value::Number(n)) => format!("Beneficiário {}", n),
            _ => "Beneficiário".to_string(),
        },
        Category::Student => record
            .get("nome")
            .and_then(Value::as_str)
            .unwrap_or("Aluno")
            .to_string(),
    }
}
