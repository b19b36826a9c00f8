//! Synthetic batch generator for exercising the pipeline.
//!
//! Produces funnel-shaped sessions (`open → view → cart → purchase`) where
//! not every session reaches the end, with a configurable share of late
//! events (event_time shifted into the past) and of exact duplicate lines
//! (same `event_id`, for exercising dedup downstream).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub rows: usize,
    pub users: i64,
    pub late_rate: f64,
    pub dup_rate: f64,
}

/// Wire-format record; unlike the validated model this carries the
/// generator-side `ingestion_time` the original files had.
#[derive(Debug, Clone, Serialize)]
struct GeneratedRecord {
    event_id: Uuid,
    event_time: DateTime<Utc>,
    ingestion_time: DateTime<Utc>,
    event_name: &'static str,
    user_id: i64,
    session_id: Uuid,
    product_id: Option<i64>,
    price: Option<f64>,
    device: &'static str,
    payload: serde_json::Value,
}

fn pick_device(rng: &mut impl Rng) -> &'static str {
    let roll: f64 = rng.random();
    if roll < 0.55 {
        "web"
    } else if roll < 0.80 {
        "ios"
    } else {
        "android"
    }
}

/// One session funnel: open → view → (cart?) → (purchase?).
fn session_events(
    rng: &mut impl Rng,
    user_id: i64,
    base_ingestion_time: DateTime<Utc>,
    config: &GeneratorConfig,
) -> Vec<GeneratedRecord> {
    let session_id = Uuid::new_v4();
    let device = pick_device(rng);
    let product_id = rng.random_range(1..=5000);

    let do_view = rng.random_bool(0.85);
    let do_cart = do_view && rng.random_bool(0.30);
    let do_purchase = do_cart && rng.random_bool(0.55);

    let mut names = vec!["open"];
    if do_view {
        names.push("view");
    }
    if do_cart {
        names.push("cart");
    }
    if do_purchase {
        names.push("purchase");
    }

    let mut events = Vec::with_capacity(names.len() + 1);
    let mut event_time = base_ingestion_time - Duration::seconds(rng.random_range(0..=30));

    for (step, name) in names.iter().enumerate() {
        event_time += Duration::seconds(rng.random_range(2..=40));

        // Late events land with event_time in the past while the
        // ingestion-side timestamp stays current.
        let is_late = rng.random_bool(config.late_rate.clamp(0.0, 1.0));
        let effective_event_time = if is_late {
            event_time
                - Duration::minutes(rng.random_range(10..=240))
                - Duration::seconds(rng.random_range(0..=59))
        } else {
            event_time
        };

        let price = if *name == "purchase" {
            Some((rng.random_range(5.0..250.0) * 100.0).round() / 100.0)
        } else {
            None
        };

        let record = GeneratedRecord {
            event_id: Uuid::new_v4(),
            event_time: effective_event_time,
            ingestion_time: base_ingestion_time,
            event_name: name,
            user_id,
            session_id,
            product_id: matches!(*name, "view" | "cart" | "purchase").then_some(product_id),
            price,
            device,
            payload: json!({
                "source": "synthetic_generator",
                "is_late": is_late,
                "session_step": step + 1,
            }),
        };
        events.push(record.clone());

        // Exact duplicate of the same event, same event_id.
        if rng.random_bool(config.dup_rate.clamp(0.0, 1.0)) {
            events.push(record);
        }
    }

    events
}

fn generate_records(rng: &mut impl Rng, config: &GeneratorConfig) -> Vec<GeneratedRecord> {
    let mut all = Vec::with_capacity(config.rows);
    while all.len() < config.rows {
        let user_id = rng.random_range(1..=config.users.max(1));
        let ingestion_time = Utc::now();
        all.extend(session_events(rng, user_id, ingestion_time, config));
    }
    all.truncate(config.rows);
    all
}

/// Write one synthetic batch file into `out_dir`, named
/// `events_<UTC stamp>_<rows>.jsonl`. Returns the path and the row count.
pub fn write_batch(out_dir: &Path, config: &GeneratorConfig) -> Result<(PathBuf, usize)> {
    let mut rng = rand::rng();
    let records = generate_records(&mut rng, config);

    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let path = out_dir.join(format!("events_{}_{}.jsonl", stamp, config.rows));

    let mut file = fs::File::create(&path)
        .with_context(|| format!("creating {}", path.display()))?;
    for record in &records {
        let line = serde_json::to_string(record).context("serializing generated record")?;
        writeln!(file, "{line}").with_context(|| format!("writing {}", path.display()))?;
    }
    file.flush()
        .with_context(|| format!("flushing {}", path.display()))?;

    Ok((path, records.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use evlake_core::Event;

    fn test_config(rows: usize) -> GeneratorConfig {
        GeneratorConfig {
            rows,
            users: 10,
            late_rate: 0.2,
            dup_rate: 0.1,
        }
    }

    #[test]
    fn generated_records_pass_validation() {
        let mut rng = rand::rng();
        let records = generate_records(&mut rng, &test_config(50));
        assert_eq!(records.len(), 50);

        for record in &records {
            let line = serde_json::to_string(record).unwrap();
            let event = Event::from_json_line(&line).unwrap();
            assert_eq!(event.event_id, record.event_id);
            if let Some(price) = event.price {
                assert!(price >= 0.0);
            }
        }
    }

    #[test]
    fn batch_file_lands_in_out_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (path, rows) = write_batch(dir.path(), &test_config(25)).unwrap();

        assert!(path.exists());
        assert_eq!(rows, 25);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("events_"));
        assert!(name.ends_with("_25.jsonl"));
    }
}
