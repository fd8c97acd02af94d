//! Parquet snapshot of persisted daily metrics plus a checksum manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use dayledger_core::{DailyMetrics, DailyMetricsRecord};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const METRICS_FILE: &str = "daily_metrics.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub rows: usize,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

type FloatColumn = (&'static str, fn(&DailyMetrics) -> f64);
type IntColumn = (&'static str, fn(&DailyMetrics) -> i64);

const FLOAT_COLUMNS: &[FloatColumn] = &[
    ("revenue", |m| m.revenue),
    ("cogs", |m| m.cogs),
    ("ad_spend", |m| m.ad_spend),
    ("shipping_cost", |m| m.shipping_cost),
    ("gross_profit", |m| m.gross_profit),
    ("gross_profit_margin", |m| m.gross_profit_margin),
    ("net_profit", |m| m.net_profit),
    ("net_profit_margin", |m| m.net_profit_margin),
    ("roas", |m| m.roas),
    ("poas", |m| m.poas),
    ("aov", |m| m.aov),
    ("cpp", |m| m.cpp),
    ("cpc", |m| m.cpc),
    ("ctr", |m| m.ctr),
    ("cpm", |m| m.cpm),
    ("delivery_rate", |m| m.delivery_rate),
    ("rto_rate", |m| m.rto_rate),
    ("ndr_rate", |m| m.ndr_rate),
];

const INT_COLUMNS: &[IntColumn] = &[
    ("order_count", |m| m.order_count),
    ("reach", |m| m.reach),
    ("impressions", |m| m.impressions),
    ("clicks", |m| m.clicks),
    ("new_customers", |m| m.new_customers),
    ("returning_customers", |m| m.returning_customers),
    ("total_shipments", |m| m.total_shipments),
    ("delivered", |m| m.delivered),
    ("in_transit", |m| m.in_transit),
    ("rto", |m| m.rto),
    ("ndr", |m| m.ndr),
];

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

fn metrics_batch(records: &[DailyMetricsRecord]) -> Result<RecordBatch> {
    let mut fields = vec![
        Field::new("user_id", DataType::Utf8, false),
        Field::new("metric_date", DataType::Date32, false),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            records.iter().map(|r| r.metrics.user_id.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(Date32Array::from(
            records.iter().map(|r| days_since_epoch(r.metrics.date)).collect::<Vec<_>>(),
        )),
    ];

    for (name, get) in INT_COLUMNS {
        fields.push(Field::new(*name, DataType::Int64, false));
        columns.push(Arc::new(Int64Array::from(
            records.iter().map(|r| get(&r.metrics)).collect::<Vec<_>>(),
        )));
    }
    for (name, get) in FLOAT_COLUMNS {
        fields.push(Field::new(*name, DataType::Float64, false));
        columns.push(Arc::new(Float64Array::from(
            records.iter().map(|r| get(&r.metrics)).collect::<Vec<_>>(),
        )));
    }

    fields.push(Field::new("campaign_breakdown", DataType::Utf8, false));
    let breakdowns = records
        .iter()
        .map(|r| serde_json::to_string(&r.metrics.campaigns))
        .collect::<Result<Vec<_>, _>>()
        .context("encoding campaign breakdowns")?;
    columns.push(Arc::new(StringArray::from(breakdowns)));

    fields.push(Field::new("fingerprint", DataType::Utf8, false));
    columns.push(Arc::new(StringArray::from(
        records.iter().map(|r| r.fingerprint.as_str()).collect::<Vec<_>>(),
    )));
    fields.push(Field::new("updated_at", DataType::Utf8, false));
    columns.push(Arc::new(StringArray::from(
        records.iter().map(|r| r.updated_at.to_rfc3339()).collect::<Vec<_>>(),
    )));

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).context("building daily metrics record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(out_dir).unwrap_or(path).display().to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Writes `daily_metrics.parquet` and `manifest.json` into `out_dir`,
/// returning the manifest path.
pub fn export_daily_metrics(records: &[DailyMetricsRecord], out_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let parquet_path = out_dir.join(METRICS_FILE);
    write_parquet(&parquet_path, metrics_batch(records)?)?;

    let manifest = ExportManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        rows: records.len(),
        files: vec![manifest_entry("daily_metrics", out_dir, &parquet_path)?],
    };
    let manifest_path = out_dir.join(MANIFEST_FILE);
    let body = serde_json::to_vec_pretty(&manifest).context("encoding export manifest")?;
    std::fs::write(&manifest_path, body).with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}
