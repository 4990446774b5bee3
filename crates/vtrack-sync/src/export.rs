//! In-memory encoders for the published artifacts: CSV tables, parquet snapshots,
//! the snapshot manifest and the run report.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use vtrack_core::{
    BulletinRecord, ProcessingQueueRecord, ResolvedWaitTimeRecord, ReviewSummary, VisaCategory,
    CHARGEABILITY_AREAS,
};
use vtrack_storage::ArtifactStore;

pub const VISA_WAIT_CSV: &str = "visa_wait_times.csv";
pub const VISA_BULLETIN_CSV: &str = "visa_bulletin.csv";
pub const PROCESSING_QUEUE_CSV: &str = "processing_queue.csv";
pub const REVIEW_SUMMARY_JSON: &str = "review_summary.json";
pub const RUN_REPORT_JSON: &str = "run_report.json";
pub const RUN_REPORT_MD: &str = "run_report.md";
pub const SNAPSHOT_DIR: &str = "snapshots";
pub const MANIFEST_JSON: &str = "manifest.json";

/// A fully encoded artifact waiting to be written.
#[derive(Debug, Clone)]
pub struct EncodedArtifact {
    pub name: String,
    pub relative_path: String,
    pub bytes: Vec<u8>,
}

impl EncodedArtifact {
    pub fn new(name: &str, relative_path: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            relative_path: relative_path.into(),
            bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn snapshot_path(file_name: &str) -> String {
    format!("{SNAPSHOT_DIR}/{file_name}")
}

pub fn manifest_for(artifacts: &[EncodedArtifact]) -> SnapshotManifest {
    SnapshotManifest {
        schema_version: 1,
        files: artifacts
            .iter()
            .map(|a| SnapshotManifestFile {
                name: a.name.clone(),
                path: a.relative_path.clone(),
                sha256: ArtifactStore::sha256_hex(&a.bytes),
                bytes: a.bytes.len() as u64,
            })
            .collect(),
    }
}

pub fn visa_wait_columns() -> Vec<String> {
    let mut columns = vec!["asof_date".to_string(), "update_date".to_string()];
    columns.extend(VisaCategory::ALL.iter().map(|c| c.column_name().to_string()));
    columns.extend(["city_post", "country", "iso2", "lat", "lng"].map(String::from));
    columns
}

pub fn visa_bulletin_columns() -> Vec<String> {
    let mut columns = vec!["employment_type".to_string()];
    columns.extend(CHARGEABILITY_AREAS.iter().map(|a| a.to_string()));
    columns.push("table_id".to_string());
    columns
}

pub const PROCESSING_QUEUE_COLUMNS: [&str; 3] = [
    "receipt_month",
    "remaining_requests_h1b",
    "remaining_requests_perm",
];

fn iso(date: chrono::NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn finish_csv(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|e| anyhow!("flushing csv buffer: {}", e.error()))
}

pub fn visa_wait_csv(records: &[ResolvedWaitTimeRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(visa_wait_columns())?;
    for r in records {
        let mut row = vec![
            iso(r.record.asof_date),
            r.record.update_date.map(iso).unwrap_or_default(),
        ];
        for category in VisaCategory::ALL {
            row.push(
                r.record
                    .waits
                    .get(&category)
                    .and_then(|w| w.artifact_text())
                    .unwrap_or_default(),
            );
        }
        row.extend([
            r.record.city_post.clone(),
            r.country.clone(),
            r.iso2.clone(),
            r.lat.to_string(),
            r.lng.to_string(),
        ]);
        writer
            .write_record(&row)
            .with_context(|| format!("writing wait-time row for {}", r.record.city_post))?;
    }
    finish_csv(writer)
}

pub fn visa_bulletin_csv(records: &[BulletinRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(visa_bulletin_columns())?;
    for r in records {
        let mut row = vec![r.employment_type.clone()];
        for area in CHARGEABILITY_AREAS {
            row.push(r.date_for(area).and_then(|d| d.iso()).unwrap_or_default());
        }
        row.push(r.table_id.to_string());
        writer.write_record(&row)?;
    }
    finish_csv(writer)
}

pub fn processing_queue_csv(records: &[ProcessingQueueRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(PROCESSING_QUEUE_COLUMNS)?;
    let count = |v: Option<u64>| v.map(|n| n.to_string()).unwrap_or_default();
    for r in records {
        writer.write_record([
            r.receipt_month_label(),
            count(r.remaining_requests_h1b),
            count(r.remaining_requests_perm),
        ])?;
    }
    finish_csv(writer)
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewSummaryDocument<'a> {
    #[serde(flatten)]
    pub review: &'a ReviewSummary,
    pub bulletin_title: &'a str,
}

pub fn review_summary_json(review: &ReviewSummary, bulletin_title: &str) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(&ReviewSummaryDocument {
        review,
        bulletin_title,
    })
    .context("serializing review summary")
}

fn parquet_bytes(batch: RecordBatch, name: &str) -> Result<Vec<u8>> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .with_context(|| format!("opening parquet writer for {name}"))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch for {name}"))?;
    writer
        .into_inner()
        .with_context(|| format!("closing parquet writer for {name}"))
}

fn utf8(name: &str, nullable: bool) -> ArrowField {
    ArrowField::new(name, DataType::Utf8, nullable)
}

pub fn visa_wait_parquet(records: &[ResolvedWaitTimeRecord]) -> Result<Vec<u8>> {
    let mut fields = vec![utf8("asof_date", false), utf8("update_date", true)];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            records.iter().map(|r| Some(iso(r.record.asof_date))).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records.iter().map(|r| r.record.update_date.map(iso)).collect::<Vec<_>>(),
        )),
    ];
    for category in VisaCategory::ALL {
        fields.push(utf8(category.column_name(), true));
        columns.push(Arc::new(StringArray::from(
            records
                .iter()
                .map(|r| r.record.waits.get(&category).and_then(|w| w.artifact_text()))
                .collect::<Vec<_>>(),
        )));
    }
    let text_columns: [(&str, Vec<&str>); 3] = [
        ("city_post", records.iter().map(|r| r.record.city_post.as_str()).collect()),
        ("country", records.iter().map(|r| r.country.as_str()).collect()),
        ("iso2", records.iter().map(|r| r.iso2.as_str()).collect()),
    ];
    for (name, values) in text_columns {
        fields.push(utf8(name, false));
        columns.push(Arc::new(StringArray::from(values)));
    }
    fields.push(ArrowField::new("lat", DataType::Float64, false));
    columns.push(Arc::new(Float64Array::from(
        records.iter().map(|r| r.lat).collect::<Vec<_>>(),
    )));
    fields.push(ArrowField::new("lng", DataType::Float64, false));
    columns.push(Arc::new(Float64Array::from(
        records.iter().map(|r| r.lng).collect::<Vec<_>>(),
    )));

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("building visa_wait_times record batch")?;
    parquet_bytes(batch, "visa_wait_times")
}

pub fn visa_bulletin_parquet(records: &[BulletinRecord]) -> Result<Vec<u8>> {
    let mut fields = vec![utf8("employment_type", false)];
    let mut columns: Vec<ArrayRef> = vec![Arc::new(StringArray::from(
        records
            .iter()
            .map(|r| Some(r.employment_type.as_str()))
            .collect::<Vec<_>>(),
    ))];
    for area in CHARGEABILITY_AREAS {
        fields.push(utf8(area, true));
        columns.push(Arc::new(StringArray::from(
            records
                .iter()
                .map(|r| r.date_for(area).and_then(|d| d.iso()))
                .collect::<Vec<_>>(),
        )));
    }
    fields.push(utf8("table_id", false));
    columns.push(Arc::new(StringArray::from(
        records
            .iter()
            .map(|r| Some(r.table_id.to_string()))
            .collect::<Vec<_>>(),
    )));

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("building visa_bulletin record batch")?;
    parquet_bytes(batch, "visa_bulletin")
}

pub fn processing_queue_parquet(records: &[ProcessingQueueRecord]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        utf8("receipt_month", false),
        ArrowField::new("remaining_requests_h1b", DataType::UInt64, true),
        ArrowField::new("remaining_requests_perm", DataType::UInt64, true),
    ]));
    let months = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.receipt_month_label()))
            .collect::<Vec<_>>(),
    );
    let h1b = UInt64Array::from(records.iter().map(|r| r.remaining_requests_h1b).collect::<Vec<_>>());
    let perm = UInt64Array::from(records.iter().map(|r| r.remaining_requests_perm).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(schema, vec![Arc::new(months), Arc::new(h1b), Arc::new(perm)])
        .context("building processing_queue record batch")?;
    parquet_bytes(batch, "processing_queue")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use vtrack_core::{AreaPriorityDate, MatchPass, PriorityDate, TableId, WaitTimeRecord, WaitValue};

    fn kuwait() -> ResolvedWaitTimeRecord {
        let mut waits = BTreeMap::new();
        waits.insert(VisaCategory::PetitionBasedWorkers, WaitValue::Days(5.0));
        waits.insert(VisaCategory::StudentExchange, WaitValue::Unknown);
        waits.insert(VisaCategory::CrewTransit, WaitValue::Days(0.0));
        waits.insert(VisaCategory::Visitors, WaitValue::Days(120.0));
        ResolvedWaitTimeRecord {
            record: WaitTimeRecord {
                city_post: "Kuwait".to_string(),
                waits,
                asof_date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
                update_date: None,
            },
            ascii_name: "Kuwait City".to_string(),
            country: "Kuwait".to_string(),
            iso2: "KW".to_string(),
            lat: 29.3697,
            lng: 47.9783,
            match_pass: MatchPass::Alias,
        }
    }

    #[test]
    fn wait_time_csv_has_fixed_column_order_and_blank_unknowns() {
        let text = String::from_utf8(visa_wait_csv(&[kuwait()]).unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "asof_date,update_date,\"Petition-Based Temporary Workers (H, L, O, P, Q)\",\"Student/Exchange Visitors (F, M, J)\",\"Crew and Transit (C, D, C1/D)\",Visitors (B1/B2),city_post,country,iso2,lat,lng"
        );
        assert_eq!(
            lines.next().unwrap(),
            "2025-03-10,,5,,0,120,Kuwait,Kuwait,KW,29.3697,47.9783"
        );
    }

    #[test]
    fn bulletin_csv_nulls_sentinels() {
        let record = BulletinRecord {
            employment_type: "1st".to_string(),
            dates: CHARGEABILITY_AREAS
                .iter()
                .enumerate()
                .map(|(i, area)| AreaPriorityDate {
                    area: area.to_string(),
                    priority_date: if i == 0 {
                        PriorityDate::Current
                    } else {
                        PriorityDate::Date(NaiveDate::from_ymd_opt(2022, 2, 15).unwrap())
                    },
                })
                .collect(),
            table_id: TableId::B,
        };
        let text = String::from_utf8(visa_bulletin_csv(&[record]).unwrap()).unwrap();
        assert_eq!(
            text.lines().nth(1).unwrap(),
            "1st,,2022-02-15,2022-02-15,2022-02-15,2022-02-15,b"
        );
    }

    #[test]
    fn queue_csv_keeps_missing_side_empty() {
        let rows = vec![ProcessingQueueRecord {
            receipt_month: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            remaining_requests_h1b: None,
            remaining_requests_perm: Some(50),
        }];
        let text = String::from_utf8(processing_queue_csv(&rows).unwrap()).unwrap();
        assert_eq!(
            text,
            "receipt_month,remaining_requests_h1b,remaining_requests_perm\n2024-02,,50\n"
        );
    }

    #[test]
    fn parquet_snapshots_carry_magic_and_manifest_hashes_them() {
        let wait = visa_wait_parquet(&[kuwait()]).unwrap();
        assert!(wait.starts_with(b"PAR1"));
        assert!(wait.ends_with(b"PAR1"));
        let queue = processing_queue_parquet(&[]).unwrap();
        assert!(queue.starts_with(b"PAR1"));

        let artifacts = vec![EncodedArtifact::new(
            "visa_wait_times",
            snapshot_path("visa_wait_times.parquet"),
            wait.clone(),
        )];
        let manifest = manifest_for(&artifacts);
        assert_eq!(manifest.files[0].path, "snapshots/visa_wait_times.parquet");
        assert_eq!(manifest.files[0].bytes, wait.len() as u64);
        assert_eq!(manifest.files[0].sha256, ArtifactStore::sha256_hex(&wait));
    }

    #[test]
    fn review_summary_document_flattens_review() {
        let review = ReviewSummary {
            review_priority_date: "May 2023".to_string(),
            average_processing_days: 489,
            as_of_label: "March 2025".to_string(),
        };
        let bytes = review_summary_json(&review, "Visa Bulletin for April 2025").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["average_processing_days"], 489);
        assert_eq!(value["bulletin_title"], "Visa Bulletin for April 2025");
    }
}
