//! Core domain model for the visa wait-time and bulletin pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "vtrack-core";

/// One gazetteer row. Several records may share `ascii_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityRecord {
    pub city_name: String,
    pub ascii_name: String,
    pub country: String,
    pub iso2: String,
    pub lat: f64,
    pub lng: f64,
    pub population: Option<f64>,
}

impl CityRecord {
    /// Population used for ranking; unknown sorts below every known value.
    pub fn population_rank(&self) -> f64 {
        self.population.unwrap_or(f64::NEG_INFINITY)
    }
}

/// Fixed visa-category vocabulary for wait-time columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisaCategory {
    PetitionBasedWorkers,
    StudentExchange,
    CrewTransit,
    Visitors,
}

impl VisaCategory {
    pub const ALL: [VisaCategory; 4] = [
        VisaCategory::PetitionBasedWorkers,
        VisaCategory::StudentExchange,
        VisaCategory::CrewTransit,
        VisaCategory::Visitors,
    ];

    /// Column name used in the published artifact.
    pub fn column_name(self) -> &'static str {
        match self {
            VisaCategory::PetitionBasedWorkers => "Petition-Based Temporary Workers (H, L, O, P, Q)",
            VisaCategory::StudentExchange => "Student/Exchange Visitors (F, M, J)",
            VisaCategory::CrewTransit => "Crew and Transit (C, D, C1/D)",
            VisaCategory::Visitors => "Visitors (B1/B2)",
        }
    }
}

/// Declared revision of the wait-time page's cell phrasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitTimeFormat {
    /// `"12 Days"`, `"Same Day"`, closure phrases.
    #[default]
    DayCount,
    /// `"2 months. Please ..."` with an `"NA"` sentinel.
    MonthToken,
}

impl WaitTimeFormat {
    pub fn version_tag(self) -> &'static str {
        match self {
            WaitTimeFormat::DayCount => "v1-day-count",
            WaitTimeFormat::MonthToken => "v2-month-token",
        }
    }
}

pub const NA_TOKEN: &str = "NA";

/// Normalized wait-time cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WaitValue {
    Days(f64),
    Token(String),
    Unknown,
}

impl WaitValue {
    pub fn days(&self) -> Option<f64> {
        match self {
            WaitValue::Days(d) => Some(*d),
            _ => None,
        }
    }

    /// Cell text as written to tabular artifacts; `None` is a null cell.
    pub fn artifact_text(&self) -> Option<String> {
        match self {
            WaitValue::Days(d) => Some(format!("{d}")),
            WaitValue::Token(t) => Some(t.clone()),
            WaitValue::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitTimeRecord {
    pub city_post: String,
    pub waits: BTreeMap<VisaCategory, WaitValue>,
    pub asof_date: NaiveDate,
    pub update_date: Option<NaiveDate>,
}

/// How a raw city name was matched against the gazetteer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPass {
    Direct,
    Alias,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedWaitTimeRecord {
    pub record: WaitTimeRecord,
    pub ascii_name: String,
    pub country: String,
    pub iso2: String,
    pub lat: f64,
    pub lng: f64,
    pub match_pass: MatchPass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableId {
    A,
    B,
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableId::A => f.write_str("a"),
            TableId::B => f.write_str("b"),
        }
    }
}

/// Bulletin cell: a cutoff date or one of the textual sentinels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PriorityDate {
    Date(NaiveDate),
    Current,
    Unavailable,
    Unrecognized(String),
}

impl PriorityDate {
    pub fn iso(&self) -> Option<String> {
        match self {
            PriorityDate::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            _ => None,
        }
    }
}

pub const CHARGEABILITY_AREAS: [&str; 5] = [
    "All Chargeability Areas Except Those Listed",
    "CHINA-mainland born",
    "INDIA",
    "MEXICO",
    "PHILIPPINES",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaPriorityDate {
    pub area: String,
    pub priority_date: PriorityDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulletinRecord {
    pub employment_type: String,
    pub dates: Vec<AreaPriorityDate>,
    pub table_id: TableId,
}

impl BulletinRecord {
    pub fn date_for(&self, area: &str) -> Option<&PriorityDate> {
        self.dates
            .iter()
            .find(|d| d.area == area)
            .map(|d| &d.priority_date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulletinSnapshot {
    pub title: String,
    pub source_url: String,
    pub records: Vec<BulletinRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingQueueRecord {
    pub receipt_month: NaiveDate,
    pub remaining_requests_h1b: Option<u64>,
    pub remaining_requests_perm: Option<u64>,
}

impl ProcessingQueueRecord {
    pub fn receipt_month_label(&self) -> String {
        self.receipt_month.format("%Y-%m").to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub review_priority_date: String,
    pub average_processing_days: u32,
    pub as_of_label: String,
}

/// Where and when an artifact's raw input came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_id: String,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
}

/// Row-level data-quality issue; never fatal to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataQualityWarning {
    UnresolvedCity {
        city_post: String,
        closest_gazetteer_name: Option<String>,
    },
    UnparseableWaitCell {
        city_post: String,
        category: VisaCategory,
        raw: String,
    },
    DroppedColumn {
        header: String,
    },
    MissingUpdateDate {
        url: String,
    },
    UnrecognizedPriorityDate {
        employment_type: String,
        area: String,
        table_id: TableId,
        raw: String,
    },
    UnparseableQueueRow {
        series: String,
        cells: Vec<String>,
    },
    DuplicateQueueMonth {
        series: String,
        receipt_month: String,
    },
    SkippedGazetteerRows {
        count: usize,
    },
}

impl fmt::Display for DataQualityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataQualityWarning::UnresolvedCity {
                city_post,
                closest_gazetteer_name,
            } => match closest_gazetteer_name {
                Some(closest) => write!(f, "unresolved city `{city_post}` (closest: `{closest}`)"),
                None => write!(f, "unresolved city `{city_post}`"),
            },
            DataQualityWarning::UnparseableWaitCell {
                city_post,
                category,
                raw,
            } => write!(
                f,
                "unparseable wait cell `{raw}` for {city_post} / {}",
                category.column_name()
            ),
            DataQualityWarning::DroppedColumn { header } => {
                write!(f, "dropped non-category column `{header}`")
            }
            DataQualityWarning::MissingUpdateDate { url } => {
                write!(f, "no `Last updated:` stamp found on {url}")
            }
            DataQualityWarning::UnrecognizedPriorityDate {
                employment_type,
                area,
                table_id,
                raw,
            } => write!(
                f,
                "unrecognized priority date `{raw}` in table {table_id} ({employment_type} / {area})"
            ),
            DataQualityWarning::UnparseableQueueRow { series, cells } => {
                write!(f, "unparseable {series} queue row {cells:?}")
            }
            DataQualityWarning::DuplicateQueueMonth {
                series,
                receipt_month,
            } => write!(f, "duplicate {series} receipt month {receipt_month}; kept first"),
            DataQualityWarning::SkippedGazetteerRows { count } => {
                write!(f, "skipped {count} malformed gazetteer rows")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn city(pop: Option<f64>) -> CityRecord {
        CityRecord {
            city_name: "Springfield".into(),
            ascii_name: "Springfield".into(),
            country: "United States".into(),
            iso2: "US".into(),
            lat: 39.8,
            lng: -89.6,
            population: pop,
        }
    }

    #[test]
    fn unknown_population_ranks_below_zero() {
        assert!(city(None).population_rank() < city(Some(0.0)).population_rank());
    }

    #[test]
    fn wait_value_artifact_text() {
        assert_eq!(WaitValue::Days(5.0).artifact_text().as_deref(), Some("5"));
        assert_eq!(WaitValue::Days(2.5).artifact_text().as_deref(), Some("2.5"));
        assert_eq!(WaitValue::Token(NA_TOKEN.into()).artifact_text().as_deref(), Some("NA"));
        assert_eq!(WaitValue::Unknown.artifact_text(), None);
    }

    #[test]
    fn sentinel_priority_dates_have_no_iso_form() {
        let date = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        assert_eq!(PriorityDate::Date(date).iso().as_deref(), Some("2023-01-01"));
        assert_eq!(PriorityDate::Current.iso(), None);
        assert_eq!(PriorityDate::Unavailable.iso(), None);
    }

    #[test]
    fn warnings_serialize_with_kind_tag() {
        let warning = DataQualityWarning::DroppedColumn {
            header: "Average".into(),
        };
        let json = serde_json::to_value(&warning).unwrap();
        assert_eq!(json["kind"], "dropped_column");
        assert_eq!(json["header"], "Average");
    }

    #[test]
    fn wait_time_format_deserializes_from_kebab_case() {
        let format: WaitTimeFormat = serde_json::from_str("\"month-token\"").unwrap();
        assert_eq!(format, WaitTimeFormat::MonthToken);
        assert_eq!(WaitTimeFormat::default().version_tag(), "v1-day-count");
    }
}
