//! Source extractors: gazetteer archive, wait-time table, visa bulletin, processing times.
//!
//! Each extractor is split into an async `fetch_*` entry point that goes through a
//! [`PageSource`] and a pure `parse_*` function that works on already-fetched bytes,
//! so every stage can be exercised against fixtures.

use chrono::{DateTime, NaiveDate, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use vtrack_storage::{FetchError, FetchRequest, FetchedResponse, PageSource};

pub mod bulletin;
pub mod gazetteer;
pub mod processing;
pub mod wait_times;

pub const CRATE_NAME: &str = "vtrack-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at,
        }
    }

    pub fn asof_date(&self) -> NaiveDate {
        self.fetched_at.date_naive()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("payload from {url} is not a zip archive (content-type {content_type:?}, leading bytes {leading_bytes})")]
    FetchIntegrity {
        url: String,
        content_type: Option<String>,
        leading_bytes: String,
    },
    #[error("archive from {url} is unusable: {reason}")]
    ArchiveStructure { url: String, reason: String },
    #[error("wait-time table not found on {url}: expected {expected}")]
    WaitTimeTableShape { url: String, expected: String },
    #[error("no current-bulletin link on {url} (looked for `{selector}` with an href)")]
    BulletinLinkNotFound { url: String, selector: String },
    #[error("bulletin page {url}: expected {expected}, found {found} matching tables")]
    BulletinTableShape {
        url: String,
        expected: String,
        found: usize,
    },
    #[error("processing-times table `{table}` at position {position}: expected {expected}")]
    ProcessingTableShape {
        table: String,
        position: usize,
        expected: String,
    },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Rows of one `<table>`, header row included, with `colspan` expanded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HtmlTable {
    pub rows: Vec<Vec<String>>,
    /// The table's `<caption>`, else the nearest heading before it in document order.
    pub heading: Option<String>,
}

impl HtmlTable {
    pub fn header(&self) -> &[String] {
        self.rows.first().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn body(&self) -> &[Vec<String>] {
        self.rows.get(1..).unwrap_or(&[])
    }

    pub fn heading_contains(&self, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        self.heading
            .as_deref()
            .is_some_and(|h| h.to_ascii_lowercase().contains(&needle))
    }

    pub fn column_count(&self) -> usize {
        self.header().len()
    }

    /// Header position of `name`: exact (case-insensitive) match first, then substring.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let needle = name.to_ascii_lowercase();
        let header = self.header();
        header
            .iter()
            .position(|h| h.to_ascii_lowercase() == needle)
            .or_else(|| {
                header
                    .iter()
                    .position(|h| h.to_ascii_lowercase().contains(&needle))
            })
    }
}

/// Collapse runs of whitespace (NBSP included) to single spaces and trim.
pub fn clean_text(raw: &str) -> String {
    raw.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("invalid selector `{css}`: {e}")))
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<String>())
}

/// Extract every table in document order, the way a dataframe reader would.
/// Rows belonging to nested tables are attributed to the innermost table only.
pub fn extract_tables(document: &Html) -> Result<Vec<HtmlTable>, AdapterError> {
    let block_sel = selector("h1, h2, h3, h4, h5, h6, table")?;
    let row_sel = selector("tr")?;

    let mut tables = Vec::new();
    let mut last_heading: Option<String> = None;
    for table in document.select(&block_sel) {
        if table.value().name() != "table" {
            last_heading = Some(element_text(table)).filter(|t| !t.is_empty());
            continue;
        }
        let caption = table
            .children()
            .filter_map(ElementRef::wrap)
            .find(|c| c.value().name() == "caption")
            .map(element_text)
            .filter(|t| !t.is_empty());

        let mut rows = Vec::new();
        for row in table.select(&row_sel) {
            let owner = row
                .ancestors()
                .find(|n| n.value().as_element().is_some_and(|e| e.name() == "table"));
            if owner.map(|n| n.id()) != Some(table.id()) {
                continue;
            }

            let mut cells = Vec::new();
            for cell in row.children().filter_map(ElementRef::wrap) {
                if !matches!(cell.value().name(), "td" | "th") {
                    continue;
                }
                let span = cell
                    .value()
                    .attr("colspan")
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(1)
                    .clamp(1, 64);
                let text = element_text(cell);
                cells.extend(std::iter::repeat(text).take(span));
            }
            if !cells.is_empty() {
                rows.push(cells);
            }
        }
        tables.push(HtmlTable {
            rows,
            heading: caption.or_else(|| last_heading.clone()),
        });
    }
    Ok(tables)
}

pub(crate) async fn fetch_page(
    source: &dyn PageSource,
    ctx: &AdapterContext,
    source_id: &str,
    request: &FetchRequest,
) -> Result<FetchedResponse, AdapterError> {
    tracing::info!(source_id, url = %request.url, "fetching");
    Ok(source.fetch(ctx.run_id, source_id, request).await?)
}
