//! Global visa wait-time table: header → category mapping and versioned cell normalization.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use scraper::Html;
use tracing::{debug, info, warn};
use vtrack_core::{DataQualityWarning, VisaCategory, WaitTimeFormat, WaitTimeRecord, WaitValue, NA_TOKEN};
use vtrack_storage::{FetchRequest, PageSource};

use crate::{clean_text, element_text, extract_tables, fetch_page, selector, AdapterContext, AdapterError};

pub const SOURCE_ID: &str = "wait-times";

/// Phrases meaning the post publishes no usable wait time.
pub const CLOSURE_PHRASES: [&str; 3] = [
    "Closed",
    "Non-Visa Processing Post",
    "Emergency Appointments Only",
];

const LEGACY_HEADER_PREFIX: &str = "Interview Required";
const UPDATE_STAMP: &str = "Last updated:";
const UPDATE_CONTAINER: &str = "div.tsg-rwd-text.parbase.section";

/// Normalized parenthesized visa code → category.
pub type CategoryCodes = BTreeMap<String, VisaCategory>;

/// Strip all whitespace so `"(H, L, O, P, Q)"` and `"(H,L,O,P,Q)"` compare equal.
pub fn normalize_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect()
}

/// Code inside the last parenthesized group of a column header.
pub fn category_code(header: &str) -> Option<String> {
    let close = header.rfind(')')?;
    let open = header[..close].rfind('(')?;
    let code = normalize_code(&header[open + 1..close]);
    if code.is_empty() {
        None
    } else {
        Some(code)
    }
}

pub fn classify_header(header: &str, codes: &CategoryCodes) -> Option<VisaCategory> {
    category_code(header).and_then(|code| codes.get(&code).copied())
}

/// Header as the reader sees it, without the legacy `Interview Required` lead-in.
pub fn display_header(header: &str) -> String {
    let cleaned = clean_text(header);
    match cleaned.split_once(LEGACY_HEADER_PREFIX) {
        Some((_, rest)) if !rest.trim().is_empty() => rest.trim().to_string(),
        _ => cleaned,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellParse {
    Value(WaitValue),
    Unparseable,
}

/// Normalize one wait-time cell under the declared page format.
pub fn normalize_cell(format: WaitTimeFormat, raw: &str) -> CellParse {
    let text = clean_text(raw);
    match format {
        WaitTimeFormat::DayCount => normalize_day_count(&text),
        WaitTimeFormat::MonthToken => CellParse::Value(WaitValue::Token(month_token(&text))),
    }
}

fn normalize_day_count(text: &str) -> CellParse {
    if text.is_empty() || CLOSURE_PHRASES.iter().any(|p| text.contains(p)) {
        return CellParse::Value(WaitValue::Unknown);
    }
    if text.contains("Same Day") {
        return CellParse::Value(WaitValue::Days(0.0));
    }
    let lower = text.to_ascii_lowercase();
    let head = match lower.find("day") {
        Some(idx) => text[..idx].trim(),
        None => text,
    };
    match head.replace(',', "").parse::<f64>() {
        Ok(days) if days.is_finite() && days >= 0.0 => CellParse::Value(WaitValue::Days(days)),
        _ => CellParse::Unparseable,
    }
}

fn month_token(text: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let head = match lower.find("month") {
        Some(idx) => &text[..idx],
        None => text,
    };
    // The value is the token right before the unit.
    match head.split_whitespace().last() {
        Some(token) if token.chars().any(|c| c.is_ascii_digit()) => token.to_string(),
        _ => NA_TOKEN.to_string(),
    }
}

/// Category columns kept from a header row, plus the headers deliberately dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryColumns {
    pub columns: Vec<(usize, VisaCategory)>,
    pub dropped: Vec<String>,
}

impl CategoryColumns {
    pub fn classify(header: &[String], codes: &CategoryCodes) -> Self {
        let mut columns = Vec::new();
        let mut dropped = Vec::new();
        for (idx, raw) in header.iter().enumerate().skip(1) {
            match classify_header(raw, codes) {
                Some(category) if !columns.iter().any(|(_, c)| *c == category) => {
                    columns.push((idx, category));
                }
                _ => dropped.push(display_header(raw)),
            }
        }
        Self { columns, dropped }
    }
}

#[derive(Debug, Clone)]
pub struct WaitTimePage {
    pub format: WaitTimeFormat,
    pub update_date: Option<NaiveDate>,
    pub records: Vec<WaitTimeRecord>,
    pub warnings: Vec<DataQualityWarning>,
}

pub async fn fetch_wait_times(
    source: &dyn PageSource,
    ctx: &AdapterContext,
    url: &str,
    codes: &CategoryCodes,
    format: WaitTimeFormat,
) -> Result<WaitTimePage, AdapterError> {
    let response = fetch_page(source, ctx, SOURCE_ID, &FetchRequest::get(url)).await?;
    parse_wait_time_page(url, &response.text(), ctx.asof_date(), codes, format)
}

pub fn parse_wait_time_page(
    url: &str,
    html: &str,
    asof_date: NaiveDate,
    codes: &CategoryCodes,
    format: WaitTimeFormat,
) -> Result<WaitTimePage, AdapterError> {
    let document = Html::parse_document(html);
    let tables = extract_tables(&document)?;
    let table = tables
        .iter()
        .find(|t| {
            t.header()
                .first()
                .is_some_and(|h| h.to_ascii_lowercase().starts_with("city"))
        })
        .ok_or_else(|| AdapterError::WaitTimeTableShape {
            url: url.to_string(),
            expected: format!(
                "a table whose first header cell is `City/Post` ({} tables on page)",
                tables.len()
            ),
        })?;

    let mut warnings = Vec::new();

    let layout = CategoryColumns::classify(table.header(), codes);
    if layout.columns.is_empty() {
        return Err(AdapterError::WaitTimeTableShape {
            url: url.to_string(),
            expected: format!(
                "at least one visa-category column with a known code; headers were {:?}",
                table.header()
            ),
        });
    }
    for header in &layout.dropped {
        debug!(%header, "dropping non-category column");
        warnings.push(DataQualityWarning::DroppedColumn {
            header: header.clone(),
        });
    }

    let update_date = parse_update_date(&document)?;
    if update_date.is_none() {
        warn!(url, "wait-time page carries no parseable update stamp");
        warnings.push(DataQualityWarning::MissingUpdateDate {
            url: url.to_string(),
        });
    }

    let mut records = Vec::new();
    for row in table.body() {
        let Some(city_post) = row.first().map(|c| clean_text(c)).filter(|c| !c.is_empty()) else {
            continue;
        };
        let mut waits = BTreeMap::new();
        for &(idx, category) in &layout.columns {
            let raw = row.get(idx).map(String::as_str).unwrap_or_default();
            let value = match normalize_cell(format, raw) {
                CellParse::Value(value) => value,
                CellParse::Unparseable => {
                    warnings.push(DataQualityWarning::UnparseableWaitCell {
                        city_post: city_post.clone(),
                        category,
                        raw: clean_text(raw),
                    });
                    WaitValue::Unknown
                }
            };
            waits.insert(category, value);
        }
        records.push(WaitTimeRecord {
            city_post,
            waits,
            asof_date,
            update_date,
        });
    }

    info!(
        rows = records.len(),
        format = format.version_tag(),
        "parsed wait-time table"
    );
    Ok(WaitTimePage {
        format,
        update_date,
        records,
        warnings,
    })
}

/// The `Last updated:` stamp from the page's text blocks.
pub fn parse_update_date(document: &Html) -> Result<Option<NaiveDate>, AdapterError> {
    let container_sel = selector(UPDATE_CONTAINER)?;
    let paragraph_sel = selector("p")?;
    for container in document.select(&container_sel) {
        for paragraph in container.select(&paragraph_sel) {
            let text = element_text(paragraph);
            if let Some((_, stamp)) = text.split_once(UPDATE_STAMP) {
                if let Some(date) = parse_us_date(stamp) {
                    return Ok(Some(date));
                }
            }
        }
    }
    Ok(None)
}

const US_DATE_FORMATS: [&str; 7] = [
    "%m-%d-%Y",
    "%m/%d/%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%B %d %Y",
    "%Y-%m-%d",
];

/// Parse the leading date in free text such as `"03-07-2025 (some note)"`.
pub fn parse_us_date(text: &str) -> Option<NaiveDate> {
    let tokens = clean_text(text)
        .split(' ')
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    (1..=tokens.len().min(3)).rev().find_map(|n| {
        let candidate = tokens[..n].join(" ");
        let candidate = candidate.trim_end_matches(&['.', ';'][..]);
        US_DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(candidate, fmt).ok())
    })
}
