//! Visa bulletin: current-bulletin link discovery and employment-based date tables.

use chrono::NaiveDate;
use scraper::Html;
use tracing::info;
use vtrack_core::{
    AreaPriorityDate, BulletinRecord, BulletinSnapshot, DataQualityWarning, PriorityDate, TableId,
    CHARGEABILITY_AREAS,
};
use vtrack_storage::{FetchRequest, PageSource};

use crate::{
    clean_text, element_text, extract_tables, fetch_page, selector, AdapterContext, AdapterError,
    HtmlTable,
};

pub const SOURCE_ID: &str = "visa-bulletin";
pub const LINK_SELECTOR: &str = "a.btn.btn-lg.btn-success";

/// Columns of an employment-based sub-table: category label + one per chargeability area.
const EMPLOYMENT_TABLE_WIDTH: usize = 1 + CHARGEABILITY_AREAS.len();
const EMPLOYMENT_SIGNATURE: &str = "employment";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulletinLink {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct BulletinExtract {
    pub snapshot: BulletinSnapshot,
    pub warnings: Vec<DataQualityWarning>,
}

pub async fn fetch_bulletin(
    source: &dyn PageSource,
    ctx: &AdapterContext,
    index_url: &str,
) -> Result<BulletinExtract, AdapterError> {
    let index = fetch_page(source, ctx, SOURCE_ID, &FetchRequest::get(index_url)).await?;
    let link = find_current_bulletin_link(index_url, &index.text())?;
    info!(url = %link.url, title = %link.title, "following current bulletin link");

    let page = fetch_page(source, ctx, SOURCE_ID, &FetchRequest::get(&link.url)).await?;
    parse_bulletin_page(&link, &page.text())
}

/// The styled "current bulletin" button. With two candidates (monthly + supplemental)
/// the second one wins when it carries an href.
pub fn find_current_bulletin_link(index_url: &str, html: &str) -> Result<BulletinLink, AdapterError> {
    let document = Html::parse_document(html);
    let link_sel = selector(LINK_SELECTOR)?;
    let candidates = document.select(&link_sel).collect::<Vec<_>>();

    let chosen = match candidates.as_slice() {
        [_, second] if second.value().attr("href").is_some() => Some(*second),
        [first, ..] => Some(*first),
        [] => None,
    };

    let not_found = || AdapterError::BulletinLinkNotFound {
        url: index_url.to_string(),
        selector: LINK_SELECTOR.to_string(),
    };
    let anchor = chosen.ok_or_else(not_found)?;
    let href = anchor
        .value()
        .attr("href")
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(not_found)?;

    Ok(BulletinLink {
        url: resolve_href(index_url, href),
        title: format!("Visa Bulletin for {}", element_text(anchor)),
    })
}

/// Resolve a site-relative href against the origin of `base`.
pub fn resolve_href(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    let scheme_end = base.find("://").map(|i| i + 3).unwrap_or(0);
    let (scheme, rest) = base.split_at(scheme_end);
    if let Some(stripped) = href.strip_prefix("//") {
        let scheme = if scheme.is_empty() { "https://" } else { scheme };
        return format!("{scheme}{stripped}");
    }
    let host = rest.split('/').next().unwrap_or_default();
    if href.starts_with('/') {
        format!("{scheme}{host}{href}")
    } else {
        format!("{scheme}{host}/{href}")
    }
}

/// Classify a bulletin cell. `C` and `U` are the source's own sentinels.
pub fn parse_priority_date(token: &str) -> PriorityDate {
    let token = clean_text(token);
    match token.to_ascii_uppercase().as_str() {
        "C" | "CURRENT" => return PriorityDate::Current,
        "U" | "UNAVAILABLE" => return PriorityDate::Unavailable,
        _ => {}
    }
    ["%d%b%y", "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&token, fmt).ok())
        .map(PriorityDate::Date)
        .unwrap_or(PriorityDate::Unrecognized(token))
}

/// ISO form of a bulletin cell, or `None` for anything that is not a date.
pub fn normalize_bulletin_date(token: &str) -> Option<String> {
    parse_priority_date(token).iso()
}

fn is_employment_table(table: &HtmlTable) -> bool {
    let header = table.header();
    header.len() == EMPLOYMENT_TABLE_WIDTH
        && header
            .first()
            .is_some_and(|h| h.to_ascii_lowercase().starts_with(EMPLOYMENT_SIGNATURE))
}

pub fn parse_bulletin_page(link: &BulletinLink, html: &str) -> Result<BulletinExtract, AdapterError> {
    let document = Html::parse_document(html);
    let tables = extract_tables(&document)?;
    let employment = tables
        .iter()
        .filter(|t| is_employment_table(t))
        .collect::<Vec<_>>();

    let [table_a, table_b, ..] = employment.as_slice() else {
        return Err(AdapterError::BulletinTableShape {
            url: link.url.clone(),
            expected: format!(
                "two employment-based sub-tables ({EMPLOYMENT_TABLE_WIDTH} columns, first header `Employment-based`) among {} tables",
                tables.len()
            ),
            found: employment.len(),
        });
    };

    let mut warnings = Vec::new();
    let mut records = Vec::new();
    for (table, table_id) in [(*table_a, TableId::A), (*table_b, TableId::B)] {
        records.extend(parse_employment_table(table, table_id, &mut warnings));
    }
    records.sort_by(|a, b| {
        a.employment_type
            .cmp(&b.employment_type)
            .then(a.table_id.cmp(&b.table_id))
    });

    info!(records = records.len(), "parsed employment-based bulletin tables");
    Ok(BulletinExtract {
        snapshot: BulletinSnapshot {
            title: link.title.clone(),
            source_url: link.url.clone(),
            records,
        },
        warnings,
    })
}

fn parse_employment_table(
    table: &HtmlTable,
    table_id: TableId,
    warnings: &mut Vec<DataQualityWarning>,
) -> Vec<BulletinRecord> {
    let mut records = Vec::new();
    for row in table.body() {
        let Some(employment_type) = row.first().map(|c| clean_text(c)).filter(|c| !c.is_empty())
        else {
            continue;
        };
        let dates = CHARGEABILITY_AREAS
            .iter()
            .enumerate()
            .map(|(i, area)| {
                let raw = row.get(i + 1).map(String::as_str).unwrap_or_default();
                let priority_date = parse_priority_date(raw);
                if let PriorityDate::Unrecognized(raw) = &priority_date {
                    warnings.push(DataQualityWarning::UnrecognizedPriorityDate {
                        employment_type: employment_type.clone(),
                        area: area.to_string(),
                        table_id,
                        raw: raw.clone(),
                    });
                }
                AreaPriorityDate {
                    area: area.to_string(),
                    priority_date,
                }
            })
            .collect();
        records.push(BulletinRecord {
            employment_type,
            dates,
            table_id,
        });
    }
    records
}
