//! Labor-certification processing times: receipt-queue series and review snapshots.
//!
//! The page is read positionally, but each position is checked against the shape the
//! table is expected to have before any cell is trusted.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vtrack_core::{DataQualityWarning, ProcessingQueueRecord, ReviewSummary};
use vtrack_storage::{FetchRequest, PageSource};

use crate::{clean_text, extract_tables, fetch_page, AdapterContext, AdapterError, HtmlTable};

pub const SOURCE_ID: &str = "processing-times";
pub const ANALYST_REVIEW_LABEL: &str = "Analyst Review";

/// Table positions on the processing-times page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingLayout {
    pub h1b_queue: usize,
    pub perm_queue: usize,
    pub queue_status: usize,
    pub average_time: usize,
}

impl Default for ProcessingLayout {
    fn default() -> Self {
        Self {
            h1b_queue: 3,
            perm_queue: 5,
            queue_status: 6,
            average_time: 7,
        }
    }
}

struct TableGuard {
    name: &'static str,
    exact_columns: Option<usize>,
    header_keywords: &'static [&'static str],
    /// Header cells that mark a different table sharing this one's outline.
    header_forbidden: &'static [&'static str],
    /// When non-empty, the caption or preceding heading must mention one of these.
    heading_any: &'static [&'static str],
    heading_none: &'static [&'static str],
}

const QUEUE_HEADER: &[&str] = &["Remaining"];
const QUEUE_FORBIDDEN: &[&str] = &["Calendar Days", "Average"];
const H1B_MARKERS: &[&str] = &["H-1B", "H1B"];
const PERM_MARKERS: &[&str] = &["PERM"];

const H1B_QUEUE: TableGuard = TableGuard {
    name: "h1b receipt queue",
    exact_columns: Some(2),
    header_keywords: QUEUE_HEADER,
    header_forbidden: QUEUE_FORBIDDEN,
    heading_any: H1B_MARKERS,
    heading_none: PERM_MARKERS,
};

const PERM_QUEUE: TableGuard = TableGuard {
    name: "perm receipt queue",
    exact_columns: Some(2),
    header_keywords: QUEUE_HEADER,
    header_forbidden: QUEUE_FORBIDDEN,
    heading_any: PERM_MARKERS,
    heading_none: H1B_MARKERS,
};

const QUEUE_STATUS: TableGuard = TableGuard {
    name: "perm queue status",
    exact_columns: None,
    header_keywords: &["Processing Queue", "Priority Date"],
    header_forbidden: &[],
    heading_any: &[],
    heading_none: &[],
};

const AVERAGE_TIME: TableGuard = TableGuard {
    name: "perm average processing time",
    exact_columns: None,
    header_keywords: &["Month", "Calendar Days"],
    header_forbidden: &[],
    heading_any: &[],
    heading_none: &[],
};

impl TableGuard {
    fn shape_error(&self, position: usize, expected: String) -> AdapterError {
        AdapterError::ProcessingTableShape {
            table: self.name.to_string(),
            position,
            expected,
        }
    }

    fn select<'a>(&self, tables: &'a [HtmlTable], position: usize) -> Result<&'a HtmlTable, AdapterError> {
        let table = tables.get(position).ok_or_else(|| {
            self.shape_error(position, format!("a table here, page has only {}", tables.len()))
        })?;
        if let Some(columns) = self.exact_columns {
            if table.column_count() != columns {
                return Err(self.shape_error(
                    position,
                    format!("{columns} columns, found header {:?}", table.header()),
                ));
            }
        }
        for keyword in self.header_keywords {
            if table.column_index(keyword).is_none() {
                return Err(self.shape_error(
                    position,
                    format!("header containing `{keyword}`, found {:?}", table.header()),
                ));
            }
        }
        if let Some(keyword) = self
            .header_forbidden
            .iter()
            .find(|k| table.column_index(k).is_some())
        {
            return Err(self.shape_error(
                position,
                format!("no `{keyword}` column, found header {:?}", table.header()),
            ));
        }
        let heading_ok = self.heading_any.is_empty()
            || (self.heading_any.iter().any(|m| table.heading_contains(m))
                && !self.heading_none.iter().any(|m| table.heading_contains(m)));
        if !heading_ok {
            return Err(self.shape_error(
                position,
                format!(
                    "a heading naming one of {:?}, found {:?}",
                    self.heading_any, table.heading
                ),
            ));
        }
        Ok(table)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessingExtract {
    pub queue: Vec<ProcessingQueueRecord>,
    pub review: ReviewSummary,
    pub warnings: Vec<DataQualityWarning>,
}

pub async fn fetch_processing_times(
    source: &dyn PageSource,
    ctx: &AdapterContext,
    url: &str,
    layout: ProcessingLayout,
) -> Result<ProcessingExtract, AdapterError> {
    let response = fetch_page(source, ctx, SOURCE_ID, &FetchRequest::get(url)).await?;
    parse_processing_page(&response.text(), layout)
}

pub fn parse_processing_page(html: &str, layout: ProcessingLayout) -> Result<ProcessingExtract, AdapterError> {
    let document = Html::parse_document(html);
    let tables = extract_tables(&document)?;
    let mut warnings = Vec::new();

    let h1b = read_queue_series(&tables, layout.h1b_queue, &H1B_QUEUE, "h1b", &mut warnings)?;
    let perm = read_queue_series(&tables, layout.perm_queue, &PERM_QUEUE, "perm", &mut warnings)?;
    let queue = outer_join_queues(&h1b, &perm);

    let review_priority_date = read_analyst_review_date(&tables, layout.queue_status)?;
    let (average_processing_days, as_of_label) = read_average_time(&tables, layout.average_time)?;

    info!(
        months = queue.len(),
        %review_priority_date,
        average_processing_days,
        "parsed processing-times page"
    );
    Ok(ProcessingExtract {
        queue,
        review: ReviewSummary {
            review_priority_date,
            average_processing_days,
            as_of_label,
        },
        warnings,
    })
}

/// `"January 2024"` → first day of that month.
pub fn parse_receipt_month(text: &str) -> Option<NaiveDate> {
    let text = clean_text(text);
    ["%d %B %Y", "%d %b %Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&format!("1 {text}"), fmt).ok())
}

/// Request counts, tolerating thousands separators.
pub fn parse_count(text: &str) -> Option<u64> {
    clean_text(text).replace(',', "").parse().ok()
}

fn read_queue_series(
    tables: &[HtmlTable],
    position: usize,
    guard: &TableGuard,
    series: &str,
    warnings: &mut Vec<DataQualityWarning>,
) -> Result<Vec<(NaiveDate, u64)>, AdapterError> {
    let table = guard.select(tables, position)?;
    let Some(first) = table.body().first() else {
        return Err(guard.shape_error(position, "at least one receipt-month row".to_string()));
    };
    if first.first().and_then(|c| parse_receipt_month(c)).is_none() {
        return Err(guard.shape_error(
            position,
            format!("`Month YYYY` receipt months, first row was {first:?}"),
        ));
    }

    let mut seen = BTreeMap::new();
    let mut out = Vec::new();
    for row in table.body() {
        let parsed = match row.as_slice() {
            [month, count, ..] => parse_receipt_month(month).zip(parse_count(count)),
            _ => None,
        };
        let Some((month, count)) = parsed else {
            warnings.push(DataQualityWarning::UnparseableQueueRow {
                series: series.to_string(),
                cells: row.clone(),
            });
            continue;
        };
        if seen.insert(month, count).is_some() {
            warn!(series, %month, "duplicate receipt month");
            warnings.push(DataQualityWarning::DuplicateQueueMonth {
                series: series.to_string(),
                receipt_month: month.format("%Y-%m").to_string(),
            });
            continue;
        }
        out.push((month, count));
    }
    Ok(out)
}

/// Full outer join on receipt month, newest month first.
pub fn outer_join_queues(h1b: &[(NaiveDate, u64)], perm: &[(NaiveDate, u64)]) -> Vec<ProcessingQueueRecord> {
    let mut joined: BTreeMap<NaiveDate, (Option<u64>, Option<u64>)> = BTreeMap::new();
    for (month, count) in h1b {
        joined.entry(*month).or_default().0.get_or_insert(*count);
    }
    for (month, count) in perm {
        joined.entry(*month).or_default().1.get_or_insert(*count);
    }
    joined
        .into_iter()
        .rev()
        .map(|(receipt_month, (h1b, perm))| ProcessingQueueRecord {
            receipt_month,
            remaining_requests_h1b: h1b,
            remaining_requests_perm: perm,
        })
        .collect()
}

fn read_analyst_review_date(tables: &[HtmlTable], position: usize) -> Result<String, AdapterError> {
    let table = QUEUE_STATUS.select(tables, position)?;
    let missing_column = |name: &str| QUEUE_STATUS.shape_error(position, format!("a `{name}` column"));
    let queue_col = table
        .column_index("Processing Queue")
        .ok_or_else(|| missing_column("Processing Queue"))?;
    let date_col = table
        .column_index("Priority Date")
        .ok_or_else(|| missing_column("Priority Date"))?;

    table
        .body()
        .iter()
        .find(|row| {
            row.get(queue_col)
                .is_some_and(|c| clean_text(c).eq_ignore_ascii_case(ANALYST_REVIEW_LABEL))
        })
        .and_then(|row| row.get(date_col))
        .map(|c| clean_text(c))
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            QUEUE_STATUS.shape_error(
                position,
                format!("a row labelled `{ANALYST_REVIEW_LABEL}` with a priority date"),
            )
        })
}

fn read_average_time(tables: &[HtmlTable], position: usize) -> Result<(u32, String), AdapterError> {
    let table = AVERAGE_TIME.select(tables, position)?;
    let month_col = table.column_index("Month");
    let days_col = table.column_index("Calendar Days");
    let first = table.body().first();

    let label = first
        .zip(month_col)
        .and_then(|(row, col)| row.get(col))
        .map(|c| clean_text(c))
        .filter(|c| !c.is_empty());
    let days = first
        .zip(days_col)
        .and_then(|(row, col)| row.get(col))
        .and_then(|c| clean_text(c).replace(',', "").parse::<u32>().ok());

    match (label, days) {
        (Some(label), Some(days)) => Ok((days, label)),
        _ => Err(AVERAGE_TIME.shape_error(
            position,
            format!(
                "a first row with a month label and integral calendar days, found {:?}",
                first
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn table(rows: &[&[&str]]) -> String {
        let mut html = String::from("<table>");
        for (i, row) in rows.iter().enumerate() {
            html.push_str("<tr>");
            let tag = if i == 0 { "th" } else { "td" };
            for cell in row.iter() {
                html.push_str(&format!("<{tag}>{cell}</{tag}>"));
            }
            html.push_str("</tr>");
        }
        html.push_str("</table>");
        html
    }

    fn page(h1b: &[&[&str]], perm: &[&[&str]], status: &[&[&str]], average: &[&[&str]]) -> String {
        page_with_headings("H-1B requests remaining", "PERM requests remaining", h1b, perm, status, average)
    }

    fn page_with_headings(
        h1b_heading: &str,
        perm_heading: &str,
        h1b: &[&[&str]],
        perm: &[&[&str]],
        status: &[&[&str]],
        average: &[&[&str]],
    ) -> String {
        let filler = table(&[&["Filler"], &["x"]]);
        format!(
            "{filler}{filler}{filler}<h3>{h1b_heading}</h3>{}<h2>Notes</h2>{filler}<h3>{perm_heading}</h3>{}{}{}",
            table(h1b),
            table(perm),
            table(status),
            table(average)
        )
    }

    fn status() -> &'static [&'static [&'static str]] {
        &[&["Processing Queue", "Priority Date"], &["Analyst Review", "May 2023"]]
    }

    fn shape_position(html: &str) -> Option<(usize, String)> {
        match parse_processing_page(html, ProcessingLayout::default()) {
            Err(AdapterError::ProcessingTableShape { position, table, .. }) => Some((position, table)),
            _ => None,
        }
    }

    fn good_page() -> String {
        page(
            &[&["Month", "Remaining"], &["February 2024", "1,200"], &["January 2024", "100"]],
            &[&["Receipt Month", "Remaining Requests"], &["January 2024", "40"], &["December 2023", "7"]],
            &[
                &["Processing Queue", "Priority Date"],
                &["Analyst Review", "May 2023"],
                &["Reconsideration Requests to the CO", "August 2024"],
            ],
            &[&["Month", "Calendar Days"], &["March 2025", "489"]],
        )
    }

    #[test]
    fn outer_join_keeps_one_sided_months() {
        let joined = outer_join_queues(&[(month(2024, 1), 100)], &[(month(2024, 2), 50)]);
        assert_eq!(
            joined,
            vec![
                ProcessingQueueRecord {
                    receipt_month: month(2024, 2),
                    remaining_requests_h1b: None,
                    remaining_requests_perm: Some(50),
                },
                ProcessingQueueRecord {
                    receipt_month: month(2024, 1),
                    remaining_requests_h1b: Some(100),
                    remaining_requests_perm: None,
                },
            ]
        );
        assert_eq!(joined[0].receipt_month_label(), "2024-02");
    }

    #[test]
    fn full_page_parses() {
        let extract = parse_processing_page(&good_page(), ProcessingLayout::default()).unwrap();
        let months = extract
            .queue
            .iter()
            .map(|r| r.receipt_month_label())
            .collect::<Vec<_>>();
        assert_eq!(months, vec!["2024-02", "2024-01", "2023-12"]);
        assert_eq!(extract.queue[0].remaining_requests_h1b, Some(1200));
        assert_eq!(extract.queue[1].remaining_requests_perm, Some(40));
        assert_eq!(extract.queue[2].remaining_requests_h1b, None);
        assert_eq!(extract.review.review_priority_date, "May 2023");
        assert_eq!(extract.review.average_processing_days, 489);
        assert_eq!(extract.review.as_of_label, "March 2025");
        assert!(extract.warnings.is_empty());
    }

    #[test]
    fn reordered_tables_fail_with_shape_error() {
        let html = page(
            &[&["Processing Queue", "Priority Date", "Extra"], &["Analyst Review", "May 2023", ""]],
            &[&["Receipt Month", "Remaining Requests"], &["January 2024", "40"]],
            &[&["Processing Queue", "Priority Date"], &["Analyst Review", "May 2023"]],
            &[&["Month", "Calendar Days"], &["March 2025", "489"]],
        );
        let err = parse_processing_page(&html, ProcessingLayout::default()).unwrap_err();
        match err {
            AdapterError::ProcessingTableShape { position, table, .. } => {
                assert_eq!(position, 3);
                assert_eq!(table, "h1b receipt queue");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn average_table_in_a_queue_position_is_rejected() {
        let html = page(
            &[&["Month", "Calendar Days"], &["March 2025", "489"]],
            &[&["Receipt Month", "Remaining Requests"], &["January 2024", "40"]],
            status(),
            &[&["Month", "Calendar Days"], &["March 2025", "489"]],
        );
        assert_eq!(shape_position(&html), Some((3, "h1b receipt queue".to_string())));

        let html = page(
            &[&["Month", "Remaining Average"], &["March 2025", "489"]],
            &[&["Receipt Month", "Remaining Requests"], &["January 2024", "40"]],
            status(),
            &[&["Month", "Calendar Days"], &["March 2025", "489"]],
        );
        assert_eq!(shape_position(&html), Some((3, "h1b receipt queue".to_string())));
    }

    #[test]
    fn label_rows_in_a_queue_position_are_rejected() {
        let html = page(
            &[&["Queue", "Remaining"], &["Analyst Review", "489"]],
            &[&["Receipt Month", "Remaining Requests"], &["January 2024", "40"]],
            status(),
            &[&["Month", "Calendar Days"], &["March 2025", "489"]],
        );
        assert_eq!(shape_position(&html), Some((3, "h1b receipt queue".to_string())));
    }

    #[test]
    fn swapped_queue_series_are_rejected() {
        let html = page_with_headings(
            "PERM requests remaining",
            "H-1B requests remaining",
            &[&["Receipt Month", "Remaining Requests"], &["January 2024", "40"]],
            &[&["Receipt Month", "Remaining Requests"], &["January 2024", "100"]],
            status(),
            &[&["Month", "Calendar Days"], &["March 2025", "489"]],
        );
        assert_eq!(shape_position(&html), Some((3, "h1b receipt queue".to_string())));

        let layout = ProcessingLayout {
            h1b_queue: 5,
            perm_queue: 5,
            ..ProcessingLayout::default()
        };
        let err = parse_processing_page(&good_page(), layout).unwrap_err();
        assert!(matches!(err, AdapterError::ProcessingTableShape { position: 5, .. }), "{err}");
    }

    #[test]
    fn empty_queue_body_is_rejected() {
        let html = page(
            &[&["Receipt Month", "Remaining Requests"], &["January 2024", "100"]],
            &[&["Receipt Month", "Remaining Requests"]],
            status(),
            &[&["Month", "Calendar Days"], &["March 2025", "489"]],
        );
        assert_eq!(shape_position(&html), Some((5, "perm receipt queue".to_string())));
    }

    #[test]
    fn average_days_must_be_whole_numbers() {
        for days in ["489.6", "n/a", "-3", ""] {
            let html = page(
                &[&["Receipt Month", "Remaining Requests"], &["January 2024", "100"]],
                &[&["Receipt Month", "Remaining Requests"], &["January 2024", "40"]],
                status(),
                &[&["Month", "Calendar Days"], &["March 2025", days]],
            );
            assert_eq!(
                shape_position(&html),
                Some((7, "perm average processing time".to_string())),
                "{days:?}"
            );
        }

        let html = page(
            &[&["Receipt Month", "Remaining Requests"], &["January 2024", "100"]],
            &[&["Receipt Month", "Remaining Requests"], &["January 2024", "40"]],
            status(),
            &[&["Month", "Calendar Days"], &["March 2025", "1,024"]],
        );
        let extract = parse_processing_page(&html, ProcessingLayout::default()).unwrap();
        assert_eq!(extract.review.average_processing_days, 1024);
    }

    #[test]
    fn missing_analyst_review_row_is_a_shape_error() {
        let html = page(
            &[&["Month", "Remaining"], &["January 2024", "100"]],
            &[&["Receipt Month", "Remaining Requests"], &["January 2024", "40"]],
            &[&["Processing Queue", "Priority Date"], &["Audit Review", "May 2023"]],
            &[&["Month", "Calendar Days"], &["March 2025", "489"]],
        );
        assert!(matches!(
            parse_processing_page(&html, ProcessingLayout::default()),
            Err(AdapterError::ProcessingTableShape { position: 6, .. })
        ));
    }

    #[test]
    fn too_few_tables_is_a_shape_error() {
        let err = parse_processing_page("<table><tr><td>x</td></tr></table>", ProcessingLayout::default())
            .unwrap_err();
        assert!(matches!(err, AdapterError::ProcessingTableShape { position: 3, .. }));
    }

    #[test]
    fn bad_rows_and_duplicate_months_become_warnings() {
        let html = page(
            &[
                &["Month", "Remaining"],
                &["January 2024", "100"],
                &["January 2024", "90"],
                &["Total", "n/a"],
            ],
            &[&["Receipt Month", "Remaining Requests"], &["January 2024", "40"]],
            &[&["Processing Queue", "Priority Date"], &["Analyst Review", "May 2023"]],
            &[&["Month", "Calendar Days"], &["March 2025", "489"]],
        );
        let extract = parse_processing_page(&html, ProcessingLayout::default()).unwrap();
        assert_eq!(extract.queue.len(), 1);
        assert_eq!(extract.queue[0].remaining_requests_h1b, Some(100));
        assert_eq!(extract.warnings.len(), 2);
    }

    #[test]
    fn receipt_month_and_count_parsing() {
        assert_eq!(parse_receipt_month("January 2024"), Some(month(2024, 1)));
        assert_eq!(parse_receipt_month(" Sep 2023 "), Some(month(2023, 9)));
        assert_eq!(parse_receipt_month("Total"), None);
        assert_eq!(parse_count("12,345"), Some(12_345));
        assert_eq!(parse_count("-"), None);
    }
}
