//! World-cities reference archive: integrity check, member selection, CSV decode.

use std::io::{Cursor, Read};

use serde::Deserialize;
use tracing::{debug, info, warn};
use vtrack_core::{CityRecord, DataQualityWarning};
use vtrack_storage::{FetchRequest, PageSource};

use crate::{fetch_page, AdapterContext, AdapterError};

pub const SOURCE_ID: &str = "gazetteer";
pub const DEFAULT_MEMBER: &str = "worldcities.csv";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ARCHIVE_CONTENT_TYPES: [&str; 3] = [
    "application/zip",
    "application/x-zip-compressed",
    "application/octet-stream",
];

#[derive(Debug, Clone)]
pub struct Gazetteer {
    pub cities: Vec<CityRecord>,
    pub member: String,
    pub warnings: Vec<DataQualityWarning>,
}

#[derive(Debug, Deserialize)]
struct GazetteerRow {
    city: String,
    city_ascii: String,
    lat: f64,
    lng: f64,
    country: String,
    #[serde(default)]
    iso2: String,
    #[serde(default)]
    population: Option<f64>,
}

pub async fn load_gazetteer(
    source: &dyn PageSource,
    ctx: &AdapterContext,
    request: &FetchRequest,
    member_name: &str,
) -> Result<Gazetteer, AdapterError> {
    let response = fetch_page(source, ctx, SOURCE_ID, request).await?;
    parse_gazetteer_archive(
        &response.final_url,
        response.content_type.as_deref(),
        &response.body,
        member_name,
    )
}

fn declared_as_archive(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| {
            let mime = ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
            ARCHIVE_CONTENT_TYPES.contains(&mime.as_str())
        })
        .unwrap_or(false)
}

/// Reject payloads that are neither declared nor signed as a zip archive
/// (typically an HTML error page served with a 200).
pub fn verify_archive_payload(
    url: &str,
    content_type: Option<&str>,
    bytes: &[u8],
) -> Result<(), AdapterError> {
    let declared = declared_as_archive(content_type);
    let signed = bytes.starts_with(ZIP_MAGIC);
    if !declared && !signed {
        let leading_bytes = bytes
            .iter()
            .take(4)
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        return Err(AdapterError::FetchIntegrity {
            url: url.to_string(),
            content_type: content_type.map(ToString::to_string),
            leading_bytes,
        });
    }
    if declared != signed {
        warn!(url, ?content_type, signed, "archive content-type and signature disagree");
    }
    Ok(())
}

/// Preferred member if present, else the first `.csv` entry in archive order.
pub fn select_member(names: &[String], preferred: &str) -> Option<String> {
    if names.iter().any(|n| n == preferred) {
        return Some(preferred.to_string());
    }
    names
        .iter()
        .find(|n| n.to_ascii_lowercase().ends_with(".csv"))
        .cloned()
}

pub fn parse_gazetteer_archive(
    url: &str,
    content_type: Option<&str>,
    bytes: &[u8],
    member_name: &str,
) -> Result<Gazetteer, AdapterError> {
    verify_archive_payload(url, content_type, bytes)?;

    let structure_err = |reason: String| AdapterError::ArchiveStructure {
        url: url.to_string(),
        reason,
    };

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| structure_err(format!("cannot open zip: {e}")))?;

    let mut names = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| structure_err(format!("cannot read entry {index}: {e}")))?;
        names.push(entry.name().to_string());
    }
    debug!(?names, "gazetteer archive entries");

    let member = select_member(&names, member_name).ok_or_else(|| {
        structure_err(format!(
            "neither `{member_name}` nor any `.csv` entry present (entries: {names:?})"
        ))
    })?;
    if member != member_name {
        warn!(expected = member_name, using = %member, "gazetteer member name changed upstream");
    }

    let mut data = Vec::new();
    archive
        .by_name(&member)
        .map_err(|e| structure_err(format!("cannot open `{member}`: {e}")))?
        .read_to_end(&mut data)
        .map_err(|e| structure_err(format!("cannot decompress `{member}`: {e}")))?;

    let (cities, skipped) = parse_gazetteer_csv(&data[..])?;
    if cities.is_empty() {
        return Err(structure_err(format!("`{member}` contains no city rows")));
    }

    let mut warnings = Vec::new();
    if skipped > 0 {
        warn!(skipped, "skipped malformed gazetteer rows");
        warnings.push(DataQualityWarning::SkippedGazetteerRows { count: skipped });
    }
    info!(cities = cities.len(), %member, "gazetteer loaded");

    Ok(Gazetteer {
        cities,
        member,
        warnings,
    })
}

/// Decode the world-cities CSV. Returns the records and the number of rows skipped.
pub fn parse_gazetteer_csv(reader: impl Read) -> Result<(Vec<CityRecord>, usize), AdapterError> {
    let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let mut cities = Vec::new();
    let mut skipped = 0usize;
    for row in csv_reader.deserialize::<GazetteerRow>() {
        match row {
            Ok(row) => cities.push(CityRecord {
                city_name: row.city,
                ascii_name: row.city_ascii,
                country: row.country,
                iso2: row.iso2,
                lat: row.lat,
                lng: row.lng,
                population: row.population,
            }),
            Err(err) => {
                debug!(error = %err, "skipping gazetteer row");
                skipped += 1;
            }
        }
    }
    Ok((cities, skipped))
}
