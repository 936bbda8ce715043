//! Presence records: GBIF occurrence search client and local CSV exports.
//!
//! Duplicates (same coordinate, different record) are kept; identity is the
//! source record key.

use std::fs;
use std::path::PathBuf;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::OccurrenceSourceConfig;
use crate::coords::GeoPoint;
use crate::error::{Result, SdmError};

/// GBIF caps `limit` at 300 per request.
const GBIF_PAGE_LIMIT: usize = 300;

/// One presence record as fetched from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationPoint {
    /// Source record key.
    pub key: String,
    pub lon: f64,
    pub lat: f64,
    pub scientific_name: Option<String>,
    pub country: Option<String>,
    pub event_date: Option<String>,
    pub basis_of_record: Option<String>,
}

impl ObservationPoint {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lon, self.lat)
    }
}

pub trait OccurrenceSource {
    fn describe(&self) -> String;
    /// All presence records for `species`. Never returns an empty list.
    fn fetch(&self, species: &str) -> Result<Vec<ObservationPoint>>;
}

pub fn source_from_config(cfg: &OccurrenceSourceConfig) -> Result<Box<dyn OccurrenceSource>> {
    Ok(match cfg {
        OccurrenceSourceConfig::Gbif { endpoint, max_records, require_complete } => {
            let mut client = GbifClient::new(endpoint.clone(), *max_records)?;
            client.require_complete = *require_complete;
            Box::new(client)
        }
        OccurrenceSourceConfig::Csv { path } => Box::new(CsvOccurrenceSource { path: path.clone() }),
    })
}

// ── GBIF ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GbifPage {
    end_of_records: bool,
    /// Records matching the query across all pages.
    #[serde(default)]
    count: Option<usize>,
    #[serde(default)]
    results: Vec<GbifRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GbifRecord {
    key: Option<u64>,
    decimal_longitude: Option<f64>,
    decimal_latitude: Option<f64>,
    scientific_name: Option<String>,
    country: Option<String>,
    event_date: Option<String>,
    basis_of_record: Option<String>,
}

/// Convert a page of records, dropping ones without a key or a usable coordinate.
/// Returns the points and the number dropped.
fn convert_records(records: Vec<GbifRecord>) -> (Vec<ObservationPoint>, usize) {
    let total = records.len();
    let points: Vec<ObservationPoint> = records
        .into_iter()
        .filter_map(|r| {
            let (key, lon, lat) = (r.key?, r.decimal_longitude?, r.decimal_latitude?);
            let p = GeoPoint::new(lon, lat);
            if !p.is_finite() || lon.abs() > 180.0 || lat.abs() > 90.0 {
                return None;
            }
            Some(ObservationPoint {
                key: key.to_string(),
                lon,
                lat,
                scientific_name: r.scientific_name,
                country: r.country,
                event_date: r.event_date,
                basis_of_record: r.basis_of_record,
            })
        })
        .collect();
    let dropped = total - points.len();
    (points, dropped)
}

/// Blocking client for `GET {endpoint}/occurrence/search`.
pub struct GbifClient {
    endpoint: String,
    max_records: usize,
    /// Treat a download cut short by `max_records` as an error.
    pub require_complete: bool,
    client: reqwest::blocking::Client,
}

impl GbifClient {
    pub fn new(endpoint: impl Into<String>, max_records: usize) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("habitat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SdmError::Http { message: format!("Failed to create HTTP client: {e}") })?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            max_records,
            require_complete: false,
            client,
        })
    }

    fn fetch_page(&self, species: &str, offset: usize, limit: usize) -> Result<GbifPage> {
        let url = format!("{}/occurrence/search", self.endpoint);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("scientificName", species),
                ("hasCoordinate", "true"),
                ("hasGeospatialIssue", "false"),
            ])
            .query(&[("offset", offset), ("limit", limit)])
            .send()
            .map_err(|e| SdmError::Http { message: format!("Occurrence request failed: {e}") })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(SdmError::RateLimited { source_name: "GBIF".into() });
        }
        if !status.is_success() {
            return Err(SdmError::Http {
                message: format!("GBIF returned {status} for '{species}' at offset {offset}"),
            });
        }
        let text = response
            .text()
            .map_err(|e| SdmError::Http { message: format!("Failed to read GBIF response: {e}") })?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl OccurrenceSource for GbifClient {
    fn describe(&self) -> String {
        format!("GBIF {}", self.endpoint)
    }

    fn fetch(&self, species: &str) -> Result<Vec<ObservationPoint>> {
        let paged = collect_pages(self.max_records, |offset, limit| self.fetch_page(species, offset, limit))?;
        if paged.dropped > 0 {
            warn!("{} GBIF records without key or valid coordinates skipped", paged.dropped);
        }
        if let Some(available) = paged.truncated_at {
            if self.require_complete {
                return Err(SdmError::Truncated {
                    species: species.to_string(),
                    fetched: paged.fetched,
                    available,
                });
            }
            warn!(
                "record cap {} reached: fetched {} of {available} GBIF records for {species}; the sample is incomplete",
                self.max_records, paged.fetched
            );
        }
        if paged.points.is_empty() {
            return Err(SdmError::NoOccurrences { species: species.to_string() });
        }
        info!("fetched {} occurrence records for {species}", paged.points.len());
        Ok(paged.points)
    }
}

/// Outcome of paging through one occurrence query.
struct Paged {
    points: Vec<ObservationPoint>,
    /// Raw records received, before coordinate filtering.
    fetched: usize,
    dropped: usize,
    /// Records available upstream when `max_records` ended paging early.
    truncated_at: Option<usize>,
}

/// Request pages until GBIF reports the end, an empty page arrives, or
/// `max_records` raw records have been received.
fn collect_pages(
    max_records: usize,
    mut fetch_page: impl FnMut(usize, usize) -> Result<GbifPage>,
) -> Result<Paged> {
    let mut paged = Paged { points: Vec::new(), fetched: 0, dropped: 0, truncated_at: None };
    let mut available = None;
    let mut finished = false;
    while paged.fetched < max_records {
        let limit = GBIF_PAGE_LIMIT.min(max_records - paged.fetched);
        let page = fetch_page(paged.fetched, limit)?;
        let n = page.results.len();
        available = page.count.or(available);
        let (points, d) = convert_records(page.results);
        paged.points.extend(points);
        paged.dropped += d;
        paged.fetched += n;
        if page.end_of_records || n == 0 {
            finished = true;
            break;
        }
    }
    if !finished && available.map_or(true, |a| a > paged.fetched) {
        paged.truncated_at = Some(available.unwrap_or(paged.fetched));
    }
    Ok(paged)
}

// ── CSV export ────────────────────────────────────────────────────────────────

const KEY_COLUMNS: &[&str] = &["gbifID", "key", "occurrenceID"];

/// `recorded` names `species`, ignoring case and any trailing authorship
/// ("Bradypus variegatus Schinz, 1825" matches "Bradypus variegatus").
fn names_species(recorded: &str, species: &str) -> bool {
    let (recorded, species) = (recorded.trim(), species.trim());
    match recorded.get(..species.len()) {
        Some(head) if head.eq_ignore_ascii_case(species) => {
            recorded[species.len()..].is_empty() || recorded[species.len()..].starts_with(' ')
        }
        _ => false,
    }
}

/// Local occurrence export (GBIF simple CSV is tab separated; commas also accepted).
pub struct CsvOccurrenceSource {
    pub path: PathBuf,
}

impl OccurrenceSource for CsvOccurrenceSource {
    fn describe(&self) -> String {
        format!("CSV {}", self.path.display())
    }

    fn fetch(&self, species: &str) -> Result<Vec<ObservationPoint>> {
        let text = fs::read_to_string(&self.path).map_err(|e| SdmError::io(&self.path, e))?;
        let first_line = text.lines().next().unwrap_or_default();
        let delimiter = if first_line.contains('\t') { b'\t' } else { b',' };

        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(text.as_bytes());
        let headers = rdr.headers()?.clone();
        let col = |name: &str| headers.iter().position(|h| h == name);
        let schema_err = |expected: &str| SdmError::SchemaMismatch {
            path: self.path.clone(),
            expected: expected.to_string(),
            found: headers.iter().collect::<Vec<_>>().join(","),
        };

        let key_col = KEY_COLUMNS
            .iter()
            .find_map(|k| col(*k))
            .ok_or_else(|| schema_err("one of gbifID/key/occurrenceID"))?;
        let lon_col = col("decimalLongitude").ok_or_else(|| schema_err("decimalLongitude"))?;
        let lat_col = col("decimalLatitude").ok_or_else(|| schema_err("decimalLatitude"))?;
        let name_col = col("scientificName").or_else(|| col("species"));
        let species_cols: Vec<usize> = ["scientificName", "species"].iter().filter_map(|c| col(*c)).collect();
        let country_col = col("countryCode").or_else(|| col("country"));
        let date_col = col("eventDate");
        let basis_col = col("basisOfRecord");

        let opt = |rec: &csv::StringRecord, c: Option<usize>| {
            c.and_then(|i| rec.get(i)).filter(|s| !s.is_empty()).map(str::to_string)
        };

        let mut out = Vec::new();
        let mut skipped = 0usize;
        let mut other_species = 0usize;
        for rec in rdr.records() {
            let rec = rec?;
            // Rows without any name are kept; named rows must match the requested species.
            let names: Vec<&str> = species_cols.iter().filter_map(|&c| rec.get(c)).filter(|s| !s.is_empty()).collect();
            if !names.is_empty() && !names.iter().any(|n| names_species(n, species)) {
                other_species += 1;
                continue;
            }
            let parsed = (
                rec.get(key_col).filter(|s| !s.is_empty()),
                rec.get(lon_col).and_then(|s| s.trim().parse::<f64>().ok()),
                rec.get(lat_col).and_then(|s| s.trim().parse::<f64>().ok()),
            );
            let (Some(key), Some(lon), Some(lat)) = parsed else {
                skipped += 1;
                continue;
            };
            if !GeoPoint::new(lon, lat).is_finite() || lon.abs() > 180.0 || lat.abs() > 90.0 {
                skipped += 1;
                continue;
            }
            out.push(ObservationPoint {
                key: key.to_string(),
                lon,
                lat,
                scientific_name: opt(&rec, name_col),
                country: opt(&rec, country_col),
                event_date: opt(&rec, date_col),
                basis_of_record: opt(&rec, basis_col),
            });
        }
        if skipped > 0 {
            warn!("{skipped} rows in {} without key or valid coordinates skipped", self.path.display());
        }
        if other_species > 0 {
            info!("{other_species} rows for other species in {} ignored", self.path.display());
        }
        if out.is_empty() {
            return Err(SdmError::NoOccurrences { species: species.to_string() });
        }
        info!("read {} occurrence records from {}", out.len(), self.path.display());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"{
        "offset": 0, "limit": 3, "endOfRecords": true, "count": 3,
        "results": [
            {"key": 101, "decimalLongitude": -65.4, "decimalLatitude": -10.2,
             "scientificName": "Bradypus variegatus Schinz, 1825", "country": "Brazil"},
            {"key": 102, "decimalLatitude": -3.0},
            {"key": 103, "decimalLongitude": -65.4, "decimalLatitude": -10.2,
             "basisOfRecord": "PRESERVED_SPECIMEN"}
        ]
    }"#;

    #[test]
    fn gbif_page_drops_records_without_coordinates() {
        let page: GbifPage = serde_json::from_str(PAGE).unwrap();
        assert!(page.end_of_records);
        let (points, dropped) = convert_records(page.results);
        assert_eq!(dropped, 1);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].key, "101");
        assert_eq!(points[0].country.as_deref(), Some("Brazil"));
    }

    #[test]
    fn gbif_duplicates_are_retained() {
        let page: GbifPage = serde_json::from_str(PAGE).unwrap();
        let (points, _) = convert_records(page.results);
        assert_eq!(points[0].point(), points[1].point());
        assert_ne!(points[0].key, points[1].key);
    }

    /// Pages of `size` records at lon = offset index, `count` available upstream.
    fn page(offset: usize, size: usize, count: usize) -> GbifPage {
        let results = (offset..offset + size)
            .map(|i| GbifRecord {
                key: Some(i as u64),
                decimal_longitude: Some(i as f64 * 0.01),
                decimal_latitude: Some(-1.0),
                scientific_name: None,
                country: None,
                event_date: None,
                basis_of_record: None,
            })
            .collect();
        GbifPage { end_of_records: offset + size >= count, count: Some(count), results }
    }

    #[test]
    fn record_cap_reports_truncation() {
        let mut requests = Vec::new();
        let paged = collect_pages(1000, |offset, limit| {
            requests.push((offset, limit));
            Ok(page(offset, limit, 5400))
        })
        .unwrap();
        assert_eq!(requests, vec![(0, 300), (300, 300), (600, 300), (900, 100)]);
        assert_eq!(paged.points.len(), 1000);
        assert_eq!(paged.fetched, 1000);
        assert_eq!(paged.truncated_at, Some(5400));
    }

    #[test]
    fn paging_to_end_of_records_is_complete() {
        let paged = collect_pages(1000, |offset, limit| Ok(page(offset, limit.min(450 - offset), 450))).unwrap();
        assert_eq!(paged.points.len(), 450);
        assert_eq!(paged.truncated_at, None);

        // Cap equal to the upstream total is not a truncation.
        let paged = collect_pages(300, |offset, limit| {
            let mut p = page(offset, limit, 300);
            p.end_of_records = false;
            Ok(p)
        })
        .unwrap();
        assert_eq!(paged.truncated_at, None);
    }

    #[test]
    fn page_without_end_marker_parses_count() {
        let json = r#"{"offset": 0, "limit": 1, "endOfRecords": false, "count": 5400,
            "results": [{"key": 1, "decimalLongitude": 1.0, "decimalLatitude": 2.0}]}"#;
        let page: GbifPage = serde_json::from_str(json).unwrap();
        assert!(!page.end_of_records);
        assert_eq!(page.count, Some(5400));
        let paged = collect_pages(1, |_, _| serde_json::from_str(json).map_err(SdmError::from)).unwrap();
        assert_eq!(paged.truncated_at, Some(5400));
    }

    #[test]
    fn species_names_match_with_authorship() {
        assert!(names_species("Bradypus variegatus Schinz, 1825", "Bradypus variegatus"));
        assert!(names_species("bradypus variegatus", "Bradypus variegatus"));
        assert!(!names_species("Bradypus variegatusx", "Bradypus variegatus"));
        assert!(!names_species("Bradypus tridactylus", "Bradypus variegatus"));
    }

    #[test]
    fn csv_source_keeps_only_requested_species() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("occ.csv");
        fs::write(
            &path,
            "gbifID,scientificName,decimalLatitude,decimalLongitude\n\
             1,Bradypus variegatus Schinz 1825,-3.5,-60.1\n\
             2,Choloepus hoffmanni,-2.0,-61.0\n\
             3,,4.2,-74.0\n",
        )
        .unwrap();
        let pts = CsvOccurrenceSource { path }.fetch("Bradypus variegatus").unwrap();
        let keys: Vec<&str> = pts.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["1", "3"]);
    }

    #[test]
    fn csv_source_reads_tab_separated_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("occ.tsv");
        fs::write(
            &path,
            "gbifID\tscientificName\tdecimalLatitude\tdecimalLongitude\tcountryCode\n\
             1\tBradypus variegatus\t-3.5\t-60.1\tBR\n\
             2\tBradypus variegatus\t\t-61.0\tBR\n\
             3\tBradypus variegatus\t4.2\t-74.0\tCO\n",
        )
        .unwrap();
        let pts = CsvOccurrenceSource { path }.fetch("Bradypus variegatus").unwrap();
        assert_eq!(pts.len(), 2);
        assert_eq!(pts[1].key, "3");
        assert_eq!(pts[1].lon, -74.0);
        assert_eq!(pts[1].country.as_deref(), Some("CO"));
    }

    #[test]
    fn csv_source_without_coordinate_columns_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("occ.csv");
        fs::write(&path, "key,lon,lat\n1,2,3\n").unwrap();
        let err = CsvOccurrenceSource { path }.fetch("x").unwrap_err();
        assert!(matches!(err, SdmError::SchemaMismatch { .. }));
    }

    #[test]
    fn csv_source_with_no_usable_rows_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("occ.csv");
        fs::write(&path, "key,decimalLongitude,decimalLatitude\n1,,\n").unwrap();
        let err = CsvOccurrenceSource { path }.fetch("Nobody").unwrap_err();
        assert!(matches!(err, SdmError::NoOccurrences { .. }));
    }
}
