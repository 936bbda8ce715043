//! Environmental layer loading: GeoTIFF decoding plus directory and tar/tar.gz sources.
//!
//! Archives are streamed entry by entry; only entries whose file stem matches a
//! requested layer are decoded. A layer `bio_1` matches `bio_1.tif` and any
//! `<prefix>_bio_1.tif` (WorldClim ships `wc2.1_10m_bio_1.tif`).

use std::fs;
use std::io::{self, Cursor, Read, Seek};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::{info, warn};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

use crate::config::LayerSourceConfig;
use crate::error::{Result, SdmError};
use crate::raster::{Grid, RasterLayer, RasterStack};

// ── GeoTIFF tags ──────────────────────────────────────────────────────────────

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GDAL_NODATA: u16 = 42113;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const RASTER_PIXEL_IS_POINT: u16 = 2;

/// True when the GeoKey directory declares PixelIsPoint. Absent keys mean PixelIsArea.
fn pixel_is_point(geo_keys: &[u16]) -> bool {
    // Header is four shorts; each entry is (key, location, count, value).
    geo_keys
        .get(4..)
        .unwrap_or_default()
        .chunks_exact(4)
        .any(|e| e[0] == GT_RASTER_TYPE_GEO_KEY && e[1] == 0 && e[3] == RASTER_PIXEL_IS_POINT)
}

/// Anything that can hand over a set of named layers on one grid.
pub trait LayerSource {
    fn describe(&self) -> String;
    fn load(&self, names: &[String]) -> Result<RasterStack>;
}

/// Build the configured source.
pub fn source_from_config(cfg: &LayerSourceConfig) -> Box<dyn LayerSource> {
    match cfg {
        LayerSourceConfig::Directory { path } => Box::new(GeoTiffDirSource { dir: path.clone() }),
        LayerSourceConfig::Archive { path, url } => Box::new(GeoTiffArchiveSource {
            path: path.clone(),
            url: url.clone(),
        }),
    }
}

fn layer_matches(file_name: &str, name: &str) -> bool {
    let Some(stem) = file_name.strip_suffix(".tif").or_else(|| file_name.strip_suffix(".tiff")) else {
        return false;
    };
    stem == name || stem.ends_with(&format!("_{name}"))
}

/// Decode a single-band north-up GeoTIFF into a layer. Nodata cells become NaN.
/// A PixelIsPoint tiepoint marks a cell centre and is moved to the cell corner.
pub fn decode_geotiff<R: Read + Seek>(reader: R, name: &str, origin: &Path) -> Result<RasterLayer> {
    let terr = |e: tiff::TiffError| SdmError::tiff(origin, e);
    let mut decoder = Decoder::new(reader).map_err(terr)?;
    let (width, height) = decoder.dimensions().map_err(terr)?;
    let (width, height) = (width as usize, height as usize);

    let scale = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE))
        .map_err(|e| SdmError::tiff(origin, format!("missing ModelPixelScale: {e}")))?;
    let tie = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TIEPOINT))
        .map_err(|e| SdmError::tiff(origin, format!("missing ModelTiepoint: {e}")))?;
    if scale.len() < 2 || tie.len() < 6 || scale[0] <= 0.0 || scale[1] <= 0.0 {
        return Err(SdmError::tiff(origin, "unsupported georeferencing (needs north-up pixel scale + tiepoint)"));
    }
    let geo_keys = decoder
        .find_tag_unsigned_vec::<u16>(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY))
        .map_err(terr)?
        .unwrap_or_default();
    let half = if pixel_is_point(&geo_keys) { 0.5 } else { 0.0 };
    // Tiepoint maps raster (i, j) to model (x, y).
    let west = tie[3] - (tie[0] + half) * scale[0];
    let north = tie[4] + (tie[1] + half) * scale[1];
    let grid = Grid::new(width, height, west, north, scale[0], scale[1]);

    let nodata = match decoder.find_tag(Tag::from_u16_exhaustive(GDAL_NODATA)).map_err(terr)? {
        Some(v) => v
            .into_string()
            .ok()
            .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok()),
        None => None,
    };

    let img = decoder.read_image().map_err(terr)?;
    let data: Vec<f32> = match img {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        _ => return Err(SdmError::tiff(origin, "unsupported pixel type")),
    };
    if data.len() != grid.len() {
        return Err(SdmError::tiff(
            origin,
            format!("expected one band of {} cells, decoded {}", grid.len(), data.len()),
        ));
    }

    let data = match nodata {
        Some(nd) => {
            let nd32 = nd as f32;
            data.into_iter().map(|v| if v == nd32 { f32::NAN } else { v }).collect()
        }
        None => data,
    };
    RasterLayer::from_data(name, grid, data)
}

/// Order the decoded layers as requested and check they share one grid.
fn assemble(names: &[String], mut found: Vec<RasterLayer>, source_desc: &str) -> Result<RasterStack> {
    let mut ordered = Vec::with_capacity(names.len());
    for name in names {
        let Some(pos) = found.iter().position(|l| &l.name == name) else {
            return Err(SdmError::MissingLayer { name: name.clone(), source_desc: source_desc.to_string() });
        };
        ordered.push(found.swap_remove(pos));
    }
    RasterStack::from_layers(ordered)
}

// ── Directory source ──────────────────────────────────────────────────────────

pub struct GeoTiffDirSource {
    pub dir: PathBuf,
}

impl LayerSource for GeoTiffDirSource {
    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }

    fn load(&self, names: &[String]) -> Result<RasterStack> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map_err(|e| SdmError::io(&self.dir, e))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        files.sort();

        let mut found = Vec::new();
        for name in names {
            let hit = files.iter().find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| layer_matches(n, name))
            });
            let Some(path) = hit else { continue };
            let file = fs::File::open(path).map_err(|e| SdmError::io(path, e))?;
            found.push(decode_geotiff(io::BufReader::new(file), name, path)?);
            info!("loaded layer {name} from {}", path.display());
        }
        assemble(names, found, &self.describe())
    }
}

// ── Archive source ────────────────────────────────────────────────────────────

pub struct GeoTiffArchiveSource {
    pub path: PathBuf,
    /// Download location used when `path` does not exist yet.
    pub url: Option<String>,
}

impl GeoTiffArchiveSource {
    fn ensure_local(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        match &self.url {
            Some(url) => download_to(url, &self.path),
            None => Err(SdmError::io(
                &self.path,
                io::Error::new(io::ErrorKind::NotFound, "layer archive missing and no url configured"),
            )),
        }
    }

    fn scan<R: Read>(&self, reader: R, names: &[String]) -> Result<Vec<RasterLayer>> {
        let mut archive = tar::Archive::new(reader);
        let mut found = Vec::new();
        let entries = archive.entries().map_err(|e| SdmError::io(&self.path, e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| SdmError::io(&self.path, e))?;
            let entry_path = entry.path().map_err(|e| SdmError::io(&self.path, e))?.into_owned();
            let Some(fname) = entry_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(name) = names.iter().find(|n| layer_matches(fname, n)) else {
                continue;
            };
            if found.iter().any(|l: &RasterLayer| &l.name == name) {
                warn!("duplicate archive entry for layer {name}: {fname} ignored");
                continue;
            }

            // tar entries don't implement Seek; the TIFF decoder needs it.
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).map_err(|e| SdmError::io(&entry_path, e))?;
            let origin = self.path.join(&entry_path);
            found.push(decode_geotiff(Cursor::new(buf), name, &origin)?);
            info!("loaded layer {name} from {fname}");
        }
        Ok(found)
    }
}

impl LayerSource for GeoTiffArchiveSource {
    fn describe(&self) -> String {
        format!("archive {}", self.path.display())
    }

    fn load(&self, names: &[String]) -> Result<RasterStack> {
        self.ensure_local()?;
        let file = fs::File::open(&self.path).map_err(|e| SdmError::io(&self.path, e))?;
        let gzipped = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".gz") || n.ends_with(".tgz"));
        let found = if gzipped {
            self.scan(GzDecoder::new(file), names)?
        } else {
            self.scan(file, names)?
        };
        assemble(names, found, &self.describe())
    }
}

/// Stream `url` to `dest`, creating parent directories.
pub fn download_to(url: &str, dest: &Path) -> Result<()> {
    info!("downloading {url} -> {}", dest.display());
    let mut response = reqwest::blocking::get(url)
        .map_err(|e| SdmError::Http { message: format!("GET {url} failed: {e}") })?;
    let status = response.status();
    if status.as_u16() == 429 {
        return Err(SdmError::RateLimited { source_name: url.to_string() });
    }
    if !status.is_success() {
        return Err(SdmError::Http { message: format!("GET {url} returned {status}") });
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| SdmError::io(parent, e))?;
    }
    // Write to a sibling file first so an interrupted download never looks complete.
    let partial = dest.with_extension("part");
    let mut out = fs::File::create(&partial).map_err(|e| SdmError::io(&partial, e))?;
    response
        .copy_to(&mut out)
        .map_err(|e| SdmError::Http { message: format!("reading body of {url}: {e}") })?;
    fs::rename(&partial, dest).map_err(|e| SdmError::io(dest, e))?;
    Ok(())
}

// ── Test fixtures ─────────────────────────────────────────────────────────────

/// Encode a layer as a single-band f32 GeoTIFF (used by tests across the crate).
#[cfg(test)]
pub(crate) fn encode_geotiff(layer: &RasterLayer, nodata: Option<f32>) -> Vec<u8> {
    encode_geotiff_with_keys(layer, nodata, None)
}

#[cfg(test)]
fn encode_geotiff_with_keys(layer: &RasterLayer, nodata: Option<f32>, geo_keys: Option<&[u16]>) -> Vec<u8> {
    use tiff::encoder::{colortype, TiffEncoder};

    let mut buf = Cursor::new(Vec::new());
    {
        let mut enc = TiffEncoder::new(&mut buf).unwrap();
        let g = layer.grid;
        let mut image = enc
            .new_image::<colortype::Gray32Float>(g.width as u32, g.height as u32)
            .unwrap();
        let scale = [g.cell_width, g.cell_height, 0.0];
        let tie = [0.0, 0.0, 0.0, g.west, g.north, 0.0];
        image
            .encoder()
            .write_tag(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE), &scale[..])
            .unwrap();
        image
            .encoder()
            .write_tag(Tag::from_u16_exhaustive(MODEL_TIEPOINT), &tie[..])
            .unwrap();
        if let Some(keys) = geo_keys {
            image.encoder().write_tag(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY), keys).unwrap();
        }
        let data: Vec<f32> = match nodata {
            Some(nd) => {
                let s = nd.to_string();
                image.encoder().write_tag(Tag::from_u16_exhaustive(GDAL_NODATA), s.as_str()).unwrap();
                layer.data.iter().map(|&v| if v.is_nan() { nd } else { v }).collect()
            }
            None => layer.data.clone(),
        };
        image.write_data(&data).unwrap();
    }
    buf.into_inner()
}
