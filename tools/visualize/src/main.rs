//! Renders the suitability map and presence records of a finished run to PNG.
//! Not part of the main pipeline; reads artifacts only.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use habitat_core::cache::{load_csv_rows, load_json};
use habitat_core::occurrence::ObservationPoint;
use habitat_core::pipeline::artifacts;
use habitat_core::raster::RasterLayer;

#[derive(Parser, Debug)]
#[command(name = "visualize", about = "Render suitability.json with presence points as a PNG")]
struct Args {
    /// Directory holding the pipeline artifacts
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Output PNG (default: <data-dir>/suitability.png)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pixels per raster cell
    #[arg(long, default_value = "4")]
    scale: u32,
}

// ── Colour helpers ────────────────────────────────────────────────────────────

/// Cells without a prediction.
const NO_DATA: [u8; 3] = [235, 235, 235];
const PRESENCE: [u8; 3] = [200, 20, 20];

/// Suitability [0, 1] → white-to-green ramp.
fn suitability_rgb(v: f32) -> [u8; 3] {
    if !v.is_finite() {
        return NO_DATA;
    }
    let t = v.clamp(0.0, 1.0);
    let r = (255.0 * (1.0 - t)) as u8;
    let g = (255.0 - 120.0 * t) as u8; // 255 → 135
    let b = (255.0 * (1.0 - t) * 0.8) as u8;
    [r, g, b]
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let scale = args.scale.max(1);

    let map_path = args.data_dir.join(artifacts::SUITABILITY);
    let layer: RasterLayer =
        load_json(&map_path).with_context(|| format!("Cannot read {}", map_path.display()))?;
    let presence_path = args.data_dir.join(artifacts::PRESENCE);
    let presences: Vec<ObservationPoint> = load_csv_rows(&presence_path)
        .with_context(|| format!("Cannot read {}", presence_path.display()))?;

    let g = layer.grid;
    let mut img = image::RgbImage::new(g.width as u32 * scale, g.height as u32 * scale);
    for row in 0..g.height {
        for col in 0..g.width {
            let px = image::Rgb(suitability_rgb(layer.get(row, col)));
            for dy in 0..scale {
                for dx in 0..scale {
                    img.put_pixel(col as u32 * scale + dx, row as u32 * scale + dy, px);
                }
            }
        }
    }

    // Presence dots: a small cross centred on the point's pixel position.
    let mut outside = 0usize;
    for p in &presences {
        let x = (p.lon - g.west) / g.cell_width * scale as f64;
        let y = (g.north - p.lat) / g.cell_height * scale as f64;
        if x < 0.0 || y < 0.0 || x >= img.width() as f64 || y >= img.height() as f64 {
            outside += 1;
            continue;
        }
        let (cx, cy) = (x as i64, y as i64);
        for (dx, dy) in [(0, 0), (-1, 0), (1, 0), (0, -1), (0, 1)] {
            let (px, py) = (cx + dx, cy + dy);
            if px >= 0 && py >= 0 && (px as u32) < img.width() && (py as u32) < img.height() {
                img.put_pixel(px as u32, py as u32, image::Rgb(PRESENCE));
            }
        }
    }
    if outside > 0 {
        log::warn!("{outside} presences fall outside the map extent");
    }

    let out = args.output.unwrap_or_else(|| args.data_dir.join("suitability.png"));
    img.save(&out).with_context(|| format!("Failed to save {}", out.display()))?;
    eprintln!(
        "Wrote {} ({}x{} cells, {} presences)",
        out.display(),
        g.width,
        g.height,
        presences.len() - outside
    );
    Ok(())
}
