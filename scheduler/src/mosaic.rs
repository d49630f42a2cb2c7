//! Mosaic planning
//!
//! A mosaic covers a large target with a grid of camera fields. Tiles are laid
//! out on the tangent plane at the mosaic centre, spaced by the field of view
//! less the overlap, then rotated by the position angle and projected back to
//! the sky.

use crate::astro::SkyPoint;
use crate::error::{SchedulerError, SchedulerResult};
use crate::job::JobDefinition;
use serde::{Deserialize, Serialize};

/// Grid geometry of a mosaic
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MosaicGrid {
    pub columns: u32,
    pub rows: u32,
    /// Camera field of view, degrees
    pub tile_width_deg: f64,
    pub tile_height_deg: f64,
    /// Overlap between neighbouring tiles, percent of the field
    pub overlap_percent: f64,
    /// Walk odd rows right to left so consecutive tiles stay adjacent
    pub serpentine: bool,
}

impl Default for MosaicGrid {
    fn default() -> Self {
        Self {
            columns: 2,
            rows: 2,
            tile_width_deg: 1.0,
            tile_height_deg: 1.0,
            overlap_percent: 10.0,
            serpentine: false,
        }
    }
}

impl MosaicGrid {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.columns == 0 || self.rows == 0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "mosaic grid must have at least one tile, got {}x{}",
                self.columns, self.rows
            )));
        }
        let fov_ok = |v: f64| v.is_finite() && v > 0.0 && v < 90.0;
        if !fov_ok(self.tile_width_deg) || !fov_ok(self.tile_height_deg) {
            return Err(SchedulerError::InvalidConfig(format!(
                "invalid mosaic tile size {}x{} degrees",
                self.tile_width_deg, self.tile_height_deg
            )));
        }
        if !(0.0..100.0).contains(&self.overlap_percent) {
            return Err(SchedulerError::InvalidConfig(format!(
                "mosaic overlap must be within [0, 100), got {}",
                self.overlap_percent
            )));
        }
        Ok(())
    }
}

/// One field of a mosaic
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MosaicTile {
    /// Position in acquisition order
    pub index: usize,
    pub row: u32,
    pub column: u32,
    pub center: SkyPoint,
    pub position_angle: f64,
}

/// Centres of every tile of `grid` around `center`, rotated by `rotation_deg`
/// (position angle, east of north). Row 0 is the northern edge, column 0 the
/// eastern edge at zero rotation.
pub fn mosaic_tiles(grid: &MosaicGrid, center: SkyPoint, rotation_deg: f64) -> SchedulerResult<Vec<MosaicTile>> {
    grid.validate()?;
    if !rotation_deg.is_finite() {
        return Err(SchedulerError::InvalidConfig("mosaic rotation must be finite".to_string()));
    }

    let keep = 1.0 - grid.overlap_percent / 100.0;
    let step_x = grid.tile_width_deg * keep;
    let step_y = grid.tile_height_deg * keep;
    let half_cols = (grid.columns as f64 - 1.0) / 2.0;
    let half_rows = (grid.rows as f64 - 1.0) / 2.0;
    let (sin_pa, cos_pa) = rotation_deg.to_radians().sin_cos();

    let mut tiles = Vec::with_capacity((grid.columns * grid.rows) as usize);
    for row in 0..grid.rows {
        for step in 0..grid.columns {
            let column = if grid.serpentine && row % 2 == 1 {
                grid.columns - 1 - step
            } else {
                step
            };

            // Offsets on the tangent plane: x towards the east, y towards the north
            let x = (half_cols - column as f64) * step_x;
            let y = (half_rows - row as f64) * step_y;
            let xi = x * cos_pa + y * sin_pa;
            let eta = -x * sin_pa + y * cos_pa;

            tiles.push(MosaicTile {
                index: tiles.len(),
                row,
                column,
                center: deproject(center, xi.to_radians(), eta.to_radians()),
                position_angle: rotation_deg,
            });
        }
    }
    tracing::debug!(
        "Planned {} mosaic tiles around RA {:.4}h Dec {:.4}",
        tiles.len(),
        center.ra_hours,
        center.dec_degrees
    );
    Ok(tiles)
}

/// Inverse gnomonic projection of standard coordinates around `center`
fn deproject(center: SkyPoint, xi: f64, eta: f64) -> SkyPoint {
    let ra0 = center.ra_degrees().to_radians();
    let (sin_d0, cos_d0) = center.dec_degrees.to_radians().sin_cos();

    let denom = cos_d0 - eta * sin_d0;
    let ra = ra0 + xi.atan2(denom);
    let dec = ((sin_d0 + eta * cos_d0) / (1.0 + xi * xi + eta * eta).sqrt()).asin();

    SkyPoint::from_degrees(ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
}

/// One job definition per tile, named after the template
pub fn mosaic_jobs(template: &JobDefinition, tiles: &[MosaicTile]) -> Vec<JobDefinition> {
    tiles
        .iter()
        .map(|tile| JobDefinition {
            name: format!("{}-Part_{}", template.name, tile.index + 1),
            target: tile.center,
            position_angle: Some(tile.position_angle),
            fits_file: None,
            ..template.clone()
        })
        .collect()
}
