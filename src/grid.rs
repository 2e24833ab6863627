use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// Fixed-radius approximation of meters per degree of latitude.
pub const METERS_PER_DEGREE: f64 = 111_320.0;
const COS_GUARD: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lng_min: f64,
    pub lng_max: f64,
}

impl BoundingBox {
    pub fn new(lat_min: f64, lat_max: f64, lng_min: f64, lng_max: f64) -> Self {
        Self {
            lat_min,
            lat_max,
            lng_min,
            lng_max,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        let values = [self.lat_min, self.lat_max, self.lng_min, self.lng_max];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(AppError::Config("bounding box contains non-finite bounds".into()));
        }
        if self.lat_min > self.lat_max || self.lng_min > self.lng_max {
            return Err(AppError::Config(format!(
                "inverted bounding box: lat {}..{}, lng {}..{}",
                self.lat_min, self.lat_max, self.lng_min, self.lng_max
            )));
        }
        if self.lat_min < -90.0 || self.lat_max > 90.0 {
            return Err(AppError::Config("latitude bounds outside -90..90".into()));
        }
        Ok(())
    }

    pub fn contains(&self, point: GridPoint) -> bool {
        point.lat >= self.lat_min
            && point.lat <= self.lat_max
            && point.lng >= self.lng_min
            && point.lng <= self.lng_max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GridPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

pub fn meters_to_lat_degrees(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE
}

/// Longitude degrees shrink toward the poles; the guard keeps the divisor non-zero at ±90°.
pub fn meters_to_lng_degrees(meters: f64, lat: f64) -> f64 {
    meters / (METERS_PER_DEGREE * lat.to_radians().cos().abs() + COS_GUARD)
}

/// Row-major sweep of a bounding box, starting at its minimum corner.
///
/// Coordinates are derived from row/column indices instead of accumulated
/// sums, and a point is emitted only when it is `<=` the max bound on both
/// axes. Rows recompute their longitude step from the row latitude.
#[derive(Debug, Clone)]
pub struct GridPoints {
    bbox: BoundingBox,
    step_m: f64,
    lat_step: f64,
    lng_step: f64,
    row: u64,
    col: u64,
    finished: bool,
}

impl GridPoints {
    pub fn new(bbox: BoundingBox, step_m: f64) -> AppResult<Self> {
        bbox.validate()?;
        if !(step_m.is_finite() && step_m > 0.0) {
            return Err(AppError::Config(format!(
                "grid step must be a positive distance, got {step_m}"
            )));
        }
        Ok(Self {
            bbox,
            step_m,
            lat_step: meters_to_lat_degrees(step_m),
            lng_step: meters_to_lng_degrees(step_m, bbox.lat_min),
            row: 0,
            col: 0,
            finished: false,
        })
    }

    pub fn lat_step(&self) -> f64 {
        self.lat_step
    }

    fn row_lat(&self) -> f64 {
        self.bbox.lat_min + self.row as f64 * self.lat_step
    }
}

impl Iterator for GridPoints {
    type Item = GridPoint;

    fn next(&mut self) -> Option<GridPoint> {
        while !self.finished {
            let lat = self.row_lat();
            if lat > self.bbox.lat_max {
                self.finished = true;
                break;
            }

            let lng = self.bbox.lng_min + self.col as f64 * self.lng_step;
            if lng <= self.bbox.lng_max {
                self.col += 1;
                return Some(GridPoint::new(lat, lng));
            }

            self.row += 1;
            self.col = 0;
            self.lng_step = meters_to_lng_degrees(self.step_m, self.row_lat());
        }
        None
    }
}
