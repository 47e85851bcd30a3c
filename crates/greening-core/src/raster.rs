use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Integer land-use/land-cover class identifier.
pub type LulcCode = i32;

#[derive(Error, Debug, PartialEq)]
pub enum RasterError {
    #[error("raster data has {len} cells, expected {width}x{height}")]
    SizeMismatch { len: usize, width: usize, height: usize },
    #[error("shape mismatch: expected {expected:?} (height, width), got {actual:?}")]
    ShapeMismatch { expected: (usize, usize), actual: (usize, usize) },
}

/// GDAL-ordered affine transform:
/// `[x_origin, pixel_width, row_rotation, y_origin, col_rotation, pixel_height]`.
/// `pixel_height` is negative for north-up rasters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub x_origin: f64,
    pub pixel_width: f64,
    pub row_rotation: f64,
    pub y_origin: f64,
    pub col_rotation: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with the upper-left corner at (`west`, `north`).
    pub fn from_origin(west: f64, north: f64, x_size: f64, y_size: f64) -> Self {
        Self {
            x_origin: west,
            pixel_width: x_size,
            row_rotation: 0.0,
            y_origin: north,
            col_rotation: 0.0,
            pixel_height: -y_size,
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            x_origin: gt[0],
            pixel_width: gt[1],
            row_rotation: gt[2],
            y_origin: gt[3],
            col_rotation: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.x_origin,
            self.pixel_width,
            self.row_rotation,
            self.y_origin,
            self.col_rotation,
            self.pixel_height,
        ]
    }

    /// Map coordinates of the centre of cell (`row`, `col`).
    pub fn xy(&self, row: usize, col: usize) -> (f64, f64) {
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (
            self.x_origin + c * self.pixel_width + r * self.row_rotation,
            self.y_origin + c * self.col_rotation + r * self.pixel_height,
        )
    }

    /// Square-pixel resolution in map units (mean of |width| and |height|).
    pub fn resolution(&self) -> f64 {
        (self.pixel_width.abs() + self.pixel_height.abs()) / 2.0
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::from_origin(0.0, 0.0, 1.0, 1.0)
    }
}

/// A single-band LULC raster, row-major, with georeferencing.
///
/// Treated as immutable once loaded: scenario generation always works on
/// copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LulcRaster {
    pub data: Vec<LulcCode>,
    pub width: usize,
    pub height: usize,
    pub nodata: LulcCode,
    pub transform: GeoTransform,
    /// CRS as `"epsg:XXXX"` when known.
    pub crs: Option<String>,
}

impl LulcRaster {
    pub fn new(
        data: Vec<LulcCode>,
        width: usize,
        height: usize,
        nodata: LulcCode,
        transform: GeoTransform,
    ) -> Result<Self, RasterError> {
        if data.len() != width * height {
            return Err(RasterError::SizeMismatch { len: data.len(), width, height });
        }
        Ok(Self { data, width, height, nodata, transform, crs: None })
    }

    /// Raster filled with a single code.
    pub fn filled(width: usize, height: usize, code: LulcCode, nodata: LulcCode) -> Self {
        Self {
            data: vec![code; width * height],
            width,
            height,
            nodata,
            transform: GeoTransform::default(),
            crs: None,
        }
    }

    pub fn with_crs(mut self, crs: impl Into<String>) -> Self {
        self.crs = Some(crs.into());
        self
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> LulcCode {
        self.data[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, code: LulcCode) {
        self.data[row * self.width + col] = code;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// (height, width)
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    #[inline]
    pub fn is_nodata(&self, idx: usize) -> bool {
        self.data[idx] == self.nodata
    }

    pub fn ensure_shape(&self, height: usize, width: usize) -> Result<(), RasterError> {
        if self.shape() != (height, width) {
            return Err(RasterError::ShapeMismatch {
                expected: (height, width),
                actual: self.shape(),
            });
        }
        Ok(())
    }

    /// Copy of this raster (same georeferencing) with `data` swapped in.
    pub fn with_data(&self, data: Vec<LulcCode>) -> Result<Self, RasterError> {
        if data.len() != self.len() {
            return Err(RasterError::SizeMismatch {
                len: data.len(),
                width: self.width,
                height: self.height,
            });
        }
        Ok(Self { data, ..self.clone_meta() })
    }

    fn clone_meta(&self) -> Self {
        Self {
            data: Vec::new(),
            width: self.width,
            height: self.height,
            nodata: self.nodata,
            transform: self.transform,
            crs: self.crs.clone(),
        }
    }

    /// Cell-centre x coordinates, one per column.
    pub fn x_coords(&self) -> Vec<f64> {
        (0..self.width).map(|c| self.transform.xy(0, c).0).collect()
    }

    /// Cell-centre y coordinates, one per row.
    pub fn y_coords(&self) -> Vec<f64> {
        (0..self.height).map(|r| self.transform.xy(r, 0).1).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_wrong_length() {
        let err = LulcRaster::new(vec![1, 2, 3], 2, 2, 0, GeoTransform::default()).unwrap_err();
        assert_eq!(err, RasterError::SizeMismatch { len: 3, width: 2, height: 2 });
    }

    #[test]
    fn get_set_roundtrip() {
        let mut r = LulcRaster::filled(3, 2, 5, 0);
        r.set(1, 2, 9);
        assert_eq!(r.get(1, 2), 9);
        assert_eq!(r.data[5], 9);
        assert_eq!(r.shape(), (2, 3));
    }

    #[test]
    fn cell_centres_follow_transform() {
        let mut r = LulcRaster::filled(2, 2, 1, 0);
        r.transform = GeoTransform::from_origin(100.0, 200.0, 10.0, 10.0);
        assert_eq!(r.x_coords(), vec![105.0, 115.0]);
        assert_eq!(r.y_coords(), vec![195.0, 185.0]);
        assert_eq!(r.transform.resolution(), 10.0);
    }

    #[test]
    fn gdal_roundtrip() {
        let gt = [2_500_000.0, 10.0, 0.0, 1_160_000.0, 0.0, -10.0];
        assert_eq!(GeoTransform::from_gdal(gt).to_gdal(), gt);
    }

    #[test]
    fn with_data_keeps_georeferencing() {
        let r = LulcRaster::filled(2, 1, 1, 0).with_crs("epsg:2056");
        let copy = r.with_data(vec![3, 4]).unwrap();
        assert_eq!(copy.crs.as_deref(), Some("epsg:2056"));
        assert_eq!(copy.data, vec![3, 4]);
        assert!(r.with_data(vec![1]).is_err());
    }
}
