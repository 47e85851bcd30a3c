//! GeoTIFF reading and writing for LULC (integer) and cover/temperature
//! (float) rasters. Georeferencing is carried by the ModelPixelScale and
//! ModelTiepoint tags, the CRS by an EPSG code in the GeoKey directory and
//! nodata by the GDAL_NODATA ASCII tag.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek};
use std::path::Path;

use anyhow::{bail, Context, Result};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::colortype::{ColorType, Gray32Float, GrayI32};
use tiff::encoder::{TiffEncoder, TiffValue};
use tiff::tags::Tag;

use greening_core::raster::{GeoTransform, LulcCode, LulcRaster};

// ── GeoTIFF constants ────────────────────────────────────────────────────────

const GDAL_NODATA: u16 = 42113;
const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
/// EPSG codes handled as geographic (lat/lon) rather than projected.
const GEOGRAPHIC_EPSG: [u16; 3] = [4326, 4258, 4269];

/// Georeferencing read from (or written to) a GeoTIFF.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoInfo {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub crs: Option<String>,
    pub nodata: Option<f64>,
}

/// A decoded float raster (cover fractions, temperatures).
#[derive(Debug, Clone)]
pub struct FloatRaster {
    pub data: Vec<f32>,
    pub info: GeoInfo,
}

// ── Reading ──────────────────────────────────────────────────────────────────

fn open(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    Decoder::new(BufReader::new(file)).with_context(|| format!("{} is not a valid TIFF", path.display()))
}

fn read_geo_info<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<GeoInfo> {
    let (width, height) = decoder.dimensions()?;

    let scale = decoder
        .find_tag(Tag::ModelPixelScaleTag)?
        .map(|v| v.into_f64_vec())
        .transpose()?;
    let tiepoint = decoder
        .find_tag(Tag::ModelTiepointTag)?
        .map(|v| v.into_f64_vec())
        .transpose()?;
    let transform = match (scale, tiepoint) {
        (Some(s), Some(t)) if s.len() >= 2 && t.len() >= 6 => {
            // tiepoint (i, j, k) -> (x, y, z)
            let (sx, sy) = (s[0], s[1]);
            GeoTransform::from_origin(t[3] - t[0] * sx, t[4] + t[1] * sy, sx, sy)
        }
        _ => GeoTransform::default(),
    };

    let crs = decoder
        .find_tag(Tag::GeoKeyDirectoryTag)?
        .map(|v| v.into_u16_vec())
        .transpose()?
        .and_then(|keys| epsg_from_geokeys(&keys))
        .map(|epsg| format!("epsg:{epsg}"));

    let nodata = decoder
        .find_tag(Tag::from_u16_exhaustive(GDAL_NODATA))?
        .map(|v| v.into_string())
        .transpose()?
        .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok());

    Ok(GeoInfo { width: width as usize, height: height as usize, transform, crs, nodata })
}

/// EPSG code from a GeoKey directory (`[version, rev, minor, n, keys...]`).
fn epsg_from_geokeys(keys: &[u16]) -> Option<u16> {
    let n = *keys.get(3)? as usize;
    keys.get(4..4 + 4 * n)?
        .chunks_exact(4)
        .find(|k| (k[0] == PROJECTED_CS_TYPE || k[0] == GEOGRAPHIC_TYPE) && k[1] == 0)
        .map(|k| k[3])
}

fn decoded_to_f64(img: DecodingResult) -> Result<Vec<f64>> {
    Ok(match img {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        #[allow(unreachable_patterns)]
        _ => bail!("Unsupported TIFF sample format"),
    })
}

/// Read a single-band integer LULC GeoTIFF. `nodata` overrides the
/// GDAL_NODATA tag; a file with neither is refused, since every code may be a
/// real class.
pub fn read_lulc(path: &Path, nodata: Option<LulcCode>) -> Result<LulcRaster> {
    let mut decoder = open(path)?;
    let info = read_geo_info(&mut decoder)?;
    let img = decoder
        .read_image()
        .with_context(|| format!("Cannot decode {}", path.display()))?;

    let data: Vec<LulcCode> = match img {
        DecodingResult::I32(v) => v,
        other => {
            let values = decoded_to_f64(other)?;
            if let Some(bad) = values.iter().find(|v| v.fract() != 0.0 || **v > LulcCode::MAX as f64) {
                bail!("{} holds non-integer LULC value {bad}", path.display());
            }
            values.into_iter().map(|v| v as LulcCode).collect()
        }
    };
    let nodata = match (nodata, info.nodata) {
        (Some(v), _) => v,
        (None, Some(v)) => v as LulcCode,
        (None, None) => bail!("{} has no GDAL_NODATA tag, pass the nodata value explicitly", path.display()),
    };
    let mut raster = LulcRaster::new(data, info.width, info.height, nodata, info.transform)
        .with_context(|| format!("Unexpected pixel count in {}", path.display()))?;
    raster.crs = info.crs;
    Ok(raster)
}

/// Read a single-band GeoTIFF as `f32`; nodata cells become NaN.
pub fn read_float(path: &Path) -> Result<FloatRaster> {
    let mut decoder = open(path)?;
    let info = read_geo_info(&mut decoder)?;
    let img = decoder
        .read_image()
        .with_context(|| format!("Cannot decode {}", path.display()))?;
    let nodata = info.nodata;
    let data: Vec<f32> = decoded_to_f64(img)?
        .into_iter()
        .map(|v| if Some(v) == nodata { f32::NAN } else { v as f32 })
        .collect();
    if data.len() != info.width * info.height {
        bail!("Unexpected pixel count in {}", path.display());
    }
    Ok(FloatRaster { data, info })
}

// ── Writing ──────────────────────────────────────────────────────────────────

#[rustfmt::skip]
fn geokeys(crs: Option<&str>) -> Option<Vec<u16>> {
    let epsg: u16 = crs?.to_ascii_lowercase().strip_prefix("epsg:")?.parse().ok()?;
    let (model, key) = if GEOGRAPHIC_EPSG.contains(&epsg) {
        (MODEL_TYPE_GEOGRAPHIC, GEOGRAPHIC_TYPE)
    } else {
        (MODEL_TYPE_PROJECTED, PROJECTED_CS_TYPE)
    };
    Some(vec![
        1, 1, 0, 3,
        GT_MODEL_TYPE, 0, 1, model,
        GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA,
        key, 0, 1, epsg,
    ])
}

fn write_geotiff<C>(path: &Path, info: &GeoInfo, data: &[C::Inner]) -> Result<()>
where
    C: ColorType,
    [C::Inner]: TiffValue,
{
    let t = &info.transform;
    if t.row_rotation != 0.0 || t.col_rotation != 0.0 {
        bail!("Rotated rasters are not supported ({})", path.display());
    }

    let file = File::create(path).with_context(|| format!("Cannot create {}", path.display()))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
    let mut image = encoder.new_image::<C>(info.width as u32, info.height as u32)?;

    let scale = [t.pixel_width, -t.pixel_height, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, t.x_origin, t.y_origin, 0.0];
    image.encoder().write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
    image.encoder().write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
    if let Some(keys) = geokeys(info.crs.as_deref()) {
        image.encoder().write_tag(Tag::GeoKeyDirectoryTag, &keys[..])?;
    }
    if let Some(nodata) = info.nodata {
        let text = if nodata.is_nan() { "nan".to_string() } else { nodata.to_string() };
        image.encoder().write_tag(Tag::from_u16_exhaustive(GDAL_NODATA), text.as_str())?;
    }
    image
        .write_data(data)
        .with_context(|| format!("Cannot write {}", path.display()))?;
    Ok(())
}

pub fn write_lulc(path: &Path, raster: &LulcRaster) -> Result<()> {
    let info = GeoInfo {
        width: raster.width,
        height: raster.height,
        transform: raster.transform,
        crs: raster.crs.clone(),
        nodata: Some(raster.nodata as f64),
    };
    write_geotiff::<GrayI32>(path, &info, &raster.data)
}

/// Write a float raster; NaN is declared as nodata.
pub fn write_float(path: &Path, data: &[f32], info: &GeoInfo) -> Result<()> {
    let info = GeoInfo { nodata: Some(f64::NAN), ..info.clone() };
    write_geotiff::<Gray32Float>(path, &info, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lulc() -> LulcRaster {
        let mut r = LulcRaster::new(
            vec![1, 2, 3, 255, 5, 6],
            3,
            2,
            255,
            GeoTransform::from_origin(2_530_000.0, 1_160_000.0, 10.0, 10.0),
        )
        .unwrap();
        r.crs = Some("epsg:2056".into());
        r
    }

    #[test]
    fn lulc_geotiff_keeps_georeferencing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lulc.tif");
        let src = lulc();
        write_lulc(&path, &src).unwrap();
        let back = read_lulc(&path, None).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn lulc_without_nodata_needs_an_explicit_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadastre.tif");
        let src = lulc();
        let info = GeoInfo { width: 3, height: 2, transform: src.transform, crs: None, nodata: None };
        write_geotiff::<GrayI32>(&path, &info, &[0, 1, 2, 0, 4, 255]).unwrap();

        assert!(read_lulc(&path, None).is_err());
        let back = read_lulc(&path, Some(255)).unwrap();
        assert_eq!(back.nodata, 255);
        assert!(!back.is_nodata(0));
    }

    #[test]
    fn float_nodata_reads_as_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.tif");
        let src = lulc();
        let info = GeoInfo {
            width: 3,
            height: 2,
            transform: src.transform,
            crs: src.crs.clone(),
            nodata: None,
        };
        write_float(&path, &[20.5, f32::NAN, 22.0, 23.0, 24.0, 25.0], &info).unwrap();
        let back = read_float(&path).unwrap();
        assert_eq!(back.info.crs.as_deref(), Some("epsg:2056"));
        assert_eq!(back.data[0], 20.5);
        assert!(back.data[1].is_nan());
    }

    #[test]
    fn geokeys_pick_projected_or_geographic() {
        assert_eq!(epsg_from_geokeys(&geokeys(Some("epsg:2056")).unwrap()), Some(2056));
        let geo = geokeys(Some("EPSG:4326")).unwrap();
        assert!(geo.chunks(4).any(|k| k[0] == GEOGRAPHIC_TYPE && k[3] == 4326));
        assert!(geokeys(Some("+proj=longlat")).is_none());
    }

    #[test]
    fn rotated_rasters_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = lulc();
        src.transform.row_rotation = 0.5;
        assert!(write_lulc(&dir.path().join("r.tif"), &src).is_err());
    }
}
