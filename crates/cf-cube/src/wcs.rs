use crate::error::{CubeError, Result};

/// One world-coordinate axis: type string plus the reference triplet.
///
/// `crpix` keeps the FITS 1-based convention from the header; the public
/// conversion functions take and return 0-based pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Axis {
    pub ctype: String,
    pub crpix: f64,
    pub crval: f64,
    pub cdelt: f64,
}

impl Axis {
    pub fn new(ctype: &str, crpix: f64, crval: f64, cdelt: f64) -> Self {
        Axis {
            ctype: ctype.to_string(),
            crpix,
            crval,
            cdelt,
        }
    }
}

/// World-coordinate description of a cube: longitude (RA), latitude (DEC)
/// and spectral axis.
///
/// The conversion is linear per axis, with the longitude increment read on
/// the sky (scaled by `cos(dec)` of the point's own latitude). Longitude
/// and latitude are in degrees, the spectral value in the axis' native unit
/// (m/s or Hz).
#[derive(Debug, Clone, PartialEq)]
pub struct Wcs {
    pub lon: Axis,
    pub lat: Axis,
    pub spec: Axis,
}

impl Wcs {
    pub fn new(lon: Axis, lat: Axis, spec: Axis) -> Self {
        Wcs { lon, lat, spec }
    }

    /// Convert a 0-based pixel triplet `[x, y, v]` to `[ra, dec, spec]`.
    pub fn pixel_to_world(&self, pixel: [f64; 3]) -> Result<[f64; 3]> {
        if self.lon.cdelt == 0.0 || self.lat.cdelt == 0.0 || self.spec.cdelt == 0.0 {
            return Err(CubeError::Wcs);
        }

        let dec = self.lat.crval + (pixel[1] + 1.0 - self.lat.crpix) * self.lat.cdelt;
        let cosd = dec.to_radians().cos();
        if cosd == 0.0 {
            return Err(CubeError::Wcs);
        }
        let ra = self.lon.crval + (pixel[0] + 1.0 - self.lon.crpix) * self.lon.cdelt / cosd;
        let spec = self.spec.crval + (pixel[2] + 1.0 - self.spec.crpix) * self.spec.cdelt;

        Ok([ra, dec, spec])
    }

    /// Convert a world triplet `[ra, dec, spec]` to a 0-based pixel triplet.
    pub fn world_to_pixel(&self, world: [f64; 3]) -> Result<[f64; 3]> {
        if self.lon.cdelt == 0.0 || self.lat.cdelt == 0.0 || self.spec.cdelt == 0.0 {
            return Err(CubeError::Wcs);
        }

        let py = (world[1] - self.lat.crval) / self.lat.cdelt + self.lat.crpix - 1.0;
        let cosd = world[1].to_radians().cos();
        if cosd == 0.0 {
            return Err(CubeError::Wcs);
        }
        let px = (world[0] - self.lon.crval) * cosd / self.lon.cdelt + self.lon.crpix - 1.0;
        let pv = (world[2] - self.spec.crval) / self.spec.cdelt + self.spec.crpix - 1.0;

        Ok([px, py, pv])
    }
}
