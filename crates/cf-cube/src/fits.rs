use std::fs::File;
use std::io::Write;
use std::path::Path;

use memmap2::Mmap;

use crate::cube::{Cube, Meta, HI_REST_FREQ};
use crate::error::{CubeError, Result};
use crate::header::{Header, FITS_BLOCK};
use crate::wcs::{Axis, Wcs};

/// BITPIX values the reader accepts.
const SUPPORTED_BITPIX: [i64; 5] = [8, 16, 32, -32, -64];

impl Cube {
    /// Read a cube from a FITS file.
    ///
    /// The whole file is memory-mapped; the primary header is parsed and
    /// validated against the axis grammar (first axis RA, second DEC, third
    /// VELO/FELO/FREQ, any further axes singleton), then the data unit is
    /// decoded to `f32` with BSCALE/BZERO applied. Only the three canonical
    /// axes are kept. A canonical ASCII header is regenerated and retained.
    pub fn read(path: &Path) -> Result<Cube> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let (header, data_offset) = Header::parse(&mmap)?;
        let (mut cube, bitpix) = cube_from_header(&header)?;

        let bscale = header.value_f64("BSCALE").unwrap_or(1.0);
        let bzero = header.value_f64("BZERO").unwrap_or(0.0);
        decode_data(&mmap[data_offset..], bitpix, bscale, bzero, &mut cube)?;

        cube.header = canonical_header(&cube);
        Ok(cube)
    }

    /// Write the cube to a FITS file: the canonical header followed by the
    /// pixels as IEEE big-endian f32 (`BITPIX = -32`), zero-padded to the
    /// FITS block size.
    ///
    /// When `override_pixels` is given it must hold `numel()` values in
    /// logical (unpadded) order and is written instead of the cube's own
    /// buffer, which stays untouched.
    pub fn write(&self, path: &Path, override_pixels: Option<&[f32]>) -> Result<()> {
        let header = canonical_header(self);
        let mut out = File::create(path)?;
        out.write_all(&header.to_bytes())?;

        let mut payload: Vec<u8> = Vec::with_capacity(self.numel() * 4);
        match override_pixels {
            Some(pixels) => {
                assert_eq!(
                    pixels.len(),
                    self.numel(),
                    "override pixel count {} does not match cube size {}",
                    pixels.len(),
                    self.numel()
                );
                for &p in pixels {
                    payload.extend_from_slice(&p.to_be_bytes());
                }
            }
            None => {
                for v in 0..self.size_v() {
                    for y in 0..self.size_y() {
                        for x in 0..self.size_x() {
                            payload.extend_from_slice(&self.get(x, y, v).to_be_bytes());
                        }
                    }
                }
            }
        }
        while payload.len() % FITS_BLOCK != 0 {
            payload.push(0);
        }
        out.write_all(&payload)?;
        Ok(())
    }
}

/// Validate the header grammar and build an empty cube carrying its
/// metadata. Returns the cube and the BITPIX to decode the data unit with.
fn cube_from_header(header: &Header) -> Result<(Cube, i64)> {
    let naxis = header.value_i64("NAXIS").ok_or(CubeError::NoNaxis)?;
    if naxis < 3 {
        return Err(CubeError::WrongNaxis(naxis));
    }

    // Higher axes must be singletons; they are discarded.
    for i in 4..=naxis as usize {
        let key = format!("NAXIS{}", i);
        let n = header.value_i64(&key).ok_or(CubeError::NoNaxisI(i))?;
        if n > 1 {
            return Err(CubeError::WrongNaxisI { axis: i, value: n });
        }
    }

    let mut sizes = [0usize; 3];
    for (i, size) in sizes.iter_mut().enumerate() {
        let axis = i + 1;
        let key = format!("NAXIS{}", axis);
        let n = header.value_i64(&key).ok_or(CubeError::NoNaxisI(axis))?;
        if n < 1 {
            return Err(CubeError::WrongNaxisI { axis, value: n });
        }
        *size = n as usize;
    }

    let mut crpix = [0f64; 3];
    let mut crval = [0f64; 3];
    let mut cdelt = [0f64; 3];
    let mut ctype: [String; 3] = Default::default();
    for i in 0..3 {
        let axis = i + 1;
        crpix[i] = header
            .value_f64(&format!("CRPIX{}", axis))
            .ok_or(CubeError::NoCrpix(axis))?;
        crval[i] = header
            .value_f64(&format!("CRVAL{}", axis))
            .ok_or(CubeError::NoCrval(axis))?;
        cdelt[i] = header
            .value_f64(&format!("CDELT{}", axis))
            .ok_or(CubeError::NoCdelt(axis))?;
        ctype[i] = header
            .value(&format!("CTYPE{}", axis))
            .ok_or(CubeError::NoCtype(axis))?;
    }

    if !ctype[0].starts_with("RA") {
        return Err(CubeError::WrongCtype {
            axis: 1,
            expected: "RA...",
        });
    }
    if !ctype[1].starts_with("DEC") {
        return Err(CubeError::WrongCtype {
            axis: 2,
            expected: "DEC...",
        });
    }
    if !(ctype[2].starts_with("VELO") || ctype[2].starts_with("FELO") || ctype[2].starts_with("FREQ"))
    {
        return Err(CubeError::WrongCtype {
            axis: 3,
            expected: "VELO, FELO, or FREQ...",
        });
    }

    let epoch_raw = header
        .value("EPOCH")
        .or_else(|| header.value("EQUINOX"))
        .ok_or(CubeError::NoEpoch)?;
    let epoch: f64 = epoch_raw.trim().parse().map_err(|_| CubeError::WrongEpoch)?;

    let bunit = header.value("BUNIT").ok_or(CubeError::WrongBunit)?;
    if bunit.trim().is_empty() {
        return Err(CubeError::WrongBunit);
    }

    let bitpix = header.value_i64("BITPIX").ok_or(CubeError::WrongBitpix(0))?;
    if !SUPPORTED_BITPIX.contains(&bitpix) {
        return Err(CubeError::WrongBitpix(bitpix));
    }

    let restfreq = header
        .value_f64("RESTFREQ")
        .or_else(|| header.value_f64("FREQ0"))
        .unwrap_or(HI_REST_FREQ);

    let mut cube = Cube::zeros(sizes[0], sizes[1], sizes[2]);
    cube.wcs = Wcs::new(
        Axis::new(&ctype[0], crpix[0], crval[0], cdelt[0]),
        Axis::new(&ctype[1], crpix[1], crval[1], cdelt[1]),
        Axis::new(&ctype[2], crpix[2], crval[2], cdelt[2]),
    );
    cube.meta = Meta {
        epoch,
        bunit: bunit.trim().to_string(),
        restfreq,
        vobs: header.value_f64("VOBS").unwrap_or(0.0),
        cellscal: header.value("CELLSCAL"),
        bmaj: header.value_f64("BMAJ").unwrap_or(0.0),
        bmin: header.value_f64("BMIN").unwrap_or(0.0),
        bpa: header.value_f64("BPA").unwrap_or(0.0),
        // Scaling is applied at decode time; the canonical header records
        // the identity transform for the stored values.
        bscale: 1.0,
        bzero: 0.0,
        btype: header.value("BTYPE"),
    };

    Ok((cube, bitpix))
}

/// Decode the data unit into the cube, applying BSCALE/BZERO from the file
/// header (the cube's canonical metadata ends up with bscale 1, bzero 0).
fn decode_data(raw: &[u8], bitpix: i64, bscale: f64, bzero: f64, cube: &mut Cube) -> Result<()> {
    let n = cube.numel();
    let bytes_per = (bitpix.unsigned_abs() / 8) as usize;
    if raw.len() < n * bytes_per {
        return Err(CubeError::Truncated {
            expected: n * bytes_per,
            found: raw.len(),
        });
    }

    let rescale = |v: f64| (bzero + bscale * v) as f32;

    let (sx, sy, sv) = (cube.size_x(), cube.size_y(), cube.size_v());
    let mut i = 0usize;
    for v in 0..sv {
        for y in 0..sy {
            for x in 0..sx {
                let at = i * bytes_per;
                let value = match bitpix {
                    8 => raw[at] as f64,
                    16 => i16::from_be_bytes([raw[at], raw[at + 1]]) as f64,
                    32 => i32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
                        as f64,
                    -32 => f32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
                        as f64,
                    -64 => f64::from_be_bytes([
                        raw[at],
                        raw[at + 1],
                        raw[at + 2],
                        raw[at + 3],
                        raw[at + 4],
                        raw[at + 5],
                        raw[at + 6],
                        raw[at + 7],
                    ]),
                    _ => unreachable!("bitpix validated earlier"),
                };
                cube.set(x, y, v, rescale(value));
                i += 1;
            }
        }
    }
    Ok(())
}

/// Regenerate the canonical ASCII header from the cube's metadata.
pub fn canonical_header(cube: &Cube) -> Header {
    let mut h = Header::new();
    h.push("SIMPLE", "T", Some("Standard FITS format"));
    h.push_i64("BITPIX", -32, Some("IEEE single precision"));
    h.push_i64("NAXIS", 3, None);
    h.push_i64("NAXIS1", cube.size_x() as i64, None);
    h.push_i64("NAXIS2", cube.size_y() as i64, None);
    h.push_i64("NAXIS3", cube.size_v() as i64, None);
    h.push_str("CTYPE1", &cube.wcs.lon.ctype, None);
    h.push_f64("CRPIX1", cube.wcs.lon.crpix, None);
    h.push_f64("CRVAL1", cube.wcs.lon.crval, None);
    h.push_f64("CDELT1", cube.wcs.lon.cdelt, None);
    h.push_str("CTYPE2", &cube.wcs.lat.ctype, None);
    h.push_f64("CRPIX2", cube.wcs.lat.crpix, None);
    h.push_f64("CRVAL2", cube.wcs.lat.crval, None);
    h.push_f64("CDELT2", cube.wcs.lat.cdelt, None);
    h.push_str("CTYPE3", &cube.wcs.spec.ctype, None);
    h.push_f64("CRPIX3", cube.wcs.spec.crpix, None);
    h.push_f64("CRVAL3", cube.wcs.spec.crval, None);
    h.push_f64("CDELT3", cube.wcs.spec.cdelt, None);
    h.push_f64("EPOCH", cube.meta.epoch, None);
    h.push_str("BUNIT", &cube.meta.bunit, None);
    h.push_f64("RESTFREQ", cube.meta.restfreq, Some("Rest frequency (Hz)"));
    h.push_f64("VOBS", cube.meta.vobs, Some("Observing velocity (m/s)"));
    if let Some(cellscal) = &cube.meta.cellscal {
        h.push_str("CELLSCAL", cellscal, None);
    }
    h.push_f64("BMAJ", cube.meta.bmaj, Some("Beam major axis HPBW (deg)"));
    h.push_f64("BMIN", cube.meta.bmin, Some("Beam minor axis HPBW (deg)"));
    h.push_f64("BPA", cube.meta.bpa, Some("Beam position angle (deg)"));
    h.push_f64("BSCALE", cube.meta.bscale, None);
    h.push_f64("BZERO", cube.meta.bzero, None);
    if let Some(btype) = &cube.meta.btype {
        h.push_str("BTYPE", btype, None);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_cube() -> Cube {
        let mut cube = Cube::zeros(6, 5, 4);
        for v in 0..4 {
            for y in 0..5 {
                for x in 0..6 {
                    cube.set(x, y, v, (x as f32) - 2.0 * (y as f32) + 0.25 * (v as f32));
                }
            }
        }
        cube.wcs = Wcs::new(
            Axis::new("RA---SIN", 3.0, 178.325, -4.0e-4),
            Axis::new("DEC--SIN", 3.0, 52.75, 4.0e-4),
            Axis::new("VELO-HEL", 1.0, 4.5e5, -4.0e3),
        );
        cube.meta.bunit = "JY/BEAM".to_string();
        cube.meta.bmaj = 3.5e-3;
        cube.meta.bmin = 3.1e-3;
        cube.meta.bpa = 12.5;
        cube
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cube.fits");
        let cube = sample_cube();
        cube.write(&path, None).unwrap();

        let back = Cube::read(&path).unwrap();
        assert_eq!(back.size_x(), 6);
        assert_eq!(back.size_y(), 5);
        assert_eq!(back.size_v(), 4);
        for v in 0..4 {
            for y in 0..5 {
                for x in 0..6 {
                    // BITPIX -32 keeps f32 voxels bit-exact.
                    assert_eq!(back.get(x, y, v).to_bits(), cube.get(x, y, v).to_bits());
                }
            }
        }
        assert_eq!(back.wcs, cube.wcs);
        assert_eq!(back.meta.bunit, "JY/BEAM");
        assert_eq!(back.meta.bmaj, cube.meta.bmaj);
        assert_eq!(back.meta.restfreq, HI_REST_FREQ);

        // The canonical header regenerates identically.
        let again = canonical_header(&back);
        assert_eq!(again.to_bytes(), back.header().to_bytes());
        assert_eq!(again.to_bytes(), canonical_header(&cube).to_bytes());
    }

    #[test]
    fn test_write_override_pixels_leaves_cube_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cube.fits");
        let cube = sample_cube();
        let replacement = vec![1.5f32; cube.numel()];
        cube.write(&path, Some(&replacement)).unwrap();
        let back = Cube::read(&path).unwrap();
        assert_eq!(back.get(3, 2, 1), 1.5);
        assert_ne!(cube.get(3, 2, 1), 1.5);
    }

    #[test]
    fn test_reader_rejects_bad_axis_grammar() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.fits");
        let mut cube = sample_cube();
        cube.wcs.lon.ctype = "GLON-CAR".to_string();
        cube.write(&path, None).unwrap();
        match Cube::read(&path) {
            Err(CubeError::WrongCtype { axis: 1, .. }) => {}
            other => panic!("expected WrongCtype for axis 1, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_reader_rejects_missing_file_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.fits");
        let cube = sample_cube();
        let header = canonical_header(&cube);
        std::fs::write(&path, header.to_bytes()).unwrap();
        match Cube::read(&path) {
            Err(CubeError::Truncated { .. }) => {}
            other => panic!("expected Truncated, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_bscale_applied_at_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scaled.fits");

        let mut h = Header::new();
        h.push("SIMPLE", "T", None);
        h.push_i64("BITPIX", 16, None);
        h.push_i64("NAXIS", 3, None);
        h.push_i64("NAXIS1", 2, None);
        h.push_i64("NAXIS2", 1, None);
        h.push_i64("NAXIS3", 1, None);
        h.push_str("CTYPE1", "RA---SIN", None);
        h.push_f64("CRPIX1", 1.0, None);
        h.push_f64("CRVAL1", 0.0, None);
        h.push_f64("CDELT1", -1.0e-3, None);
        h.push_str("CTYPE2", "DEC--SIN", None);
        h.push_f64("CRPIX2", 1.0, None);
        h.push_f64("CRVAL2", 0.0, None);
        h.push_f64("CDELT2", 1.0e-3, None);
        h.push_str("CTYPE3", "FREQ-OBS", None);
        h.push_f64("CRPIX3", 1.0, None);
        h.push_f64("CRVAL3", 1.4e9, None);
        h.push_f64("CDELT3", 1.0e4, None);
        h.push_f64("EPOCH", 2000.0, None);
        h.push_str("BUNIT", "K", None);
        h.push_f64("BSCALE", 0.5, None);
        h.push_f64("BZERO", 100.0, None);

        let mut raw = h.to_bytes();
        let mut payload = Vec::new();
        payload.extend_from_slice(&10i16.to_be_bytes());
        payload.extend_from_slice(&(-4i16).to_be_bytes());
        while payload.len() % FITS_BLOCK != 0 {
            payload.push(0);
        }
        raw.extend_from_slice(&payload);
        std::fs::write(&path, raw).unwrap();

        let cube = Cube::read(&path).unwrap();
        assert_eq!(cube.get(0, 0, 0), 105.0);
        assert_eq!(cube.get(1, 0, 0), 98.0);
        // Stored values are final; the canonical header is identity-scaled.
        assert_eq!(cube.meta.bscale, 1.0);
        assert_eq!(cube.meta.bzero, 0.0);
    }
}
