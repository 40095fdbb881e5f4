use crate::error::Result;
use crate::header::Header;
use crate::wcs::{Axis, Wcs};

/// Frequency of the HI 21cm line in Hz, the default rest frequency when the
/// header carries none.
pub const HI_REST_FREQ: f64 = 1.420405751786e9;

/// Header metadata carried alongside the pixel grid.
#[derive(Debug, Clone)]
pub struct Meta {
    /// Equinox of the coordinate system (EPOCH/EQUINOX card).
    pub epoch: f64,
    /// Brightness unit string (BUNIT).
    pub bunit: String,
    /// Rest frequency in Hz (RESTFREQ/FREQ0, defaults to the HI line).
    pub restfreq: f64,
    /// Observing velocity in m/s (VOBS, defaults to 0).
    pub vobs: f64,
    /// Cell scaling card (CELLSCAL), kept verbatim when present.
    pub cellscal: Option<String>,
    /// Beam major axis HPBW in degrees (BMAJ, 0 when absent).
    pub bmaj: f64,
    /// Beam minor axis HPBW in degrees (BMIN, 0 when absent).
    pub bmin: f64,
    /// Beam position angle in degrees (BPA, 0 when absent).
    pub bpa: f64,
    /// Pixel value scaling (BSCALE, defaults to 1).
    pub bscale: f64,
    /// Pixel value offset (BZERO, defaults to 0).
    pub bzero: f64,
    /// Brightness type string (BTYPE), kept verbatim when present.
    pub btype: Option<String>,
}

impl Default for Meta {
    fn default() -> Self {
        Meta {
            epoch: 2000.0,
            bunit: "JY/BEAM".to_string(),
            restfreq: HI_REST_FREQ,
            vobs: 0.0,
            cellscal: None,
            bmaj: 0.0,
            bmin: 0.0,
            bpa: 0.0,
            bscale: 1.0,
            bzero: 0.0,
            btype: None,
        }
    }
}

/// A 3-D single-precision data cube with world-coordinate metadata.
///
/// Axis order is (x = RA, y = DEC, v = spectral); voxel `(x, y, v)` lives at
/// `data[x + stride_x*(y + size_y*v)]`. The physical x-stride is either the
/// logical `size_x` (unpadded) or `2*(size_x/2 + 1)` (padded), the layout a
/// real-to-complex FFT needs to store its Hermitian half in place. When the
/// cube is padded only columns `[0, size_x)` of each x-row are meaningful.
#[derive(Debug, Clone)]
pub struct Cube {
    size_x: usize,
    size_y: usize,
    size_v: usize,
    /// Trailing pad floats per x-row; 0 in the unpadded layout.
    padding: usize,
    data: Vec<f32>,
    /// World coordinate system of the three axes.
    pub wcs: Wcs,
    /// Remaining header metadata.
    pub meta: Meta,
    /// Canonical ASCII header, regenerated by the FITS layer.
    pub(crate) header: Header,
}

impl Cube {
    /// Physical x-stride of the padded layout for a logical width `size_x`.
    pub fn padded_stride(size_x: usize) -> usize {
        2 * (size_x / 2 + 1)
    }

    fn default_wcs() -> Wcs {
        Wcs::new(
            Axis::new("RA---SIN", 1.0, 0.0, -2.777777777778e-4),
            Axis::new("DEC--SIN", 1.0, 0.0, 2.777777777778e-4),
            Axis::new("VELO-HEL", 1.0, 0.0, 1.0e3),
        )
    }

    /// Create a zero-filled cube in the unpadded layout.
    ///
    /// # Panics
    /// Panics if any extent is zero.
    pub fn zeros(size_x: usize, size_y: usize, size_v: usize) -> Self {
        assert!(
            size_x > 0 && size_y > 0 && size_v > 0,
            "cube extents must be positive, got ({}, {}, {})",
            size_x,
            size_y,
            size_v
        );
        Cube {
            size_x,
            size_y,
            size_v,
            padding: 0,
            data: vec![0.0; size_x * size_y * size_v],
            wcs: Self::default_wcs(),
            meta: Meta::default(),
            header: Header::new(),
        }
    }

    /// Create a zero-filled cube already in the padded layout, sized
    /// `size_v * size_y * padded_stride(size_x)` so an in-place transform
    /// needs no reallocation.
    pub fn padded_zeros(size_x: usize, size_y: usize, size_v: usize) -> Self {
        let mut cube = Cube::zeros(size_x, size_y, size_v);
        cube.padding = Self::padded_stride(size_x) - size_x;
        cube.data = vec![0.0; Self::padded_stride(size_x) * size_y * size_v];
        cube
    }

    /// Build a cube from raw voxels in the unpadded layout.
    ///
    /// # Panics
    /// Panics if `data.len() != size_x * size_y * size_v`.
    pub fn from_vec(size_x: usize, size_y: usize, size_v: usize, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            size_x * size_y * size_v,
            "data length {} does not match extents ({}, {}, {})",
            data.len(),
            size_x,
            size_y,
            size_v
        );
        let mut cube = Cube::zeros(size_x, size_y, size_v);
        cube.data = data;
        cube
    }

    pub fn size_x(&self) -> usize {
        self.size_x
    }

    pub fn size_y(&self) -> usize {
        self.size_y
    }

    pub fn size_v(&self) -> usize {
        self.size_v
    }

    /// Number of logical voxels.
    pub fn numel(&self) -> usize {
        self.size_x * self.size_y * self.size_v
    }

    /// Active physical x-stride: `size_x` unpadded, `2*(size_x/2+1)` padded.
    pub fn stride_x(&self) -> usize {
        self.size_x + self.padding
    }

    /// True when the cube is in the padded (FFT) layout.
    pub fn is_padded(&self) -> bool {
        self.padding != 0
    }

    /// Flat index of voxel `(x, y, v)` under the current layout.
    #[inline]
    pub fn index(&self, x: usize, y: usize, v: usize) -> usize {
        x + self.stride_x() * (y + self.size_y * v)
    }

    /// Read voxel `(x, y, v)`.
    ///
    /// # Panics
    /// Panics if a coordinate is out of range.
    #[inline]
    pub fn get(&self, x: usize, y: usize, v: usize) -> f32 {
        debug_assert!(x < self.size_x && y < self.size_y && v < self.size_v);
        self.data[self.index(x, y, v)]
    }

    /// Write voxel `(x, y, v)`.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, v: usize, value: f32) {
        debug_assert!(x < self.size_x && y < self.size_y && v < self.size_v);
        let i = self.index(x, y, v);
        self.data[i] = value;
    }

    /// The backing buffer in its current layout.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the backing buffer in its current layout.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Set every voxel (and pad column) to zero.
    pub fn erase(&mut self) {
        self.data.fill(0.0);
    }

    /// Switch to the padded layout, reallocating to the padded length.
    ///
    /// A no-op when already padded. Voxels are moved back-to-front so the
    /// interleave never overwrites unread data.
    pub fn pad(&mut self) {
        if self.padding != 0 {
            return;
        }
        let stride = Self::padded_stride(self.size_x);
        self.data.resize(stride * self.size_y * self.size_v, 0.0);
        self.padding = stride - self.size_x;
        for row in (0..self.size_y * self.size_v).rev() {
            for x in (0..self.size_x).rev() {
                self.data[x + stride * row] = self.data[x + self.size_x * row];
            }
        }
        // The pad columns carry no information; keep them clean.
        for row in 0..self.size_y * self.size_v {
            for x in self.size_x..stride {
                self.data[x + stride * row] = 0.0;
            }
        }
    }

    /// Switch to the unpadded layout, truncating to the logical length.
    ///
    /// A no-op when already unpadded.
    pub fn unpad(&mut self) {
        if self.padding == 0 {
            return;
        }
        let stride = self.stride_x();
        for row in 0..self.size_y * self.size_v {
            for x in 0..self.size_x {
                self.data[x + self.size_x * row] = self.data[x + stride * row];
            }
        }
        self.data.truncate(self.size_x * self.size_y * self.size_v);
        self.padding = 0;
    }

    /// Like [`pad`](Self::pad) but without reallocating: the caller
    /// guarantees the buffer was allocated at the padded length (e.g. by
    /// [`padded_zeros`](Self::padded_zeros) followed by `unpad_in_place`).
    ///
    /// # Panics
    /// Panics if the buffer is too short for the padded layout.
    pub fn pad_in_place(&mut self) {
        if self.padding != 0 {
            return;
        }
        let stride = Self::padded_stride(self.size_x);
        assert!(
            self.data.len() >= stride * self.size_y * self.size_v,
            "buffer not pre-sized for the padded layout"
        );
        self.padding = stride - self.size_x;
        for row in (0..self.size_y * self.size_v).rev() {
            for x in (0..self.size_x).rev() {
                self.data[x + stride * row] = self.data[x + self.size_x * row];
            }
        }
    }

    /// Like [`unpad`](Self::unpad) but keeping the allocation, so a later
    /// `pad_in_place` costs no reallocation. The buffer length is unchanged;
    /// elements beyond the logical extent become meaningless.
    pub fn unpad_in_place(&mut self) {
        if self.padding == 0 {
            return;
        }
        let stride = self.stride_x();
        for row in 0..self.size_y * self.size_v {
            for x in 0..self.size_x {
                self.data[x + self.size_x * row] = self.data[x + stride * row];
            }
        }
        self.padding = 0;
    }

    /// Nearest-integer voxel lookup from fractional pixel coordinates.
    ///
    /// Returns `None` when the rounded position falls outside the cube.
    pub fn find_pixel(&self, x: f64, y: f64, v: f64) -> Option<(usize, usize, usize)> {
        let xi = x.round();
        let yi = y.round();
        let vi = v.round();
        if xi < 0.0 || yi < 0.0 || vi < 0.0 {
            return None;
        }
        let (xi, yi, vi) = (xi as usize, yi as usize, vi as usize);
        if xi >= self.size_x || yi >= self.size_y || vi >= self.size_v {
            return None;
        }
        Some((xi, yi, vi))
    }

    /// Convert a 0-based pixel triplet to `[ra, dec, spec]` world values.
    pub fn pixel_to_world(&self, pixel: [f64; 3]) -> Result<[f64; 3]> {
        self.wcs.pixel_to_world(pixel)
    }

    /// Convert a world triplet to 0-based pixel coordinates.
    pub fn world_to_pixel(&self, world: [f64; 3]) -> Result<[f64; 3]> {
        self.wcs.world_to_pixel(world)
    }

    /// The canonical ASCII header retained from the last read/regeneration.
    pub fn header(&self) -> &Header {
        &self.header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_cube(x: usize, y: usize, v: usize) -> Cube {
        let data: Vec<f32> = (0..x * y * v).map(|i| i as f32).collect();
        Cube::from_vec(x, y, v, data)
    }

    #[test]
    fn test_zeros_layout() {
        let c = Cube::zeros(5, 4, 3);
        assert_eq!(c.stride_x(), 5);
        assert!(!c.is_padded());
        assert_eq!(c.data().len(), 60);
        assert_eq!(c.get(4, 3, 2), 0.0);
    }

    #[test]
    fn test_padded_zeros_layout() {
        let c = Cube::padded_zeros(5, 4, 3);
        assert_eq!(c.stride_x(), 6);
        assert!(c.is_padded());
        assert_eq!(c.data().len(), 6 * 4 * 3);

        let c = Cube::padded_zeros(8, 4, 2);
        assert_eq!(c.stride_x(), 10);
    }

    #[test]
    fn test_pad_unpad_involution() {
        let original = ramp_cube(7, 3, 2);
        let mut c = original.clone();
        c.pad();
        assert!(c.is_padded());
        assert_eq!(c.stride_x(), 8);
        for v in 0..2 {
            for y in 0..3 {
                for x in 0..7 {
                    assert_eq!(c.get(x, y, v), original.get(x, y, v));
                }
            }
        }
        c.unpad();
        assert!(!c.is_padded());
        assert_eq!(c.data(), original.data());
    }

    #[test]
    fn test_pad_in_place_round_trip() {
        let mut c = Cube::padded_zeros(6, 3, 2);
        for v in 0..2 {
            for y in 0..3 {
                for x in 0..6 {
                    c.set(x, y, v, (x + 10 * y + 100 * v) as f32);
                }
            }
        }
        let reference = c.clone();
        c.unpad_in_place();
        assert!(!c.is_padded());
        assert_eq!(c.get(5, 2, 1), reference.get(5, 2, 1));
        c.pad_in_place();
        assert!(c.is_padded());
        for v in 0..2 {
            for y in 0..3 {
                for x in 0..6 {
                    assert_eq!(c.get(x, y, v), reference.get(x, y, v));
                }
            }
        }
    }

    #[test]
    fn test_find_pixel() {
        let c = Cube::zeros(8, 8, 4);
        assert_eq!(c.find_pixel(3.4, 7.2, 0.6), Some((3, 7, 1)));
        assert_eq!(c.find_pixel(7.6, 0.0, 0.0), None);
        assert_eq!(c.find_pixel(-0.6, 0.0, 0.0), None);
        assert_eq!(c.find_pixel(-0.4, 0.0, 3.4), Some((0, 0, 3)));
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let mut a = ramp_cube(4, 4, 2);
        let b = a.clone();
        a.set(0, 0, 0, -1.0);
        assert_eq!(b.get(0, 0, 0), 0.0);
        assert_eq!(a.get(0, 0, 0), -1.0);
    }
}
