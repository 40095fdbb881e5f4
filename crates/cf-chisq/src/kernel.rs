use std::f32::consts::PI;

/// Conversion from a Gaussian's half-power beam width to its sigma,
/// `1/(2*sqrt(2*ln 2))`.
pub const SIGMA_PER_HPBW: f32 = 0.42466090014401;

const SQRT_PI: f32 = 1.772_453_9;
const FRAC_1_SQRT_2: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Map a grid index to its Nyquist-signed frequency coordinate:
/// `0, 1, ..., n/2, -(n/2 - 1), ..., -1` (the upper half mirrors negative).
#[inline]
pub fn signed_freq(i: usize, n: usize) -> i32 {
    if i <= n / 2 {
        i as i32
    } else {
        i as i32 - n as i32
    }
}

/// Precomputed factors of the separable Gaussian in Fourier space.
///
/// The kernel value at half-grid coordinate `(nx, ny, nv)` is
/// `exp(axx*nx^2 + axy*nx*ny + ayy*ny^2) * velo[|nv|]`, where `velo` bakes
/// the spectral exponential together with the amplitude (which also carries
/// the 1/(X*Y*V) normalisation of the unscaled transform pair).
///
/// The xy factors and the base amplitude depend only on beam and cube
/// shape; `update_sigma_v` refreshes the spectral part and is a no-op when
/// called again with the same dispersion. The optional exponent image
/// tabulates the xy exponential on the `(X/2+1) x Y` half grid.
#[derive(Debug, Clone)]
pub struct KernelCache {
    size_x: usize,
    size_y: usize,
    size_v: usize,
    half_x: usize,
    axx: f32,
    axy: f32,
    ayy: f32,
    /// Factor multiplying sigma_v^2 to obtain the v-exponent coefficient.
    avv_unit: f32,
    /// sigma_v-independent part of the amplitude.
    amp_base: f32,
    /// Amplitude law: fixed (`false`) or `amp_base/sigma_v` with the
    /// `2*sqrt(pi)*amp_base` limit at zero dispersion (`true`).
    amp_per_sigma: bool,
    /// `exp(avv*nv^2) * amplitude` for `nv` in `0..=size_v/2`.
    velo: Vec<f32>,
    cached_sigma_v: Option<f32>,
    exp_image: Option<Vec<f32>>,
}

impl KernelCache {
    fn factors(sigma_maj: f32, sigma_min: f32, pa: f32, size_x: usize, size_y: usize) -> (f32, f32, f32) {
        let (sin, cos) = pa.sin_cos();
        let (nx, ny) = (size_x as f32, size_y as f32);
        let axx = -2.0 * PI * PI * (sigma_min * sigma_min * cos * cos
            + sigma_maj * sigma_maj * sin * sin)
            / (nx * nx);
        let axy =
            -4.0 * PI * PI * sin * cos * (sigma_min * sigma_min - sigma_maj * sigma_maj) / (nx * ny);
        let ayy = -2.0 * PI * PI * (sigma_min * sigma_min * sin * sin
            + sigma_maj * sigma_maj * cos * cos)
            / (ny * ny);
        (axx, axy, ayy)
    }

    /// Kernel for the instrumental beam (model path).
    ///
    /// Sigmas in pixels, position angle in radians, `scale` the unit
    /// conversion folded into the amplitude. A vanishing sigma is replaced
    /// by `1/sqrt(2*pi)` in the amplitude so a lower-dimensional kernel
    /// integrates to unity.
    pub fn beam(
        sigma_maj: f32,
        sigma_min: f32,
        pa: f32,
        sizes: (usize, usize, usize),
        scale: f32,
    ) -> Self {
        let (size_x, size_y, size_v) = sizes;
        let (axx, axy, ayy) = Self::factors(sigma_maj, sigma_min, pa, size_x, size_y);

        let maj = if sigma_maj == 0.0 {
            1.0 / (2.0 * PI).sqrt()
        } else {
            sigma_maj
        };
        let min = if sigma_min == 0.0 {
            1.0 / (2.0 * PI).sqrt()
        } else {
            sigma_min
        };
        let n = (size_x * size_y * size_v) as f32;
        let amp_base = scale * 2.0 * PI * maj * min / n;

        KernelCache {
            size_x,
            size_y,
            size_v,
            half_x: size_x / 2 + 1,
            axx,
            axy,
            ayy,
            avv_unit: -2.0 * PI * PI / ((size_v * size_v) as f32),
            amp_base,
            amp_per_sigma: false,
            velo: vec![0.0; size_v / 2 + 1],
            cached_sigma_v: None,
            exp_image: None,
        }
    }

    /// Kernel for the quantisation-noise weight path: the beam scaled by
    /// `1/sqrt(2)` in the image plane, with the point-source flux and the
    /// `1/(2*sqrt(pi)*sigma_v)` squared-Gaussian amplitude folded in.
    pub fn half_beam(
        sigma_maj: f32,
        sigma_min: f32,
        pa: f32,
        sizes: (usize, usize, usize),
        scale: f32,
        point_flux: f32,
    ) -> Self {
        let maj = sigma_maj * FRAC_1_SQRT_2;
        let min = sigma_min * FRAC_1_SQRT_2;
        let (size_x, size_y, size_v) = sizes;
        let (axx, axy, ayy) = Self::factors(maj, min, pa, size_x, size_y);

        let n = (size_x * size_y * size_v) as f32;
        let amp_base = scale * point_flux * 2.0 * PI * maj * min / (n * 2.0 * SQRT_PI);

        KernelCache {
            size_x,
            size_y,
            size_v,
            half_x: size_x / 2 + 1,
            axx,
            axy,
            ayy,
            avv_unit: -2.0 * PI * PI * FRAC_1_SQRT_2 * FRAC_1_SQRT_2
                / ((size_v * size_v) as f32),
            amp_base,
            amp_per_sigma: true,
            velo: vec![0.0; size_v / 2 + 1],
            cached_sigma_v: None,
            exp_image: None,
        }
    }

    /// Rebuild the spectral lookup for a new dispersion. Skipped when the
    /// cache already holds `sigma_v`.
    pub fn update_sigma_v(&mut self, sigma_v: f32) {
        if self.cached_sigma_v == Some(sigma_v) {
            return;
        }
        let avv = self.avv_unit * sigma_v * sigma_v;
        let amp = if self.amp_per_sigma {
            if sigma_v != 0.0 {
                self.amp_base / sigma_v
            } else {
                2.0 * SQRT_PI * self.amp_base
            }
        } else {
            self.amp_base
        };
        for (nv, slot) in self.velo.iter_mut().enumerate() {
            *slot = (avv * (nv * nv) as f32).exp() * amp;
        }
        self.cached_sigma_v = Some(sigma_v);
    }

    /// Tabulate the xy exponential on the half grid, trading
    /// `(X/2+1)*Y` floats of memory for one `exp` per sample per call.
    pub fn build_exp_image(&mut self) {
        let mut image = vec![0.0f32; self.half_x * self.size_y];
        for j in 0..self.size_y {
            let ny = signed_freq(j, self.size_y);
            for i in 0..self.half_x {
                let nx = signed_freq(i, self.size_x);
                image[i + self.half_x * j] = (self.axx * (nx * nx) as f32
                    + self.axy * (nx * ny) as f32
                    + self.ayy * (ny * ny) as f32)
                    .exp();
            }
        }
        self.exp_image = Some(image);
    }

    /// The xy exponential at half-grid index `(i, j)`.
    #[inline]
    pub fn xy(&self, i: usize, j: usize) -> f32 {
        if let Some(image) = &self.exp_image {
            return image[i + self.half_x * j];
        }
        let nx = signed_freq(i, self.size_x);
        let ny = signed_freq(j, self.size_y);
        (self.axx * (nx * nx) as f32 + self.axy * (nx * ny) as f32 + self.ayy * (ny * ny) as f32)
            .exp()
    }

    /// The spectral factor (amplitude included) for `nv` in `0..=V/2`.
    #[inline]
    pub fn velo(&self, nv: usize) -> f32 {
        self.velo[nv]
    }

    /// The full kernel value at `(i, j, nv)` with `nv` in `0..=V/2`.
    #[inline]
    pub fn value(&self, i: usize, j: usize, nv: usize) -> f32 {
        self.xy(i, j) * self.velo[nv]
    }

    /// The dispersion the spectral lookup was last built for.
    pub fn cached_sigma_v(&self) -> Option<f32> {
        self.cached_sigma_v
    }

    pub fn has_exp_image(&self) -> bool {
        self.exp_image.is_some()
    }
}
