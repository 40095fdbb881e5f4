use std::sync::Arc;

use rayon::prelude::*;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::kernel::KernelCache;

/// How much effort the planner may spend tuning transforms, from cheapest
/// setup to fastest steady state. Accepted for interface compatibility and
/// recorded; the planner selects its kernels automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanEffort {
    #[default]
    Estimate,
    Measure,
    Patient,
    Exhaustive,
}

/// Separable 3-D (or 2-D when `size_v == 1`) Gaussian convolution of a real
/// cube through one real-to-complex / complex-to-real transform pair.
///
/// The spectrum lives in the padded-row layout: each x-row of
/// `2*(size_x/2+1)` floats holds `size_x/2+1` interleaved re/im pairs, so a
/// padded cube's own buffer can serve as its spectrum (in-place mode). The
/// x axis goes through `realfft` plans, the y and v axes through strided
/// `rustfft` passes on the half grid.
///
/// Plans are built once at construction and shared; every pass borrows the
/// engine immutably so calls can run inside an engine-owned thread pool.
pub struct ConvolutionEngine {
    size_x: usize,
    size_y: usize,
    size_v: usize,
    half_x: usize,
    stride: usize,
    effort: PlanEffort,
    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
    fft_y: Arc<dyn Fft<f32>>,
    ifft_y: Arc<dyn Fft<f32>>,
    fft_v: Option<Arc<dyn Fft<f32>>>,
    ifft_v: Option<Arc<dyn Fft<f32>>>,
}

impl ConvolutionEngine {
    pub fn new(size_x: usize, size_y: usize, size_v: usize, effort: PlanEffort) -> Self {
        assert!(size_x > 0 && size_y > 0 && size_v > 0);
        let mut real_planner = RealFftPlanner::<f32>::new();
        let mut planner = FftPlanner::<f32>::new();
        let (fft_v, ifft_v) = if size_v > 1 {
            (
                Some(planner.plan_fft_forward(size_v)),
                Some(planner.plan_fft_inverse(size_v)),
            )
        } else {
            (None, None)
        };
        ConvolutionEngine {
            size_x,
            size_y,
            size_v,
            half_x: size_x / 2 + 1,
            stride: 2 * (size_x / 2 + 1),
            effort,
            r2c: real_planner.plan_fft_forward(size_x),
            c2r: real_planner.plan_fft_inverse(size_x),
            fft_y: planner.plan_fft_forward(size_y),
            ifft_y: planner.plan_fft_inverse(size_y),
            fft_v,
            ifft_v,
        }
    }

    /// Length in floats of a spectrum / padded-cube buffer for this shape.
    pub fn spectrum_len(&self) -> usize {
        self.stride * self.size_y * self.size_v
    }

    /// Allocate a zeroed spectrum buffer.
    pub fn make_spectrum(&self) -> Vec<f32> {
        vec![0.0; self.spectrum_len()]
    }

    pub fn plan_effort(&self) -> PlanEffort {
        self.effort
    }

    /// Forward transform of a padded cube, overwriting it with its spectrum.
    pub fn forward_in_place(&self, data: &mut [f32]) {
        assert_eq!(data.len(), self.spectrum_len());
        let (nx, stride, r2c) = (self.size_x, self.stride, &self.r2c);
        data.par_chunks_mut(stride).for_each_init(
            || (vec![0.0f32; nx], r2c.make_output_vec(), r2c.make_scratch_vec()),
            |(row, out, scratch), chunk| {
                row.copy_from_slice(&chunk[..nx]);
                r2c.process_with_scratch(row, out, scratch)
                    .expect("forward plan length mismatch");
                for (k, c) in out.iter().enumerate() {
                    chunk[2 * k] = c.re;
                    chunk[2 * k + 1] = c.im;
                }
            },
        );
        self.fft_pass_y(data, &self.fft_y);
        if let Some(fft_v) = &self.fft_v {
            self.fft_pass_v(data, fft_v);
        }
    }

    /// Forward transform reading a padded cube without modifying it, the
    /// spectrum landing in `dst` (the preserve-input path of the weight
    /// builder).
    pub fn forward_into(&self, src: &[f32], dst: &mut [f32]) {
        assert_eq!(src.len(), self.spectrum_len());
        assert_eq!(dst.len(), self.spectrum_len());
        let (nx, stride, r2c) = (self.size_x, self.stride, &self.r2c);
        dst.par_chunks_mut(stride).enumerate().for_each_init(
            || (vec![0.0f32; nx], r2c.make_output_vec(), r2c.make_scratch_vec()),
            |(row, out, scratch), (r, chunk)| {
                row.copy_from_slice(&src[r * stride..r * stride + nx]);
                r2c.process_with_scratch(row, out, scratch)
                    .expect("forward plan length mismatch");
                for (k, c) in out.iter().enumerate() {
                    chunk[2 * k] = c.re;
                    chunk[2 * k + 1] = c.im;
                }
            },
        );
        self.fft_pass_y(dst, &self.fft_y);
        if let Some(fft_v) = &self.fft_v {
            self.fft_pass_v(dst, fft_v);
        }
    }

    /// Inverse transform of a spectrum, overwriting it with the real cube.
    /// Pad columns come out zeroed.
    pub fn inverse_in_place(&self, data: &mut [f32]) {
        assert_eq!(data.len(), self.spectrum_len());
        if let Some(ifft_v) = &self.ifft_v {
            self.fft_pass_v(data, ifft_v);
        }
        self.fft_pass_y(data, &self.ifft_y);
        let (nx, half, stride, c2r) = (self.size_x, self.half_x, self.stride, &self.c2r);
        data.par_chunks_mut(stride).for_each_init(
            || (c2r.make_input_vec(), vec![0.0f32; nx], c2r.make_scratch_vec()),
            |(inb, out, scratch), chunk| {
                for (k, slot) in inb.iter_mut().enumerate().take(half) {
                    *slot = Complex::new(chunk[2 * k], chunk[2 * k + 1]);
                }
                // The DC and Nyquist bins of a real transform carry float
                // residue in their imaginary parts after the strided
                // passes; the c2r plan requires them to be exactly zero.
                inb[0].im = 0.0;
                if nx % 2 == 0 {
                    inb[half - 1].im = 0.0;
                }
                c2r.process_with_scratch(inb, out, scratch)
                    .expect("inverse plan length mismatch");
                chunk[..nx].copy_from_slice(out);
                for pad in chunk[nx..].iter_mut() {
                    *pad = 0.0;
                }
            },
        );
    }

    /// Inverse transform of `src` into the padded cube `dst`; `src` is used
    /// as workspace for the strided passes.
    pub fn inverse_into(&self, src: &mut [f32], dst: &mut [f32]) {
        assert_eq!(src.len(), self.spectrum_len());
        assert_eq!(dst.len(), self.spectrum_len());
        if let Some(ifft_v) = &self.ifft_v {
            self.fft_pass_v(src, ifft_v);
        }
        self.fft_pass_y(src, &self.ifft_y);
        let (nx, half, stride, c2r) = (self.size_x, self.half_x, self.stride, &self.c2r);
        let src_ref: &[f32] = src;
        dst.par_chunks_mut(stride).enumerate().for_each_init(
            || (c2r.make_input_vec(), vec![0.0f32; nx], c2r.make_scratch_vec()),
            |(inb, out, scratch), (r, chunk)| {
                for (k, slot) in inb.iter_mut().enumerate().take(half) {
                    let at = r * stride + 2 * k;
                    *slot = Complex::new(src_ref[at], src_ref[at + 1]);
                }
                inb[0].im = 0.0;
                if nx % 2 == 0 {
                    inb[half - 1].im = 0.0;
                }
                c2r.process_with_scratch(inb, out, scratch)
                    .expect("inverse plan length mismatch");
                chunk[..nx].copy_from_slice(out);
                for pad in chunk[nx..].iter_mut() {
                    *pad = 0.0;
                }
            },
        );
    }

    /// Multiply the spectrum by the kernel, exploiting the Hermitian half
    /// storage and the even symmetry of the spectral factor: one kernel
    /// evaluation covers the mirrored planes `nv` and `size_v - nv`.
    pub fn apply_kernel(&self, spectrum: &mut [f32], kernel: &KernelCache) {
        assert_eq!(spectrum.len(), self.spectrum_len());
        let plane = self.stride * self.size_y;

        self.scale_plane(&mut spectrum[..plane], kernel, 0);
        if self.size_v == 1 {
            return;
        }

        if self.size_v % 2 == 0 {
            let mid = self.size_v / 2;
            self.scale_plane(&mut spectrum[mid * plane..(mid + 1) * plane], kernel, mid);
        }

        for nv in 1..=(self.size_v - 1) / 2 {
            let (head, tail) = spectrum.split_at_mut((self.size_v - nv) * plane);
            let lower = &mut head[nv * plane..(nv + 1) * plane];
            let mirror = &mut tail[..plane];
            for j in 0..self.size_y {
                for i in 0..self.half_x {
                    let g = kernel.value(i, j, nv);
                    let at = j * self.stride + 2 * i;
                    lower[at] *= g;
                    lower[at + 1] *= g;
                    mirror[at] *= g;
                    mirror[at + 1] *= g;
                }
            }
        }
    }

    /// Add a constant to the DC Fourier coefficient. With the unnormalised
    /// inverse this raises every voxel of the back-transform by `value`.
    pub fn add_dc(&self, spectrum: &mut [f32], value: f32) {
        spectrum[0] += value;
    }

    /// Full convolution of a padded cube with the kernel, in place.
    pub fn convolve_in_place(&self, data: &mut [f32], kernel: &KernelCache) {
        self.forward_in_place(data);
        self.apply_kernel(data, kernel);
        self.inverse_in_place(data);
    }

    fn scale_plane(&self, plane: &mut [f32], kernel: &KernelCache, nv: usize) {
        for j in 0..self.size_y {
            for i in 0..self.half_x {
                let g = kernel.value(i, j, nv);
                let at = j * self.stride + 2 * i;
                plane[at] *= g;
                plane[at + 1] *= g;
            }
        }
    }

    /// Strided complex FFT along y, parallel over v-planes.
    fn fft_pass_y(&self, data: &mut [f32], fft: &Arc<dyn Fft<f32>>) {
        let plane = self.stride * self.size_y;
        let (half, stride, ny) = (self.half_x, self.stride, self.size_y);
        data.par_chunks_mut(plane).for_each_init(
            || {
                (
                    vec![Complex::<f32>::default(); ny],
                    vec![Complex::<f32>::default(); fft.get_inplace_scratch_len()],
                )
            },
            |(col, scratch), chunk| {
                for k in 0..half {
                    for (j, slot) in col.iter_mut().enumerate() {
                        let at = j * stride + 2 * k;
                        *slot = Complex::new(chunk[at], chunk[at + 1]);
                    }
                    fft.process_with_scratch(col, scratch);
                    for (j, slot) in col.iter().enumerate() {
                        let at = j * stride + 2 * k;
                        chunk[at] = slot.re;
                        chunk[at + 1] = slot.im;
                    }
                }
            },
        );
    }

    /// Strided complex FFT along v. Columns cross every v-plane, so this
    /// pass runs on the calling thread.
    fn fft_pass_v(&self, data: &mut [f32], fft: &Arc<dyn Fft<f32>>) {
        let plane = self.stride * self.size_y;
        let mut col = vec![Complex::<f32>::default(); self.size_v];
        let mut scratch = vec![Complex::<f32>::default(); fft.get_inplace_scratch_len()];
        for j in 0..self.size_y {
            for k in 0..self.half_x {
                let base = j * self.stride + 2 * k;
                for (v, slot) in col.iter_mut().enumerate() {
                    let at = base + v * plane;
                    *slot = Complex::new(data[at], data[at + 1]);
                }
                fft.process_with_scratch(&mut col, &mut scratch);
                for (v, slot) in col.iter().enumerate() {
                    let at = base + v * plane;
                    data[at] = slot.re;
                    data[at + 1] = slot.im;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cf_cube::Cube;

    fn filled_padded_cube(x: usize, y: usize, v: usize) -> Cube {
        let mut cube = Cube::padded_zeros(x, y, v);
        for kv in 0..v {
            for j in 0..y {
                for i in 0..x {
                    let value = ((i * 7 + j * 3 + kv * 11) % 13) as f32 - 6.0;
                    cube.set(i, j, kv, value);
                }
            }
        }
        cube
    }

    #[test]
    fn test_forward_inverse_scales_by_cube_size() {
        let engine = ConvolutionEngine::new(8, 6, 4, PlanEffort::Estimate);
        let mut cube = filled_padded_cube(8, 6, 4);
        let reference = cube.clone();
        let n = (8 * 6 * 4) as f32;

        engine.forward_in_place(cube.data_mut());
        engine.inverse_in_place(cube.data_mut());
        for v in 0..4 {
            for y in 0..6 {
                for x in 0..8 {
                    assert_relative_eq!(
                        cube.get(x, y, v),
                        n * reference.get(x, y, v),
                        epsilon = 1e-2,
                        max_relative = 1e-4
                    );
                }
            }
        }
    }

    #[test]
    fn test_flat_kernel_is_identity() {
        // Degenerate sigmas produce a flat kernel whose amplitude reduces
        // to exactly the 1/(X*Y*V) transform normalisation.
        let engine = ConvolutionEngine::new(8, 8, 4, PlanEffort::Estimate);
        let mut kernel = KernelCache::beam(0.0, 0.0, 0.0, (8, 8, 4), 1.0);
        kernel.update_sigma_v(0.0);

        let mut cube = filled_padded_cube(8, 8, 4);
        let reference = cube.clone();
        engine.convolve_in_place(cube.data_mut(), &kernel);
        for v in 0..4 {
            for y in 0..8 {
                for x in 0..8 {
                    assert_relative_eq!(
                        cube.get(x, y, v),
                        reference.get(x, y, v),
                        epsilon = 1e-4,
                        max_relative = 1e-4
                    );
                }
            }
        }
    }

    #[test]
    fn test_forward_into_preserves_source() {
        let engine = ConvolutionEngine::new(8, 6, 4, PlanEffort::Estimate);
        let cube = filled_padded_cube(8, 6, 4);
        let reference = cube.clone();
        let mut spectrum = engine.make_spectrum();
        engine.forward_into(cube.data(), &mut spectrum);
        assert_eq!(cube.data(), reference.data());

        // The spectrum matches the in-place transform of a copy.
        let mut copy = reference.clone();
        engine.forward_in_place(copy.data_mut());
        for (a, b) in spectrum.iter().zip(copy.data().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_dc_offset_raises_every_voxel() {
        let engine = ConvolutionEngine::new(6, 4, 2, PlanEffort::Estimate);
        let mut kernel = KernelCache::beam(0.0, 0.0, 0.0, (6, 4, 2), 1.0);
        kernel.update_sigma_v(0.0);

        let mut cube = Cube::padded_zeros(6, 4, 2);
        engine.forward_in_place(cube.data_mut());
        engine.apply_kernel(cube.data_mut(), &kernel);
        engine.add_dc(cube.data_mut(), 2.5);
        engine.inverse_in_place(cube.data_mut());
        for v in 0..2 {
            for y in 0..4 {
                for x in 0..6 {
                    assert_relative_eq!(cube.get(x, y, v), 2.5, epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_two_dimensional_case() {
        let engine = ConvolutionEngine::new(8, 8, 1, PlanEffort::Estimate);
        let mut kernel = KernelCache::beam(0.0, 0.0, 0.0, (8, 8, 1), 1.0);
        kernel.update_sigma_v(0.0);

        let mut cube = filled_padded_cube(8, 8, 1);
        let reference = cube.clone();
        engine.convolve_in_place(cube.data_mut(), &kernel);
        for y in 0..8 {
            for x in 0..8 {
                assert_relative_eq!(
                    cube.get(x, y, 0),
                    reference.get(x, y, 0),
                    epsilon = 1e-4,
                    max_relative = 1e-4
                );
            }
        }
    }
}
