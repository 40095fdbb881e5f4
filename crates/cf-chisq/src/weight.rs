use crate::convolve::ConvolutionEngine;
use crate::kernel::KernelCache;

/// The spatially varying noise-variance cube.
///
/// Holds `(P * g_half) + sigma_rms^2 * noiseweight^2` in the padded layout
/// shared with the model cube, where `g_half` is the half-beam kernel with
/// point-source flux and velocity normalisation folded into its amplitude.
/// The map is never inverted: the reduction divides by it per voxel.
pub struct WeightMap {
    data: Vec<f32>,
    /// Constant detector-noise baseline added to the DC coefficient.
    baseline: f32,
}

impl WeightMap {
    /// Allocate a weight map for the engine's cube shape.
    pub fn new(conv: &ConvolutionEngine, baseline: f32) -> Self {
        WeightMap {
            data: conv.make_spectrum(),
            baseline,
        }
    }

    /// Rebuild the map from the current model realization.
    ///
    /// The model buffer is read but never modified. In the default layout
    /// the map's own storage doubles as the spectrum; with `spectrum`
    /// supplied (out-of-place mode) the transform work happens there.
    pub fn build(
        &mut self,
        conv: &ConvolutionEngine,
        kernel: &KernelCache,
        model: &[f32],
        spectrum: Option<&mut Vec<f32>>,
    ) {
        match spectrum {
            Some(spec) => {
                conv.forward_into(model, spec);
                conv.apply_kernel(spec, kernel);
                conv.add_dc(spec, self.baseline);
                conv.inverse_into(spec, &mut self.data);
            }
            None => {
                conv.forward_into(model, &mut self.data);
                conv.apply_kernel(&mut self.data, kernel);
                conv.add_dc(&mut self.data, self.baseline);
                conv.inverse_in_place(&mut self.data);
            }
        }
    }

    /// The map in the padded layout.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn baseline(&self) -> f32 {
        self.baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolve::PlanEffort;
    use approx::assert_relative_eq;
    use cf_cube::Cube;

    #[test]
    fn test_zero_model_gives_flat_baseline() {
        let conv = ConvolutionEngine::new(8, 8, 4, PlanEffort::Estimate);
        let mut kernel = KernelCache::half_beam(1.5, 1.2, 0.0, (8, 8, 4), 1.0, 0.1);
        kernel.update_sigma_v(1.0);

        let model = Cube::padded_zeros(8, 8, 4);
        let mut map = WeightMap::new(&conv, 4.0);
        map.build(&conv, &kernel, model.data(), None);

        let stride = model.stride_x();
        for v in 0..4 {
            for y in 0..8 {
                for x in 0..8 {
                    let at = x + stride * (y + 8 * v);
                    assert_relative_eq!(map.data()[at], 4.0, epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_out_of_place_matches_in_place() {
        let conv = ConvolutionEngine::new(8, 6, 4, PlanEffort::Estimate);
        let mut kernel = KernelCache::half_beam(1.5, 1.2, 0.4, (8, 6, 4), 0.7, 0.2);
        kernel.update_sigma_v(0.8);

        let mut model = Cube::padded_zeros(8, 6, 4);
        model.set(3, 2, 1, 5.0);
        model.set(6, 4, 3, 2.0);

        let mut direct = WeightMap::new(&conv, 1.5);
        direct.build(&conv, &kernel, model.data(), None);

        let mut spectrum = conv.make_spectrum();
        let mut buffered = WeightMap::new(&conv, 1.5);
        buffered.build(&conv, &kernel, model.data(), Some(&mut spectrum));

        for (a, b) in direct.data().iter().zip(buffered.data().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_model_preserved_by_build() {
        let conv = ConvolutionEngine::new(8, 8, 2, PlanEffort::Estimate);
        let mut kernel = KernelCache::half_beam(2.0, 2.0, 0.0, (8, 8, 2), 1.0, 1.0);
        kernel.update_sigma_v(1.0);

        let mut model = Cube::padded_zeros(8, 8, 2);
        model.set(4, 4, 1, 3.0);
        let reference = model.clone();

        let mut map = WeightMap::new(&conv, 1.0);
        map.build(&conv, &kernel, model.data(), None);
        assert_eq!(model.data(), reference.data());
    }
}
