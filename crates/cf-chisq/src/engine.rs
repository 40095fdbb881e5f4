use cf_cube::Cube;

use crate::convolve::{ConvolutionEngine, PlanEffort};
use crate::error::{EngineError, Result};
use crate::kernel::{KernelCache, SIGMA_PER_HPBW};
use crate::reduce::{self, ReduceStrategy};
use crate::weight::WeightMap;

/// The three engine mode bits.
///
/// Bit 0 enables the quantisation-noise weight map, bit 1 the tabulated xy
/// exponent image, bit 2 out-of-place transforms (extra spectrum buffers,
/// potentially faster plans).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineMode {
    pub weight_map: bool,
    pub exp_image: bool,
    pub out_of_place: bool,
}

impl EngineMode {
    /// Decode from the packed bit form (bit 0 weight, bit 1 exp image,
    /// bit 2 out-of-place).
    pub fn from_bits(bits: u8) -> Self {
        EngineMode {
            weight_map: bits & 1 != 0,
            exp_image: bits & 2 != 0,
            out_of_place: bits & 4 != 0,
        }
    }

    pub fn bits(&self) -> u8 {
        (self.weight_map as u8) | (self.exp_image as u8) << 1 | (self.out_of_place as u8) << 2
    }
}

/// Everything the engine needs besides the two cubes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Beam major axis HPBW in pixels.
    pub hpbw_maj: f32,
    /// Beam minor axis HPBW in pixels.
    pub hpbw_min: f32,
    /// Beam position angle in degrees, north through east.
    pub pa: f32,
    /// Factor converting model units to observation units.
    pub scale: f32,
    /// Flux of one point source of the model realization.
    pub point_flux: f32,
    /// Detector noise rms of the observation.
    pub sigma_rms: f32,
    pub mode: EngineMode,
    /// Mix between detector noise and quantisation noise; forced to 1 when
    /// the weight map is disabled.
    pub noise_weight: f32,
    pub plan_effort: PlanEffort,
    /// Worker threads for the reduction and the per-plane transform passes.
    /// 0 lets the pool pick the machine's logical core count.
    pub threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            hpbw_maj: 1.0,
            hpbw_min: 1.0,
            pa: 0.0,
            scale: 1.0,
            point_flux: 1.0,
            sigma_rms: 1.0,
            mode: EngineMode::default(),
            noise_weight: 1.0,
            plan_effort: PlanEffort::Estimate,
            threads: 1,
        }
    }
}

/// The chi-square evaluation engine.
///
/// Owns the observation, the model realization, the optional weight map,
/// both kernel caches, the FFT plans and the thread pool, so several
/// engines can coexist in one process. One evaluation convolves the model
/// in place with the beam and the line-spread function of the requested
/// dispersion and reduces the weighted squared residuals; the caller
/// repopulates the model through [`model_mut`](Self::model_mut) between
/// evaluations.
///
/// An evaluation runs to completion once entered; cancellation mid-transform
/// is not supported, so cooperative stops belong between evaluations.
pub struct ChiSquareEngine {
    observation: Cube,
    model: Cube,
    conv: ConvolutionEngine,
    kernel_model: KernelCache,
    kernel_weight: Option<KernelCache>,
    weight: Option<WeightMap>,
    spectrum_model: Option<Vec<f32>>,
    spectrum_weight: Option<Vec<f32>>,
    mode: EngineMode,
    noise_weight: f32,
    sigma_rms: f32,
    strategy: ReduceStrategy,
    pool: rayon::ThreadPool,
    last_chi_square: f64,
}

impl ChiSquareEngine {
    /// Set up the engine for repeated evaluations against `observation`.
    ///
    /// Both cubes must share logical extents and already be in the padded
    /// layout. Kernel caches, plans, buffers and the reduction strategy are
    /// all prepared here; `evaluate` does no allocation.
    pub fn new(observation: Cube, model: Cube, config: EngineConfig) -> Result<Self> {
        let obs_dims = (
            observation.size_x(),
            observation.size_y(),
            observation.size_v(),
        );
        let model_dims = (model.size_x(), model.size_y(), model.size_v());
        if obs_dims != model_dims {
            return Err(EngineError::ShapeMismatch {
                obs: obs_dims,
                model: model_dims,
            });
        }
        if !observation.is_padded() || !model.is_padded() {
            return Err(EngineError::UnpaddedCube);
        }
        if config.sigma_rms <= 0.0 {
            return Err(EngineError::InvalidNoise(config.sigma_rms));
        }
        if config.hpbw_maj < 0.0 || config.hpbw_min < 0.0 {
            return Err(EngineError::InvalidBeam {
                maj: config.hpbw_maj,
                min: config.hpbw_min,
            });
        }

        let noise_weight = if config.mode.weight_map {
            if config.noise_weight <= 0.0 {
                return Err(EngineError::InvalidNoiseWeight(config.noise_weight));
            }
            config.noise_weight
        } else {
            1.0
        };

        let sigma_maj = SIGMA_PER_HPBW * config.hpbw_maj;
        let sigma_min = SIGMA_PER_HPBW * config.hpbw_min;
        let pa = config.pa.to_radians();

        let conv = ConvolutionEngine::new(obs_dims.0, obs_dims.1, obs_dims.2, config.plan_effort);

        let mut kernel_model = KernelCache::beam(sigma_maj, sigma_min, pa, obs_dims, config.scale);
        if config.mode.exp_image {
            kernel_model.build_exp_image();
        }

        let (kernel_weight, weight) = if config.mode.weight_map {
            let mut kernel = KernelCache::half_beam(
                sigma_maj,
                sigma_min,
                pa,
                obs_dims,
                config.scale,
                config.point_flux,
            );
            if config.mode.exp_image {
                kernel.build_exp_image();
            }
            let baseline = config.sigma_rms * config.sigma_rms * noise_weight * noise_weight;
            let map = WeightMap::new(&conv, baseline);
            (Some(kernel), Some(map))
        } else {
            (None, None)
        };

        let (spectrum_model, spectrum_weight) = if config.mode.out_of_place {
            (
                Some(conv.make_spectrum()),
                config.mode.weight_map.then(|| conv.make_spectrum()),
            )
        } else {
            (None, None)
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()
            .map_err(|e| EngineError::ThreadPool(e.to_string()))?;

        let strategy = reduce::select_strategy(&observation);

        Ok(ChiSquareEngine {
            observation,
            model,
            conv,
            kernel_model,
            kernel_weight,
            weight,
            spectrum_model,
            spectrum_weight,
            mode: config.mode,
            noise_weight,
            sigma_rms: config.sigma_rms,
            strategy,
            pool,
            last_chi_square: 0.0,
        })
    }

    /// The model cube; populate it with the current point-source
    /// realization before calling [`evaluate`](Self::evaluate).
    pub fn model_mut(&mut self) -> &mut Cube {
        &mut self.model
    }

    pub fn model(&self) -> &Cube {
        &self.model
    }

    pub fn observation(&self) -> &Cube {
        &self.observation
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    /// Rescan the observation for non-finite samples and re-select the
    /// reduction strategy. Run this after changing the observation's flags.
    pub fn refresh_flags(&mut self) {
        self.strategy = reduce::select_strategy(&self.observation);
    }

    /// One chi-square evaluation at spectral dispersion `sigma_v`.
    ///
    /// Overwrites the model cube with the convolved model M. Kernel caches
    /// refresh only when `sigma_v` differs from the previous call; the
    /// weight map, when enabled, is rebuilt every call since the model has
    /// changed.
    pub fn evaluate(&mut self, sigma_v: f32) -> f64 {
        if let (Some(kernel), Some(map)) = (self.kernel_weight.as_mut(), self.weight.as_mut()) {
            kernel.update_sigma_v(sigma_v);
            let conv = &self.conv;
            let model = self.model.data();
            let spectrum = self.spectrum_weight.as_mut();
            self.pool
                .install(|| map.build(conv, kernel, model, spectrum));
        }

        self.kernel_model.update_sigma_v(sigma_v);
        {
            let conv = &self.conv;
            let kernel = &self.kernel_model;
            let data = self.model.data_mut();
            match self.spectrum_model.as_mut() {
                Some(spec) => self.pool.install(|| {
                    conv.forward_into(data, spec);
                    conv.apply_kernel(spec, kernel);
                    conv.inverse_into(spec, data);
                }),
                None => self.pool.install(|| conv.convolve_in_place(data, kernel)),
            }
        }

        let norm = if self.weight.is_some() {
            (self.noise_weight * self.noise_weight) as f64
        } else {
            1.0 / (self.sigma_rms as f64 * self.sigma_rms as f64
                * self.noise_weight as f64
                * self.noise_weight as f64)
        };
        let chi_square = reduce::chi_square(
            &self.observation,
            &self.model,
            self.weight.as_ref().map(|w| w.data()),
            self.strategy,
            norm,
            &self.pool,
        );
        self.last_chi_square = chi_square;
        chi_square
    }

    /// The value returned by the most recent evaluation.
    pub fn last_chi_square(&self) -> f64 {
        self.last_chi_square
    }

    /// Reserved chi-square probability hook. The upstream interface
    /// declares this conversion but never defined its semantics; it stays
    /// an extension point and currently reports `None`.
    pub fn probability(&self, _chi_square: f64, _dof: f64) -> Option<f64> {
        None
    }
}
