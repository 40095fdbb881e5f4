use cf_cube::Cube;
use rayon::prelude::*;

/// Which reduction runs in the hot loop.
///
/// `Flagged` skips observed samples that fail the `v == v` test (the
/// canonical non-finite check); `Unflagged` reduces every voxel without the
/// per-sample branch. The choice is made once per scan of the observation,
/// not per voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceStrategy {
    Unflagged,
    Flagged,
}

/// Scan the observation for non-finite samples and pick the strategy.
pub fn select_strategy(observation: &Cube) -> ReduceStrategy {
    for v in 0..observation.size_v() {
        for y in 0..observation.size_y() {
            for x in 0..observation.size_x() {
                let sample = observation.get(x, y, v);
                if sample != sample {
                    return ReduceStrategy::Flagged;
                }
            }
        }
    }
    ReduceStrategy::Unflagged
}

/// Reduce `(O - M)^2 [/ w]` over all logical voxels.
///
/// `weight`, when present, is the weight map in the same padded layout; the
/// sum of ratios is scaled by `norm` (`noiseweight^2` with a weight map,
/// `1/(sigma_rms^2 * noiseweight^2)` without). The v-axis is split across
/// the pool, one partial per v-slab, and the partials are summed in slab
/// order so repeated calls reduce in the same order.
pub fn chi_square(
    observation: &Cube,
    model: &Cube,
    weight: Option<&[f32]>,
    strategy: ReduceStrategy,
    norm: f64,
    pool: &rayon::ThreadPool,
) -> f64 {
    let (sx, sy, sv) = (
        observation.size_x(),
        observation.size_y(),
        observation.size_v(),
    );
    let stride = observation.stride_x();
    let plane = stride * sy;
    let obs = observation.data();
    let mod_ = model.data();

    let partials: Vec<f64> = pool.install(|| {
        (0..sv)
            .into_par_iter()
            .map(|v| {
                let base = v * plane;
                match (strategy, weight) {
                    (ReduceStrategy::Unflagged, None) => {
                        let mut sum = 0.0f64;
                        for y in 0..sy {
                            let row = base + y * stride;
                            for x in 0..sx {
                                let d = (obs[row + x] - mod_[row + x]) as f64;
                                sum += d * d;
                            }
                        }
                        sum
                    }
                    (ReduceStrategy::Unflagged, Some(w)) => {
                        let mut sum = 0.0f64;
                        for y in 0..sy {
                            let row = base + y * stride;
                            for x in 0..sx {
                                let d = (obs[row + x] - mod_[row + x]) as f64;
                                sum += d * d / w[row + x] as f64;
                            }
                        }
                        sum
                    }
                    (ReduceStrategy::Flagged, None) => {
                        let mut sum = 0.0f64;
                        for y in 0..sy {
                            let row = base + y * stride;
                            for x in 0..sx {
                                let o = obs[row + x];
                                if o == o {
                                    let d = (o - mod_[row + x]) as f64;
                                    sum += d * d;
                                }
                            }
                        }
                        sum
                    }
                    (ReduceStrategy::Flagged, Some(w)) => {
                        let mut sum = 0.0f64;
                        for y in 0..sy {
                            let row = base + y * stride;
                            for x in 0..sx {
                                let o = obs[row + x];
                                if o == o {
                                    let d = (o - mod_[row + x]) as f64;
                                    sum += d * d / w[row + x] as f64;
                                }
                            }
                        }
                        sum
                    }
                }
            })
            .collect()
    });

    partials.iter().sum::<f64>() * norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap()
    }

    fn ones_cube(x: usize, y: usize, v: usize) -> Cube {
        let mut cube = Cube::padded_zeros(x, y, v);
        for kv in 0..v {
            for j in 0..y {
                for i in 0..x {
                    cube.set(i, j, kv, 1.0);
                }
            }
        }
        cube
    }

    #[test]
    fn test_unflagged_plain_sum() {
        let obs = ones_cube(8, 8, 4);
        let model = Cube::padded_zeros(8, 8, 4);
        let strategy = select_strategy(&obs);
        assert_eq!(strategy, ReduceStrategy::Unflagged);
        let total = chi_square(&obs, &model, None, strategy, 1.0, &pool());
        assert_relative_eq!(total, 256.0, max_relative = 1e-12);
    }

    #[test]
    fn test_flag_scan_triggers_on_single_nan() {
        let mut obs = ones_cube(8, 8, 4);
        obs.set(0, 0, 0, f32::NAN);
        assert_eq!(select_strategy(&obs), ReduceStrategy::Flagged);
    }

    #[test]
    fn test_flagged_reduction_skips_non_finite() {
        let mut obs = ones_cube(8, 8, 4);
        obs.set(0, 0, 0, f32::NAN);
        let model = Cube::padded_zeros(8, 8, 4);
        let total = chi_square(
            &obs,
            &model,
            None,
            ReduceStrategy::Flagged,
            1.0,
            &pool(),
        );
        assert_relative_eq!(total, 255.0, max_relative = 1e-12);
    }

    #[test]
    fn test_weight_division_and_norm() {
        let obs = ones_cube(4, 4, 2);
        let model = Cube::padded_zeros(4, 4, 2);
        let weight = vec![4.0f32; obs.data().len()];
        let total = chi_square(
            &obs,
            &model,
            Some(&weight),
            ReduceStrategy::Unflagged,
            2.0,
            &pool(),
        );
        // 32 voxels, each contributing 1/4, scaled by 2.
        assert_relative_eq!(total, 16.0, max_relative = 1e-12);
    }

    #[test]
    fn test_pad_columns_ignored() {
        let mut obs = ones_cube(7, 3, 2);
        let model = Cube::padded_zeros(7, 3, 2);
        // Poison a pad column; the reduction must not read it.
        let stride = obs.stride_x();
        obs.data_mut()[7] = f32::NAN;
        assert_eq!(stride, 8);
        let total = chi_square(
            &obs,
            &model,
            None,
            ReduceStrategy::Unflagged,
            1.0,
            &pool(),
        );
        assert_relative_eq!(total, 42.0, max_relative = 1e-12);
    }
}
