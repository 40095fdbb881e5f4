use crate::objective::Objective;
use crate::rng::ShuffleRng;

/// Divisor turning the smallest axis range into the initial mesh size when
/// no mesh size is configured.
const DELTA_FRACTION: f64 = 5.0;

/// Scatter half-width around the guess on axes without finite bounds.
const BOUND_LIMIT: f64 = 10.0;

/// Tunables of the particle-swarm / pattern-search back-end.
#[derive(Debug, Clone)]
pub struct SwarmOptions {
    /// Number of particles.
    pub particles: usize,
    /// Cognitional acceleration weight.
    pub cognition: f64,
    /// Social acceleration weight.
    pub social: f64,
    /// Per-axis velocity clip as a fraction of the axis range.
    pub max_velocity_factor: f64,
    /// Iterations over which the inertia ramps to its final value.
    pub iters_to_final_weight: usize,
    pub initial_weight: f64,
    pub final_weight: f64,
    /// Mesh growth factor on repeated poll success.
    pub delta_increase: f64,
    /// Mesh shrink factor on poll failure.
    pub delta_decrease: f64,
    /// Initial mesh size; derived from the bounds when absent.
    pub initial_delta: Option<f64>,
    /// Batch all active feasible particles into one objective call.
    pub vectorized: bool,
    /// Stopping tolerance on mesh size and velocity norm.
    pub tolerance: f64,
}

impl Default for SwarmOptions {
    fn default() -> Self {
        SwarmOptions {
            particles: 42,
            cognition: 0.5,
            social: 0.5,
            max_velocity_factor: 0.5,
            iters_to_final_weight: 8000,
            initial_weight: 0.9,
            final_weight: 0.4,
            delta_increase: 2.0,
            delta_decrease: 0.5,
            initial_delta: None,
            vectorized: true,
            tolerance: 1.0e-5,
        }
    }
}

#[inline]
fn projection(x: f64, lb: f64, ub: f64) -> f64 {
    if x < lb {
        lb
    } else if x > ub {
        ub
    } else {
        x
    }
}

/// Particle swarm with a pattern-search poll step on stalled generations.
///
/// Particles carry position, velocity, their own best position and an
/// active flag; the swarm leader additionally drives a mesh of size `delta`
/// polled over the positive basis `{+-e_i}` whenever a generation fails to
/// improve the leader. Particles whose best sits within `delta` of the
/// leader with velocity below `delta` are retired. All randomness comes
/// from the seeded [`ShuffleRng`] stream, so equal seeds reproduce runs
/// exactly.
#[derive(Debug, Clone)]
pub struct Swarm {
    npar: usize,
    pub opt: SwarmOptions,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub guess: Vec<f64>,

    x: Vec<f64>,
    v: Vec<f64>,
    y: Vec<f64>,
    fx: Vec<f64>,
    fy: Vec<f64>,
    active: Vec<bool>,
    sol: Vec<f64>,
    delta: f64,
    delta_cap: f64,
    max_norm_v: f64,
    gbest: usize,
    actives: usize,
    iter: usize,
    obj_calls: usize,
    poll_steps: usize,
    successful_polls: usize,
    max_v: Vec<f64>,
    alpha_max: Vec<f64>,
    last_success: Option<usize>,
    rng: ShuffleRng,

    batch_x: Vec<f64>,
    batch_fx: Vec<f64>,
    batch_idx: Vec<usize>,
}

impl Swarm {
    pub fn new(npar: usize, opt: SwarmOptions, seed: (u32, u32)) -> Self {
        let s = opt.particles;
        Swarm {
            npar,
            opt,
            lower: vec![f64::MIN; npar],
            upper: vec![f64::MAX; npar],
            guess: vec![0.0; npar],
            x: vec![0.0; s * npar],
            v: vec![0.0; s * npar],
            y: vec![0.0; s * npar],
            fx: vec![f64::MAX; s],
            fy: vec![f64::INFINITY; s],
            active: vec![true; s],
            sol: vec![0.0; npar],
            delta: 0.0,
            delta_cap: 0.0,
            max_norm_v: f64::MAX,
            gbest: 0,
            actives: s,
            iter: 0,
            obj_calls: 0,
            poll_steps: 0,
            successful_polls: 0,
            max_v: vec![f64::MAX; npar],
            alpha_max: vec![0.0; npar],
            last_success: None,
            rng: ShuffleRng::new(seed.0, seed.1),
            batch_x: vec![0.0; s.max(2 * npar) * npar],
            batch_fx: vec![0.0; s.max(2 * npar)],
            batch_idx: vec![0; s.max(2 * npar)],
        }
    }

    /// Seed the population: the guess becomes particle 0, the rest scatter
    /// uniformly over the bounds; velocities start at zero.
    pub fn init(&mut self) {
        let n = self.npar;
        let s = self.opt.particles;

        self.delta = match self.opt.initial_delta {
            Some(delta) => delta,
            None => {
                let mut min_range = f64::MAX;
                for j in 0..n {
                    let range = self.upper[j] - self.lower[j];
                    if range.is_finite() && range < min_range {
                        min_range = range;
                    }
                }
                if min_range < f64::MAX {
                    min_range / DELTA_FRACTION
                } else {
                    2.0 * self.opt.tolerance
                }
            }
        };
        self.delta_cap = self.delta;

        for j in 0..n {
            let range = self.upper[j] - self.lower[j];
            self.max_v[j] = if range.is_finite() {
                range * self.opt.max_velocity_factor
            } else {
                f64::MAX
            };
            self.x[j] = projection(self.guess[j], self.lower[j], self.upper[j]);
        }
        self.fy[0] = f64::INFINITY;
        self.active[0] = true;

        for i in 1..s {
            for j in 0..n {
                let range = self.upper[j] - self.lower[j];
                self.x[i * n + j] = if range.is_finite() {
                    self.rng.uniform(self.lower[j], self.upper[j])
                } else {
                    self.guess[j] + 2.0 * (self.rng.next_f64() - 0.5) * BOUND_LIMIT
                };
            }
            self.fy[i] = f64::INFINITY;
            self.active[i] = true;
        }

        self.v.fill(0.0);
        self.fx.fill(f64::MAX);
        self.y.copy_from_slice(&self.x);
        self.gbest = 0;
        self.actives = s;
        self.max_norm_v = f64::MAX;
        self.iter = 0;
        self.obj_calls = 0;
        self.poll_steps = 0;
        self.successful_polls = 0;
        self.last_success = None;
    }

    fn feasible(&self, i: usize) -> bool {
        let n = self.npar;
        (0..n).all(|j| {
            let xij = self.x[i * n + j];
            xij >= self.lower[j] && xij <= self.upper[j]
        })
    }

    /// One swarm generation: evaluate, update bests, poll on stall, then
    /// move every active particle and retire converged ones.
    pub fn step(&mut self, f: &mut dyn Objective) {
        let n = self.npar;
        let s = self.opt.particles;
        self.iter += 1;
        let mut success = false;

        if self.opt.vectorized {
            let mut m = 0;
            for i in 0..s {
                if self.active[i] && self.feasible(i) {
                    self.batch_x[m * n..(m + 1) * n].copy_from_slice(&self.x[i * n..(i + 1) * n]);
                    self.batch_idx[m] = i;
                    m += 1;
                }
            }
            if m > 0 {
                f.eval_batch(n, &self.batch_x[..m * n], &mut self.batch_fx[..m]);
                self.obj_calls += m;
            }
            for b in 0..m {
                self.fx[self.batch_idx[b]] = self.batch_fx[b];
            }
        } else {
            for i in 0..s {
                if !self.active[i] {
                    continue;
                }
                if self.feasible(i) {
                    self.fx[i] = f.eval(&self.x[i * n..(i + 1) * n]);
                    self.obj_calls += 1;
                } else {
                    self.fx[i] = f64::MAX;
                }
            }
        }

        for i in 0..s {
            if self.active[i] && self.fy[i] > self.fx[i] {
                self.fy[i] = self.fx[i];
                let src = i * n;
                for j in 0..n {
                    self.y[src + j] = self.x[src + j];
                }
                if self.fy[self.gbest] > self.fy[i] || self.gbest == i {
                    self.gbest = i;
                    success = true;
                    self.last_success = None;
                }
            }
        }

        if !success {
            if self.delta >= self.opt.tolerance {
                self.poll(f);
                self.poll_steps += 1;
            }
        } else {
            if self.delta < self.delta_cap {
                self.delta *= self.opt.delta_increase;
            }
            if self.delta < self.opt.tolerance {
                self.delta = 2.0 * self.opt.tolerance;
            }
        }

        // Inertia interpolates linearly to its final value.
        let weight = if self.iter < self.opt.iters_to_final_weight {
            self.opt.initial_weight
                - (self.opt.initial_weight - self.opt.final_weight) * self.iter as f64
                    / self.opt.iters_to_final_weight as f64
        } else {
            self.opt.final_weight
        };

        for i in 0..s {
            if !self.active[i] {
                continue;
            }
            for j in 0..n {
                let at = i * n + j;
                let r1 = self.rng.next_f64();
                let r2 = self.rng.next_f64();
                let vel = weight * self.v[at]
                    + self.opt.cognition * r1 * (self.y[at] - self.x[at])
                    + self.opt.social * r2 * (self.y[self.gbest * n + j] - self.x[at]);
                self.v[at] = projection(vel, -self.max_v[j], self.max_v[j]);
                self.alpha_max[j] = 1.0;
            }

            // Clip the step so the particle stays inside the box.
            for j in 0..n {
                let at = i * n + j;
                if self.v[at] < 0.0 {
                    let limit = (self.lower[j] - self.x[at]) / self.v[at];
                    if self.alpha_max[j] > limit {
                        self.alpha_max[j] = limit;
                    }
                }
                if self.v[at] > 0.0 {
                    let limit = (self.upper[j] - self.x[at]) / self.v[at];
                    if self.alpha_max[j] > limit {
                        self.alpha_max[j] = limit;
                    }
                }
                if self.alpha_max[j] < 0.0 {
                    self.alpha_max[j] = 0.0;
                }
            }

            for j in 0..n {
                let at = i * n + j;
                self.x[at] = projection(
                    self.x[at] + self.alpha_max[j] * self.v[at],
                    self.lower[j],
                    self.upper[j],
                );
            }
        }

        // Leader velocity norm seeds the maximum.
        let mut norm = 0.0f64;
        for j in 0..n {
            norm += self.v[self.gbest * n + j] * self.v[self.gbest * n + j];
        }
        self.max_norm_v = norm.sqrt();

        // Retire particles parked on the leader and track the largest
        // remaining velocity.
        self.actives = 0;
        for i in 0..s {
            if self.active[i] && i != self.gbest {
                let mut dist = 0.0f64;
                let mut vel = 0.0f64;
                for j in 0..n {
                    let dy = self.y[i * n + j] - self.y[self.gbest * n + j];
                    dist += dy * dy;
                    vel += self.v[i * n + j] * self.v[i * n + j];
                }
                let dist = dist.sqrt();
                let vel = vel.sqrt();
                if dist < self.delta && vel < self.delta {
                    self.active[i] = false;
                } else if self.max_norm_v < vel {
                    self.max_norm_v = vel;
                }
            }
            if self.active[i] {
                self.actives += 1;
            }
        }

        self.sol
            .copy_from_slice(&self.y[self.gbest * n..(self.gbest + 1) * n]);
    }

    /// Pattern-search poll around the leader over the positive basis
    /// `{+e_0.., -e_0..}`. Repeating the previously successful direction
    /// grows the mesh; a failed poll shrinks it.
    fn poll(&mut self, f: &mut dyn Objective) {
        let n = self.npar;
        let directions = 2 * n;
        let base = self.gbest * n;

        let trial_feasible = |point: &[f64], lower: &[f64], upper: &[f64]| {
            point
                .iter()
                .zip(lower.iter().zip(upper.iter()))
                .all(|(&p, (&lb, &ub))| p >= lb && p <= ub)
        };

        let mut best_dir: Option<usize> = None;
        let mut best_value = f64::MAX;

        if self.opt.vectorized {
            let mut m = 0;
            for dir in 0..directions {
                let (axis, sign) = (dir % n, if dir < n { 1.0 } else { -1.0 });
                for j in 0..n {
                    self.batch_x[m * n + j] = self.y[base + j];
                }
                self.batch_x[m * n + axis] += sign * self.delta;
                if trial_feasible(
                    &self.batch_x[m * n..(m + 1) * n],
                    &self.lower,
                    &self.upper,
                ) {
                    self.batch_idx[m] = dir;
                    m += 1;
                }
            }
            if m > 0 {
                f.eval_batch(n, &self.batch_x[..m * n], &mut self.batch_fx[..m]);
                self.obj_calls += m;
            }
            for b in 0..m {
                if self.batch_fx[b] < best_value {
                    best_value = self.batch_fx[b];
                    best_dir = Some(self.batch_idx[b]);
                }
            }
        } else {
            let mut trial = vec![0.0; n];
            for dir in 0..directions {
                let (axis, sign) = (dir % n, if dir < n { 1.0 } else { -1.0 });
                trial.copy_from_slice(&self.y[base..base + n]);
                trial[axis] += sign * self.delta;
                if !trial_feasible(&trial, &self.lower, &self.upper) {
                    continue;
                }
                let value = f.eval(&trial);
                self.obj_calls += 1;
                if value < best_value {
                    best_value = value;
                    best_dir = Some(dir);
                    // Opportunistic: stop at the first improving direction.
                    if best_value < self.fy[self.gbest] {
                        break;
                    }
                }
            }
        }

        if best_value < self.fy[self.gbest] {
            let dir = best_dir.expect("an improving poll direction exists");
            self.successful_polls += 1;
            let (axis, sign) = (dir % n, if dir < n { 1.0 } else { -1.0 });
            self.y[base + axis] += sign * self.delta;
            self.fy[self.gbest] = best_value;
            if self.last_success == Some(dir) {
                self.delta *= self.opt.delta_increase;
            } else {
                self.last_success = Some(dir);
            }
        } else {
            self.delta *= self.opt.delta_decrease;
            self.last_success = None;
        }
    }

    /// The intrinsic stopping conditions: mesh and velocities below
    /// tolerance, or the swarm reduced to its leader on a fine mesh.
    pub fn converged(&self) -> bool {
        (self.max_norm_v < self.opt.tolerance && self.delta < self.opt.tolerance)
            || (self.actives <= 1 && self.delta < self.opt.tolerance)
    }

    pub fn best_value(&self) -> f64 {
        self.fy[self.gbest]
    }

    pub fn best_par(&self) -> &[f64] {
        &self.y[self.gbest * self.npar..(self.gbest + 1) * self.npar]
    }

    pub fn solution(&self) -> &[f64] {
        &self.sol
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn actives(&self) -> usize {
        self.actives
    }

    pub fn iters(&self) -> usize {
        self.iter
    }

    pub fn calls(&self) -> usize {
        self.obj_calls
    }

    pub fn poll_steps(&self) -> usize {
        self.poll_steps
    }

    pub fn successful_polls(&self) -> usize {
        self.successful_polls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn quadratic() -> impl FnMut(&[f64]) -> f64 {
        |p: &[f64]| (p[0] - 3.0) * (p[0] - 3.0) + (p[1] + 1.0) * (p[1] + 1.0)
    }

    fn make_swarm(seed: (u32, u32), particles: usize) -> Swarm {
        let mut swarm = Swarm::new(
            2,
            SwarmOptions {
                particles,
                tolerance: 1e-7,
                ..SwarmOptions::default()
            },
            seed,
        );
        swarm.lower.copy_from_slice(&[-10.0, -10.0]);
        swarm.upper.copy_from_slice(&[10.0, 10.0]);
        swarm.guess.copy_from_slice(&[0.0, 0.0]);
        swarm.init();
        swarm
    }

    fn run(swarm: &mut Swarm, f: &mut dyn Objective, max_iters: usize) {
        while !swarm.converged() && swarm.iters() < max_iters {
            swarm.step(f);
        }
    }

    #[test]
    fn test_converges_on_quadratic() {
        let mut f = quadratic();
        let mut swarm = make_swarm((42, 17), 20);
        run(&mut swarm, &mut f, 5000);
        assert_abs_diff_eq!(swarm.best_par()[0], 3.0, epsilon = 1e-3);
        assert_abs_diff_eq!(swarm.best_par()[1], -1.0, epsilon = 1e-3);
        assert!(swarm.best_value() < 1e-5);
    }

    #[test]
    fn test_identical_seeds_reproduce_runs() {
        let mut fa = quadratic();
        let mut fb = quadratic();
        let mut a = make_swarm((42, 17), 20);
        let mut b = make_swarm((42, 17), 20);
        run(&mut a, &mut fa, 3000);
        run(&mut b, &mut fb, 3000);

        assert_eq!(a.iters(), b.iters());
        assert_eq!(a.calls(), b.calls());
        assert_eq!(a.best_value().to_bits(), b.best_value().to_bits());
        for (x, y) in a.best_par().iter().zip(b.best_par().iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn test_scalar_mode_also_converges() {
        let mut f = quadratic();
        let mut swarm = Swarm::new(
            2,
            SwarmOptions {
                particles: 20,
                vectorized: false,
                tolerance: 1e-7,
                ..SwarmOptions::default()
            },
            (5, 6),
        );
        swarm.lower.copy_from_slice(&[-10.0, -10.0]);
        swarm.upper.copy_from_slice(&[10.0, 10.0]);
        swarm.guess.copy_from_slice(&[0.0, 0.0]);
        swarm.init();
        run(&mut swarm, &mut f, 5000);
        assert!(swarm.best_value() < 1e-4);
    }

    #[test]
    fn test_particles_stay_in_bounds() {
        let mut f = quadratic();
        let mut swarm = make_swarm((1, 2), 15);
        for _ in 0..50 {
            swarm.step(&mut f);
            let n = 2;
            for i in 0..15 {
                for j in 0..n {
                    let x = swarm.x[i * n + j];
                    assert!((-10.0..=10.0).contains(&x));
                }
            }
        }
    }

    #[test]
    fn test_poll_steps_happen_on_stall() {
        let mut f = quadratic();
        let mut swarm = make_swarm((9, 4), 10);
        run(&mut swarm, &mut f, 4000);
        // A converged run must have exercised the pattern search.
        assert!(swarm.poll_steps() > 0);
        assert!(swarm.successful_polls() <= swarm.poll_steps());
    }
}
