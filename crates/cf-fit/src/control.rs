use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ErrorFlags, Result};
use crate::golden::Golden;
use crate::objective::Objective;
use crate::simplex::Simplex;
use crate::swarm::{Swarm, SwarmOptions};

/// The interchangeable minimisation algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Golden,
    Simplex,
    Swarm,
}

/// Verbs accepted by [`Fitter::act`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Begin a fresh run, or resume a stopped one.
    Start,
    /// Request a cooperative stop (normally issued through a
    /// [`StopHandle`] from inside the objective).
    Stop,
    /// Discard the stopped session so the next start resets everything.
    Break,
    /// Evaluate the objective once at the current parameters.
    Init,
    /// Drop all per-session state.
    Flush,
    /// Clear the error bitfield.
    ClearError,
}

/// Shared cooperative-stop flag.
///
/// The objective captures a clone and calls [`request_stop`]
/// (`StopHandle::request_stop`); the running fit checks the flag at the
/// top of every iteration, stops, and stays resumable.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

enum Backend {
    Golden(Golden),
    Simplex(Simplex),
    Swarm(Swarm),
}

/// Bookkeeping wrapper around the user objective.
///
/// Denormalises `x = d*y + o`, guards the argument domain, clamps range
/// errors to the representable extremes, and keeps call counters and
/// last/best state current. Back-ends only ever see this wrapper.
struct Tracker<'b> {
    inner: &'b mut (dyn Objective + 'b),
    origin: &'b [f64],
    norm: &'b [f64],
    phys: Vec<f64>,
    calls: &'b mut usize,
    all_calls: &'b mut usize,
    last_par: &'b mut Vec<f64>,
    last_norm_par: &'b mut Vec<f64>,
    last_value: &'b mut f64,
    best_par: &'b mut Vec<f64>,
    best_value: &'b mut f64,
    error: &'b mut ErrorFlags,
}

impl Tracker<'_> {
    fn denorm_into(origin: &[f64], norm: &[f64], y: &[f64], out: &mut [f64]) {
        for ((x, &yi), (&d, &o)) in out
            .iter_mut()
            .zip(y.iter())
            .zip(norm.iter().zip(origin.iter()))
        {
            *x = d * yi + o;
        }
    }

    fn clamp(value: f64) -> f64 {
        if value.is_nan() || value > f64::MAX {
            f64::MAX
        } else if value < -f64::MAX {
            -f64::MAX
        } else {
            value
        }
    }

    fn record(&mut self, y: &[f64], value: f64) {
        *self.calls += 1;
        *self.all_calls += 1;
        self.last_norm_par.copy_from_slice(y);
        self.last_par.copy_from_slice(&self.phys);
        *self.last_value = value;
        if value < *self.best_value {
            *self.best_value = value;
            self.best_par.copy_from_slice(&self.phys);
        }
    }
}

impl Objective for Tracker<'_> {
    fn eval(&mut self, y: &[f64]) -> f64 {
        Self::denorm_into(self.origin, self.norm, y, &mut self.phys);
        if self.phys.iter().any(|x| !x.is_finite()) {
            self.error.insert(ErrorFlags::OVERFLOW);
            return f64::MAX;
        }
        let value = Self::clamp(self.inner.eval(&self.phys));
        self.record(y, value);
        value
    }

    fn eval_batch(&mut self, npar: usize, xs: &[f64], out: &mut [f64]) {
        let rows = out.len();
        let mut phys_batch = vec![0.0f64; rows * npar];
        for (row, chunk) in xs.chunks(npar).enumerate() {
            Self::denorm_into(
                self.origin,
                self.norm,
                chunk,
                &mut phys_batch[row * npar..(row + 1) * npar],
            );
        }
        if phys_batch.iter().any(|x| !x.is_finite()) {
            self.error.insert(ErrorFlags::OVERFLOW);
            out.fill(f64::MAX);
            return;
        }
        self.inner.eval_batch(npar, &phys_batch, out);
        *self.calls += rows;
        *self.all_calls += rows;
        for slot in out.iter_mut() {
            *slot = Self::clamp(*slot);
        }
        let mut best_row = 0;
        for (row, &value) in out.iter().enumerate() {
            if value < out[best_row] {
                best_row = row;
            }
        }
        if rows > 0 {
            let last = rows - 1;
            self.last_norm_par
                .copy_from_slice(&xs[last * npar..(last + 1) * npar]);
            self.last_par
                .copy_from_slice(&phys_batch[last * npar..(last + 1) * npar]);
            *self.last_value = out[last];
            if out[best_row] < *self.best_value {
                *self.best_value = out[best_row];
                self.best_par
                    .copy_from_slice(&phys_batch[best_row * npar..(best_row + 1) * npar]);
            }
        }
    }
}

/// The minimiser acquisition object.
///
/// Holds the configuration (typed counterparts of the put/get keys), the
/// selected algorithm back-end, and the run bookkeeping. Internally every
/// algorithm works on the normalised vector `y = (x - o)/d`; each
/// evaluation denormalises before reaching the user objective.
///
/// A fit runs synchronously inside [`act`]`(Action::Start)` until the
/// loop/stop criteria, the call/iteration caps, an error, or a cooperative
/// stop. Stopped fits resume on the next start; broken or flushed sessions
/// start over.
///
/// [`act`]: Self::act
pub struct Fitter<'a> {
    method: Method,
    npar: usize,
    guess: Option<Vec<f64>>,
    origin: Option<Vec<f64>>,
    step: Option<Vec<f64>>,
    norm: Option<Vec<f64>>,
    lower: Option<Vec<f64>>,
    upper: Option<Vec<f64>>,
    max_calls: usize,
    max_iters: usize,
    max_calls_iter: usize,
    stop_size: f64,
    loops: usize,
    calls_iter_factor: f64,
    step_factor: f64,
    stop_size_factor: f64,
    ind_points: f64,
    seed: (u32, u32),
    swarm_opt: SwarmOptions,
    objective: Option<Box<dyn Objective + 'a>>,

    backend: Option<Backend>,
    stopped: bool,
    busy: bool,
    error: ErrorFlags,
    stop_flag: Arc<AtomicBool>,

    run_origin: Vec<f64>,
    run_norm: Vec<f64>,
    cur_steps: Vec<f64>,
    cur_stop_size: f64,
    cur_calls_iter: usize,
    finished_loops: usize,
    planned_loops: usize,

    calls: usize,
    iters: usize,
    all_calls: usize,
    all_iters: usize,
    all_loops: usize,
    min_runs: usize,
    last_par: Vec<f64>,
    last_norm_par: Vec<f64>,
    last_value: f64,
    best_par: Vec<f64>,
    best_value: f64,
    sol_par: Vec<f64>,
    sol_value: f64,
    sol_size: f64,
}

impl Default for Fitter<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Fitter<'a> {
    pub fn new() -> Self {
        Fitter {
            method: Method::Golden,
            npar: 0,
            guess: None,
            origin: None,
            step: None,
            norm: None,
            lower: None,
            upper: None,
            max_calls: usize::MAX,
            max_iters: usize::MAX,
            max_calls_iter: usize::MAX,
            // In normalised units the start size is 1.0, which is also the
            // default stopping size.
            stop_size: 1.0,
            loops: 1,
            calls_iter_factor: 1.0,
            step_factor: 1.0,
            stop_size_factor: 1.0,
            ind_points: 0.0,
            seed: (1, 1),
            swarm_opt: SwarmOptions::default(),
            objective: None,
            backend: None,
            stopped: false,
            busy: false,
            error: ErrorFlags::NONE,
            stop_flag: Arc::new(AtomicBool::new(false)),
            run_origin: Vec::new(),
            run_norm: Vec::new(),
            cur_steps: Vec::new(),
            cur_stop_size: 0.0,
            cur_calls_iter: usize::MAX,
            finished_loops: 0,
            planned_loops: 1,
            calls: 0,
            iters: 0,
            all_calls: 0,
            all_iters: 0,
            all_loops: 0,
            min_runs: 0,
            last_par: Vec::new(),
            last_norm_par: Vec::new(),
            last_value: f64::MAX,
            best_par: Vec::new(),
            best_value: f64::MAX,
            sol_par: Vec::new(),
            sol_value: f64::MAX,
            sol_size: f64::MAX,
        }
    }

    // ---- guards -------------------------------------------------------

    fn guard_put(&self) -> Result<()> {
        if !self.error.is_empty() {
            return Err(self.error | ErrorFlags::ERROR_PRESENT);
        }
        if self.busy || self.stopped {
            return Err(ErrorFlags::BUSY);
        }
        Ok(())
    }

    fn check_len(&self, values: &[f64]) -> Result<()> {
        if self.npar == 0 || values.len() != self.npar {
            return Err(ErrorFlags::WRONG_PARAM);
        }
        Ok(())
    }

    // ---- put ----------------------------------------------------------

    pub fn put_method(&mut self, method: Method) -> Result<()> {
        self.guard_put()?;
        self.method = method;
        self.backend = None;
        Ok(())
    }

    /// Set the problem dimension. Clears every array input.
    pub fn put_npar(&mut self, npar: usize) -> Result<()> {
        self.guard_put()?;
        self.npar = npar;
        self.guess = None;
        self.origin = None;
        self.step = None;
        self.norm = None;
        self.lower = None;
        self.upper = None;
        self.backend = None;
        Ok(())
    }

    pub fn put_guess(&mut self, guess: &[f64]) -> Result<()> {
        self.guard_put()?;
        self.check_len(guess)?;
        self.guess = Some(guess.to_vec());
        Ok(())
    }

    /// Grid origin; defaults to the guess when never set.
    pub fn put_origin(&mut self, origin: &[f64]) -> Result<()> {
        self.guard_put()?;
        self.check_len(origin)?;
        self.origin = Some(origin.to_vec());
        Ok(())
    }

    /// Start step widths; default to the grid normalisation.
    pub fn put_step(&mut self, step: &[f64]) -> Result<()> {
        self.guard_put()?;
        self.check_len(step)?;
        self.step = Some(step.to_vec());
        Ok(())
    }

    /// Grid normalisation; defaults to the start steps. Zero components
    /// are rejected at start.
    pub fn put_norm(&mut self, norm: &[f64]) -> Result<()> {
        self.guard_put()?;
        self.check_len(norm)?;
        self.norm = Some(norm.to_vec());
        Ok(())
    }

    pub fn put_lower_bounds(&mut self, lower: &[f64]) -> Result<()> {
        self.guard_put()?;
        self.check_len(lower)?;
        self.lower = Some(lower.to_vec());
        Ok(())
    }

    pub fn put_upper_bounds(&mut self, upper: &[f64]) -> Result<()> {
        self.guard_put()?;
        self.check_len(upper)?;
        self.upper = Some(upper.to_vec());
        Ok(())
    }

    /// Attach the objective, resetting lifetime counters and best-fit
    /// state.
    pub fn put_objective<F: Objective + 'a>(&mut self, objective: F) -> Result<()> {
        self.guard_put()?;
        self.objective = Some(Box::new(objective));
        self.all_calls = 0;
        self.all_iters = 0;
        self.all_loops = 0;
        self.min_runs = 0;
        self.best_value = f64::MAX;
        self.last_value = f64::MAX;
        self.backend = None;
        Ok(())
    }

    /// Hot-replace the objective, keeping counters and best-fit state (for
    /// re-attaching the same function after an internal re-initialisation).
    pub fn put_objective_keep<F: Objective + 'a>(&mut self, objective: F) -> Result<()> {
        self.guard_put()?;
        self.objective = Some(Box::new(objective));
        Ok(())
    }

    pub fn put_max_calls(&mut self, max_calls: usize) -> Result<()> {
        self.guard_put()?;
        self.max_calls = max_calls;
        Ok(())
    }

    pub fn put_max_iters(&mut self, max_iters: usize) -> Result<()> {
        self.guard_put()?;
        self.max_iters = max_iters;
        Ok(())
    }

    pub fn put_max_calls_per_iter(&mut self, cap: usize) -> Result<()> {
        self.guard_put()?;
        if cap == 0 {
            return Err(ErrorFlags::WRONG_PARAM);
        }
        self.max_calls_iter = cap;
        Ok(())
    }

    pub fn put_stop_size(&mut self, stop_size: f64) -> Result<()> {
        self.guard_put()?;
        if !(stop_size >= 0.0) {
            return Err(ErrorFlags::WRONG_PARAM);
        }
        self.stop_size = stop_size;
        Ok(())
    }

    pub fn put_loops(&mut self, loops: usize) -> Result<()> {
        self.guard_put()?;
        if loops == 0 {
            return Err(ErrorFlags::WRONG_PARAM);
        }
        self.loops = loops;
        Ok(())
    }

    pub fn put_calls_per_iter_factor(&mut self, factor: f64) -> Result<()> {
        self.guard_put()?;
        if !(factor > 0.0) {
            return Err(ErrorFlags::WRONG_PARAM);
        }
        self.calls_iter_factor = factor;
        Ok(())
    }

    pub fn put_step_factor(&mut self, factor: f64) -> Result<()> {
        self.guard_put()?;
        if !(factor > 0.0) {
            return Err(ErrorFlags::WRONG_PARAM);
        }
        self.step_factor = factor;
        Ok(())
    }

    pub fn put_stop_size_factor(&mut self, factor: f64) -> Result<()> {
        self.guard_put()?;
        if !(factor > 0.0) {
            return Err(ErrorFlags::WRONG_PARAM);
        }
        self.stop_size_factor = factor;
        Ok(())
    }

    /// Number of independent data points, for the reduced values. Must
    /// exceed `npar + 1`.
    pub fn put_ind_points(&mut self, ind_points: f64) -> Result<()> {
        self.guard_put()?;
        if !(ind_points > (self.npar + 1) as f64) {
            return Err(ErrorFlags::WRONG_PARAM);
        }
        self.ind_points = ind_points;
        Ok(())
    }

    /// The two integers seeding the random stream.
    pub fn put_seed(&mut self, table_seed: u32, stream_seed: u32) -> Result<()> {
        self.guard_put()?;
        self.seed = (table_seed, stream_seed);
        Ok(())
    }

    pub fn put_swarm_options(&mut self, options: SwarmOptions) -> Result<()> {
        self.guard_put()?;
        if options.particles == 0 {
            return Err(ErrorFlags::WRONG_PARAM);
        }
        self.swarm_opt = options;
        Ok(())
    }

    // ---- act ----------------------------------------------------------

    pub fn act(&mut self, action: Action) -> Result<()> {
        if !self.error.is_empty() && action != Action::ClearError {
            return Err(self.error | ErrorFlags::ERROR_PRESENT);
        }
        match action {
            Action::Start => self.start(),
            Action::Stop => {
                if self.busy {
                    self.stop_flag.store(true, Ordering::SeqCst);
                    Ok(())
                } else {
                    Err(ErrorFlags::OBSOLETE_OP)
                }
            }
            Action::Break => {
                if self.stopped {
                    self.backend = None;
                    self.stopped = false;
                    Ok(())
                } else {
                    Err(ErrorFlags::OBSOLETE_OP)
                }
            }
            Action::Init => self.init_once(),
            Action::Flush => {
                self.backend = None;
                self.stopped = false;
                self.stop_flag.store(false, Ordering::SeqCst);
                Ok(())
            }
            Action::ClearError => {
                self.error.clear();
                Ok(())
            }
        }
    }

    /// A handle the objective can capture to request a cooperative stop.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop_flag))
    }

    // ---- getters ------------------------------------------------------

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn npar(&self) -> usize {
        self.npar
    }

    pub fn error(&self) -> ErrorFlags {
        self.error
    }

    pub fn busy(&self) -> bool {
        self.busy
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Value of the most recent objective call.
    pub fn actual_value(&self) -> f64 {
        self.last_value
    }

    /// Lowest value seen since the objective was attached.
    pub fn best_value(&self) -> f64 {
        self.best_value
    }

    /// Value of the solution of the last finished loop.
    pub fn solution_value(&self) -> f64 {
        self.sol_value
    }

    /// Characteristic size of the last finished loop.
    pub fn solution_size(&self) -> f64 {
        self.sol_size
    }

    /// Current characteristic size of the running back-end.
    pub fn size(&self) -> f64 {
        match &self.backend {
            Some(Backend::Golden(g)) => g.solution_size(),
            Some(Backend::Simplex(s)) => s.size(),
            Some(Backend::Swarm(sw)) => sw.delta(),
            None => self.sol_size,
        }
    }

    /// Axis currently refined by the golden-section back-end.
    pub fn current_param(&self) -> Option<usize> {
        match &self.backend {
            Some(Backend::Golden(g)) => Some(g.current_par()),
            _ => None,
        }
    }

    fn copy_out(&self, source: &[f64], out: &mut [f64]) -> Result<()> {
        if source.len() != self.npar || out.len() < self.npar {
            return Err(ErrorFlags::MISSING_INFO);
        }
        out[..self.npar].copy_from_slice(source);
        Ok(())
    }

    /// Parameters of the most recent objective call.
    pub fn actual_params(&self, out: &mut [f64]) -> Result<()> {
        self.copy_out(&self.last_par, out)
    }

    /// Normalised parameters of the most recent objective call.
    pub fn normalised_params(&self, out: &mut [f64]) -> Result<()> {
        self.copy_out(&self.last_norm_par, out)
    }

    pub fn best_params(&self, out: &mut [f64]) -> Result<()> {
        self.copy_out(&self.best_par, out)
    }

    pub fn solution_params(&self, out: &mut [f64]) -> Result<()> {
        self.copy_out(&self.sol_par, out)
    }

    fn reduced(&self, value: f64) -> Result<f64> {
        if self.ind_points > (self.npar + 1) as f64 {
            Ok(value / (self.ind_points - self.npar as f64))
        } else {
            Err(ErrorFlags::NO_MEANING)
        }
    }

    pub fn actual_value_reduced(&self) -> Result<f64> {
        self.reduced(self.last_value)
    }

    pub fn best_value_reduced(&self) -> Result<f64> {
        self.reduced(self.best_value)
    }

    pub fn solution_value_reduced(&self) -> Result<f64> {
        self.reduced(self.sol_value)
    }

    /// Calls in the current run.
    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Iterations in the current run.
    pub fn iters(&self) -> usize {
        self.iters
    }

    /// Finished loops in the current run.
    pub fn finished_loops(&self) -> usize {
        self.finished_loops
    }

    /// Loop count the run is working towards (the configured count, or the
    /// truncated one when golden section converged early).
    pub fn planned_loops(&self) -> usize {
        self.planned_loops
    }

    pub fn all_calls(&self) -> usize {
        self.all_calls
    }

    pub fn all_iters(&self) -> usize {
        self.all_iters
    }

    pub fn all_loops(&self) -> usize {
        self.all_loops
    }

    /// Completed minimisation runs since the objective was attached.
    pub fn min_runs(&self) -> usize {
        self.min_runs
    }

    pub fn stop_size(&self) -> f64 {
        self.stop_size
    }

    pub fn seed(&self) -> (u32, u32) {
        self.seed
    }

    pub fn swarm_options(&self) -> &SwarmOptions {
        &self.swarm_opt
    }

    // ---- session ------------------------------------------------------

    fn resolve_grid(&self) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>)> {
        if self.npar == 0 || self.objective.is_none() {
            return Err(ErrorFlags::MISSING_INFO);
        }
        let guess = match (&self.guess, &self.origin) {
            (Some(g), _) => g.clone(),
            (None, Some(o)) => o.clone(),
            (None, None) => return Err(ErrorFlags::MISSING_INFO),
        };
        let origin = self.origin.clone().unwrap_or_else(|| guess.clone());
        let (step, norm) = match (&self.step, &self.norm) {
            (Some(d), Some(nd)) => (d.clone(), nd.clone()),
            (Some(d), None) => (d.clone(), d.clone()),
            (None, Some(nd)) => (nd.clone(), nd.clone()),
            (None, None) => return Err(ErrorFlags::MISSING_INFO),
        };
        if norm.iter().any(|&d| d == 0.0) {
            return Err(ErrorFlags::WRONG_PARAM);
        }
        Ok((guess, origin, step, norm))
    }

    fn prepare_session(&mut self) -> Result<()> {
        let (guess, origin, step, norm) = self.resolve_grid()?;

        self.run_origin = origin;
        self.run_norm = norm;
        self.cur_steps = step
            .iter()
            .zip(self.run_norm.iter())
            .map(|(&d, &nd)| d / nd)
            .collect();
        self.cur_stop_size = self.stop_size;
        self.cur_calls_iter = self.max_calls_iter;
        self.finished_loops = 0;
        self.planned_loops = self.loops;
        self.calls = 0;
        self.iters = 0;

        let y0: Vec<f64> = guess
            .iter()
            .zip(self.run_origin.iter().zip(self.run_norm.iter()))
            .map(|(&g, (&o, &nd))| (g - o) / nd)
            .collect();

        self.last_par = guess.clone();
        self.last_norm_par = y0.clone();
        self.last_value = f64::MAX;
        if self.best_par.len() != self.npar {
            self.best_par = guess.clone();
        }
        self.sol_par = guess.clone();
        self.sol_value = f64::MAX;
        self.sol_size = f64::MAX;

        let mut backend = match self.method {
            Method::Golden => {
                let mut g = Golden::new(self.npar);
                g.start.copy_from_slice(&y0);
                g.steps.copy_from_slice(&self.cur_steps);
                g.max_calls_iter = self.cur_calls_iter;
                g.min_step = self.cur_stop_size;
                Backend::Golden(g)
            }
            Method::Simplex => {
                let mut s = Simplex::new(self.npar);
                s.start.copy_from_slice(&y0);
                s.steps.copy_from_slice(&self.cur_steps);
                Backend::Simplex(s)
            }
            Method::Swarm => {
                let (lower, upper) = match (&self.lower, &self.upper) {
                    (Some(l), Some(u)) => (l.clone(), u.clone()),
                    _ => return Err(ErrorFlags::MISSING_INFO),
                };
                let mut opt = self.swarm_opt.clone();
                if self.cur_stop_size > 0.0 {
                    opt.tolerance = self.cur_stop_size;
                }
                let mut sw = Swarm::new(self.npar, opt, self.seed);
                for j in 0..self.npar {
                    sw.lower[j] = (lower[j] - self.run_origin[j]) / self.run_norm[j];
                    sw.upper[j] = (upper[j] - self.run_origin[j]) / self.run_norm[j];
                    if sw.lower[j] > sw.upper[j] {
                        std::mem::swap(&mut sw.lower[j], &mut sw.upper[j]);
                    }
                }
                sw.guess.copy_from_slice(&y0);
                sw.init();
                Backend::Swarm(sw)
            }
        };

        // The golden and simplex back-ends make their first evaluation
        // here; the swarm evaluates its population on the first iteration.
        {
            let mut objective = self.objective.take().expect("objective checked above");
            match &mut backend {
                Backend::Golden(g) => {
                    let mut tracker = self.tracker(objective.as_mut());
                    g.init(&mut tracker);
                }
                Backend::Simplex(s) => {
                    let mut tracker = self.tracker(objective.as_mut());
                    s.init(&mut tracker);
                }
                Backend::Swarm(_) => {}
            }
            self.objective = Some(objective);
        }

        self.backend = Some(backend);
        Ok(())
    }

    fn tracker<'b>(&'b mut self, inner: &'b mut (dyn Objective + 'b)) -> Tracker<'b> {
        Tracker {
            inner,
            origin: &self.run_origin,
            norm: &self.run_norm,
            phys: vec![0.0; self.npar],
            calls: &mut self.calls,
            all_calls: &mut self.all_calls,
            last_par: &mut self.last_par,
            last_norm_par: &mut self.last_norm_par,
            last_value: &mut self.last_value,
            best_par: &mut self.best_par,
            best_value: &mut self.best_value,
            error: &mut self.error,
        }
    }

    fn denorm(&self, y: &[f64]) -> Vec<f64> {
        y.iter()
            .zip(self.run_norm.iter().zip(self.run_origin.iter()))
            .map(|(&yi, (&d, &o))| d * yi + o)
            .collect()
    }

    fn advance_loop_scaling(&mut self) {
        for s in self.cur_steps.iter_mut() {
            *s *= self.step_factor;
        }
        self.cur_stop_size *= self.stop_size_factor;
        let scaled = self.cur_calls_iter as f64 * self.calls_iter_factor;
        self.cur_calls_iter = if scaled >= usize::MAX as f64 {
            usize::MAX
        } else {
            (scaled as usize).max(1)
        };
    }

    fn check_size_underflow(&mut self, size: f64) {
        if size != 0.0 && size.abs() < f64::MIN_POSITIVE * 2.0 {
            self.error.insert(ErrorFlags::UNDERFLOW);
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.busy {
            return Err(ErrorFlags::BUSY);
        }
        if !self.stopped {
            self.prepare_session()?;
        }
        self.stopped = false;
        self.run()
    }

    fn init_once(&mut self) -> Result<()> {
        let (guess, origin, _step, norm) = self.resolve_grid()?;
        self.run_origin = origin;
        self.run_norm = norm;
        if self.last_par.len() != self.npar {
            self.last_par = guess.clone();
        }
        if self.last_norm_par.len() != self.npar {
            self.last_norm_par = vec![0.0; self.npar];
        }
        if self.best_par.len() != self.npar {
            self.best_par = guess.clone();
        }
        let y: Vec<f64> = self
            .last_par
            .iter()
            .zip(self.run_origin.iter().zip(self.run_norm.iter()))
            .map(|(&x, (&o, &d))| (x - o) / d)
            .collect();
        let mut objective = self.objective.take().expect("objective checked above");
        {
            let mut tracker = self.tracker(objective.as_mut());
            tracker.eval(&y);
        }
        self.objective = Some(objective);
        if self.error.is_empty() {
            Ok(())
        } else {
            Err(self.error)
        }
    }

    fn run(&mut self) -> Result<()> {
        self.busy = true;
        let mut backend = self.backend.take().expect("session prepared");
        let mut objective = self.objective.take().expect("objective present");

        let outcome = loop {
            if self.stop_flag.swap(false, Ordering::SeqCst) {
                self.stopped = true;
                break Ok(());
            }
            if !self.error.is_empty() {
                break Err(self.error);
            }
            if self.calls >= self.max_calls || self.iters >= self.max_iters {
                break Ok(());
            }

            match &mut backend {
                Backend::Golden(g) => {
                    let loops_before = g.loops();
                    let iters_before = g.iters();
                    {
                        let mut tracker = self.tracker(objective.as_mut());
                        g.step(&mut tracker);
                    }
                    let new_iters = g.iters() - iters_before;
                    self.iters += new_iters;
                    self.all_iters += new_iters;

                    if g.loops() > loops_before {
                        self.finished_loops += 1;
                        self.all_loops += 1;
                        self.sol_value = g.solution_value();
                        self.sol_par = self.denorm(g.solution_par());
                        self.sol_size = g.solution_size();
                        self.check_size_underflow(self.sol_size);

                        // An unchanged solution completes the remaining
                        // loops trivially; the loop count truncates to the
                        // work actually done.
                        if self.sol_size <= self.cur_stop_size {
                            self.planned_loops = self.finished_loops;
                        }
                        if self.finished_loops >= self.planned_loops {
                            break Ok(());
                        }
                        self.advance_loop_scaling();
                        g.steps.copy_from_slice(&self.cur_steps);
                        g.max_calls_iter = self.cur_calls_iter;
                        g.min_step = self.cur_stop_size;
                    }
                }
                Backend::Simplex(s) => {
                    {
                        let mut tracker = self.tracker(objective.as_mut());
                        s.step(&mut tracker);
                    }
                    self.iters += 1;
                    self.all_iters += 1;
                    let size = s.size();
                    self.check_size_underflow(size);

                    if size <= self.cur_stop_size {
                        self.finished_loops += 1;
                        self.all_loops += 1;
                        self.sol_value = s.best_value();
                        self.sol_par = self.denorm(s.best_par());
                        self.sol_size = size;
                        if self.finished_loops >= self.planned_loops {
                            break Ok(());
                        }
                        self.advance_loop_scaling();
                        let restart: Vec<f64> = s.best_par().to_vec();
                        s.start.copy_from_slice(&restart);
                        s.steps.copy_from_slice(&self.cur_steps);
                        let mut tracker = self.tracker(objective.as_mut());
                        s.init(&mut tracker);
                    }
                }
                Backend::Swarm(sw) => {
                    {
                        let mut tracker = self.tracker(objective.as_mut());
                        sw.step(&mut tracker);
                    }
                    self.iters += 1;
                    self.all_iters += 1;
                    self.check_size_underflow(sw.delta());

                    if sw.converged() {
                        self.finished_loops += 1;
                        self.all_loops += 1;
                        self.sol_value = sw.best_value();
                        self.sol_par = self.denorm(sw.best_par());
                        self.sol_size = sw.delta();
                        if self.finished_loops >= self.planned_loops {
                            break Ok(());
                        }
                        self.advance_loop_scaling();
                        if self.cur_stop_size > 0.0 {
                            sw.opt.tolerance = self.cur_stop_size;
                        }
                        let restart: Vec<f64> = sw.best_par().to_vec();
                        sw.guess.copy_from_slice(&restart);
                        sw.init();
                    }
                }
            }
        };

        self.objective = Some(objective);
        self.busy = false;
        match outcome {
            Ok(()) => {
                if self.stopped {
                    // Resumable: keep the session.
                    self.backend = Some(backend);
                } else {
                    self.min_runs += 1;
                    self.backend = None;
                }
                Ok(())
            }
            Err(flags) => {
                self.backend = None;
                Err(flags)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::cell::Cell;
    use std::rc::Rc;

    fn quadratic() -> impl FnMut(&[f64]) -> f64 {
        |p: &[f64]| (p[0] - 3.0) * (p[0] - 3.0) + (p[1] + 1.0) * (p[1] + 1.0)
    }

    fn basic_fitter<'a>(method: Method) -> Fitter<'a> {
        let mut fit = Fitter::new();
        fit.put_method(method).unwrap();
        fit.put_npar(2).unwrap();
        fit.put_guess(&[0.0, 0.0]).unwrap();
        fit.put_step(&[1.0, 1.0]).unwrap();
        fit.put_lower_bounds(&[-10.0, -10.0]).unwrap();
        fit.put_upper_bounds(&[10.0, 10.0]).unwrap();
        fit.put_stop_size(1e-6).unwrap();
        fit.put_max_calls_per_iter(200).unwrap();
        fit.put_max_calls(100_000).unwrap();
        fit.put_max_iters(100_000).unwrap();
        fit.put_objective(quadratic()).unwrap();
        fit
    }

    #[test]
    fn test_golden_converges_within_stop_size() {
        let mut fit = basic_fitter(Method::Golden);
        fit.put_loops(2).unwrap();
        fit.act(Action::Start).unwrap();

        let mut sol = [0.0; 2];
        fit.solution_params(&mut sol).unwrap();
        assert_abs_diff_eq!(sol[0], 3.0, epsilon = 1e-4);
        assert_abs_diff_eq!(sol[1], -1.0, epsilon = 1e-4);
        assert!(fit.calls() <= 600);
        assert!(fit.solution_value() < 1e-6);
    }

    #[test]
    fn test_all_methods_reach_the_minimum() {
        for method in [Method::Golden, Method::Simplex, Method::Swarm] {
            let mut fit = basic_fitter(method);
            fit.act(Action::Start).unwrap();
            let mut best = [0.0; 2];
            fit.best_params(&mut best).unwrap();
            assert_abs_diff_eq!(best[0], 3.0, epsilon = 1e-2);
            assert_abs_diff_eq!(best[1], -1.0, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_default_stop_size_terminates_on_step_width() {
        // No stop size, no per-iteration call cap: the run must end
        // through the default normalised stopping size of 1.0, with the
        // loop count truncated once the solution stops moving.
        let mut fit = Fitter::new();
        fit.put_npar(2).unwrap();
        fit.put_guess(&[0.0, 0.0]).unwrap();
        fit.put_step(&[1.0, 1.0]).unwrap();
        fit.put_loops(5).unwrap();
        fit.put_objective(quadratic()).unwrap();
        assert_eq!(fit.stop_size(), 1.0);

        fit.act(Action::Start).unwrap();
        assert!(fit.finished_loops() >= 1);
        assert!(fit.finished_loops() < 5);
        assert_eq!(fit.planned_loops(), fit.finished_loops());
        // Convergence at the coarse default, in a handful of calls.
        assert!(fit.calls() < 200);
        let mut sol = [0.0; 2];
        fit.solution_params(&mut sol).unwrap();
        assert!((sol[0] - 3.0).abs() <= 1.5);
        assert!((sol[1] + 1.0).abs() <= 1.5);
    }

    #[test]
    fn test_normalisation_hides_parameter_scales() {
        // Badly scaled axes; the grid normalisation equalises them.
        let mut fit = Fitter::new();
        fit.put_npar(2).unwrap();
        fit.put_guess(&[0.0, 0.0]).unwrap();
        fit.put_step(&[1000.0, 0.001]).unwrap();
        fit.put_stop_size(1e-6).unwrap();
        fit.put_max_calls_per_iter(200).unwrap();
        fit.put_loops(3).unwrap();
        fit.put_objective(|p: &[f64]| {
            let a = p[0] / 1000.0 - 2.0;
            let b = p[1] * 1000.0 + 1.0;
            a * a + b * b
        })
        .unwrap();
        fit.act(Action::Start).unwrap();

        let mut sol = [0.0; 2];
        fit.solution_params(&mut sol).unwrap();
        assert_abs_diff_eq!(sol[0] / 1000.0, 2.0, epsilon = 1e-3);
        assert_abs_diff_eq!(sol[1] * 1000.0, -1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_zero_norm_component_rejected() {
        let mut fit = Fitter::new();
        fit.put_npar(2).unwrap();
        fit.put_guess(&[0.0, 0.0]).unwrap();
        fit.put_step(&[1.0, 0.0]).unwrap();
        fit.put_objective(quadratic()).unwrap();
        assert_eq!(fit.act(Action::Start), Err(ErrorFlags::WRONG_PARAM));
    }

    #[test]
    fn test_missing_objective_rejected() {
        let mut fit = Fitter::new();
        fit.put_npar(2).unwrap();
        fit.put_guess(&[0.0, 0.0]).unwrap();
        fit.put_step(&[1.0, 1.0]).unwrap();
        assert_eq!(fit.act(Action::Start), Err(ErrorFlags::MISSING_INFO));
    }

    #[test]
    fn test_stop_resumes_with_same_best() {
        let stop_after = Rc::new(Cell::new(0usize));
        let counter = Rc::clone(&stop_after);

        let mut fit = Fitter::new();
        fit.put_npar(2).unwrap();
        fit.put_guess(&[0.0, 0.0]).unwrap();
        fit.put_step(&[1.0, 1.0]).unwrap();
        fit.put_stop_size(1e-8).unwrap();
        fit.put_max_calls_per_iter(100).unwrap();
        fit.put_loops(2).unwrap();
        let handle = fit.stop_handle();
        fit.put_objective(move |p: &[f64]| {
            counter.set(counter.get() + 1);
            if counter.get() == 25 {
                handle.request_stop();
            }
            (p[0] - 3.0) * (p[0] - 3.0) + (p[1] + 1.0) * (p[1] + 1.0)
        })
        .unwrap();

        fit.act(Action::Start).unwrap();
        assert!(fit.stopped());
        let best_at_stop = fit.best_value();
        let calls_at_stop = fit.calls();
        assert!(calls_at_stop >= 25);

        // Resume: the run continues from the same best-fit state.
        fit.act(Action::Start).unwrap();
        assert!(!fit.stopped());
        assert!(fit.best_value() <= best_at_stop);
        assert!(fit.calls() > calls_at_stop);
    }

    #[test]
    fn test_break_resets_run_counters() {
        let stop_after = Rc::new(Cell::new(0usize));
        let counter = Rc::clone(&stop_after);

        let mut fit = Fitter::new();
        fit.put_npar(2).unwrap();
        fit.put_guess(&[0.0, 0.0]).unwrap();
        fit.put_step(&[1.0, 1.0]).unwrap();
        fit.put_stop_size(1e-6).unwrap();
        fit.put_max_calls_per_iter(100).unwrap();
        let handle = fit.stop_handle();
        fit.put_objective(move |p: &[f64]| {
            counter.set(counter.get() + 1);
            if counter.get() % 25 == 0 {
                handle.request_stop();
            }
            (p[0] - 3.0) * (p[0] - 3.0) + (p[1] + 1.0) * (p[1] + 1.0)
        })
        .unwrap();

        fit.act(Action::Start).unwrap();
        assert!(fit.stopped());
        assert!(fit.calls() > 0);
        let lifetime_calls = fit.all_calls();

        fit.act(Action::Break).unwrap();
        assert!(!fit.stopped());
        fit.act(Action::Start).unwrap();
        // Run counters restarted from zero; lifetime counters kept going.
        assert!(fit.all_calls() > lifetime_calls);
        assert!(fit.calls() < fit.all_calls());
    }

    #[test]
    fn test_loop_scaling_keeps_counters_monotone() {
        let mut fit = basic_fitter(Method::Golden);
        fit.put_loops(3).unwrap();
        fit.put_step_factor(0.5).unwrap();
        fit.put_stop_size_factor(0.5).unwrap();
        fit.put_calls_per_iter_factor(0.9).unwrap();
        fit.act(Action::Start).unwrap();

        assert!(fit.finished_loops() >= 1);
        assert!(fit.finished_loops() <= fit.planned_loops());
        assert!(fit.all_iters() >= fit.finished_loops());
        assert!(fit.all_calls() >= fit.all_iters());
    }

    #[test]
    fn test_swarm_runs_reproduce_for_equal_seeds() {
        let run = || {
            let mut fit = basic_fitter(Method::Swarm);
            fit.put_seed(42, 17).unwrap();
            let mut options = SwarmOptions::default();
            options.particles = 20;
            fit.put_swarm_options(options).unwrap();
            fit.act(Action::Start).unwrap();
            let mut best = [0.0; 2];
            fit.best_params(&mut best).unwrap();
            (fit.best_value(), best, fit.calls(), fit.iters())
        };
        let (value_a, par_a, calls_a, iters_a) = run();
        let (value_b, par_b, calls_b, iters_b) = run();
        assert_eq!(value_a.to_bits(), value_b.to_bits());
        assert_eq!(par_a[0].to_bits(), par_b[0].to_bits());
        assert_eq!(par_a[1].to_bits(), par_b[1].to_bits());
        assert_eq!(calls_a, calls_b);
        assert_eq!(iters_a, iters_b);
    }

    #[test]
    fn test_overflow_blocks_until_cleared() {
        let mut fit = Fitter::new();
        fit.put_npar(1).unwrap();
        fit.put_guess(&[0.0]).unwrap();
        fit.put_step(&[1.0]).unwrap();
        fit.put_stop_size(1e-6).unwrap();
        fit.put_max_calls_per_iter(50).unwrap();
        fit.put_objective(|_p: &[f64]| f64::INFINITY).unwrap();
        // Range errors clamp to the representable maximum; the run finishes
        // without tripping the domain guard.
        assert!(fit.act(Action::Start).is_ok());
        assert_eq!(fit.best_value(), f64::MAX);

        // A diverging denormalised argument does trip it.
        let mut fit = Fitter::new();
        fit.put_npar(1).unwrap();
        fit.put_guess(&[0.0]).unwrap();
        fit.put_step(&[f64::MAX / 4.0]).unwrap();
        fit.put_max_calls_per_iter(200).unwrap();
        fit.put_stop_size(1e-6).unwrap();
        fit.put_objective(|p: &[f64]| -p[0]).unwrap();
        let err = fit.act(Action::Start).unwrap_err();
        assert!(err.contains(ErrorFlags::OVERFLOW));
        assert!(fit.error().contains(ErrorFlags::OVERFLOW));

        // Everything except ClearError is rejected now.
        assert!(fit.put_guess(&[1.0]).is_err());
        assert!(fit.act(Action::Start).is_err());
        fit.act(Action::ClearError).unwrap();
        assert!(fit.error().is_empty());
        assert!(fit.put_guess(&[1.0]).is_ok());
    }

    #[test]
    fn test_init_evaluates_once() {
        let mut fit = Fitter::new();
        fit.put_npar(2).unwrap();
        fit.put_guess(&[1.0, 2.0]).unwrap();
        fit.put_step(&[1.0, 1.0]).unwrap();
        fit.put_objective(quadratic()).unwrap();
        fit.act(Action::Init).unwrap();
        assert_eq!(fit.all_calls(), 1);
        assert_abs_diff_eq!(fit.actual_value(), 4.0 + 9.0, epsilon = 1e-12);
    }

    #[test]
    fn test_reduced_values_need_ind_points() {
        let mut fit = basic_fitter(Method::Golden);
        assert_eq!(fit.best_value_reduced(), Err(ErrorFlags::NO_MEANING));
        fit.put_ind_points(102.0).unwrap();
        fit.act(Action::Start).unwrap();
        let reduced = fit.best_value_reduced().unwrap();
        assert_abs_diff_eq!(reduced, fit.best_value() / 100.0, epsilon = 1e-12);
    }

    #[test]
    fn test_stop_verb_outside_run_is_obsolete() {
        let mut fit = basic_fitter(Method::Golden);
        assert_eq!(fit.act(Action::Stop), Err(ErrorFlags::OBSOLETE_OP));
        assert_eq!(fit.act(Action::Break), Err(ErrorFlags::OBSOLETE_OP));
        assert!(fit.act(Action::Flush).is_ok());
    }
}
