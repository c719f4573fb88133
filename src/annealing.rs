//! Serial simulated annealing over column-organized constraint data.
//!
//! One iteration perturbs one rupture rate. Only the rows of that rupture's
//! column change, so the energy change is computed from those rows alone
//! and the full energy is recomputed every [`ENERGY_RECOMPUTE_INTERVAL`]
//! iterations and at the end of every run.

use crate::completion::CompletionCriteria;
use crate::inputs::ColumnOrganizedData;
use crate::types::{ConstraintRowRange, Energy, InversionError, InversionState, IterationCounts, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

pub const ENERGY_RECOMPUTE_INTERVAL: u64 = 100_000;

/// Iteration horizon of the linear cooling schedule.
pub const LINEAR_COOLING_HORIZON: f64 = 100_000.0;

/// Stand-in for zero or negative entries of a variable perturbation basis.
pub const MIN_BASIS_VALUE: f64 = 1e-10;

const MAX_REDRAWS: usize = 10_000;

// ─────────────────────────────────────────────────────────────
//  Strategies
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoolingSchedule {
    /// `1 / ln(c + 1)` (Geman and Geman).
    ClassicalSa,
    /// `1 / c` (Szu and Hartley).
    #[default]
    FastSa,
    /// `exp(-(c - 1))` (Ingber).
    VeryFastSa,
    /// `1 - c / 100000`, floored at zero.
    Linear,
}

impl CoolingSchedule {
    pub fn temperature(self, cool_iter: f64) -> f64 {
        match self {
            Self::ClassicalSa => 1.0 / (cool_iter + 1.0).ln(),
            Self::FastSa => 1.0 / cool_iter,
            Self::VeryFastSa => (-(cool_iter - 1.0)).exp(),
            Self::Linear => (1.0 - cool_iter / LINEAR_COOLING_HORIZON).max(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NonNegativity {
    /// Clamp to exactly zero when a step would go negative; rates already
    /// at zero redraw until the step is non-negative.
    #[default]
    TryZeroRatesOften,
    /// Redraw until the step is non-negative.
    LimitZeroRates,
    /// Multiplicative jitter that never lands a rate on zero.
    PreventZeroRates,
    /// No bound; rates may go negative.
    Unbounded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Perturbation {
    UniformNoTempDependence,
    #[serde(rename = "UNIFORM_0p0001")]
    Uniform0p0001,
    Gaussian,
    Tangent,
    PowerLaw,
    Exponential,
    #[default]
    VariableExponentialScale,
    VariableNoTempDependence,
}

impl Perturbation {
    /// Whether the step is scaled by a per-rupture basis value.
    pub fn is_variable(self) -> bool {
        matches!(self, Self::VariableExponentialScale | Self::VariableNoTempDependence)
    }

    /// Draw a step for a rupture with basis value `basis` at `temperature`.
    pub fn perturb<R: Rng + ?Sized>(self, rng: &mut R, temperature: f64, basis: f64) -> f64 {
        let r: f64 = rng.gen();
        match self {
            Self::UniformNoTempDependence => (r - 0.5) * 0.002,
            Self::Uniform0p0001 => (r - 0.5) * 0.0002,
            Self::Gaussian => {
                let u1 = 1.0 - r;
                let u2: f64 = rng.gen();
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
                1e-3 * temperature * z
            }
            Self::Tangent => 1e-3 * temperature * (PI * r - PI / 2.0).tan(),
            Self::PowerLaw => random_sign(rng) * 10f64.powf(-10.0 + 9.0 * r * r),
            Self::Exponential => random_sign(rng) * 10f64.powf(-10.0 + 9.0 * r),
            Self::VariableExponentialScale => random_sign(rng) * basis * 10f64.powf(-4.0 + 5.0 * r),
            Self::VariableNoTempDependence => (r - 0.5) * 2.0 * basis,
        }
    }
}

fn random_sign<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    if rng.gen::<bool>() { 1.0 } else { -1.0 }
}

macro_rules! impl_str_names {
    ($ty:ty { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(match self { $(Self::$variant => $name),+ })
            }
        }

        impl FromStr for $ty {
            type Err = InversionError;

            fn from_str(s: &str) -> Result<Self> {
                $(if s.eq_ignore_ascii_case($name) { return Ok(Self::$variant); })+
                Err(InversionError::Configuration(format!(
                    "unknown {} '{s}'", stringify!($ty)
                )))
            }
        }
    };
}

impl_str_names!(CoolingSchedule {
    ClassicalSa => "CLASSICAL_SA",
    FastSa => "FAST_SA",
    VeryFastSa => "VERY_FAST_SA",
    Linear => "LINEAR",
});

impl_str_names!(NonNegativity {
    TryZeroRatesOften => "TRY_ZERO_RATES_OFTEN",
    LimitZeroRates => "LIMIT_ZERO_RATES",
    PreventZeroRates => "PREVENT_ZERO_RATES",
    Unbounded => "UNBOUNDED",
});

impl_str_names!(Perturbation {
    UniformNoTempDependence => "UNIFORM_NO_TEMP_DEPENDENCE",
    Uniform0p0001 => "UNIFORM_0p0001",
    Gaussian => "GAUSSIAN",
    Tangent => "TANGENT",
    PowerLaw => "POWER_LAW",
    Exponential => "EXPONENTIAL",
    VariableExponentialScale => "VARIABLE_EXPONENTIAL_SCALE",
    VariableNoTempDependence => "VARIABLE_NO_TEMP_DEPENDENCE",
});

/// Fixed knobs of one annealing run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnealingStrategy {
    pub cooling: CoolingSchedule,
    pub non_negativity: NonNegativity,
    pub perturbation: Perturbation,
    /// Multiplies energy changes before the Metropolis test.
    pub energy_scale: f64,
    /// Values above one stretch time spent at high temperature.
    pub cooling_slowdown: f64,
    /// Treat every accepted state as the new best.
    pub keep_current_as_best: bool,
    /// Recompute the per-range breakdown on every new best instead of only
    /// at the end of a run.
    pub track_range_energies: bool,
}

impl Default for AnnealingStrategy {
    fn default() -> Self {
        Self {
            cooling: CoolingSchedule::default(),
            non_negativity: NonNegativity::default(),
            perturbation: Perturbation::default(),
            energy_scale: 1.0,
            cooling_slowdown: 1.0,
            keep_current_as_best: false,
            track_range_energies: false,
        }
    }
}

impl AnnealingStrategy {
    /// Temperature at one-based iteration `iter`.
    pub fn temperature(&self, iter: u64) -> f64 {
        let cool_iter = if self.cooling_slowdown != 1.0 {
            (iter as f64 - 1.0) / self.cooling_slowdown + 1.0
        } else {
            iter as f64
        };
        self.cooling.temperature(cool_iter)
    }

    /// Step for rupture rate `x_i` after applying the non-negativity policy.
    pub fn propose<R: Rng + ?Sized>(&self, rng: &mut R, temperature: f64, x_i: f64, basis: f64) -> f64 {
        let perturbation = self.perturbation;
        match self.non_negativity {
            NonNegativity::PreventZeroRates => {
                let r: f64 = rng.gen();
                if x_i != 0.0 { (r - 0.5) * 2.0 * x_i } else { r * 1e-8 }
            }
            NonNegativity::Unbounded => perturbation.perturb(rng, temperature, basis),
            NonNegativity::LimitZeroRates => redraw_non_negative(rng, perturbation, temperature, x_i, basis),
            NonNegativity::TryZeroRatesOften => {
                let p = perturbation.perturb(rng, temperature, basis);
                if x_i + p >= 0.0 {
                    p
                } else if x_i == 0.0 {
                    redraw_non_negative(rng, perturbation, temperature, x_i, basis)
                } else {
                    -x_i
                }
            }
        }
    }
}

fn redraw_non_negative<R: Rng + ?Sized>(
    rng: &mut R,
    perturbation: Perturbation,
    temperature: f64,
    x_i: f64,
    basis: f64,
) -> f64 {
    for _ in 0..MAX_REDRAWS {
        let p = perturbation.perturb(rng, temperature, basis);
        if x_i + p >= 0.0 {
            return p;
        }
    }
    0.0
}

// ─────────────────────────────────────────────────────────────
//  Metropolis step and energy
// ─────────────────────────────────────────────────────────────

/// `1` for improvements, else `exp(-ΔE·scale / T)`.
pub fn acceptance_probability(energy_change: f64, temperature: f64, energy_scale: f64) -> f64 {
    if energy_change < 0.0 {
        1.0
    } else {
        ((-energy_change * energy_scale) / temperature).exp()
    }
}

/// Metropolis test against a uniform draw in `[0, 1)`.
pub fn metropolis_accept(energy_change: f64, temperature: f64, energy_scale: f64, draw: f64) -> bool {
    let p = acceptance_probability(energy_change, temperature, energy_scale);
    p >= 1.0 || p > draw
}

/// Energy of a misfit state. Inequality rows only count positive misfits.
pub fn calculate_energy(
    misfit: &[f64],
    misfit_ineq: Option<&[f64]>,
    ranges: &[ConstraintRowRange],
) -> Energy {
    let equality: f64 = misfit.iter().map(|m| m * m).sum();
    let inequality: f64 = misfit_ineq
        .map(|mi| mi.iter().map(|&m| ineq_energy(m)).sum())
        .unwrap_or(0.0);
    let per_range = ranges
        .iter()
        .map(|r| {
            if r.inequality {
                misfit_ineq
                    .map(|mi| mi[r.start_row..r.end_row].iter().map(|&m| ineq_energy(m)).sum())
                    .unwrap_or(0.0)
            } else {
                misfit[r.start_row..r.end_row].iter().map(|m| m * m).sum()
            }
        })
        .collect();
    Energy {
        total: equality + inequality,
        equality,
        inequality,
        per_range,
    }
}

#[inline]
fn ineq_energy(m: f64) -> f64 {
    if m > 0.0 { m * m } else { 0.0 }
}

/// Apply `perturb` to one column: writes the new misfits of the column's
/// rows into `next` and returns the energy change.
#[inline]
fn perturb_column(
    data: &ColumnOrganizedData,
    col: usize,
    perturb: f64,
    current: &[f64],
    next: &mut [f64],
    inequality: bool,
) -> f64 {
    let (rows, values) = data.column(col);
    let mut delta = 0.0;
    for (&r, &v) in rows.iter().zip(values) {
        let old = current[r];
        let new = v.mul_add(perturb, old);
        next[r] = new;
        delta += if inequality {
            ineq_energy(new) - ineq_energy(old)
        } else {
            new * new - old * old
        };
    }
    delta
}

#[inline]
fn copy_column_rows(data: &ColumnOrganizedData, col: usize, from: &[f64], to: &mut [f64]) {
    for &r in data.column(col).0 {
        to[r] = from[r];
    }
}

// ─────────────────────────────────────────────────────────────
//  Shared problem and best state
// ─────────────────────────────────────────────────────────────

/// Draws the rupture perturbed at each iteration.
#[derive(Debug, Clone)]
pub enum RuptureSampler {
    Uniform(usize),
    /// Only the listed ruptures, uniformly.
    Subset(Vec<usize>),
    Weighted(WeightedIndex<f64>),
}

impl RuptureSampler {
    /// Uniform over all ruptures except `excluded`.
    pub fn excluding(num_ruptures: usize, excluded: &[usize]) -> Result<Self> {
        if excluded.is_empty() {
            return Ok(Self::Uniform(num_ruptures));
        }
        let allowed: Vec<usize> = (0..num_ruptures).filter(|r| !excluded.contains(r)).collect();
        if allowed.is_empty() {
            return Err(InversionError::Configuration(
                "every rupture is excluded from perturbation".to_string(),
            ));
        }
        Ok(Self::Subset(allowed))
    }

    /// Probability of picking rupture `i` proportional to `weights[i]`.
    pub fn weighted(weights: &[f64]) -> Result<Self> {
        WeightedIndex::new(weights)
            .map(Self::Weighted)
            .map_err(|e| InversionError::Configuration(format!("invalid rupture sampling weights: {e}")))
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        match self {
            Self::Uniform(n) => rng.gen_range(0..*n),
            Self::Subset(allowed) => allowed[rng.gen_range(0..allowed.len())],
            Self::Weighted(w) => w.sample(rng),
        }
    }
}

/// Read-only inputs shared by every annealer of a run.
#[derive(Debug)]
pub struct AnnealingProblem {
    pub equality: ColumnOrganizedData,
    pub inequality: Option<ColumnOrganizedData>,
    pub ranges: Vec<ConstraintRowRange>,
    /// Floored per-rupture basis for variable perturbations.
    pub basis: Option<Vec<f64>>,
    pub sampler: RuptureSampler,
    pub strategy: AnnealingStrategy,
}

impl AnnealingProblem {
    pub fn new(
        equality: ColumnOrganizedData,
        inequality: Option<ColumnOrganizedData>,
        ranges: Vec<ConstraintRowRange>,
        basis: Option<Vec<f64>>,
        sampler: RuptureSampler,
        strategy: AnnealingStrategy,
    ) -> Result<Self> {
        let n = equality.num_cols();
        if n == 0 {
            return Err(InversionError::Configuration("no ruptures to anneal".to_string()));
        }
        if let Some(ineq) = &inequality {
            if ineq.num_cols() != n {
                return Err(InversionError::Configuration(format!(
                    "inequality data has {} columns, equality has {n}",
                    ineq.num_cols()
                )));
            }
        }
        if strategy.perturbation.is_variable() && basis.is_none() {
            return Err(InversionError::Configuration(format!(
                "perturbation {} requires a variable perturbation basis",
                strategy.perturbation
            )));
        }
        let basis = match basis {
            Some(b) if b.len() != n => {
                return Err(InversionError::Configuration(format!(
                    "perturbation basis has length {}, expected {n}",
                    b.len()
                )))
            }
            Some(b) => Some(b.into_iter().map(|v| if v > 0.0 { v } else { MIN_BASIS_VALUE }).collect()),
            None => None,
        };
        Ok(Self { equality, inequality, ranges, basis, sampler, strategy })
    }

    pub fn num_variables(&self) -> usize {
        self.equality.num_cols()
    }

    /// Same problem with rows rescaled and the ranges' weights replaced.
    /// `ineq_scalars` is ignored when there is no inequality data.
    pub fn reweighted(
        &self,
        eq_scalars: &[f64],
        ineq_scalars: Option<&[f64]>,
        ranges: Vec<ConstraintRowRange>,
    ) -> Self {
        let inequality = match (&self.inequality, ineq_scalars) {
            (Some(data), Some(scalars)) => Some(data.scale_rows(scalars)),
            (data, _) => data.clone(),
        };
        Self {
            equality: self.equality.scale_rows(eq_scalars),
            inequality,
            ranges,
            basis: self.basis.clone(),
            sampler: self.sampler.clone(),
            strategy: self.strategy,
        }
    }

    fn basis_value(&self, index: usize) -> f64 {
        self.basis.as_ref().map_or(1.0, |b| b[index])
    }

    /// Misfits and full energy of `x`.
    pub fn evaluate(&self, x: Vec<f64>) -> BestState {
        let mut misfit = vec![0.0; self.equality.num_rows()];
        self.equality.calculate_misfit(&x, &mut misfit);
        let misfit_ineq = self.inequality.as_ref().map(|ineq| {
            let mut m = vec![0.0; ineq.num_rows()];
            ineq.calculate_misfit(&x, &mut m);
            m
        });
        let energy = calculate_energy(&misfit, misfit_ineq.as_deref(), &self.ranges);
        let num_non_zero = x.iter().filter(|&&v| v != 0.0).count();
        BestState { x, misfit, misfit_ineq, energy, num_non_zero }
    }
}

/// Best solution found so far with its misfits and energy.
#[derive(Debug, Clone, PartialEq)]
pub struct BestState {
    pub x: Vec<f64>,
    pub misfit: Vec<f64>,
    pub misfit_ineq: Option<Vec<f64>>,
    pub energy: Energy,
    pub num_non_zero: usize,
}

impl BestState {
    /// Recompute the energy from the stored misfits.
    pub fn refresh_energy(&mut self, ranges: &[ConstraintRowRange]) -> Result<()> {
        self.energy = calculate_energy(&self.misfit, self.misfit_ineq.as_deref(), ranges);
        if !self.energy.is_finite() {
            return Err(InversionError::NonFinite(format!(
                "best energy is {}",
                self.energy.total
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Serial annealer
// ─────────────────────────────────────────────────────────────

/// Single-threaded annealer with its own seeded random stream.
#[derive(Debug)]
pub struct SerialAnnealer {
    problem: Arc<AnnealingProblem>,
    rng: Pcg64,
    best: BestState,
}

impl SerialAnnealer {
    /// `seed: None` draws the stream from OS entropy.
    pub fn new(problem: Arc<AnnealingProblem>, initial: &[f64], seed: Option<u64>) -> Result<Self> {
        if initial.len() != problem.num_variables() {
            return Err(InversionError::Configuration(format!(
                "initial solution has length {}, expected {}",
                initial.len(),
                problem.num_variables()
            )));
        }
        let rng = match seed {
            Some(s) => Pcg64::seed_from_u64(s),
            None => Pcg64::from_entropy(),
        };
        let best = problem.evaluate(initial.to_vec());
        Ok(Self { problem, rng, best })
    }

    pub fn problem(&self) -> &Arc<AnnealingProblem> {
        &self.problem
    }

    pub fn best(&self) -> &BestState {
        &self.best
    }

    /// Replace the best state, e.g. with the merged result of a round.
    pub fn set_best(&mut self, best: BestState) {
        self.best = best;
    }

    /// Swap in a re-weighted problem. The best state must be re-evaluated
    /// against it by the caller.
    pub fn set_problem(&mut self, problem: Arc<AnnealingProblem>) {
        self.problem = problem;
    }

    /// Anneal until `criteria` is satisfied. `start` seeds the counters and
    /// the cooling schedule position; the returned counts include it.
    pub fn iterate(
        &mut self,
        start: IterationCounts,
        criteria: &dyn CompletionCriteria,
    ) -> Result<IterationCounts> {
        let problem = Arc::clone(&self.problem);
        let strategy = problem.strategy;
        let eq = &problem.equality;
        let ineq = problem.inequality.as_ref();
        let ranges: &[ConstraintRowRange] = if strategy.track_range_energies { &problem.ranges } else { &[] };
        let num_vars = problem.num_variables();
        let prevent_zero = strategy.non_negativity == NonNegativity::PreventZeroRates;

        let mut x = self.best.x.clone();
        let mut misfit_cur = self.best.misfit.clone();
        let mut misfit_next = misfit_cur.clone();
        let mut ineq_cur = self.best.misfit_ineq.clone().unwrap_or_default();
        let mut ineq_next = ineq_cur.clone();

        let mut e_eq = self.best.energy.equality;
        let mut e_ineq = self.best.energy.inequality;
        let mut counts = start;
        let mut cur_non_zero = self.best.num_non_zero;
        let mut worse_pending = 0u64;
        let mut dirty: Vec<usize> = Vec::new();
        let mut is_dirty = vec![false; num_vars];
        let watch = Instant::now();

        loop {
            let state = InversionState {
                elapsed: watch.elapsed(),
                counts,
                num_non_zero: self.best.num_non_zero,
                num_variables: num_vars,
                energy: &self.best.energy,
            };
            if criteria.is_satisfied(&state) {
                break;
            }
            let iter = counts.iterations + 1;
            let temperature = strategy.temperature(iter);
            let index = problem.sampler.sample(&mut self.rng);
            let old = x[index];
            let perturb = strategy.propose(&mut self.rng, temperature, old, problem.basis_value(index));

            if iter % ENERGY_RECOMPUTE_INTERVAL == 0 {
                let e = calculate_energy(&misfit_cur, ineq.map(|_| ineq_cur.as_slice()), &[]);
                trace!(iter, drift = e.total - (e_eq + e_ineq), "energy recompute");
                e_eq = e.equality;
                e_ineq = e.inequality;
            }

            x[index] = old + perturb;
            let mut change = perturb_column(eq, index, perturb, &misfit_cur, &mut misfit_next, false);
            let mut change_ineq = 0.0;
            if let Some(d) = ineq {
                change_ineq = perturb_column(d, index, perturb, &ineq_cur, &mut ineq_next, true);
                change += change_ineq;
            }

            let accept = (prevent_zero && old == 0.0)
                || change < 0.0
                || metropolis_accept(change, temperature, strategy.energy_scale, self.rng.gen());

            counts.iterations = iter;
            if !accept {
                x[index] = old;
                copy_column_rows(eq, index, &misfit_cur, &mut misfit_next);
                if let Some(d) = ineq {
                    copy_column_rows(d, index, &ineq_cur, &mut ineq_next);
                }
                continue;
            }

            if change > 0.0 {
                worse_pending += 1;
            }
            e_eq += change - change_ineq;
            e_ineq += change_ineq;
            copy_column_rows(eq, index, &misfit_next, &mut misfit_cur);
            if let Some(d) = ineq {
                copy_column_rows(d, index, &ineq_next, &mut ineq_cur);
            }
            counts.perturbations_kept += 1;
            match (old == 0.0, x[index] == 0.0) {
                (true, false) => cur_non_zero += 1,
                (false, true) => cur_non_zero -= 1,
                _ => {}
            }
            if !is_dirty[index] {
                is_dirty[index] = true;
                dirty.push(index);
            }

            if e_eq + e_ineq < self.best.energy.total || strategy.keep_current_as_best {
                let best = &mut self.best;
                if dirty.len() >= num_vars {
                    best.x.copy_from_slice(&x);
                    best.misfit.copy_from_slice(&misfit_cur);
                    if let Some(bi) = best.misfit_ineq.as_mut() {
                        bi.copy_from_slice(&ineq_cur);
                    }
                } else {
                    for &i in &dirty {
                        best.x[i] = x[i];
                        copy_column_rows(eq, i, &misfit_cur, &mut best.misfit);
                        if let (Some(d), Some(bi)) = (ineq, best.misfit_ineq.as_mut()) {
                            copy_column_rows(d, i, &ineq_cur, bi);
                        }
                    }
                }
                for &i in &dirty {
                    is_dirty[i] = false;
                }
                dirty.clear();
                if ranges.is_empty() {
                    best.energy.equality = e_eq;
                    best.energy.inequality = e_ineq;
                    best.energy.total = e_eq + e_ineq;
                } else {
                    best.energy = calculate_energy(&misfit_cur, ineq.map(|_| ineq_cur.as_slice()), ranges);
                    e_eq = best.energy.equality;
                    e_ineq = best.energy.inequality;
                }
                best.num_non_zero = cur_non_zero;
                counts.worse_kept += worse_pending;
                worse_pending = 0;
            }
        }

        self.best.refresh_energy(&problem.ranges)?;
        Ok(counts)
    }
}
