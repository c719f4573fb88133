//! Inversion configuration and engine construction.
//!
//! [`AnnealingParams`] is the serializable surface (what a command line or
//! a JSON file can set). [`InversionConfiguration`] adds the constraint
//! list and the optional per-rupture vectors, and knows how to turn a
//! [`LinearSystem`] into a ready-to-run [`Annealer`].

use crate::annealing::{
    AnnealingProblem, AnnealingStrategy, CoolingSchedule, NonNegativity, Perturbation, RuptureSampler,
    SerialAnnealer,
};
use crate::completion::Completion;
use crate::constraints::InversionConstraint;
use crate::inputs::{LinearSystem, LinearSystemBuilder, RowCountNormalization};
use crate::misfits::MisfitQuantity;
use crate::reweight::ReweightOptions;
use crate::threaded::{Annealer, RoundMerge, ThreadedAnnealer};
use crate::types::{InversionError, Result, RuptureSet};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Round length used when threading or re-weighting is on and none is set.
pub const DEFAULT_SUB_COMPLETION: Completion = Completion::Time(Duration::from_secs(1));

// ─────────────────────────────────────────────────────────────
//  Serializable parameters
// ─────────────────────────────────────────────────────────────

fn default_threads() -> usize {
    1
}

fn default_one() -> f64 {
    1.0
}

/// Annealing parameters.
///
/// ```json
/// { "completion": "2h", "threads": 8, "sub_completion": "1s",
///   "avg_threads": 2, "avg_completion": "30s", "cooling": "FAST_SA" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnealingParams {
    pub completion: Completion,
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Round length of threaded annealing.
    #[serde(default)]
    pub sub_completion: Option<Completion>,
    /// Number of averaged groups; requires `avg_completion`.
    #[serde(default)]
    pub avg_threads: Option<usize>,
    #[serde(default)]
    pub avg_completion: Option<Completion>,
    #[serde(default)]
    pub perturbation: Perturbation,
    #[serde(default)]
    pub non_negativity: NonNegativity,
    #[serde(default)]
    pub cooling: CoolingSchedule,
    /// Fixed seed for reproducible runs; entropy-seeded when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_one")]
    pub energy_scale: f64,
    #[serde(default = "default_one")]
    pub cooling_slowdown: f64,
    #[serde(default)]
    pub start_sub_iterations_at_zero: bool,
    #[serde(default)]
    pub keep_current_as_best: bool,
    #[serde(default)]
    pub track_range_energies: bool,
    #[serde(default)]
    pub compress_columns: bool,
    /// Re-weight uncertainty-normalized constraints between rounds,
    /// evening out this misfit quantity.
    #[serde(default)]
    pub reweight: Option<MisfitQuantity>,
}

impl AnnealingParams {
    pub fn new(completion: Completion) -> Self {
        Self {
            completion,
            threads: 1,
            sub_completion: None,
            avg_threads: None,
            avg_completion: None,
            perturbation: Perturbation::default(),
            non_negativity: NonNegativity::default(),
            cooling: CoolingSchedule::default(),
            seed: None,
            energy_scale: 1.0,
            cooling_slowdown: 1.0,
            start_sub_iterations_at_zero: false,
            keep_current_as_best: false,
            track_range_energies: false,
            compress_columns: false,
            reweight: None,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut params: Self = serde_json::from_str(json)?;
        params.apply_defaults();
        params.validate()?;
        Ok(params)
    }

    /// Fill in the round length when rounds are needed but none was given.
    pub fn apply_defaults(&mut self) {
        if self.sub_completion.is_none() && (self.threads > 1 || self.reweight.is_some()) {
            self.sub_completion = Some(DEFAULT_SUB_COMPLETION);
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let err = |msg: &str| Err(InversionError::Configuration(msg.to_string()));
        if self.threads < 1 {
            return err("threads must be at least 1");
        }
        if self.sub_completion.as_ref().is_some_and(Completion::is_immediate) {
            return err("sub-completion criterion must allow at least one iteration per round");
        }
        if self.avg_completion.as_ref().is_some_and(Completion::is_immediate) {
            return err("averaging completion criterion must allow at least one iteration per round");
        }
        match (self.avg_threads, &self.avg_completion) {
            (Some(_), None) => return err("averaging requires an averaging completion criterion"),
            (None, Some(_)) => return err("an averaging completion criterion requires avg_threads"),
            (Some(avg), Some(_)) => {
                if avg < 1 {
                    return err("avg_threads must be at least 1");
                }
                if avg >= self.threads {
                    return Err(InversionError::Configuration(format!(
                        "avg_threads ({avg}) must be less than threads ({})",
                        self.threads
                    )));
                }
            }
            (None, None) => {}
        }
        if !(self.energy_scale.is_finite() && self.energy_scale > 0.0) {
            return err("energy scale must be positive");
        }
        if !(self.cooling_slowdown.is_finite() && self.cooling_slowdown > 0.0) {
            return err("cooling slowdown must be positive");
        }
        Ok(())
    }

    pub fn strategy(&self) -> AnnealingStrategy {
        AnnealingStrategy {
            cooling: self.cooling,
            non_negativity: self.non_negativity,
            perturbation: self.perturbation,
            energy_scale: self.energy_scale,
            cooling_slowdown: self.cooling_slowdown,
            keep_current_as_best: self.keep_current_as_best,
            track_range_energies: self.track_range_energies,
        }
    }

    fn serial_seed(&self, index: usize) -> Option<u64> {
        self.seed.map(|s| s.wrapping_add(SEED_STRIDE.wrapping_mul(index as u64)))
    }
}

// ─────────────────────────────────────────────────────────────
//  Inversion configuration
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InversionConfiguration {
    constraints: Vec<Arc<dyn InversionConstraint>>,
    params: AnnealingParams,
    initial_solution: Option<Vec<f64>>,
    water_level: Option<Vec<f64>>,
    variable_basis: Option<Vec<f64>>,
    excluded_ruptures: Vec<usize>,
    sample_weights: Option<Vec<f64>>,
    row_count_normalization: RowCountNormalization,
}

impl InversionConfiguration {
    pub fn builder(
        constraints: Vec<Arc<dyn InversionConstraint>>,
        completion: Completion,
    ) -> InversionConfigurationBuilder {
        InversionConfigurationBuilder {
            config: Self {
                constraints,
                params: AnnealingParams::new(completion),
                initial_solution: None,
                water_level: None,
                variable_basis: None,
                excluded_ruptures: Vec::new(),
                sample_weights: None,
                row_count_normalization: RowCountNormalization::Off,
            },
        }
    }

    pub fn from_params(
        constraints: Vec<Arc<dyn InversionConstraint>>,
        params: AnnealingParams,
    ) -> Result<Self> {
        let mut builder = Self::builder(constraints, params.completion.clone());
        builder.config.params = params;
        builder.build()
    }

    pub fn constraints(&self) -> &[Arc<dyn InversionConstraint>] {
        &self.constraints
    }

    pub fn params(&self) -> &AnnealingParams {
        &self.params
    }

    pub fn initial_solution(&self) -> Option<&[f64]> {
        self.initial_solution.as_deref()
    }

    pub fn water_level(&self) -> Option<&[f64]> {
        self.water_level.as_deref()
    }

    pub fn variable_basis(&self) -> Option<&[f64]> {
        self.variable_basis.as_deref()
    }

    pub fn build_linear_system(&self, num_ruptures: usize) -> Result<LinearSystem> {
        let mut builder = LinearSystemBuilder::new(num_ruptures, self.constraints.clone())
            .compress_columns(self.params.compress_columns)
            .normalize_weights_by_row_count(self.row_count_normalization);
        if let Some(init) = &self.initial_solution {
            builder = builder.initial_solution(init.clone());
        }
        if let Some(wl) = &self.water_level {
            builder = builder.water_level(wl.clone());
        }
        builder.build()
    }

    /// Basis for variable perturbations: the configured one, else the
    /// initial solution if it has any positive rate.
    fn perturbation_basis(&self) -> Result<Option<Vec<f64>>> {
        if !self.params.perturbation.is_variable() {
            return Ok(self.variable_basis.clone());
        }
        if let Some(b) = &self.variable_basis {
            return Ok(Some(b.clone()));
        }
        match &self.initial_solution {
            Some(init) if init.iter().any(|&v| v > 0.0) => Ok(Some(init.clone())),
            _ => Err(InversionError::Configuration(format!(
                "perturbation {} needs a variable perturbation basis and none can be derived",
                self.params.perturbation
            ))),
        }
    }

    fn sampler(&self, num_ruptures: usize) -> Result<RuptureSampler> {
        if let Some(&r) = self.excluded_ruptures.iter().find(|&&r| r >= num_ruptures) {
            return Err(InversionError::Configuration(format!(
                "excluded rupture {r} out of range for {num_ruptures} ruptures"
            )));
        }
        match &self.sample_weights {
            Some(w) => {
                if w.len() != num_ruptures {
                    return Err(InversionError::Configuration(format!(
                        "sampling weights have length {}, expected {num_ruptures}",
                        w.len()
                    )));
                }
                let mut w = w.clone();
                for &r in &self.excluded_ruptures {
                    if let Some(v) = w.get_mut(r) {
                        *v = 0.0;
                    }
                }
                RuptureSampler::weighted(&w)
            }
            None => RuptureSampler::excluding(num_ruptures, &self.excluded_ruptures),
        }
    }

    /// Assemble the engine for `system`: serial for one thread, threaded
    /// best-of otherwise, and averaged groups of those when averaging is on.
    /// Re-weighting wraps the outermost engine, so a single thread then runs
    /// as a one-member threaded annealer.
    pub fn build_annealer(&self, system: &LinearSystem) -> Result<Annealer> {
        let params = &self.params;
        let n = system.num_ruptures();
        let problem = Arc::new(AnnealingProblem::new(
            system.equality_data(),
            system.inequality_data(),
            system.ranges().to_vec(),
            self.perturbation_basis()?,
            self.sampler(n)?,
            params.strategy(),
        )?);
        let initial = system.initial_solution();

        if params.threads == 1 && params.reweight.is_none() {
            return Ok(Annealer::Serial(SerialAnnealer::new(problem, initial, params.serial_seed(0))?));
        }

        let sub = params.sub_completion.clone().unwrap_or(DEFAULT_SUB_COMPLETION);
        let mut next_seed = 0usize;
        let mut serials = |count: usize| -> Result<Vec<Annealer>> {
            (0..count)
                .map(|_| {
                    let seed = params.serial_seed(next_seed);
                    next_seed += 1;
                    Ok(Annealer::Serial(SerialAnnealer::new(Arc::clone(&problem), initial, seed)?))
                })
                .collect()
        };

        let engine = match (params.avg_threads, &params.avg_completion) {
            (Some(avg), Some(avg_completion)) => {
                let per_group = params.threads.div_ceil(avg);
                let mut remaining = params.threads;
                let mut groups = Vec::with_capacity(avg);
                while remaining > 0 {
                    let size = per_group.min(remaining);
                    remaining -= size;
                    let mut members = serials(size)?;
                    let group = if size > 1 {
                        Annealer::Threaded(
                            ThreadedAnnealer::new(
                                Arc::clone(&problem),
                                members,
                                Box::new(sub.clone()),
                                RoundMerge::Best,
                                initial,
                            )?
                            .start_sub_iterations_at_zero(params.start_sub_iterations_at_zero),
                        )
                    } else {
                        members.remove(0)
                    };
                    groups.push(group);
                }
                debug!(groups = groups.len(), per_group, "built averaged annealer");
                ThreadedAnnealer::new(
                    Arc::clone(&problem),
                    groups,
                    Box::new(avg_completion.clone()),
                    RoundMerge::Average,
                    initial,
                )?
            }
            _ => ThreadedAnnealer::new(
                Arc::clone(&problem),
                serials(params.threads)?,
                Box::new(sub),
                RoundMerge::Best,
                initial,
            )?,
        };
        let mut engine = engine.start_sub_iterations_at_zero(params.start_sub_iterations_at_zero);
        if let Some(quantity) = params.reweight {
            engine = engine.with_reweighting(ReweightOptions::new(quantity))?;
        }
        Ok(Annealer::Threaded(engine))
    }
}

/// Chained setters over an [`InversionConfiguration`]; `build` validates.
#[derive(Debug, Clone)]
pub struct InversionConfigurationBuilder {
    config: InversionConfiguration,
}

impl InversionConfigurationBuilder {
    pub fn threads(mut self, threads: usize, sub_completion: Completion) -> Self {
        self.config.params.threads = threads;
        self.config.params.sub_completion = Some(sub_completion);
        self
    }

    pub fn averaging(mut self, avg_threads: usize, avg_completion: Completion) -> Self {
        self.config.params.avg_threads = Some(avg_threads);
        self.config.params.avg_completion = Some(avg_completion);
        self
    }

    pub fn no_averaging(mut self) -> Self {
        self.config.params.avg_threads = None;
        self.config.params.avg_completion = None;
        self
    }

    pub fn perturbation(mut self, perturbation: Perturbation) -> Self {
        self.config.params.perturbation = perturbation;
        self
    }

    pub fn non_negativity(mut self, non_negativity: NonNegativity) -> Self {
        self.config.params.non_negativity = non_negativity;
        self
    }

    pub fn cooling(mut self, cooling: CoolingSchedule) -> Self {
        self.config.params.cooling = cooling;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.params.seed = Some(seed);
        self
    }

    pub fn energy_scale(mut self, scale: f64) -> Self {
        self.config.params.energy_scale = scale;
        self
    }

    pub fn cooling_slowdown(mut self, slowdown: f64) -> Self {
        self.config.params.cooling_slowdown = slowdown;
        self
    }

    pub fn start_sub_iterations_at_zero(mut self, at_zero: bool) -> Self {
        self.config.params.start_sub_iterations_at_zero = at_zero;
        self
    }

    pub fn keep_current_as_best(mut self, keep: bool) -> Self {
        self.config.params.keep_current_as_best = keep;
        self
    }

    pub fn track_range_energies(mut self, track: bool) -> Self {
        self.config.params.track_range_energies = track;
        self
    }

    pub fn compress_columns(mut self, compress: bool) -> Self {
        self.config.params.compress_columns = compress;
        self
    }

    pub fn initial_solution(mut self, initial: Vec<f64>) -> Self {
        self.config.initial_solution = Some(initial);
        self
    }

    pub fn water_level(mut self, water_level: Vec<f64>) -> Self {
        self.config.water_level = Some(water_level);
        self
    }

    pub fn variable_basis(mut self, basis: Vec<f64>) -> Self {
        self.config.variable_basis = Some(basis);
        self
    }

    /// Ruptures that are never perturbed and keep their initial rate.
    pub fn exclude_ruptures(mut self, ruptures: Vec<usize>) -> Self {
        self.config.excluded_ruptures = ruptures;
        self
    }

    pub fn sample_weights(mut self, weights: Vec<f64>) -> Self {
        self.config.sample_weights = Some(weights);
        self
    }

    /// Re-weight uncertainty-normalized constraints between rounds towards
    /// an even `quantity`.
    pub fn reweight(mut self, quantity: MisfitQuantity) -> Self {
        self.config.params.reweight = Some(quantity);
        self
    }

    /// Divide constraint weights by their row counts when the system is
    /// built.
    pub fn normalize_weights_by_row_count(mut self, normalization: RowCountNormalization) -> Self {
        self.config.row_count_normalization = normalization;
        self
    }

    pub fn build(mut self) -> Result<InversionConfiguration> {
        if self.config.constraints.is_empty() {
            return Err(InversionError::Configuration("no constraints supplied".to_string()));
        }
        self.config.params.apply_defaults();
        self.config.params.validate()?;
        Ok(self.config)
    }
}

// ─────────────────────────────────────────────────────────────
//  Factory
// ─────────────────────────────────────────────────────────────

/// Builds configurations for a rupture set, including cluster sub-sets.
pub trait InversionConfigurationFactory: Send + Sync {
    /// `Ok(None)` declines the rupture set; a declined cluster keeps zero
    /// rates.
    fn build_configuration(&self, rup_set: &RuptureSet) -> Result<Option<InversionConfiguration>>;

    /// Whether independent connectivity clusters should be solved separately.
    fn solve_clusters_individually(&self) -> bool {
        false
    }
}
