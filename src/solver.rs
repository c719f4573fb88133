//! End-to-end inversion driver and the solution it produces.

use crate::annealing::BestState;
use crate::cluster::{ClusterInversionSolver, ClusterSolverOptions};
use crate::completion::{
    AnnealingProgress, CancellationCriteria, CompletionCriteria, CompoundCriteria, ProgressTracker,
};
use crate::config::{AnnealingParams, InversionConfiguration, InversionConfigurationFactory};
use crate::inputs::LinearSystem;
use crate::misfits::{InversionMisfitStats, InversionMisfits};
use crate::reweight::ReweightRecord;
use crate::types::{Energy, InversionError, IterationCounts, Result, RuptureSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

// ─────────────────────────────────────────────────────────────
//  Solution
// ─────────────────────────────────────────────────────────────

/// Metadata attached to a solution after it is assembled.
#[derive(Debug, Clone, Default)]
pub struct SolutionMetadata {
    pub progress: Option<AnnealingProgress>,
    pub misfits: Option<InversionMisfits>,
    pub misfit_stats: Option<InversionMisfitStats>,
    pub cluster_misfit_stats: Option<BTreeMap<usize, InversionMisfitStats>>,
    pub failed_clusters: Vec<(usize, String)>,
    pub initial_solution: Option<Vec<f64>>,
    pub water_level: Option<Vec<f64>>,
    pub params: Option<AnnealingParams>,
    pub energy: Option<Energy>,
    pub counts: Option<IterationCounts>,
    /// Constraint weights chosen between rounds of a re-weighted run.
    pub reweight_history: Option<Vec<ReweightRecord>>,
}

/// Rupture rates for a rupture set. The rates are fixed at construction;
/// only metadata can be attached afterwards.
#[derive(Debug, Clone)]
pub struct FaultSystemSolution {
    rup_set: Arc<RuptureSet>,
    rates: Vec<f64>,
    metadata: SolutionMetadata,
}

impl FaultSystemSolution {
    pub fn new(rup_set: Arc<RuptureSet>, rates: Vec<f64>) -> Result<Self> {
        if rates.len() != rup_set.num_ruptures() {
            return Err(InversionError::Configuration(format!(
                "{} rates for {} ruptures",
                rates.len(),
                rup_set.num_ruptures()
            )));
        }
        if let Some(bad) = rates.iter().find(|r| !r.is_finite()) {
            return Err(InversionError::NonFinite(format!("solution rate {bad}")));
        }
        Ok(Self { rup_set, rates, metadata: SolutionMetadata::default() })
    }

    pub fn rupture_set(&self) -> &Arc<RuptureSet> {
        &self.rup_set
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn total_rate(&self) -> f64 {
        self.rates.iter().sum()
    }

    pub fn metadata(&self) -> &SolutionMetadata {
        &self.metadata
    }

    pub fn attach_progress(&mut self, progress: AnnealingProgress) {
        self.metadata.progress = Some(progress);
    }

    pub fn attach_misfits(&mut self, misfits: InversionMisfits) {
        self.metadata.misfits = Some(misfits);
    }

    pub fn attach_misfit_stats(&mut self, stats: InversionMisfitStats) {
        self.metadata.misfit_stats = Some(stats);
    }

    pub fn attach_cluster_misfit_stats(&mut self, stats: BTreeMap<usize, InversionMisfitStats>) {
        self.metadata.cluster_misfit_stats = Some(stats);
    }

    pub fn attach_failed_cluster(&mut self, cluster: usize, reason: String) {
        self.metadata.failed_clusters.push((cluster, reason));
    }

    pub fn attach_initial_solution(&mut self, initial: Vec<f64>) {
        self.metadata.initial_solution = Some(initial);
    }

    pub fn attach_water_level(&mut self, water_level: Vec<f64>) {
        self.metadata.water_level = Some(water_level);
    }

    pub fn attach_params(&mut self, params: AnnealingParams) {
        self.metadata.params = Some(params);
    }

    pub fn attach_energy(&mut self, energy: Energy) {
        self.metadata.energy = Some(energy);
    }

    pub fn attach_counts(&mut self, counts: IterationCounts) {
        self.metadata.counts = Some(counts);
    }

    pub fn attach_reweight_history(&mut self, history: Vec<ReweightRecord>) {
        self.metadata.reweight_history = Some(history);
    }
}

// ─────────────────────────────────────────────────────────────
//  Single-system run
// ─────────────────────────────────────────────────────────────

/// Everything one build-and-anneal pass produced.
#[derive(Debug)]
pub struct SystemRun {
    pub system: LinearSystem,
    /// Best solution with the water level added back.
    pub rates: Vec<f64>,
    /// Best state in the optimizer's coordinates.
    pub best: BestState,
    pub counts: IterationCounts,
    pub progress: AnnealingProgress,
    pub misfits: InversionMisfits,
    pub reweight_history: Option<Vec<ReweightRecord>>,
}

/// Build the linear system for `config`, anneal it, and collect results.
pub fn run_system(
    rup_set: &RuptureSet,
    config: &InversionConfiguration,
    cancel: Option<&CancellationCriteria>,
    progress_interval: Duration,
) -> Result<SystemRun> {
    let system = config.build_linear_system(rup_set.num_ruptures())?;
    let mut annealer = config.build_annealer(&system)?;
    let initial_energy = annealer.best().energy.total;

    let completion: Box<dyn CompletionCriteria> = match cancel {
        Some(c) => Box::new(CompoundCriteria(vec![
            Box::new(config.params().completion.clone()),
            Box::new(c.clone()),
        ])),
        None => Box::new(config.params().completion.clone()),
    };
    let tracker = ProgressTracker::with_interval(completion, progress_interval);

    info!(
        ruptures = system.num_ruptures(),
        threads = annealer.num_threads(),
        completion = %config.params().completion,
        "starting annealing"
    );
    let watch = Instant::now();
    let counts = annealer.iterate(IterationCounts::default(), &tracker)?;
    let reweight_history = annealer.reweight_history().map(<[ReweightRecord]>::to_vec);
    let best = annealer.into_best();
    info!(
        iterations = counts.iterations,
        kept = counts.perturbations_kept,
        worse_kept = counts.worse_kept,
        energy = best.energy.total,
        secs = watch.elapsed().as_secs_f64(),
        "annealing finished"
    );
    if counts.iterations > 0 && best.energy.total > 0.0 && best.energy.total >= initial_energy {
        warn!(
            iterations = counts.iterations,
            energy = best.energy.total,
            "annealing did not improve on the initial solution"
        );
    }

    let rates = system.adjust_solution_for_water_level(&best.x);
    let misfits = InversionMisfits::new(&system, &best.x);
    Ok(SystemRun {
        system,
        rates,
        best,
        counts,
        progress: tracker.progress(),
        misfits,
        reweight_history,
    })
}

// ─────────────────────────────────────────────────────────────
//  Orchestrator
// ─────────────────────────────────────────────────────────────

/// Runs inversions. Holds no state between runs beyond its options.
#[derive(Debug, Clone)]
pub struct InversionSolver {
    cancel: Option<CancellationCriteria>,
    progress_interval: Duration,
    cluster_options: ClusterSolverOptions,
}

impl Default for InversionSolver {
    fn default() -> Self {
        Self {
            cancel: None,
            progress_interval: ProgressTracker::DEFAULT_INTERVAL,
            cluster_options: ClusterSolverOptions::default(),
        }
    }
}

impl InversionSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop runs early once `cancel` is raised.
    pub fn with_cancellation(mut self, cancel: CancellationCriteria) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Minimum spacing of recorded progress entries.
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn cluster_options(mut self, options: ClusterSolverOptions) -> Self {
        self.cluster_options = options;
        self
    }

    /// Invert `rup_set` under `config` as one linear system.
    pub fn run(&self, rup_set: Arc<RuptureSet>, config: &InversionConfiguration) -> Result<FaultSystemSolution> {
        let run = run_system(&rup_set, config, self.cancel.as_ref(), self.progress_interval)?;
        let initial = run.system.adjust_solution_for_water_level(run.system.initial_solution());
        let stats = run.misfits.stats();

        let mut solution = FaultSystemSolution::new(rup_set, run.rates)?;
        solution.attach_progress(run.progress);
        solution.attach_misfit_stats(stats);
        solution.attach_misfits(run.misfits);
        solution.attach_initial_solution(initial);
        if let Some(wl) = run.system.water_level() {
            solution.attach_water_level(wl.to_vec());
        }
        solution.attach_params(config.params().clone());
        solution.attach_energy(run.best.energy);
        solution.attach_counts(run.counts);
        if let Some(history) = run.reweight_history {
            solution.attach_reweight_history(history);
        }
        Ok(solution)
    }

    /// Invert with configurations from `factory`, decomposing into
    /// connectivity clusters when the factory asks for it and there is more
    /// than one cluster.
    pub fn run_factory(
        &self,
        rup_set: Arc<RuptureSet>,
        factory: &dyn InversionConfigurationFactory,
    ) -> Result<FaultSystemSolution> {
        if factory.solve_clusters_individually() && rup_set.connectivity_clusters().len() > 1 {
            let mut solver = ClusterInversionSolver::new(factory)
                .options(self.cluster_options)
                .progress_interval(self.progress_interval);
            if let Some(c) = &self.cancel {
                solver = solver.with_cancellation(c.clone());
            }
            return solver.solve(rup_set);
        }
        let config = factory.build_configuration(&rup_set)?.ok_or_else(|| {
            InversionError::Configuration("factory declined the full rupture set".to_string())
        })?;
        self.run(rup_set, &config)
    }
}
