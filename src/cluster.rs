//! Connectivity-cluster decomposition.
//!
//! Sections joined by a shared rupture belong to the same cluster, and no
//! rupture spans two clusters, so each cluster is an independent inversion.
//! Clusters are solved separately (optionally in parallel) and their rates
//! scattered back into one full-length vector.

use crate::completion::{CancellationCriteria, ProgressTracker};
use crate::config::InversionConfigurationFactory;
use crate::misfits::InversionMisfitStats;
use crate::solver::{run_system, FaultSystemSolution, InversionSolver};
use crate::types::{InversionError, IterationCounts, Result, Rupture, RuptureSet};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ─────────────────────────────────────────────────────────────
//  Clusters
// ─────────────────────────────────────────────────────────────

/// Sections and ruptures of one connected component. Indices are local to
/// the rupture set the cluster was computed on, sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityCluster {
    sections: Vec<usize>,
    ruptures: Vec<usize>,
}

impl ConnectivityCluster {
    pub fn sections(&self) -> &[usize] {
        &self.sections
    }

    pub fn ruptures(&self) -> &[usize] {
        &self.ruptures
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    pub fn num_ruptures(&self) -> usize {
        self.ruptures.len()
    }

    /// The induced rupture set and the mapping back to the parent.
    pub fn subset(&self, rup_set: &RuptureSet) -> Result<(RuptureSet, RuptureSubsetMapping)> {
        let local: HashMap<usize, usize> = self
            .sections
            .iter()
            .enumerate()
            .map(|(i, &s)| (s, i))
            .collect();
        let section_ids = self.sections.iter().map(|&s| rup_set.section_id(s)).collect();
        let mut ruptures = Vec::with_capacity(self.ruptures.len());
        for &r in &self.ruptures {
            let rup = rup_set.rupture(r);
            let sections = rup
                .sections
                .iter()
                .map(|s| {
                    local.get(s).copied().ok_or_else(|| {
                        InversionError::Configuration(format!(
                            "rupture {r} leaves its connectivity cluster at section {s}"
                        ))
                    })
                })
                .collect::<Result<Vec<usize>>>()?;
            ruptures.push(Rupture::new(sections, rup.magnitude));
        }
        let sub = RuptureSet::with_section_ids(section_ids, ruptures)?;
        let mapping = RuptureSubsetMapping {
            parent_ruptures: self.ruptures.clone(),
            parent_sections: self.sections.clone(),
        };
        Ok((sub, mapping))
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Union-find over sections linked by ruptures. Sections without any
/// rupture form no cluster. Largest first by rupture count.
pub(crate) fn build_clusters(rup_set: &RuptureSet) -> Vec<ConnectivityCluster> {
    let n = rup_set.num_sections();
    let mut parent: Vec<usize> = (0..n).collect();
    for rup in rup_set.ruptures() {
        let first = find(&mut parent, rup.sections[0]);
        for &s in &rup.sections[1..] {
            let root = find(&mut parent, s);
            if root != first {
                parent[root] = first;
            }
        }
    }

    let mut by_root: BTreeMap<usize, ConnectivityCluster> = BTreeMap::new();
    for (r, rup) in rup_set.ruptures().iter().enumerate() {
        let root = find(&mut parent, rup.sections[0]);
        by_root
            .entry(root)
            .or_insert_with(|| ConnectivityCluster { sections: Vec::new(), ruptures: Vec::new() })
            .ruptures
            .push(r);
    }
    for s in 0..n {
        let root = find(&mut parent, s);
        if let Some(cluster) = by_root.get_mut(&root) {
            cluster.sections.push(s);
        }
    }

    let mut clusters: Vec<ConnectivityCluster> = by_root.into_values().collect();
    clusters.sort_by(|a, b| {
        b.num_ruptures()
            .cmp(&a.num_ruptures())
            .then_with(|| a.sections[0].cmp(&b.sections[0]))
    });
    clusters
}

/// Sub-set rupture index → parent rupture index (and the same for sections).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuptureSubsetMapping {
    parent_ruptures: Vec<usize>,
    parent_sections: Vec<usize>,
}

impl RuptureSubsetMapping {
    pub fn new(parent_ruptures: Vec<usize>, parent_sections: Vec<usize>) -> Self {
        Self { parent_ruptures, parent_sections }
    }

    pub fn num_ruptures(&self) -> usize {
        self.parent_ruptures.len()
    }

    pub fn parent_rupture(&self, sub_index: usize) -> usize {
        self.parent_ruptures[sub_index]
    }

    pub fn parent_section(&self, sub_index: usize) -> usize {
        self.parent_sections[sub_index]
    }
}

// ─────────────────────────────────────────────────────────────
//  Merge
// ─────────────────────────────────────────────────────────────

/// Scatters reduced-index vectors into a full-length vector, refusing to
/// overwrite a rupture that already holds a non-zero value.
#[derive(Debug, Clone)]
pub struct ClusterMerger {
    values: Vec<f64>,
    owner: Vec<Option<usize>>,
}

impl ClusterMerger {
    pub fn new(num_ruptures: usize) -> Self {
        Self {
            values: vec![0.0; num_ruptures],
            owner: vec![None; num_ruptures],
        }
    }

    pub fn scatter(&mut self, cluster: usize, mapping: &RuptureSubsetMapping, values: &[f64]) -> Result<()> {
        if values.len() != mapping.num_ruptures() {
            return Err(InversionError::Configuration(format!(
                "cluster {cluster} produced {} values for {} ruptures",
                values.len(),
                mapping.num_ruptures()
            )));
        }
        for (i, &v) in values.iter().enumerate() {
            let full = mapping.parent_rupture(i);
            if full >= self.values.len() {
                return Err(InversionError::Configuration(format!(
                    "cluster {cluster} maps to rupture {full}, only {} exist",
                    self.values.len()
                )));
            }
            if self.values[full] != 0.0 {
                return Err(InversionError::MergeConflict {
                    rupture: full,
                    existing_cluster: self.owner[full].unwrap_or(cluster),
                    cluster,
                });
            }
            if v != 0.0 {
                self.values[full] = v;
                self.owner[full] = Some(cluster);
            }
        }
        Ok(())
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }
}

/// Convenience over [`ClusterMerger`] for `(cluster, mapping, values)` parts.
pub fn merge_cluster_values<'a>(
    num_ruptures: usize,
    parts: impl IntoIterator<Item = (usize, &'a RuptureSubsetMapping, &'a [f64])>,
) -> Result<Vec<f64>> {
    let mut merger = ClusterMerger::new(num_ruptures);
    for (cluster, mapping, values) in parts {
        merger.scatter(cluster, mapping, values)?;
    }
    Ok(merger.into_values())
}

// ─────────────────────────────────────────────────────────────
//  Cluster solver
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterSolverOptions {
    /// Solve clusters concurrently; merging stays serial.
    pub parallel: bool,
}

/// Result of one cluster.
#[derive(Debug, Clone)]
pub enum ClusterOutcome {
    Solved {
        rates: Vec<f64>,
        initial_solution: Vec<f64>,
        water_level: Option<Vec<f64>>,
        misfit_stats: InversionMisfitStats,
        counts: IterationCounts,
    },
    /// The factory returned no configuration; rates stay zero.
    Declined,
    /// A non-fatal failure; rates stay zero.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ClusterSolution {
    pub cluster: usize,
    pub mapping: RuptureSubsetMapping,
    pub outcome: ClusterOutcome,
}

/// Solves each connectivity cluster independently and merges the results.
pub struct ClusterInversionSolver<'a> {
    factory: &'a dyn InversionConfigurationFactory,
    options: ClusterSolverOptions,
    cancel: Option<CancellationCriteria>,
    progress_interval: Duration,
}

impl<'a> ClusterInversionSolver<'a> {
    pub fn new(factory: &'a dyn InversionConfigurationFactory) -> Self {
        Self {
            factory,
            options: ClusterSolverOptions::default(),
            cancel: None,
            progress_interval: ProgressTracker::DEFAULT_INTERVAL,
        }
    }

    pub fn options(mut self, options: ClusterSolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationCriteria) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub(crate) fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    fn solve_cluster(&self, rup_set: &RuptureSet, index: usize, cluster: &ConnectivityCluster) -> Result<ClusterSolution> {
        let (sub, mapping) = cluster.subset(rup_set)?;
        let config = match self.factory.build_configuration(&sub)? {
            Some(config) => config,
            None => {
                debug!(cluster = index, ruptures = sub.num_ruptures(), "cluster declined");
                return Ok(ClusterSolution { cluster: index, mapping, outcome: ClusterOutcome::Declined });
            }
        };
        let outcome = match run_system(&sub, &config, self.cancel.as_ref(), self.progress_interval) {
            Ok(run) => {
                let misfit_stats = run.misfits.stats();
                ClusterOutcome::Solved {
                    initial_solution: run.system.adjust_solution_for_water_level(run.system.initial_solution()),
                    water_level: run.system.water_level().map(<[f64]>::to_vec),
                    rates: run.rates,
                    misfit_stats,
                    counts: run.counts,
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(cluster = index, error = %e, "cluster inversion failed");
                ClusterOutcome::Failed(e.to_string())
            }
        };
        Ok(ClusterSolution { cluster: index, mapping, outcome })
    }

    /// Solve `rup_set` cluster by cluster. A single cluster falls through to
    /// the ordinary inversion.
    pub fn solve(&self, rup_set: Arc<RuptureSet>) -> Result<FaultSystemSolution> {
        let clusters = rup_set.connectivity_clusters();
        if clusters.len() <= 1 {
            let config = self.factory.build_configuration(&rup_set)?.ok_or_else(|| {
                InversionError::Configuration("factory declined the full rupture set".to_string())
            })?;
            let mut solver = InversionSolver::new().progress_interval(self.progress_interval);
            if let Some(c) = &self.cancel {
                solver = solver.with_cancellation(c.clone());
            }
            return solver.run(rup_set, &config);
        }
        info!(
            clusters = clusters.len(),
            largest = clusters[0].num_ruptures(),
            parallel = self.options.parallel,
            "solving connectivity clusters"
        );

        let solutions: Vec<Result<ClusterSolution>> = if self.options.parallel {
            clusters
                .par_iter()
                .enumerate()
                .map(|(i, c)| self.solve_cluster(&rup_set, i, c))
                .collect()
        } else {
            clusters
                .iter()
                .enumerate()
                .map(|(i, c)| self.solve_cluster(&rup_set, i, c))
                .collect()
        };
        let solutions = solutions.into_iter().collect::<Result<Vec<_>>>()?;
        self.merge(rup_set, solutions)
    }

    fn merge(&self, rup_set: Arc<RuptureSet>, solutions: Vec<ClusterSolution>) -> Result<FaultSystemSolution> {
        let n = rup_set.num_ruptures();
        let mut rates = ClusterMerger::new(n);
        let mut initial = ClusterMerger::new(n);
        let mut water_level = ClusterMerger::new(n);
        let mut any_water_level = false;
        let mut stats_by_cluster = BTreeMap::new();
        let mut failed = Vec::new();
        let mut counts = IterationCounts::default();

        for sol in &solutions {
            match &sol.outcome {
                ClusterOutcome::Solved { rates: r, initial_solution, water_level: wl, misfit_stats, counts: c } => {
                    rates.scatter(sol.cluster, &sol.mapping, r)?;
                    initial.scatter(sol.cluster, &sol.mapping, initial_solution)?;
                    if let Some(wl) = wl {
                        water_level.scatter(sol.cluster, &sol.mapping, wl)?;
                        any_water_level = true;
                    }
                    stats_by_cluster.insert(sol.cluster, misfit_stats.clone());
                    counts += *c;
                    debug!(cluster = sol.cluster, ruptures = sol.mapping.num_ruptures(), "merged cluster");
                }
                ClusterOutcome::Declined => {}
                ClusterOutcome::Failed(msg) => failed.push((sol.cluster, msg.clone())),
            }
        }

        let combined = InversionMisfitStats::combine(stats_by_cluster.values());
        let mut solution = FaultSystemSolution::new(rup_set, rates.into_values())?;
        solution.attach_initial_solution(initial.into_values());
        if any_water_level {
            solution.attach_water_level(water_level.into_values());
        }
        solution.attach_misfit_stats(combined);
        solution.attach_cluster_misfit_stats(stats_by_cluster);
        solution.attach_counts(counts);
        for (cluster, msg) in failed {
            solution.attach_failed_cluster(cluster, msg);
        }
        Ok(solution)
    }
}
