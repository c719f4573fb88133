use crate::cluster::{self, ConnectivityCluster};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};
use std::time::Duration;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Configuration and encoding errors abort a run before any annealing
/// happens; merge conflicts abort cluster recombination. Non-improving
/// misfits are reported through `tracing::warn!` and never surface here.
#[derive(Debug, Error)]
pub enum InversionError {
    /// Invalid or inconsistent configuration (missing criteria, bad thread
    /// counts, vector lengths that do not match the rupture count, ...).
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A constraint wrote a row outside the range assigned to it.
    #[error("constraint '{constraint}' wrote row {row} outside its range [{start}, {end})")]
    RowOutOfRange {
        constraint: String,
        row: usize,
        start: usize,
        end: usize,
    },
    /// A constraint wrote a column that is not a rupture index.
    #[error("constraint '{constraint}' wrote column {col} but there are only {num_cols} ruptures")]
    ColumnOutOfRange {
        constraint: String,
        col: usize,
        num_cols: usize,
    },
    /// The row count reported before encoding differs from the one after.
    #[error("constraint '{constraint}' reported {expected} rows before encoding and {actual} after")]
    RowCountMismatch {
        constraint: String,
        expected: usize,
        actual: usize,
    },
    /// Two clusters both assigned a non-zero rate to the same rupture.
    #[error("rupture {rupture} already has a non-zero rate from cluster {existing_cluster}, cluster {cluster} wrote it again")]
    MergeConflict {
        rupture: usize,
        existing_cluster: usize,
        cluster: usize,
    },
    /// An energy recompute produced NaN or an infinity.
    #[error("non-finite value: {0}")]
    NonFinite(String),
    /// An annealing worker thread panicked or failed.
    #[error("annealing worker failed: {0}")]
    Worker(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InversionError {
    /// Errors that always abort a run, even inside cluster decomposition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::RowOutOfRange { .. }
                | Self::ColumnOutOfRange { .. }
                | Self::RowCountMismatch { .. }
                | Self::MergeConflict { .. }
                | Self::Io(_)
                | Self::Json(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, InversionError>;

// ─────────────────────────────────────────────────────────────
//  Rupture set
// ─────────────────────────────────────────────────────────────

/// A candidate earthquake spanning a set of fault sections.
#[derive(Debug, Clone, PartialEq)]
pub struct Rupture {
    /// Local section indices, each `< RuptureSet::num_sections()`.
    pub sections: Vec<usize>,
    pub magnitude: f64,
}

impl Rupture {
    pub fn new(sections: Vec<usize>, magnitude: f64) -> Self {
        Self { sections, magnitude }
    }
}

/// Immutable set of ruptures over a fault network.
///
/// `section_ids` maps each local section index to an identifier that
/// survives subsetting: the full set uses `0..num_sections`, and a cluster's
/// sub-set keeps the identifiers of the parent. Connectivity clusters are
/// computed on first request and cached for the lifetime of the set.
#[derive(Debug, Clone)]
pub struct RuptureSet {
    section_ids: Vec<usize>,
    ruptures: Vec<Rupture>,
    clusters: OnceCell<Vec<ConnectivityCluster>>,
}

impl RuptureSet {
    /// Build a rupture set with sections identified as `0..num_sections`.
    pub fn new(num_sections: usize, ruptures: Vec<Rupture>) -> Result<Self> {
        Self::with_section_ids((0..num_sections).collect(), ruptures)
    }

    /// Build a rupture set whose local section `i` carries `section_ids[i]`.
    pub fn with_section_ids(section_ids: Vec<usize>, ruptures: Vec<Rupture>) -> Result<Self> {
        let n = section_ids.len();
        for (r, rup) in ruptures.iter().enumerate() {
            if rup.sections.is_empty() {
                return Err(InversionError::Configuration(format!(
                    "rupture {r} has no sections"
                )));
            }
            if let Some(&s) = rup.sections.iter().find(|&&s| s >= n) {
                return Err(InversionError::Configuration(format!(
                    "rupture {r} references section {s}, only {n} sections exist"
                )));
            }
        }
        Ok(Self {
            section_ids,
            ruptures,
            clusters: OnceCell::new(),
        })
    }

    pub fn num_ruptures(&self) -> usize {
        self.ruptures.len()
    }

    pub fn num_sections(&self) -> usize {
        self.section_ids.len()
    }

    pub fn ruptures(&self) -> &[Rupture] {
        &self.ruptures
    }

    pub fn rupture(&self, index: usize) -> &Rupture {
        &self.ruptures[index]
    }

    /// Identifier of local section `section`.
    pub fn section_id(&self, section: usize) -> usize {
        self.section_ids[section]
    }

    pub fn section_ids(&self) -> &[usize] {
        &self.section_ids
    }

    /// Local index of the section carrying identifier `id`, if present.
    pub fn section_index(&self, id: usize) -> Option<usize> {
        self.section_ids.iter().position(|&s| s == id)
    }

    /// Connectivity clusters, largest (by rupture count) first.
    pub fn connectivity_clusters(&self) -> &[ConnectivityCluster] {
        self.clusters.get_or_init(|| cluster::build_clusters(self))
    }

    /// Rupture indices touching each local section.
    pub fn ruptures_for_sections(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.num_sections()];
        for (r, rup) in self.ruptures.iter().enumerate() {
            for &s in &rup.sections {
                out[s].push(r);
            }
        }
        out
    }
}

// ─────────────────────────────────────────────────────────────
//  Constraint row ranges
// ─────────────────────────────────────────────────────────────

/// How a constraint's rows were scaled before its weight was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintWeightingType {
    /// Raw rows times the weight.
    #[default]
    Unnormalized,
    /// Rows divided by their target value.
    Normalized,
    /// Rows divided by the data uncertainty, so misfits are in standard
    /// deviations and comparable across constraints.
    NormalizedByUncertainty,
}

/// Rows `[start_row, end_row)` of `A` (or `A_ineq`) owned by one constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintRowRange {
    pub name: String,
    pub short_name: String,
    pub start_row: usize,
    pub end_row: usize,
    pub inequality: bool,
    /// Weight baked into the rows, used to un-weight misfit statistics.
    pub weight: f64,
    pub weighting: ConstraintWeightingType,
}

impl ConstraintRowRange {
    pub fn num_rows(&self) -> usize {
        self.end_row - self.start_row
    }

    pub fn contains(&self, row: usize) -> bool {
        row >= self.start_row && row < self.end_row
    }
}

// ─────────────────────────────────────────────────────────────
//  Annealing state
// ─────────────────────────────────────────────────────────────

/// Misfit energy breakdown.
///
/// `per_range` follows the order of the row ranges the energy was computed
/// against and is empty when range tracking is off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Energy {
    pub total: f64,
    pub equality: f64,
    pub inequality: f64,
    pub per_range: Vec<f64>,
}

impl Energy {
    pub fn infinite(num_ranges: usize) -> Self {
        Self {
            total: f64::INFINITY,
            equality: f64::INFINITY,
            inequality: f64::INFINITY,
            per_range: vec![f64::INFINITY; num_ranges],
        }
    }

    pub fn is_finite(&self) -> bool {
        self.total.is_finite()
    }
}

/// Running counters of an annealing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationCounts {
    pub iterations: u64,
    pub perturbations_kept: u64,
    pub worse_kept: u64,
}

impl Add for IterationCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            iterations: self.iterations + rhs.iterations,
            perturbations_kept: self.perturbations_kept + rhs.perturbations_kept,
            worse_kept: self.worse_kept + rhs.worse_kept,
        }
    }
}

impl IterationCounts {
    /// Counts accumulated since `start`.
    pub fn since(self, start: IterationCounts) -> IterationCounts {
        IterationCounts {
            iterations: self.iterations.saturating_sub(start.iterations),
            perturbations_kept: self.perturbations_kept.saturating_sub(start.perturbations_kept),
            worse_kept: self.worse_kept.saturating_sub(start.worse_kept),
        }
    }
}

impl AddAssign for IterationCounts {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Snapshot handed to completion criteria.
#[derive(Debug, Clone, Copy)]
pub struct InversionState<'a> {
    pub elapsed: Duration,
    pub counts: IterationCounts,
    pub num_non_zero: usize,
    pub num_variables: usize,
    pub energy: &'a Energy,
}
