//! Constraint capability and the row writer constraints encode through.
//!
//! A constraint contributes a fixed number of linear rows in the rupture
//! rate vector. The builder first asks every constraint for its row count,
//! lays the rows out, then hands each constraint a [`RowWriter`] scoped to
//! its own range. Writes outside that range are rejected.

use crate::types::{ConstraintWeightingType, InversionError, Result, RuptureSet};
use sprs::TriMat;
use std::fmt::Debug;

// ─────────────────────────────────────────────────────────────
//  Constraint trait
// ─────────────────────────────────────────────────────────────

/// A block of linear rows `a·x = d` (or `a·x ≤ d` for inequalities).
///
/// Implementations must be `Send + Sync` so one configuration can be shared
/// across cluster workers. Weights are baked into the rows by `encode`.
pub trait InversionConstraint: Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Short label used in misfit tables.
    fn short_name(&self) -> &str;

    fn is_inequality(&self) -> bool;

    fn weight(&self) -> f64;

    fn weighting_type(&self) -> ConstraintWeightingType {
        ConstraintWeightingType::Unnormalized
    }

    /// Number of rows this constraint writes. Must be cheap; called before
    /// and after encoding.
    fn num_rows(&self) -> usize;

    /// Write rows `writer.start_row()..writer.end_row()` of the matrix and
    /// data vector. Called exactly once per build.
    fn encode(&self, writer: &mut RowWriter<'_>) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────
//  Row writer
// ─────────────────────────────────────────────────────────────

/// Bounds-checked window onto the rows of `A`/`d` owned by one constraint.
///
/// Row indices are absolute. Zero coefficients are dropped. Every written
/// coefficient and data value is multiplied by the writer's row scale.
pub struct RowWriter<'a> {
    constraint: &'a str,
    matrix: &'a mut TriMat<f64>,
    data: &'a mut [f64],
    start: usize,
    end: usize,
    scale: f64,
    nonzeros: usize,
}

impl<'a> RowWriter<'a> {
    pub(crate) fn new(
        constraint: &'a str,
        matrix: &'a mut TriMat<f64>,
        data: &'a mut [f64],
        start: usize,
        end: usize,
    ) -> Self {
        Self { constraint, matrix, data, start, end, scale: 1.0, nonzeros: 0 }
    }

    pub(crate) fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn start_row(&self) -> usize {
        self.start
    }

    pub fn end_row(&self) -> usize {
        self.end
    }

    pub fn num_cols(&self) -> usize {
        self.matrix.cols()
    }

    /// Non-zero coefficients written so far.
    pub fn nonzeros(&self) -> usize {
        self.nonzeros
    }

    fn check_row(&self, row: usize) -> Result<()> {
        if row < self.start || row >= self.end {
            return Err(InversionError::RowOutOfRange {
                constraint: self.constraint.to_string(),
                row,
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    /// Add `value` to coefficient `(row, col)`. Repeated writes accumulate.
    pub fn add(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        self.check_row(row)?;
        if col >= self.matrix.cols() {
            return Err(InversionError::ColumnOutOfRange {
                constraint: self.constraint.to_string(),
                col,
                num_cols: self.matrix.cols(),
            });
        }
        if value != 0.0 {
            self.matrix.add_triplet(row, col, value * self.scale);
            self.nonzeros += 1;
        }
        Ok(())
    }

    /// Set the data (target) value of `row`.
    pub fn set_data(&mut self, row: usize, value: f64) -> Result<()> {
        self.check_row(row)?;
        self.data[row] = value * self.scale;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Stock constraints
// ─────────────────────────────────────────────────────────────

/// One row: the weighted sum of the selected rupture rates hits `target`.
#[derive(Debug, Clone)]
pub struct RateSumConstraint {
    pub name: String,
    /// Ruptures in the sum; `None` sums every rupture.
    pub ruptures: Option<Vec<usize>>,
    pub target: f64,
    pub weight: f64,
    pub inequality: bool,
}

impl RateSumConstraint {
    /// Total rate over all ruptures.
    pub fn total(target: f64, weight: f64) -> Self {
        Self {
            name: "Total Rate".to_string(),
            ruptures: None,
            target,
            weight,
            inequality: false,
        }
    }
}

impl InversionConstraint for RateSumConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn short_name(&self) -> &str {
        "RateSum"
    }

    fn is_inequality(&self) -> bool {
        self.inequality
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn num_rows(&self) -> usize {
        1
    }

    fn encode(&self, writer: &mut RowWriter<'_>) -> Result<()> {
        let row = writer.start_row();
        match &self.ruptures {
            Some(rups) => {
                for &r in rups {
                    writer.add(row, r, self.weight)?;
                }
            }
            None => {
                for r in 0..writer.num_cols() {
                    writer.add(row, r, self.weight)?;
                }
            }
        }
        writer.set_data(row, self.weight * self.target)
    }
}

/// One row per section: the summed rate of ruptures on the section matches
/// the section's target participation rate.
///
/// Targets are captured per section identifier so the same table can
/// re-scope the constraint to any sub rupture set.
#[derive(Debug, Clone)]
pub struct SectionRateConstraint {
    section_ruptures: Vec<Vec<usize>>,
    targets: Vec<f64>,
    /// Per-section standard deviations; rows are divided by them.
    std_devs: Option<Vec<f64>>,
    weight: f64,
    inequality: bool,
}

impl SectionRateConstraint {
    /// `targets_by_id[id]` is the target for the section with identifier `id`.
    pub fn new(
        rup_set: &RuptureSet,
        targets_by_id: &[f64],
        weight: f64,
        inequality: bool,
    ) -> Result<Self> {
        let mut targets = Vec::with_capacity(rup_set.num_sections());
        for s in 0..rup_set.num_sections() {
            let id = rup_set.section_id(s);
            let t = targets_by_id.get(id).copied().ok_or_else(|| {
                InversionError::Configuration(format!(
                    "no section rate target for section id {id}"
                ))
            })?;
            targets.push(t);
        }
        Ok(Self {
            section_ruptures: rup_set.ruptures_for_sections(),
            targets,
            std_devs: None,
            weight,
            inequality,
        })
    }

    /// Normalize each row by the uncertainty of its target, looked up by
    /// section identifier like the targets.
    pub fn with_uncertainties(mut self, rup_set: &RuptureSet, std_devs_by_id: &[f64]) -> Result<Self> {
        let mut std_devs = Vec::with_capacity(rup_set.num_sections());
        for s in 0..rup_set.num_sections() {
            let id = rup_set.section_id(s);
            match std_devs_by_id.get(id).copied() {
                Some(sd) if sd.is_finite() && sd > 0.0 => std_devs.push(sd),
                Some(sd) => {
                    return Err(InversionError::Configuration(format!(
                        "section id {id} has invalid rate uncertainty {sd}"
                    )))
                }
                None => {
                    return Err(InversionError::Configuration(format!(
                        "no section rate uncertainty for section id {id}"
                    )))
                }
            }
        }
        self.std_devs = Some(std_devs);
        Ok(self)
    }
}

impl InversionConstraint for SectionRateConstraint {
    fn name(&self) -> &str {
        "Section Participation Rate"
    }

    fn short_name(&self) -> &str {
        "SectRate"
    }

    fn is_inequality(&self) -> bool {
        self.inequality
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn weighting_type(&self) -> ConstraintWeightingType {
        if self.std_devs.is_some() {
            ConstraintWeightingType::NormalizedByUncertainty
        } else {
            ConstraintWeightingType::Unnormalized
        }
    }

    fn num_rows(&self) -> usize {
        self.targets.len()
    }

    fn encode(&self, writer: &mut RowWriter<'_>) -> Result<()> {
        let start = writer.start_row();
        for (s, (rups, &target)) in self.section_ruptures.iter().zip(&self.targets).enumerate() {
            let row = start + s;
            let coeff = match &self.std_devs {
                Some(sd) => self.weight / sd[s],
                None => self.weight,
            };
            for &r in rups {
                writer.add(row, r, coeff)?;
            }
            writer.set_data(row, coeff * target)?;
        }
        Ok(())
    }
}

/// Explicit sparse rows, each `(coefficients, target)`.
#[derive(Debug, Clone)]
pub struct SparseRowsConstraint {
    pub name: String,
    pub short_name: String,
    pub inequality: bool,
    pub weight: f64,
    pub weighting: ConstraintWeightingType,
    pub rows: Vec<(Vec<(usize, f64)>, f64)>,
}

impl SparseRowsConstraint {
    pub fn new(name: &str, inequality: bool, weight: f64, rows: Vec<(Vec<(usize, f64)>, f64)>) -> Self {
        Self {
            name: name.to_string(),
            short_name: name.split_whitespace().collect(),
            inequality,
            weight,
            weighting: ConstraintWeightingType::Unnormalized,
            rows,
        }
    }

    /// Declare how the supplied rows were normalized.
    pub fn weighting(mut self, weighting: ConstraintWeightingType) -> Self {
        self.weighting = weighting;
        self
    }
}

impl InversionConstraint for SparseRowsConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn short_name(&self) -> &str {
        &self.short_name
    }

    fn is_inequality(&self) -> bool {
        self.inequality
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn weighting_type(&self) -> ConstraintWeightingType {
        self.weighting
    }

    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn encode(&self, writer: &mut RowWriter<'_>) -> Result<()> {
        let start = writer.start_row();
        for (i, (coeffs, target)) in self.rows.iter().enumerate() {
            for &(col, val) in coeffs {
                writer.add(start + i, col, self.weight * val)?;
            }
            writer.set_data(start + i, self.weight * target)?;
        }
        Ok(())
    }
}
