//! Linear system assembly: constraints → `A·x ≈ d`, `A_ineq·x ≤ d_ineq`.
//!
//! Assembly is two-pass. The first pass only asks constraints for their row
//! counts and lays out one [`ConstraintRowRange`] per constraint, equality
//! and inequality rows counted separately. The second pass encodes every
//! constraint into triplet storage through a bounds-checked writer, then
//! compresses to `sprs::CsMat`.

use crate::constraints::{InversionConstraint, RowWriter};
use crate::types::{ConstraintRowRange, ConstraintWeightingType, InversionError, Result};
use sprs::{CsMat, TriMat};
use std::sync::Arc;
use tracing::{debug, info};

// ─────────────────────────────────────────────────────────────
//  Sparse helpers
// ─────────────────────────────────────────────────────────────

/// `y = A·x`, visiting non-zeros in storage order.
pub fn sparse_mul(a: &CsMat<f64>, x: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; a.rows()];
    for (&val, (row, col)) in a.iter() {
        y[row] += val * x[col];
    }
    y
}

/// `A·x − d`.
pub fn calculate_misfit(a: &CsMat<f64>, d: &[f64], x: &[f64]) -> Vec<f64> {
    let mut misfit = sparse_mul(a, x);
    for (m, &di) in misfit.iter_mut().zip(d) {
        *m -= di;
    }
    misfit
}

// ─────────────────────────────────────────────────────────────
//  Column-organized data
// ─────────────────────────────────────────────────────────────

/// Per-column non-zeros of a constraint matrix plus its data vector.
///
/// A single perturbation touches one rupture, so the annealer only ever
/// walks one column at a time. Shared read-only across workers.
#[derive(Debug, Clone)]
pub struct ColumnOrganizedData {
    pub(crate) col_rows: Vec<Vec<usize>>,
    pub(crate) col_values: Vec<Vec<f64>>,
    pub(crate) d: Vec<f64>,
    num_rows: usize,
    max_rows_per_col: usize,
}

impl ColumnOrganizedData {
    pub fn new(a: &CsMat<f64>, d: &[f64]) -> Self {
        let csc = a.to_csc();
        let mut col_rows = Vec::with_capacity(csc.cols());
        let mut col_values = Vec::with_capacity(csc.cols());
        let mut max_rows_per_col = 0;
        for col in csc.outer_iterator() {
            let (rows, values): (Vec<usize>, Vec<f64>) = col.iter().map(|(r, &v)| (r, v)).unzip();
            max_rows_per_col = max_rows_per_col.max(rows.len());
            col_rows.push(rows);
            col_values.push(values);
        }
        Self {
            col_rows,
            col_values,
            d: d.to_vec(),
            num_rows: csc.rows(),
            max_rows_per_col,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_cols(&self) -> usize {
        self.col_rows.len()
    }

    pub fn max_rows_per_col(&self) -> usize {
        self.max_rows_per_col
    }

    pub fn column(&self, col: usize) -> (&[usize], &[f64]) {
        (&self.col_rows[col], &self.col_values[col])
    }

    pub fn data(&self) -> &[f64] {
        &self.d
    }

    /// Copy with row `r` of both `A` and `d` multiplied by `scalars[r]`.
    pub fn scale_rows(&self, scalars: &[f64]) -> Self {
        let col_values = self
            .col_rows
            .iter()
            .zip(&self.col_values)
            .map(|(rows, values)| rows.iter().zip(values).map(|(&r, &v)| v * scalars[r]).collect())
            .collect();
        Self {
            col_rows: self.col_rows.clone(),
            col_values,
            d: self.d.iter().zip(scalars).map(|(d, s)| d * s).collect(),
            num_rows: self.num_rows,
            max_rows_per_col: self.max_rows_per_col,
        }
    }

    /// Overwrite `misfit` with `A·x − d`.
    pub fn calculate_misfit(&self, x: &[f64], misfit: &mut [f64]) {
        for (m, &di) in misfit.iter_mut().zip(&self.d) {
            *m = -di;
        }
        for (col, (rows, values)) in self.col_rows.iter().zip(&self.col_values).enumerate() {
            let xc = x[col];
            if xc == 0.0 {
                continue;
            }
            for (&r, &v) in rows.iter().zip(values) {
                misfit[r] += v * xc;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Linear system
// ─────────────────────────────────────────────────────────────

/// Assembled inversion inputs. Immutable once built.
///
/// When a water level was supplied, `d`/`d_ineq` already have `A·w`
/// removed and `initial_solution` is `max(0, initial − w)`; the optimizer
/// solves for the rate above the floor and
/// [`adjust_solution_for_water_level`](Self::adjust_solution_for_water_level)
/// adds the floor back.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    a: CsMat<f64>,
    d: Vec<f64>,
    a_ineq: Option<CsMat<f64>>,
    d_ineq: Vec<f64>,
    ranges: Vec<ConstraintRowRange>,
    initial_solution: Vec<f64>,
    water_level: Option<Vec<f64>>,
    num_nonzeros: usize,
}

impl LinearSystem {
    pub fn num_ruptures(&self) -> usize {
        self.a.cols()
    }

    pub fn a(&self) -> &CsMat<f64> {
        &self.a
    }

    pub fn d(&self) -> &[f64] {
        &self.d
    }

    pub fn a_ineq(&self) -> Option<&CsMat<f64>> {
        self.a_ineq.as_ref()
    }

    pub fn d_ineq(&self) -> &[f64] {
        &self.d_ineq
    }

    pub fn has_inequality(&self) -> bool {
        self.a_ineq.is_some()
    }

    /// All ranges in constraint order.
    pub fn ranges(&self) -> &[ConstraintRowRange] {
        &self.ranges
    }

    pub fn equality_ranges(&self) -> impl Iterator<Item = &ConstraintRowRange> {
        self.ranges.iter().filter(|r| !r.inequality)
    }

    pub fn inequality_ranges(&self) -> impl Iterator<Item = &ConstraintRowRange> {
        self.ranges.iter().filter(|r| r.inequality)
    }

    /// Water-level adjusted starting solution.
    pub fn initial_solution(&self) -> &[f64] {
        &self.initial_solution
    }

    pub fn water_level(&self) -> Option<&[f64]> {
        self.water_level.as_deref()
    }

    /// Non-zero coefficients written by all constraints.
    pub fn num_nonzeros(&self) -> usize {
        self.num_nonzeros
    }

    pub fn is_column_compressed(&self) -> bool {
        self.a.is_csc()
    }

    /// Switch `A` and `A_ineq` to column-major storage.
    pub fn compress_columns(&mut self) {
        if !self.a.is_csc() {
            self.a = self.a.to_csc();
        }
        if let Some(a_ineq) = &self.a_ineq {
            if !a_ineq.is_csc() {
                self.a_ineq = Some(a_ineq.to_csc());
            }
        }
    }

    pub fn equality_data(&self) -> ColumnOrganizedData {
        ColumnOrganizedData::new(&self.a, &self.d)
    }

    pub fn inequality_data(&self) -> Option<ColumnOrganizedData> {
        self.a_ineq
            .as_ref()
            .map(|a| ColumnOrganizedData::new(a, &self.d_ineq))
    }

    /// Equality and inequality misfits `A·x − d` of a solution in the
    /// optimizer's (water-level removed) coordinates.
    pub fn misfits(&self, x: &[f64]) -> (Vec<f64>, Option<Vec<f64>>) {
        let eq = calculate_misfit(&self.a, &self.d, x);
        let ineq = self
            .a_ineq
            .as_ref()
            .map(|a| calculate_misfit(a, &self.d_ineq, x));
        (eq, ineq)
    }

    /// Add the water level back to an optimizer solution.
    pub fn adjust_solution_for_water_level(&self, x: &[f64]) -> Vec<f64> {
        match &self.water_level {
            Some(w) => x.iter().zip(w).map(|(xi, wi)| xi + wi).collect(),
            None => x.to_vec(),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Builder
// ─────────────────────────────────────────────────────────────

/// Which constraints have their weight divided by their row count, so a
/// constraint with many rows does not outweigh one with few.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowCountNormalization {
    #[default]
    Off,
    All,
    Only(ConstraintWeightingType),
}

impl RowCountNormalization {
    fn scale(self, constraint: &dyn InversionConstraint, rows: usize) -> f64 {
        let applies = match self {
            Self::Off => false,
            Self::All => true,
            Self::Only(kind) => constraint.weighting_type() == kind,
        };
        if applies && rows > 0 { 1.0 / rows as f64 } else { 1.0 }
    }
}

/// Assembles a [`LinearSystem`] from an ordered constraint list.
pub struct LinearSystemBuilder {
    num_ruptures: usize,
    constraints: Vec<Arc<dyn InversionConstraint>>,
    initial_solution: Option<Vec<f64>>,
    water_level: Option<Vec<f64>>,
    compress_columns: bool,
    row_count_normalization: RowCountNormalization,
}

impl LinearSystemBuilder {
    pub fn new(num_ruptures: usize, constraints: Vec<Arc<dyn InversionConstraint>>) -> Self {
        Self {
            num_ruptures,
            constraints,
            initial_solution: None,
            water_level: None,
            compress_columns: false,
            row_count_normalization: RowCountNormalization::Off,
        }
    }

    pub fn initial_solution(mut self, initial: Vec<f64>) -> Self {
        self.initial_solution = Some(initial);
        self
    }

    pub fn water_level(mut self, water_level: Vec<f64>) -> Self {
        self.water_level = Some(water_level);
        self
    }

    pub fn compress_columns(mut self, compress: bool) -> Self {
        self.compress_columns = compress;
        self
    }

    pub fn normalize_weights_by_row_count(mut self, normalization: RowCountNormalization) -> Self {
        self.row_count_normalization = normalization;
        self
    }

    /// Lay out row ranges without encoding anything.
    pub fn row_ranges(&self) -> Result<(Vec<ConstraintRowRange>, usize, usize)> {
        if self.constraints.is_empty() {
            return Err(InversionError::Configuration(
                "no constraints supplied".to_string(),
            ));
        }
        let mut eq_rows = 0;
        let mut ineq_rows = 0;
        let mut ranges = Vec::with_capacity(self.constraints.len());
        for c in &self.constraints {
            let n = c.num_rows();
            let offset = if c.is_inequality() { &mut ineq_rows } else { &mut eq_rows };
            ranges.push(ConstraintRowRange {
                name: c.name().to_string(),
                short_name: c.short_name().to_string(),
                start_row: *offset,
                end_row: *offset + n,
                inequality: c.is_inequality(),
                weight: c.weight() * self.row_count_normalization.scale(c.as_ref(), n),
                weighting: c.weighting_type(),
            });
            *offset += n;
        }
        Ok((ranges, eq_rows, ineq_rows))
    }

    fn check_length(&self, what: &str, v: &[f64]) -> Result<()> {
        if v.len() != self.num_ruptures {
            return Err(InversionError::Configuration(format!(
                "{what} has length {} but there are {} ruptures",
                v.len(),
                self.num_ruptures
            )));
        }
        if let Some(bad) = v.iter().find(|x| !x.is_finite() || **x < 0.0) {
            return Err(InversionError::Configuration(format!(
                "{what} contains invalid rate {bad}"
            )));
        }
        Ok(())
    }

    pub fn build(self) -> Result<LinearSystem> {
        if let Some(init) = &self.initial_solution {
            self.check_length("initial solution", init)?;
        }
        if let Some(wl) = &self.water_level {
            self.check_length("water level", wl)?;
        }
        let (ranges, eq_rows, ineq_rows) = self.row_ranges()?;
        let n = self.num_ruptures;
        info!(
            constraints = self.constraints.len(),
            eq_rows, ineq_rows, ruptures = n, "building linear system"
        );

        let mut a_tri = TriMat::new((eq_rows, n));
        let mut d = vec![0.0; eq_rows];
        let mut a_ineq_tri = TriMat::new((ineq_rows, n));
        let mut d_ineq = vec![0.0; ineq_rows];

        let mut num_nonzeros = 0;
        for (c, range) in self.constraints.iter().zip(&ranges) {
            let (matrix, data) = if range.inequality {
                (&mut a_ineq_tri, d_ineq.as_mut_slice())
            } else {
                (&mut a_tri, d.as_mut_slice())
            };
            let scale = self.row_count_normalization.scale(c.as_ref(), range.num_rows());
            let mut writer =
                RowWriter::new(c.name(), matrix, data, range.start_row, range.end_row).with_scale(scale);
            c.encode(&mut writer)?;
            let nnz = writer.nonzeros();
            let actual = c.num_rows();
            if actual != range.num_rows() {
                return Err(InversionError::RowCountMismatch {
                    constraint: c.name().to_string(),
                    expected: range.num_rows(),
                    actual,
                });
            }
            debug!(constraint = %range.name, rows = range.num_rows(), nnz, "encoded constraint");
            num_nonzeros += nnz;
        }

        let mut a: CsMat<f64> = a_tri.to_csr();
        let mut a_ineq: Option<CsMat<f64>> = (ineq_rows > 0).then(|| a_ineq_tri.to_csr());
        if self.compress_columns {
            a = a.to_csc();
            a_ineq = a_ineq.map(|m| m.to_csc());
        }

        let cells = ((eq_rows + ineq_rows) * n).max(1) as f64;
        info!(
            nnz = num_nonzeros,
            density = num_nonzeros as f64 / cells,
            "linear system encoded"
        );

        let mut initial_solution = self.initial_solution.unwrap_or_else(|| vec![0.0; n]);
        if let Some(wl) = &self.water_level {
            subtract_water_level(&a, &mut d, wl);
            if let Some(a_ineq) = &a_ineq {
                subtract_water_level(a_ineq, &mut d_ineq, wl);
            }
            for (x, w) in initial_solution.iter_mut().zip(wl) {
                *x = (*x - w).max(0.0);
            }
        }

        Ok(LinearSystem {
            a,
            d,
            a_ineq,
            d_ineq,
            ranges,
            initial_solution,
            water_level: self.water_level,
            num_nonzeros,
        })
    }
}

/// `d -= A·w`, one non-zero at a time.
fn subtract_water_level(a: &CsMat<f64>, d: &mut [f64], water_level: &[f64]) {
    for (&val, (row, col)) in a.iter() {
        d[row] -= val * water_level[col];
    }
}
