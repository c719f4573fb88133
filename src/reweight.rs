//! Between-round constraint re-weighting towards an even fit.
//!
//! Only uncertainty-normalized constraints take part. Their misfits are in
//! standard deviations, so one constraint's fit can be compared with
//! another's. Before each threaded round after the first, every
//! participating constraint's weight is multiplied by `sqrt(q / q̄)`, where
//! `q` is its misfit quantity and `q̄` the mean over all participants, so
//! poorly fit constraints gain weight and well fit ones lose it.
//!
//! A single adjustment is bounded to [`MAX_ROUND_ADJUSTMENT`] either way and
//! the accumulated weight to [`MAX_TOTAL_ADJUSTMENT`] of the original. Rows
//! are always rescaled from the original problem, so repeated rounds do not
//! accumulate floating-point drift.

use crate::annealing::{AnnealingProblem, BestState};
use crate::misfits::{MisfitQuantity, MisfitStats};
use crate::types::{ConstraintRowRange, ConstraintWeightingType, InversionError, Result};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Largest factor a weight can change by in one round.
pub const MAX_ROUND_ADJUSTMENT: f64 = 2.0;

/// Largest factor a weight can drift from its original value.
pub const MAX_TOTAL_ADJUSTMENT: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReweightOptions {
    /// Misfit summary that is evened out across constraints.
    pub quantity: MisfitQuantity,
    /// Rescale free weights so the row-count weighted total stays at its
    /// original value.
    pub conserve_total_weight: bool,
    /// Adjust by the square root of the misfit ratio rather than the ratio.
    pub sqrt_ratios: bool,
}

impl Default for ReweightOptions {
    fn default() -> Self {
        Self::new(MisfitQuantity::default())
    }
}

impl ReweightOptions {
    pub fn new(quantity: MisfitQuantity) -> Self {
        Self { quantity, conserve_total_weight: true, sqrt_ratios: true }
    }
}

/// Weights in effect after one re-weighting step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReweightRecord {
    pub round: usize,
    pub iterations: u64,
    /// Mean misfit quantity the constraints were pulled towards.
    pub target: f64,
    /// One weight per constraint range, in range order.
    pub weights: Vec<f64>,
}

#[derive(Debug)]
pub struct ConstraintReweighter {
    options: ReweightOptions,
    original: Option<Arc<AnnealingProblem>>,
    history: Vec<ReweightRecord>,
}

fn participates(range: &ConstraintRowRange) -> bool {
    range.weighting == ConstraintWeightingType::NormalizedByUncertainty
        && range.num_rows() > 0
        && range.weight > 0.0
}

impl ConstraintReweighter {
    /// Fails unless at least one of `ranges` is uncertainty-normalized.
    pub fn new(options: ReweightOptions, ranges: &[ConstraintRowRange]) -> Result<Self> {
        if !ranges.iter().any(participates) {
            return Err(InversionError::Configuration(
                "re-weighting needs at least one uncertainty-weighted constraint".to_string(),
            ));
        }
        Ok(Self { options, original: None, history: Vec::new() })
    }

    pub fn options(&self) -> ReweightOptions {
        self.options
    }

    pub fn history(&self) -> &[ReweightRecord] {
        &self.history
    }

    /// Quantity of one range's misfits with its current weight divided out.
    fn range_quantity(&self, range: &ConstraintRowRange, best: &BestState) -> Option<f64> {
        let source = if range.inequality { best.misfit_ineq.as_deref()? } else { best.misfit.as_slice() };
        let weighted = ArrayView1::from(source.get(range.start_row..range.end_row)?);
        let unweighted = if range.inequality {
            weighted.mapv(|m| m.max(0.0) / range.weight)
        } else {
            weighted.mapv(|m| m / range.weight)
        };
        let q = MisfitStats::from_misfits(range, unweighted.view(), weighted).get(self.options.quantity);
        q.is_finite().then_some(q)
    }

    /// New weights for `problem` given the current best state, or `None`
    /// when the misfits give no usable target.
    fn next_weights(
        &self,
        problem: &AnnealingProblem,
        original: &AnnealingProblem,
        best: &BestState,
    ) -> Option<(f64, Vec<f64>)> {
        let ranges = &problem.ranges;
        let quantities: Vec<Option<f64>> = ranges
            .iter()
            .map(|r| if participates(r) { self.range_quantity(r, best) } else { None })
            .collect();
        let (sum, count) = quantities.iter().flatten().fold((0.0, 0usize), |(s, n), q| (s + q, n + 1));
        if count == 0 {
            return None;
        }
        let target = sum / count as f64;
        if !(target.is_finite() && target > 0.0) {
            return None;
        }

        let mut weights: Vec<f64> = ranges.iter().map(|r| r.weight).collect();
        let mut free = vec![false; ranges.len()];
        let (mut orig_total, mut new_total, mut free_total) = (0.0, 0.0, 0.0);
        for (i, q) in quantities.iter().enumerate() {
            let Some(q) = *q else { continue };
            let orig = original.ranges[i].weight;
            let rows = ranges[i].num_rows() as f64;
            let ratio = if self.options.sqrt_ratios { (q / target).sqrt() } else { q / target };
            let ratio = ratio.clamp(1.0 / MAX_ROUND_ADJUSTMENT, MAX_ROUND_ADJUSTMENT);
            let calc = ratio * ranges[i].weight;
            let bounded = calc.clamp(orig / MAX_TOTAL_ADJUSTMENT, orig * MAX_TOTAL_ADJUSTMENT);
            free[i] = bounded == calc;
            orig_total += rows * orig;
            new_total += rows * bounded;
            if free[i] {
                free_total += rows * bounded;
            }
            weights[i] = bounded;
        }

        if self.options.conserve_total_weight && free_total > 0.0 {
            let fixed = new_total - free_total;
            let scalar = (orig_total - fixed) / free_total;
            if scalar.is_finite() && scalar > 0.0 {
                for (w, _) in weights.iter_mut().zip(&free).filter(|(_, f)| **f) {
                    *w *= scalar;
                }
            }
        }
        Some((target, weights))
    }

    /// Re-weight `problem` from the misfits of `best`. Returns the new
    /// problem and `best` re-evaluated against it.
    pub fn reweight(
        &mut self,
        problem: &Arc<AnnealingProblem>,
        best: &BestState,
        round: usize,
        iterations: u64,
    ) -> Option<(Arc<AnnealingProblem>, BestState)> {
        let original = Arc::clone(self.original.get_or_insert_with(|| Arc::clone(problem)));
        let Some((target, weights)) = self.next_weights(problem, &original, best) else {
            debug!(round, "no usable misfit target, weights unchanged");
            return None;
        };

        let mut eq_scalars = vec![1.0; original.equality.num_rows()];
        let mut ineq_scalars = original.inequality.as_ref().map(|d| vec![1.0; d.num_rows()]);
        let mut ranges = original.ranges.clone();
        for ((range, &weight), orig) in ranges.iter_mut().zip(&weights).zip(&original.ranges) {
            if !participates(orig) {
                continue;
            }
            let scalars = if range.inequality { ineq_scalars.as_deref_mut() } else { Some(eq_scalars.as_mut_slice()) };
            if let Some(scalars) = scalars {
                scalars[range.start_row..range.end_row].fill(weight / orig.weight);
            }
            debug!(constraint = %range.short_name, from = range.weight, to = weight, "re-weighted constraint");
            range.weight = weight;
        }

        let next = Arc::new(original.reweighted(&eq_scalars, ineq_scalars.as_deref(), ranges));
        let rebased = next.evaluate(best.x.clone());
        info!(
            round,
            target,
            energy_before = best.energy.total,
            energy_after = rebased.energy.total,
            "re-weighted constraints"
        );
        self.history.push(ReweightRecord { round, iterations, target, weights });
        Some((next, rebased))
    }
}
