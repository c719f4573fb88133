//! Per-constraint misfit vectors and summary statistics.

use crate::inputs::LinearSystem;
use crate::types::ConstraintRowRange;
use ndarray::{s, Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Misfits `A·x − d` of a final solution, kept alongside the data vectors.
#[derive(Debug, Clone)]
pub struct InversionMisfits {
    pub misfit: Array1<f64>,
    pub data: Array1<f64>,
    pub misfit_ineq: Option<Array1<f64>>,
    pub data_ineq: Option<Array1<f64>>,
    pub ranges: Vec<ConstraintRowRange>,
}

impl InversionMisfits {
    /// `x` is in the optimizer's coordinates (water level removed).
    pub fn new(system: &LinearSystem, x: &[f64]) -> Self {
        let (eq, ineq) = system.misfits(x);
        Self {
            misfit: Array1::from(eq),
            data: Array1::from(system.d().to_vec()),
            misfit_ineq: ineq.map(Array1::from),
            data_ineq: system
                .has_inequality()
                .then(|| Array1::from(system.d_ineq().to_vec())),
            ranges: system.ranges().to_vec(),
        }
    }

    /// Misfits of one range, divided by the range weight when `unweighted`.
    pub fn range_misfits(&self, range: &ConstraintRowRange, unweighted: bool) -> Array1<f64> {
        let source = if range.inequality {
            self.misfit_ineq.as_ref().unwrap_or(&self.misfit)
        } else {
            &self.misfit
        };
        let slice = source.slice(s![range.start_row..range.end_row]);
        if unweighted && range.weight != 0.0 && range.weight != 1.0 {
            slice.mapv(|m| m / range.weight)
        } else {
            slice.to_owned()
        }
    }

    pub fn stats(&self) -> InversionMisfitStats {
        let stats = self
            .ranges
            .iter()
            .map(|r| {
                let weighted = self.range_misfits(r, false);
                let unweighted = self.range_misfits(r, true);
                MisfitStats::from_misfits(r, unweighted.view(), weighted.view())
            })
            .collect();
        InversionMisfitStats { stats }
    }
}

/// Scalar summary of a misfit vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MisfitQuantity {
    Mean,
    /// Mean absolute deviation from zero.
    #[default]
    Mad,
    Rmse,
    StdDev,
    Energy,
}

/// Additive summary of one constraint's misfits, so stats from separately
/// solved clusters can be merged exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MisfitStats {
    pub name: String,
    pub short_name: String,
    pub inequality: bool,
    pub count: usize,
    pub sum: f64,
    pub sum_abs: f64,
    pub sum_sq: f64,
    pub min: f64,
    pub max: f64,
    /// Weighted energy; inequality rows only count positive misfits.
    pub energy: f64,
}

impl MisfitStats {
    pub fn from_misfits(
        range: &ConstraintRowRange,
        unweighted: ArrayView1<'_, f64>,
        weighted: ArrayView1<'_, f64>,
    ) -> Self {
        let energy = if range.inequality {
            weighted.fold(0.0, |acc, &m| if m > 0.0 { acc + m * m } else { acc })
        } else {
            weighted.dot(&weighted)
        };
        Self {
            name: range.name.clone(),
            short_name: range.short_name.clone(),
            inequality: range.inequality,
            count: unweighted.len(),
            sum: unweighted.sum(),
            sum_abs: unweighted.mapv(f64::abs).sum(),
            sum_sq: unweighted.dot(&unweighted),
            min: unweighted.fold(f64::INFINITY, |a, &b| a.min(b)),
            max: unweighted.fold(f64::NEG_INFINITY, |a, &b| a.max(b)),
            energy,
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.sum / self.count as f64 }
    }

    pub fn abs_mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.sum_abs / self.count as f64 }
    }

    pub fn rmse(&self) -> f64 {
        if self.count == 0 { 0.0 } else { (self.sum_sq / self.count as f64).sqrt() }
    }

    /// Population standard deviation.
    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_sq / self.count as f64 - mean * mean).max(0.0).sqrt()
    }

    pub fn get(&self, quantity: MisfitQuantity) -> f64 {
        match quantity {
            MisfitQuantity::Mean => self.mean(),
            MisfitQuantity::Mad => self.abs_mean(),
            MisfitQuantity::Rmse => self.rmse(),
            MisfitQuantity::StdDev => self.std_dev(),
            MisfitQuantity::Energy => self.energy,
        }
    }

    pub fn combine(&mut self, other: &MisfitStats) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_abs += other.sum_abs;
        self.sum_sq += other.sum_sq;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.energy += other.energy;
    }
}

/// Misfit statistics, one entry per constraint range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InversionMisfitStats {
    pub stats: Vec<MisfitStats>,
}

impl InversionMisfitStats {
    pub fn get(&self, name: &str) -> Option<&MisfitStats> {
        self.stats.iter().find(|s| s.name == name)
    }

    pub fn total_energy(&self) -> f64 {
        self.stats.iter().map(|s| s.energy).sum()
    }

    /// Merge stats that share a constraint name and kind; first-seen order.
    pub fn combine<'a>(parts: impl IntoIterator<Item = &'a InversionMisfitStats>) -> Self {
        let mut out: Vec<MisfitStats> = Vec::new();
        for part in parts {
            for st in &part.stats {
                match out
                    .iter_mut()
                    .find(|o| o.name == st.name && o.inequality == st.inequality)
                {
                    Some(existing) => existing.combine(st),
                    None => out.push(st.clone()),
                }
            }
        }
        Self { stats: out }
    }
}
