//! Linear system assembly tests.
//!
//! Constraints are laid out in declaration order, equality and inequality
//! rows in separate stacks. These tests check the row layout, the errors a
//! misbehaving constraint produces, and that the water level and column
//! compression leave misfits unchanged.

use proptest::prelude::*;
use rupture_inversion::constraints::{
    InversionConstraint, RateSumConstraint, RowWriter, SectionRateConstraint, SparseRowsConstraint,
};
use rupture_inversion::inputs::{LinearSystemBuilder, RowCountNormalization};
use rupture_inversion::types::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// A 4-rupture system: two equality blocks and one inequality block.
fn mixed_constraints() -> Vec<Arc<dyn InversionConstraint>> {
    vec![
        Arc::new(SparseRowsConstraint::new(
            "Pairs",
            false,
            2.0,
            vec![
                (vec![(0, 1.0), (1, 1.0)], 0.5),
                (vec![(2, 1.0), (3, 0.5)], 0.25),
            ],
        )),
        Arc::new(SparseRowsConstraint::new(
            "Upper Bound",
            true,
            1.0,
            vec![(vec![(0, 1.0), (3, 1.0)], 0.1)],
        )),
        Arc::new(RateSumConstraint::total(1.0, 1.0)),
    ]
}

fn close(a: &[f64], b: &[f64], tol: f64) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tol)
}

/// Writes one row past the end of its range.
#[derive(Debug)]
struct Overflowing;

impl InversionConstraint for Overflowing {
    fn name(&self) -> &str {
        "Overflowing"
    }
    fn short_name(&self) -> &str {
        "Over"
    }
    fn is_inequality(&self) -> bool {
        false
    }
    fn weight(&self) -> f64 {
        1.0
    }
    fn num_rows(&self) -> usize {
        2
    }
    fn encode(&self, writer: &mut RowWriter<'_>) -> Result<()> {
        let end = writer.end_row();
        writer.add(end, 0, 1.0)
    }
}

/// Reports one more row every time it is asked.
#[derive(Debug, Default)]
struct Growing {
    calls: AtomicUsize,
}

impl InversionConstraint for Growing {
    fn name(&self) -> &str {
        "Growing"
    }
    fn short_name(&self) -> &str {
        "Grow"
    }
    fn is_inequality(&self) -> bool {
        false
    }
    fn weight(&self) -> f64 {
        1.0
    }
    fn num_rows(&self) -> usize {
        1 + self.calls.fetch_add(1, Ordering::SeqCst)
    }
    fn encode(&self, writer: &mut RowWriter<'_>) -> Result<()> {
        let row = writer.start_row();
        writer.add(row, 0, 1.0)
    }
}

// ─────────────────────────────────────────────────────────────
//  Row layout
// ─────────────────────────────────────────────────────────────

/// Ranges appear in declaration order and each stack starts at row 0.
#[test]
fn row_ranges_follow_declaration_order() {
    let system = LinearSystemBuilder::new(4, mixed_constraints()).build().unwrap();
    let ranges = system.ranges();

    assert_eq!(ranges.len(), 3);
    assert_eq!(ranges[0].name, "Pairs");
    assert_eq!((ranges[0].start_row, ranges[0].end_row), (0, 2));
    assert!(ranges[1].inequality);
    assert_eq!((ranges[1].start_row, ranges[1].end_row), (0, 1));
    assert_eq!((ranges[2].start_row, ranges[2].end_row), (2, 3));

    assert_eq!(system.a().rows(), 3);
    assert_eq!(system.a().cols(), 4);
    assert_eq!(system.a_ineq().map(|a| a.rows()), Some(1));
    assert_eq!(system.d(), &[1.0, 0.5, 1.0]);
    assert_eq!(system.d_ineq(), &[0.1]);
}

/// Weights are baked into coefficients and data alike.
#[test]
fn weights_scale_coefficients_and_data() {
    let system = LinearSystemBuilder::new(4, mixed_constraints()).build().unwrap();
    let (misfit, ineq) = system.misfits(&[0.25, 0.0, 0.0, 0.0]);

    // 2·0.25 − 2·0.5
    assert!((misfit[0] + 0.5).abs() < 1e-12, "misfit[0] = {}", misfit[0]);
    assert!((misfit[1] + 0.5).abs() < 1e-12, "misfit[1] = {}", misfit[1]);
    assert!((misfit[2] + 0.75).abs() < 1e-12, "misfit[2] = {}", misfit[2]);
    assert!((ineq.unwrap()[0] - 0.15).abs() < 1e-12);
}

/// An equality-only system has no inequality matrix.
#[test]
fn equality_only_system_has_no_inequality_block() {
    let constraints: Vec<Arc<dyn InversionConstraint>> = vec![Arc::new(RateSumConstraint::total(2.0, 1.0))];
    let system = LinearSystemBuilder::new(3, constraints).build().unwrap();
    assert!(!system.has_inequality());
    assert!(system.a_ineq().is_none());
    assert!(system.d_ineq().is_empty());
    assert_eq!(system.num_nonzeros(), 3);
    assert_eq!(system.initial_solution(), &[0.0; 3]);
}

proptest! {
    /// Equality ranges tile `0..eq_rows` and inequality ranges tile
    /// `0..ineq_rows` for any mix of row counts.
    #[test]
    fn row_ranges_tile_both_stacks(blocks in prop::collection::vec((0usize..6, any::<bool>()), 1..12)) {
        let constraints: Vec<Arc<dyn InversionConstraint>> = blocks
            .iter()
            .enumerate()
            .map(|(i, &(rows, ineq))| {
                Arc::new(SparseRowsConstraint::new(
                    &format!("Block {i}"),
                    ineq,
                    1.0,
                    vec![(vec![(0, 1.0)], 0.0); rows],
                )) as Arc<dyn InversionConstraint>
            })
            .collect();
        let builder = LinearSystemBuilder::new(2, constraints);
        let (ranges, eq_rows, ineq_rows) = builder.row_ranges().unwrap();

        let mut next_eq = 0;
        let mut next_ineq = 0;
        for (range, &(rows, ineq)) in ranges.iter().zip(&blocks) {
            prop_assert_eq!(range.inequality, ineq);
            prop_assert_eq!(range.num_rows(), rows);
            let next = if ineq { &mut next_ineq } else { &mut next_eq };
            prop_assert_eq!(range.start_row, *next);
            *next = range.end_row;
        }
        prop_assert_eq!(next_eq, eq_rows);
        prop_assert_eq!(next_ineq, ineq_rows);

        let system = builder.build().unwrap();
        prop_assert_eq!(system.d().len(), eq_rows);
        prop_assert_eq!(system.d_ineq().len(), ineq_rows);
    }
}

// ─────────────────────────────────────────────────────────────
//  Errors
// ─────────────────────────────────────────────────────────────

#[test]
fn write_outside_range_is_rejected() {
    let constraints: Vec<Arc<dyn InversionConstraint>> =
        vec![Arc::new(RateSumConstraint::total(1.0, 1.0)), Arc::new(Overflowing)];
    let err = LinearSystemBuilder::new(2, constraints).build().unwrap_err();
    match err {
        InversionError::RowOutOfRange { constraint, row, start, end } => {
            assert_eq!(constraint, "Overflowing");
            assert_eq!((row, start, end), (3, 1, 3));
        }
        other => panic!("expected RowOutOfRange, got {other}"),
    }
}

#[test]
fn column_outside_rupture_count_is_rejected() {
    let constraints: Vec<Arc<dyn InversionConstraint>> = vec![Arc::new(RateSumConstraint {
        name: "Subset".to_string(),
        ruptures: Some(vec![0, 5]),
        target: 1.0,
        weight: 1.0,
        inequality: false,
    })];
    let err = LinearSystemBuilder::new(3, constraints).build().unwrap_err();
    assert!(
        matches!(err, InversionError::ColumnOutOfRange { col: 5, num_cols: 3, .. }),
        "unexpected error: {err}"
    );
}

#[test]
fn row_count_change_during_encoding_is_rejected() {
    let constraints: Vec<Arc<dyn InversionConstraint>> = vec![Arc::new(Growing::default())];
    let err = LinearSystemBuilder::new(2, constraints).build().unwrap_err();
    assert!(
        matches!(err, InversionError::RowCountMismatch { expected: 1, actual: 2, .. }),
        "unexpected error: {err}"
    );
}

#[test]
fn empty_constraint_list_is_rejected() {
    let err = LinearSystemBuilder::new(2, Vec::new()).build().unwrap_err();
    assert!(matches!(err, InversionError::Configuration(_)));
}

#[test]
fn mismatched_vector_lengths_are_rejected() {
    let err = LinearSystemBuilder::new(4, mixed_constraints())
        .initial_solution(vec![0.0; 3])
        .build()
        .unwrap_err();
    assert!(matches!(err, InversionError::Configuration(_)));

    let err = LinearSystemBuilder::new(4, mixed_constraints())
        .water_level(vec![0.0, -1.0, 0.0, 0.0])
        .build()
        .unwrap_err();
    assert!(matches!(err, InversionError::Configuration(_)), "negative water level: {err}");
}

// ─────────────────────────────────────────────────────────────
//  Water level and storage order
// ─────────────────────────────────────────────────────────────

/// Misfits of `x` under a water level equal those of `x + w` without one.
#[test]
fn water_level_preserves_misfits() {
    let w = vec![0.05, 0.0, 0.1, 0.02];
    let plain = LinearSystemBuilder::new(4, mixed_constraints()).build().unwrap();
    let leveled = LinearSystemBuilder::new(4, mixed_constraints())
        .water_level(w.clone())
        .build()
        .unwrap();

    for x in [[0.0, 0.0, 0.0, 0.0], [0.1, 0.2, 0.0, 0.3], [1.0, 0.5, 0.25, 0.125]] {
        let full: Vec<f64> = x.iter().zip(&w).map(|(a, b)| a + b).collect();
        let (eq_plain, ineq_plain) = plain.misfits(&full);
        let (eq_level, ineq_level) = leveled.misfits(&x);
        assert!(close(&eq_plain, &eq_level, 1e-9), "{eq_plain:?} vs {eq_level:?}");
        assert!(close(&ineq_plain.unwrap(), &ineq_level.unwrap(), 1e-9));
        assert!(close(&leveled.adjust_solution_for_water_level(&x), &full, 1e-15));
    }
}

/// The initial solution is shifted down by the water level and floored at zero.
#[test]
fn water_level_shifts_initial_solution() {
    let system = LinearSystemBuilder::new(4, mixed_constraints())
        .initial_solution(vec![0.3, 0.0, 0.05, 0.2])
        .water_level(vec![0.1, 0.1, 0.1, 0.1])
        .build()
        .unwrap();
    assert!(close(system.initial_solution(), &[0.2, 0.0, 0.0, 0.1], 1e-12));
}

/// Row- and column-major storage yield identical misfits and column data.
#[test]
fn column_compression_preserves_misfits() {
    let csr = LinearSystemBuilder::new(4, mixed_constraints()).build().unwrap();
    let csc = LinearSystemBuilder::new(4, mixed_constraints())
        .compress_columns(true)
        .build()
        .unwrap();
    assert!(!csr.is_column_compressed());
    assert!(csc.is_column_compressed());

    let x = [0.3, 0.1, 0.7, 0.2];
    let (eq_r, ineq_r) = csr.misfits(&x);
    let (eq_c, ineq_c) = csc.misfits(&x);
    assert!(close(&eq_r, &eq_c, 1e-15));
    assert!(close(&ineq_r.unwrap(), &ineq_c.unwrap(), 1e-15));

    let (dr, dc) = (csr.equality_data(), csc.equality_data());
    for col in 0..4 {
        assert_eq!(dr.column(col), dc.column(col), "column {col}");
    }
    let mut m = vec![0.0; dr.num_rows()];
    dr.calculate_misfit(&x, &mut m);
    assert!(close(&m, &eq_r, 1e-12));
}

// ─────────────────────────────────────────────────────────────
//  Weight normalization
// ─────────────────────────────────────────────────────────────

/// Dividing by row count halves the two-row constraint and leaves the
/// single-row ones alone.
#[test]
fn row_count_normalization_divides_weights() {
    let system = LinearSystemBuilder::new(4, mixed_constraints())
        .normalize_weights_by_row_count(RowCountNormalization::All)
        .build()
        .unwrap();
    let ranges = system.ranges();
    assert_eq!(ranges.iter().map(|r| r.weight).collect::<Vec<_>>(), vec![1.0, 1.0, 1.0]);
    assert_eq!(system.d(), &[0.5, 0.25, 1.0]);
    assert_eq!(system.d_ineq(), &[0.1]);

    let (misfit, _) = system.misfits(&[0.25, 0.0, 0.0, 0.0]);
    // 0.25 − 0.5
    assert!((misfit[0] + 0.25).abs() < 1e-12, "misfit[0] = {}", misfit[0]);
}

#[test]
fn row_count_normalization_can_target_one_weighting() {
    let plain = LinearSystemBuilder::new(4, mixed_constraints()).build().unwrap();
    let only = LinearSystemBuilder::new(4, mixed_constraints())
        .normalize_weights_by_row_count(RowCountNormalization::Only(
            ConstraintWeightingType::NormalizedByUncertainty,
        ))
        .build()
        .unwrap();
    assert_eq!(only.d(), plain.d());
    assert_eq!(only.ranges(), plain.ranges());

    let mut constraints = mixed_constraints();
    constraints.push(Arc::new(
        SparseRowsConstraint::new(
            "Sigma",
            false,
            4.0,
            vec![(vec![(1, 1.0)], 1.0), (vec![(2, 1.0)], 1.0), (vec![(3, 1.0)], 1.0), (vec![(0, 1.0)], 1.0)],
        )
        .weighting(ConstraintWeightingType::NormalizedByUncertainty),
    ));
    let system = LinearSystemBuilder::new(4, constraints)
        .normalize_weights_by_row_count(RowCountNormalization::Only(
            ConstraintWeightingType::NormalizedByUncertainty,
        ))
        .build()
        .unwrap();
    let sigma = &system.ranges()[3];
    assert_eq!(sigma.weighting, ConstraintWeightingType::NormalizedByUncertainty);
    assert_eq!(sigma.weight, 1.0);
    assert_eq!(&system.d()[3..], &[1.0, 1.0, 1.0, 1.0]);
    assert_eq!(system.ranges()[0].weight, 2.0);
}

/// Section rate rows are divided by each section's standard deviation.
#[test]
fn section_rate_uncertainties_scale_rows() {
    let rup_set = RuptureSet::new(
        2,
        vec![Rupture::new(vec![0], 6.0), Rupture::new(vec![1], 6.0), Rupture::new(vec![0, 1], 6.5)],
    )
    .unwrap();
    let constraint = SectionRateConstraint::new(&rup_set, &[1.0, 2.0], 1.0, false)
        .unwrap()
        .with_uncertainties(&rup_set, &[0.5, 2.0])
        .unwrap();
    assert_eq!(constraint.weighting_type(), ConstraintWeightingType::NormalizedByUncertainty);

    let system = LinearSystemBuilder::new(3, vec![Arc::new(constraint)]).build().unwrap();
    assert_eq!(system.d(), &[2.0, 1.0]);
    assert_eq!(system.ranges()[0].weighting, ConstraintWeightingType::NormalizedByUncertainty);
    let (misfit, _) = system.misfits(&[0.0, 0.0, 1.0]);
    // (1 − 1)/0.5 and (1 − 2)/2
    assert!(misfit[0].abs() < 1e-12 && (misfit[1] + 0.5).abs() < 1e-12, "{misfit:?}");

    let err = SectionRateConstraint::new(&rup_set, &[1.0, 2.0], 1.0, false)
        .unwrap()
        .with_uncertainties(&rup_set, &[0.5, 0.0])
        .unwrap_err();
    assert!(matches!(err, InversionError::Configuration(_)), "unexpected error: {err}");
}
