//! Serial annealing tests.
//!
//! Most problems here are a single total-rate row over `n` ruptures, which
//! has a known optimum and makes convergence easy to check. Every run that
//! compares results uses a fixed seed.

use rupture_inversion::annealing::*;
use rupture_inversion::completion::Completion;
use rupture_inversion::config::InversionConfiguration;
use rupture_inversion::constraints::{InversionConstraint, RateSumConstraint, SparseRowsConstraint};
use rupture_inversion::inputs::LinearSystemBuilder;
use rupture_inversion::solver::InversionSolver;
use rupture_inversion::types::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// `n` single-section ruptures.
fn independent_ruptures(n: usize) -> Arc<RuptureSet> {
    let ruptures = (0..n).map(|i| Rupture::new(vec![i], 6.0 + 0.1 * i as f64)).collect();
    Arc::new(RuptureSet::new(n, ruptures).unwrap())
}

fn total_rate(target: f64) -> Vec<Arc<dyn InversionConstraint>> {
    vec![Arc::new(RateSumConstraint::total(target, 1.0))]
}

fn total_rate_problem(n: usize, target: f64, strategy: AnnealingStrategy, basis: Option<Vec<f64>>) -> Arc<AnnealingProblem> {
    let system = LinearSystemBuilder::new(n, total_rate(target)).build().unwrap();
    Arc::new(
        AnnealingProblem::new(
            system.equality_data(),
            system.inequality_data(),
            system.ranges().to_vec(),
            basis,
            RuptureSampler::Uniform(n),
            strategy,
        )
        .unwrap(),
    )
}

fn exponential() -> AnnealingStrategy {
    AnnealingStrategy { perturbation: Perturbation::Exponential, ..AnnealingStrategy::default() }
}

fn sum(x: &[f64]) -> f64 {
    x.iter().sum()
}

// ─────────────────────────────────────────────────────────────
//  End-to-end
// ─────────────────────────────────────────────────────────────

/// Ten ruptures, total rate 5: the annealed total lands within 1%.
#[test]
fn total_rate_converges() {
    let config = InversionConfiguration::builder(total_rate(5.0), Completion::Iterations(10_000))
        .perturbation(Perturbation::Exponential)
        .seed(11)
        .build()
        .unwrap();
    let solution = InversionSolver::new().run(independent_ruptures(10), &config).unwrap();

    let total = solution.total_rate();
    assert!((total - 5.0).abs() / 5.0 < 0.01, "total rate = {total}");
    assert!(solution.rates().iter().all(|&r| r >= 0.0), "rates: {:?}", solution.rates());

    let meta = solution.metadata();
    assert_eq!(meta.counts.map(|c| c.iterations), Some(10_000));
    assert!(meta.progress.as_ref().is_some_and(|p| !p.is_empty()));
    let energy = meta.energy.as_ref().unwrap();
    assert_eq!(energy.per_range.len(), 1);
    assert!(energy.total < 25.0, "energy should drop below the initial 25, got {}", energy.total);
    let stats = meta.misfit_stats.as_ref().unwrap();
    assert!((stats.total_energy() - energy.total).abs() < 1e-9);
}

/// The same seed reproduces the same rates.
#[test]
fn fixed_seed_is_deterministic() {
    let run = |seed: u64| {
        let config = InversionConfiguration::builder(total_rate(2.0), Completion::Iterations(3_000))
            .perturbation(Perturbation::Exponential)
            .seed(seed)
            .build()
            .unwrap();
        InversionSolver::new().run(independent_ruptures(6), &config).unwrap().rates().to_vec()
    };
    assert_eq!(run(3), run(3));
    assert_ne!(run(3), run(4));
}

/// Rates stay above the water level and the total still converges.
#[test]
fn water_level_is_a_floor() {
    let config = InversionConfiguration::builder(total_rate(5.0), Completion::Iterations(10_000))
        .perturbation(Perturbation::Exponential)
        .water_level(vec![0.1; 10])
        .seed(5)
        .build()
        .unwrap();
    let solution = InversionSolver::new().run(independent_ruptures(10), &config).unwrap();

    assert!(solution.rates().iter().all(|&r| r >= 0.1), "rates: {:?}", solution.rates());
    let total = solution.total_rate();
    assert!((total - 5.0).abs() / 5.0 < 0.01, "total rate = {total}");
    assert_eq!(solution.metadata().water_level.as_deref(), Some(&[0.1; 10][..]));
}

/// Excluded ruptures keep their initial rate.
#[test]
fn excluded_ruptures_are_never_perturbed() {
    let config = InversionConfiguration::builder(total_rate(2.0), Completion::Iterations(5_000))
        .perturbation(Perturbation::Exponential)
        .initial_solution(vec![0.0, 0.0, 0.7, 0.0])
        .exclude_ruptures(vec![2])
        .seed(9)
        .build()
        .unwrap();
    let solution = InversionSolver::new().run(independent_ruptures(4), &config).unwrap();
    assert_eq!(solution.rates()[2], 0.7);
    assert!((solution.total_rate() - 2.0).abs() < 0.05, "total = {}", solution.total_rate());
}

/// The default perturbation scales by a basis, which a zero start cannot supply.
#[test]
fn variable_perturbation_needs_a_basis() {
    let config = InversionConfiguration::builder(total_rate(1.0), Completion::Iterations(10))
        .build()
        .unwrap();
    let err = InversionSolver::new().run(independent_ruptures(3), &config).unwrap_err();
    assert!(matches!(err, InversionError::Configuration(_)), "unexpected error: {err}");

    let strategy = AnnealingStrategy::default();
    let system = LinearSystemBuilder::new(3, total_rate(1.0)).build().unwrap();
    let err = AnnealingProblem::new(
        system.equality_data(),
        None,
        system.ranges().to_vec(),
        None,
        RuptureSampler::Uniform(3),
        strategy,
    )
    .unwrap_err();
    assert!(matches!(err, InversionError::Configuration(_)));
}

// ─────────────────────────────────────────────────────────────
//  Serial annealer
// ─────────────────────────────────────────────────────────────

#[test]
fn runs_exactly_the_requested_iterations() {
    let problem = total_rate_problem(5, 1.0, exponential(), None);
    let mut sa = SerialAnnealer::new(problem, &[0.0; 5], Some(1)).unwrap();

    let counts = sa.iterate(IterationCounts::default(), &Completion::Iterations(1_234)).unwrap();
    assert_eq!(counts.iterations, 1_234);
    assert!(counts.perturbations_kept <= counts.iterations);

    // Criteria are absolute: resuming at 1234 towards 2000 adds 766.
    let resumed = sa.iterate(counts, &Completion::Iterations(2_000)).unwrap();
    assert_eq!(resumed.iterations, 2_000);
    assert!(resumed.perturbations_kept >= counts.perturbations_kept);
}

#[test]
fn time_criterion_runs_until_deadline() {
    let problem = total_rate_problem(5, 1.0, exponential(), None);
    let mut sa = SerialAnnealer::new(problem, &[0.0; 5], Some(2)).unwrap();
    let deadline = Duration::from_millis(50);
    let watch = Instant::now();
    let counts = sa.iterate(IterationCounts::default(), &Completion::Time(deadline)).unwrap();
    assert!(watch.elapsed() >= deadline);
    assert!(counts.iterations > 0);
}

/// The best energy never exceeds the initial energy and matches a fresh
/// evaluation of the best solution.
#[test]
fn best_energy_is_consistent() {
    let problem = total_rate_problem(8, 3.0, exponential(), None);
    let mut sa = SerialAnnealer::new(Arc::clone(&problem), &[0.0; 8], Some(3)).unwrap();
    let initial = sa.best().energy.total;
    sa.iterate(IterationCounts::default(), &Completion::Iterations(20_000)).unwrap();

    let best = sa.best();
    assert!(best.energy.total <= initial);
    let fresh = problem.evaluate(best.x.clone());
    assert!((fresh.energy.total - best.energy.total).abs() < 1e-9);
    assert_eq!(fresh.misfit.len(), best.misfit.len());
    assert_eq!(best.num_non_zero, best.x.iter().filter(|&&v| v != 0.0).count());
}

/// A rupture no constraint touches accepts every move at zero energy
/// change; the best state still matches the best solution afterwards.
#[test]
fn free_rupture_keeps_best_consistent() {
    let constraints: Vec<Arc<dyn InversionConstraint>> = vec![Arc::new(RateSumConstraint {
        name: "First Two".to_string(),
        ruptures: Some(vec![0, 1]),
        target: 1.0,
        weight: 1.0,
        inequality: false,
    })];
    let system = LinearSystemBuilder::new(3, constraints).build().unwrap();
    let problem = Arc::new(
        AnnealingProblem::new(
            system.equality_data(),
            None,
            system.ranges().to_vec(),
            None,
            RuptureSampler::Uniform(3),
            exponential(),
        )
        .unwrap(),
    );
    let mut sa = SerialAnnealer::new(Arc::clone(&problem), &[0.0; 3], Some(21)).unwrap();
    let counts = sa.iterate(IterationCounts::default(), &Completion::Iterations(60_000)).unwrap();
    assert!(counts.perturbations_kept > 15_000, "kept {}", counts.perturbations_kept);

    let best = sa.best();
    let fresh = problem.evaluate(best.x.clone());
    assert!(
        fresh.misfit.iter().zip(&best.misfit).all(|(a, b)| (a - b).abs() < 1e-12),
        "best misfit {:?} vs fresh {:?}",
        best.misfit,
        fresh.misfit
    );
    assert!((fresh.energy.total - best.energy.total).abs() < 1e-9);
    assert_eq!(best.num_non_zero, best.x.iter().filter(|&&v| v != 0.0).count());
}

/// No bounded policy ever produces a negative rate.
#[test]
fn bounded_policies_keep_rates_non_negative() {
    let perturbations = [
        Perturbation::UniformNoTempDependence,
        Perturbation::Uniform0p0001,
        Perturbation::Gaussian,
        Perturbation::Tangent,
        Perturbation::PowerLaw,
        Perturbation::Exponential,
        Perturbation::VariableExponentialScale,
        Perturbation::VariableNoTempDependence,
    ];
    let policies = [
        NonNegativity::TryZeroRatesOften,
        NonNegativity::LimitZeroRates,
        NonNegativity::PreventZeroRates,
    ];
    for perturbation in perturbations {
        for non_negativity in policies {
            let strategy = AnnealingStrategy { perturbation, non_negativity, ..AnnealingStrategy::default() };
            let basis = perturbation.is_variable().then(|| vec![0.05; 6]);
            let problem = total_rate_problem(6, 0.5, strategy, basis);
            let mut sa = SerialAnnealer::new(problem, &[0.0, 0.1, 0.0, 0.2, 0.0, 0.05], Some(17)).unwrap();
            sa.iterate(IterationCounts::default(), &Completion::Iterations(2_000)).unwrap();
            let x = &sa.best().x;
            assert!(
                x.iter().all(|&v| v >= 0.0),
                "{perturbation} / {non_negativity} produced {x:?}"
            );
        }
    }
}

#[test]
fn unbounded_allows_negative_rates() {
    let strategy = AnnealingStrategy { non_negativity: NonNegativity::Unbounded, ..exponential() };
    let problem = total_rate_problem(4, -1.0, strategy, None);
    let mut sa = SerialAnnealer::new(problem, &[0.0; 4], Some(23)).unwrap();
    sa.iterate(IterationCounts::default(), &Completion::Iterations(5_000)).unwrap();
    let total = sum(&sa.best().x);
    assert!(total < -0.5, "total = {total}");
}

/// Inequality rows only penalise positive misfits.
#[test]
fn satisfied_inequality_costs_nothing() {
    let constraints: Vec<Arc<dyn InversionConstraint>> = vec![
        Arc::new(RateSumConstraint::total(1.0, 1.0)),
        Arc::new(SparseRowsConstraint::new("Cap", true, 1.0, vec![(vec![(0, 1.0)], 0.2)])),
    ];
    let system = LinearSystemBuilder::new(3, constraints).build().unwrap();
    let problem = Arc::new(
        AnnealingProblem::new(
            system.equality_data(),
            system.inequality_data(),
            system.ranges().to_vec(),
            None,
            RuptureSampler::Uniform(3),
            exponential(),
        )
        .unwrap(),
    );
    let mut sa = SerialAnnealer::new(Arc::clone(&problem), &[0.0; 3], Some(31)).unwrap();
    sa.iterate(IterationCounts::default(), &Completion::Iterations(20_000)).unwrap();

    let best = sa.best();
    assert!(best.x[0] <= 0.2 + 5e-3, "cap violated: {:?}", best.x);
    assert!((sum(&best.x) - 1.0).abs() < 0.01, "total = {}", sum(&best.x));
    assert_eq!(best.energy.per_range.len(), 2);

    let under = problem.evaluate(vec![0.1, 0.45, 0.45]);
    assert!(under.energy.inequality == 0.0);
    assert!(under.energy.total < 1e-20);
}

// ─────────────────────────────────────────────────────────────
//  Acceptance, cooling and energy
// ─────────────────────────────────────────────────────────────

#[test]
fn acceptance_probability_properties() {
    assert_eq!(acceptance_probability(-1.0, 0.5, 1.0), 1.0);
    assert_eq!(acceptance_probability(0.0, 0.5, 1.0), 1.0);

    let p_small = acceptance_probability(0.1, 1.0, 1.0);
    let p_large = acceptance_probability(1.0, 1.0, 1.0);
    assert!(p_small > p_large, "larger increases are less likely");
    assert!(acceptance_probability(1.0, 10.0, 1.0) > p_large, "hotter accepts more");
    assert!(acceptance_probability(1.0, 1.0, 10.0) < p_large, "scale sharpens");
    assert!((p_large - (-1.0f64).exp()).abs() < 1e-15);

    assert!(metropolis_accept(-1.0, 1e-9, 1.0, 0.999));
    assert!(!metropolis_accept(50.0, 1.0, 1.0, 0.5));
    assert!(metropolis_accept(0.1, 1.0, 1.0, 0.0));
}

#[test]
fn cooling_schedules() {
    assert!((CoolingSchedule::FastSa.temperature(10.0) - 0.1).abs() < 1e-15);
    assert!((CoolingSchedule::ClassicalSa.temperature(1.0) - 1.0 / 2f64.ln()).abs() < 1e-15);
    assert_eq!(CoolingSchedule::VeryFastSa.temperature(1.0), 1.0);
    assert_eq!(CoolingSchedule::Linear.temperature(LINEAR_COOLING_HORIZON), 0.0);
    assert_eq!(CoolingSchedule::Linear.temperature(2.0 * LINEAR_COOLING_HORIZON), 0.0);

    let slow = AnnealingStrategy { cooling: CoolingSchedule::FastSa, cooling_slowdown: 2.0, ..AnnealingStrategy::default() };
    assert!((slow.temperature(3) - 0.5).abs() < 1e-15);
}

#[test]
fn strategy_names_parse() {
    assert_eq!("FAST_SA".parse::<CoolingSchedule>().unwrap(), CoolingSchedule::FastSa);
    assert_eq!("prevent_zero_rates".parse::<NonNegativity>().unwrap(), NonNegativity::PreventZeroRates);
    assert_eq!("UNIFORM_0p0001".parse::<Perturbation>().unwrap(), Perturbation::Uniform0p0001);
    assert_eq!(Perturbation::VariableExponentialScale.to_string(), "VARIABLE_EXPONENTIAL_SCALE");
    assert!("SLOW_SA".parse::<CoolingSchedule>().is_err());
}

#[test]
fn energy_breakdown_by_range() {
    let ranges = vec![
        ConstraintRowRange {
            name: "A".into(),
            short_name: "A".into(),
            start_row: 0,
            end_row: 2,
            inequality: false,
            weight: 1.0,
            weighting: ConstraintWeightingType::Unnormalized,
        },
        ConstraintRowRange {
            name: "B".into(),
            short_name: "B".into(),
            start_row: 0,
            end_row: 2,
            inequality: true,
            weight: 1.0,
            weighting: ConstraintWeightingType::Unnormalized,
        },
    ];
    let e = calculate_energy(&[1.0, -2.0], Some(&[3.0, -4.0]), &ranges);
    assert_eq!(e.equality, 5.0);
    assert_eq!(e.inequality, 9.0);
    assert_eq!(e.total, 14.0);
    assert_eq!(e.per_range, vec![5.0, 9.0]);
}
