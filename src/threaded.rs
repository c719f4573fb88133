//! Parallel annealing: rounds of independent sub-runs joined at barriers.
//!
//! Each round the coordinator publishes the current best state, every
//! worker copies it into its own annealer and runs until the
//! sub-completion criterion is met, then the coordinator merges the
//! reports. Members can themselves be threaded, which is how the
//! hierarchically-averaged engine is assembled.
//!
//! Workers run concurrently, so a round advances the iteration counter by
//! the longest worker's iterations, not their sum.

use crate::annealing::{calculate_energy, AnnealingProblem, BestState, SerialAnnealer};
use crate::completion::{CompletionCriteria, RoundCriteria};
use crate::reweight::{ConstraintReweighter, ReweightOptions, ReweightRecord};
use crate::types::{InversionError, InversionState, IterationCounts, Result};
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Rounds without improvement before a stall warning is logged.
pub const STALL_WARNING_ROUNDS: usize = 10;

/// How worker results are combined at the end of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMerge {
    /// Keep the lowest-energy worker state if it beats the current best.
    Best,
    /// Average solutions and misfits across workers.
    Average,
}

// ─────────────────────────────────────────────────────────────
//  Annealer strategy
// ─────────────────────────────────────────────────────────────

/// An annealing engine: a single serial stream or a threaded group.
#[derive(Debug)]
pub enum Annealer {
    Serial(SerialAnnealer),
    Threaded(ThreadedAnnealer),
}

impl Annealer {
    pub fn iterate(
        &mut self,
        start: IterationCounts,
        criteria: &dyn CompletionCriteria,
    ) -> Result<IterationCounts> {
        match self {
            Self::Serial(sa) => sa.iterate(start, criteria),
            Self::Threaded(ta) => ta.iterate(start, criteria),
        }
    }

    pub fn best(&self) -> &BestState {
        match self {
            Self::Serial(sa) => sa.best(),
            Self::Threaded(ta) => ta.best(),
        }
    }

    pub fn set_best(&mut self, best: BestState) {
        match self {
            Self::Serial(sa) => sa.set_best(best),
            Self::Threaded(ta) => ta.set_best(best),
        }
    }

    pub fn into_best(self) -> BestState {
        match self {
            Self::Serial(sa) => sa.best().clone(),
            Self::Threaded(ta) => ta.best,
        }
    }

    /// Swap in a re-weighted problem, recursively for threaded members.
    pub fn set_problem(&mut self, problem: Arc<AnnealingProblem>) {
        match self {
            Self::Serial(sa) => sa.set_problem(problem),
            Self::Threaded(ta) => ta.set_problem(problem),
        }
    }

    /// Weights chosen at each re-weighting step, if this engine re-weights.
    pub fn reweight_history(&self) -> Option<&[ReweightRecord]> {
        match self {
            Self::Serial(_) => None,
            Self::Threaded(ta) => ta.reweighter.as_ref().map(ConstraintReweighter::history),
        }
    }

    /// Worker threads this engine runs on.
    pub fn num_threads(&self) -> usize {
        match self {
            Self::Serial(_) => 1,
            Self::Threaded(ta) => ta.members.iter().map(Annealer::num_threads).sum(),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Threaded annealer
// ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ThreadedAnnealer {
    problem: Arc<AnnealingProblem>,
    members: Vec<Annealer>,
    sub_completion: Box<dyn CompletionCriteria>,
    merge: RoundMerge,
    start_sub_iterations_at_zero: bool,
    reweighter: Option<ConstraintReweighter>,
    best: BestState,
}

struct RoundStart {
    best: Arc<BestState>,
    counts: IterationCounts,
    /// Set when the problem was re-weighted since the last round.
    problem: Option<Arc<AnnealingProblem>>,
}

struct RoundReport {
    start: IterationCounts,
    end: IterationCounts,
    best: BestState,
}

/// State handed between the coordinator and workers at the barriers.
struct RoundBoard {
    start: RwLock<Option<RoundStart>>,
    reports: Vec<Mutex<Option<Result<RoundReport>>>>,
    shutdown: AtomicBool,
}

impl ThreadedAnnealer {
    pub fn new(
        problem: Arc<AnnealingProblem>,
        members: Vec<Annealer>,
        sub_completion: Box<dyn CompletionCriteria>,
        merge: RoundMerge,
        initial: &[f64],
    ) -> Result<Self> {
        if members.is_empty() {
            return Err(InversionError::Configuration(
                "threaded annealer needs at least one member".to_string(),
            ));
        }
        if initial.len() != problem.num_variables() {
            return Err(InversionError::Configuration(format!(
                "initial solution has length {}, expected {}",
                initial.len(),
                problem.num_variables()
            )));
        }
        let best = problem.evaluate(initial.to_vec());
        Ok(Self {
            problem,
            members,
            sub_completion,
            merge,
            start_sub_iterations_at_zero: false,
            reweighter: None,
            best,
        })
    }

    /// Re-weight uncertainty-normalized constraints before every round after
    /// the first.
    pub fn with_reweighting(mut self, options: ReweightOptions) -> Result<Self> {
        self.reweighter = Some(ConstraintReweighter::new(options, &self.problem.ranges)?);
        Ok(self)
    }

    /// Restart each round's iteration counter (and cooling) at zero.
    pub fn start_sub_iterations_at_zero(mut self, at_zero: bool) -> Self {
        self.start_sub_iterations_at_zero = at_zero;
        self
    }

    pub fn members(&self) -> &[Annealer] {
        &self.members
    }

    pub fn merge(&self) -> RoundMerge {
        self.merge
    }

    pub fn best(&self) -> &BestState {
        &self.best
    }

    pub fn set_best(&mut self, best: BestState) {
        self.best = best;
    }

    pub fn set_problem(&mut self, problem: Arc<AnnealingProblem>) {
        for member in &mut self.members {
            member.set_problem(Arc::clone(&problem));
        }
        self.problem = problem;
    }

    pub fn problem(&self) -> &Arc<AnnealingProblem> {
        &self.problem
    }

    /// Run rounds until `criteria` holds. Criteria are only checked between
    /// rounds, so iteration targets overshoot to the next round boundary.
    pub fn iterate(
        &mut self,
        start: IterationCounts,
        criteria: &dyn CompletionCriteria,
    ) -> Result<IterationCounts> {
        let Self {
            problem,
            members,
            sub_completion,
            merge,
            start_sub_iterations_at_zero,
            reweighter,
            best,
        } = self;
        let merge = *merge;
        let at_zero = *start_sub_iterations_at_zero;
        let sub: &dyn CompletionCriteria = &**sub_completion;
        let num_workers = members.len();
        let num_vars = problem.num_variables();

        let board = RoundBoard {
            start: RwLock::new(None),
            reports: (0..num_workers).map(|_| Mutex::new(None)).collect(),
            shutdown: AtomicBool::new(false),
        };
        let barrier = Barrier::new(num_workers + 1);
        let watch = Instant::now();
        let mut counts = start;
        let mut outcome: Result<()> = Ok(());
        let mut rounds = 0usize;
        let mut stale_rounds = 0usize;

        thread::scope(|scope| {
            for (id, member) in members.iter_mut().enumerate() {
                let board = &board;
                let barrier = &barrier;
                scope.spawn(move || worker_loop(id, member, board, barrier, sub, at_zero));
            }

            loop {
                let state = InversionState {
                    elapsed: watch.elapsed(),
                    counts,
                    num_non_zero: best.num_non_zero,
                    num_variables: num_vars,
                    energy: &best.energy,
                };
                if criteria.is_satisfied(&state) {
                    break;
                }

                let mut reweighted = None;
                if let Some(rw) = reweighter.as_mut().filter(|_| rounds > 0) {
                    if let Some((next, rebased)) = rw.reweight(problem, best, rounds, counts.iterations) {
                        *problem = Arc::clone(&next);
                        *best = rebased;
                        reweighted = Some(next);
                    }
                }

                *board.start.write() = Some(RoundStart {
                    best: Arc::new(best.clone()),
                    counts,
                    problem: reweighted,
                });
                barrier.wait();
                barrier.wait();

                let mut reports = Vec::with_capacity(num_workers);
                for slot in &board.reports {
                    match slot.lock().take() {
                        Some(Ok(report)) => reports.push(report),
                        Some(Err(e)) => {
                            if outcome.is_ok() {
                                outcome = Err(e);
                            }
                        }
                        None => {
                            if outcome.is_ok() {
                                outcome = Err(InversionError::Worker("worker returned no report".to_string()));
                            }
                        }
                    }
                }
                if outcome.is_err() {
                    break;
                }

                let before = best.energy.total;
                let advance = reports
                    .iter()
                    .map(|r| r.end.since(r.start).iterations)
                    .max()
                    .unwrap_or(0);
                if advance == 0 {
                    outcome = Err(InversionError::Configuration(format!(
                        "round {} finished without iterating; the sub-completion criterion \
                         is met before any work is done",
                        rounds + 1
                    )));
                    break;
                }
                counts.iterations += advance;
                match merge {
                    RoundMerge::Best => {
                        if let Some(winner) = reports
                            .into_iter()
                            .min_by(|a, b| a.best.energy.total.total_cmp(&b.best.energy.total))
                        {
                            if winner.best.energy.total < best.energy.total {
                                counts.perturbations_kept = winner.end.perturbations_kept;
                                counts.worse_kept = winner.end.worse_kept;
                                *best = winner.best;
                            }
                        }
                    }
                    RoundMerge::Average => {
                        for r in &reports {
                            let done = r.end.since(r.start);
                            counts.perturbations_kept += done.perturbations_kept;
                            counts.worse_kept += done.worse_kept;
                        }
                        *best = average_states(problem, &reports);
                    }
                }

                rounds += 1;
                if best.energy.total < before {
                    stale_rounds = 0;
                } else {
                    stale_rounds += 1;
                    if stale_rounds == STALL_WARNING_ROUNDS {
                        warn!(
                            rounds = stale_rounds,
                            energy = best.energy.total,
                            "best energy has not improved"
                        );
                    }
                }
                debug!(
                    round = rounds,
                    iterations = counts.iterations,
                    energy = best.energy.total,
                    non_zero = best.num_non_zero,
                    "annealing round complete"
                );
            }

            board.shutdown.store(true, Ordering::Release);
            barrier.wait();
        });

        outcome?;
        best.refresh_energy(&problem.ranges)?;
        let elapsed = watch.elapsed().as_secs_f64();
        info!(
            workers = num_workers,
            rounds,
            iterations = counts.iterations,
            iters_per_sec = (counts.iterations - start.iterations) as f64 / elapsed.max(1e-9),
            energy = best.energy.total,
            "threaded annealing finished"
        );
        Ok(counts)
    }
}

fn worker_loop(
    id: usize,
    member: &mut Annealer,
    board: &RoundBoard,
    barrier: &Barrier,
    sub: &dyn CompletionCriteria,
    at_zero: bool,
) {
    loop {
        barrier.wait();
        if board.shutdown.load(Ordering::Acquire) {
            break;
        }
        let start = board
            .start
            .read()
            .as_ref()
            .map(|s| (Arc::clone(&s.best), s.counts, s.problem.clone()));
        let report = match start {
            Some((best, counts, problem)) => {
                let round_start = if at_zero { IterationCounts { iterations: 0, ..counts } } else { counts };
                if let Some(problem) = problem {
                    member.set_problem(problem);
                }
                member.set_best((*best).clone());
                let criteria = RoundCriteria { inner: sub, start: round_start };
                panic::catch_unwind(AssertUnwindSafe(|| member.iterate(round_start, &criteria)))
                    .unwrap_or_else(|_| Err(InversionError::Worker(format!("worker {id} panicked"))))
                    .map(|end| RoundReport {
                        start: round_start,
                        end,
                        best: member.best().clone(),
                    })
            }
            None => Err(InversionError::Worker(format!("worker {id} found no round start"))),
        };
        *board.reports[id].lock() = Some(report);
        barrier.wait();
    }
}

/// Elementwise mean of the reported states. Misfits are linear in `x`, so
/// the mean misfit is the misfit of the mean solution.
fn average_states(problem: &AnnealingProblem, reports: &[RoundReport]) -> BestState {
    let n = reports.len() as f64;
    let first = &reports[0].best;
    let mut x = vec![0.0; first.x.len()];
    let mut misfit = vec![0.0; first.misfit.len()];
    let mut misfit_ineq = first.misfit_ineq.as_ref().map(|m| vec![0.0; m.len()]);
    for r in reports {
        for (a, v) in x.iter_mut().zip(&r.best.x) {
            *a += v / n;
        }
        for (a, v) in misfit.iter_mut().zip(&r.best.misfit) {
            *a += v / n;
        }
        if let (Some(acc), Some(mi)) = (misfit_ineq.as_mut(), r.best.misfit_ineq.as_ref()) {
            for (a, v) in acc.iter_mut().zip(mi) {
                *a += v / n;
            }
        }
    }
    let energy = calculate_energy(&misfit, misfit_ineq.as_deref(), &problem.ranges);
    let num_non_zero = x.iter().filter(|&&v| v != 0.0).count();
    BestState { x, misfit, misfit_ineq, energy, num_non_zero }
}
