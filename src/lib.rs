//! **rupture_inversion**: simulated-annealing inversion of earthquake rupture rates.
//!
//! This crate implements the complete inversion pipeline:
//!
//! 1. **Constraints** (`constraints`): each constraint encodes its rows of `A·x ≈ d`.
//! 2. **Linear system** (`inputs`): stack constraint rows, apply the water level.
//! 3. **Annealing** (`annealing`): serial Metropolis annealer with incremental misfits.
//! 4. **Parallel annealing** (`threaded`): barrier-synchronised rounds, best-of or averaged.
//! 5. **Re-weighting** (`reweight`): even out uncertainty-weighted fits between rounds.
//! 6. **Completion** (`completion`): stop criteria and progress tracking.
//! 7. **Configuration** (`config`): JSON-serialisable parameters, engine assembly.
//! 8. **Clusters** (`cluster`): independent connectivity clusters solved separately.
//! 9. **Solver** (`solver`): end-to-end runs producing a `FaultSystemSolution`.

pub mod types;
pub mod constraints;
pub mod inputs;
pub mod misfits;
pub mod completion;
pub mod annealing;
pub mod threaded;
pub mod reweight;
pub mod config;
pub mod cluster;
pub mod solver;

pub use types::{InversionError, Result};
