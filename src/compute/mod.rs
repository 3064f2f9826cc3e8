pub mod calculator;

pub use calculator::{ComputeOutcome, ConcCalculator};
