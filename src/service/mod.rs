pub mod status;
pub mod builder;
pub mod concordance;

pub use builder::{CoreBuilder, CALC_TASK};
pub use concordance::ConcordanceService;
pub use status::{ComputationState, ComputationStatus, ErrorPayload};
