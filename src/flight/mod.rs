pub mod coordinator;
pub mod liveness;

pub use coordinator::{Claim, FlightState, SingleFlight, WaitOutcome};
pub use liveness::{ProcessLiveness, ProducerLiveness, StalePolicy, TaskAwareLiveness};
