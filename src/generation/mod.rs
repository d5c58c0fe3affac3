//! Natural-language query generation with bounded self-correction.

pub mod attempt;
pub mod correction;
pub mod orchestrator;
pub mod prompt;
pub mod request;

pub use attempt::GenerationAttempt;
pub use orchestrator::{GeneratedQuery, GenerationOrchestrator, GenerationSettings};
pub use request::{Enhancement, GenerationRequest, StructuredFilter};
