//! Decomposition engine: atomicity analysis, research triggering, dependency
//! inference, batch validation with chunked scoring, and execution planning.

pub mod atomicity;
pub mod batch;
pub mod dependency_inference;
pub mod engine;
pub mod plan;
pub mod research;

pub use atomicity::{AtomicityAnalysis, AtomicityViolation};
pub use batch::{score_file_relevance, validate_batch, BatchValidation, FileScore, ScoringReport};
pub use dependency_inference::DependencySuggestion;
pub use engine::{DecompositionEngine, DecompositionReport};
pub use plan::{build_plan, compute_graph, ExecutionPlan};
pub use research::ResearchDecision;
