pub mod analyzer;
pub mod error;
pub mod extract;
pub mod lifecycle;
pub mod models;
pub mod recipe;
pub mod replay;
pub mod router;
pub mod scheduler;
pub mod structured_data;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use analyzer::{AnalyzerConfig, PageAnalyzer};
pub use error::AppError;
pub use lifecycle::{Lifecycle, Outcome, ReanalysisPolicy, SourceStatus, apply_outcome};
pub use models::{ExtractedEvent, NewSource, Source, SourceUpdate, compute_hash};
pub use recipe::{FieldFormat, FieldRule, Recipe, Strategy, StrategyKind};
pub use replay::ReplayEngine;
pub use router::{ExtractorRef, Route, classify, extract_domain};
pub use scheduler::{
    CycleSummary, Registration, SchedulerConfig, SchedulerEvent, SchedulerReporter,
    SchedulerService, SourceRun, TracingSchedulerReporter,
};
pub use traits::{Cleaner, Fetcher, RecipeGenerator, SourceStore};
