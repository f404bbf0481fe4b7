pub mod autolink;
pub mod config;
pub mod csv;
pub mod dedup;
pub mod hash;
pub mod heuristics;
pub mod memory;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod recurring;
pub mod rules;
pub mod store;
pub(crate) mod util;

pub use autolink::AutoLinker;
pub use config::PipelineConfig;
pub use csv::{ColumnMapping, ColumnRef, ParseOptions};
pub use dedup::{apply_policy, DuplicateDetector, DuplicateReport, DuplicateStatus};
pub use heuristics::{Classification, FallbackClassifier, HeuristicClassifier};
pub use memory::MemoryStore;
pub use parser::{parse_statement, ParseError, ParsedFile, RawRow, RowError};
pub use pipeline::{ImportPipeline, ImportRequest, ImportSummary, PipelineError};
pub use recurring::{RecurringDetection, RecurringDetector};
pub use rules::{Categorization, CategoryRuleEngine};
pub use store::{BeginImport, ImportPage, ImportStore, StoreError};
