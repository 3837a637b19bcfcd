pub mod accumulator;
pub mod analyzer;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod credential;
pub mod error;
pub mod probe;
pub mod projection;
pub mod redact;
pub mod runner;
pub mod scope;

pub use accumulator::{PermissionRecord, PermissionStatus, Resource, ResourceKey, RunAccumulator, UserIdentity};
pub use analyzer::{AnalysisOutcome, Analyzer, ServiceDefinition};
pub use classifier::{classify, Outcome};
pub use config::RunConfig;
pub use credential::Credential;
pub use error::ProbeError;
pub use probe::{HttpMethod, ProbeRequest, ProbeResult, ProbeTransport};
pub use projection::{project, AnalyzerResult, Binding};
pub use runner::{CancelToken, ProbeRunner};
pub use scope::{load_tests, ScopeTable, ScopeTest};
