//! mdrun library
//!
//! This library finds fenced code blocks in markdown documents and runs them,
//! so examples in a README cannot silently rot. The primary interface is the
//! `mdrun` binary, but the library can be used programmatically for testing
//! or custom integrations.
//!
//! ## Public API
//!
//! - [`find_runnables`] - Scan markdown text for runnable blocks
//! - [`Runner`] - Discover and run every example of a list of sources
//! - [`Engine`] - Materialize and execute a single block
//! - [`Frob`] and [`FrobRegistry`] - Per-language execution strategies
//! - [`Languages`] - Fence tag to language resolution
//! - [`RunnerConfig`] - Configuration loaded from `mdrun.toml`
//!
//! ```
//! let examples = mdrun::find_runnables("README.md", "```sh\necho hi\n```\n");
//! assert_eq!(examples.len(), 1);
//! assert_eq!(examples[0].lines, vec!["echo hi"]);
//! ```

pub mod config;
pub mod engine;
pub mod frob;
pub mod interrupt;
pub mod language;
pub mod reporting;
pub mod runnable;
pub mod runner;
pub mod scanner;

pub use config::RunnerConfig;
pub use engine::{Engine, ExecutionResult, Outcome, Placeholders};
pub use frob::{
    Command, CompiledFrob, ConfiguredFrob, EntryPoint, Frob, FrobRegistry, InterpretedFrob,
    StructuredFrob,
};
pub use interrupt::{StopOutcome, StopPolicy, StopSignal, Stoppable};
pub use language::{LanguageDefinition, LanguageLookup, Languages};
pub use runnable::{parse_duration, ExpectedOutput, Runnable, Tags};
pub use runner::{Example, RunSummary, Runner, SourceExamples};
pub use scanner::{find_runnables, Scanner};
