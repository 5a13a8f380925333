pub mod engine;
mod error;
pub mod job;
pub mod orchestrator;
mod parse;
mod prompt;
pub mod summarizer;

pub use error::{AnalyzeError, Result};
pub use job::{AnalysisJob, FileFailure, JobStatus};
pub use orchestrator::{JobHandle, Orchestrator};
pub use summarizer::{LlmSummarizer, SummarizeError, Summarizer};
