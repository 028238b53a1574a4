pub mod classify;
mod cli;
pub mod commands;
pub mod config;
pub mod errors;
pub mod grid;
pub mod image;
pub mod normalize;
pub mod pipeline;
pub mod scoring;
pub mod state;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use cli::run;
pub use config::GradingConfig;
pub use errors::{CommandError, GradeError, StorageError};
pub use pipeline::{Deadline, GradeOutcome, Grader, Stage};
pub use scoring::ScoreReport;
pub use state::{AnswerKey, AnswerKeyStore, OptionLetter, StudentAnswer};
