use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::err_log;
use crate::errors::{CommandError, GradeError};
use crate::image::mat_to_base64_png;
use crate::pipeline::{Deadline, GradeOutcome, Grader};
use crate::scoring::ScoreReport;
use crate::state::{AnswerKey, AnswerKeyStore, StudentAnswer};
use crate::storage;

/// Everything the front end needs: the current key, where it is persisted,
/// and the engine.
pub struct App {
    keys: AnswerKeyStore,
    key_path: PathBuf,
    grader: Grader,
    timeout: Option<Duration>,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub timestamp: DateTime<Local>,
    pub answer_key_count: usize,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AnswerKeyView {
    pub answers: AnswerKey,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct AnswerKeyUpdated {
    pub success: bool,
    pub message: String,
    pub answers: AnswerKey,
}

#[derive(Debug, Serialize)]
pub struct Correction {
    pub success: bool,
    pub answers: Vec<StudentAnswer>,
    pub correct_count: u32,
    pub wrong_count: u32,
    pub incorrect_count: u32,
    pub blank_count: u32,
    pub ambiguous_count: u32,
    pub percentage: u8,
    pub total_questions: u32,
    pub timestamp: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip)]
    pub report: ScoreReport,
}

impl Correction {
    pub fn from_outcome(outcome: &GradeOutcome, preview: Option<String>) -> Correction {
        let report = &outcome.report;
        Correction {
            success: true,
            answers: outcome.answers.clone(),
            correct_count: report.correct,
            wrong_count: report.wrong(),
            incorrect_count: report.incorrect,
            blank_count: report.blank,
            ambiguous_count: report.ambiguous,
            percentage: report.percentage,
            total_questions: report.total_questions,
            timestamp: Local::now(),
            preview,
            report: report.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchEntry {
    pub path: PathBuf,
    #[serde(flatten)]
    pub result: BatchResult,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BatchResult {
    Graded(Correction),
    Failed { success: bool, error: CommandError },
}

impl App {
    /// Loads the key from `key_path`, falling back to the built-in key when
    /// the file is missing or unreadable.
    pub fn open(key_path: PathBuf, grader: Grader, timeout: Option<Duration>) -> App {
        let key = match storage::load_answer_key(&key_path) {
            Ok(key) => {
                info!("Loaded {} answers from {}", key.len(), key_path.display());
                key
            }
            Err(e) => {
                warn!(
                    "Cannot load answer key from {} ({e}), using the default key",
                    key_path.display()
                );
                AnswerKey::default()
            }
        };
        App {
            keys: AnswerKeyStore::new(key),
            key_path,
            grader,
            timeout,
        }
    }

    fn deadline(&self) -> Deadline {
        self.timeout.map(Deadline::after).unwrap_or_default()
    }

    pub fn health(&self) -> Health {
        Health {
            status: "running",
            timestamp: Local::now(),
            answer_key_count: self.keys.snapshot().len(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn get_answer_key(&self) -> AnswerKeyView {
        let key = self.keys.snapshot();
        AnswerKeyView {
            count: key.len(),
            answers: AnswerKey::clone(&key),
        }
    }

    /// Replaces the whole key at once. The new key is live even if writing
    /// it to disk fails; that failure is logged and the in-memory swap is
    /// not rolled back.
    pub fn set_answer_key<S: AsRef<str>>(
        &self,
        answers: &[S],
    ) -> Result<AnswerKeyUpdated, CommandError> {
        if answers.is_empty() {
            return Err(CommandError::InvalidRequest(
                "no answers were provided".into(),
            ));
        }
        let key = AnswerKey::parse(answers)
            .map_err(|e| CommandError::InvalidRequest(e.to_string()))?;

        self.keys.replace(key.clone());
        if let Err(e) = storage::save_answer_key(&self.key_path, &key) {
            err_log!(&e);
        }
        info!("Answer key updated ({} answers)", key.len());

        Ok(AnswerKeyUpdated {
            success: true,
            message: format!("Updated {} correct answers", key.len()),
            answers: key,
        })
    }

    /// Runs the engine on one image. `questions` defaults to the length of
    /// the key.
    pub fn grade(
        &self,
        image: &[u8],
        questions: Option<usize>,
    ) -> Result<GradeOutcome, CommandError> {
        let key = self.keys.snapshot();
        let questions = questions.unwrap_or(key.len());
        info!("Grading sheet ({} bytes, {questions} questions)", image.len());

        let outcome = self
            .grader
            .grade(image, questions, &key, &self.deadline())
            .inspect_err(|e| err_log!(e))?;
        for timing in &outcome.timings {
            debug!("{:?} took {:?}", timing.stage, timing.elapsed);
        }
        let report = &outcome.report;
        info!(
            "Results: {} correct, {} wrong, {}%",
            report.correct,
            report.wrong(),
            report.percentage
        );
        Ok(outcome)
    }

    pub fn correct(
        &self,
        image: &[u8],
        questions: Option<usize>,
        with_preview: bool,
    ) -> Result<Correction, CommandError> {
        let outcome = self.grade(image, questions)?;
        let preview = if with_preview {
            let overlay = outcome.preview()?;
            Some(mat_to_base64_png(&overlay).map_err(GradeError::from)?)
        } else {
            None
        };
        Ok(Correction::from_outcome(&outcome, preview))
    }

    /// Grades many files in parallel against one snapshot of the key. A
    /// failed sheet does not stop the others.
    pub fn correct_batch(&self, paths: &[PathBuf], questions: Option<usize>) -> Vec<BatchEntry> {
        let key = self.keys.snapshot();
        let questions = questions.unwrap_or(key.len());
        info!("Grading {} sheets", paths.len());

        paths
            .par_iter()
            .map(|path| {
                let result = std::fs::read(path)
                    .map_err(|e| CommandError::Storage(e.into()))
                    .and_then(|bytes| {
                        Ok(self.grader.grade(&bytes, questions, &key, &self.deadline())?)
                    })
                    .map(|outcome| Correction::from_outcome(&outcome, None));
                let result = match result {
                    Ok(correction) => BatchResult::Graded(correction),
                    Err(error) => {
                        warn!("{}: {error}", path.display());
                        BatchResult::Failed {
                            success: false,
                            error,
                        }
                    }
                };
                BatchEntry {
                    path: path.clone(),
                    result,
                }
            })
            .collect()
    }
}
