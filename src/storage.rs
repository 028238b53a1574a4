use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::config::GradingConfig;
use crate::errors::StorageError;
use crate::scoring::{CheckedAnswer, ScoreReport};
use crate::state::AnswerKey;

pub const DEFAULT_KEY_FILE: &str = "answer_key.json";

/// On-disk form of the answer key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    answers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated: Option<DateTime<Local>>,
}

pub fn load_answer_key(path: &Path) -> Result<AnswerKey, StorageError> {
    let file = File::open(path)?;
    let stored: StoredKey = serde_json::from_reader(BufReader::new(file))?;
    AnswerKey::parse(&stored.answers).map_err(StorageError::InvalidKey)
}

/// Writes the key with the current time as `updated`, replacing the file
/// only once the new content is fully written.
pub fn save_answer_key(path: &Path, key: &AnswerKey) -> Result<(), StorageError> {
    let stored = StoredKey {
        answers: key.answers().iter().map(|l| l.to_string()).collect(),
        updated: Some(Local::now()),
    };
    let tmp = path.with_extension("json.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, &stored)?;
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load_config(path: &Path) -> Result<GradingConfig, StorageError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[derive(Debug, Serialize)]
pub struct QuestionScoreRow {
    pub question: usize,
    pub expected: String,
    pub given: String,
    pub outcome: CheckedAnswer,
    pub score: u8,
}

pub fn to_rows(report: &ScoreReport) -> Vec<QuestionScoreRow> {
    report
        .graded_questions
        .iter()
        .map(|q| QuestionScoreRow {
            question: q.question,
            expected: q.expected.to_string(),
            given: q.given.to_string(),
            outcome: q.result,
            score: u8::from(q.result.is_correct()),
        })
        .collect()
}

pub fn write_csv<W: Write>(report: &ScoreReport, writer: W) -> Result<(), StorageError> {
    let mut wtr = csv::Writer::from_writer(writer);
    for row in to_rows(report) {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn export_to_csv(report: &ScoreReport, path: &Path) -> Result<(), StorageError> {
    write_csv(report, File::create(path)?)
}
