use std::fmt::Write;

use serde::ser::SerializeStruct;

use crate::pipeline::Stage;

/// Everything that can end a grading run. None of these are retried
/// internally; the caller decides whether to ask for a re-scan.
#[derive(thiserror::Error, Debug)]
pub enum GradeError {
    #[error("Input is not a decodable image: {0}")]
    Decode(String),
    #[error("Unable to align answer sheet: {0}")]
    Alignment(String),
    #[error("Unable to locate bubble grid: {0}")]
    GridDetection(String),
    #[error("Invalid grading configuration: {0}")]
    Configuration(String),
    #[error("Grading timed out while {stage}")]
    Timeout { stage: Stage },
    #[error("OpenCV error: {} (errno {})", .0.message, .0.code)]
    Vision(#[from] opencv::Error),
}

impl GradeError {
    /// Stable identifier for the calling layer to map onto responses.
    pub fn kind(&self) -> &'static str {
        match self {
            GradeError::Decode(_) => "decode_error",
            GradeError::Alignment(_) => "alignment_error",
            GradeError::GridDetection(_) => "grid_detection_error",
            GradeError::Configuration(_) => "configuration_error",
            GradeError::Timeout { .. } => "timeout",
            GradeError::Vision(_) => "vision_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, GradeError::Timeout { .. })
    }
}

impl serde::Serialize for GradeError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        let mut s = serializer.serialize_struct("GradeError", 3)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("reason", &self.to_string())?;
        s.serialize_field("retryable", &self.is_retryable())?;
        s.end()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Cannot open/write file: {0}")]
    FileOperationFailed(#[from] std::io::Error),
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to serialize CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("Stored answer key is invalid: {0}")]
    InvalidKey(#[source] GradeError),
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Grading failed: {0}")]
    Grade(#[from] GradeError),
    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),
}

impl serde::Serialize for CommandError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        match self {
            CommandError::Grade(e) => e.serialize(serializer),
            _ => self.to_string().serialize(serializer),
        }
    }
}

pub fn fmt_error_chain_of(mut err: &dyn std::error::Error) -> String {
    let mut str = err.to_string();
    while let Some(src) = err.source() {
        _ = write!(str, "\n  -> Caused by {src}");
        err = src;
    }
    str
}

#[macro_export]
macro_rules! err_log {
    ($error: expr) => {
        log::error!("{}", $crate::errors::fmt_error_chain_of($error))
    };
}
