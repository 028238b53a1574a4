use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::GradeError;

/// A single answer option as printed on the sheet, e.g. `A`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OptionLetter(char);

impl OptionLetter {
    pub fn new(c: char) -> Result<OptionLetter, GradeError> {
        if c.is_ascii_alphanumeric() {
            Ok(OptionLetter(c.to_ascii_uppercase()))
        } else {
            Err(GradeError::Configuration(format!(
                "`{c}` is not a valid option letter"
            )))
        }
    }

    pub fn as_char(self) -> char {
        self.0
    }
}

impl fmt::Display for OptionLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OptionLetter {
    type Err = GradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => OptionLetter::new(c),
            _ => Err(GradeError::Configuration(format!(
                "`{s}` is not a single option letter"
            ))),
        }
    }
}

impl Serialize for OptionLetter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OptionLetter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What a student put down for one question, after conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudentAnswer {
    Marked(OptionLetter),
    Blank,
    Ambiguous,
}

impl StudentAnswer {
    pub fn letter(self) -> Option<OptionLetter> {
        match self {
            StudentAnswer::Marked(letter) => Some(letter),
            StudentAnswer::Blank | StudentAnswer::Ambiguous => None,
        }
    }
}

impl fmt::Display for StudentAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StudentAnswer::Marked(letter) => write!(f, "{letter}"),
            StudentAnswer::Blank => f.write_str("blank"),
            StudentAnswer::Ambiguous => f.write_str("ambiguous"),
        }
    }
}

impl Serialize for StudentAnswer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Expected letters, question 1 first. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AnswerKey(Vec<OptionLetter>);

impl AnswerKey {
    pub fn new(answers: Vec<OptionLetter>) -> Result<AnswerKey, GradeError> {
        if answers.is_empty() {
            return Err(GradeError::Configuration(
                "answer key must contain at least one answer".into(),
            ));
        }
        Ok(AnswerKey(answers))
    }

    pub fn parse<S: AsRef<str>>(answers: &[S]) -> Result<AnswerKey, GradeError> {
        let letters = answers
            .iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<OptionLetter>, _>>()?;
        AnswerKey::new(letters)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn answers(&self) -> &[OptionLetter] {
        &self.0
    }

    /// 1-based lookup.
    pub fn expected(&self, question: usize) -> Option<OptionLetter> {
        question.checked_sub(1).and_then(|i| self.0.get(i)).copied()
    }
}

impl Default for AnswerKey {
    fn default() -> Self {
        AnswerKey(
            "BCADBACDAB"
                .chars()
                .map(OptionLetter)
                .collect(),
        )
    }
}

impl<'de> Deserialize<'de> for AnswerKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let letters = Vec::<OptionLetter>::deserialize(deserializer)?;
        AnswerKey::new(letters).map_err(serde::de::Error::custom)
    }
}

/// Process-wide holder of the current answer key.
///
/// Readers take an `Arc` snapshot that stays consistent for the whole run;
/// the single writer replaces the key wholesale.
#[derive(Debug, Default)]
pub struct AnswerKeyStore {
    current: RwLock<Arc<AnswerKey>>,
}

impl AnswerKeyStore {
    pub fn new(key: AnswerKey) -> AnswerKeyStore {
        AnswerKeyStore {
            current: RwLock::new(Arc::new(key)),
        }
    }

    pub fn snapshot(&self) -> Arc<AnswerKey> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a new key, returning the one it replaced.
    pub fn replace(&self, key: AnswerKey) -> Arc<AnswerKey> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(key))
    }
}
