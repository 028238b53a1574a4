use serde::Serialize;

use crate::errors::GradeError;
use crate::state::{AnswerKey, OptionLetter, StudentAnswer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoreReport {
    pub correct: u32,
    /// Wrong letters only; blank and ambiguous answers have their own counts.
    pub incorrect: u32,
    pub blank: u32,
    pub ambiguous: u32,
    pub percentage: u8,
    pub total_questions: u32,
    pub graded_questions: Vec<GradedQuestion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GradedQuestion {
    /// 1-based.
    pub question: usize,
    pub expected: OptionLetter,
    pub given: StudentAnswer,
    pub result: CheckedAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckedAnswer {
    Correct,
    Incorrect,
    Blank,
    Ambiguous,
}

impl CheckedAnswer {
    pub fn is_correct(self) -> bool {
        self == CheckedAnswer::Correct
    }
}

impl StudentAnswer {
    pub fn check_with(self, key: OptionLetter) -> CheckedAnswer {
        match self {
            StudentAnswer::Marked(letter) if letter == key => CheckedAnswer::Correct,
            StudentAnswer::Marked(_) => CheckedAnswer::Incorrect,
            StudentAnswer::Blank => CheckedAnswer::Blank,
            StudentAnswer::Ambiguous => CheckedAnswer::Ambiguous,
        }
    }
}

/// Whole-number percentage, halves rounded to even; 0 when there is nothing
/// to grade.
pub fn percentage(correct: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let ratio = f64::from(correct.min(total)) / f64::from(total);
    (ratio * 100.0).round_ties_even() as u8
}

impl ScoreReport {
    /// Grades `answers` against the first `answers.len()` entries of `key`.
    pub fn compute(answers: &[StudentAnswer], key: &AnswerKey) -> Result<ScoreReport, GradeError> {
        if answers.len() > key.len() {
            return Err(GradeError::Configuration(format!(
                "{} answers to grade but the answer key only has {}",
                answers.len(),
                key.len()
            )));
        }

        let graded_questions: Vec<GradedQuestion> = answers
            .iter()
            .zip(key.answers())
            .enumerate()
            .map(|(idx, (&given, &expected))| GradedQuestion {
                question: idx + 1,
                expected,
                given,
                result: given.check_with(expected),
            })
            .collect();

        let (mut correct, mut incorrect, mut blank, mut ambiguous) = (0u32, 0u32, 0u32, 0u32);
        for graded in &graded_questions {
            match graded.result {
                CheckedAnswer::Correct => correct += 1,
                CheckedAnswer::Incorrect => incorrect += 1,
                CheckedAnswer::Blank => blank += 1,
                CheckedAnswer::Ambiguous => ambiguous += 1,
            }
        }
        let total_questions = graded_questions.len() as u32;

        Ok(ScoreReport {
            correct,
            incorrect,
            blank,
            ambiguous,
            percentage: percentage(correct, total_questions),
            total_questions,
            graded_questions,
        })
    }

    /// Everything that did not earn the point.
    pub fn wrong(&self) -> u32 {
        self.total_questions - self.correct
    }
}
