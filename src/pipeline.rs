use std::fmt;
use std::time::{Duration, Instant};

use opencv::core::Mat;
use serde::Serialize;

use crate::classify::{classify_marks, resolve_answers, MarkDecision};
use crate::config::GradingConfig;
use crate::errors::GradeError;
use crate::grid::{locate_bubbles, BubbleRegion};
use crate::image::{render_overlay, SheetImage};
use crate::normalize::normalize_sheet;
use crate::scoring::ScoreReport;
use crate::state::{AnswerKey, StudentAnswer};

/// Where a grading run is. Runs only ever move forward; a failure stops the
/// run where it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Normalizing,
    Locating,
    Classifying,
    Scoring,
    Reported,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Received => "decoding the image",
            Stage::Normalizing => "aligning the sheet",
            Stage::Locating => "locating bubbles",
            Stage::Classifying => "reading marks",
            Stage::Scoring => "scoring",
            Stage::Reported => "reporting",
        })
    }
}

/// Caller-supplied time limit for a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Deadline {
        Deadline(None)
    }

    pub fn after(timeout: Duration) -> Deadline {
        Deadline(Some(Instant::now() + timeout))
    }

    pub fn check(&self, stage: Stage) -> Result<(), GradeError> {
        match self.0 {
            Some(at) if Instant::now() >= at => Err(GradeError::Timeout { stage }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed: Duration,
}

struct Trace {
    last: Instant,
    timings: Vec<StageTiming>,
}

impl Trace {
    fn start() -> Trace {
        Trace {
            last: Instant::now(),
            timings: Vec::with_capacity(6),
        }
    }

    fn done(&mut self, stage: Stage) {
        let now = Instant::now();
        self.timings.push(StageTiming {
            stage,
            elapsed: now - self.last,
        });
        self.last = now;
    }
}

/// Everything a run produced. The report is the product; the rest is kept
/// for previews and debugging.
#[derive(Debug)]
pub struct GradeOutcome {
    pub report: ScoreReport,
    pub answers: Vec<StudentAnswer>,
    pub regions: Vec<BubbleRegion>,
    pub decisions: Vec<MarkDecision>,
    pub canonical: Mat,
    /// One entry per completed stage, `Stage::Received` through
    /// `Stage::Reported`.
    pub timings: Vec<StageTiming>,
}

impl GradeOutcome {
    pub fn preview(&self) -> Result<Mat, GradeError> {
        render_overlay(&self.canonical, &self.regions, &self.decisions)
    }
}

/// Stateless grading engine. One `Grader` can serve any number of runs
/// from any number of threads.
#[derive(Debug, Clone)]
pub struct Grader {
    config: GradingConfig,
}

impl Grader {
    pub fn new(config: GradingConfig) -> Result<Grader, GradeError> {
        config.validate()?;
        Ok(Grader { config })
    }

    pub fn config(&self) -> &GradingConfig {
        &self.config
    }

    /// Grades one sheet against a snapshot of the key.
    ///
    /// `questions` must be positive and no larger than either the key or the
    /// printed layout; only the first `questions` answers are scored.
    pub fn grade(
        &self,
        image: &[u8],
        questions: usize,
        key: &AnswerKey,
        deadline: &Deadline,
    ) -> Result<GradeOutcome, GradeError> {
        let config = &self.config;
        if questions == 0 {
            return Err(GradeError::Configuration(
                "at least one question must be graded".into(),
            ));
        }
        if questions > key.len() {
            return Err(GradeError::Configuration(format!(
                "{questions} questions requested but the answer key has {}",
                key.len()
            )));
        }
        if questions > config.layout.questions {
            return Err(GradeError::Configuration(format!(
                "{questions} questions requested but the sheet layout has {}",
                config.layout.questions
            )));
        }

        let mut trace = Trace::start();
        let sheet = SheetImage::decode(image)?;
        trace.done(Stage::Received);

        deadline.check(Stage::Normalizing)?;
        let normalized = normalize_sheet(&sheet, &config.canonical, &config.normalizer, deadline)?;
        trace.done(Stage::Normalizing);

        deadline.check(Stage::Locating)?;
        let regions = locate_bubbles(&normalized.image, &config.layout, &config.locator, deadline)?;
        trace.done(Stage::Locating);

        deadline.check(Stage::Classifying)?;
        let decisions = classify_marks(&normalized.image, &regions, &config.classifier)?;
        let mut answers = resolve_answers(&decisions, config.layout.questions, &config.classifier);
        answers.truncate(questions);
        trace.done(Stage::Classifying);

        deadline.check(Stage::Scoring)?;
        let report = ScoreReport::compute(&answers, key)?;
        trace.done(Stage::Scoring);
        trace.done(Stage::Reported);

        Ok(GradeOutcome {
            report,
            answers,
            regions,
            decisions,
            canonical: normalized.image,
            timings: trace.timings,
        })
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::state::OptionLetter;
    use crate::test_support::{encode, render_sheet, Marks, PageQuad};

    fn grader() -> Grader {
        Grader::new(GradingConfig::default()).unwrap()
    }

    fn photo(marks: &Marks) -> Vec<u8> {
        let layout = GradingConfig::default().layout;
        encode(&render_sheet(&layout, marks, PageQuad::Skewed).unwrap())
    }

    #[test]
    fn test_grade_perfect_sheet() {
        let key = AnswerKey::default();
        let marks = key
            .answers()
            .iter()
            .enumerate()
            .fold(Marks::new(), |m, (i, l)| m.fill(i + 1, l.as_char()));

        let outcome = grader()
            .grade(&photo(&marks), 10, &key, &Deadline::none())
            .unwrap();
        assert_eq!(outcome.report.correct, 10);
        assert_eq!(outcome.report.percentage, 100);
        assert_eq!(outcome.regions.len(), 40);
        assert_eq!(outcome.decisions.len(), 40);
        let stages: Vec<Stage> = outcome.timings.iter().map(|t| t.stage).collect();
        assert_eq!(
            stages,
            [
                Stage::Received,
                Stage::Normalizing,
                Stage::Locating,
                Stage::Classifying,
                Stage::Scoring,
                Stage::Reported
            ]
        );
    }

    #[test]
    fn test_grade_mixed_sheet() {
        // key: B C A D ...
        let marks = Marks::new()
            .fill(1, 'B')
            .fill(2, 'D')
            .fill(4, 'D')
            .fill(5, 'A')
            .fill(5, 'C');
        let outcome = grader()
            .grade(&photo(&marks), 5, &AnswerKey::default(), &Deadline::none())
            .unwrap();

        let letter = |c| StudentAnswer::Marked(OptionLetter::new(c).unwrap());
        assert_eq!(
            outcome.answers,
            vec![
                letter('B'),
                letter('D'),
                StudentAnswer::Blank,
                letter('D'),
                StudentAnswer::Ambiguous
            ]
        );
        let report = &outcome.report;
        assert_eq!(report.total_questions, 5);
        assert_eq!(
            (report.correct, report.incorrect, report.blank, report.ambiguous),
            (2, 1, 1, 1)
        );
        assert_eq!(report.percentage, 40);
    }

    #[test]
    fn test_question_count_validation() {
        let key = AnswerKey::parse(&["A", "B", "C"]).unwrap();
        let image = photo(&Marks::new());
        let g = grader();

        for questions in [0, 4] {
            let err = g.grade(&image, questions, &key, &Deadline::none()).unwrap_err();
            assert!(matches!(err, GradeError::Configuration(_)), "{err}");
        }
        let long_key = AnswerKey::parse(&["A"; 12]).unwrap();
        let err = g.grade(&image, 11, &long_key, &Deadline::none()).unwrap_err();
        assert!(matches!(err, GradeError::Configuration(ref m) if m.contains("layout")));
    }

    #[test]
    fn test_unaligned_image_never_scores() {
        let garbage = encode(&crate::test_support::blank_frame(90.0).unwrap());
        let err = grader()
            .grade(&garbage, 10, &AnswerKey::default(), &Deadline::none())
            .unwrap_err();
        assert_eq!(err.kind(), "alignment_error");
    }

    #[test]
    fn test_not_an_image() {
        let err = grader()
            .grade(b"GIF89a?", 10, &AnswerKey::default(), &Deadline::none())
            .unwrap_err();
        assert_eq!(err.kind(), "decode_error");
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = grader()
            .grade(
                &photo(&Marks::new()),
                10,
                &AnswerKey::default(),
                &Deadline::after(Duration::ZERO),
            )
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            GradeError::Timeout {
                stage: Stage::Normalizing
            }
        ));
    }

    #[test]
    fn test_preview_renders() {
        let outcome = grader()
            .grade(
                &photo(&Marks::new().fill(1, 'A')),
                10,
                &AnswerKey::default(),
                &Deadline::none(),
            )
            .unwrap();
        let preview = outcome.preview().unwrap();
        use opencv::prelude::*;
        assert_eq!(preview.channels(), 3);
        assert_eq!(preview.cols(), 850);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = GradingConfig::default();
        config.layout.options.clear();
        assert!(matches!(
            Grader::new(config),
            Err(GradeError::Configuration(_))
        ));
    }

    #[test]
    fn test_stages_are_ordered() {
        assert!(Stage::Received < Stage::Normalizing);
        assert!(Stage::Classifying < Stage::Reported);
        assert_eq!(Stage::Locating.to_string(), "locating bubbles");
    }
}
