use itertools::Itertools;
use opencv::core::{Mat, Size};
use opencv::imgproc::{self, THRESH_BINARY, THRESH_OTSU};
use opencv::prelude::*;

use crate::config::ClassifierConfig;
use crate::errors::GradeError;
use crate::grid::BubbleRegion;
use crate::state::{OptionLetter, StudentAnswer};

/// The verdict on one bubble.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkDecision {
    pub question: usize,
    pub option: OptionLetter,
    pub fill_ratio: f32,
    pub filled: bool,
    /// For a filled bubble, its lead in fill ratio over the darkest other
    /// bubble of the same question. For an empty one, how far below the
    /// threshold it sits, relative to the threshold. Both in `0.0..=1.0`.
    pub confidence: f32,
}

/// Measures every region and decides which are filled. Decisions come back in
/// the same order as `regions`.
pub fn classify_marks(
    canonical: &Mat,
    regions: &[BubbleRegion],
    config: &ClassifierConfig,
) -> Result<Vec<MarkDecision>, GradeError> {
    let (smoothed, dark_level) = calibrate(canonical)?;

    let ratios = regions
        .iter()
        .map(|r| fill_ratio(&smoothed, r, dark_level, config.inner_radius_ratio))
        .collect::<Result<Vec<f32>, GradeError>>()?;

    let decisions = regions
        .iter()
        .zip(&ratios)
        .map(|(region, &fill_ratio)| {
            let filled = fill_ratio >= config.fill_threshold;
            let darkest_rival = regions
                .iter()
                .zip(&ratios)
                .filter(|(other, _)| {
                    other.question == region.question && other.option != region.option
                })
                .map(|(_, &r)| r)
                .fold(0.0f32, f32::max);
            let confidence = if filled {
                fill_ratio - darkest_rival
            } else {
                (config.fill_threshold - fill_ratio) / config.fill_threshold
            };
            MarkDecision {
                question: region.question,
                option: region.option,
                fill_ratio,
                filled,
                confidence: confidence.clamp(0.0, 1.0),
            }
        })
        .collect();
    Ok(decisions)
}

/// Light blur plus the Otsu split between ink and paper for this sheet.
fn calibrate(canonical: &Mat) -> Result<(Mat, f64), GradeError> {
    let mut smoothed = Mat::default();
    imgproc::gaussian_blur_def(canonical, &mut smoothed, Size::new(3, 3), 0.0)?;
    let mut scratch = Mat::default();
    let dark_level = imgproc::threshold(
        &smoothed,
        &mut scratch,
        0.0,
        255.0,
        THRESH_BINARY | THRESH_OTSU,
    )?;
    Ok((smoothed, dark_level))
}

/// Fraction of pixels inside the inner disc of `region` that are darker than
/// `dark_level`. Pixels outside the image are ignored.
fn fill_ratio(
    image: &Mat,
    region: &BubbleRegion,
    dark_level: f64,
    inner_radius_ratio: f32,
) -> Result<f32, GradeError> {
    let (cx, cy) = region.center;
    let r = region.radius * inner_radius_ratio;
    let span = |c: f32, limit: i32| {
        let lo = (c - r).floor().max(0.0) as i32;
        let hi = ((c + r).ceil() as i32).min(limit - 1);
        lo..=hi
    };
    let (x_range, y_range) = (span(cx, image.cols()), span(cy, image.rows()));

    let (mut dark, mut total) = (0u32, 0u32);
    for (y, x) in y_range.cartesian_product(x_range) {
        let (dx, dy) = (x as f32 - cx, y as f32 - cy);
        if dx * dx + dy * dy > r * r {
            continue;
        }
        total += 1;
        if f64::from(*image.at_2d::<u8>(y, x)?) < dark_level {
            dark += 1;
        }
    }
    Ok(if total == 0 {
        0.0
    } else {
        dark as f32 / total as f32
    })
}

/// Collapses the decisions of each question into one answer, question 1
/// first. `questions` answers are always returned; a question with no
/// decisions is blank.
///
/// - nothing filled: blank
/// - otherwise the darkest bubble, if it leads the next darkest bubble of the
///   question by at least `ambiguity_margin`, filled or not; ambiguous
///   otherwise
pub fn resolve_answers(
    decisions: &[MarkDecision],
    questions: usize,
    config: &ClassifierConfig,
) -> Vec<StudentAnswer> {
    let by_question = decisions.iter().into_group_map_by(|d| d.question);
    (1..=questions)
        .map(|q| {
            let ranked = by_question
                .get(&q)
                .map(|ds| {
                    ds.iter()
                        .sorted_by(|a, b| b.fill_ratio.total_cmp(&a.fill_ratio))
                        .collect_vec()
                })
                .unwrap_or_default();
            match ranked.as_slice() {
                [] => StudentAnswer::Blank,
                [darkest, ..] if !darkest.filled => StudentAnswer::Blank,
                [only] => StudentAnswer::Marked(only.option),
                [darkest, runner_up, ..] => {
                    if darkest.fill_ratio - runner_up.fill_ratio >= config.ambiguity_margin {
                        StudentAnswer::Marked(darkest.option)
                    } else {
                        StudentAnswer::Ambiguous
                    }
                }
            }
        })
        .collect()
}
