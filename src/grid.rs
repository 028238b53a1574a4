use std::collections::HashMap;
use std::f64::consts::PI;

use itertools::Itertools;
use opencv::core::{Mat, Point, Rect, Scalar, Size, Vector};
use opencv::imgproc::{
    self, CHAIN_APPROX_SIMPLE, LINE_8, RETR_EXTERNAL, THRESH_BINARY_INV, THRESH_OTSU,
};
use opencv::prelude::*;

use crate::config::{LocatorConfig, SheetLayout};
use crate::errors::GradeError;
use crate::pipeline::{Deadline, Stage};
use crate::state::OptionLetter;

/// One printed bubble in canonical space.
#[derive(Debug, Clone, PartialEq)]
pub struct BubbleRegion {
    /// 1-based.
    pub question: usize,
    pub option: OptionLetter,
    pub center: (f32, f32),
    pub radius: f32,
    /// `false` when the bubble was not seen and its position was taken from
    /// the inferred grid.
    pub detected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    x: f32,
    y: f32,
    diameter: f32,
}

macro_rules! grid_err {
    ($($arg: tt)*) => {
        GradeError::GridDetection(format!($($arg)*))
    };
}

/// Finds every bubble of `layout` on a canonical sheet, ordered by question
/// then option.
pub fn locate_bubbles(
    canonical: &Mat,
    layout: &SheetLayout,
    config: &LocatorConfig,
    deadline: &Deadline,
) -> Result<Vec<BubbleRegion>, GradeError> {
    let candidates = find_candidates(canonical, config, deadline)?;
    if candidates.is_empty() {
        return Err(grid_err!("no bubble-shaped marks found on the sheet"));
    }
    let candidates = reject_size_outliers(candidates, config.size_tolerance);
    let median_diameter = median(candidates.iter().map(|c| c.diameter)).unwrap_or_default();
    deadline.check(Stage::Locating)?;

    // centres closer than half a bubble apart belong to the same row or column
    let gap = median_diameter * 0.5;
    let rows = drop_sparse(cluster_axis(candidates.iter().map(|c| c.y), gap));
    let columns = drop_sparse(cluster_axis(candidates.iter().map(|c| c.x), gap));
    if rows.len() != layout.rows_per_block() {
        return Err(grid_err!(
            "found {} rows of bubbles, expected {}",
            rows.len(),
            layout.rows_per_block()
        ));
    }
    if columns.len() != layout.columns() {
        return Err(grid_err!(
            "found {} columns of bubbles, expected {}",
            columns.len(),
            layout.columns()
        ));
    }

    let mut cells: HashMap<(usize, usize), Candidate> = HashMap::new();
    for candidate in candidates {
        deadline.check(Stage::Locating)?;
        let (row, dy) = nearest(&rows, candidate.y);
        let (column, dx) = nearest(&columns, candidate.x);
        if dy > gap || dx > gap {
            continue;
        }
        let offset = |c: &Candidate| (c.x - columns[column]).hypot(c.y - rows[row]);
        cells
            .entry((row, column))
            .and_modify(|held| {
                if offset(&candidate) < offset(held) {
                    *held = candidate;
                }
            })
            .or_insert(candidate);
    }

    let mut regions = Vec::with_capacity(layout.bubble_count());
    let mut imputed = 0usize;
    for (row, column) in (0..rows.len()).cartesian_product(0..columns.len()) {
        let Some((question, option_idx)) = layout.cell(row, column) else {
            continue;
        };
        let (center, diameter, detected) = match cells.get(&(row, column)) {
            Some(c) => ((c.x, c.y), c.diameter, true),
            None => {
                imputed += 1;
                ((columns[column], rows[row]), median_diameter, false)
            }
        };
        regions.push(BubbleRegion {
            question,
            option: layout.options[option_idx],
            center,
            radius: diameter / 2.0,
            detected,
        });
    }
    if imputed > config.max_imputed {
        return Err(grid_err!(
            "{imputed} bubbles missing from the grid, at most {} tolerated",
            config.max_imputed
        ));
    }

    regions.sort_by_key(|r| {
        let option_idx = layout.options.iter().position(|&o| o == r.option);
        (r.question, option_idx)
    });
    debug_assert_eq!(regions.len(), layout.bubble_count());
    Ok(regions)
}

fn find_candidates(
    canonical: &Mat,
    config: &LocatorConfig,
    deadline: &Deadline,
) -> Result<Vec<Candidate>, GradeError> {
    let blurred = {
        let mut mat_blur = Mat::default();
        imgproc::gaussian_blur_def(canonical, &mut mat_blur, Size::new(3, 3), 0.0)?;
        mat_blur
    };
    // ink is the foreground here
    let mut binary = Mat::default();
    _ = imgproc::threshold(
        &blurred,
        &mut binary,
        0.0,
        255.0,
        THRESH_BINARY_INV | THRESH_OTSU,
    )?;
    // a dark sliver along the page edge would otherwise enclose every bubble
    if config.border_margin > 0 {
        imgproc::rectangle(
            &mut binary,
            Rect::new(0, 0, binary.cols(), binary.rows()),
            Scalar::all(0.0),
            config.border_margin * 2,
            LINE_8,
            0,
        )?;
    }

    let mut contours: Vector<Vector<Point>> = vec![].into();
    imgproc::find_contours_def(&binary, &mut contours, RETR_EXTERNAL, CHAIN_APPROX_SIMPLE)?;

    let mut candidates = Vec::new();
    for contour in contours.iter() {
        deadline.check(Stage::Locating)?;
        let rect = imgproc::bounding_rect(&contour)?;
        let (w, h) = (rect.width as f32, rect.height as f32);
        let size_ok = |d: f32| d >= config.min_bubble_diameter && d <= config.max_bubble_diameter;
        if !size_ok(w) || !size_ok(h) || !(0.6..=1.6).contains(&(w / h)) {
            continue;
        }
        let area = imgproc::contour_area_def(&contour)?;
        let peri = imgproc::arc_length(&contour, true)?;
        if peri <= 0.0 || 4.0 * PI * area / (peri * peri) < config.min_circularity {
            continue;
        }
        candidates.push(Candidate {
            x: rect.x as f32 + w / 2.0,
            y: rect.y as f32 + h / 2.0,
            diameter: (w + h) / 2.0,
        });
    }
    Ok(candidates)
}

fn median(values: impl Iterator<Item = f32>) -> Option<f32> {
    let sorted = values.sorted_by(f32::total_cmp).collect_vec();
    sorted.get(sorted.len() / 2).copied()
}

/// Drops staples, specks and printed glyphs whose size is far from the
/// typical bubble.
fn reject_size_outliers(candidates: Vec<Candidate>, tolerance: f32) -> Vec<Candidate> {
    let Some(median) = median(candidates.iter().map(|c| c.diameter)) else {
        return candidates;
    };
    candidates
        .into_iter()
        .filter(|c| (c.diameter - median).abs() <= tolerance * median)
        .collect()
}

/// 1-D gap clustering. Returns the mean and population of each cluster,
/// ascending.
fn cluster_axis(values: impl Iterator<Item = f32>, gap: f32) -> Vec<(f32, usize)> {
    let mut clusters: Vec<Vec<f32>> = Vec::new();
    for v in values.sorted_by(f32::total_cmp) {
        let joins_last = clusters
            .last()
            .and_then(|c| c.last())
            .is_some_and(|&last| v - last <= gap);
        match clusters.last_mut() {
            Some(cluster) if joins_last => cluster.push(v),
            _ => clusters.push(vec![v]),
        }
    }
    clusters
        .into_iter()
        .map(|c| (c.iter().sum::<f32>() / c.len() as f32, c.len()))
        .collect()
}

/// Drops clusters holding fewer than half as many marks as the median
/// cluster: a circled number or a hole punch, not a printed row or column.
fn drop_sparse(clusters: Vec<(f32, usize)>) -> Vec<f32> {
    let median = clusters
        .iter()
        .map(|&(_, n)| n)
        .sorted()
        .nth(clusters.len() / 2)
        .unwrap_or_default();
    clusters
        .into_iter()
        .filter(|&(_, n)| n * 2 >= median)
        .map(|(center, _)| center)
        .collect()
}

fn nearest(centers: &[f32], v: f32) -> (usize, f32) {
    centers
        .iter()
        .enumerate()
        .map(|(i, c)| (i, (c - v).abs()))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((0, f32::INFINITY))
}

/// Mean spacing between neighbouring rows of bubbles, if there are at least
/// two rows.
pub fn row_pitch(regions: &[BubbleRegion]) -> Option<f32> {
    let ys = regions
        .iter()
        .map(|r| r.center.1)
        .sorted_by(f32::total_cmp)
        .dedup_by(|a, b| (a - b).abs() < 1.0)
        .collect_vec();
    let diffs = ys.iter().tuple_windows().map(|(a, b)| b - a).collect_vec();
    (!diffs.is_empty()).then(|| diffs.iter().sum::<f32>() / diffs.len() as f32)
}
