use opencv::core::{self, Mat, Point, Point2f, Rect, Scalar, Size, Vector};
use opencv::imgproc::{
    self, CHAIN_APPROX_SIMPLE, INTER_LINEAR, RETR_EXTERNAL, THRESH_BINARY, THRESH_BINARY_INV,
    THRESH_OTSU,
};
use opencv::prelude::*;

use crate::config::{CanonicalConfig, NormalizerConfig};
use crate::errors::GradeError;
use crate::image::SheetImage;
use crate::pipeline::{Deadline, Stage};

/// Polygon approximation tolerances, as a fraction of the contour perimeter.
const APPROX_EPSILONS: [f64; 3] = [0.02, 0.03, 0.04];

/// The page rectified into canonical space.
#[derive(Debug)]
pub struct NormalizedSheet {
    pub image: Mat,
    /// Page corners in the source frame: top-left, top-right, bottom-right,
    /// bottom-left.
    pub corners: [Point2f; 4],
    pub page_area_ratio: f64,
    pub skew_degrees: f64,
}

macro_rules! alignment_err {
    ($($arg: tt)*) => {
        GradeError::Alignment(format!($($arg)*))
    };
}

pub fn normalize_sheet(
    sheet: &SheetImage,
    canonical: &CanonicalConfig,
    config: &NormalizerConfig,
    deadline: &Deadline,
) -> Result<NormalizedSheet, GradeError> {
    let gray = sheet.gray();

    let blurred = {
        let mut mat_blur = Mat::default();
        imgproc::gaussian_blur_def(gray, &mut mat_blur, (5, 5).into(), 0.0)?;
        mat_blur
    };

    let contrast = {
        let mut mean: Vector<f64> = vec![].into();
        let mut stddev: Vector<f64> = vec![].into();
        core::mean_std_dev_def(&blurred, &mut mean, &mut stddev)?;
        stddev.get(0)?
    };
    if contrast < config.min_contrast {
        return Err(alignment_err!(
            "contrast too low to find the page edge ({contrast:.1} < {:.1})",
            config.min_contrast
        ));
    }

    // paper is the bright foreground
    let thresholded = {
        let mut mat_thresh = Mat::default();
        _ = imgproc::threshold(
            &blurred,
            &mut mat_thresh,
            0.0,
            255.0,
            THRESH_BINARY | THRESH_OTSU,
        )?;
        mat_thresh
    };

    let contours: Vector<Vector<Point>> = {
        let mut contours: Vector<Vector<Point>> = vec![].into();
        imgproc::find_contours_def(
            &thresholded,
            &mut contours,
            RETR_EXTERNAL,
            CHAIN_APPROX_SIMPLE,
        )?;
        contours
    };
    deadline.check(Stage::Normalizing)?;

    let mut largest: Option<(f64, Vector<Point>)> = None;
    for contour in contours.iter() {
        deadline.check(Stage::Normalizing)?;
        let area = imgproc::contour_area_def(&contour)?;
        if largest.as_ref().map_or(true, |(best, _)| area > *best) {
            largest = Some((area, contour));
        }
    }
    let Some((area, contour)) = largest else {
        return Err(alignment_err!("no page boundary in image"));
    };

    let frame_area = f64::from(sheet.width) * f64::from(sheet.height);
    let page_area_ratio = area / frame_area;
    if page_area_ratio < config.min_page_area_ratio {
        return Err(alignment_err!(
            "largest outline covers only {:.0}% of the image",
            page_area_ratio * 100.0
        ));
    }

    let quad = fit_quadrilateral(&contour, deadline)?.ok_or_else(|| {
        alignment_err!("page outline is not a quadrilateral (occluded or torn sheet?)")
    })?;
    let corners = order_corners(&quad);
    let skew_degrees = check_geometry(&corners, canonical, config)?;

    let src: Vector<Point2f> = corners.to_vec().into();
    let dst: Vector<Point2f> = vec![
        Point2f::new(0.0, 0.0),
        Point2f::new(canonical.width as f32, 0.0),
        Point2f::new(canonical.width as f32, canonical.height as f32),
        Point2f::new(0.0, canonical.height as f32),
    ]
    .into();
    let transform = imgproc::get_perspective_transform(&src, &dst, core::DECOMP_LU)?;

    let mut image = Mat::default();
    imgproc::warp_perspective(
        gray,
        &mut image,
        &transform,
        Size::new(canonical.width, canonical.height),
        INTER_LINEAR,
        core::BORDER_REPLICATE,
        Scalar::default(),
    )?;
    deadline.check(Stage::Normalizing)?;
    check_upright(&image, config.header_band_ratio)?;

    Ok(NormalizedSheet {
        image,
        corners,
        page_area_ratio,
        skew_degrees,
    })
}

fn fit_quadrilateral(
    contour: &Vector<Point>,
    deadline: &Deadline,
) -> Result<Option<[Point2f; 4]>, GradeError> {
    let peri = imgproc::arc_length(contour, true)?;
    for epsilon in APPROX_EPSILONS {
        deadline.check(Stage::Normalizing)?;
        let approx = {
            let mut approx: Vector<Point> = vec![].into();
            imgproc::approx_poly_dp(contour, &mut approx, epsilon * peri, true)?;
            approx
        };
        if approx.len() == 4 && imgproc::is_contour_convex(&approx)? {
            let mut quad = [Point2f::default(); 4];
            for (slot, p) in quad.iter_mut().zip(approx.iter()) {
                *slot = Point2f::new(p.x as f32, p.y as f32);
            }
            return Ok(Some(quad));
        }
    }
    Ok(None)
}

/// Sorts into top-left, top-right, bottom-right, bottom-left.
fn order_corners(quad: &[Point2f; 4]) -> [Point2f; 4] {
    let sum = |p: &Point2f| p.x + p.y;
    let diff = |p: &Point2f| p.x - p.y;
    let min_by = |key: &dyn Fn(&Point2f) -> f32| {
        quad.iter()
            .copied()
            .min_by(|a, b| key(a).total_cmp(&key(b)))
            .unwrap_or_default()
    };
    let max_by = |key: &dyn Fn(&Point2f) -> f32| {
        quad.iter()
            .copied()
            .max_by(|a, b| key(a).total_cmp(&key(b)))
            .unwrap_or_default()
    };
    [min_by(&sum), max_by(&diff), max_by(&sum), min_by(&diff)]
}

fn distance(a: Point2f, b: Point2f) -> f64 {
    f64::from(a.x - b.x).hypot(f64::from(a.y - b.y))
}

/// Rejects quads that cannot be a flat, upright sheet. Returns the skew of
/// the top edge in degrees.
fn check_geometry(
    corners: &[Point2f; 4],
    canonical: &CanonicalConfig,
    config: &NormalizerConfig,
) -> Result<f64, GradeError> {
    let [tl, tr, br, bl] = *corners;
    let (top, bottom) = (distance(tl, tr), distance(bl, br));
    let (left, right) = (distance(tl, bl), distance(tr, br));

    let side_ratio = |a: f64, b: f64| a.min(b) / a.max(b).max(f64::EPSILON);
    if side_ratio(top, bottom) < config.min_side_ratio
        || side_ratio(left, right) < config.min_side_ratio
    {
        return Err(alignment_err!(
            "page outline is too distorted to be a flat sheet"
        ));
    }

    let page_portrait = left + right > top + bottom;
    let canonical_portrait = canonical.height > canonical.width;
    if page_portrait != canonical_portrait {
        return Err(alignment_err!(
            "sheet appears rotated by 90 degrees relative to the expected layout"
        ));
    }

    let skew_degrees = f64::from(tr.y - tl.y).atan2(f64::from(tr.x - tl.x)).to_degrees();
    if skew_degrees.abs() > config.max_skew_degrees {
        return Err(alignment_err!(
            "sheet is rotated {skew_degrees:.1} degrees, at most {:.1} is supported",
            config.max_skew_degrees
        ));
    }
    Ok(skew_degrees)
}

/// Compares the ink in the header band with the ink in the same band at the
/// bottom of the rectified page. A thin margin is skipped on every side.
fn check_upright(image: &Mat, header_band_ratio: f64) -> Result<(), GradeError> {
    if header_band_ratio <= 0.0 {
        return Ok(());
    }
    let mut ink = Mat::default();
    _ = imgproc::threshold(
        image,
        &mut ink,
        0.0,
        255.0,
        THRESH_BINARY_INV | THRESH_OTSU,
    )?;

    let (w, h) = (ink.cols(), ink.rows());
    let (margin_x, margin_y) = (w / 20, h / 50);
    let band = ((f64::from(h) * header_band_ratio) as i32)
        .min(h / 2 - margin_y)
        .max(1);
    let ink_in = |y: i32| -> Result<i32, GradeError> {
        let roi = Mat::roi(&ink, Rect::new(margin_x, y, w - 2 * margin_x, band))?.try_clone()?;
        Ok(core::count_non_zero(&roi)?)
    };
    let top = ink_in(margin_y)?;
    let bottom = ink_in(h - margin_y - band)?;

    // one part in a thousand of the band, so blank bands never decide
    let floor = (w - 2 * margin_x) * band / 1000;
    if bottom > 2 * top.max(floor) {
        return Err(alignment_err!(
            "sheet is upside down: the header is at the bottom of the page"
        ));
    }
    Ok(())
}
