//! Synthetic answer sheets for tests.

use opencv::core::{self, Mat, Point, Point2f, Rect, Scalar, Size, Vector};
use opencv::imgproc::{self, FILLED, INTER_LINEAR, LINE_8};

use crate::config::{CanonicalConfig, SheetLayout};
use crate::image::encode_png;

pub const BUBBLE_RADIUS: i32 = 14;
pub const ROW_PITCH: i32 = 80;
pub const COLUMN_PITCH: i32 = 60;
const BLOCK_GAP: i32 = 120;
const ORIGIN: (i32, i32) = (150, 150);

const FRAME: (i32, i32) = (1050, 1300);
const BACKGROUND: f64 = 40.0;

#[derive(Debug, Clone, Copy)]
enum Mark {
    Fill,
    Shade(f64),
    Dot,
    Erase,
}

#[derive(Debug, Clone, Default)]
pub struct Marks(Vec<(usize, char, Mark)>);

impl Marks {
    pub fn new() -> Marks {
        Marks::default()
    }

    pub fn fill(mut self, question: usize, option: char) -> Marks {
        self.0.push((question, option, Mark::Fill));
        self
    }

    /// A filled disc of the given grey inside the printed ring.
    pub fn shade(mut self, question: usize, option: char, gray: f64) -> Marks {
        self.0.push((question, option, Mark::Shade(gray)));
        self
    }

    pub fn dot(mut self, question: usize, option: char) -> Marks {
        self.0.push((question, option, Mark::Dot));
        self
    }

    /// Leaves the bubble unprinted.
    pub fn erase(mut self, question: usize, option: char) -> Marks {
        self.0.push((question, option, Mark::Erase));
        self
    }

    fn get(&self, question: usize, option: char) -> impl Iterator<Item = Mark> + '_ {
        self.0
            .iter()
            .filter(move |(q, o, _)| *q == question && *o == option)
            .map(|(_, _, m)| *m)
    }
}

pub enum PageQuad {
    Skewed,
    LowContrast,
    Sideways,
    Tiny,
    /// Skewed, but turned through 180 degrees.
    UpsideDown,
    /// Turned 30 degrees about the frame centre.
    Tilted,
    /// Top edge far shorter than the bottom one.
    Keystone,
}

pub fn bubble_center(layout: &SheetLayout, question: usize, option_idx: usize) -> Point {
    let rows = layout.rows_per_block();
    let (block, row) = ((question - 1) / rows, (question - 1) % rows);
    let column = (block * layout.options.len() + option_idx) as i32;
    Point::new(
        ORIGIN.0 + column * COLUMN_PITCH + block as i32 * BLOCK_GAP,
        ORIGIN.1 + row as i32 * ROW_PITCH,
    )
}

fn draw_sheet(layout: &SheetLayout, marks: &Marks, paper: f64, ink: f64) -> opencv::Result<Mat> {
    let canonical = CanonicalConfig::default();
    let mut page = Mat::new_rows_cols_with_default(
        canonical.height,
        canonical.width,
        core::CV_8UC1,
        Scalar::all(paper),
    )?;
    let ink = Scalar::all(ink);

    // header rule and a speck of dust, neither is a bubble
    imgproc::rectangle(&mut page, Rect::new(100, 60, 650, 3), ink, FILLED, LINE_8, 0)?;
    imgproc::rectangle(&mut page, Rect::new(600, 1000, 3, 3), ink, FILLED, LINE_8, 0)?;

    for question in 1..=layout.questions {
        for (idx, option) in layout.options.iter().enumerate() {
            let center = bubble_center(layout, question, idx);
            let option_marks: Vec<Mark> = marks.get(question, option.as_char()).collect();
            if option_marks.iter().any(|m| matches!(m, Mark::Erase)) {
                continue;
            }
            imgproc::circle(&mut page, center, BUBBLE_RADIUS, ink, 2, LINE_8, 0)?;
            for mark in option_marks {
                let (radius, color) = match mark {
                    Mark::Fill => (BUBBLE_RADIUS + 1, ink),
                    Mark::Shade(gray) => (BUBBLE_RADIUS - 3, Scalar::all(gray)),
                    Mark::Dot => (4, ink),
                    Mark::Erase => continue,
                };
                imgproc::circle(&mut page, center, radius, color, FILLED, LINE_8, 0)?;
            }
        }
    }
    Ok(page)
}

/// A sheet already in canonical space, black ink on white paper.
pub fn canonical_sheet(layout: &SheetLayout, marks: &Marks) -> opencv::Result<Mat> {
    draw_sheet(layout, marks, 255.0, 0.0)
}

pub fn blank_frame(gray: f64) -> opencv::Result<Mat> {
    Mat::new_rows_cols_with_default(FRAME.1, FRAME.0, core::CV_8UC1, Scalar::all(gray))
}

/// A "photo": the sheet warped onto a darker background.
pub fn render_sheet(layout: &SheetLayout, marks: &Marks, quad: PageQuad) -> opencv::Result<Mat> {
    let (page, background) = match quad {
        PageQuad::LowContrast => (draw_sheet(layout, marks, 140.0, 128.0)?, 128.0),
        _ => (canonical_sheet(layout, marks)?, BACKGROUND),
    };
    let p = |x: i32, y: i32| Point2f::new(x as f32, y as f32);
    let (frame, corners) = match quad {
        PageQuad::Skewed | PageQuad::LowContrast => (
            FRAME,
            [p(100, 90), p(945, 110), p(960, 1210), p(90, 1190)],
        ),
        PageQuad::UpsideDown => (
            FRAME,
            [p(960, 1210), p(90, 1190), p(100, 90), p(945, 110)],
        ),
        PageQuad::Tilted => (
            FRAME,
            [p(469, 237), p(911, 492), p(581, 1063), p(139, 808)],
        ),
        PageQuad::Keystone => (
            FRAME,
            [p(400, 100), p(650, 100), p(960, 1200), p(90, 1200)],
        ),
        PageQuad::Tiny => (
            FRAME,
            [p(400, 500), p(600, 505), p(602, 760), p(398, 758)],
        ),
        PageQuad::Sideways => (
            (FRAME.1, FRAME.0),
            [p(1200, 100), p(1200, 945), p(100, 945), p(100, 100)],
        ),
    };

    let canonical = CanonicalConfig::default();
    let (w, h) = (canonical.width, canonical.height);
    let src: Vector<Point2f> = vec![p(0, 0), p(w, 0), p(w, h), p(0, h)].into();
    let dst: Vector<Point2f> = corners.to_vec().into();
    let transform = imgproc::get_perspective_transform(&src, &dst, core::DECOMP_LU)?;

    let mut photo = Mat::default();
    imgproc::warp_perspective(
        &page,
        &mut photo,
        &transform,
        Size::new(frame.0, frame.1),
        INTER_LINEAR,
        core::BORDER_CONSTANT,
        Scalar::all(background),
    )?;
    Ok(photo)
}

pub fn encode(mat: &Mat) -> Vec<u8> {
    encode_png(mat).expect("test image should encode")
}
