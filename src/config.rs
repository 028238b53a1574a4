//! Grading parameters.
//!
//! Nothing here is derived from a particular scanner or print run; these are
//! defaults for a letter-sized sheet at roughly 100 dpi in canonical space.
//! The calling layer may override any field from a JSON file.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::errors::GradeError;
use crate::state::OptionLetter;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingConfig {
    pub canonical: CanonicalConfig,
    pub layout: SheetLayout,
    pub normalizer: NormalizerConfig,
    pub locator: LocatorConfig,
    pub classifier: ClassifierConfig,
}

/// Size of the rectified page, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalConfig {
    pub width: i32,
    pub height: i32,
}

impl Default for CanonicalConfig {
    fn default() -> Self {
        CanonicalConfig {
            width: 850,
            height: 1100,
        }
    }
}

/// How questions are printed. Questions run top to bottom inside a block,
/// blocks run left to right.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetLayout {
    pub questions: usize,
    pub options: Vec<OptionLetter>,
    pub blocks: usize,
}

impl Default for SheetLayout {
    fn default() -> Self {
        SheetLayout {
            questions: 10,
            options: "ABCD"
                .chars()
                .filter_map(|c| OptionLetter::new(c).ok())
                .collect(),
            blocks: 1,
        }
    }
}

impl SheetLayout {
    pub fn rows_per_block(&self) -> usize {
        self.questions.div_ceil(self.blocks.max(1))
    }

    pub fn columns(&self) -> usize {
        self.blocks * self.options.len()
    }

    pub fn bubble_count(&self) -> usize {
        self.questions * self.options.len()
    }

    /// Maps a grid cell to its 1-based question number and option index,
    /// or `None` for cells past the last question.
    pub fn cell(&self, row: usize, column: usize) -> Option<(usize, usize)> {
        let options = self.options.len();
        let block = column / options;
        let question = block * self.rows_per_block() + row + 1;
        (row < self.rows_per_block() && block < self.blocks && question <= self.questions)
            .then_some((question, column % options))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Minimum grey-level standard deviation of the whole frame.
    pub min_contrast: f64,
    /// Page quad area relative to the frame.
    pub min_page_area_ratio: f64,
    /// Shorter over longer of each pair of opposite sides.
    pub min_side_ratio: f64,
    pub max_skew_degrees: f64,
    /// Height of the header band, as a fraction of the page. A page whose
    /// bottom band carries clearly more ink than its top band is upside
    /// down. 0 disables the check.
    pub header_band_ratio: f64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        NormalizerConfig {
            min_contrast: 12.0,
            min_page_area_ratio: 0.2,
            min_side_ratio: 0.6,
            max_skew_degrees: 20.0,
            header_band_ratio: 0.08,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    pub min_bubble_diameter: f32,
    pub max_bubble_diameter: f32,
    /// 4πA/P², 1.0 for a perfect circle.
    pub min_circularity: f64,
    /// Allowed relative deviation from the median bubble diameter.
    pub size_tolerance: f32,
    /// Bubbles that may be missing and filled in from the inferred grid.
    pub max_imputed: usize,
    /// Pixels along the canonical border ignored during detection.
    pub border_margin: i32,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        LocatorConfig {
            min_bubble_diameter: 12.0,
            max_bubble_diameter: 80.0,
            min_circularity: 0.6,
            size_tolerance: 0.35,
            max_imputed: 2,
            border_margin: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub fill_threshold: f32,
    pub ambiguity_margin: f32,
    /// Fraction of the bubble radius sampled, keeps the printed ring out.
    pub inner_radius_ratio: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            fill_threshold: 0.45,
            ambiguity_margin: 0.15,
            inner_radius_ratio: 0.65,
        }
    }
}

fn unit_interval(name: &str, value: f64) -> Result<(), GradeError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(GradeError::Configuration(format!(
            "{name} must be between 0 and 1, got {value}"
        )))
    }
}

impl GradingConfig {
    pub fn validate(&self) -> Result<(), GradeError> {
        let invalid = |msg: String| Err(GradeError::Configuration(msg));

        if self.canonical.width <= 0 || self.canonical.height <= 0 {
            return invalid(format!(
                "canonical size must be positive, got {}x{}",
                self.canonical.width, self.canonical.height
            ));
        }
        let layout = &self.layout;
        if layout.questions == 0 || layout.options.is_empty() || layout.blocks == 0 {
            return invalid("layout needs at least one question, option and block".into());
        }
        if layout.blocks > layout.questions {
            return invalid(format!(
                "{} blocks cannot hold only {} questions",
                layout.blocks, layout.questions
            ));
        }
        if let Some(dup) = layout.options.iter().duplicates().next() {
            return invalid(format!("option `{dup}` appears twice in the layout"));
        }

        let loc = &self.locator;
        if loc.min_bubble_diameter <= 0.0 || loc.min_bubble_diameter >= loc.max_bubble_diameter {
            return invalid(format!(
                "bubble diameter range {}..{} is empty",
                loc.min_bubble_diameter, loc.max_bubble_diameter
            ));
        }
        unit_interval("locator.min_circularity", loc.min_circularity)?;
        unit_interval("locator.size_tolerance", loc.size_tolerance.into())?;
        if loc.border_margin < 0 {
            return invalid("locator.border_margin must not be negative".into());
        }

        let norm = &self.normalizer;
        unit_interval("normalizer.min_page_area_ratio", norm.min_page_area_ratio)?;
        unit_interval("normalizer.min_side_ratio", norm.min_side_ratio)?;
        if !(0.0..90.0).contains(&norm.max_skew_degrees) {
            return invalid("normalizer.max_skew_degrees must be within 0..90".into());
        }
        if !(0.0..0.5).contains(&norm.header_band_ratio) {
            return invalid("normalizer.header_band_ratio must be within 0..0.5".into());
        }

        let cls = &self.classifier;
        unit_interval("classifier.fill_threshold", cls.fill_threshold.into())?;
        unit_interval("classifier.ambiguity_margin", cls.ambiguity_margin.into())?;
        unit_interval("classifier.inner_radius_ratio", cls.inner_radius_ratio.into())?;
        Ok(())
    }
}
