use base64::Engine;
use opencv::core::{self, Mat, Point, Scalar, Vector};
use opencv::imgcodecs::{imdecode, imencode, ImreadModes};
use opencv::imgproc::{self, FILLED, LINE_8};
use opencv::prelude::*;

use crate::classify::MarkDecision;
use crate::errors::GradeError;
use crate::grid::BubbleRegion;

/// A decoded photo of an answer sheet, reduced to 8-bit greyscale for
/// processing. The original width, height and colour depth are kept for
/// reporting.
#[derive(Debug)]
pub struct SheetImage {
    gray: Mat,
    pub width: i32,
    pub height: i32,
    pub channels: i32,
    pub bits_per_channel: u8,
}

impl SheetImage {
    /// Decodes any format OpenCV reads, keeping the sample depth. The EXIF
    /// orientation tag is applied, so phone photos come out upright.
    pub fn decode(bytes: &[u8]) -> Result<SheetImage, GradeError> {
        if bytes.is_empty() {
            return Err(GradeError::Decode("no image data".into()));
        }
        let buf: Vector<u8> = Vector::from_slice(bytes);
        let flags = ImreadModes::IMREAD_ANYDEPTH as i32 | ImreadModes::IMREAD_ANYCOLOR as i32;
        let mat = imdecode(&buf, flags).map_err(|e| GradeError::Decode(e.message))?;
        if mat.empty() {
            return Err(GradeError::Decode("unrecognised image format".into()));
        }

        let channels = mat.channels();
        let bits_per_channel = match mat.depth() {
            core::CV_8U | core::CV_8S => 8,
            core::CV_16U | core::CV_16S | core::CV_16F => 16,
            core::CV_32S | core::CV_32F => 32,
            _ => 64,
        };

        let gray = {
            let mut gray = Mat::default();
            match channels {
                1 => gray = mat.try_clone()?,
                3 => imgproc::cvt_color_def(&mat, &mut gray, imgproc::COLOR_BGR2GRAY)?,
                4 => imgproc::cvt_color_def(&mat, &mut gray, imgproc::COLOR_BGRA2GRAY)?,
                n => {
                    return Err(GradeError::Decode(format!(
                        "unsupported channel count {n}"
                    )))
                }
            }
            gray
        };
        let gray = to_8bit(gray)?;

        Ok(SheetImage {
            width: gray.cols(),
            height: gray.rows(),
            gray,
            channels,
            bits_per_channel,
        })
    }

    pub fn gray(&self) -> &Mat {
        &self.gray
    }
}

/// 8-bit samples pass through and 16-bit unsigned ones are scaled from their
/// full range. Any other depth has no fixed range, so its own minimum and
/// maximum are stretched to 0..=255.
fn to_8bit(gray: Mat) -> Result<Mat, GradeError> {
    let mut scaled = Mat::default();
    match gray.depth() {
        core::CV_8U => return Ok(gray),
        core::CV_16U => gray.convert_to(&mut scaled, core::CV_8U, 255.0 / 65535.0, 0.0)?,
        _ => core::normalize(
            &gray,
            &mut scaled,
            0.0,
            255.0,
            core::NORM_MINMAX,
            core::CV_8U,
            &Mat::default(),
        )?,
    }
    Ok(scaled)
}

/// Draws detected bubbles on top of the canonical sheet: green for filled,
/// red for empty, a thin grey ring for positions filled in from the grid.
pub fn render_overlay(
    canonical: &Mat,
    regions: &[BubbleRegion],
    decisions: &[MarkDecision],
) -> Result<Mat, GradeError> {
    let mut overlay = Mat::default();
    imgproc::cvt_color_def(canonical, &mut overlay, imgproc::COLOR_GRAY2BGR)?;

    for (region, decision) in regions.iter().zip(decisions) {
        let color = if decision.filled {
            Scalar::new(0.0, 200.0, 0.0, 0.0)
        } else {
            Scalar::new(0.0, 0.0, 220.0, 0.0)
        };
        let center = Point::new(region.center.0.round() as i32, region.center.1.round() as i32);
        let radius = region.radius.round() as i32;
        imgproc::circle(&mut overlay, center, radius + 2, color, 2, LINE_8, 0)?;
        if !region.detected {
            imgproc::circle(
                &mut overlay,
                center,
                2,
                Scalar::new(128.0, 128.0, 128.0, 0.0),
                FILLED,
                LINE_8,
                0,
            )?;
        }
    }
    Ok(overlay)
}

pub fn encode_png(mat: &Mat) -> Result<Vec<u8>, opencv::Error> {
    let mut buf: Vector<u8> = Vec::new().into();
    imencode(".png", mat, &mut buf, &Vec::new().into())?;
    Ok(buf.into())
}

pub fn mat_to_base64_png(mat: &Mat) -> Result<String, opencv::Error> {
    let buf = encode_png(mat)?;
    let base64 = base64::prelude::BASE64_STANDARD.encode(&buf);
    Ok(format!("data:image/png;base64,{base64}"))
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use base64::prelude::*;
    use opencv::core;

    #[test]
    fn test_basic_functionality() {
        // Create a 2x2 black image (3 channels, 8-bit)
        let mat =
            Mat::new_rows_cols_with_default(2, 2, core::CV_8UC3, core::Scalar::all(0.0)).unwrap();

        let result = mat_to_base64_png(&mat);
        assert!(result.is_ok());

        let data_url = result.unwrap();
        assert!(data_url.starts_with("data:image/png;base64,"));

        // Check PNG signature after decoding base64
        let b64_data = data_url.strip_prefix("data:image/png;base64,").unwrap();
        let decoded_bytes = BASE64_STANDARD.decode(b64_data).unwrap();
        let png_signature = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(&decoded_bytes[0..8], &png_signature);
    }

    #[test]
    fn test_empty_mat_should_fail() {
        let mat = Mat::default();
        assert!(mat_to_base64_png(&mat).is_err());
    }

    #[test]
    fn test_decode_color_image_to_gray() {
        let mat = Mat::new_rows_cols_with_default(30, 40, core::CV_8UC3, Scalar::all(90.0))
            .unwrap();
        let png = encode_png(&mat).unwrap();

        let sheet = SheetImage::decode(&png).unwrap();
        assert_eq!((sheet.width, sheet.height), (40, 30));
        assert_eq!(sheet.channels, 3);
        assert_eq!(sheet.bits_per_channel, 8);
        assert_eq!(sheet.gray().channels(), 1);
        assert_eq!(*sheet.gray().at_2d::<u8>(10, 10).unwrap(), 90);
    }

    #[test]
    fn test_decode_16_bit_image() {
        let mat = Mat::new_rows_cols_with_default(8, 8, core::CV_16UC1, Scalar::all(65535.0))
            .unwrap();
        let png = encode_png(&mat).unwrap();

        let sheet = SheetImage::decode(&png).unwrap();
        assert_eq!(sheet.bits_per_channel, 16);
        assert_eq!(sheet.gray().depth(), core::CV_8U);
        assert_eq!(*sheet.gray().at_2d::<u8>(0, 0).unwrap(), 255);
    }

    #[test]
    fn test_float_and_signed_samples_are_stretched() {
        for depth in [core::CV_32FC1, core::CV_16SC1, core::CV_8SC1] {
            let mut mat =
                Mat::new_rows_cols_with_default(4, 4, depth, Scalar::all(-3.0)).unwrap();
            imgproc::rectangle(
                &mut mat,
                core::Rect::new(0, 0, 2, 4),
                Scalar::all(5.0),
                FILLED,
                LINE_8,
                0,
            )
            .unwrap();

            let gray = to_8bit(mat).unwrap();
            assert_eq!(gray.depth(), core::CV_8U);
            assert_eq!(*gray.at_2d::<u8>(0, 0).unwrap(), 255);
            assert_eq!(*gray.at_2d::<u8>(0, 3).unwrap(), 0);
        }
    }

    /// Wraps `jpeg` with an APP1 segment whose only EXIF tag is orientation.
    fn with_exif_orientation(jpeg: &[u8], orientation: u8) -> Vec<u8> {
        let mut app1 = vec![0xFF, 0xE1, 0x00, 0x22];
        app1.extend_from_slice(b"Exif\0\0");
        app1.extend_from_slice(&[b'M', b'M', 0x00, 0x2A, 0x00, 0x00, 0x00, 0x08]);
        app1.extend_from_slice(&[0x00, 0x01]);
        app1.extend_from_slice(&[0x01, 0x12, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01]);
        app1.extend_from_slice(&[0x00, orientation, 0x00, 0x00]);
        app1.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

        let mut out = jpeg[..2].to_vec();
        out.extend(app1);
        out.extend_from_slice(&jpeg[2..]);
        out
    }

    #[test]
    fn test_decode_applies_exif_orientation() {
        let mat = Mat::new_rows_cols_with_default(30, 40, core::CV_8UC3, Scalar::all(200.0))
            .unwrap();
        let mut jpeg: Vector<u8> = Vec::new().into();
        imencode(".jpg", &mat, &mut jpeg, &Vec::new().into()).unwrap();
        let jpeg: Vec<u8> = jpeg.into();

        // stored landscape, tagged "rotate 90 clockwise to display"
        let sheet = SheetImage::decode(&with_exif_orientation(&jpeg, 6)).unwrap();
        assert_eq!((sheet.width, sheet.height), (30, 40));
        assert_eq!(sheet.channels, 3);

        let untagged = SheetImage::decode(&jpeg).unwrap();
        assert_eq!((untagged.width, untagged.height), (40, 30));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            SheetImage::decode(b"definitely not a png"),
            Err(GradeError::Decode(_))
        ));
        assert!(matches!(SheetImage::decode(&[]), Err(GradeError::Decode(_))));
    }
}
