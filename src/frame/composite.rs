//! Side-by-side composite of the two portraits.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TalkError};

/// Axis-aligned box in canvas pixels, half-open: `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl BBox {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Overlap area with another box.
    pub fn intersection_area(&self, other: &BBox) -> u64 {
        let w = self.x1.min(other.x1).saturating_sub(self.x0.max(other.x0));
        let h = self.y1.min(other.y1).saturating_sub(self.y0.max(other.y0));
        w as u64 * h as u64
    }

    pub fn is_disjoint(&self, other: &BBox) -> bool {
        self.intersection_area(other) == 0
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x0 <= self.x1 && self.y0 <= self.y1 && self.x1 <= width && self.y1 <= height
    }
}

/// Conditioning image plus the canvas region of each speaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeFrame {
    pub image: RgbImage,
    pub bbox_speaker1: BBox,
    pub bbox_speaker2: BBox,
}

impl CompositeFrame {
    /// Region of a speaker, if the id is 1 or 2.
    pub fn bbox(&self, speaker_id: u8) -> Option<BBox> {
        match speaker_id {
            1 => Some(self.bbox_speaker1),
            2 => Some(self.bbox_speaker2),
            _ => None,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Canvas region of grid cell `(row, col)` when the canvas is split into
    /// `grid_h x grid_w` proportional cells.
    pub fn grid_cell(&self, row: usize, col: usize, grid_h: usize, grid_w: usize) -> BBox {
        let (w, h) = (self.width() as u64, self.height() as u64);
        let (gh, gw) = (grid_h.max(1) as u64, grid_w.max(1) as u64);
        let (r, c) = (row as u64, col as u64);
        BBox::new(
            (c * w / gw) as u32,
            (r * h / gh) as u32,
            ((c + 1) * w / gw) as u32,
            ((r + 1) * h / gh) as u32,
        )
    }

    /// Mean colour of every grid cell scaled to `[-1, 1]`, `(grid_h * grid_w, 3)`.
    pub fn cell_colors(&self, grid_h: usize, grid_w: usize) -> Array2<f32> {
        let mut out = Array2::<f32>::zeros((grid_h * grid_w, 3));
        for r in 0..grid_h {
            for c in 0..grid_w {
                let cell = self.grid_cell(r, c, grid_h, grid_w);
                let area = cell.area();
                if area == 0 {
                    continue;
                }
                let mut sum = [0u64; 3];
                for y in cell.y0..cell.y1 {
                    for x in cell.x0..cell.x1 {
                        let px = self.image.get_pixel(x, y);
                        for (s, v) in sum.iter_mut().zip(px.0) {
                            *s += v as u64;
                        }
                    }
                }
                for (ch, s) in sum.iter().enumerate() {
                    out[[r * grid_w + c, ch]] = (*s as f32 / area as f32) / 127.5 - 1.0;
                }
            }
        }
        out
    }
}

/// Builds a [`CompositeFrame`] for a fixed canvas size.
///
/// Speaker 1 goes in the left half, speaker 2 in the right half. Each portrait
/// is scaled to fit its half with aspect ratio preserved and centred on a
/// black background.
#[derive(Debug, Clone, Copy)]
pub struct CompositeFramePreparer {
    width: u32,
    height: u32,
}

impl CompositeFramePreparer {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Decodes both portraits and lays them out on the canvas.
    pub fn prepare(&self, portrait1: &[u8], portrait2: &[u8]) -> Result<CompositeFrame> {
        if self.width < 2 || self.height == 0 {
            return Err(TalkError::invalid_image(format!(
                "canvas {}x{} cannot hold two portraits",
                self.width, self.height
            )));
        }

        let left = decode(portrait1, 1)?;
        let right = decode(portrait2, 2)?;

        let half = self.width / 2;
        let mut canvas = RgbImage::from_pixel(self.width, self.height, Rgb([0, 0, 0]));
        let bbox_speaker1 = place(&mut canvas, &left, 0, half, self.height);
        let bbox_speaker2 = place(&mut canvas, &right, half, self.width - half, self.height);

        debug!(
            "Composite {}x{}: speaker1 {:?}, speaker2 {:?}",
            self.width, self.height, bbox_speaker1, bbox_speaker2
        );

        Ok(CompositeFrame {
            image: canvas,
            bbox_speaker1,
            bbox_speaker2,
        })
    }
}

fn decode(bytes: &[u8], speaker: u8) -> Result<RgbImage> {
    let img = image::load_from_memory(bytes).map_err(|e| {
        TalkError::with_source(
            crate::error::ErrorCode::InvalidImage,
            format!("Invalid image: portrait {} could not be decoded", speaker),
            e,
        )
    })?;
    if img.width() == 0 || img.height() == 0 {
        return Err(TalkError::invalid_image(format!(
            "portrait {} has zero area",
            speaker
        )));
    }
    Ok(img.to_rgb8())
}

/// Scales `src` into the slot `[slot_x, slot_x + slot_w) x [0, slot_h)` and
/// returns the box it occupies.
fn place(canvas: &mut RgbImage, src: &RgbImage, slot_x: u32, slot_w: u32, slot_h: u32) -> BBox {
    let scale = (slot_w as f64 / src.width() as f64).min(slot_h as f64 / src.height() as f64);
    let w = ((src.width() as f64 * scale).round() as u32).clamp(1, slot_w);
    let h = ((src.height() as f64 * scale).round() as u32).clamp(1, slot_h);

    let resized = imageops::resize(src, w, h, FilterType::Triangle);
    let x = slot_x + (slot_w - w) / 2;
    let y = (slot_h - h) / 2;
    imageops::replace(canvas, &resized, x as i64, y as i64);

    BBox::new(x, y, x + w, y + h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use image::ImageFormat;
    use std::io::Cursor;

    #[test]
    fn cell_colors_average_each_cell() {
        let mut image = RgbImage::from_pixel(4, 2, Rgb([0, 0, 0]));
        for y in 0..2 {
            for x in 2..4 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let frame = CompositeFrame {
            image,
            bbox_speaker1: BBox::new(0, 0, 2, 2),
            bbox_speaker2: BBox::new(2, 0, 4, 2),
        };
        assert_eq!(frame.grid_cell(0, 1, 1, 2), BBox::new(2, 0, 4, 2));
        let colors = frame.cell_colors(1, 2);
        assert_eq!(colors.dim(), (2, 3));
        assert_eq!(colors[[0, 0]], -1.0);
        assert_eq!(colors[[1, 2]], 1.0);
    }

    fn png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn boxes_disjoint_and_inside() {
        let preparer = CompositeFramePreparer::new(128, 64);
        let frame = preparer
            .prepare(&png(40, 80, [255, 0, 0]), &png(100, 50, [0, 0, 255]))
            .unwrap();

        assert_eq!(frame.image.dimensions(), (128, 64));
        assert!(frame.bbox_speaker1.fits_within(128, 64));
        assert!(frame.bbox_speaker2.fits_within(128, 64));
        assert!(frame.bbox_speaker1.is_disjoint(&frame.bbox_speaker2));
        assert!(frame.bbox_speaker1.x1 <= 64);
        assert!(frame.bbox_speaker2.x0 >= 64);
    }

    #[test]
    fn aspect_preserved_with_letterbox() {
        let preparer = CompositeFramePreparer::new(128, 64);
        // Tall portrait: limited by height, 32x64 in a 64x64 slot.
        let frame = preparer
            .prepare(&png(40, 80, [255, 0, 0]), &png(64, 64, [0, 255, 0]))
            .unwrap();
        assert_eq!(frame.bbox_speaker1, BBox::new(16, 0, 48, 64));
        assert_eq!(frame.bbox_speaker2, BBox::new(64, 0, 128, 64));

        // Letterbox stays black, portrait pixels keep their colour.
        assert_eq!(frame.image.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(frame.image.get_pixel(30, 30), &Rgb([255, 0, 0]));
        assert_eq!(frame.image.get_pixel(100, 30), &Rgb([0, 255, 0]));
    }

    #[test]
    fn undecodable_portrait_rejected() {
        let preparer = CompositeFramePreparer::new(128, 64);
        let err = preparer
            .prepare(b"not an image", &png(8, 8, [0, 0, 0]))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidImage);
        assert!(err.message.contains("portrait 1"));

        let err = preparer.prepare(&png(8, 8, [0, 0, 0]), &[]).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidImage);
    }

    #[test]
    fn bbox_lookup() {
        let preparer = CompositeFramePreparer::new(64, 32);
        let frame = preparer
            .prepare(&png(8, 8, [1, 2, 3]), &png(8, 8, [4, 5, 6]))
            .unwrap();
        assert_eq!(frame.bbox(1), Some(frame.bbox_speaker1));
        assert_eq!(frame.bbox(2), Some(frame.bbox_speaker2));
        assert_eq!(frame.bbox(3), None);
    }

    #[test]
    fn intersection_area() {
        let a = BBox::new(0, 0, 10, 10);
        let b = BBox::new(5, 5, 20, 20);
        assert_eq!(a.intersection_area(&b), 25);
        assert!(!a.is_disjoint(&b));
        assert!(a.is_disjoint(&BBox::new(10, 0, 20, 10)));
    }
}
