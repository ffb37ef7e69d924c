//! Mapping of per-speaker audio conditioning onto spatial latent tokens.

use ndarray::Array2;

use super::composite::CompositeFrame;

/// Decides how strongly each speaker's audio conditions each spatial token.
///
/// The result has shape `(grid_h * grid_w, 2)` in row-major token order;
/// column `k` is the weight for speaker `k + 1`.
pub trait AudioRoutingPolicy: Send + Sync {
    fn spatial_weights(&self, frame: &CompositeFrame, grid_h: usize, grid_w: usize) -> Array2<f32>;
}

/// Weights each speaker by the fraction of a token's canvas cell covered by
/// that speaker's box. Tokens outside both boxes get no audio.
#[derive(Debug, Default, Clone, Copy)]
pub struct BboxOverlapRouting;

impl AudioRoutingPolicy for BboxOverlapRouting {
    fn spatial_weights(&self, frame: &CompositeFrame, grid_h: usize, grid_w: usize) -> Array2<f32> {
        let mut weights = Array2::<f32>::zeros((grid_h * grid_w, 2));
        if grid_h == 0 || grid_w == 0 {
            return weights;
        }

        let boxes = [frame.bbox_speaker1, frame.bbox_speaker2];
        for r in 0..grid_h {
            for c in 0..grid_w {
                let cell = frame.grid_cell(r, c, grid_h, grid_w);
                let area = cell.area();
                if area == 0 {
                    continue;
                }
                for (k, bbox) in boxes.iter().enumerate() {
                    weights[[r * grid_w + c, k]] = bbox.intersection_area(&cell) as f32 / area as f32;
                }
            }
        }
        weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BBox;
    use image::RgbImage;

    fn frame(width: u32, height: u32, b1: BBox, b2: BBox) -> CompositeFrame {
        CompositeFrame {
            image: RgbImage::new(width, height),
            bbox_speaker1: b1,
            bbox_speaker2: b2,
        }
    }

    #[test]
    fn halves_route_to_their_speaker() {
        let f = frame(64, 32, BBox::new(0, 0, 32, 32), BBox::new(32, 0, 64, 32));
        let w = BboxOverlapRouting.spatial_weights(&f, 2, 4);
        assert_eq!(w.dim(), (8, 2));
        for r in 0..2 {
            assert_eq!(w[[r * 4, 0]], 1.0);
            assert_eq!(w[[r * 4, 1]], 0.0);
            assert_eq!(w[[r * 4 + 3, 0]], 0.0);
            assert_eq!(w[[r * 4 + 3, 1]], 1.0);
        }
    }

    #[test]
    fn partial_cover_and_letterbox() {
        // Speaker 1 covers the left half of cell 0 only; speaker 2 is absent from cell 1.
        let f = frame(32, 16, BBox::new(0, 0, 8, 16), BBox::new(24, 0, 32, 16));
        let w = BboxOverlapRouting.spatial_weights(&f, 1, 2);
        assert_eq!(w[[0, 0]], 0.5);
        assert_eq!(w[[0, 1]], 0.0);
        assert_eq!(w[[1, 0]], 0.0);
        assert_eq!(w[[1, 1]], 0.5);
    }
}
