//! Axis-aligned box types and IoU computation.

use crate::common::*;

pub use corner_box::*;
pub use iou::*;

mod corner_box {
    use super::*;

    /// A validated box in corner format `(x1, y1, x2, y2)`, with
    /// coordinates relative to the image size.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct CornerBox {
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
    }

    impl CornerBox {
        pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Result<Self> {
            ensure!(
                x2 > x1 && y2 > y1,
                "invalid box: expect x2 > x1 and y2 > y1, but get ({}, {}, {}, {})",
                x1,
                y1,
                x2,
                y2
            );
            ensure!(
                [x1, y1, x2, y2].iter().all(|val| (0.0..=1.0).contains(val)),
                "box coordinates must be in range [0, 1], but get ({}, {}, {}, {})",
                x1,
                y1,
                x2,
                y2
            );
            Ok(Self { x1, y1, x2, y2 })
        }

        pub fn corners(&self) -> [f32; 4] {
            let Self { x1, y1, x2, y2 } = *self;
            [x1, y1, x2, y2]
        }

        /// The box center in image-relative coordinates.
        pub fn center(&self) -> (f32, f32) {
            let Self { x1, y1, x2, y2 } = *self;
            ((x1 + x2) / 2.0, (y1 + y2) / 2.0)
        }

        /// The box width and height in image-relative coordinates.
        pub fn size(&self) -> (f32, f32) {
            let Self { x1, y1, x2, y2 } = *self;
            (x2 - x1, y2 - y1)
        }
    }
}

mod iou {
    use super::*;

    /// Computes the pairwise IoU between two sets of corner-format boxes,
    /// sized `[N, 4]` and `[M, 4]`. Returns the IoU matrix sized `[N, M]`.
    ///
    /// A zero-area operand yields IoU 0 as long as the other box has
    /// positive area. If both boxes of a pair are degenerate, the union is
    /// zero and the division yields NaN; callers must guarantee
    /// non-degenerate boxes.
    pub fn pairwise_iou(bbox1: &Tensor, bbox2: &Tensor) -> Tensor {
        let (n, _) = bbox1.size2().unwrap();
        let (m, _) = bbox2.size2().unwrap();

        // left-top and right-bottom corners of the pairwise intersections
        let lt = bbox1
            .i((.., 0..2))
            .unsqueeze(1)
            .expand(&[n, m, 2], false)
            .maximum(&bbox2.i((.., 0..2)).unsqueeze(0).expand(&[n, m, 2], false));
        let rb = bbox1
            .i((.., 2..4))
            .unsqueeze(1)
            .expand(&[n, m, 2], false)
            .minimum(&bbox2.i((.., 2..4)).unsqueeze(0).expand(&[n, m, 2], false));

        let wh = (rb - lt).clamp_min(0.0);
        let inter = wh.i((.., .., 0)) * wh.i((.., .., 1));

        let area1 = ((bbox1.i((.., 2)) - bbox1.i((.., 0))) * (bbox1.i((.., 3)) - bbox1.i((.., 1))))
            .unsqueeze(1)
            .expand_as(&inter);
        let area2 = ((bbox2.i((.., 2)) - bbox2.i((.., 0))) * (bbox2.i((.., 3)) - bbox2.i((.., 1))))
            .unsqueeze(0)
            .expand_as(&inter);

        let union = area1 + area2 - &inter;
        inter / union
    }

    /// Converts boxes from center format `(cx, cy, w, h)` to corner format
    /// `(x1, y1, x2, y2)`, sized `[K, 4]`.
    pub fn center_to_corner(boxes: &Tensor) -> Tensor {
        let xy = boxes.i((.., 0..2));
        let wh = boxes.i((.., 2..4));
        Tensor::cat(&[&xy - &wh * 0.5, &xy + &wh * 0.5], 1)
    }
}
