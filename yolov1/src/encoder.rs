//! Ground-truth encoding into the supervisory grid tensor.

use crate::{bbox::CornerBox, common::*};

pub use grid_encoder::*;

mod grid_encoder {
    use super::*;

    /// Target encoder initializer.
    #[derive(Debug, Clone)]
    pub struct GridEncoderInit {
        pub image_size: i64,
        pub num_boxes: i64,
        pub num_classes: i64,
    }

    impl GridEncoderInit {
        pub fn build(self) -> Result<GridEncoder> {
            let Self {
                image_size,
                num_boxes,
                num_classes,
            } = self;

            ensure!(
                image_size > 0 && image_size % 32 == 0,
                "image_size must be a positive multiple of 32, but get {}",
                image_size
            );
            ensure!(num_boxes > 0, "num_boxes must be positive");
            ensure!(num_classes > 0, "num_classes must be positive");

            Ok(GridEncoder {
                grid_size: image_size / 32,
                num_boxes,
                num_classes,
            })
        }
    }

    /// Encodes per-image box annotations into a `[S, S, B*5 + C]` target
    /// grid, where S is the grid resolution, B the number of box slots per
    /// cell, and C the number of classes.
    ///
    /// Each object is assigned to the cell containing its center. The
    /// geometry and confidence targets are duplicated across all B box
    /// slots; which slot is responsible for the object is resolved later
    /// at loss time. When two objects map to the same cell, the later
    /// write wins and the earlier object is dropped. This is a known
    /// limitation of the encoding scheme for dense scenes.
    #[derive(Debug, Clone)]
    pub struct GridEncoder {
        grid_size: i64,
        num_boxes: i64,
        num_classes: i64,
    }

    impl GridEncoder {
        pub fn grid_size(&self) -> i64 {
            self.grid_size
        }

        pub fn num_boxes(&self) -> i64 {
            self.num_boxes
        }

        pub fn num_classes(&self) -> i64 {
            self.num_classes
        }

        pub fn num_channels(&self) -> i64 {
            self.num_boxes * 5 + self.num_classes
        }

        /// Encodes boxes and their 1-indexed class labels into the target
        /// grid. Per box slot the layout is `(offset_x, offset_y, w, h,
        /// confidence)`: offsets are relative to the assigned cell's
        /// top-left corner in cell-size units, while width and height stay
        /// relative to the full image.
        pub fn encode(&self, boxes: &[CornerBox], labels: &[i64]) -> Result<Tensor> {
            let Self {
                grid_size,
                num_boxes,
                num_classes,
            } = *self;

            ensure!(
                boxes.len() == labels.len(),
                "the number of boxes {} does not match the number of labels {}",
                boxes.len(),
                labels.len()
            );

            let num_channels = num_boxes * 5 + num_classes;
            let cell_size = 1.0 / grid_size as f32;
            let mut grid = vec![0f32; (grid_size * grid_size * num_channels) as usize];

            izip!(boxes, labels).try_for_each(|(bbox, &label)| -> Result<()> {
                ensure!(
                    (1..=num_classes).contains(&label),
                    "class label {} out of range 1..={}",
                    label,
                    num_classes
                );

                let (cx, cy) = bbox.center();
                let (width, height) = bbox.size();
                let col = ((cx / cell_size).ceil() as i64 - 1).clamp(0, grid_size - 1);
                let row = ((cy / cell_size).ceil() as i64 - 1).clamp(0, grid_size - 1);

                // box center relative to the cell top-left corner, in
                // cell-size units
                let offset_x = (cx - col as f32 * cell_size) / cell_size;
                let offset_y = (cy - row as f32 * cell_size) / cell_size;

                let start = ((row * grid_size + col) * num_channels) as usize;
                let cell = &mut grid[start..start + num_channels as usize];

                // the last object assigned to this cell wins
                cell.fill(0.0);
                (0..num_boxes as usize).for_each(|slot| {
                    cell[slot * 5..slot * 5 + 5]
                        .copy_from_slice(&[offset_x, offset_y, width, height, 1.0]);
                });
                cell[(num_boxes * 5 + label - 1) as usize] = 1.0;

                Ok(())
            })?;

            Ok(Tensor::of_slice(&grid).view([grid_size, grid_size, num_channels]))
        }
    }
}
