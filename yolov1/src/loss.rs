//! Detection loss for the grid detector.

use crate::{bbox, common::*};

pub use detection_loss::*;
pub use detection_loss_output::*;

mod detection_loss {
    use super::*;

    /// Detection loss initializer.
    #[derive(Debug, Clone)]
    pub struct DetectionLossInit {
        pub grid_size: i64,
        pub num_boxes: i64,
        pub num_classes: i64,
    }

    impl DetectionLossInit {
        pub fn build(self) -> Result<DetectionLoss> {
            let Self {
                grid_size,
                num_boxes,
                num_classes,
            } = self;

            ensure!(grid_size > 0, "grid_size must be positive");
            ensure!(num_boxes > 0, "num_boxes must be positive");
            ensure!(num_classes > 0, "num_classes must be positive");

            Ok(DetectionLoss {
                grid_size,
                num_boxes,
                num_classes,
            })
        }
    }

    /// Computes the five-component detection loss between predicted and
    /// target grid tensors.
    ///
    /// Cells are partitioned into object and no-object cells by the target
    /// confidence channel. In every object cell exactly one of the B box
    /// slots is made responsible for the ground truth, chosen by the
    /// maximum IoU against the target box; the remaining B-1 slots of that
    /// cell contribute to none of the loss components.
    #[derive(Debug, Clone)]
    pub struct DetectionLoss {
        grid_size: i64,
        num_boxes: i64,
        num_classes: i64,
    }

    impl DetectionLoss {
        /// Computes the loss components, each already normalized by batch
        /// size. Gradients propagate through `pred` only.
        pub fn forward(&self, pred: &Tensor, target: &Tensor) -> Result<DetectionLossOutput> {
            let Self {
                grid_size,
                num_boxes,
                num_classes,
            } = *self;
            let num_channels = num_boxes * 5 + num_classes;

            ensure!(
                pred.size() == target.size(),
                "prediction shape {:?} does not match target shape {:?}",
                pred.size(),
                target.size()
            );
            let (batch_size, height, width, channels) = pred.size4()?;
            ensure!(
                height == grid_size && width == grid_size && channels == num_channels,
                "expect tensor shape [N, {}, {}, {}], but get {:?}",
                grid_size,
                grid_size,
                num_channels,
                pred.size()
            );
            let device = pred.device();

            // partition cells by the target confidence channel; the
            // channel is duplicated across box slots at encode time, so
            // the first slot decides for the whole cell
            let obj_mask = target
                .i((.., .., .., 4))
                .eq(1.0)
                .unsqueeze(-1)
                .expand_as(target);
            let noobj_mask = target
                .i((.., .., .., 4))
                .eq(0.0)
                .unsqueeze(-1)
                .expand_as(target);

            let pred_obj = pred.masked_select(&obj_mask).view([-1, num_channels]);
            let target_obj = target.masked_select(&obj_mask).view([-1, num_channels]);

            let pred_obj_boxes = pred_obj.i((.., 0..num_boxes * 5)).reshape(&[-1, 5]);
            let target_obj_boxes = target_obj.i((.., 0..num_boxes * 5)).reshape(&[-1, 5]);
            let pred_obj_class = pred_obj.i((.., num_boxes * 5..));
            let target_obj_class = target_obj.i((.., num_boxes * 5..));

            // one responsible slot per object cell, chosen by the maximum
            // IoU against the duplicated target box; ties resolve to the
            // first slot since max_dim returns the first maximal index
            let responsible = tch::no_grad(|| {
                let num_entries = target_obj_boxes.size2().unwrap().0;
                let mut indexes = Vec::with_capacity((num_entries / num_boxes) as usize);
                let mut start = 0;
                while start < num_entries {
                    let pred_group = pred_obj_boxes.i((start..start + num_boxes, 0..4));
                    let target_group = target_obj_boxes.i((start..start + 1, 0..4));
                    let iou = bbox::pairwise_iou(
                        &bbox::center_to_corner(&pred_group),
                        &bbox::center_to_corner(&target_group),
                    );
                    let (_score, index) = iou.max_dim(0, false);
                    indexes.push(start + index.int64_value(&[0]));
                    start += num_boxes;
                }
                Tensor::of_slice(&indexes).to_device(device)
            });

            let pred_resp = pred_obj_boxes.index_select(0, &responsible);
            let target_resp = target_obj_boxes.index_select(0, &responsible);

            let loss_xy = (target_resp.i((.., 0..2)) - pred_resp.i((.., 0..2)))
                .square()
                .sum(Kind::Float)
                / batch_size as f64;

            // the square root compresses the dynamic range so that equal
            // absolute errors weigh more on small boxes than on large ones
            let loss_wh = (target_resp.i((.., 2..4)).sqrt() - pred_resp.i((.., 2..4)).sqrt())
                .square()
                .sum(Kind::Float)
                / batch_size as f64;

            let loss_obj = (target_resp.i((.., 4)) - pred_resp.i((.., 4)))
                .square()
                .sum(Kind::Float)
                / batch_size as f64;

            // every slot's confidence is penalized in no-object cells
            let pred_noobj = pred.masked_select(&noobj_mask).view([-1, num_channels]);
            let target_noobj = target.masked_select(&noobj_mask).view([-1, num_channels]);
            let conf_channels =
                Tensor::of_slice(&(0..num_boxes).map(|slot| slot * 5 + 4).collect_vec())
                    .to_device(device);
            let loss_noobj = (target_noobj.index_select(1, &conf_channels)
                - pred_noobj.index_select(1, &conf_channels))
            .square()
            .sum(Kind::Float)
                / batch_size as f64;

            let loss_class = (target_obj_class - pred_obj_class)
                .square()
                .sum(Kind::Float)
                / batch_size as f64;

            Ok(DetectionLossOutput {
                loss_xy,
                loss_wh,
                loss_obj,
                loss_noobj,
                loss_class,
            })
        }
    }
}

mod detection_loss_output {
    use super::*;

    /// The five loss components, each normalized by batch size.
    #[derive(Debug, TensorLike)]
    pub struct DetectionLossOutput {
        pub loss_xy: Tensor,
        pub loss_wh: Tensor,
        pub loss_obj: Tensor,
        pub loss_noobj: Tensor,
        pub loss_class: Tensor,
    }

    impl DetectionLossOutput {
        /// Combines the components into the training objective.
        pub fn total(&self, lambda_coord: f64, lambda_noobj: f64) -> Tensor {
            lambda_coord * (&self.loss_xy + &self.loss_wh)
                + &self.loss_obj
                + lambda_noobj * &self.loss_noobj
                + &self.loss_class
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bbox::CornerBox,
        encoder::{GridEncoder, GridEncoderInit},
    };
    use approx::assert_abs_diff_eq;

    fn build(num_boxes: i64) -> (GridEncoder, DetectionLoss) {
        let encoder = GridEncoderInit {
            image_size: 224,
            num_boxes,
            num_classes: 20,
        }
        .build()
        .unwrap();
        let loss = DetectionLossInit {
            grid_size: encoder.grid_size(),
            num_boxes,
            num_classes: 20,
        }
        .build()
        .unwrap();
        (encoder, loss)
    }

    fn scalar(tensor: &Tensor) -> f64 {
        f64::from(tensor)
    }

    #[test]
    fn perfect_prediction_has_zero_loss() -> Result<()> {
        let (encoder, loss) = build(2);
        let boxes = [
            CornerBox::new(0.4, 0.35, 0.6, 0.65)?,
            CornerBox::new(0.05, 0.05, 0.15, 0.2)?,
        ];
        let target = encoder.encode(&boxes, &[6, 12])?.unsqueeze(0);
        let output = loss.forward(&target, &target)?;

        assert_abs_diff_eq!(scalar(&output.loss_xy), 0.0);
        assert_abs_diff_eq!(scalar(&output.loss_wh), 0.0);
        assert_abs_diff_eq!(scalar(&output.loss_obj), 0.0);
        assert_abs_diff_eq!(scalar(&output.loss_noobj), 0.0);
        assert_abs_diff_eq!(scalar(&output.loss_class), 0.0);
        assert_abs_diff_eq!(scalar(&output.total(7.0, 0.5)), 0.0);
        Ok(())
    }

    #[test]
    fn empty_target_only_penalizes_noobj_confidence() -> Result<()> {
        let (_encoder, loss) = build(2);
        let target = Tensor::zeros(&[1, 7, 7, 30], tch::kind::FLOAT_CPU);
        let pred = Tensor::zeros(&[1, 7, 7, 30], tch::kind::FLOAT_CPU);
        // confidence 0.5 in the first slot of every cell
        let _ = pred.i((.., .., .., 4)).fill_(0.5);

        let output = loss.forward(&pred, &target)?;
        assert_abs_diff_eq!(scalar(&output.loss_xy), 0.0);
        assert_abs_diff_eq!(scalar(&output.loss_wh), 0.0);
        assert_abs_diff_eq!(scalar(&output.loss_obj), 0.0);
        assert_abs_diff_eq!(scalar(&output.loss_class), 0.0);
        // 49 cells * 0.5^2 in slot 0, slot 1 confidences stay zero
        assert_abs_diff_eq!(scalar(&output.loss_noobj), 49.0 * 0.25, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn responsibility_goes_to_the_matching_slot() -> Result<()> {
        let (encoder, loss) = build(2);
        let bbox = CornerBox::new(0.4, 0.35, 0.6, 0.65)?;
        let target = encoder.encode(&[bbox], &[6])?.unsqueeze(0);

        // slot 0 matches the target exactly, slot 1 is pushed away
        let pred = target.copy();
        let _ = pred.i((0, 3, 3, 5..9)).fill_(0.05);
        let output = loss.forward(&pred, &target)?;

        assert_abs_diff_eq!(scalar(&output.loss_xy), 0.0);
        assert_abs_diff_eq!(scalar(&output.loss_wh), 0.0);
        assert_abs_diff_eq!(scalar(&output.loss_obj), 0.0);
        Ok(())
    }

    #[test]
    fn tied_slots_resolve_to_the_first_one() -> Result<()> {
        let (encoder, loss) = build(2);
        let bbox = CornerBox::new(0.4, 0.35, 0.6, 0.65)?;
        let target = encoder.encode(&[bbox], &[6])?.unsqueeze(0);

        // identical geometry in both slots, different confidences; the
        // stable argmax must keep slot 0 responsible
        let pred = target.copy();
        let _ = pred.i((0, 3, 3, 9)).fill_(0.3);
        let output = loss.forward(&pred, &target)?;

        assert_abs_diff_eq!(scalar(&output.loss_obj), 0.0);
        Ok(())
    }

    #[test]
    fn square_root_amplifies_small_box_errors() -> Result<()> {
        let (encoder, loss) = build(1);

        // equal absolute size error of 0.02 on a small and a large box
        let small_target = encoder
            .encode(&[CornerBox::new(0.495, 0.495, 0.505, 0.505)?], &[1])?
            .unsqueeze(0);
        let small_pred = small_target.copy();
        let _ = small_pred.i((0, 3, 3, 2..4)).fill_(0.03);

        let large_target = encoder
            .encode(&[CornerBox::new(0.25, 0.25, 0.75, 0.75)?], &[1])?
            .unsqueeze(0);
        let large_pred = large_target.copy();
        let _ = large_pred.i((0, 3, 3, 2..4)).fill_(0.52);

        let small_wh = scalar(&loss.forward(&small_pred, &small_target)?.loss_wh);
        let large_wh = scalar(&loss.forward(&large_pred, &large_target)?.loss_wh);
        assert!(small_wh > large_wh * 10.0);
        Ok(())
    }

    #[test]
    fn non_responsible_slot_is_a_dead_zone() -> Result<()> {
        let (encoder, loss) = build(2);
        // one object at cell (3, 3) with offsets (0.5, 0.5), size
        // (0.2, 0.3), class 5
        let bbox = CornerBox::new(0.4, 0.35, 0.6, 0.65)?;
        let target = encoder.encode(&[bbox], &[5])?.unsqueeze(0);

        // slot 0 matches exactly, slot 1 is all zeros; slot 1 is excluded
        // from loss_obj by responsibility and from loss_noobj because its
        // cell contains an object
        let pred = target.copy();
        let _ = pred.i((0, 3, 3, 5..10)).fill_(0.0);
        let output = loss.forward(&pred, &target)?;

        assert_abs_diff_eq!(scalar(&output.loss_xy), 0.0);
        assert_abs_diff_eq!(scalar(&output.loss_wh), 0.0);
        assert_abs_diff_eq!(scalar(&output.loss_obj), 0.0);
        assert_abs_diff_eq!(scalar(&output.loss_noobj), 0.0);
        assert_abs_diff_eq!(scalar(&output.loss_class), 0.0);
        Ok(())
    }

    #[test]
    fn losses_are_normalized_by_batch_size() -> Result<()> {
        let (encoder, loss) = build(2);
        let bbox = CornerBox::new(0.4, 0.35, 0.6, 0.65)?;
        let sample = encoder.encode(&[bbox], &[6])?;

        let single_target = sample.unsqueeze(0);
        let single_pred = single_target.zeros_like();
        let single = loss.forward(&single_pred, &single_target)?;

        let double_target = Tensor::stack(&[&sample, &sample], 0);
        let double_pred = double_target.zeros_like();
        let double = loss.forward(&double_pred, &double_target)?;

        // twice the objects over twice the batch size cancel out
        assert_abs_diff_eq!(
            scalar(&single.loss_obj),
            scalar(&double.loss_obj),
            epsilon = 1e-5
        );
        assert_abs_diff_eq!(
            scalar(&single.loss_class),
            scalar(&double.loss_class),
            epsilon = 1e-5
        );
        Ok(())
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let (_encoder, loss) = build(2);
        let pred = Tensor::zeros(&[1, 7, 7, 30], tch::kind::FLOAT_CPU);
        let target = Tensor::zeros(&[2, 7, 7, 30], tch::kind::FLOAT_CPU);
        assert!(loss.forward(&pred, &target).is_err());

        let bad_channels = Tensor::zeros(&[1, 7, 7, 29], tch::kind::FLOAT_CPU);
        assert!(loss.forward(&bad_channels, &bad_channels).is_err());
    }

    #[test]
    fn gradients_flow_through_responsible_slots() -> Result<()> {
        let (encoder, loss) = build(2);
        let bbox = CornerBox::new(0.4, 0.35, 0.6, 0.65)?;
        let target = encoder.encode(&[bbox], &[6])?.unsqueeze(0);

        let pred = (target.copy() * 0.5).set_requires_grad(true);
        let output = loss.forward(&pred, &target)?;
        let total = output.total(7.0, 0.5);
        total.backward();

        let grad = pred.grad();
        assert!(f64::from(grad.abs().sum(Kind::Float)) > 0.0);
        Ok(())
    }
}
