//! VGG-16 backbone with the grid detection head.

use crate::common::*;

pub use yolo_model::*;

mod yolo_model {
    use super::*;

    /// Numbers of output channels per VGG-16 convolution block; blocks are
    /// separated by 2x2 max-pooling, giving an overall stride of 32.
    const VGG16_BLOCKS: [&[i64]; 5] = [
        &[64, 64],
        &[128, 128],
        &[256, 256, 256],
        &[512, 512, 512],
        &[512, 512, 512],
    ];

    /// Model initializer.
    #[derive(Debug, Clone)]
    pub struct YoloModelInit {
        pub image_size: i64,
        pub num_boxes: i64,
        pub num_classes: i64,
    }

    impl YoloModelInit {
        pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<YoloModel> {
            let path = path.borrow();
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

            let grid_size = image_size / 32;
            let num_channels = num_boxes * 5 + num_classes;

            let features = vgg16_features(&(path / "features"));
            let detector = {
                let path = path / "detector";
                nn::seq_t()
                    .add(nn::linear(
                        &path / "0",
                        512 * grid_size * grid_size,
                        4096,
                        Default::default(),
                    ))
                    .add_fn(|xs| xs.relu())
                    .add_fn_t(|xs, train| xs.dropout(0.5, train))
                    .add(nn::linear(
                        &path / "3",
                        4096,
                        grid_size * grid_size * num_channels,
                        Default::default(),
                    ))
            };

            Ok(YoloModel {
                features,
                detector,
                grid_size,
                num_channels,
            })
        }
    }

    /// Variable names follow the torchvision layer numbering so that
    /// converted VGG feature weights load into the `features` prefix
    /// unchanged.
    fn vgg16_features(path: &nn::Path) -> nn::SequentialT {
        let mut seq = nn::seq_t();
        let mut in_channels = 3;
        let mut index = 0;

        for block in VGG16_BLOCKS {
            for &out_channels in block {
                let conv = nn::conv2d(
                    path / index.to_string(),
                    in_channels,
                    out_channels,
                    3,
                    nn::ConvConfig {
                        padding: 1,
                        ..Default::default()
                    },
                );
                seq = seq.add(conv).add_fn(|xs| xs.relu());
                in_channels = out_channels;
                index += 2;
            }
            seq = seq.add_fn(|xs| xs.max_pool2d_default(2));
            index += 1;
        }

        seq
    }

    /// The single-shot grid detector: frozen-friendly VGG features and a
    /// fully connected detection head with a sigmoid output, reshaped to
    /// `[N, S, S, B*5 + C]`.
    #[derive(Debug)]
    pub struct YoloModel {
        features: nn::SequentialT,
        detector: nn::SequentialT,
        grid_size: i64,
        num_channels: i64,
    }

    impl nn::ModuleT for YoloModel {
        fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
            let Self {
                grid_size,
                num_channels,
                ..
            } = *self;

            let xs = self.features.forward_t(xs, train);
            let xs = self.detector.forward_t(&xs.flat_view(), train);
            xs.sigmoid().view([-1, grid_size, grid_size, num_channels])
        }
    }

    /// Loads pretrained backbone weights into the var store; variables
    /// absent from the weight file keep their initialization.
    pub fn load_backbone(vs: &mut nn::VarStore, weights: impl AsRef<Path>) -> Result<()> {
        let weights = weights.as_ref();
        let missing = vs
            .load_partial(weights)
            .with_context(|| format!("failed to load weights from '{}'", weights.display()))?;
        info!(
            "loaded backbone weights from '{}', {} variables left untouched",
            weights.display(),
            missing.len()
        );
        Ok(())
    }

    /// Disables gradient tracking for the feature extractor. Call before
    /// the optimizer is built so no gradient is ever accumulated for the
    /// backbone parameters.
    pub fn freeze_backbone(vs: &nn::VarStore) {
        vs.variables().iter().for_each(|(name, var)| {
            if name.starts_with("features") {
                let _ = var.set_requires_grad(false);
            }
        });
    }
}
