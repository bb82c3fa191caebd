//! Training program configuration format.

use crate::common::*;

pub use checkpoint::*;
pub use dataset::*;
pub use model::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    pub training: TrainingConfig,
    pub checkpoint: CheckpointConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        let config = json5::from_str(&text)?;
        Ok(config)
    }
}

mod model {
    use super::*;

    /// The detector topology and backbone options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelConfig {
        /// The square input resolution; must be a multiple of 32.
        pub image_size: NonZeroUsize,
        /// The number of box slots per grid cell.
        pub num_boxes: NonZeroUsize,
        /// The number of object classes.
        pub num_classes: NonZeroUsize,
        /// Optional pretrained VGG feature weights.
        pub pretrained_backbone: Option<PathBuf>,
        /// If set, no gradient flows into the feature extractor.
        #[serde(default = "default_freeze_backbone")]
        pub freeze_backbone: bool,
    }

    fn default_freeze_backbone() -> bool {
        true
    }
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        pub dataset_dir: PathBuf,
        pub train_split: String,
        pub test_split: String,
    }
}

mod training {
    use super::*;

    /// Training loop options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        pub batch_size: NonZeroUsize,
        pub max_epoch: NonZeroUsize,
        pub momentum: R64,
        pub weight_decay: R64,
        /// The weight for the coordinate regression losses.
        pub lambda_coord: R64,
        /// The weight for the no-objectness confidence loss.
        pub lambda_noobj: R64,
        pub lr_schedule: LearningRateSchedule,
        /// Device name like "cpu" or "cuda:0"; autodetect when absent.
        pub device: Option<String>,
    }

    impl TrainingConfig {
        pub fn device(&self) -> Result<Device> {
            let device = match self.device.as_deref() {
                None => Device::cuda_if_available(),
                Some("cpu") => Device::Cpu,
                Some(text) => {
                    let index = text
                        .strip_prefix("cuda:")
                        .ok_or_else(|| format_err!("unrecognized device name '{}'", text))?
                        .parse()?;
                    Device::Cuda(index)
                }
            };
            Ok(device)
        }
    }

    /// Learning rate schedule variants.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum LearningRateSchedule {
        Constant { lr: R64 },
        StepWise { steps: Vec<(usize, R64)> },
    }
}

mod checkpoint {
    use super::*;

    /// Checkpoint persistence options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CheckpointConfig {
        pub checkpoint_dir: PathBuf,
        /// Save a checkpoint every this many epochs; never save when
        /// absent.
        pub save_checkpoint_epochs: Option<NonZeroUsize>,
        pub load_checkpoint: LoadCheckpoint,
    }

    /// Checkpoint loading policies.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum LoadCheckpoint {
        Disabled,
        FromRecent,
        FromFile { file: PathBuf },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_reference_configuration() -> Result<()> {
        let text = r#"{
            model: {
                image_size: 224,
                num_boxes: 2,
                num_classes: 20,
                pretrained_backbone: "weights/vgg_features.ot",
            },
            dataset: {
                dataset_dir: "dataset",
                train_split: "train",
                test_split: "test",
            },
            training: {
                batch_size: 64,
                max_epoch: 200,
                momentum: 0.9,
                weight_decay: 5e-4,
                lambda_coord: 7,
                lambda_noobj: 0.5,
                lr_schedule: {
                    type: "step_wise",
                    steps: [[0, 0.001], [50, 0.0001], [150, 0.00001]],
                },
                device: "cpu",
            },
            checkpoint: {
                checkpoint_dir: "checkpoints",
                save_checkpoint_epochs: 1,
                load_checkpoint: { type: "from_recent" },
            },
        }"#;

        let config: Config = json5::from_str(text)?;
        assert!(config.model.freeze_backbone);
        assert_eq!(config.training.lambda_coord, r64(7.0));
        assert_eq!(config.training.device()?, Device::Cpu);
        assert!(matches!(
            config.checkpoint.load_checkpoint,
            LoadCheckpoint::FromRecent
        ));
        assert!(matches!(
            config.training.lr_schedule,
            LearningRateSchedule::StepWise { ref steps } if steps.len() == 3
        ));
        Ok(())
    }
}
