//! Training utilities: learning rate scheduling and checkpoint files.

use crate::{
    common::*,
    config::{LearningRateSchedule, LoadCheckpoint},
};
use regex::Regex;

pub use checkpoint::*;
pub use lr_scheduler::*;

mod lr_scheduler {
    use super::*;

    /// Epoch-indexed learning rate scheduler.
    #[derive(Debug, Clone)]
    pub enum LrScheduler {
        Constant { lr: R64 },
        StepWise { index: usize, steps: Vec<(usize, R64)> },
    }

    impl LrScheduler {
        pub fn new(config: &LearningRateSchedule, init_epoch: usize) -> Result<Self> {
            let mut scheduler = match *config {
                LearningRateSchedule::Constant { lr } => {
                    ensure!(lr > 0.0, "the learning rate must be positive");
                    Self::Constant { lr }
                }
                LearningRateSchedule::StepWise { ref steps } => {
                    ensure!(
                        !steps.is_empty() && steps[0].0 == 0,
                        "the steps must start from epoch zero"
                    );
                    steps.iter().try_fold(None, |prev_epoch, &(epoch, lr)| {
                        if let Some(prev_epoch) = prev_epoch {
                            ensure!(epoch > prev_epoch, "the steps must be monotonic");
                        }
                        ensure!(lr > 0.0, "the learning rate must be positive");
                        anyhow::Ok(Some(epoch))
                    })?;

                    Self::StepWise {
                        index: 0,
                        steps: steps.clone(),
                    }
                }
            };

            scheduler.set_epoch(init_epoch);
            Ok(scheduler)
        }

        pub fn set_epoch(&mut self, epoch: usize) {
            if let Self::StepWise { index, steps } = self {
                *index = match steps.binary_search_by_key(&epoch, |&(thresh, _lr)| thresh) {
                    Ok(found) => found,
                    Err(insert) => insert.saturating_sub(1),
                };
            }
        }

        pub fn lr(&self) -> f64 {
            match self {
                Self::Constant { lr } => lr.raw(),
                Self::StepWise { index, steps } => steps[*index].1.raw(),
            }
        }
    }
}

mod checkpoint {
    use super::*;

    pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

    /// Saves parameters to a checkpoint file named by timestamp, epoch and
    /// loss.
    pub fn save_checkpoint(
        vs: &nn::VarStore,
        checkpoint_dir: &Path,
        epoch: usize,
        loss: f64,
    ) -> Result<()> {
        let filename = format!(
            "{}_{:04}_{:08.5}.ckpt",
            Local::now().format(FILE_STRFTIME),
            epoch,
            loss
        );
        let path = checkpoint_dir.join(filename);
        vs.save(&path)?;
        Ok(())
    }

    /// Loads parameters with the configured checkpoint loading policy.
    pub fn try_load_checkpoint(
        vs: &mut nn::VarStore,
        checkpoint_dir: &Path,
        load_checkpoint: &LoadCheckpoint,
    ) -> Result<()> {
        let checkpoint_filename_regex = Regex::new(
            r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}\+\d{4})_\d{4}_\d+\.\d+\.ckpt$",
        )
        .unwrap();

        let path = match load_checkpoint {
            LoadCheckpoint::Disabled => {
                info!("checkpoint loading is disabled");
                None
            }
            LoadCheckpoint::FromRecent => {
                let paths: Vec<_> =
                    glob::glob(&format!("{}/*.ckpt", checkpoint_dir.display()))
                        .unwrap()
                        .try_collect()?;
                let checkpoint_file = paths
                    .into_iter()
                    .filter_map(|path| {
                        let file_name = path.file_name()?.to_str()?;
                        let captures = checkpoint_filename_regex.captures(file_name)?;
                        let datetime_str = captures.get(1)?.as_str();
                        let datetime =
                            DateTime::parse_from_str(datetime_str, FILE_STRFTIME).ok()?;
                        Some((path, datetime))
                    })
                    .max_by_key(|(_path, datetime)| *datetime)
                    .map(|(path, _datetime)| path);

                if checkpoint_file.is_none() {
                    warn!("no checkpoint file found");
                }

                checkpoint_file
            }
            LoadCheckpoint::FromFile { file } => {
                if file.is_file() {
                    Some(file.to_owned())
                } else {
                    warn!("{} is not a file", file.display());
                    None
                }
            }
        };

        if let Some(path) = path {
            info!("load checkpoint file {}", path.display());
            vs.load_partial(path)?;
        }

        Ok(())
    }
}
