//! Training program for the YOLOv1 grid detector.

mod common;
pub mod config;
pub mod utils;

use crate::{
    common::*,
    config::{Config, LoadCheckpoint, ModelConfig, TrainingConfig},
    utils::LrScheduler,
};
use yolov1::{
    dataset::ListDataset,
    encoder::{GridEncoder, GridEncoderInit},
    loss::DetectionLossInit,
    model::{self, YoloModelInit},
};

/// Runs the training program to completion.
pub fn start(config: Arc<Config>) -> Result<()> {
    let device = config.training.device()?;
    info!("use device {:?}", device);

    let ModelConfig {
        image_size,
        num_boxes,
        num_classes,
        ref pretrained_backbone,
        freeze_backbone,
    } = config.model;
    let image_size = image_size.get() as i64;
    let num_boxes = num_boxes.get() as i64;
    let num_classes = num_classes.get() as i64;

    // load dataset
    info!("loading dataset");
    let train_set = ListDataset::open(
        &config.dataset.dataset_dir,
        &config.dataset.train_split,
        image_size,
    )?;
    let test_set = ListDataset::open(
        &config.dataset.dataset_dir,
        &config.dataset.test_split,
        image_size,
    )?;
    ensure!(!train_set.is_empty(), "the training split is empty");

    let encoder = GridEncoderInit {
        image_size,
        num_boxes,
        num_classes,
    }
    .build()?;

    // init model
    info!("initializing model");
    let mut vs = nn::VarStore::new(device);
    let (model, mut epoch_tensor) = {
        let root = vs.root();
        let model = YoloModelInit {
            image_size,
            num_boxes,
            num_classes,
        }
        .build(&root)?;
        let epoch_tensor = root.zeros_no_train("epoch", &[]);
        (model, epoch_tensor)
    };
    let detection_loss = DetectionLossInit {
        grid_size: encoder.grid_size(),
        num_boxes,
        num_classes,
    }
    .build()?;

    // restore weights
    if let Some(weights) = pretrained_backbone {
        model::load_backbone(&mut vs, weights)?;
    }
    utils::try_load_checkpoint(
        &mut vs,
        &config.checkpoint.checkpoint_dir,
        &config.checkpoint.load_checkpoint,
    )?;
    let init_epoch = match config.checkpoint.load_checkpoint {
        LoadCheckpoint::Disabled => 1,
        _ => f32::from(&epoch_tensor) as usize + 1,
    };

    // the backbone must be frozen before the optimizer is built so its
    // parameters never receive gradients
    if freeze_backbone {
        model::freeze_backbone(&vs);
        info!("backbone parameters are frozen");
    }

    let TrainingConfig {
        batch_size,
        max_epoch,
        momentum,
        weight_decay,
        lambda_coord,
        lambda_noobj,
        ref lr_schedule,
        ..
    } = config.training;
    let batch_size = batch_size.get();
    let lambda_coord = lambda_coord.raw();
    let lambda_noobj = lambda_noobj.raw();

    const DUMMY_LR: f64 = 1.0;
    let mut optimizer = nn::Sgd {
        momentum: momentum.raw(),
        wd: weight_decay.raw(),
        ..Default::default()
    }
    .build(&vs, DUMMY_LR)?;

    let mut lr_scheduler = LrScheduler::new(lr_schedule, init_epoch)?;
    fs::create_dir_all(&config.checkpoint.checkpoint_dir)?;

    // training
    info!("start training at epoch {}", init_epoch);
    let mut rng = rand::thread_rng();

    for epoch in init_epoch..=max_epoch.get() {
        lr_scheduler.set_epoch(epoch);
        optimizer.set_lr(lr_scheduler.lr());

        // training pass
        let mut train_loss_sum = 0f64;
        let mut num_train_batches = 0usize;
        let mut indexes: Vec<_> = (0..train_set.len()).collect();
        indexes.shuffle(&mut rng);

        for batch in indexes.chunks(batch_size) {
            // drop the short last batch
            if batch.len() < batch_size {
                continue;
            }

            let (images, targets) = load_batch(&train_set, batch, &encoder, device)?;
            let pred = model.forward_t(&images, true);
            let losses = detection_loss.forward(&pred, &targets)?;
            let total = losses.total(lambda_coord, lambda_noobj);

            let total_value = f64::from(&total);
            ensure!(
                total_value.is_finite(),
                "loss diverged to {} at epoch {}",
                total_value,
                epoch
            );

            optimizer.backward_step(&total);
            train_loss_sum += total_value;
            num_train_batches += 1;
        }

        // evaluation pass
        let test_loss = tch::no_grad(|| -> Result<f64> {
            let mut loss_sum = 0f64;
            let mut num_batches = 0usize;
            let indexes: Vec<_> = (0..test_set.len()).collect();

            for batch in indexes.chunks(batch_size) {
                let (images, targets) = load_batch(&test_set, batch, &encoder, device)?;
                let pred = model.forward_t(&images, false);
                let losses = detection_loss.forward(&pred, &targets)?;
                loss_sum += f64::from(&losses.total(lambda_coord, lambda_noobj));
                num_batches += 1;
            }

            Ok(if num_batches > 0 {
                loss_sum / num_batches as f64
            } else {
                0.0
            })
        })?;

        let train_loss = if num_train_batches > 0 {
            train_loss_sum / num_train_batches as f64
        } else {
            0.0
        };
        info!(
            "epoch {}\tlr {:.6}\ttrain loss {:.5}\ttest loss {:.5}",
            epoch,
            lr_scheduler.lr(),
            train_loss,
            test_loss
        );

        // save checkpoint
        epoch_tensor.copy_(&Tensor::from(epoch as f32));
        if let Some(0) = config
            .checkpoint
            .save_checkpoint_epochs
            .map(|epochs| epoch % epochs.get())
        {
            utils::save_checkpoint(&vs, &config.checkpoint.checkpoint_dir, epoch, train_loss)?;
        }
    }

    Ok(())
}

fn load_batch(
    dataset: &ListDataset,
    indexes: &[usize],
    encoder: &GridEncoder,
    device: Device,
) -> Result<(Tensor, Tensor)> {
    let samples: Vec<(Tensor, Tensor)> = indexes
        .iter()
        .map(|&index| dataset.load(index, encoder))
        .try_collect()?;
    let (images, targets): (Vec<_>, Vec<_>) = samples.into_iter().unzip();

    Ok((
        Tensor::stack(&images, 0).to_device(device),
        Tensor::stack(&targets, 0).to_device(device),
    ))
}
