//! VOC-style list dataset.

use crate::{bbox::CornerBox, common::*, encoder::GridEncoder};

pub use list_dataset::*;

mod list_dataset {
    use super::*;

    const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
    const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

    /// One annotated image: pixel-coordinate corner boxes and 1-indexed
    /// class labels.
    #[derive(Debug, Clone)]
    pub struct ImageAnnotation {
        pub file_name: String,
        pub boxes: Vec<[f32; 4]>,
        pub labels: Vec<i64>,
    }

    /// Dataset backed by a label list file under
    /// `{dataset_dir}/labels/{split}.txt` with images under
    /// `{dataset_dir}/images/`.
    ///
    /// Each line reads `fname x1 y1 x2 y2 class [x1 y1 x2 y2 class ...]`
    /// with pixel coordinates and 0-indexed classes. Labels are stored
    /// 1-indexed, with 0 reserved for background.
    #[derive(Debug)]
    pub struct ListDataset {
        dataset_dir: PathBuf,
        image_size: i64,
        annotations: Vec<ImageAnnotation>,
    }

    impl ListDataset {
        pub fn open(dataset_dir: impl AsRef<Path>, split: &str, image_size: i64) -> Result<Self> {
            let dataset_dir = dataset_dir.as_ref().to_owned();
            let label_file = dataset_dir.join("labels").join(format!("{}.txt", split));
            let text = fs::read_to_string(&label_file)
                .with_context(|| format!("failed to open label file '{}'", label_file.display()))?;

            let annotations: Vec<ImageAnnotation> = text
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| -> Result<_> {
                    let mut tokens = line.split_whitespace();
                    let file_name = tokens
                        .next()
                        .ok_or_else(|| format_err!("empty annotation line"))?
                        .to_owned();
                    let values: Vec<_> = tokens.collect();
                    ensure!(
                        !values.is_empty() && values.len() % 5 == 0,
                        "malformed annotation for image '{}'",
                        file_name
                    );

                    let entries: Vec<([f32; 4], i64)> = values
                        .chunks(5)
                        .map(|chunk| -> Result<_> {
                            let x1: f32 = chunk[0].parse()?;
                            let y1: f32 = chunk[1].parse()?;
                            let x2: f32 = chunk[2].parse()?;
                            let y2: f32 = chunk[3].parse()?;
                            let class: i64 = chunk[4].parse()?;
                            Ok(([x1, y1, x2, y2], class + 1))
                        })
                        .try_collect()
                        .with_context(|| {
                            format!("malformed annotation for image '{}'", file_name)
                        })?;
                    let (boxes, labels) = entries.into_iter().unzip();

                    Ok(ImageAnnotation {
                        file_name,
                        boxes,
                        labels,
                    })
                })
                .try_collect()?;

            info!(
                "loaded {} annotated images from '{}'",
                annotations.len(),
                label_file.display()
            );

            Ok(Self {
                dataset_dir,
                image_size,
                annotations,
            })
        }

        pub fn len(&self) -> usize {
            self.annotations.len()
        }

        pub fn is_empty(&self) -> bool {
            self.annotations.is_empty()
        }

        pub fn annotations(&self) -> &[ImageAnnotation] {
            &self.annotations
        }

        /// Loads one sample: the normalized image tensor sized
        /// `[3, image_size, image_size]` and its target grid.
        pub fn load(&self, index: usize, encoder: &GridEncoder) -> Result<(Tensor, Tensor)> {
            let annotation = self
                .annotations
                .get(index)
                .ok_or_else(|| format_err!("sample index {} out of range", index))?;
            let image_path = self.dataset_dir.join("images").join(&annotation.file_name);
            let image = tch::vision::image::load(&image_path)
                .with_context(|| format!("failed to load image '{}'", image_path.display()))?;
            let (_channels, height, width) = image.size3()?;

            // boxes become image-relative before encoding
            let boxes: Vec<CornerBox> = annotation
                .boxes
                .iter()
                .map(|&[x1, y1, x2, y2]| {
                    CornerBox::new(
                        x1 / width as f32,
                        y1 / height as f32,
                        x2 / width as f32,
                        y2 / height as f32,
                    )
                })
                .try_collect()
                .with_context(|| {
                    format!("invalid box annotation for image '{}'", annotation.file_name)
                })?;

            let image = tch::vision::image::resize(&image, self.image_size, self.image_size)?;
            let target = encoder.encode(&boxes, &annotation.labels)?;
            Ok((normalize(&image), target))
        }
    }

    /// Scales a `[3, H, W]` byte image to floats and applies the ImageNet
    /// channel statistics.
    fn normalize(image: &Tensor) -> Tensor {
        let mean = Tensor::of_slice(&IMAGENET_MEAN).view([3, 1, 1]);
        let std = Tensor::of_slice(&IMAGENET_STD).view([3, 1, 1]);
        (image.to_kind(Kind::Float) / 255.0 - mean) / std
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::GridEncoderInit;
    use approx::assert_abs_diff_eq;

    fn write_fixture() -> Result<PathBuf> {
        let dataset_dir = std::env::temp_dir().join(format!(
            "yolov1-dataset-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        fs::create_dir_all(dataset_dir.join("labels"))?;
        fs::create_dir_all(dataset_dir.join("images"))?;

        let image = Tensor::zeros(&[3, 64, 96], (Kind::Uint8, Device::Cpu));
        tch::vision::image::save(&image, dataset_dir.join("images").join("sample.png"))?;

        // two objects: classes 0 and 5 in the on-disk 0-indexed convention
        fs::write(
            dataset_dir.join("labels").join("train.txt"),
            "sample.png 12 8 36 24 0 60 40 84 56 5\n",
        )?;
        Ok(dataset_dir)
    }

    #[test]
    fn parses_and_encodes_samples() -> Result<()> {
        let dataset_dir = write_fixture()?;
        let dataset = ListDataset::open(&dataset_dir, "train", 224)?;
        assert_eq!(dataset.len(), 1);

        let annotation = &dataset.annotations()[0];
        assert_eq!(annotation.file_name, "sample.png");
        assert_eq!(annotation.labels, vec![1, 6]);

        let encoder = GridEncoderInit {
            image_size: 224,
            num_boxes: 2,
            num_classes: 20,
        }
        .build()?;
        let (image, target) = dataset.load(0, &encoder)?;
        assert_eq!(image.size(), vec![3, 224, 224]);
        assert_eq!(target.size(), vec![7, 7, 30]);
        assert_eq!(
            i64::from(target.i((.., .., 4)).eq(1.0).sum(Kind::Int64)),
            2
        );

        // zero pixels normalize to the negated channel means over stds
        assert_abs_diff_eq!(
            f64::from(image.i((0, 0, 0))),
            -0.485 / 0.229,
            epsilon = 1e-4
        );

        fs::remove_dir_all(&dataset_dir)?;
        Ok(())
    }

    #[test]
    fn malformed_lines_are_rejected() -> Result<()> {
        let dataset_dir = write_fixture()?;
        fs::write(
            dataset_dir.join("labels").join("bad.txt"),
            "sample.png 12 8 36 24\n",
        )?;
        assert!(ListDataset::open(&dataset_dir, "bad", 224).is_err());
        fs::remove_dir_all(&dataset_dir)?;
        Ok(())
    }
}
