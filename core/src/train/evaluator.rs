//! Test-set evaluation: per-sample errors, prediction strips and attention maps.

use crate::autograd::Variable;
use crate::data::{Collate, DataLoader, Dataset};
use crate::error::{Error, Result};
use crate::models::VideoModel;
use crate::tensor::{FloatElem, Tensor, TensorError};
use image::{GrayImage, Luma};
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Errors of one test video.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleMetrics {
    pub sample: usize,
    pub mse: f64,
    pub mae: f64,
}

/// Mean errors over the test set, `NaN` when it is empty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationSummary {
    pub samples: usize,
    pub mse: f64,
    pub mae: f64,
}

/// Runs a trained model over the test split and writes its outputs to `save_dir`.
///
/// For every sample `i` it writes `sample_{i}.png`, three rows of frames (input, target,
/// prediction), and for models with attention one `sample_{i}_{layer}.png` per layer with a
/// map per timestep. Per-sample errors go to `metrics.csv`.
#[derive(Debug, Clone)]
pub struct Evaluator {
    save_dir: PathBuf,
}

impl Evaluator {
    pub const METRICS_FILE: &'static str = "metrics.csv";

    pub fn new<P: AsRef<Path>>(save_dir: P) -> Self {
        Self {
            save_dir: save_dir.as_ref().to_path_buf(),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn run<T, M, D, I, C>(
        &self,
        model: &M,
        test_loader: &DataLoader<D, I, C>,
    ) -> Result<EvaluationSummary>
    where
        T: FloatElem,
        M: VideoModel<T>,
        D: Dataset<I>,
        C: Collate<I, Output = Result<(Tensor<T, 5>, Tensor<T, 5>)>>,
    {
        std::fs::create_dir_all(&self.save_dir)?;
        let mut writer = csv::Writer::from_path(self.save_dir.join(Self::METRICS_FILE))?;
        let mut sample = 0;
        let (mut mse_total, mut mae_total) = (0.0, 0.0);

        for batch in test_loader {
            let (input, target) = batch?;
            let prediction = model.forward(&Variable::new(input.clone()))?;
            let prediction = &prediction.data;
            if prediction.shape() != target.shape() {
                return Err(Error::Tensor(TensorError::ShapeMismatch {
                    expected: target.shape().to_vec(),
                    got: prediction.shape().to_vec(),
                }));
            }
            let attention = model.attention_maps();

            let batch_size = input.shape()[0];
            for b in 0..batch_size {
                let (mse, mae) = sample_errors(prediction, &target, b)?;
                writer.serialize(SampleMetrics { sample, mse, mae })?;
                debug!(sample, mse, mae, "evaluated sample");
                mse_total += mse;
                mae_total += mae;

                let [height, width] = [input.shape()[3], input.shape()[4]];
                let rows = [&input, &target, prediction].map(|video| frames(video, b));
                grid(&rows, height, width, |v| v)?
                    .save(self.save_dir.join(format!("sample_{sample}.png")))?;

                for (layer, maps) in &attention {
                    attention_strip(maps, b, height, width)?
                        .save(self.save_dir.join(format!("sample_{sample}_{layer}.png")))?;
                }
                sample += 1;
            }
        }
        writer.flush()?;

        if sample == 0 {
            warn!("test split has no samples");
        }
        let summary = EvaluationSummary {
            samples: sample,
            mse: mse_total / sample as f64,
            mae: mae_total / sample as f64,
        };
        info!(
            samples = summary.samples,
            mse = summary.mse,
            mae = summary.mae,
            dir = %self.save_dir.display(),
            "evaluation complete"
        );
        Ok(summary)
    }
}

/// MSE and MAE of batch element `b`.
fn sample_errors<T: FloatElem>(
    prediction: &Tensor<T, 5>,
    target: &Tensor<T, 5>,
    b: usize,
) -> Result<(f64, f64)> {
    let len = prediction.size() / prediction.shape()[0];
    let range = b * len..(b + 1) * len;
    let (mut sq, mut abs) = (0.0, 0.0);
    for (p, t) in prediction.data()[range.clone()].iter().zip(&target.data()[range]) {
        let diff = to_f64(*p)? - to_f64(*t)?;
        sq += diff * diff;
        abs += diff.abs();
    }
    Ok((sq / len as f64, abs / len as f64))
}

fn to_f64<T: FloatElem>(v: T) -> Result<f64> {
    v.to_f64()
        .ok_or_else(|| Error::Dataset(format!("{v:?} is not representable as f64")))
}

/// The frames of channel 0 of batch element `b` of a `[B, C, T, H, W]` video.
fn frames<T: FloatElem>(video: &Tensor<T, 5>, b: usize) -> Vec<&[T]> {
    let [_, channels, time, height, width] = *video.shape();
    let frame = height * width;
    let start = b * channels * time * frame;
    (0..time)
        .map(|t| &video.data()[start + t * frame..start + (t + 1) * frame])
        .collect()
}

/// One min-max normalized map per timestep of `maps[b]`, a `[B, T, H * W]` tensor.
fn attention_strip<T: FloatElem>(
    maps: &Tensor<T, 3>,
    b: usize,
    height: usize,
    width: usize,
) -> Result<GrayImage> {
    let [_, time, positions] = *maps.shape();
    if positions != height * width {
        return Err(Error::Tensor(TensorError::ShapeMismatch {
            expected: vec![height * width],
            got: vec![positions],
        }));
    }
    let start = b * time * positions;
    let row: Vec<&[T]> = (0..time)
        .map(|t| &maps.data()[start + t * positions..start + (t + 1) * positions])
        .collect();

    let values = row.iter().flat_map(|frame| frame.iter());
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        let v = v.to_f64().unwrap_or(0.0);
        (lo.min(v), hi.max(v))
    });
    let range = if hi > lo { hi - lo } else { 1.0 };
    grid(&[row], height, width, |v| (v - lo) / range)
}

/// Draws `rows` of `height x width` frames side by side, one row per line of the image.
/// Short rows leave black space.
fn grid<T: FloatElem>(
    rows: &[Vec<&[T]>],
    height: usize,
    width: usize,
    scale: impl Fn(f64) -> f64,
) -> Result<GrayImage> {
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let img_width = u32::try_from(columns * width)
        .map_err(|_| Error::Dataset("image too wide".into()))?;
    let img_height = u32::try_from(rows.len() * height)
        .map_err(|_| Error::Dataset("image too tall".into()))?;

    let mut img = GrayImage::new(img_width, img_height);
    for (r, row) in rows.iter().enumerate() {
        for (c, frame) in row.iter().enumerate() {
            if frame.len() != height * width {
                return Err(Error::Dataset(format!(
                    "frame of {} pixels does not fit {height}x{width}",
                    frame.len()
                )));
            }
            for (i, v) in frame.iter().enumerate() {
                let level = scale(to_f64(*v)?).clamp(0.0, 1.0) * 255.0;
                let (x, y) = (c * width + i % width, r * height + i / width);
                img.put_pixel(x as u32, y as u32, Luma([level.round() as u8]));
            }
        }
    }
    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_errors() {
        let prediction = Tensor::new(vec![0.5, 0.5, 1.0, 0.0], [2, 1, 1, 1, 2]).unwrap();
        let target = Tensor::new(vec![0.0, 1.0, 1.0, 1.0], [2, 1, 1, 1, 2]).unwrap();
        assert_eq!(sample_errors::<f64>(&prediction, &target, 0).unwrap(), (0.25, 0.5));
        assert_eq!(sample_errors::<f64>(&prediction, &target, 1).unwrap(), (0.5, 0.5));
    }

    #[test]
    fn test_grid_layout() {
        // 1 video, 1 channel, 2 frames of 2x2
        let video = Tensor::new(vec![0.0_f32, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0], [1, 1, 2, 2, 2])
            .unwrap();
        let short = Tensor::new(vec![0.5_f32; 4], [1, 1, 1, 2, 2]).unwrap();
        let rows = [frames(&video, 0), frames(&short, 0)];
        let img = grid(&rows, 2, 2, |v| v).unwrap();

        assert_eq!(img.dimensions(), (4, 4));
        assert_eq!(img.get_pixel(0, 0)[0], 0);
        assert_eq!(img.get_pixel(3, 1)[0], 255);
        assert_eq!(img.get_pixel(1, 2)[0], 128);
        // the prediction row is one frame long
        assert_eq!(img.get_pixel(2, 2)[0], 0);
    }

    #[test]
    fn test_attention_strip_normalizes() {
        let maps = Tensor::new(vec![0.1_f64, 0.2, 0.3, 0.4, 0.25, 0.25, 0.25, 0.25], [1, 2, 4])
            .unwrap();
        let img = attention_strip(&maps, 0, 2, 2).unwrap();
        assert_eq!(img.dimensions(), (4, 2));
        assert_eq!(img.get_pixel(0, 0)[0], 0);
        assert_eq!(img.get_pixel(1, 1)[0], 255);

        assert!(attention_strip(&maps, 0, 3, 3).is_err());
    }
}
