//! Moving MNIST: videos of two handwritten digits bouncing inside a 64x64 frame.
//!
//! The test set ships as `mnist_test_seq.npy`, an unsigned byte array shaped
//! `(frames, videos, height, width)`, usually `(20, 10000, 64, 64)`.

use super::npy;
use super::{Collate, DataLoader, Dataset, RandomSampler, Subset, random_split};
use crate::config::DataConfig;
use crate::error::{Error, Result};
use crate::tensor::{FloatElem, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::marker::PhantomData;
use std::path::Path;
use tracing::info;

/// The Moving MNIST videos held in memory.
#[derive(Debug, Clone)]
pub struct MovingMnist {
    /// `[frames, videos, height, width]`, C order.
    data: Vec<u8>,
    shape: [usize; 4],
}

impl MovingMnist {
    pub const FILE_NAME: &'static str = "mnist_test_seq.npy";

    /// Loads `path`, either the `.npy` file itself or a directory containing [`Self::FILE_NAME`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = if path.is_dir() {
            path.join(Self::FILE_NAME)
        } else {
            path.to_path_buf()
        };

        let array = npy::read_u8(&file)?;
        let shape: [usize; 4] = array.shape.as_slice().try_into().map_err(|_| {
            Error::Dataset(format!(
                "{} must be shaped (frames, videos, height, width), got {:?}",
                file.display(),
                array.shape
            ))
        })?;
        let dataset = Self::from_frames(array.data, shape)?;
        info!(
            path = %file.display(),
            videos = shape[1],
            frames = shape[0],
            "loaded Moving MNIST"
        );
        Ok(dataset)
    }

    /// Wraps raw bytes laid out as `[frames, videos, height, width]`.
    pub fn from_frames(data: Vec<u8>, shape: [usize; 4]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(Error::Dataset(format!(
                "shape {:?} needs {} bytes, got {}",
                shape,
                size,
                data.len()
            )));
        }
        Ok(Self { data, shape })
    }

    /// Frames per video.
    pub fn seq_len(&self) -> usize {
        self.shape[0]
    }

    /// `[height, width]`.
    pub fn frame_size(&self) -> [usize; 2] {
        [self.shape[2], self.shape[3]]
    }
}

impl Dataset<Tensor<u8, 4>> for MovingMnist {
    fn len(&self) -> usize {
        self.shape[1]
    }

    /// Video `index` as `[frames, 1, height, width]`.
    fn get(&self, index: usize) -> Tensor<u8, 4> {
        let [frames, videos, height, width] = self.shape;
        assert!(index < videos, "video {index} out of range for {videos} videos");

        let frame = height * width;
        let mut out = Vec::with_capacity(frames * frame);
        for t in 0..frames {
            let start = (t * videos + index) * frame;
            out.extend_from_slice(&self.data[start..start + frame]);
        }
        Tensor::from_parts(out, [frames, 1, height, width])
    }
}

/// Cuts each video into an input window and the label window right after it.
///
/// Videos `[T, C, H, W]` are batched to `[B, C, T, H, W]` with pixels scaled to `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct WindowCollate<T> {
    pub input_frames: usize,
    pub label_frames: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> WindowCollate<T> {
    pub fn new(input_frames: usize, label_frames: usize) -> Self {
        Self {
            input_frames,
            label_frames,
            _marker: PhantomData,
        }
    }
}

impl<T: FloatElem> Collate<Tensor<u8, 4>> for WindowCollate<T> {
    type Output = Result<(Tensor<T, 5>, Tensor<T, 5>)>;

    fn collate(&self, batch: Vec<Tensor<u8, 4>>) -> Self::Output {
        let first = batch
            .first()
            .ok_or_else(|| Error::Dataset("cannot collate an empty batch".into()))?;
        let [frames, channels, height, width] = *first.shape();
        let window = self.input_frames + self.label_frames;
        if frames < window {
            return Err(Error::Dataset(format!(
                "videos have {frames} frames, the window needs {window}"
            )));
        }

        let scale = (0..=u8::MAX)
            .map(|p| T::from_f64(f64::from(p) / 255.0))
            .collect::<Option<Vec<T>>>()
            .ok_or_else(|| Error::Dataset("pixel scale is not representable".into()))?;

        let frame = height * width;
        let mut input = Vec::with_capacity(batch.len() * channels * self.input_frames * frame);
        let mut label = Vec::with_capacity(batch.len() * channels * self.label_frames * frame);
        for video in &batch {
            if video.shape() != first.shape() {
                return Err(Error::Dataset(format!(
                    "videos in a batch must share a shape, got {:?} and {:?}",
                    first.shape(),
                    video.shape()
                )));
            }
            let pixels = video.data();
            // [T, C, H, W] -> [C, T, H, W]
            for c in 0..channels {
                for t in 0..window {
                    let start = (t * channels + c) * frame;
                    let target = if t < self.input_frames {
                        &mut input
                    } else {
                        &mut label
                    };
                    target.extend(pixels[start..start + frame].iter().map(|&p| scale[p as usize]));
                }
            }
        }

        let batch_size = batch.len();
        Ok((
            Tensor::new(input, [batch_size, channels, self.input_frames, height, width])?,
            Tensor::new(label, [batch_size, channels, self.label_frames, height, width])?,
        ))
    }
}

/// Loader over a split of [`MovingMnist`].
pub type VideoLoader<T> = DataLoader<Subset<MovingMnist>, Tensor<u8, 4>, WindowCollate<T>>;

/// Train, validation and test loaders over one random split of the videos.
pub struct MovingMnistDataLoaders<T: FloatElem> {
    pub train: VideoLoader<T>,
    pub validation: VideoLoader<T>,
    pub test: VideoLoader<T>,
}

impl<T: FloatElem> MovingMnistDataLoaders<T> {
    /// Splits `dataset` by `config.split_ratio`.
    ///
    /// The train loader reshuffles every pass with `config.train_batch_size`; validation and
    /// test iterate in order, one video per batch. `seed` fixes both the split and the shuffles.
    pub fn new(dataset: MovingMnist, config: &DataConfig, seed: u64) -> Result<Self> {
        if config.train_batch_size == 0 {
            return Err(Error::Dataset("train_batch_size must be positive".into()));
        }
        let window = config.input_frames + config.label_frames;
        if window > dataset.seq_len() {
            return Err(Error::Dataset(format!(
                "input_frames + label_frames = {} exceeds the {} frames per video",
                window,
                dataset.seq_len()
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut parts = random_split(dataset, &config.split_ratio, &mut rng)?.into_iter();
        let (Some(train), Some(validation), Some(test)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Dataset("split_ratio must have three parts".into()));
        };
        info!(
            train = train.indices().len(),
            validation = validation.indices().len(),
            test = test.indices().len(),
            "split Moving MNIST"
        );

        let collate = || WindowCollate::new(config.input_frames, config.label_frames);
        Ok(Self {
            train: DataLoader::new(train, config.train_batch_size, collate())
                .with_sampler(RandomSampler::seeded(seed)),
            validation: DataLoader::new(validation, 1, collate()),
            test: DataLoader::new(test, 1, collate()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 20 frames of 10 videos, 4x4 pixels. Pixel value = frame * 10 + video.
    fn tiny() -> MovingMnist {
        let shape = [20, 10, 4, 4];
        let mut data = Vec::new();
        for t in 0..20u8 {
            for v in 0..10u8 {
                data.extend(std::iter::repeat_n(t * 10 + v, 16));
            }
        }
        MovingMnist::from_frames(data, shape).unwrap()
    }

    #[test]
    fn test_get_gathers_one_video() {
        let dataset = tiny();
        assert_eq!(dataset.len(), 10);
        assert_eq!(dataset.seq_len(), 20);
        assert_eq!(dataset.frame_size(), [4, 4]);

        let video = dataset.get(3);
        assert_eq!(video.shape(), &[20, 1, 4, 4]);
        assert_eq!(video.data()[0], 3);
        assert_eq!(video.data()[16 * 5], 53);
    }

    #[test]
    fn test_from_frames_checks_size() {
        assert!(MovingMnist::from_frames(vec![0; 10], [2, 2, 2, 2]).is_err());
    }

    #[test]
    fn test_window_collate() {
        let dataset = tiny();
        let collate = WindowCollate::<f32>::new(10, 10);
        let (input, label) = collate.collate(vec![dataset.get(0), dataset.get(1)]).unwrap();

        assert_eq!(input.shape(), &[2, 1, 10, 4, 4]);
        assert_eq!(label.shape(), &[2, 1, 10, 4, 4]);
        // second video, first input frame
        assert!((input.data()[10 * 16] - 1.0 / 255.0).abs() < 1e-7);
        // first video, first label frame is frame 10
        assert!((label.data()[0] - 100.0 / 255.0).abs() < 1e-7);
        assert!(input.data().iter().chain(label.data()).all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn test_window_collate_rejects_short_videos_and_empty_batches() {
        let dataset = tiny();
        let collate = WindowCollate::<f64>::new(15, 10);
        assert!(collate.collate(vec![dataset.get(0)]).is_err());
        assert!(WindowCollate::<f64>::new(1, 1).collate(Vec::new()).is_err());
    }

    #[test]
    fn test_loaders_batch_counts() {
        let config = DataConfig {
            train_batch_size: 2,
            ..DataConfig::default()
        };
        let loaders = MovingMnistDataLoaders::<f32>::new(tiny(), &config, 0).unwrap();

        assert_eq!(loaders.train.len(), 4);
        assert_eq!(loaders.validation.len(), 2);
        assert_eq!(loaders.test.len(), 1);

        let (input, label) = loaders.train.iter().next().unwrap().unwrap();
        assert_eq!(input.shape()[2], config.input_frames);
        assert_eq!(label.shape()[2], config.label_frames);
        assert_eq!(loaders.train.iter().count(), 4);
    }

    #[test]
    fn test_loaders_reject_oversized_window() {
        let config = DataConfig {
            input_frames: 15,
            label_frames: 10,
            ..DataConfig::default()
        };
        assert!(MovingMnistDataLoaders::<f32>::new(tiny(), &config, 0).is_err());
    }

    #[test]
    fn test_loaders_reject_zero_batch_size() {
        let config = DataConfig {
            train_batch_size: 0,
            ..DataConfig::default()
        };
        assert!(matches!(
            MovingMnistDataLoaders::<f32>::new(tiny(), &config, 0),
            Err(Error::Dataset(_))
        ));
    }
}
