use candle_core::{Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use ndarray::prelude::*;
use ndarray::Axis;

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod eval;
pub mod modeling;
pub mod output;
pub mod propagation;
pub mod trainer;

pub use config::{LossKind, MaxSkip, Opts, SolverKind, TrainMode, MAX_TRAINING_OBJ};
pub use error::{Error, Result};

pub const IMAGE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGE_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode an image into a normalized `(3, H, W)` frame tensor, resized to
/// `target_size = (height, width)` with bilinear filtering.
pub fn preprocess_frame(
    img: &DynamicImage,
    target_size: (usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let (h, w) = target_size;
    let resized = img.resize_exact(w as u32, h as u32, FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let mut array = Array3::<f32>::zeros((3, h, w));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        array[[0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        array[[1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
        array[[2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
    }
    for channel in 0..3 {
        let mut view = array.index_axis_mut(Axis(0), channel);
        view.mapv_inplace(|v| (v - IMAGE_MEAN[channel]) / IMAGE_STD[channel]);
    }

    let data: Vec<f32> = array.into_iter().collect();
    Ok(Tensor::from_vec(data, (3, h, w), device)?)
}

/// One-hot a `(H, W)` label map into a `(channels, H, W)` mask tensor with
/// the background occupying channel 0. Labels at or above `channels` are
/// treated as background.
pub fn mask_from_labels(
    labels: &[u8],
    h: usize,
    w: usize,
    channels: usize,
    device: &Device,
) -> Result<Tensor> {
    if labels.len() != h * w || channels < 2 {
        return Err(Error::shape(format!(
            "label map {h}x{w} with {channels} channels cannot be one-hot encoded"
        )));
    }
    let mut data = vec![0f32; channels * h * w];
    for (pos, &label) in labels.iter().enumerate() {
        let c = if (label as usize) < channels {
            label as usize
        } else {
            0
        };
        data[c * h * w + pos] = 1.0;
    }
    Ok(Tensor::from_vec(data, (channels, h, w), device)?)
}

/// Pad a `(K, H, W)` mask with zero channels up to `channels`. Predictions
/// carry `No+1` channels while encoders consume the fixed `max_obj+1`
/// layout, so the gap is filled with empty object channels.
pub fn pad_mask_channels(mask: &Tensor, channels: usize) -> Result<Tensor> {
    let dims = mask.dims();
    if dims.len() != 3 {
        return Err(Error::shape(format!("expected (K, H, W) mask, got {dims:?}")));
    }
    let k = dims[0];
    if k > channels {
        return Err(Error::shape(format!(
            "mask has {k} channels, cannot pad down to {channels}"
        )));
    }
    if k == channels {
        return Ok(mask.clone());
    }
    let pad = Tensor::zeros(
        (channels - k, dims[1], dims[2]),
        mask.dtype(),
        mask.device(),
    )?;
    Ok(Tensor::cat(&[mask, &pad], 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_hot_round_trip() {
        let dev = Device::Cpu;
        let labels = vec![0u8, 1, 2, 0];
        let mask = mask_from_labels(&labels, 2, 2, 4, &dev).unwrap();
        assert_eq!(mask.dims(), &[4, 2, 2]);
        // every pixel lands in exactly one channel
        let per_pixel = mask
            .sum(0)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(per_pixel.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn padding_adds_empty_object_channels() {
        let dev = Device::Cpu;
        let mask = mask_from_labels(&[0, 1, 1, 0], 2, 2, 2, &dev).unwrap();
        let padded = pad_mask_channels(&mask, 5).unwrap();
        assert_eq!(padded.dims(), &[5, 2, 2]);
        let extra = padded
            .narrow(0, 2, 3)
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(extra, 0.0);
    }
}
