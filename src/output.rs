use std::path::{Path, PathBuf};

use candle_core::Tensor;
use image::{Rgb, RgbImage};
use tracing::debug;

use crate::config::Opts;
use crate::dataset::SampleInfo;
use crate::error::Result;
use crate::modeling::interpolation::resize_bilinear;

/// Indexed color for a label, per the palette the VOS benchmarks share:
/// every RGB bit plane is filled from the label's bits, three at a time.
pub fn palette_color(index: usize) -> [u8; 3] {
    let mut rgb = [0u8; 3];
    let mut id = index;
    let mut shift = 7i32;
    while id > 0 && shift >= 0 {
        for (c, channel) in rgb.iter_mut().enumerate() {
            *channel |= (((id >> c) & 1) as u8) << shift;
        }
        id >>= 3;
        shift -= 1;
    }
    rgb
}

/// Persist a video's predicted mask sequence as one indexed-color image per
/// frame under `results/<dataset>/<video>/`.
///
/// Masks arrive as `(K, H, W)` probability maps; when `source_size` is
/// given they are resampled to it before the argmax so the written frames
/// match the source video resolution.
pub fn write_mask(
    masks: &[Tensor],
    info: &SampleInfo,
    opts: &Opts,
    source_size: Option<(usize, usize)>,
) -> Result<PathBuf> {
    let dir = Path::new(&opts.results).join(&opts.valset).join(&info.name);
    std::fs::create_dir_all(&dir)?;

    for (t, mask) in masks.iter().enumerate() {
        let mask = match source_size {
            Some((h, w)) => resize_bilinear(mask, h, w)?,
            None => mask.clone(),
        };
        let labels = mask.argmax(0)?;
        let (h, w) = labels.dims2()?;
        let flat = labels.flatten_all()?.to_vec1::<u32>()?;

        let mut img = RgbImage::new(w as u32, h as u32);
        for (pos, &label) in flat.iter().enumerate() {
            let [r, g, b] = palette_color(label as usize);
            img.put_pixel((pos % w) as u32, (pos / w) as u32, Rgb([r, g, b]));
        }
        img.save(dir.join(format!("{t:05}.png")))?;
    }

    debug!(video = %info.name, frames = masks.len(), "predictions written");
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn palette_matches_the_benchmark_colors() {
        assert_eq!(palette_color(0), [0, 0, 0]);
        assert_eq!(palette_color(1), [128, 0, 0]);
        assert_eq!(palette_color(2), [0, 128, 0]);
        assert_eq!(palette_color(3), [128, 128, 0]);
        assert_eq!(palette_color(4), [0, 0, 128]);
    }

    #[test]
    fn frames_land_under_dataset_and_video_name() {
        let dev = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let mut opts = Opts::default();
        opts.results = dir.path().to_string_lossy().into_owned();
        opts.valset = "unit".into();

        let info = SampleInfo {
            name: "clip".into(),
            annotated_frames: vec![0],
        };
        // object 1 wins everywhere
        let mut data = vec![0f32; 2 * 4 * 4];
        data[16..].iter_mut().for_each(|v| *v = 1.0);
        let mask = Tensor::from_vec(data, (2, 4, 4), &dev).unwrap();

        let out = write_mask(&[mask.clone(), mask], &info, &opts, Some((8, 8))).unwrap();
        assert!(out.join("00000.png").is_file());
        assert!(out.join("00001.png").is_file());

        let img = image::open(out.join("00001.png")).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (8, 8));
        assert_eq!(img.get_pixel(0, 0).0, [128, 0, 0]);
    }
}
