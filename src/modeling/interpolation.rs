use candle_core::Tensor;
use ndarray::Array3;

use crate::error::{Error, Result};

/// Bilinear resampling of a `(C, H, W)` map on the CPU, align_corners=false.
///
/// Used to bring probability maps back to the source video resolution
/// before the argmax; label maps must not pass through here (interpolated
/// labels are meaningless — resize the probabilities, then argmax).
pub fn resize_bilinear(input: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let dims = input.dims();
    if dims.len() != 3 {
        return Err(Error::shape(format!(
            "resize_bilinear expects (C, H, W), got {dims:?}"
        )));
    }
    let (channels, in_h, in_w) = (dims[0], dims[1], dims[2]);
    if in_h == out_h && in_w == out_w {
        return Ok(input.clone());
    }

    let data = input.flatten_all()?.to_vec1::<f32>()?;
    let source = Array3::from_shape_vec((channels, in_h, in_w), data)
        .map_err(|e| Error::shape(format!("tensor to ndarray failed: {e}")))?;

    let scale_h = in_h as f32 / out_h as f32;
    let scale_w = in_w as f32 / out_w as f32;
    let mut resized = Array3::<f32>::zeros((channels, out_h, out_w));
    resized.indexed_iter_mut().for_each(|((c, y, x), val)| {
        let y_in = ((y as f32 + 0.5) * scale_h - 0.5).clamp(0.0, (in_h - 1) as f32);
        let x_in = ((x as f32 + 0.5) * scale_w - 0.5).clamp(0.0, (in_w - 1) as f32);
        let y0 = y_in.floor() as usize;
        let x0 = x_in.floor() as usize;
        let y1 = (y0 + 1).min(in_h - 1);
        let x1 = (x0 + 1).min(in_w - 1);
        let dy = y_in - y0 as f32;
        let dx = x_in - x0 as f32;
        *val = (1.0 - dx) * (1.0 - dy) * source[[c, y0, x0]]
            + dx * (1.0 - dy) * source[[c, y0, x1]]
            + (1.0 - dx) * dy * source[[c, y1, x0]]
            + dx * dy * source[[c, y1, x1]];
    });

    let flat: Vec<f32> = resized.into_iter().collect();
    Ok(Tensor::from_vec(
        flat,
        (channels, out_h, out_w),
        input.device(),
    )?)
}
