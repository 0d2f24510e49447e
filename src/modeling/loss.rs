use candle_core::Tensor;

use crate::config::LossKind;
use crate::error::{Error, Result};
use crate::modeling::object_count::ObjectCount;

/// Fraction of hardest pixels kept by the bootstrapped cross entropy.
const BOOTSTRAP_RATIO: f64 = 0.4;
const PROB_EPS: f64 = 1e-7;

/// Channel-clamped views of a prediction/target pair: both restricted to the
/// active `No + 1` channels. Channels beyond the count are excluded here and
/// nowhere else, so every loss reads the same boundary.
fn clamp_channels(
    pred: &Tensor,
    target: &Tensor,
    no: &ObjectCount,
) -> Result<(Tensor, Tensor)> {
    let pd = pred.dims();
    let td = target.dims();
    if pd.len() != 3 || td.len() != 3 || pd[1..] != td[1..] {
        return Err(Error::shape(format!(
            "criterion expects matching (K, H, W) pair, got {pd:?} and {td:?}"
        )));
    }
    let k = no.channels();
    if pd[0] < k || td[0] < k {
        return Err(Error::shape(format!(
            "{} channels required for {} objects, got pred {} target {}",
            k,
            no.get(),
            pd[0],
            td[0]
        )));
    }
    Ok((pred.narrow(0, 0, k)?, target.narrow(0, 0, k)?))
}

/// Bootstrapped cross entropy on probability maps: per-pixel CE against the
/// one-hot target, averaged over the hardest `BOOTSTRAP_RATIO` of pixels.
pub fn cross_entropy_loss(pred: &Tensor, target: &Tensor, no: &ObjectCount) -> Result<Tensor> {
    let (pred, target) = clamp_channels(pred, target, no)?;
    let (_, h, w) = pred.dims3()?;

    let logp = pred.clamp(PROB_EPS, 1.0)?.log()?;
    let pixel_ce = (target * logp)?.sum(0)?.neg()?;

    let flat = pixel_ce.reshape((1, h * w))?;
    let order = flat.arg_sort_last_dim(false)?;
    let kept = ((h * w) as f64 * BOOTSTRAP_RATIO).max(1.0) as usize;
    let hardest = flat.gather(&order.narrow(1, 0, kept)?, 1)?;
    Ok(hardest.mean_all()?)
}

/// Soft IoU over the object channels (background excluded).
pub fn mask_iou_loss(pred: &Tensor, target: &Tensor, no: &ObjectCount) -> Result<Tensor> {
    let (pred, target) = clamp_channels(pred, target, no)?;
    let objects = pred.narrow(0, 1, no.get())?;
    let target = target.narrow(0, 1, no.get())?;

    let inter = objects.minimum(&target)?.sum((1, 2))?;
    let union = objects.maximum(&target)?.sum((1, 2))?;
    let iou = inter.broadcast_div(&union.clamp(1e-6, f64::INFINITY)?)?;
    let loss = iou.mean_all()?.affine(-1.0, 1.0)?;
    Ok(loss)
}

/// Training criterion, resolved once at startup from the configured name.
#[derive(Debug, Clone, Copy)]
pub struct Criterion {
    kind: LossKind,
}

impl Criterion {
    pub fn new(kind: LossKind) -> Self {
        Self { kind }
    }

    pub fn eval(&self, pred: &Tensor, target: &Tensor, no: &ObjectCount) -> Result<Tensor> {
        match self.kind {
            LossKind::Ce => cross_entropy_loss(pred, target, no),
            LossKind::Iou => mask_iou_loss(pred, target, no),
            LossKind::Both => {
                let ce = cross_entropy_loss(pred, target, no)?;
                let iou = mask_iou_loss(pred, target, no)?;
                Ok((ce + iou)?)
            }
        }
    }
}
