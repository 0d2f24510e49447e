use candle_core::Tensor;

use crate::config::MAX_TRAINING_OBJ;
use crate::error::{Error, Result};

/// Validated object counter for one video.
///
/// Every decode and loss call reads the count from here instead of carrying
/// its own copy; the upper bound is enforced at this boundary once. The
/// count can only grow (re-annotation introduces objects, nothing removes
/// them) and is floored at 1 so nominally-empty records never divide by zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectCount {
    current: usize,
    max_obj: usize,
}

impl ObjectCount {
    pub fn init(no: usize, max_obj: usize) -> Result<Self> {
        if max_obj == 0 || max_obj > MAX_TRAINING_OBJ {
            return Err(Error::config(format!(
                "max_obj {max_obj} outside [1, {MAX_TRAINING_OBJ}]"
            )));
        }
        if no == 0 {
            return Err(Error::data("clip with zero valid objects"));
        }
        Ok(Self {
            current: no.min(max_obj),
            max_obj,
        })
    }

    /// Active object count, clamped to the configured maximum.
    pub fn get(&self) -> usize {
        self.current.min(self.max_obj).max(1)
    }

    /// Mask/logit channel count at the current step: objects plus background.
    pub fn channels(&self) -> usize {
        self.get() + 1
    }

    pub fn max_obj(&self) -> usize {
        self.max_obj
    }

    /// Grow the count to the highest nonempty object channel of `mask`,
    /// shape `(K, H, W)`. Called on re-annotation; the count never shrinks.
    pub fn absorb(&mut self, mask: &Tensor) -> Result<usize> {
        let label = highest_label(mask)?;
        self.current = self.current.max(label).min(self.max_obj);
        Ok(self.current)
    }
}

/// Highest object channel of `mask` with any positive pixel; 0 when every
/// foreground channel is empty.
pub fn highest_label(mask: &Tensor) -> Result<usize> {
    let dims = mask.dims();
    if dims.len() != 3 {
        return Err(Error::shape(format!(
            "expected (K, H, W) mask, got {dims:?}"
        )));
    }
    let mut highest = 0usize;
    for c in 1..dims[0] {
        let total = mask.get(c)?.sum_all()?.to_scalar::<f32>()?;
        if total > 0.0 {
            highest = c;
        }
    }
    Ok(highest)
}

/// Count objects in an anchor annotation the way the data pipeline does:
/// consecutive nonempty channels starting at 1, stopping at the first gap.
pub fn count_anchor_objects(mask: &Tensor) -> Result<usize> {
    let dims = mask.dims();
    if dims.len() != 3 {
        return Err(Error::shape(format!(
            "expected (K, H, W) mask, got {dims:?}"
        )));
    }
    let mut count = 0usize;
    for c in 1..dims[0].min(MAX_TRAINING_OBJ + 1) {
        let total = mask.get(c)?.sum_all()?.to_scalar::<f32>()?;
        if total > 0.0 {
            count += 1;
        } else {
            break;
        }
    }
    Ok(count)
}
