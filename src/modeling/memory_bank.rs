use candle_core::Tensor;

use crate::error::{Error, Result};

/// One retained observation: the key/value embeddings of a past frame.
#[derive(Debug, Clone)]
pub struct MemorySlot {
    pub time: usize,
    pub key: Tensor,
    pub value: Tensor,
}

/// Per-video space-time memory.
///
/// A fixed-capacity arena of `(time, key, value)` slots in strict temporal
/// order. Once full, the oldest non-anchor slot is evicted so the anchor
/// observation is retained for the whole video. Ownership is exclusive to
/// one video's processing context; `reset` must run before the bank is
/// reused for another video.
#[derive(Debug)]
pub struct MemoryBank {
    slots: Vec<MemorySlot>,
    capacity: usize,
}

impl MemoryBank {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    /// Drop every slot. Called at the start of each video.
    pub fn reset(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Append a `(key, value)` pair observed at `time`.
    ///
    /// Keys are `(keydim, H, W)`, values `(valdim, H, W)` on the same grid.
    /// Appends must arrive in increasing time order; at capacity the oldest
    /// non-anchor slot (index 1) is evicted first.
    pub fn append(&mut self, key: Tensor, value: Tensor, time: usize) -> Result<()> {
        let kd = key.dims();
        let vd = value.dims();
        if kd.len() != 3 || vd.len() != 3 {
            return Err(Error::shape(format!(
                "memory slot embeddings must be (C, H, W), got key {kd:?} value {vd:?}"
            )));
        }
        if kd[1..] != vd[1..] {
            return Err(Error::shape(format!(
                "key grid {:?} does not match value grid {:?}",
                &kd[1..],
                &vd[1..]
            )));
        }
        if let Some(last) = self.slots.last() {
            if time <= last.time {
                return Err(Error::shape(format!(
                    "append at time {time} after slot at time {}",
                    last.time
                )));
            }
            let first = &self.slots[0];
            if first.key.dims() != kd || first.value.dims() != vd {
                return Err(Error::shape(format!(
                    "slot shape {kd:?}/{vd:?} differs from bank {:?}/{:?}",
                    first.key.dims(),
                    first.value.dims()
                )));
            }
        }

        if self.slots.len() == self.capacity {
            self.slots.remove(1);
        }
        self.slots.push(MemorySlot { time, key, value });
        Ok(())
    }

    /// Concatenate every retained slot along a new leading time axis:
    /// keys `(T, keydim, H, W)` and values `(T, valdim, H, W)`.
    ///
    /// Querying an empty bank is invalid; the first propagation step always
    /// memorizes the anchor before any readout.
    pub fn snapshot(&self) -> Result<(Tensor, Tensor)> {
        if self.slots.is_empty() {
            return Err(Error::shape("snapshot of an empty memory bank"));
        }
        let keys: Vec<&Tensor> = self.slots.iter().map(|s| &s.key).collect();
        let values: Vec<&Tensor> = self.slots.iter().map(|s| &s.value).collect();
        let keys = Tensor::stack(&keys, 0)?;
        let values = Tensor::stack(&values, 0)?;
        Ok((keys, values))
    }

    /// Times of the retained slots, oldest first.
    pub fn times(&self) -> Vec<usize> {
        self.slots.iter().map(|s| s.time).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn slot(fill: f32) -> (Tensor, Tensor) {
        let dev = Device::Cpu;
        let key = Tensor::full(fill, (2, 3, 3), &dev).unwrap();
        let value = Tensor::full(fill, (4, 3, 3), &dev).unwrap();
        (key, value)
    }

    #[test]
    fn append_snapshot_reset() {
        let mut bank = MemoryBank::new(8);
        for t in 0..3 {
            let (k, v) = slot(t as f32);
            bank.append(k, v, t).unwrap();
        }
        let (keys, values) = bank.snapshot().unwrap();
        assert_eq!(keys.dims(), &[3, 2, 3, 3]);
        assert_eq!(values.dims(), &[3, 4, 3, 3]);

        bank.reset();
        assert_eq!(bank.len(), 0);
        assert!(bank.snapshot().is_err());
    }

    #[test]
    fn out_of_order_append_is_rejected() {
        let mut bank = MemoryBank::new(8);
        let (k, v) = slot(0.0);
        bank.append(k, v, 5).unwrap();
        let (k, v) = slot(1.0);
        assert!(matches!(bank.append(k, v, 5), Err(Error::Shape(_))));
    }

    #[test]
    fn eviction_keeps_anchor_and_recency() {
        let mut bank = MemoryBank::new(3);
        for t in 0..5 {
            let (k, v) = slot(t as f32);
            bank.append(k, v, t).unwrap();
        }
        // anchor (t=0) plus the two most recent slots survive
        assert_eq!(bank.times(), vec![0, 3, 4]);
    }

    #[test]
    fn mismatched_grid_is_a_shape_error() {
        let dev = Device::Cpu;
        let mut bank = MemoryBank::new(4);
        let (k, v) = slot(0.0);
        bank.append(k, v, 0).unwrap();

        let key = Tensor::zeros((2, 4, 4), candle_core::DType::F32, &dev).unwrap();
        let value = Tensor::zeros((4, 4, 4), candle_core::DType::F32, &dev).unwrap();
        assert!(matches!(bank.append(key, value, 1), Err(Error::Shape(_))));
    }
}
