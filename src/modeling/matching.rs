use candle_core::Tensor;
use candle_nn::ops::softmax;

use crate::error::{Error, Result};

/// Content-addressable readout of a space-time memory.
///
/// Each query pixel is matched against every (slot, position) memory key by
/// scaled dot product; the scores are normalized with a softmax over the
/// flattened time x space axis and used to aggregate memory values into one
/// feature vector per query pixel. Matching is global: no locality window.
#[derive(Debug, Clone)]
pub struct MatchingReadout {
    keydim: usize,
    scale: f64,
}

impl MatchingReadout {
    pub fn new(keydim: usize) -> Self {
        Self {
            keydim,
            scale: 1.0 / (keydim as f64).sqrt(),
        }
    }

    pub fn keydim(&self) -> usize {
        self.keydim
    }

    /// Attend `query_key` `(keydim, Hq, Wq)` over memory keys
    /// `(T, keydim, Hm, Wm)` and aggregate memory values `(T, valdim, Hm, Wm)`
    /// into `(valdim, Hq, Wq)`.
    pub fn forward(
        &self,
        query_key: &Tensor,
        mem_keys: &Tensor,
        mem_values: &Tensor,
    ) -> Result<Tensor> {
        let qd = query_key.dims();
        let kd = mem_keys.dims();
        let vd = mem_values.dims();
        if qd.len() != 3 || kd.len() != 4 || vd.len() != 4 {
            return Err(Error::shape(format!(
                "readout expects query (C,H,W) and memory (T,C,H,W), got {qd:?} {kd:?} {vd:?}"
            )));
        }
        if qd[0] != self.keydim || kd[1] != self.keydim {
            return Err(Error::shape(format!(
                "key dim mismatch: query {}, memory {}, configured {}",
                qd[0], kd[1], self.keydim
            )));
        }
        if kd[0] != vd[0] || kd[2..] != vd[2..] {
            return Err(Error::shape(format!(
                "memory keys {kd:?} and values {vd:?} disagree"
            )));
        }

        let (t, ck, hm, wm) = (kd[0], kd[1], kd[2], kd[3]);
        let (cv, hq, wq) = (vd[1], qd[1], qd[2]);

        // (T*Hm*Wm, Ck) x (Ck, Hq*Wq) -> joint-axis affinity per query pixel
        let keys = mem_keys
            .permute((0, 2, 3, 1))?
            .contiguous()?
            .reshape((t * hm * wm, ck))?;
        let query = query_key.contiguous()?.reshape((ck, hq * wq))?;
        let affinity = (keys.matmul(&query)? * self.scale)?;
        let weights = softmax(&affinity, 0)?;

        let values = mem_values
            .permute((1, 0, 2, 3))?
            .contiguous()?
            .reshape((cv, t * hm * wm))?;
        let readout = values.matmul(&weights)?.reshape((cv, hq, wq))?;
        Ok(readout)
    }
}
