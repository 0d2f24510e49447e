use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module, VarBuilder, VarMap};

use crate::error::{Error, Result};
use crate::modeling::encoder::{FrameEncoder, MaskDecoder, QueryEmbedding, TrainableModel};
use crate::modeling::object_count::ObjectCount;

/// Minimal stand-in for the external encoder/decoder networks: three
/// per-pixel linear projections working at the input grid, no downsampling.
/// Deterministic given its parameters, differentiable, and small enough for
/// CPU tests and demos; not a segmentation model anyone should train for
/// real.
pub struct ToyPropagationModel {
    key_proj: Linear,
    value_proj: Linear,
    decode_proj: Linear,
    keydim: usize,
    valdim: usize,
    max_obj: usize,
    varmap: VarMap,
}

const FRAME_CHANNELS: usize = 3;

impl ToyPropagationModel {
    pub fn new(
        varmap: &VarMap,
        device: &Device,
        keydim: usize,
        valdim: usize,
        max_obj: usize,
    ) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let key_proj = candle_nn::linear(FRAME_CHANNELS, keydim, vb.pp("key_proj"))?;
        let value_proj = candle_nn::linear(
            FRAME_CHANNELS + max_obj + 1,
            valdim,
            vb.pp("value_proj"),
        )?;
        let decode_proj = candle_nn::linear(
            valdim + FRAME_CHANNELS,
            max_obj + 1,
            vb.pp("decode_proj"),
        )?;
        Ok(Self {
            key_proj,
            value_proj,
            decode_proj,
            keydim,
            valdim,
            max_obj,
            varmap: varmap.clone(),
        })
    }

    /// Apply a linear layer independently at every pixel of a `(C, H, W)` map.
    fn per_pixel(layer: &Linear, input: &Tensor) -> Result<Tensor> {
        let (c, h, w) = input.dims3()?;
        let flat = input.reshape((c, h * w))?.t()?.contiguous()?;
        let out = layer.forward(&flat)?;
        let cout = out.dim(1)?;
        Ok(out.t()?.contiguous()?.reshape((cout, h, w))?)
    }
}

impl FrameEncoder for ToyPropagationModel {
    fn keydim(&self) -> usize {
        self.keydim
    }

    fn valdim(&self) -> usize {
        self.valdim
    }

    fn encode_memory(
        &self,
        frame: &Tensor,
        mask: &Tensor,
        _num_objects: &ObjectCount,
    ) -> Result<(Tensor, Tensor)> {
        let md = mask.dims();
        if md.len() != 3 || md[0] != self.max_obj + 1 {
            return Err(Error::shape(format!(
                "mask source must carry {} channels, got {md:?}",
                self.max_obj + 1
            )));
        }
        let key = Self::per_pixel(&self.key_proj, frame)?;
        let joint = Tensor::cat(&[frame, mask], 0)?;
        let value = Self::per_pixel(&self.value_proj, &joint)?;
        Ok((key, value))
    }

    fn encode_query(&self, frame: &Tensor) -> Result<QueryEmbedding> {
        let key = Self::per_pixel(&self.key_proj, frame)?;
        Ok(QueryEmbedding {
            key,
            feats: frame.clone(),
        })
    }
}

impl MaskDecoder for ToyPropagationModel {
    fn decode(
        &self,
        readout: &Tensor,
        query: &QueryEmbedding,
        num_objects: &ObjectCount,
        max_obj: usize,
    ) -> Result<Tensor> {
        if max_obj != self.max_obj {
            return Err(Error::shape(format!(
                "decoder built for max_obj {}, asked for {max_obj}",
                self.max_obj
            )));
        }
        let joint = Tensor::cat(&[readout, &query.feats], 0)?;
        let logits = Self::per_pixel(&self.decode_proj, &joint)?;
        logits.narrow(0, 0, num_objects.channels()).map_err(Into::into)
    }
}

impl TrainableModel for ToyPropagationModel {
    fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeddings_carry_the_declared_dims() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let model = ToyPropagationModel::new(&varmap, &dev, 8, 16, 2).unwrap();
        let no = ObjectCount::init(2, 2).unwrap();

        let frame = Tensor::rand(0f32, 1.0, (3, 6, 6), &dev).unwrap();
        let mask = Tensor::zeros((3, 6, 6), DType::F32, &dev).unwrap();

        let (key, value) = model.encode_memory(&frame, &mask, &no).unwrap();
        assert_eq!(key.dims(), &[8, 6, 6]);
        assert_eq!(value.dims(), &[16, 6, 6]);

        let query = model.encode_query(&frame).unwrap();
        assert_eq!(query.key.dims(), &[8, 6, 6]);
        assert!(!model.trainable_vars().is_empty());
    }
}
