use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use tracing::warn;

use crate::config::MaxSkip;
use crate::error::{Error, Result};

/// Scalar state stored next to the weights, as `meta.*` tensors in the same
/// safetensors file.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub loss: f32,
    pub minloss: f32,
    pub learning_rate: f64,
    pub max_skip: MaxSkip,
}

const META_EPOCH: &str = "meta.epoch";
const META_LOSS: &str = "meta.loss";
const META_MINLOSS: &str = "meta.minloss";
const META_LR: &str = "meta.learning_rate";
const META_MAX_SKIP: &str = "meta.max_skip";

macro_rules! require_scalar {
    ($ty:ty, $tensors:expr, $key:expr) => {
        $tensors
            .get($key)
            .ok_or_else(|| Error::config(format!("checkpoint missing {}", $key)))?
            .to_scalar::<$ty>()?
    };
}

/// Write weights and metadata. Weights are moved to the CPU first so the
/// file is device-independent.
pub fn save<P: AsRef<Path>>(path: P, varmap: &VarMap, meta: &CheckpointMeta) -> Result<()> {
    let device = Device::Cpu;
    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    {
        let data = varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            tensors.insert(name.clone(), var.as_tensor().to_device(&device)?);
        }
    }
    tensors.insert(META_EPOCH.to_string(), Tensor::new(meta.epoch as i64, &device)?);
    tensors.insert(META_LOSS.to_string(), Tensor::new(meta.loss, &device)?);
    tensors.insert(META_MINLOSS.to_string(), Tensor::new(meta.minloss, &device)?);
    tensors.insert(
        META_LR.to_string(),
        Tensor::new(meta.learning_rate, &device)?,
    );
    let skip_tensor = match &meta.max_skip {
        MaxSkip::Scalar(v) => Tensor::new(*v as i64, &device)?,
        MaxSkip::PerDataset(values) => {
            let values: Vec<i64> = values.iter().map(|&v| v as i64).collect();
            Tensor::new(values, &device)?
        }
    };
    tensors.insert(META_MAX_SKIP.to_string(), skip_tensor);

    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

fn read_max_skip(tensors: &HashMap<String, Tensor>) -> Result<MaxSkip> {
    let tensor = tensors
        .get(META_MAX_SKIP)
        .ok_or_else(|| Error::config(format!("checkpoint missing {META_MAX_SKIP}")))?;
    match tensor.rank() {
        0 => Ok(MaxSkip::Scalar(tensor.to_scalar::<i64>()? as usize)),
        1 => Ok(MaxSkip::PerDataset(
            tensor
                .to_vec1::<i64>()?
                .into_iter()
                .map(|v| v as usize)
                .collect(),
        )),
        r => Err(Error::shape(format!("max_skip tensor of rank {r}"))),
    }
}

/// Restore weights into `varmap` and return the stored metadata.
///
/// Weights and the scalar training state are required; a malformed or
/// missing `max_skip` only degrades to `default_skip` with a warning, so a
/// checkpoint written against a different dataset layout still resumes.
pub fn load<P: AsRef<Path>>(
    path: P,
    varmap: &VarMap,
    device: &Device,
    default_skip: &MaxSkip,
) -> Result<CheckpointMeta> {
    let mut varmap = varmap.clone();
    varmap.load(path.as_ref())?;

    let tensors = candle_core::safetensors::load(path.as_ref(), device)?;
    let epoch = require_scalar!(i64, tensors, META_EPOCH) as usize;
    let loss = require_scalar!(f32, tensors, META_LOSS);
    let minloss = require_scalar!(f32, tensors, META_MINLOSS);
    let learning_rate = require_scalar!(f64, tensors, META_LR);

    let max_skip = match read_max_skip(&tensors) {
        Ok(skip) => skip,
        Err(e) => {
            warn!("initializing max skip failed ({e}); keeping configured schedule");
            default_skip.clone()
        }
    };

    Ok(CheckpointMeta {
        epoch,
        loss,
        minloss,
        learning_rate,
        max_skip,
    })
}
