use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hard ceiling on foreground objects per clip, background excluded.
pub const MAX_TRAINING_OBJ: usize = 6;

/// Training criterion selector. Unknown names abort before training starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    Ce,
    Iou,
    Both,
}

impl LossKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "ce" => Ok(LossKind::Ce),
            "iou" => Ok(LossKind::Iou),
            "both" => Ok(LossKind::Both),
            other => Err(Error::config(format!("unknown training loss {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    Sgd,
    Adam,
}

impl SolverKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "sgd" => Ok(SolverKind::Sgd),
            "adam" => Ok(SolverKind::Adam),
            other => Err(Error::config(format!("unknown solver type {other}"))),
        }
    }
}

/// Mask-source policy while training.
///
/// `Mask` feeds ground truth at every step, `Recurrent` feeds the previous
/// prediction, `Threshold` trusts the prediction only when its IoU against
/// the previous ground truth clears `iou_threshold`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainMode {
    Mask,
    Recurrent,
    Threshold,
}

/// Per-dataset frame-gap curriculum. A single training set carries a scalar
/// schedule, a concatenation of sets carries one entry per member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxSkip {
    Scalar(usize),
    PerDataset(Vec<usize>),
}

impl MaxSkip {
    pub fn as_vec(&self) -> Vec<usize> {
        match self {
            MaxSkip::Scalar(v) => vec![*v],
            MaxSkip::PerDataset(v) => v.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Opts {
    // data
    pub trainset: Vec<String>,
    pub valset: String,
    pub datafreq: Vec<usize>,
    pub input_size: (usize, usize),
    pub sampled_frames: usize,
    pub max_skip: MaxSkip,
    pub samples_per_video: usize,

    // model
    pub keydim: usize,
    pub valdim: usize,
    pub save_freq: usize,
    pub memory_capacity: usize,
    pub epochs_per_increment: usize,

    // training
    pub epochs: usize,
    pub train_batch: usize,
    pub learning_rate: f64,
    pub gamma: f64,
    pub momentum: (f64, f64),
    pub solver: SolverKind,
    pub weight_decay: f64,
    pub iter_size: usize,
    pub milestone: Vec<usize>,
    pub loss: LossKind,
    pub mode: TrainMode,
    pub iou_threshold: f32,
    pub save_model_freq: usize,

    // testing
    pub results: String,

    // bookkeeping
    pub checkpoint: String,
    pub initial: String,
    pub resume: String,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            trainset: vec!["DAVIS17".into(), "VOS".into()],
            valset: "DAVIS17".into(),
            datafreq: vec![5, 1],
            input_size: (240, 427),
            sampled_frames: 3,
            max_skip: MaxSkip::PerDataset(vec![5, 3]),
            samples_per_video: 2,

            keydim: 128,
            valdim: 512,
            save_freq: 5,
            memory_capacity: 20,
            epochs_per_increment: 5,

            epochs: 130,
            train_batch: 8,
            learning_rate: 1e-5,
            gamma: 0.1,
            momentum: (0.9, 0.999),
            solver: SolverKind::Adam,
            weight_decay: 5e-4,
            iter_size: 1,
            milestone: vec![],
            loss: LossKind::Both,
            mode: TrainMode::Recurrent,
            iou_threshold: 0.65,
            save_model_freq: 5,

            results: "output/results".into(),
            checkpoint: "output/models".into(),
            initial: String::new(),
            resume: String::new(),
        }
    }
}

impl Opts {
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let opts: Opts = serde_json::from_str(&text)?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sampled_frames < 2 {
            return Err(Error::config("sampled_frames must be at least 2"));
        }
        if self.trainset.len() != self.datafreq.len() {
            return Err(Error::config("datafreq length must match trainset"));
        }
        if self.iter_size == 0 {
            return Err(Error::config("iter_size must be positive"));
        }
        if self.save_freq == 0 || self.memory_capacity < 2 {
            return Err(Error::config(
                "save_freq must be positive and memory_capacity at least 2",
            ));
        }
        Ok(())
    }
}
