use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use tracing::{debug, info, warn};

use crate::checkpoint::{self, CheckpointMeta};
use crate::config::{Opts, SolverKind, TrainMode};
use crate::dataset::{SampleProvider, VideoSample};
use crate::error::{Error, Result};
use crate::modeling::encoder::{PropagationModel, TrainableModel};
use crate::modeling::loss::Criterion;
use crate::modeling::object_count::ObjectCount;
use crate::propagation::{MaskPropagationLoop, PropagationConfig};

/// Temporal orientation of one propagation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Anchored at frame 0, predicting frames `1..T`.
    Forward,
    /// Anchored at frame `T-1`, predicting in reverse temporal order.
    Backward,
}

impl Direction {
    pub fn order(&self, len: usize) -> Vec<usize> {
        match self {
            Direction::Forward => (0..len).collect(),
            Direction::Backward => (0..len).rev().collect(),
        }
    }
}

/// Batch-level training losses. `forward` and `backward` are the two pass
/// means; `total` keeps the computation graph for the optimizer step.
pub struct BatchLoss {
    pub forward: f32,
    pub backward: f32,
    pub total: Tensor,
}

/// Bidirectional cycle-consistency objective over short clips.
///
/// One parameterized propagate-and-score procedure runs twice per clip:
/// once forward from the first frame, once backward from the last. The
/// backward pass is scored against the *anchor* (frame 0) ground truth at
/// every step, forcing memory built from the clip's tail to reconstruct the
/// original labeling.
pub struct CycleTrainer {
    criterion: Criterion,
    mode: TrainMode,
    iou_threshold: f32,
    cfg: PropagationConfig,
}

impl CycleTrainer {
    pub fn new(opts: &Opts) -> Self {
        Self {
            criterion: Criterion::new(opts.loss),
            mode: opts.mode,
            iou_threshold: opts.iou_threshold,
            cfg: PropagationConfig::from_opts(opts),
        }
    }

    /// Run one pass over `sample` in the given direction and accumulate the
    /// criterion over its `T-1` predictions. Returns the loss sum and the
    /// number of accumulated terms.
    fn propagate_and_score(
        &self,
        model: &dyn PropagationModel,
        sample: &VideoSample,
        direction: Direction,
    ) -> Result<(Tensor, usize)> {
        let len = sample.frames.len();
        if len < 2 || sample.masks.len() != len {
            return Err(Error::data(
                "training sample needs per-frame masks and at least two frames",
            ));
        }
        let order = direction.order(len);
        let frames: Vec<&Tensor> = order.iter().map(|&i| &sample.frames[i]).collect();
        let masks: Vec<&Tensor> = order.iter().map(|&i| &sample.masks[i]).collect();

        // nominally-empty records count as one object, never zero
        let no = ObjectCount::init(
            sample.num_objects.max(1),
            sample.masks[0].dim(0)? - 1,
        )?;

        let looper = MaskPropagationLoop::new(model, self.cfg);
        let preds =
            looper.propagate_training(&frames, &masks, no.get(), self.mode, self.iou_threshold)?;

        let mut sum: Option<Tensor> = None;
        for (step, pred) in preds.iter().enumerate() {
            let target = match direction {
                Direction::Forward => &sample.masks[step + 1],
                // cross-anchored pairing, kept exactly as the cycle
                // objective defines it
                Direction::Backward => &sample.masks[0],
            };
            let term = self.criterion.eval(pred, target, &no)?;
            sum = Some(match sum {
                Some(s) => (s + term)?,
                None => term,
            });
        }
        let sum = sum.ok_or_else(|| Error::data("clip produced no predictions"))?;
        Ok((sum, len - 1))
    }

    /// Forward and backward losses over a batch of clips, each divided by
    /// exactly `batch * (T-1)` terms; `total = forward + backward`.
    pub fn train_batch(
        &self,
        model: &dyn PropagationModel,
        samples: &[VideoSample],
    ) -> Result<BatchLoss> {
        if samples.is_empty() {
            return Err(Error::data("empty training batch"));
        }
        let mut forward_sum: Option<Tensor> = None;
        let mut backward_sum: Option<Tensor> = None;
        let mut terms = 0usize;
        for sample in samples {
            let (f, n) = self.propagate_and_score(model, sample, Direction::Forward)?;
            let (b, _) = self.propagate_and_score(model, sample, Direction::Backward)?;
            forward_sum = Some(match forward_sum {
                Some(s) => (s + f)?,
                None => f,
            });
            backward_sum = Some(match backward_sum {
                Some(s) => (s + b)?,
                None => b,
            });
            terms += n;
        }
        let denom = terms as f64;
        let forward = (forward_sum.ok_or_else(|| Error::data("no forward terms"))? / denom)?;
        let backward = (backward_sum.ok_or_else(|| Error::data("no backward terms"))? / denom)?;
        let total = (&forward + &backward)?;
        Ok(BatchLoss {
            forward: forward.to_scalar::<f32>()?,
            backward: backward.to_scalar::<f32>()?,
            total,
        })
    }
}

/// Optimizer selected by the configured solver name.
pub enum Solver {
    Sgd(SGD),
    Adam(AdamW),
}

impl Solver {
    pub fn new(kind: SolverKind, vars: Vec<candle_core::Var>, opts: &Opts) -> Result<Self> {
        match kind {
            SolverKind::Sgd => Ok(Solver::Sgd(SGD::new(vars, opts.learning_rate)?)),
            SolverKind::Adam => Ok(Solver::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: opts.learning_rate,
                    beta1: opts.momentum.0,
                    beta2: opts.momentum.1,
                    weight_decay: opts.weight_decay,
                    ..Default::default()
                },
            )?)),
        }
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            Solver::Sgd(o) => o.backward_step(loss)?,
            Solver::Adam(o) => o.backward_step(loss)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Solver::Sgd(o) => o.learning_rate(),
            Solver::Adam(o) => o.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Solver::Sgd(o) => o.set_learning_rate(lr),
            Solver::Adam(o) => o.set_learning_rate(lr),
        }
    }
}

/// Running average of a scalar series.
#[derive(Debug, Default, Clone, Copy)]
pub struct AverageMeter {
    pub val: f32,
    pub sum: f32,
    pub count: usize,
    pub avg: f32,
}

impl AverageMeter {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, val: f32, n: usize) {
        self.val = val;
        self.sum += val * n as f32;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f32;
        }
    }
}

/// Base learning rate decayed by `gamma` at every milestone reached.
pub fn scheduled_learning_rate(opts: &Opts, epoch: usize) -> f64 {
    let passed = opts.milestone.iter().filter(|&&m| m <= epoch).count() as i32;
    opts.learning_rate * opts.gamma.powi(passed)
}

/// One epoch over the provider: batches of `train_batch` clips, losses
/// summed over `iter_size` batches before a single optimizer step. Returns
/// the epoch's running-average loss.
pub fn train_epoch(
    trainer: &CycleTrainer,
    model: &dyn PropagationModel,
    provider: &mut dyn SampleProvider,
    solver: &mut Solver,
    opts: &Opts,
) -> Result<f32> {
    let mut meter = AverageMeter::default();
    let mut batch: Vec<VideoSample> = Vec::with_capacity(opts.train_batch);
    let mut pending: Option<Tensor> = None;
    let mut batch_idx = 0usize;

    let total = provider.len();
    for idx in 0..total {
        match provider.get(idx) {
            Ok(sample) => batch.push(sample),
            Err(Error::Data(msg)) => {
                debug!("skipping sample {idx}: {msg}");
                continue;
            }
            Err(e) => return Err(e),
        }
        if batch.len() < opts.train_batch && idx + 1 < total {
            continue;
        }
        if batch.is_empty() {
            continue;
        }

        let losses = trainer.train_batch(model, &batch)?;
        batch.clear();

        let total_val = losses.total.to_scalar::<f32>()?;
        if total_val > 0.0 {
            meter.update(total_val, 1);
        }

        pending = Some(match pending {
            Some(p) => (p + &losses.total)?,
            None => losses.total,
        });
        batch_idx += 1;
        if batch_idx % opts.iter_size == 0 {
            if let Some(sum) = pending.take() {
                solver.backward_step(&(sum / opts.iter_size as f64)?)?;
            }
        }

        debug!(
            batch = batch_idx,
            loss = total_val,
            avg = meter.avg,
            "train step"
        );
    }
    if let Some(sum) = pending.take() {
        solver.backward_step(&(sum / opts.iter_size as f64)?)?;
    }

    Ok(meter.avg)
}

/// Full training run: resume, LR schedule, epoch loop, max-skip curriculum,
/// periodic and best-model checkpoints. Returns the minimum epoch loss.
pub fn fit<M>(model: &M, provider: &mut dyn SampleProvider, opts: &Opts) -> Result<f32>
where
    M: TrainableModel,
{
    opts.validate()?;
    let trainer = CycleTrainer::new(opts);
    let mut solver = Solver::new(opts.solver, model.trainable_vars(), opts)?;

    let device = model
        .trainable_vars()
        .first()
        .map(|v| v.device().clone())
        .unwrap_or(Device::Cpu);

    let mut start_epoch = 0usize;
    let mut minloss = f32::INFINITY;

    if !opts.resume.is_empty() {
        info!("resuming from checkpoint {}", opts.resume);
        let meta = checkpoint::load(&opts.resume, model.varmap(), &device, &opts.max_skip)?;
        start_epoch = meta.epoch;
        minloss = meta.minloss;
        solver.set_learning_rate(meta.learning_rate);
        provider.set_max_skip(&meta.max_skip);
    } else if !opts.initial.is_empty() {
        info!("initializing model with weight file {}", opts.initial);
        let mut varmap = model.varmap().clone();
        varmap.load(&opts.initial)?;
    }

    std::fs::create_dir_all(&opts.checkpoint)?;

    for epoch in start_epoch..opts.epochs {
        let lr = scheduled_learning_rate(opts, epoch);
        solver.set_learning_rate(lr);
        info!(epoch = epoch + 1, total = opts.epochs, lr, "epoch start");

        let train_loss = train_epoch(&trainer, model, provider, &mut solver, opts)?;
        info!(epoch = epoch + 1, loss = train_loss, "epoch done");

        if (epoch + 1) % opts.epochs_per_increment == 0 {
            provider.increase_max_skip();
            debug!(skip = ?provider.max_skip(), "max skip increased");
        }

        let is_best = train_loss <= minloss;
        minloss = minloss.min(train_loss);
        let meta = CheckpointMeta {
            epoch: epoch + 1,
            loss: train_loss,
            minloss,
            learning_rate: solver.learning_rate(),
            max_skip: provider.max_skip(),
        };
        if (epoch + 1) % opts.save_model_freq == 0 {
            let path = format!("{}/checkpoint_{}.safetensors", opts.checkpoint, epoch + 1);
            checkpoint::save(&path, model.varmap(), &meta)?;
        }
        if is_best {
            let path = format!("{}/model_best.safetensors", opts.checkpoint);
            checkpoint::save(&path, model.varmap(), &meta)?;
        }
    }

    if minloss.is_infinite() {
        warn!("training finished without a single usable batch");
    } else {
        info!(minloss, "minimum loss");
    }
    Ok(minloss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SampleInfo;
    use crate::mask_from_labels;
    use crate::modeling::toy::ToyPropagationModel;
    use candle_nn::VarMap;

    const H: usize = 6;
    const W: usize = 6;

    fn frame(seed: f32) -> Tensor {
        let data: Vec<f32> = (0..3 * H * W)
            .map(|i| ((i as f32 * 0.13 + seed).cos() + 1.0) / 2.0)
            .collect();
        Tensor::from_vec(data, (3, H, W), &Device::Cpu).unwrap()
    }

    fn clip(t: usize) -> VideoSample {
        let mut labels = vec![0u8; H * W];
        for p in 0..H * W / 4 {
            labels[p] = 1;
            labels[H * W - 1 - p] = 2;
        }
        let mask = mask_from_labels(&labels, H, W, 3, &Device::Cpu).unwrap();
        VideoSample {
            frames: (0..t).map(|i| frame(i as f32)).collect(),
            masks: vec![mask; t],
            num_objects: 2,
            info: SampleInfo::default(),
        }
    }

    fn toy() -> ToyPropagationModel {
        let varmap = VarMap::new();
        ToyPropagationModel::new(&varmap, &Device::Cpu, 8, 16, 2).unwrap()
    }

    #[test]
    fn total_is_the_sum_of_both_passes() {
        let model = toy();
        let opts = Opts::default();
        let trainer = CycleTrainer::new(&opts);

        let samples = vec![clip(3), clip(3)];
        let losses = trainer.train_batch(&model, &samples).unwrap();

        assert!(losses.forward >= 0.0);
        assert!(losses.backward >= 0.0);
        let total = losses.total.to_scalar::<f32>().unwrap();
        assert!((total - (losses.forward + losses.backward)).abs() < 1e-5);
    }

    #[test]
    fn direction_orders_are_mirrored() {
        assert_eq!(Direction::Forward.order(4), vec![0, 1, 2, 3]);
        assert_eq!(Direction::Backward.order(4), vec![3, 2, 1, 0]);
    }

    #[test]
    fn optimizer_step_runs_on_the_cycle_loss() {
        let varmap = VarMap::new();
        let model =
            ToyPropagationModel::new(&varmap, &Device::Cpu, 8, 16, 2).unwrap();
        let opts = Opts::default();
        let trainer = CycleTrainer::new(&opts);
        let mut solver = Solver::new(SolverKind::Adam, model.trainable_vars(), &opts).unwrap();

        let losses = trainer.train_batch(&model, &[clip(3)]).unwrap();
        solver.backward_step(&losses.total).unwrap();
    }

    #[test]
    fn meter_tracks_the_running_average() {
        let mut meter = AverageMeter::default();
        meter.update(2.0, 1);
        meter.update(4.0, 1);
        assert_eq!(meter.avg, 3.0);
        assert_eq!(meter.val, 4.0);
        meter.reset();
        assert_eq!(meter.count, 0);
    }

    #[test]
    fn learning_rate_decays_at_milestones() {
        let mut opts = Opts::default();
        opts.learning_rate = 1e-3;
        opts.gamma = 0.1;
        opts.milestone = vec![10, 20];
        assert!((scheduled_learning_rate(&opts, 5) - 1e-3).abs() < 1e-12);
        assert!((scheduled_learning_rate(&opts, 10) - 1e-4).abs() < 1e-12);
        assert!((scheduled_learning_rate(&opts, 25) - 1e-5).abs() < 1e-12);
    }
}
