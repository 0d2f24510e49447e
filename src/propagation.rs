use candle_core::Tensor;
use candle_nn::ops::softmax;
use tracing::debug;

use crate::config::{Opts, TrainMode};
use crate::error::{Error, Result};
use crate::modeling::encoder::PropagationModel;
use crate::modeling::loss::mask_iou_loss;
use crate::modeling::matching::MatchingReadout;
use crate::modeling::memory_bank::MemoryBank;
use crate::modeling::object_count::ObjectCount;
use crate::pad_mask_channels;

#[derive(Debug, Clone, Copy)]
pub struct PropagationConfig {
    /// A memory slot is retained every `save_interval` steps at inference.
    pub save_interval: usize,
    pub memory_capacity: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            save_interval: 5,
            memory_capacity: 20,
        }
    }
}

impl PropagationConfig {
    pub fn from_opts(opts: &Opts) -> Self {
        Self {
            save_interval: opts.save_freq,
            memory_capacity: opts.memory_capacity,
        }
    }
}

/// Full per-video result: the anchor annotation followed by one prediction
/// per later frame, plus the times of the slots the memory retained.
pub struct PropagationOutput {
    pub masks: Vec<Tensor>,
    pub memory_times: Vec<usize>,
}

/// Sequential mask propagation over one video.
///
/// Each step selects a mask source (anchor ground truth, a mid-video
/// re-annotation, or the previous prediction), memorizes the previous
/// frame under that source, and segments the current frame by attending
/// over the accumulated memory. Computation is strictly sequential within
/// a video; a fresh bank is built per call so nothing leaks across videos.
pub struct MaskPropagationLoop<'a> {
    model: &'a dyn PropagationModel,
    readout: MatchingReadout,
    cfg: PropagationConfig,
}

impl<'a> MaskPropagationLoop<'a> {
    pub fn new(model: &'a dyn PropagationModel, cfg: PropagationConfig) -> Self {
        let readout = MatchingReadout::new(model.keydim());
        Self {
            model,
            readout,
            cfg,
        }
    }

    /// Inference over `frames`, guided by sparse annotations.
    ///
    /// `annotations[i]` is the ground truth supplied at frame
    /// `annotation_times[i]`; index 0 must be the anchor at time 0. The
    /// caller guarantees `num_objects >= 1` (zero-object clips are the
    /// provider's problem to resample, not a runtime condition here).
    pub fn propagate(
        &self,
        frames: &[Tensor],
        annotations: &[Tensor],
        annotation_times: &[usize],
        num_objects: usize,
    ) -> Result<PropagationOutput> {
        if frames.len() < 2 {
            return Err(Error::data("propagation needs at least two frames"));
        }
        if annotations.is_empty()
            || annotations.len() != annotation_times.len()
            || annotation_times[0] != 0
        {
            return Err(Error::data(
                "annotations must be non-empty, parallel to their times, anchored at 0",
            ));
        }

        let anchor = &annotations[0];
        let max_obj = anchor.dim(0)? - 1;
        let mut objects = ObjectCount::init(num_objects, max_obj)?;

        let mut memory = MemoryBank::new(self.cfg.memory_capacity);
        memory.reset();

        let mut masks = Vec::with_capacity(frames.len());
        masks.push(anchor.clone());
        let mut prev = anchor.clone();

        for t in 1..frames.len() {
            let source = if t - 1 == 0 {
                anchor.clone()
            } else if let Some(pos) = annotation_times.iter().position(|&ti| ti == t - 1) {
                // REANNOTATE: externally supplied ground truth overrides the
                // propagated estimate and may introduce new objects
                let fresh = &annotations[pos];
                objects.absorb(fresh)?;
                debug!(time = t - 1, no = objects.get(), "re-annotation applied");
                fresh.clone()
            } else {
                pad_mask_channels(&prev, max_obj + 1)?
            };

            let retain = (t - 1) % self.cfg.save_interval == 0;
            let pred = self.step(
                &mut memory,
                &frames[t - 1],
                &source,
                &frames[t],
                &objects,
                t - 1,
                retain,
            )?;
            masks.push(pred.clone());
            prev = pred;
        }

        Ok(PropagationOutput {
            masks,
            memory_times: memory.times(),
        })
    }

    /// Training pass over an already-ordered clip; returns the `T-1`
    /// predictions. Clips are short, so every step is memorized and the
    /// inference sampling throttle does not apply.
    pub fn propagate_training(
        &self,
        frames: &[&Tensor],
        masks: &[&Tensor],
        num_objects: usize,
        mode: TrainMode,
        iou_threshold: f32,
    ) -> Result<Vec<Tensor>> {
        if frames.len() < 2 || frames.len() != masks.len() {
            return Err(Error::data(
                "training clip needs matching frame/mask sequences of length >= 2",
            ));
        }
        let max_obj = masks[0].dim(0)? - 1;
        let objects = ObjectCount::init(num_objects.max(1), max_obj)?;

        let mut memory = MemoryBank::new(frames.len().max(2));
        let mut preds = Vec::with_capacity(frames.len() - 1);
        let mut prev: Option<Tensor> = None;

        for t in 1..frames.len() {
            let source = match (mode, &prev) {
                (_, None) => masks[0].clone(),
                (TrainMode::Mask, _) => masks[t - 1].clone(),
                (TrainMode::Recurrent, Some(p)) => pad_mask_channels(p, max_obj + 1)?,
                (TrainMode::Threshold, Some(p)) => {
                    let iou = 1.0
                        - mask_iou_loss(p, masks[t - 1], &objects)?.to_scalar::<f32>()?;
                    if iou >= iou_threshold {
                        pad_mask_channels(p, max_obj + 1)?
                    } else {
                        masks[t - 1].clone()
                    }
                }
            };

            let pred = self.step(
                &mut memory,
                frames[t - 1],
                &source,
                frames[t],
                &objects,
                t - 1,
                true,
            )?;
            preds.push(pred.clone());
            prev = Some(pred);
        }
        Ok(preds)
    }

    /// One propagation step: memorize `(source_frame, source_mask)`, then
    /// segment `query_frame` against the accumulated memory.
    ///
    /// The freshly encoded pair always participates in the attention; when
    /// `retain` is false it extends the snapshot transiently and is dropped
    /// afterwards.
    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        memory: &mut MemoryBank,
        source_frame: &Tensor,
        source_mask: &Tensor,
        query_frame: &Tensor,
        objects: &ObjectCount,
        time: usize,
        retain: bool,
    ) -> Result<Tensor> {
        let (key, value) = self.model.encode_memory(source_frame, source_mask, objects)?;

        let (mem_keys, mem_values) = if retain {
            memory.append(key, value, time)?;
            memory.snapshot()?
        } else {
            let (keys, values) = memory.snapshot()?;
            (
                Tensor::cat(&[&keys, &key.unsqueeze(0)?], 0)?,
                Tensor::cat(&[&values, &value.unsqueeze(0)?], 0)?,
            )
        };

        let query = self.model.encode_query(query_frame)?;
        let readout = self.readout.forward(&query.key, &mem_keys, &mem_values)?;
        let logits = self
            .model
            .decode(&readout, &query, objects, objects.max_obj())?;
        Ok(softmax(&logits, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask_from_labels;
    use crate::modeling::toy::ToyPropagationModel;
    use candle_core::{Device, Tensor};
    use candle_nn::VarMap;

    const H: usize = 6;
    const W: usize = 6;

    fn toy(max_obj: usize) -> ToyPropagationModel {
        let varmap = VarMap::new();
        ToyPropagationModel::new(&varmap, &Device::Cpu, 8, 16, max_obj).unwrap()
    }

    fn frame(seed: f32) -> Tensor {
        let data: Vec<f32> = (0..3 * H * W)
            .map(|i| ((i as f32 * 0.37 + seed).sin() + 1.0) / 2.0)
            .collect();
        Tensor::from_vec(data, (3, H, W), &Device::Cpu).unwrap()
    }

    fn two_object_anchor(max_obj: usize) -> Tensor {
        let mut labels = vec![0u8; H * W];
        for p in 0..H * W / 3 {
            labels[p] = 1;
            labels[H * W - 1 - p] = 2;
        }
        mask_from_labels(&labels, H, W, max_obj + 1, &Device::Cpu).unwrap()
    }

    #[test]
    fn predictions_are_simplexes_of_active_channels() {
        // T=3, No=2, save_interval=5: the bank holds only the anchor slot
        // through both steps and every prediction is (3, H, W)
        let model = toy(2);
        let cfg = PropagationConfig {
            save_interval: 5,
            memory_capacity: 20,
        };
        let looper = MaskPropagationLoop::new(&model, cfg);

        let frames = vec![frame(0.0), frame(1.0), frame(2.0)];
        let anchor = two_object_anchor(2);
        let out = looper
            .propagate(&frames, &[anchor], &[0], 2)
            .unwrap();

        assert_eq!(out.memory_times, vec![0]);
        assert_eq!(out.masks.len(), 3);
        for pred in &out.masks[1..] {
            assert_eq!(pred.dims(), &[3, H, W]);
            let sums = pred
                .sum(0)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap();
            assert!(sums.iter().all(|&s| (s - 1.0).abs() < 1e-4));
        }
    }

    #[test]
    fn memory_grows_on_the_sampling_grid() {
        let model = toy(2);
        let cfg = PropagationConfig {
            save_interval: 2,
            memory_capacity: 20,
        };
        let looper = MaskPropagationLoop::new(&model, cfg);

        let frames: Vec<Tensor> = (0..7).map(|i| frame(i as f32)).collect();
        let anchor = two_object_anchor(2);
        let out = looper.propagate(&frames, &[anchor], &[0], 2).unwrap();

        // steps memorize times 0..=5; retained at 0, 2, 4 -> 1 + (t-1)/2
        assert_eq!(out.memory_times, vec![0, 2, 4]);
    }

    #[test]
    fn fresh_bank_per_video_means_no_leakage() {
        let model = toy(2);
        let looper = MaskPropagationLoop::new(&model, PropagationConfig::default());

        let frames_b = vec![frame(5.0), frame(6.0), frame(7.0)];
        let anchor_b = two_object_anchor(2);

        // video A first, then B on the same loop
        let frames_a = vec![frame(20.0), frame(21.0)];
        looper
            .propagate(&frames_a, &[two_object_anchor(2)], &[0], 2)
            .unwrap();
        let after_a = looper
            .propagate(&frames_b, &[anchor_b.clone()], &[0], 2)
            .unwrap();

        // B alone
        let alone = looper
            .propagate(&frames_b, &[anchor_b], &[0], 2)
            .unwrap();

        for (x, y) in after_a.masks.iter().zip(alone.masks.iter()) {
            let a = x.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let b = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn reannotation_grows_the_object_count() {
        let model = toy(3);
        let looper = MaskPropagationLoop::new(&model, PropagationConfig::default());

        let frames: Vec<Tensor> = (0..4).map(|i| frame(i as f32)).collect();
        // anchor knows one object; frame 2 reveals object 3
        let mut labels = vec![0u8; H * W];
        labels[0] = 1;
        let anchor = mask_from_labels(&labels, H, W, 4, &Device::Cpu).unwrap();
        labels[1] = 3;
        let reannotation = mask_from_labels(&labels, H, W, 4, &Device::Cpu).unwrap();

        let out = looper
            .propagate(&frames, &[anchor, reannotation], &[0, 2], 1)
            .unwrap();

        // predictions before the event decode 1 object, after it 3
        assert_eq!(out.masks[1].dims(), &[2, H, W]);
        assert_eq!(out.masks[2].dims(), &[2, H, W]);
        assert_eq!(out.masks[3].dims(), &[4, H, W]);
    }

    #[test]
    fn training_pass_emits_one_prediction_per_transition() {
        let model = toy(2);
        let looper = MaskPropagationLoop::new(&model, PropagationConfig::default());

        let frames: Vec<Tensor> = (0..3).map(|i| frame(i as f32)).collect();
        let anchor = two_object_anchor(2);
        let masks = vec![anchor.clone(), anchor.clone(), anchor];
        let frame_refs: Vec<&Tensor> = frames.iter().collect();
        let mask_refs: Vec<&Tensor> = masks.iter().collect();

        let preds = looper
            .propagate_training(&frame_refs, &mask_refs, 2, TrainMode::Recurrent, 0.65)
            .unwrap();
        assert_eq!(preds.len(), 2);
    }
}
