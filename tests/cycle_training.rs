use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use stm_cycle::config::{MaxSkip, Opts};
use stm_cycle::dataset::{
    SampleInfo, SampleProvider, VideoSample, MAX_TRAINING_SKIP, SKIP_INCREMENT,
};
use stm_cycle::eval::evaluate;
use stm_cycle::modeling::toy::ToyPropagationModel;
use stm_cycle::trainer::fit;

const H: usize = 8;
const W: usize = 8;
const MAX_OBJ: usize = 2;

struct SlidingSquares {
    device: Device,
    clips: usize,
    frames: usize,
    max_skip: usize,
}

impl SlidingSquares {
    fn clip(&self, idx: usize) -> stm_cycle::Result<VideoSample> {
        let mut frames = Vec::new();
        let mut masks = Vec::new();
        for t in 0..self.frames {
            let x0 = (idx + t) % (W - 2);
            let mut frame = vec![0.05f32; 3 * H * W];
            let mut labels = vec![0u8; H * W];
            for y in 2..4 {
                for x in x0..x0 + 2 {
                    for c in 0..3 {
                        frame[c * H * W + y * W + x] = 0.95;
                    }
                    labels[y * W + x] = 1;
                }
            }
            frames.push(Tensor::from_vec(frame, (3, H, W), &self.device)?);
            masks.push(stm_cycle::mask_from_labels(
                &labels,
                H,
                W,
                MAX_OBJ + 1,
                &self.device,
            )?);
        }
        Ok(VideoSample {
            frames,
            masks,
            num_objects: 1,
            info: SampleInfo {
                name: format!("squares_{idx:02}"),
                annotated_frames: vec![0],
            },
        })
    }

    fn eval_clip(&self, idx: usize) -> stm_cycle::Result<VideoSample> {
        let mut sample = self.clip(idx)?;
        // inference samples carry only the annotated masks
        sample.masks.truncate(1);
        Ok(sample)
    }
}

impl SampleProvider for SlidingSquares {
    fn len(&self) -> usize {
        self.clips
    }

    fn get(&mut self, idx: usize) -> stm_cycle::Result<VideoSample> {
        self.clip(idx)
    }

    fn max_skip(&self) -> MaxSkip {
        MaxSkip::Scalar(self.max_skip)
    }

    fn set_max_skip(&mut self, skip: &MaxSkip) {
        if let MaxSkip::Scalar(v) = skip {
            self.max_skip = *v;
        }
    }

    fn increase_max_skip(&mut self) {
        self.max_skip = (self.max_skip + SKIP_INCREMENT).min(MAX_TRAINING_SKIP);
    }
}

struct EvalWrapper(SlidingSquares);

impl SampleProvider for EvalWrapper {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn get(&mut self, idx: usize) -> stm_cycle::Result<VideoSample> {
        self.0.eval_clip(idx)
    }

    fn max_skip(&self) -> MaxSkip {
        self.0.max_skip()
    }

    fn set_max_skip(&mut self, skip: &MaxSkip) {
        self.0.set_max_skip(skip)
    }

    fn increase_max_skip(&mut self) {
        self.0.increase_max_skip()
    }
}

fn small_opts(dir: &std::path::Path) -> Opts {
    let mut opts = Opts::default();
    opts.epochs = 2;
    opts.train_batch = 2;
    opts.sampled_frames = 3;
    opts.epochs_per_increment = 1;
    opts.save_model_freq = 1;
    opts.learning_rate = 1e-3;
    opts.max_skip = MaxSkip::Scalar(5);
    opts.checkpoint = dir.join("models").to_string_lossy().into_owned();
    opts.results = dir.join("results").to_string_lossy().into_owned();
    opts
}

#[test]
fn train_checkpoint_resume_and_evaluate() {
    let dir = tempfile::tempdir().unwrap();
    let device = Device::Cpu;
    let opts = small_opts(dir.path());

    let varmap = VarMap::new();
    let model = ToyPropagationModel::new(&varmap, &device, 8, 16, MAX_OBJ).unwrap();
    let mut provider = SlidingSquares {
        device: device.clone(),
        clips: 4,
        frames: opts.sampled_frames,
        max_skip: 5,
    };

    let minloss = fit(&model, &mut provider, &opts).unwrap();
    assert!(minloss.is_finite() && minloss >= 0.0);

    // two epochs with epochs_per_increment = 1
    assert_eq!(provider.max_skip(), MaxSkip::Scalar(5 + 2 * SKIP_INCREMENT));

    let best = std::path::Path::new(&opts.checkpoint).join("model_best.safetensors");
    assert!(best.is_file());

    // resume into a fresh model: the stored epoch count means no further
    // training, and the curriculum schedule comes back from the file
    let varmap2 = VarMap::new();
    let model2 = ToyPropagationModel::new(&varmap2, &device, 8, 16, MAX_OBJ).unwrap();
    let mut provider2 = SlidingSquares {
        device: device.clone(),
        clips: 4,
        frames: opts.sampled_frames,
        max_skip: 1,
    };
    let mut resume_opts = opts.clone();
    resume_opts.resume = best.to_string_lossy().into_owned();
    let resumed_minloss = fit(&model2, &mut provider2, &resume_opts).unwrap();
    assert!(resumed_minloss <= minloss + 1e-6);
    assert_ne!(provider2.max_skip(), MaxSkip::Scalar(1));

    // inference over the same clips writes one indexed frame per timestep
    let mut eval_provider = EvalWrapper(SlidingSquares {
        device,
        clips: 2,
        frames: 4,
        max_skip: 5,
    });
    let written = evaluate(&mut eval_provider, &model, &opts).unwrap();
    assert_eq!(written, 2);

    let frame0 = std::path::Path::new(&opts.results)
        .join(&opts.valset)
        .join("squares_00")
        .join("00000.png");
    assert!(frame0.is_file());
}
