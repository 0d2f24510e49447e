use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use stm_cycle::config::{MaxSkip, Opts};
use stm_cycle::dataset::{SampleInfo, SampleProvider, VideoSample, MAX_TRAINING_SKIP, SKIP_INCREMENT};
use stm_cycle::modeling::toy::ToyPropagationModel;
use stm_cycle::trainer;

const H: usize = 16;
const W: usize = 16;
const MAX_OBJ: usize = 2;

/// Procedural clips: a bright square sliding one pixel per frame, with the
/// matching label map. Enough signal for the toy model to fit something.
struct SyntheticProvider {
    device: Device,
    clips: usize,
    frames: usize,
    max_skip: usize,
}

impl SyntheticProvider {
    fn clip(&self, idx: usize) -> stm_cycle::Result<VideoSample> {
        let mut frames = Vec::with_capacity(self.frames);
        let mut masks = Vec::with_capacity(self.frames);
        for t in 0..self.frames {
            let x0 = (idx + t) % (W - 4);
            let mut frame = vec![0.1f32; 3 * H * W];
            let mut labels = vec![0u8; H * W];
            for y in 4..8 {
                for x in x0..x0 + 4 {
                    for c in 0..3 {
                        frame[c * H * W + y * W + x] = 0.9;
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
                name: format!("synthetic_{idx:03}"),
                annotated_frames: vec![0],
            },
        })
    }
}

impl SampleProvider for SyntheticProvider {
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

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut opts = Opts::default();
    opts.epochs = 3;
    opts.train_batch = 2;
    opts.sampled_frames = 3;
    opts.epochs_per_increment = 2;
    opts.save_model_freq = 1;
    opts.learning_rate = 1e-3;
    opts.max_skip = MaxSkip::Scalar(5);
    opts.checkpoint = "output/demo_models".into();

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let model = ToyPropagationModel::new(&varmap, &device, 16, 32, MAX_OBJ)?;

    let mut provider = SyntheticProvider {
        device,
        clips: 8,
        frames: opts.sampled_frames,
        max_skip: 5,
    };

    let minloss = trainer::fit(&model, &mut provider, &opts)?;
    println!("minimum loss: {minloss}");
    Ok(())
}
