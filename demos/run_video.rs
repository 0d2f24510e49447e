use candle_core::Device;
use candle_nn::VarMap;

use stm_cycle::dataset::{FrameSequence, SampleInfo};
use stm_cycle::modeling::object_count::count_anchor_objects;
use stm_cycle::modeling::toy::ToyPropagationModel;
use stm_cycle::output::write_mask;
use stm_cycle::propagation::{MaskPropagationLoop, PropagationConfig};
use stm_cycle::{mask_from_labels, Opts, MAX_TRAINING_OBJ};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let mut args = std::env::args().skip(1);
    let frames_dir = args.next().unwrap_or_else(|| "data/video".into());
    let anchor_path = args.next().unwrap_or_else(|| "data/anchor.png".into());

    let device = Device::Cpu;
    let opts = Opts::default();
    let (h, w) = opts.input_size;

    // load and normalize the frame sequence
    let sequence = FrameSequence::new(&frames_dir)?;
    let frames = (0..sequence.len())
        .map(|i| sequence.frame(i, (h, w), &device))
        .collect::<stm_cycle::Result<Vec<_>>>()?;
    println!("loaded {} frames from {frames_dir}", frames.len());

    // anchor annotation: a label map, one-hot encoded and padded
    let anno = image::open(&anchor_path)?.to_luma8();
    let resized = image::imageops::resize(
        &anno,
        w as u32,
        h as u32,
        image::imageops::FilterType::Nearest,
    );
    let anchor = mask_from_labels(&resized.into_raw(), h, w, MAX_TRAINING_OBJ + 1, &device)?;
    let num_objects = count_anchor_objects(&anchor)?.max(1);
    println!("anchor carries {num_objects} objects");

    // stand-in model; swap in a trained encoder/decoder pair for real use
    let varmap = VarMap::new();
    let model =
        ToyPropagationModel::new(&varmap, &device, opts.keydim, opts.valdim, MAX_TRAINING_OBJ)?;

    let looper = MaskPropagationLoop::new(&model, PropagationConfig::from_opts(&opts));
    let out = looper.propagate(&frames, &[anchor], &[0], num_objects)?;

    let info = SampleInfo {
        name: "demo".into(),
        annotated_frames: vec![0],
    };
    let dir = write_mask(&out.masks, &info, &opts, Some(sequence.frame_size()))?;
    println!("results saved at {}", dir.display());
    Ok(())
}
