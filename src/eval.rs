use tracing::{info, warn};

use crate::config::Opts;
use crate::dataset::SampleProvider;
use crate::error::Result;
use crate::modeling::encoder::PropagationModel;
use crate::output::write_mask;
use crate::propagation::{MaskPropagationLoop, PropagationConfig};

/// Inference over every video of a provider, writing indexed-color results.
///
/// Per-video failures discard only that video's output: the error is logged
/// and the remaining batch keeps going. Returns the number of videos whose
/// results were written.
pub fn evaluate(
    provider: &mut dyn SampleProvider,
    model: &dyn PropagationModel,
    opts: &Opts,
) -> Result<usize> {
    let looper = MaskPropagationLoop::new(model, PropagationConfig::from_opts(opts));
    let total = provider.len();
    info!(videos = total, dataset = %opts.valset, "running inference");

    let mut written = 0usize;
    for idx in 0..total {
        let sample = match provider.get(idx) {
            Ok(s) => s,
            Err(e) => {
                warn!("skipping unreadable sample {idx}: {e}");
                continue;
            }
        };
        info!(video = %sample.info.name, objects = sample.num_objects, "video start");

        let outcome = looper
            .propagate(
                &sample.frames,
                &sample.masks,
                &sample.info.annotated_frames,
                sample.num_objects,
            )
            .and_then(|out| write_mask(&out.masks, &sample.info, opts, None));
        match outcome {
            Ok(_) => written += 1,
            Err(e) => {
                warn!(video = %sample.info.name, "video failed, partial output discarded: {e}")
            }
        }
    }
    Ok(written)
}
