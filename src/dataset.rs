use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use image::GenericImageView;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{MaxSkip, MAX_TRAINING_OBJ};
use crate::error::{Error, Result};
use crate::modeling::object_count::count_anchor_objects;
use crate::{mask_from_labels, preprocess_frame};

/// Curriculum step applied by `increase_max_skip`, and its ceiling.
pub const SKIP_INCREMENT: usize = 5;
pub const MAX_TRAINING_SKIP: usize = 25;

#[derive(Debug, Clone, Default)]
pub struct SampleInfo {
    pub name: String,
    /// Frame indices at which ground truth is supplied; index 0 is the
    /// anchor. Parallel to the `masks` list at inference time.
    pub annotated_frames: Vec<usize>,
}

/// One video clip as handed to the engine.
///
/// At training time `masks` carries one ground truth per frame; at
/// inference time it carries only the annotated masks, parallel to
/// `info.annotated_frames`. Masks are padded to `max_obj + 1` channels.
#[derive(Debug, Clone)]
pub struct VideoSample {
    pub frames: Vec<Tensor>,
    pub masks: Vec<Tensor>,
    pub num_objects: usize,
    pub info: SampleInfo,
}

/// External dataset surface: indexed sampling plus the max-skip curriculum.
pub trait SampleProvider {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&mut self, idx: usize) -> Result<VideoSample>;

    fn max_skip(&self) -> MaxSkip;

    fn set_max_skip(&mut self, skip: &MaxSkip);

    fn increase_max_skip(&mut self);
}

/// Interleaves several providers, repeating each according to its sampling
/// frequency; the per-dataset max-skip schedules stay independent.
pub struct ConcatProvider {
    providers: Vec<Box<dyn SampleProvider>>,
    index_map: Vec<(usize, usize)>,
}

impl ConcatProvider {
    pub fn new(providers: Vec<Box<dyn SampleProvider>>, freq: &[usize]) -> Result<Self> {
        if providers.is_empty() || providers.len() != freq.len() {
            return Err(Error::config(
                "concat provider needs one frequency per member dataset",
            ));
        }
        let mut index_map = Vec::new();
        for (pi, (provider, &f)) in providers.iter().zip(freq.iter()).enumerate() {
            for _ in 0..f.max(1) {
                for local in 0..provider.len() {
                    index_map.push((pi, local));
                }
            }
        }
        Ok(Self {
            providers,
            index_map,
        })
    }
}

impl SampleProvider for ConcatProvider {
    fn len(&self) -> usize {
        self.index_map.len()
    }

    fn get(&mut self, idx: usize) -> Result<VideoSample> {
        let (pi, local) = *self
            .index_map
            .get(idx)
            .ok_or_else(|| Error::data(format!("sample index {idx} out of range")))?;
        self.providers[pi].get(local)
    }

    fn max_skip(&self) -> MaxSkip {
        MaxSkip::PerDataset(
            self.providers
                .iter()
                .flat_map(|p| p.max_skip().as_vec())
                .collect(),
        )
    }

    fn set_max_skip(&mut self, skip: &MaxSkip) {
        match skip {
            MaxSkip::Scalar(v) => {
                for p in &mut self.providers {
                    p.set_max_skip(&MaxSkip::Scalar(*v));
                }
            }
            MaxSkip::PerDataset(values) => {
                for (p, v) in self.providers.iter_mut().zip(values.iter()) {
                    p.set_max_skip(&MaxSkip::Scalar(*v));
                }
            }
        }
    }

    fn increase_max_skip(&mut self) {
        for p in &mut self.providers {
            p.increase_max_skip();
        }
    }
}

/// Lazily loaded, size-checked frame directory for inference.
pub struct FrameSequence {
    image_paths: Vec<PathBuf>,
    base_dimensions: (u32, u32),
}

impl FrameSequence {
    pub fn new<P: AsRef<Path>>(folder: P) -> Result<Self> {
        let supported = ["jpg", "jpeg", "png", "bmp", "webp"];
        let mut image_paths = Vec::new();
        for entry in std::fs::read_dir(folder)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                if supported.contains(&ext.to_lowercase().as_str()) {
                    image_paths.push(path);
                }
            }
        }
        if image_paths.is_empty() {
            return Err(Error::data("no frames found in sequence directory"));
        }
        image_paths.sort();

        let first = image::open(&image_paths[0])?;
        Ok(Self {
            image_paths,
            base_dimensions: first.dimensions(),
        })
    }

    pub fn len(&self) -> usize {
        self.image_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_paths.is_empty()
    }

    /// Source video size as `(height, width)`.
    pub fn frame_size(&self) -> (usize, usize) {
        (
            self.base_dimensions.1 as usize,
            self.base_dimensions.0 as usize,
        )
    }

    /// Load frame `idx`, verify it matches the first frame's size, resize to
    /// `target_size = (height, width)` and normalize.
    pub fn frame(
        &self,
        idx: usize,
        target_size: (usize, usize),
        device: &Device,
    ) -> Result<Tensor> {
        let path = self.image_paths.get(idx).ok_or_else(|| {
            Error::data(format!(
                "frame index {idx} out of bounds (total {})",
                self.len()
            ))
        })?;
        let img = image::open(path)?;
        if img.dimensions() != self.base_dimensions {
            return Err(Error::shape(format!(
                "frame size {:?} does not match first frame {:?}",
                img.dimensions(),
                self.base_dimensions
            )));
        }
        preprocess_frame(&img, target_size, device)
    }
}

/// One (image, annotation) pair of a still-image dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub image: PathBuf,
    pub annotation: PathBuf,
}

/// Immutable, once-built index of annotated still images.
///
/// Built eagerly and shared by `Arc`; worker contexts receive a handle
/// instead of touching shared mutable state. A `bincode` cache file makes
/// rebuilds cheap.
#[derive(Debug, Serialize, Deserialize)]
pub struct AnnotationIndex {
    records: Vec<AnnotationRecord>,
}

impl AnnotationIndex {
    /// Pair every image under `image_root` with the same-stem annotation
    /// under `anno_root`; images without annotations are skipped.
    pub fn build<P: AsRef<Path>>(image_root: P, anno_root: P) -> Result<Self> {
        let anno_root = anno_root.as_ref();
        let mut records = Vec::new();
        let mut entries: Vec<PathBuf> = std::fs::read_dir(image_root)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        entries.sort();
        for image in entries {
            let Some(stem) = image.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let annotation = anno_root.join(format!("{stem}.png"));
            if annotation.is_file() {
                records.push(AnnotationRecord { image, annotation });
            }
        }
        if records.is_empty() {
            return Err(Error::data("annotation index is empty"));
        }
        Ok(Self { records })
    }

    pub fn load_cache<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn save_cache<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load the cache when present, otherwise build the index and dump it.
    pub fn ensure<P: AsRef<Path>>(cache: P, image_root: P, anno_root: P) -> Result<Arc<Self>> {
        let cache = cache.as_ref();
        if cache.is_file() {
            let index = Self::load_cache(cache)?;
            info!(records = index.len(), "loaded annotation index cache");
            return Ok(Arc::new(index));
        }
        let index = Self::build(image_root, anno_root)?;
        index.save_cache(cache)?;
        info!(records = index.len(), path = %cache.display(), "annotation index cache dumped");
        Ok(Arc::new(index))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&AnnotationRecord> {
        self.records.get(idx)
    }
}

/// Pseudo-video provider over annotated still images: one image repeated
/// `sampled_frames` times, its label map one-hot encoded and padded to
/// `MAX_TRAINING_OBJ + 1` channels. The original static-image training path.
pub struct StillImageProvider {
    index: Arc<AnnotationIndex>,
    device: Device,
    input_size: (usize, usize),
    sampled_frames: usize,
    max_skip: usize,
}

impl StillImageProvider {
    pub fn new(
        index: Arc<AnnotationIndex>,
        device: Device,
        input_size: (usize, usize),
        sampled_frames: usize,
        max_skip: usize,
    ) -> Self {
        Self {
            index,
            device,
            input_size,
            sampled_frames,
            max_skip,
        }
    }

    fn load_record(&self, record: &AnnotationRecord) -> Result<VideoSample> {
        let img = image::open(&record.image)?;
        let frame = preprocess_frame(&img, self.input_size, &self.device)?;

        let anno = image::open(&record.annotation)?.to_luma8();
        let resized = image::imageops::resize(
            &anno,
            self.input_size.1 as u32,
            self.input_size.0 as u32,
            image::imageops::FilterType::Nearest,
        );
        let labels: Vec<u8> = resized.into_raw();
        let mask = mask_from_labels(
            &labels,
            self.input_size.0,
            self.input_size.1,
            MAX_TRAINING_OBJ + 1,
            &self.device,
        )?;

        let num_objects = count_anchor_objects(&mask)?;
        if num_objects == 0 {
            return Err(Error::data(format!(
                "record {} has no valid objects",
                record.image.display()
            )));
        }

        let name = record
            .image
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("record")
            .to_string();
        Ok(VideoSample {
            frames: vec![frame; self.sampled_frames],
            masks: vec![mask; self.sampled_frames],
            num_objects,
            info: SampleInfo {
                name,
                annotated_frames: vec![0],
            },
        })
    }
}

impl SampleProvider for StillImageProvider {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn get(&mut self, idx: usize) -> Result<VideoSample> {
        // a zero-object record is non-fatal: walk forward to the next
        // usable one, the still-image equivalent of resampling
        for offset in 0..self.index.len() {
            let pos = (idx + offset) % self.index.len();
            let record = self
                .index
                .get(pos)
                .ok_or_else(|| Error::data(format!("record {pos} missing")))?;
            match self.load_record(record) {
                Ok(sample) => return Ok(sample),
                Err(Error::Data(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::data("no record with valid objects in the index"))
    }

    fn max_skip(&self) -> MaxSkip {
        MaxSkip::Scalar(self.max_skip)
    }

    fn set_max_skip(&mut self, skip: &MaxSkip) {
        match skip {
            MaxSkip::Scalar(v) => self.max_skip = *v,
            MaxSkip::PerDataset(values) => {
                if let Some(v) = values.first() {
                    self.max_skip = *v;
                }
            }
        }
    }

    fn increase_max_skip(&mut self) {
        // a still image has no temporal gap to stretch, but the schedule is
        // still tracked so checkpoints round-trip it
        self.max_skip = (self.max_skip + SKIP_INCREMENT).min(MAX_TRAINING_SKIP);
    }
}
