use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use futures::future::BoxFuture;
use image::imageops::FilterType;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::TrainingError;

pub type Result<T> = std::result::Result<T, TrainingError>;

/// One pull from a batch source: a `(batch, channels, size, size)` image
/// tensor in `[-1, 1]` plus the pass (epoch) it came from.
#[derive(Debug)]
pub struct ImageBatch {
    pub images: Tensor,
    pub pass: usize,
}

/// Infinite, restartable sequence of image batches. Implementations never
/// signal end-of-data; the training loop alone decides when to stop pulling.
/// The async seam leaves room for prefetching implementations without the
/// loop having to know.
pub trait BatchSource: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<ImageBatch>>;
}

impl<S: BatchSource + ?Sized> BatchSource for Box<S> {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<ImageBatch>> {
        (**self).next_batch()
    }
}

/// Blocking adapter around a batch source.
pub struct BlockingBatchSource<S: BatchSource> {
    inner: S,
}

impl<S: BatchSource> BlockingBatchSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<ImageBatch> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Shuffled index cycling shared by the sources. Every pass reshuffles with a
/// pass-indexed seed; the final partial batch of a pass is dropped so every
/// batch has exactly `batch_size` items.
#[derive(Debug)]
struct PassCycle {
    len: usize,
    batch_size: usize,
    seed: u64,
    pass: usize,
    order: Vec<usize>,
    cursor: usize,
}

impl PassCycle {
    fn new(len: usize, batch_size: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if len < batch_size {
            return Err(TrainingError::initialization(format!(
                "dataset holds {} items but a full batch needs {}",
                len, batch_size
            )));
        }
        let mut cycle = Self {
            len,
            batch_size,
            seed,
            pass: 0,
            order: Vec::new(),
            cursor: 0,
        };
        cycle.reshuffle();
        Ok(cycle)
    }

    fn reshuffle(&mut self) {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.pass as u64));
        self.order = (0..self.len).collect();
        self.order.shuffle(&mut rng);
        self.cursor = 0;
    }

    /// Indices of the next batch, rolling into a fresh pass when fewer than
    /// `batch_size` items remain.
    fn next_indices(&mut self) -> (Vec<usize>, usize) {
        if self.cursor + self.batch_size > self.len {
            self.pass += 1;
            self.reshuffle();
        }
        let pass = self.pass;
        let indices = self.order[self.cursor..self.cursor + self.batch_size].to_vec();
        self.cursor += self.batch_size;
        (indices, pass)
    }
}

/// Batch source over a directory of image files, decoded lazily per batch.
pub struct ImageFolderSource {
    files: Vec<PathBuf>,
    device: Device,
    image_size: usize,
    cycle: PassCycle,
}

impl ImageFolderSource {
    pub fn new(
        root: &Path,
        device: Device,
        image_size: usize,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self> {
        let mut files = Vec::new();
        collect_image_files(root, &mut files)?;
        files.sort();
        if files.is_empty() {
            return Err(TrainingError::initialization(format!(
                "no image files found under {}",
                root.display()
            )));
        }
        let cycle = PassCycle::new(files.len(), batch_size, seed)?;
        Ok(Self {
            files,
            device,
            image_size,
            cycle,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn build_batch(&mut self) -> Result<ImageBatch> {
        let (indices, pass) = self.cycle.next_indices();
        let mut images = Vec::with_capacity(indices.len());
        for index in indices {
            images.push(decode_image(&self.files[index], self.image_size, &self.device)?);
        }
        let images = Tensor::stack(&images, 0)
            .map_err(|err| TrainingError::runtime(format!("failed to stack batch: {err}")))?;
        Ok(ImageBatch { images, pass })
    }
}

impl BatchSource for ImageFolderSource {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<ImageBatch>> {
        Box::pin(async move { self.build_batch() })
    }
}

/// In-memory batch source with the same cycling semantics, used by the test
/// suite and by callers that already hold decoded tensors.
pub struct InMemorySource {
    images: Vec<Tensor>,
    cycle: PassCycle,
}

impl InMemorySource {
    /// `images` are `(channels, size, size)` tensors of identical shape.
    pub fn new(images: Vec<Tensor>, batch_size: usize, seed: u64) -> Result<Self> {
        let cycle = PassCycle::new(images.len(), batch_size, seed)?;
        Ok(Self { images, cycle })
    }

    fn build_batch(&mut self) -> Result<ImageBatch> {
        let (indices, pass) = self.cycle.next_indices();
        let selected: Vec<Tensor> = indices
            .into_iter()
            .map(|index| self.images[index].clone())
            .collect();
        let images = Tensor::stack(&selected, 0)
            .map_err(|err| TrainingError::runtime(format!("failed to stack batch: {err}")))?;
        Ok(ImageBatch { images, pass })
    }
}

impl BatchSource for InMemorySource {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<ImageBatch>> {
        Box::pin(async move { self.build_batch() })
    }
}

fn collect_image_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(|err| {
        TrainingError::initialization(format!(
            "failed to read image directory {}: {err}",
            dir.display()
        ))
    })? {
        let entry = entry.map_err(|err| {
            TrainingError::initialization(format!("failed to read directory entry: {err}"))
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_image_files(&path, files)?;
            continue;
        }
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            continue;
        };
        if matches!(ext.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg") {
            files.push(path);
        }
    }
    Ok(())
}

/// Decodes one image to a `(3, size, size)` f32 tensor in `[-1, 1]`: resize
/// so the shorter side matches `size`, center crop, then normalize with
/// mean 0.5 / std 0.5 per channel.
fn decode_image(path: &Path, size: usize, device: &Device) -> Result<Tensor> {
    let img = image::open(path)
        .map_err(|err| {
            TrainingError::runtime(format!("failed to decode {}: {err}", path.display()))
        })?
        .to_rgb8();

    let (width, height) = img.dimensions();
    let target = size as u32;
    let scale = target as f32 / width.min(height) as f32;
    let new_width = ((width as f32 * scale).round() as u32).max(target);
    let new_height = ((height as f32 * scale).round() as u32).max(target);
    let resized = image::imageops::resize(&img, new_width, new_height, FilterType::Triangle);

    let x0 = (new_width - target) / 2;
    let y0 = (new_height - target) / 2;
    let cropped = image::imageops::crop_imm(&resized, x0, y0, target, target).to_image();

    let mut data = vec![0f32; 3 * size * size];
    for (x, y, pixel) in cropped.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for channel in 0..3 {
            data[channel * size * size + y * size + x] =
                pixel[channel] as f32 / 255.0 * 2.0 - 1.0;
        }
    }

    Tensor::from_vec(data, (3, size, size), device).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to materialize image tensor for {}: {err}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor_images(count: usize) -> Vec<Tensor> {
        (0..count)
            .map(|i| {
                Tensor::full(i as f32 / count as f32, (3, 16, 16), &Device::Cpu).unwrap()
            })
            .collect()
    }

    #[test]
    fn batches_keep_a_constant_size_across_pass_boundaries() {
        let source = InMemorySource::new(tensor_images(10), 4, 7).unwrap();
        let mut source = BlockingBatchSource::new(source);
        // 10 items at batch 4: two batches per pass, the remainder dropped.
        for _ in 0..8 {
            let batch = source.next_batch().unwrap();
            assert_eq!(batch.images.dims(), &[4, 3, 16, 16]);
        }
    }

    #[test]
    fn partial_final_batch_is_dropped() {
        let source = InMemorySource::new(tensor_images(5), 4, 7).unwrap();
        let mut source = BlockingBatchSource::new(source);
        let first = source.next_batch().unwrap();
        assert_eq!(first.pass, 0);
        // Only one item remains in the pass; the source must roll over.
        let second = source.next_batch().unwrap();
        assert_eq!(second.pass, 1);
        assert_eq!(second.images.dims(), &[4, 3, 16, 16]);
    }

    #[test]
    fn passes_reshuffle_deterministically() {
        let mut a = InMemorySource::new(tensor_images(8), 4, 11).unwrap();
        let mut b = InMemorySource::new(tensor_images(8), 4, 11).unwrap();
        for _ in 0..6 {
            let (ia, _) = a.cycle.next_indices();
            let (ib, _) = b.cycle.next_indices();
            assert_eq!(ia, ib);
        }
    }

    #[test]
    fn needs_at_least_one_full_batch() {
        assert!(InMemorySource::new(tensor_images(3), 4, 0).is_err());
    }
}
