use std::fs;
use std::fs::File;
use std::ops::Add;
use std::path::{Path, PathBuf};

use anyhow::Context;
use blake2::{Blake2s256, Digest};
use ndarray::{Array2, Array3};
use ndarray_npy::{NpzReader, NpzWriter};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset root does not exist: {}", .0.display())]
    MissingRoot(PathBuf),
    #[error("no annotation files found under {}", .0.display())]
    NoAnnotations(PathBuf),
    #[error("{}:{line}: {message}", path.display())]
    Annotation {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("split has no samples")]
    EmptySplit,
}

/// Person box in source-image pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BoundingBox {
    /// Builds a box from two opposite corners given in any order.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x_min: x1.min(x2),
            y_min: y1.min(y2),
            x_max: x1.max(x2),
            y_max: y1.max(y2),
        }
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnnotatedImage {
    pub image_path: PathBuf,
    pub boxes: Vec<BoundingBox>,
}

impl AnnotatedImage {
    pub fn is_negative(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// Train/test pair produced by a loader. Datasets concatenate with `+`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PedestrianDataset {
    pub train: Vec<AnnotatedImage>,
    pub test: Vec<AnnotatedImage>,
}

impl PedestrianDataset {
    pub fn new(train: Vec<AnnotatedImage>, test: Vec<AnnotatedImage>) -> Self {
        Self { train, test }
    }

    pub fn truncate(&mut self, max_samples: usize) {
        if max_samples > 0 {
            self.train.truncate(max_samples);
            self.test.truncate(max_samples);
        }
    }
}

impl Add for PedestrianDataset {
    type Output = PedestrianDataset;

    fn add(mut self, rhs: PedestrianDataset) -> PedestrianDataset {
        self.train.extend(rhs.train);
        self.test.extend(rhs.test);
        self
    }
}

impl std::iter::Sum for PedestrianDataset {
    fn sum<I: Iterator<Item = PedestrianDataset>>(iter: I) -> Self {
        iter.fold(PedestrianDataset::default(), |acc, dataset| acc + dataset)
    }
}

#[derive(Clone, Debug)]
pub struct DatasetConfig {
    pub image_height: usize,
    pub image_width: usize,
    pub out_height: usize,
    pub out_width: usize,
    /// Scale pixels to [0, 1]; otherwise they stay in [0, 255].
    pub normalize: bool,
    pub cache_root: Option<PathBuf>,
    pub require_cache: bool,
}

#[derive(Debug)]
pub struct SampleTensors {
    /// CHW pixels, 3 x image_height x image_width.
    pub input: Vec<f32>,
    /// Row-major target map, out_height x out_width.
    pub target: Vec<f32>,
}

/// Stacked samples: `inputs` is `len x 3 x H x W`, `targets` is `len x out_h * out_w`.
#[derive(Debug)]
pub struct Batch {
    pub inputs: Vec<f32>,
    pub targets: Vec<f32>,
    pub len: usize,
}

#[derive(Clone, Debug)]
pub struct PedestrianSplit {
    pub samples: Vec<AnnotatedImage>,
    pub cfg: DatasetConfig,
}

impl PedestrianSplit {
    pub fn new(samples: Vec<AnnotatedImage>, cfg: DatasetConfig) -> anyhow::Result<Self> {
        if samples.is_empty() {
            return Err(DatasetError::EmptySplit.into());
        }
        Ok(Self { samples, cfg })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn input_len(&self) -> usize {
        3 * self.cfg.image_height * self.cfg.image_width
    }

    pub fn target_len(&self) -> usize {
        self.cfg.out_height * self.cfg.out_width
    }

    pub fn with_normalize(&self, normalize: bool) -> Self {
        let mut split = self.clone();
        split.cfg.normalize = normalize;
        split
    }

    /// Loads `order` in consecutive chunks of `batch_size`; the last batch may be short.
    pub fn iter_batches<'a>(
        &'a self,
        order: &'a [usize],
        batch_size: usize,
    ) -> impl Iterator<Item = anyhow::Result<Batch>> + 'a {
        order
            .chunks(batch_size.max(1))
            .map(move |indices| self.load_batch(indices))
    }

    /// The first sample as a one-item batch, optionally left in `[0, 255]`.
    pub fn first_example(&self, normalize: bool) -> anyhow::Result<Batch> {
        self.with_normalize(normalize).load_batch(&[0])
    }

    pub fn load_batch(&self, indices: &[usize]) -> anyhow::Result<Batch> {
        let mut inputs = Vec::with_capacity(indices.len() * self.input_len());
        let mut targets = Vec::with_capacity(indices.len() * self.target_len());
        for &index in indices {
            let sample = self.load_item(index)?;
            inputs.extend_from_slice(&sample.input);
            targets.extend_from_slice(&sample.target);
        }
        Ok(Batch {
            inputs,
            targets,
            len: indices.len(),
        })
    }

    pub fn load_item(&self, index: usize) -> anyhow::Result<SampleTensors> {
        let sample = self
            .samples
            .get(index)
            .with_context(|| format!("Sample index out of bounds: {index}"))?;

        let cache_file = self
            .cfg
            .cache_root
            .as_ref()
            .map(|root| root.join(sample_cache_relpath(sample, &self.cfg)));

        let mut loaded = None;
        if let Some(path) = &cache_file {
            if path.exists() {
                loaded = load_cached_sample(path, &self.cfg)?;
                if loaded.is_none() && self.cfg.require_cache {
                    anyhow::bail!(
                        "Cache entry is invalid or shape-mismatched for sample: {}",
                        path.display()
                    );
                }
            } else if self.cfg.require_cache {
                anyhow::bail!("Required cache entry not found: {}", path.display());
            }
        }

        let (mut input, target) = match loaded {
            Some(item) => item,
            None => {
                let (input, target) = load_sample(sample, &self.cfg)?;
                if let Some(path) = &cache_file {
                    save_cached_sample(path, &input, &target, &self.cfg)?;
                }
                (input, target)
            }
        };

        if !self.cfg.normalize {
            input.iter_mut().for_each(|value| *value *= 255.0);
        }

        Ok(SampleTensors { input, target })
    }
}

/// Deterministically holds out `test_fraction` of the samples.
pub fn split_samples(
    mut samples: Vec<AnnotatedImage>,
    test_fraction: f32,
    seed: u64,
) -> anyhow::Result<(Vec<AnnotatedImage>, Vec<AnnotatedImage>)> {
    if !(0.0..1.0).contains(&test_fraction) {
        anyhow::bail!("test fraction must be in [0, 1), got {test_fraction}");
    }

    let mut rng = StdRng::seed_from_u64(seed);
    samples.shuffle(&mut rng);

    let len = samples.len();
    if test_fraction == 0.0 || len < 2 {
        return Ok((samples, Vec::new()));
    }

    let test_count = (((len as f32) * test_fraction).floor() as usize).clamp(1, len - 1);
    let test_samples = samples.split_off(len - test_count);
    Ok((samples, test_samples))
}

/// Marks every output cell whose centre falls inside a person box.
pub fn rasterize_target(
    boxes: &[BoundingBox],
    src_w: usize,
    src_h: usize,
    out_w: usize,
    out_h: usize,
) -> Vec<f32> {
    let mut map = vec![0f32; out_w * out_h];
    if src_w == 0 || src_h == 0 {
        return map;
    }
    let cell_w = src_w as f32 / out_w as f32;
    let cell_h = src_h as f32 / out_h as f32;

    for gy in 0..out_h {
        let cy = (gy as f32 + 0.5) * cell_h;
        for gx in 0..out_w {
            let cx = (gx as f32 + 0.5) * cell_w;
            if boxes.iter().any(|bbox| bbox.contains(cx, cy)) {
                map[gy * out_w + gx] = 1.0;
            }
        }
    }
    map
}

pub fn sample_cache_relpath(sample: &AnnotatedImage, cfg: &DatasetConfig) -> PathBuf {
    let mut source_key = format!(
        "{}|{}x{}|{}x{}",
        sample.image_path.to_string_lossy(),
        cfg.image_width,
        cfg.image_height,
        cfg.out_width,
        cfg.out_height
    );
    for bbox in &sample.boxes {
        source_key.push_str(&format!(
            "|{},{},{},{}",
            bbox.x_min, bbox.y_min, bbox.x_max, bbox.y_max
        ));
    }
    let mut hasher = Blake2s256::new();
    hasher.update(source_key.as_bytes());
    let digest = hasher.finalize();
    let hash = hex::encode(&digest[..8]);
    let stem = sample
        .image_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("sample");

    PathBuf::from(format!("{stem}_{hash}.npz"))
}

fn load_sample(
    sample: &AnnotatedImage,
    cfg: &DatasetConfig,
) -> anyhow::Result<(Vec<f32>, Vec<f32>)> {
    let (input, src_w, src_h) =
        load_rgb_as_chw(&sample.image_path, cfg.image_height, cfg.image_width)?;
    let target = rasterize_target(&sample.boxes, src_w, src_h, cfg.out_width, cfg.out_height);
    Ok((input, target))
}

/// Returns resized CHW pixels in [0, 1] along with the source width and height.
fn load_rgb_as_chw(
    path: &Path,
    target_h: usize,
    target_w: usize,
) -> anyhow::Result<(Vec<f32>, usize, usize)> {
    let rgb = image::open(path)
        .with_context(|| format!("Failed to open RGB image: {}", path.display()))?
        .to_rgb8();
    let (src_w_u32, src_h_u32) = rgb.dimensions();
    let src_w = src_w_u32 as usize;
    let src_h = src_h_u32 as usize;
    if src_w == 0 || src_h == 0 {
        anyhow::bail!("Image has no pixels: {}", path.display());
    }

    let mut channels = [
        vec![0f32; src_h * src_w],
        vec![0f32; src_h * src_w],
        vec![0f32; src_h * src_w],
    ];

    for (idx, pixel) in rgb.pixels().enumerate() {
        channels[0][idx] = f32::from(pixel[0]) / 255.0;
        channels[1][idx] = f32::from(pixel[1]) / 255.0;
        channels[2][idx] = f32::from(pixel[2]) / 255.0;
    }

    let pixels = target_h * target_w;
    let mut out = vec![0f32; 3 * pixels];
    for (c, channel) in channels.iter().enumerate() {
        let resized = resize_bilinear_channel(channel, src_h, src_w, target_h, target_w);
        out[(c * pixels)..((c + 1) * pixels)].copy_from_slice(&resized);
    }
    Ok((out, src_w, src_h))
}

fn resize_bilinear_channel(
    src: &[f32],
    src_h: usize,
    src_w: usize,
    dst_h: usize,
    dst_w: usize,
) -> Vec<f32> {
    if src_h == dst_h && src_w == dst_w {
        return src.to_vec();
    }

    let mut out = vec![0f32; dst_h * dst_w];
    let scale_y = src_h as f32 / dst_h as f32;
    let scale_x = src_w as f32 / dst_w as f32;

    for y in 0..dst_h {
        let in_y = ((y as f32 + 0.5) * scale_y - 0.5)
            .max(0.0)
            .min((src_h - 1) as f32);
        let y0 = in_y.floor() as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let wy = in_y - y0 as f32;

        for x in 0..dst_w {
            let in_x = ((x as f32 + 0.5) * scale_x - 0.5)
                .max(0.0)
                .min((src_w - 1) as f32);
            let x0 = in_x.floor() as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let wx = in_x - x0 as f32;

            let top = src[y0 * src_w + x0] * (1.0 - wx) + src[y0 * src_w + x1] * wx;
            let bottom = src[y1 * src_w + x0] * (1.0 - wx) + src[y1 * src_w + x1] * wx;
            out[y * dst_w + x] = top * (1.0 - wy) + bottom * wy;
        }
    }

    out
}

fn load_cached_sample(
    cache_file: &Path,
    cfg: &DatasetConfig,
) -> anyhow::Result<Option<(Vec<f32>, Vec<f32>)>> {
    let file = match File::open(cache_file) {
        Ok(file) => file,
        Err(_) => return Ok(None),
    };
    let mut npz = match NpzReader::new(file) {
        Ok(npz) => npz,
        Err(_) => return Ok(None),
    };

    let image: Array3<u8> = match npz.by_name("image.npy") {
        Ok(arr) => arr,
        Err(_) => match npz.by_name("image") {
            Ok(arr) => arr,
            Err(_) => return Ok(None),
        },
    };
    let target: Array2<f32> = match npz.by_name("target.npy") {
        Ok(arr) => arr,
        Err(_) => match npz.by_name("target") {
            Ok(arr) => arr,
            Err(_) => return Ok(None),
        },
    };

    let (h, w) = (cfg.image_height, cfg.image_width);
    if image.shape() != [h, w, 3] || target.shape() != [cfg.out_height, cfg.out_width] {
        return Ok(None);
    }

    let input = hwc_u8_to_chw_f32(
        image.as_slice().context("Non-contiguous cached image array")?,
        h,
        w,
    );
    Ok(Some((input, target.iter().copied().collect())))
}

fn save_cached_sample(
    cache_file: &Path,
    input_chw: &[f32],
    target: &[f32],
    cfg: &DatasetConfig,
) -> anyhow::Result<()> {
    if let Some(parent) = cache_file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create cache directory: {}", parent.display()))?;
    }

    let (h, w) = (cfg.image_height, cfg.image_width);
    let image_arr = Array3::from_shape_vec((h, w, 3), chw_f32_to_hwc_u8(input_chw, h, w))
        .context("Failed to shape image cache array")?;
    let target_arr = Array2::from_shape_vec((cfg.out_height, cfg.out_width), target.to_vec())
        .context("Failed to shape target cache array")?;

    let file = File::create(cache_file)
        .with_context(|| format!("Failed to create cache file: {}", cache_file.display()))?;
    let mut npz = NpzWriter::new(file);
    npz.add_array("image", &image_arr)
        .context("Failed writing 'image' to cache")?;
    npz.add_array("target", &target_arr)
        .context("Failed writing 'target' to cache")?;
    npz.finish().context("Failed finalizing cache npz")?;
    Ok(())
}

fn hwc_u8_to_chw_f32(hwc: &[u8], h: usize, w: usize) -> Vec<f32> {
    let pixels = h * w;
    let mut out = vec![0f32; 3 * pixels];
    for idx in 0..pixels {
        let base_hwc = idx * 3;
        out[idx] = f32::from(hwc[base_hwc]) / 255.0;
        out[pixels + idx] = f32::from(hwc[base_hwc + 1]) / 255.0;
        out[2 * pixels + idx] = f32::from(hwc[base_hwc + 2]) / 255.0;
    }
    out
}

pub(crate) fn chw_f32_to_hwc_u8(chw: &[f32], h: usize, w: usize) -> Vec<u8> {
    let pixels = h * w;
    let mut out = vec![0u8; pixels * 3];
    for idx in 0..pixels {
        let base_hwc = idx * 3;
        out[base_hwc] = (chw[idx] * 255.0).round().clamp(0.0, 255.0) as u8;
        out[base_hwc + 1] = (chw[pixels + idx] * 255.0).round().clamp(0.0, 255.0) as u8;
        out[base_hwc + 2] = (chw[2 * pixels + idx] * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    out
}
