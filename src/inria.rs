//! Loader for the INRIAPerson dataset.
//!
//! `Train/` and `Test/` each hold `pos.lst`, `neg.lst` and `annotations.lst`,
//! listing paths relative to the dataset root. Annotation files use the
//! PASCAL v1.0 text format.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::dataset::{AnnotatedImage, BoundingBox, DatasetError, PedestrianDataset};

const BOX_MARKER: &str = "Bounding box for object";

pub fn load_inria(root: &Path) -> anyhow::Result<PedestrianDataset> {
    if !root.exists() {
        return Err(DatasetError::MissingRoot(root.to_path_buf()).into());
    }
    let train = load_inria_split(root, "Train")?;
    let test = load_inria_split(root, "Test")?;
    Ok(PedestrianDataset::new(train, test))
}

fn load_inria_split(root: &Path, split: &str) -> anyhow::Result<Vec<AnnotatedImage>> {
    let split_dir = root.join(split);
    let pos_list = split_dir.join("pos.lst");
    if !pos_list.exists() {
        return Err(DatasetError::NoAnnotations(split_dir).into());
    }

    let annotations: HashMap<String, PathBuf> = read_list(&split_dir.join("annotations.lst"), root)?
        .into_iter()
        .filter_map(|path| file_stem(&path).map(|stem| (stem, path)))
        .collect();

    let mut samples = Vec::new();
    let mut skipped = 0usize;
    for image_path in read_list(&pos_list, root)? {
        let Some(annotation_path) = file_stem(&image_path).and_then(|stem| annotations.get(&stem))
        else {
            skipped += 1;
            continue;
        };
        let boxes = parse_pascal_annotation(annotation_path)?;
        samples.push(AnnotatedImage { image_path, boxes });
    }
    if skipped > 0 {
        warn!(split, skipped, "positive images without annotations were skipped");
    }

    let neg_list = split_dir.join("neg.lst");
    if neg_list.exists() {
        samples.extend(read_list(&neg_list, root)?.into_iter().map(|image_path| {
            AnnotatedImage {
                image_path,
                boxes: Vec::new(),
            }
        }));
    } else {
        warn!(path = %neg_list.display(), "no negative list found");
    }

    debug!(split, images = samples.len(), "loaded INRIA split");
    Ok(samples)
}

fn read_list(list_path: &Path, root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !list_path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(list_path)
        .with_context(|| format!("Failed to read list file: {}", list_path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| root.join(line))
        .collect())
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

pub fn parse_pascal_annotation(path: &Path) -> anyhow::Result<Vec<BoundingBox>> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read annotation: {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);

    let mut boxes = Vec::new();
    for (line_idx, line) in text.lines().enumerate() {
        if !line.contains(BOX_MARKER) {
            continue;
        }
        let bbox = parse_box_line(line).map_err(|message| DatasetError::Annotation {
            path: path.to_path_buf(),
            line: line_idx + 1,
            message,
        })?;
        boxes.push(bbox);
    }
    Ok(boxes)
}

/// Parses `... : (x1, y1) - (x2, y2)` from a PASCAL bounding-box line.
pub fn parse_box_line(line: &str) -> Result<BoundingBox, String> {
    let (_, coords) = line
        .rsplit_once(':')
        .ok_or_else(|| "missing ':' before box coordinates".to_string())?;
    let close = coords
        .find(')')
        .ok_or_else(|| "expected '(x1, y1) - (x2, y2)'".to_string())?;
    let (first, rest) = coords.split_at(close + 1);
    let second = rest
        .trim_start()
        .strip_prefix('-')
        .ok_or_else(|| "expected '-' between box corners".to_string())?;
    let (x1, y1) = parse_point(first)?;
    let (x2, y2) = parse_point(second)?;
    Ok(BoundingBox::from_corners(x1, y1, x2, y2))
}

fn parse_point(text: &str) -> Result<(f32, f32), String> {
    let inner = text
        .trim()
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| format!("expected a parenthesized point, got '{}'", text.trim()))?;
    let (x, y) = inner
        .split_once(',')
        .ok_or_else(|| format!("expected 'x, y', got '{inner}'"))?;
    let parse = |value: &str| {
        value
            .trim()
            .parse::<f32>()
            .map_err(|_| format!("invalid coordinate '{}'", value.trim()))
    };
    Ok((parse(x)?, parse(y)?))
}
