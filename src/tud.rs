//! Loader for the TUD pedestrian sets, annotated with `.idl` list files.
//!
//! Each annotation line names an image and its person boxes:
//!
//! ```text
//! "DaSide0811-seq6-000.png": (108, 157, 156, 299), (246, 136, 298, 291);
//! ```
//!
//! The last line ends with `.` instead of `;`. Boxes may carry a trailing
//! `:score`, which is ignored.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::dataset::{split_samples, AnnotatedImage, BoundingBox, DatasetError, PedestrianDataset};

pub fn load_tud(root: &Path, test_fraction: f32, seed: u64) -> anyhow::Result<PedestrianDataset> {
    if !root.exists() {
        return Err(DatasetError::MissingRoot(root.to_path_buf()).into());
    }

    let idl_files = find_idl_files(root)?;
    if idl_files.is_empty() {
        return Err(DatasetError::NoAnnotations(root.to_path_buf()).into());
    }

    let mut samples = Vec::new();
    for idl_path in &idl_files {
        let parsed = parse_idl_file(idl_path)?;
        debug!(path = %idl_path.display(), images = parsed.len(), "parsed idl file");
        samples.extend(parsed);
    }

    let before = samples.len();
    samples.retain(|sample| sample.image_path.exists());
    if samples.len() < before {
        warn!(
            root = %root.display(),
            missing = before - samples.len(),
            "skipping annotated images that are not on disk"
        );
    }

    let (train, test) = split_samples(samples, test_fraction, seed)?;
    Ok(PedestrianDataset::new(train, test))
}

fn find_idl_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut dirs = vec![root.to_path_buf()];
    dirs.extend(
        fs::read_dir(root)
            .with_context(|| format!("Failed to read TUD root: {}", root.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir()),
    );

    let mut idl_files = Vec::new();
    for dir in dirs {
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?;
        idl_files.extend(
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.is_file()
                        && path
                            .extension()
                            .and_then(|ext| ext.to_str())
                            .map(|ext| ext.eq_ignore_ascii_case("idl"))
                            .unwrap_or(false)
                }),
        );
    }
    idl_files.sort();
    Ok(idl_files)
}

pub fn parse_idl_file(path: &Path) -> anyhow::Result<Vec<AnnotatedImage>> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read idl file: {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let base_dir = path.parent().unwrap_or(Path::new("."));

    let mut samples = Vec::new();
    for (line_idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (name, boxes) = parse_idl_line(line).map_err(|message| DatasetError::Annotation {
            path: path.to_path_buf(),
            line: line_idx + 1,
            message,
        })?;
        samples.push(AnnotatedImage {
            image_path: base_dir.join(name),
            boxes,
        });
    }
    Ok(samples)
}

pub fn parse_idl_line(line: &str) -> Result<(String, Vec<BoundingBox>), String> {
    let line = line.trim();
    let line = line
        .strip_suffix(';')
        .or_else(|| line.strip_suffix('.'))
        .unwrap_or(line)
        .trim_end();

    let rest = line
        .strip_prefix('"')
        .ok_or_else(|| "expected a quoted image name".to_string())?;
    let close = rest
        .find('"')
        .ok_or_else(|| "unterminated image name".to_string())?;
    let name = &rest[..close];
    if name.is_empty() {
        return Err("empty image name".to_string());
    }

    let mut remainder = rest[close + 1..].trim_start();
    remainder = remainder.strip_prefix(':').unwrap_or(remainder);

    let mut boxes = Vec::new();
    while let Some(open) = remainder.find('(') {
        let close = remainder[open..]
            .find(')')
            .map(|offset| open + offset)
            .ok_or_else(|| "unterminated box".to_string())?;
        let coords: Vec<f32> = remainder[open + 1..close]
            .split(',')
            .map(|value| {
                value
                    .trim()
                    .parse::<f32>()
                    .map_err(|_| format!("invalid box coordinate '{}'", value.trim()))
            })
            .collect::<Result<_, _>>()?;
        if coords.len() != 4 {
            return Err(format!("expected 4 box coordinates, got {}", coords.len()));
        }
        boxes.push(BoundingBox::from_corners(
            coords[0], coords[1], coords[2], coords[3],
        ));
        remainder = &remainder[close + 1..];
    }

    Ok((name.to_string(), boxes))
}
