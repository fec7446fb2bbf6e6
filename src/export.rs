use std::path::Path;

use anyhow::Context;
use image::{GrayImage, ImageBuffer, Rgb, RgbImage};
use ndarray::{Array2, ArrayD, IxDyn};
use ndarray_npy::write_npy;

/// Maps `[0, 1]` scores to 8-bit intensities.
pub fn render_heatmap(scores: &[f32]) -> Vec<u8> {
    scores
        .iter()
        .map(|&value| {
            if value.is_finite() {
                (value * 255.0).clamp(0.0, 255.0) as u8
            } else {
                0
            }
        })
        .collect()
}

pub fn format_heatmap(heatmap: &[u8], w: usize) -> String {
    heatmap
        .chunks(w.max(1))
        .map(|row| {
            row.iter()
                .map(|value| format!("{value:3}"))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn write_npy_f32(path: &Path, shape: &[usize], values: &[f32]) -> anyhow::Result<()> {
    let array = ArrayD::from_shape_vec(IxDyn(shape), values.to_vec())
        .with_context(|| format!("Array shape {shape:?} does not match {} values", values.len()))?;
    write_npy(path, &array).with_context(|| format!("Failed writing {}", path.display()))?;
    Ok(())
}

pub fn write_npy_u8(path: &Path, h: usize, w: usize, values: &[u8]) -> anyhow::Result<()> {
    let array = Array2::from_shape_vec((h, w), values.to_vec())
        .with_context(|| format!("Array shape ({h}, {w}) does not match {} values", values.len()))?;
    write_npy(path, &array).with_context(|| format!("Failed writing {}", path.display()))?;
    Ok(())
}

pub fn save_heatmap_png(path: &Path, heatmap: &[u8], h: usize, w: usize) -> anyhow::Result<()> {
    let image: GrayImage = ImageBuffer::from_raw(w as u32, h as u32, heatmap.to_vec())
        .context("Heatmap has invalid shape for PNG")?;
    save_image(path, &image)
}

/// Writes CHW pixels in `[0, 255]` as an RGB image.
pub fn save_input_png(path: &Path, input_chw: &[f32], h: usize, w: usize) -> anyhow::Result<()> {
    if input_chw.len() != 3 * h * w {
        anyhow::bail!("Expected input tensor with 3 channels for rendering");
    }
    save_image(path, &chw_to_rgb(input_chw, h, w))
}

/// Input image next to the heatmap upscaled to the same size.
pub fn save_preview_montage(
    path: &Path,
    input_chw: &[f32],
    heatmap: &[u8],
    h: usize,
    w: usize,
    out_h: usize,
    out_w: usize,
) -> anyhow::Result<()> {
    if input_chw.len() != 3 * h * w {
        anyhow::bail!("Expected input tensor with 3 channels for preview");
    }
    if out_h == 0 || out_w == 0 || heatmap.len() != out_h * out_w {
        anyhow::bail!("Heatmap has invalid shape for preview");
    }

    let input = chw_to_rgb(input_chw, h, w);
    let mut overlay: RgbImage = ImageBuffer::new(w as u32, h as u32);
    for y in 0..h {
        let gy = (y * out_h / h).min(out_h - 1);
        for x in 0..w {
            let gx = (x * out_w / w).min(out_w - 1);
            let gray = heatmap[gy * out_w + gx];
            overlay.put_pixel(x as u32, y as u32, Rgb([gray, gray, gray]));
        }
    }

    let mut montage: RgbImage = ImageBuffer::new((w * 2) as u32, h as u32);
    blit(&mut montage, &input, 0, 0);
    blit(&mut montage, &overlay, w, 0);
    save_image(path, &montage)
}

fn save_image<P>(path: &Path, image: &ImageBuffer<P, Vec<u8>>) -> anyhow::Result<()>
where
    P: image::Pixel<Subpixel = u8> + image::PixelWithColorType,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output dir: {}", parent.display()))?;
    }
    image
        .save(path)
        .with_context(|| format!("Failed to write image: {}", path.display()))?;
    Ok(())
}

fn chw_to_rgb(chw: &[f32], h: usize, w: usize) -> RgbImage {
    let pixels = h * w;
    let mut image: RgbImage = ImageBuffer::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let r = chw[idx].clamp(0.0, 255.0) as u8;
            let g = chw[pixels + idx].clamp(0.0, 255.0) as u8;
            let b = chw[2 * pixels + idx].clamp(0.0, 255.0) as u8;
            image.put_pixel(x as u32, y as u32, Rgb([r, g, b]));
        }
    }
    image
}

fn blit(dst: &mut RgbImage, src: &RgbImage, x_offset: usize, y_offset: usize) {
    for (x, y, pixel) in src.enumerate_pixels() {
        dst.put_pixel(x + x_offset as u32, y + y_offset as u32, *pixel);
    }
}
