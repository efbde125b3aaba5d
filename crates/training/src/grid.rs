use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::RgbImage;

use crate::TrainingError;

/// Arranges a `(batch, channels, h, w)` tensor into a single
/// `(channels, grid_h, grid_w)` grid with `padding` pixels of black border
/// around every cell, normalized to `[0, 1]` over the whole batch.
pub fn make_grid(
    images: &Tensor,
    images_per_row: usize,
    padding: usize,
) -> Result<Tensor, TrainingError> {
    if images_per_row == 0 {
        return Err(TrainingError::runtime("grid needs images_per_row > 0"));
    }
    let dims = images.dims();
    if dims.len() != 4 {
        return Err(TrainingError::runtime(format!(
            "grid expects a (batch, channels, h, w) tensor, got {:?}",
            dims
        )));
    }
    let (count, channels, height, width) = (dims[0], dims[1], dims[2], dims[3]);
    if count == 0 {
        return Err(TrainingError::runtime("grid needs at least one image"));
    }

    let data = images
        .to_device(&Device::Cpu)
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|err| TrainingError::runtime(format!("failed to read grid input: {err}")))?;

    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &value in &data {
        min = min.min(value);
        max = max.max(value);
    }
    let range = if max > min { max - min } else { 1.0 };

    let columns = images_per_row.min(count);
    let rows = count.div_ceil(columns);
    let grid_w = columns * (width + padding) + padding;
    let grid_h = rows * (height + padding) + padding;

    let mut grid = vec![0f32; channels * grid_h * grid_w];
    for index in 0..count {
        let row = index / columns;
        let column = index % columns;
        let y0 = padding + row * (height + padding);
        let x0 = padding + column * (width + padding);
        for c in 0..channels {
            for y in 0..height {
                for x in 0..width {
                    let src = index * channels * height * width + c * height * width + y * width + x;
                    let dst = c * grid_h * grid_w + (y0 + y) * grid_w + (x0 + x);
                    grid[dst] = (data[src] - min) / range;
                }
            }
        }
    }

    Tensor::from_vec(grid, (channels, grid_h, grid_w), &Device::Cpu)
        .map_err(|err| TrainingError::runtime(format!("failed to build grid tensor: {err}")))
}

/// Writes a `[0, 1]` grid tensor as an 8-bit PNG. Single-channel grids are
/// replicated to gray RGB.
pub fn save_grid_png(grid: &Tensor, path: &Path) -> Result<(), TrainingError> {
    let dims = grid.dims();
    if dims.len() != 3 {
        return Err(TrainingError::runtime(format!(
            "PNG export expects a (channels, h, w) grid, got {:?}",
            dims
        )));
    }
    let (channels, height, width) = (dims[0], dims[1], dims[2]);
    if channels != 1 && channels != 3 {
        return Err(TrainingError::runtime(format!(
            "PNG export supports 1 or 3 channels, got {}",
            channels
        )));
    }

    let data = grid
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|err| TrainingError::runtime(format!("failed to read grid: {err}")))?;

    let mut img = RgbImage::new(width as u32, height as u32);
    for y in 0..height {
        for x in 0..width {
            let sample = |c: usize| {
                let value = data[c * height * width + y * width + x];
                (value.clamp(0.0, 1.0) * 255.0).round() as u8
            };
            let pixel = if channels == 3 {
                image::Rgb([sample(0), sample(1), sample(2)])
            } else {
                let v = sample(0);
                image::Rgb([v, v, v])
            };
            img.put_pixel(x as u32, y as u32, pixel);
        }
    }

    img.save(path).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_dimensions_account_for_padding() {
        let images = Tensor::zeros((4, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let grid = make_grid(&images, 2, 2).unwrap();
        // 2x2 cells of 8px with 2px padding around each edge.
        assert_eq!(grid.dims(), &[3, 2 * (8 + 2) + 2, 2 * (8 + 2) + 2]);
    }

    #[test]
    fn values_normalize_to_unit_range() {
        let data: Vec<f32> = (0..2 * 3 * 4 * 4).map(|i| i as f32 - 10.0).collect();
        let images = Tensor::from_vec(data, (2, 3, 4, 4), &Device::Cpu).unwrap();
        let grid = make_grid(&images, 2, 1).unwrap();
        let values = grid.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(values.iter().any(|v| *v > 0.99));
    }

    #[test]
    fn short_final_row_still_fits() {
        let images = Tensor::zeros((3, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let grid = make_grid(&images, 2, 1).unwrap();
        // Two rows, the second one half empty.
        assert_eq!(grid.dims(), &[3, 2 * 5 + 1, 2 * 5 + 1]);
    }

    #[test]
    fn png_roundtrip_writes_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.png");
        let images = Tensor::rand(0f32, 1f32, (4, 3, 4, 4), &Device::Cpu).unwrap();
        let grid = make_grid(&images, 2, 1).unwrap();
        save_grid_png(&grid, &path).unwrap();
        assert!(path.is_file());
    }
}
