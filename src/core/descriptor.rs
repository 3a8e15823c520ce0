//! Local-binary-pattern spatial histogram descriptors.
//!
//! A face crop is normalised to 200x200, histogram-equalised, converted to a
//! per-pixel 8-neighbour LBP code image and summarised as one 256-bin
//! histogram per grid cell. The concatenated histograms are L2-normalised so
//! that descriptors can be compared by cosine distance.

use crate::common::{FacegateError, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::contrast::equalize_histogram;

/// Side length of the square face crop every descriptor is computed from.
pub const FACE_SIDE: u32 = 200;
pub const DEFAULT_GRID: usize = 8;
pub const LBP_BINS: usize = 256;

const NORM_EPSILON: f32 = 1e-12;

/// Neighbour offsets as (dx, dy); bit `i` of a code is set when neighbour `i` >= centre.
const NEIGHBOURS: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

/// Dimension of a descriptor computed with the given grid size.
pub fn descriptor_dim(grid: usize) -> usize {
    grid * grid * LBP_BINS
}

/// An L2-normalised face descriptor. Immutable once extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.0)
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DescriptorEngine {
    grid: usize,
}

impl Default for DescriptorEngine {
    fn default() -> Self {
        Self { grid: DEFAULT_GRID }
    }
}

impl DescriptorEngine {
    pub fn new(grid: usize) -> Result<Self> {
        if grid == 0 || grid > FACE_SIDE as usize {
            return Err(FacegateError::Model(format!(
                "grid must be between 1 and {}, got {}", FACE_SIDE, grid
            )));
        }
        Ok(Self { grid })
    }

    pub fn grid(&self) -> usize {
        self.grid
    }

    pub fn dim(&self) -> usize {
        descriptor_dim(self.grid)
    }

    /// Pure function of the image and the grid size.
    pub fn extract(&self, image: &GrayImage) -> Descriptor {
        let prepared = prepare(image);
        let codes = lbp_codes(&prepared);
        let mut features = spatial_histogram(&codes, self.grid);

        let norm = l2_norm(&features) + NORM_EPSILON;
        for value in &mut features {
            *value /= norm;
        }
        Descriptor(features)
    }
}

/// Resize to the canonical face size when needed, then equalise.
fn prepare(image: &GrayImage) -> GrayImage {
    if image.dimensions() == (FACE_SIDE, FACE_SIDE) {
        equalize_histogram(image)
    } else {
        let resized = imageops::resize(image, FACE_SIDE, FACE_SIDE, FilterType::Triangle);
        equalize_histogram(&resized)
    }
}

/// 8-neighbour LBP code per pixel, borders handled by edge replication.
fn lbp_codes(image: &GrayImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let (w, h) = (width as i64, height as i64);
    let pixels = image.as_raw();
    let at = |x: i64, y: i64| -> u8 {
        let cx = x.clamp(0, w - 1);
        let cy = y.clamp(0, h - 1);
        pixels[(cy * w + cx) as usize]
    };

    let mut codes = GrayImage::new(width, height);
    for y in 0..h {
        for x in 0..w {
            let centre = at(x, y);
            let mut code = 0u8;
            for (bit, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
                if at(x + dx, y + dy) >= centre {
                    code |= 1 << bit;
                }
            }
            codes.put_pixel(x as u32, y as u32, Luma([code]));
        }
    }
    codes
}

/// Per-cell code histograms normalised to probabilities, concatenated in row-major cell order.
fn spatial_histogram(codes: &GrayImage, grid: usize) -> Vec<f32> {
    let (width, height) = codes.dimensions();
    let cell_w = width as usize / grid;
    let cell_h = height as usize / grid;
    let stride = width as usize;
    let pixels = codes.as_raw();

    let mut features = Vec::with_capacity(descriptor_dim(grid));
    for gy in 0..grid {
        for gx in 0..grid {
            let mut hist = [0u32; LBP_BINS];
            for y in gy * cell_h..(gy + 1) * cell_h {
                let row = &pixels[y * stride + gx * cell_w..y * stride + (gx + 1) * cell_w];
                for &code in row {
                    hist[code as usize] += 1;
                }
            }

            let total = (cell_w * cell_h) as f32;
            if total > 0.0 {
                features.extend(hist.iter().map(|&count| count as f32 / total));
            } else {
                features.extend(std::iter::repeat(0.0).take(LBP_BINS));
            }
        }
    }
    features
}

pub(crate) fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}
