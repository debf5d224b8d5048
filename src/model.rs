use crate::config::ModelConfig;
use crate::tensor::{format_shape, shape_of, Shape, Tensor};
use crate::EmbedError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelLevel {
    Tile,
    Region,
    Slide,
}

/// The inference model, treated as a black box by the orchestrator.
pub trait FeatureExtractor: Send {
    fn name(&self) -> &str;

    fn level(&self) -> ModelLevel;

    /// Shape of one tile's feature, without the batch dimension.
    fn feature_shape(&self) -> Shape;

    /// `[B, ...input]` -> `[B, ...feature_shape]`.
    fn forward(&mut self, batch: &Tensor) -> Result<Tensor, EmbedError>;

    /// Reduce deduplicated tile features and their coordinates to one embedding.
    fn forward_slide(
        &mut self,
        _features: &Tensor,
        _coordinates: &[[i64; 2]],
        _tile_size_lv0: u32,
    ) -> Result<Tensor, EmbedError> {
        Err(EmbedError::Model(format!("{} is not a slide-level model", self.name())))
    }

    /// Whether `forward_slide` wants scaled rather than level-0 coordinates.
    fn uses_scaled_coordinates(&self) -> bool {
        false
    }
}

pub const MODEL_NAMES: &[&str] = &[
    "mean-pool",
    "mean-std",
    "region-mean-pool",
    "mean-pool-slide",
    "scaled-mean-pool-slide",
];

pub struct ModelFactory;

impl ModelFactory {
    pub fn build(config: &ModelConfig) -> Result<Box<dyn FeatureExtractor>, EmbedError> {
        if config.channels == 0 || config.tile_size == 0 {
            return Err(EmbedError::Config("model channels and tile_size must be positive".to_string()));
        }
        let channels = config.channels;
        let model: Box<dyn FeatureExtractor> = match config.name.as_str() {
            "mean-pool" => Box::new(MeanPool { channels }),
            "mean-std" => Box::new(MeanStd { channels }),
            "region-mean-pool" => {
                let region_size = config.region_size.ok_or_else(|| {
                    EmbedError::Config("region-mean-pool needs model.region_size".to_string())
                })?;
                if region_size == 0 || region_size % config.tile_size != 0 {
                    return Err(EmbedError::Config(format!(
                        "region size {} is not a multiple of tile size {}",
                        region_size, config.tile_size
                    )));
                }
                Box::new(RegionMeanPool { channels, tile_size: config.tile_size, region_size })
            }
            "mean-pool-slide" => Box::new(SlideMeanPool { channels, scaled: false }),
            "scaled-mean-pool-slide" => Box::new(SlideMeanPool { channels, scaled: true }),
            other => {
                return Err(EmbedError::Config(format!(
                    "unknown model '{}' (known: {})",
                    other,
                    MODEL_NAMES.join(", ")
                )));
            }
        };
        if let Some(level) = config.level {
            if level != model.level() {
                return Err(EmbedError::Config(format!(
                    "model {} is {:?}-level, config says {:?}",
                    model.name(),
                    model.level(),
                    level
                )));
            }
        }
        Ok(model)
    }
}

/// Validate a `[B, C, H, W]` batch and return its dims.
fn image_batch_dims(batch: &Tensor, channels: usize) -> Result<(usize, usize, usize), EmbedError> {
    match batch.shape() {
        &[b, c, h, w] if c == channels => Ok((b, h, w)),
        other => Err(EmbedError::Model(format!(
            "expected a [B, {}, H, W] batch, got {}",
            channels,
            format_shape(other)
        ))),
    }
}

fn channel_stats(image: &[f32], channels: usize, with_std: bool) -> Vec<f32> {
    let plane = image.len() / channels;
    let mut out = Vec::with_capacity(if with_std { 2 * channels } else { channels });
    let mut stds = Vec::new();
    for c in 0..channels {
        let values = &image[c * plane..(c + 1) * plane];
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / plane.max(1) as f64;
        out.push(mean as f32);
        if with_std {
            let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / plane.max(1) as f64;
            stds.push(var.sqrt() as f32);
        }
    }
    out.extend(stds);
    out
}

fn pool_batch(batch: &Tensor, channels: usize, with_std: bool) -> Result<Tensor, EmbedError> {
    let (b, _, _) = image_batch_dims(batch, channels)?;
    let width = if with_std { 2 * channels } else { channels };
    let mut data = Vec::with_capacity(b * width);
    for i in 0..b {
        data.extend(channel_stats(batch.row(i), channels, with_std));
    }
    Tensor::new(shape_of(&[b, width]), data)
}

/// Split a `[C, R, R]` region into `[n, C, t, t]` tiles, row-major over the grid.
pub fn unfold_region(region: &Tensor, tile_size: usize) -> Result<Tensor, EmbedError> {
    let (c, r) = match region.shape() {
        &[c, h, w] if h == w && tile_size > 0 && h % tile_size == 0 => (c, h),
        other => {
            return Err(EmbedError::Shape(format!(
                "cannot unfold {} into {}x{} tiles",
                format_shape(other),
                tile_size,
                tile_size
            )));
        }
    };
    let per_side = r / tile_size;
    let src = region.data();
    let mut data = Vec::with_capacity(src.len());
    for ty in 0..per_side {
        for tx in 0..per_side {
            for ch in 0..c {
                for y in 0..tile_size {
                    let row = (ch * r + ty * tile_size + y) * r + tx * tile_size;
                    data.extend_from_slice(&src[row..row + tile_size]);
                }
            }
        }
    }
    Tensor::new(shape_of(&[per_side * per_side, c, tile_size, tile_size]), data)
}

struct MeanPool {
    channels: usize,
}

impl FeatureExtractor for MeanPool {
    fn name(&self) -> &str {
        "mean-pool"
    }

    fn level(&self) -> ModelLevel {
        ModelLevel::Tile
    }

    fn feature_shape(&self) -> Shape {
        shape_of(&[self.channels])
    }

    fn forward(&mut self, batch: &Tensor) -> Result<Tensor, EmbedError> {
        pool_batch(batch, self.channels, false)
    }
}

struct MeanStd {
    channels: usize,
}

impl FeatureExtractor for MeanStd {
    fn name(&self) -> &str {
        "mean-std"
    }

    fn level(&self) -> ModelLevel {
        ModelLevel::Tile
    }

    fn feature_shape(&self) -> Shape {
        shape_of(&[2 * self.channels])
    }

    fn forward(&mut self, batch: &Tensor) -> Result<Tensor, EmbedError> {
        pool_batch(batch, self.channels, true)
    }
}

struct RegionMeanPool {
    channels: usize,
    tile_size: u32,
    region_size: u32,
}

impl RegionMeanPool {
    fn tiles_per_region(&self) -> usize {
        let per_side = (self.region_size / self.tile_size) as usize;
        per_side * per_side
    }
}

impl FeatureExtractor for RegionMeanPool {
    fn name(&self) -> &str {
        "region-mean-pool"
    }

    fn level(&self) -> ModelLevel {
        ModelLevel::Region
    }

    fn feature_shape(&self) -> Shape {
        shape_of(&[self.tiles_per_region(), self.channels])
    }

    fn forward(&mut self, batch: &Tensor) -> Result<Tensor, EmbedError> {
        let (b, h, w) = image_batch_dims(batch, self.channels)?;
        if h != self.region_size as usize || w != self.region_size as usize {
            return Err(EmbedError::Model(format!(
                "expected {}x{} regions, got {}x{}",
                self.region_size, self.region_size, h, w
            )));
        }
        let region_shape = shape_of(&[self.channels, h, w]);
        let mut data = Vec::with_capacity(b * self.tiles_per_region() * self.channels);
        for i in 0..b {
            let region = Tensor::new(region_shape.clone(), batch.row(i).to_vec())?;
            let tiles = unfold_region(&region, self.tile_size as usize)?;
            for t in 0..tiles.rows() {
                data.extend(channel_stats(tiles.row(t), self.channels, false));
            }
        }
        Tensor::new(shape_of(&[b, self.tiles_per_region(), self.channels]), data)
    }
}

struct SlideMeanPool {
    channels: usize,
    scaled: bool,
}

impl FeatureExtractor for SlideMeanPool {
    fn name(&self) -> &str {
        if self.scaled { "scaled-mean-pool-slide" } else { "mean-pool-slide" }
    }

    fn level(&self) -> ModelLevel {
        ModelLevel::Slide
    }

    fn feature_shape(&self) -> Shape {
        shape_of(&[self.channels])
    }

    fn forward(&mut self, batch: &Tensor) -> Result<Tensor, EmbedError> {
        pool_batch(batch, self.channels, false)
    }

    fn forward_slide(
        &mut self,
        features: &Tensor,
        coordinates: &[[i64; 2]],
        _tile_size_lv0: u32,
    ) -> Result<Tensor, EmbedError> {
        if features.rows() != coordinates.len() {
            return Err(EmbedError::Model(format!(
                "{} tile features but {} coordinates",
                features.rows(),
                coordinates.len()
            )));
        }
        features.mean_rows()
    }

    fn uses_scaled_coordinates(&self) -> bool {
        self.scaled
    }
}
