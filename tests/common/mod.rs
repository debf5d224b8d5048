#![allow(dead_code)]

use slide_embed::config::{Config, ModelConfig, RunPaths, SpeedConfig, TilingConfig};
use slide_embed::dataset::{CoordinateIndex, RawSlideReader};
use slide_embed::manifest::{Ledger, LedgerMode, ManifestRow, Status};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub const TILE: u32 = 4;
pub const CHANNELS: usize = 3;

/// A run directory with slides, coordinates and a manifest under one temp dir.
pub struct RunDir {
    pub temp: TempDir,
    pub config: Config,
    pub paths: RunPaths,
}

impl RunDir {
    pub fn new(model: &str) -> Self {
        let temp = TempDir::new().unwrap();
        let config = Config {
            output_dir: temp.path().join("out"),
            tiling: TilingConfig::default(),
            model: ModelConfig {
                name: model.to_string(),
                level: None,
                batch_size: 2,
                tile_size: TILE,
                region_size: None,
                channels: CHANNELS,
            },
            speed: SpeedConfig { num_workers_embedding: 2 },
        };
        let paths = RunPaths::new(&config, "run").unwrap();
        fs::create_dir_all(paths.coordinates_dir()).unwrap();
        Self { temp, config, paths }
    }

    /// A 1-tile-high strip of `tiles` tiles where every pixel of tile k is `pixel(k)`.
    pub fn add_strip_slide(&self, name: &str, tiles: usize) -> String {
        let slides = self.temp.path().join("slides");
        fs::create_dir_all(&slides).unwrap();
        let path = slides.join(format!("{}.raw", name));

        let width = TILE as usize * tiles;
        let height = TILE as usize;
        let mut pixels = vec![0u8; width * height * CHANNELS];
        for y in 0..height {
            for x in 0..width {
                let value = pixel(x / TILE as usize);
                for c in 0..CHANNELS {
                    pixels[(y * width + x) * CHANNELS + c] = value;
                }
            }
        }
        RawSlideReader::write(&path, width as u32, height as u32, CHANNELS as u32, &pixels).unwrap();
        self.write_coordinates(name, tiles, None);
        path.to_string_lossy().to_string()
    }

    pub fn write_coordinates(&self, name: &str, tiles: usize, scaled: Option<Vec<[i64; 2]>>) {
        let index = CoordinateIndex {
            tile_size: TILE,
            tile_size_lv0: TILE,
            coordinates: (0..tiles as i64).map(|k| [k * TILE as i64, 0]).collect(),
            scaled_coordinates: scaled,
        };
        let path = self.paths.coordinates_dir().join(format!("{}.json", name));
        fs::write(path, serde_json::to_vec_pretty(&index).unwrap()).unwrap();
    }

    pub fn remove_coordinates(&self, name: &str) {
        fs::remove_file(self.paths.coordinates_dir().join(format!("{}.json", name))).unwrap();
    }

    pub fn write_manifest<S: AsRef<str>>(&self, slides: &[(S, Status)]) {
        let rows: Vec<ManifestRow> = slides
            .iter()
            .map(|(path, tiling)| ManifestRow::new(path.as_ref(), *tiling))
            .collect();
        fs::write(self.paths.manifest_path(), serde_json::to_vec_pretty(&rows).unwrap()).unwrap();
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::load(&self.paths.manifest_path(), LedgerMode::ReadOnly).unwrap()
    }

    pub fn artifact(&self, name: &str) -> PathBuf {
        self.paths.features_dir().join(format!("{}.bin", name))
    }
}

/// Pixel value of every pixel in tile k of a strip slide.
pub fn pixel(k: usize) -> u8 {
    (10 * k + 5) as u8
}

/// Mean-pool feature of tile k of a strip slide.
pub fn tile_feature(k: usize) -> f32 {
    pixel(k) as f32 / 255.0
}
