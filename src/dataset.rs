use crate::tensor::{shape_of, Tensor};
use crate::EmbedError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Random-access view of one slide's tiles.
pub trait TileSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tile `index` as a `[C, H, W]` tensor.
    fn tile(&self, index: usize) -> Result<Tensor, EmbedError>;

    /// Level-0 tile origins, indexed like the tiles.
    fn coordinates(&self) -> &[[i64; 2]];

    /// Coordinates in the tile's own resolution.
    fn scaled_coordinates(&self) -> &[[i64; 2]];

    fn tile_size_lv0(&self) -> u32;
}

pub trait DatasetBuilder: Sync {
    fn build(&self, slide_path: &Path) -> Result<Arc<dyn TileSource>, EmbedError>;
}

/// File stem used to name everything derived from a slide.
pub fn slide_stem(slide_path: &Path) -> String {
    slide_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| slide_path.to_string_lossy().to_string())
}

/// Which samples one rank owns.
///
/// No shuffling and no dropping: the index list is padded by wrapping around to its
/// start until it divides evenly, then rank `r` takes every `world_size`-th entry
/// starting at `r`. Every rank ends up with the same number of samples, and the
/// padding is the only source of duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    dataset_len: usize,
    world_size: usize,
    local: Vec<u64>,
}

impl Partition {
    pub fn new(dataset_len: usize, rank: usize, world_size: usize) -> Result<Self, EmbedError> {
        if world_size == 0 || rank >= world_size {
            return Err(EmbedError::Config(format!(
                "rank {} is not valid for world size {}",
                rank, world_size
            )));
        }
        if dataset_len == 0 {
            return Err(EmbedError::DatasetLength("slide has no tiles".to_string()));
        }
        let per_rank = dataset_len.div_ceil(world_size);
        let total = per_rank * world_size;
        let local = (rank..total)
            .step_by(world_size)
            .map(|i| (i % dataset_len) as u64)
            .collect();
        Ok(Self { dataset_len, world_size, local })
    }

    pub fn local_indices(&self) -> &[u64] {
        &self.local
    }

    /// Samples this rank processes; identical on every rank.
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Pre-sizing estimate for a rank's chunk buffer.
    pub fn capacity_estimate(&self) -> u64 {
        (self.dataset_len / self.world_size) as u64
    }
}

/// Per-slide coordinate table written by the tiling stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateIndex {
    pub tile_size: u32,
    pub tile_size_lv0: u32,
    pub coordinates: Vec<[i64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaled_coordinates: Option<Vec<[i64; 2]>>,
}

impl CoordinateIndex {
    pub fn load(path: &Path) -> Result<Self, EmbedError> {
        let bytes = fs::read(path).map_err(|e| {
            EmbedError::DatasetLength(format!("cannot read coordinates {}: {}", path.display(), e))
        })?;
        let index: CoordinateIndex = serde_json::from_slice(&bytes)?;
        index.validate()?;
        Ok(index)
    }

    fn validate(&self) -> Result<(), EmbedError> {
        if self.tile_size == 0 || self.tile_size_lv0 == 0 {
            return Err(EmbedError::Config("tile sizes must be positive".to_string()));
        }
        if let Some(scaled) = &self.scaled_coordinates {
            if scaled.len() != self.coordinates.len() {
                return Err(EmbedError::DatasetLength(format!(
                    "{} scaled coordinates for {} tiles",
                    scaled.len(),
                    self.coordinates.len()
                )));
            }
        }
        Ok(())
    }

    /// Scaled coordinates, derived from the level-0 ones when not stored.
    pub fn resolved_scaled(&self) -> Vec<[i64; 2]> {
        match &self.scaled_coordinates {
            Some(scaled) => scaled.clone(),
            None => {
                let num = self.tile_size as i64;
                let den = self.tile_size_lv0 as i64;
                self.coordinates.iter().map(|[x, y]| [x * num / den, y * num / den]).collect()
            }
        }
    }
}

/// Image backend: reads square regions from a slide.
pub trait SlideReader: Send + Sync {
    fn dimensions(&self) -> (u32, u32);

    fn channels(&self) -> usize;

    /// Read the `size_lv0` square at level-0 origin `(x, y)`, resampled to
    /// `[C, out_size, out_size]` in `[0, 1]`. Pixels outside the slide are zero.
    fn read_region(&self, x: i64, y: i64, size_lv0: u32, out_size: u32) -> Result<Tensor, EmbedError>;
}

const RAW_HEADER_LEN: u64 = 12;

/// Uncompressed slide dump: `width`, `height`, `channels` as little-endian u32,
/// then interleaved u8 pixels row by row.
pub struct RawSlideReader {
    path: PathBuf,
    width: u32,
    height: u32,
    channels: u32,
}

impl RawSlideReader {
    pub fn open(path: &Path) -> Result<Self, EmbedError> {
        let mut file = File::open(path)?;
        let mut header = [0u8; RAW_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        let field = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
        let (width, height, channels) = (field(0), field(4), field(8));
        if channels == 0 {
            return Err(EmbedError::Other(format!("{} declares zero channels", path.display())));
        }
        let expected = RAW_HEADER_LEN + width as u64 * height as u64 * channels as u64;
        let actual = file.metadata()?.len();
        if actual < expected {
            return Err(EmbedError::Other(format!(
                "{} is truncated: {} bytes, expected {}",
                path.display(),
                actual,
                expected
            )));
        }
        Ok(Self { path: path.to_path_buf(), width, height, channels })
    }

    /// Write a slide in the raw format.
    pub fn write(path: &Path, width: u32, height: u32, channels: u32, pixels: &[u8]) -> Result<(), EmbedError> {
        if pixels.len() as u64 != width as u64 * height as u64 * channels as u64 {
            return Err(EmbedError::Shape(format!(
                "{} pixel bytes for a {}x{}x{} slide",
                pixels.len(),
                width,
                height,
                channels
            )));
        }
        let mut file = File::create(path)?;
        file.write_all(&width.to_le_bytes())?;
        file.write_all(&height.to_le_bytes())?;
        file.write_all(&channels.to_le_bytes())?;
        file.write_all(pixels)?;
        file.flush()?;
        Ok(())
    }
}

impl SlideReader for RawSlideReader {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn channels(&self) -> usize {
        self.channels as usize
    }

    fn read_region(&self, x: i64, y: i64, size_lv0: u32, out_size: u32) -> Result<Tensor, EmbedError> {
        let channels = self.channels as usize;
        let size = size_lv0 as usize;
        let mut region = vec![0u8; size * size * channels];

        let x0 = x.max(0);
        let x1 = (x + size_lv0 as i64).min(self.width as i64);
        if x1 > x0 {
            let mut file = File::open(&self.path)?;
            let span = (x1 - x0) as usize * channels;
            for ry in 0..size as i64 {
                let sy = y + ry;
                if sy < 0 || sy >= self.height as i64 {
                    continue;
                }
                let offset = RAW_HEADER_LEN + ((sy as u64 * self.width as u64) + x0 as u64) * channels as u64;
                file.seek(SeekFrom::Start(offset))?;
                let start = (ry as usize * size + (x0 - x) as usize) * channels;
                file.read_exact(&mut region[start..start + span])?;
            }
        }

        let out = out_size as usize;
        let mut data = vec![0.0f32; channels * out * out];
        for oy in 0..out {
            let ry = oy * size / out;
            for ox in 0..out {
                let rx = ox * size / out;
                let src = (ry * size + rx) * channels;
                for c in 0..channels {
                    data[(c * out + oy) * out + ox] = region[src + c] as f32 / 255.0;
                }
            }
        }
        Tensor::new(shape_of(&[channels, out, out]), data)
    }
}

/// Tiles of one slide: a coordinate table plus a reader.
pub struct TileDataset {
    index: CoordinateIndex,
    scaled: Vec<[i64; 2]>,
    reader: Box<dyn SlideReader>,
}

impl TileDataset {
    pub fn new(index: CoordinateIndex, reader: Box<dyn SlideReader>) -> Self {
        let scaled = index.resolved_scaled();
        Self { index, scaled, reader }
    }
}

impl TileSource for TileDataset {
    fn len(&self) -> usize {
        self.index.coordinates.len()
    }

    fn tile(&self, index: usize) -> Result<Tensor, EmbedError> {
        let [x, y] = *self.index.coordinates.get(index).ok_or_else(|| {
            EmbedError::Other(format!("tile {} out of range ({} tiles)", index, self.len()))
        })?;
        self.reader.read_region(x, y, self.index.tile_size_lv0, self.index.tile_size)
    }

    fn coordinates(&self) -> &[[i64; 2]] {
        &self.index.coordinates
    }

    fn scaled_coordinates(&self) -> &[[i64; 2]] {
        &self.scaled
    }

    fn tile_size_lv0(&self) -> u32 {
        self.index.tile_size_lv0
    }
}

pub const SUPPORTED_BACKENDS: &[&str] = &["raw"];

/// Builds datasets from `<coordinates_dir>/<slide-stem>.json` and a named backend.
#[derive(Debug, Clone)]
pub struct CoordinateDatasetBuilder {
    coordinates_dir: PathBuf,
    backend: String,
}

impl CoordinateDatasetBuilder {
    pub fn new(coordinates_dir: PathBuf, backend: &str) -> Result<Self, EmbedError> {
        if !SUPPORTED_BACKENDS.contains(&backend) {
            return Err(EmbedError::Config(format!(
                "unknown tiling backend '{}' (supported: {})",
                backend,
                SUPPORTED_BACKENDS.join(", ")
            )));
        }
        Ok(Self { coordinates_dir, backend: backend.to_string() })
    }

    pub fn coordinates_path(&self, slide_path: &Path) -> PathBuf {
        self.coordinates_dir.join(format!("{}.json", slide_stem(slide_path)))
    }
}

impl DatasetBuilder for CoordinateDatasetBuilder {
    fn build(&self, slide_path: &Path) -> Result<Arc<dyn TileSource>, EmbedError> {
        let index = CoordinateIndex::load(&self.coordinates_path(slide_path))?;
        let reader: Box<dyn SlideReader> = match self.backend.as_str() {
            "raw" => Box::new(RawSlideReader::open(slide_path)?),
            other => return Err(EmbedError::Config(format!("unknown tiling backend '{}'", other))),
        };
        Ok(Arc::new(TileDataset::new(index, reader)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_single_rank_owns_everything_in_order() {
        let p = Partition::new(5, 0, 1).unwrap();
        assert_eq!(p.local_indices(), &[0, 1, 2, 3, 4]);
        assert_eq!(p.capacity_estimate(), 5);
    }

    #[test]
    fn test_even_split_has_no_duplicates() {
        let a = Partition::new(4, 0, 2).unwrap();
        let b = Partition::new(4, 1, 2).unwrap();
        assert_eq!(a.local_indices(), &[0, 2]);
        assert_eq!(b.local_indices(), &[1, 3]);
    }

    #[test]
    fn test_uneven_split_pads_by_wrapping() {
        let ranks: Vec<_> = (0..3).map(|r| Partition::new(7, r, 3).unwrap()).collect();
        for p in &ranks {
            assert_eq!(p.local_len(), 3);
            assert_eq!(p.capacity_estimate(), 2);
        }
        assert_eq!(ranks[0].local_indices(), &[0, 3, 6]);
        assert_eq!(ranks[1].local_indices(), &[1, 4, 0]);
        assert_eq!(ranks[2].local_indices(), &[2, 5, 1]);
    }

    #[test]
    fn test_every_tile_assigned_for_many_shapes() {
        for len in 1..20 {
            for world in 1..6 {
                let mut covered = HashSet::new();
                let mut sizes = HashSet::new();
                for rank in 0..world {
                    let p = Partition::new(len, rank, world).unwrap();
                    sizes.insert(p.local_len());
                    covered.extend(p.local_indices().iter().copied());
                }
                assert_eq!(covered.len(), len, "len={} world={}", len, world);
                assert_eq!(sizes.len(), 1, "ranks must hold equal counts");
            }
        }
    }

    #[test]
    fn test_empty_dataset_is_length_error() {
        assert!(matches!(Partition::new(0, 0, 1), Err(EmbedError::DatasetLength(_))));
        assert!(Partition::new(3, 2, 2).is_err());
    }

    #[test]
    fn test_scaled_coordinates_default_from_tile_sizes() {
        let index = CoordinateIndex {
            tile_size: 2,
            tile_size_lv0: 4,
            coordinates: vec![[0, 0], [8, 4]],
            scaled_coordinates: None,
        };
        assert_eq!(index.resolved_scaled(), vec![[0, 0], [4, 2]]);
    }

    #[test]
    fn test_raw_reader_reads_and_pads_region() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("slide.raw");
        // 4x2 single-channel slide, pixel value = 10 * y + x
        let pixels: Vec<u8> = (0..2).flat_map(|y| (0..4).map(move |x| (10 * y + x) as u8)).collect();
        RawSlideReader::write(&path, 4, 2, 1, &pixels).unwrap();

        let reader = RawSlideReader::open(&path).unwrap();
        assert_eq!(reader.dimensions(), (4, 2));

        let tile = reader.read_region(2, 0, 2, 2).unwrap();
        assert_eq!(tile.shape(), &[1, 2, 2]);
        let expected: Vec<f32> = [2u8, 3, 12, 13].iter().map(|&v| v as f32 / 255.0).collect();
        assert_eq!(tile.data(), expected.as_slice());

        // Past the right/bottom edge is zero.
        let edge = reader.read_region(3, 1, 2, 2).unwrap();
        assert_eq!(edge.data()[0], 13.0 / 255.0);
        assert_eq!(&edge.data()[1..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_raw_reader_downsamples() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("slide.raw");
        let pixels: Vec<u8> = (0..16).map(|v| v as u8).collect();
        RawSlideReader::write(&path, 4, 4, 1, &pixels).unwrap();
        let reader = RawSlideReader::open(&path).unwrap();
        let tile = reader.read_region(0, 0, 4, 2).unwrap();
        let expected: Vec<f32> = [0u8, 2, 8, 10].iter().map(|&v| v as f32 / 255.0).collect();
        assert_eq!(tile.data(), expected.as_slice());
    }

    #[test]
    fn test_truncated_raw_slide_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bad.raw");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 5]);
        fs::write(&path, bytes).unwrap();
        assert!(RawSlideReader::open(&path).is_err());
    }

    #[test]
    fn test_builder_loads_coordinates_by_stem() {
        let temp_dir = tempfile::tempdir().unwrap();
        let coords_dir = temp_dir.path().join("coordinates");
        fs::create_dir_all(&coords_dir).unwrap();
        let slide = temp_dir.path().join("case_01.raw");
        RawSlideReader::write(&slide, 4, 4, 3, &[128u8; 48]).unwrap();
        let index = CoordinateIndex {
            tile_size: 2,
            tile_size_lv0: 2,
            coordinates: vec![[0, 0], [2, 0], [0, 2]],
            scaled_coordinates: None,
        };
        fs::write(coords_dir.join("case_01.json"), serde_json::to_vec(&index).unwrap()).unwrap();

        let builder = CoordinateDatasetBuilder::new(coords_dir, "raw").unwrap();
        let dataset = builder.build(&slide).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.coordinates()[1], [2, 0]);
        assert_eq!(dataset.tile(2).unwrap().shape(), &[3, 2, 2]);
        assert!(dataset.tile(3).is_err());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(matches!(
            CoordinateDatasetBuilder::new(PathBuf::from("c"), "openslide"),
            Err(EmbedError::Config(_))
        ));
    }

    #[test]
    fn test_slide_stem() {
        assert_eq!(slide_stem(Path::new("/data/slides/case_01.tiff")), "case_01");
    }
}
