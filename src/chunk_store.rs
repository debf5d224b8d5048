use crate::tensor::{format_shape, shape_of, FeatureBlock, Shape, Tensor};
use crate::EmbedError;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MAGIC: [u8; 4] = *b"SEC1";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 128;
pub const MAX_FEATURE_RANK: usize = 8;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
struct ChunkHeader {
    magic: [u8; 4],
    version: u32,
    capacity: u64,
    committed: u64,
    feature_rank: u32,
    dims: [u64; MAX_FEATURE_RANK],
}

impl ChunkHeader {
    fn new(capacity: u64, feature_shape: &[usize]) -> Self {
        let mut dims = [0u64; MAX_FEATURE_RANK];
        for (d, &s) in dims.iter_mut().zip(feature_shape) {
            *d = s as u64;
        }
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            capacity,
            committed: 0,
            feature_rank: feature_shape.len() as u32,
            dims,
        }
    }

    fn feature_shape(&self) -> Shape {
        self.dims[..self.feature_rank as usize]
            .iter()
            .map(|&d| d as usize)
            .collect()
    }
}

/// Per-rank, per-slide on-disk buffer of (index, feature) rows.
///
/// Rows have a fixed width so a batch can be written at any offset. The header
/// records how many rows are committed; a row only counts once the header that
/// covers it has been synced, so a crash mid-batch leaves earlier batches intact
/// and the in-flight one invisible.
pub struct ChunkBuffer {
    path: PathBuf,
    file: File,
    header: ChunkHeader,
    feature_shape: Shape,
    feature_len: usize,
    row_len: u64,
}

impl ChunkBuffer {
    /// Create the buffer pre-sized for `total_samples` rows, or reopen an existing one
    /// and continue after its committed rows.
    pub fn open(path: &Path, total_samples: u64, feature_shape: &[usize]) -> Result<Self, EmbedError> {
        if feature_shape.len() > MAX_FEATURE_RANK {
            return Err(EmbedError::Chunk(format!(
                "feature shape {} exceeds rank {}",
                format_shape(feature_shape),
                MAX_FEATURE_RANK
            )));
        }
        let feature_len: usize = feature_shape.iter().product();
        let row_len = row_len(feature_len);

        if path.exists() {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            let header = read_header(&mut file)?;
            if header.feature_shape().as_slice() != feature_shape {
                return Err(EmbedError::Chunk(format!(
                    "{} holds features of shape {}, expected {}",
                    path.display(),
                    format_shape(&header.feature_shape()),
                    format_shape(feature_shape)
                )));
            }
            debug!(path = %path.display(), committed = header.committed, "reopened chunk buffer");
            return Ok(Self {
                path: path.to_path_buf(),
                file,
                header,
                feature_shape: shape_of(feature_shape),
                feature_len,
                row_len,
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let header = ChunkHeader::new(total_samples, feature_shape);
        file.set_len(HEADER_LEN + total_samples * row_len)?;
        let mut buffer = Self {
            path: path.to_path_buf(),
            file,
            header,
            feature_shape: shape_of(feature_shape),
            feature_len,
            row_len,
        };
        buffer.write_header()?;
        Ok(buffer)
    }

    /// Remove a chunk left behind by an interrupted run. Returns whether one existed.
    pub fn discard_stale(path: &Path) -> Result<bool, EmbedError> {
        if !path.exists() {
            return Ok(false);
        }
        warn!(path = %path.display(), "discarding stale chunk buffer from an interrupted run");
        fs::remove_file(path)?;
        Ok(true)
    }

    pub fn committed(&self) -> u64 {
        self.header.committed
    }

    pub fn capacity(&self) -> u64 {
        self.header.capacity
    }

    /// Write `indices.len()` rows starting at `offset`; returns the offset after them.
    pub fn write_batch(&mut self, indices: &[u64], features: &Tensor, offset: u64) -> Result<u64, EmbedError> {
        if features.rows() != indices.len() || features.row_shape().as_slice() != self.feature_shape.as_slice() {
            return Err(EmbedError::Chunk(format!(
                "batch of {} indices with features {} does not fit rows of {}",
                indices.len(),
                format_shape(features.shape()),
                format_shape(&self.feature_shape)
            )));
        }
        if offset > self.header.committed {
            return Err(EmbedError::Chunk(format!(
                "write at offset {} would leave a gap after {} committed rows",
                offset, self.header.committed
            )));
        }
        let end = offset + indices.len() as u64;
        if end > self.header.capacity {
            self.grow(end)?;
        }

        let config = wire_config();
        let mut bytes = Vec::with_capacity(indices.len() * self.row_len as usize);
        for (i, &index) in indices.iter().enumerate() {
            bincode::encode_into_std_write((index, features.row(i)), &mut bytes, config)?;
        }
        self.file.seek(SeekFrom::Start(HEADER_LEN + offset * self.row_len))?;
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;

        self.header.committed = self.header.committed.max(end);
        self.write_header()?;
        Ok(end)
    }

    fn grow(&mut self, required: u64) -> Result<(), EmbedError> {
        let new_capacity = required.max(self.header.capacity * 2);
        debug!(
            path = %self.path.display(),
            from = self.header.capacity,
            to = new_capacity,
            "chunk buffer exceeded its estimate, growing"
        );
        self.file.set_len(HEADER_LEN + new_capacity * self.row_len)?;
        self.header.capacity = new_capacity;
        self.write_header()
    }

    fn write_header(&mut self) -> Result<(), EmbedError> {
        let mut bytes = bincode::encode_to_vec(&self.header, wire_config())?;
        bytes.resize(HEADER_LEN as usize, 0);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// All committed rows, in write order.
    pub fn read_all(&self) -> Result<FeatureBlock, EmbedError> {
        let committed = self.header.committed as usize;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut reader = BufReader::new(file.take(committed as u64 * self.row_len));

        let config = wire_config();
        let mut indices = Vec::with_capacity(committed);
        let mut data = Vec::with_capacity(committed * self.feature_len);
        let mut row = vec![0u8; self.row_len as usize];
        for _ in 0..committed {
            reader.read_exact(&mut row)?;
            let ((index, values), _): ((u64, Vec<f32>), usize) = bincode::decode_from_slice(&row, config)?;
            if values.len() != self.feature_len {
                return Err(EmbedError::Chunk(format!(
                    "corrupt row in {}: {} values, expected {}",
                    self.path.display(),
                    values.len(),
                    self.feature_len
                )));
            }
            indices.push(index);
            data.extend_from_slice(&values);
        }

        let mut shape: Shape = shape_of(&[committed]);
        shape.extend_from_slice(&self.feature_shape);
        FeatureBlock::new(indices, Tensor::new(shape, data)?)
    }

    /// Delete the backing file once its rows have been merged.
    pub fn close_and_discard(self) -> Result<(), EmbedError> {
        let path = self.path.clone();
        drop(self.file);
        fs::remove_file(&path)?;
        Ok(())
    }
}

fn row_len(feature_len: usize) -> u64 {
    // u64 index, u64 slice length, f32 values
    16 + 4 * feature_len as u64
}

fn read_header(file: &mut File) -> Result<ChunkHeader, EmbedError> {
    let mut bytes = vec![0u8; HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut bytes)?;
    let (header, _): (ChunkHeader, usize) = bincode::decode_from_slice(&bytes, wire_config())?;
    if header.magic != MAGIC || header.version != FORMAT_VERSION {
        return Err(EmbedError::Chunk("not a chunk buffer".to_string()));
    }
    if header.feature_rank as usize > MAX_FEATURE_RANK {
        return Err(EmbedError::Chunk(format!("header claims rank {}", header.feature_rank)));
    }
    Ok(header)
}

/// Layout of the transient chunk files under `<features_dir>/tmp`.
#[derive(Debug, Clone)]
pub struct TempLayout {
    root: PathBuf,
}

impl TempLayout {
    pub fn new(features_dir: &Path) -> Self {
        Self { root: features_dir.join("tmp") }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slide_dir(&self, slide_stem: &str) -> PathBuf {
        self.root.join(slide_stem)
    }

    pub fn chunk_path(&self, slide_stem: &str, rank: usize) -> PathBuf {
        self.slide_dir(slide_stem).join(format!("features_rank{}.chunk", rank))
    }

    pub fn remove_slide_dir(&self, slide_stem: &str) {
        remove_dir_best_effort(&self.slide_dir(slide_stem));
    }

    /// Guard that removes the whole temp root when dropped.
    pub fn root_guard(&self) -> TempRootGuard {
        TempRootGuard { root: self.root.clone() }
    }
}

pub struct TempRootGuard {
    root: PathBuf,
}

impl Drop for TempRootGuard {
    fn drop(&mut self) {
        remove_dir_best_effort(&self.root);
    }
}

fn remove_dir_best_effort(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => debug!(dir = %dir.display(), "removed temporary directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "could not remove temporary directory"),
    }
}
