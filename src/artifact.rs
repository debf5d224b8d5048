use crate::merge::SlideFeatureSet;
use crate::tensor::{Tensor, TensorRecord};
use crate::EmbedError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ARTIFACT_EXTENSION: &str = "bin";

/// What a successful slide leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub enum SlideArtifact {
    TileFeatures { indices: Vec<u64>, features: Tensor },
    SlideEmbedding(Tensor),
}

#[derive(bincode::Encode, bincode::Decode)]
enum ArtifactRecord {
    TileFeatures { indices: Vec<u64>, features: TensorRecord },
    SlideEmbedding(TensorRecord),
}

impl SlideArtifact {
    pub fn from_feature_set(set: SlideFeatureSet) -> Self {
        SlideArtifact::TileFeatures { indices: set.indices, features: set.features }
    }

    fn to_record(&self) -> ArtifactRecord {
        match self {
            SlideArtifact::TileFeatures { indices, features } => ArtifactRecord::TileFeatures {
                indices: indices.clone(),
                features: features.to_record(),
            },
            SlideArtifact::SlideEmbedding(t) => ArtifactRecord::SlideEmbedding(t.to_record()),
        }
    }

    fn from_record(record: ArtifactRecord) -> Result<Self, EmbedError> {
        Ok(match record {
            ArtifactRecord::TileFeatures { indices, features } => {
                let features = Tensor::from_record(features)?;
                if features.rows() != indices.len() {
                    return Err(EmbedError::Shape(format!(
                        "artifact has {} indices for {} feature rows",
                        indices.len(),
                        features.rows()
                    )));
                }
                SlideArtifact::TileFeatures { indices, features }
            }
            ArtifactRecord::SlideEmbedding(t) => SlideArtifact::SlideEmbedding(Tensor::from_record(t)?),
        })
    }
}

pub fn artifact_path(features_dir: &Path, slide_stem: &str) -> PathBuf {
    features_dir.join(format!("{}.{}", slide_stem, ARTIFACT_EXTENSION))
}

/// Write `<features_dir>/<slide_stem>.bin`, replacing any previous artifact atomically.
pub fn write_artifact(features_dir: &Path, slide_stem: &str, artifact: &SlideArtifact) -> Result<PathBuf, EmbedError> {
    fs::create_dir_all(features_dir)?;
    let path = artifact_path(features_dir, slide_stem);
    let tmp = path.with_extension("bin.tmp");

    let bytes = bincode::encode_to_vec(artifact.to_record(), bincode::config::standard())?;
    let mut file = fs::File::create(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, &path)?;
    Ok(path)
}

pub fn read_artifact(path: &Path) -> Result<SlideArtifact, EmbedError> {
    let bytes = fs::read(path)?;
    let (record, _): (ArtifactRecord, usize) = bincode::decode_from_slice(&bytes, bincode::config::standard())?;
    SlideArtifact::from_record(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::shape_of;
    use tempfile::TempDir;

    #[test]
    fn test_tile_features_written_under_slide_stem() {
        let dir = TempDir::new().unwrap();
        let features = Tensor::new(shape_of(&[2, 3]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let artifact = SlideArtifact::TileFeatures { indices: vec![0, 4], features };
        let path = write_artifact(dir.path(), "slide_a", &artifact).unwrap();
        assert_eq!(path, dir.path().join("slide_a.bin"));
        assert!(!dir.path().join("slide_a.bin.tmp").exists());
        assert_eq!(read_artifact(&path).unwrap(), artifact);
    }

    #[test]
    fn test_rewrite_replaces_previous_artifact() {
        let dir = TempDir::new().unwrap();
        let first = SlideArtifact::SlideEmbedding(Tensor::zeros(shape_of(&[4])));
        let second = SlideArtifact::SlideEmbedding(Tensor::new(shape_of(&[2]), vec![0.5, 1.5]).unwrap());
        write_artifact(dir.path(), "s", &first).unwrap();
        let path = write_artifact(dir.path(), "s", &second).unwrap();
        assert_eq!(read_artifact(&path).unwrap(), second);
    }

    #[test]
    fn test_garbage_file_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.bin");
        fs::write(&path, [0xffu8; 3]).unwrap();
        assert!(read_artifact(&path).is_err());
    }
}
