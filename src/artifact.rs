use crate::types::{ImageArray, TrialArtifactPolicy};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File suffix of images written by [`FsArtifactStore`].
pub const IMAGE_SUFFIX: &str = "json";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Cannot overwrite existing artifact '{}'", .path.display())]
    AlreadyExists { path: PathBuf },

    #[error("Artifact '{}' does not exist", .path.display())]
    NotFound { path: PathBuf },

    #[error("I/O error on artifact '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed image artifact '{}': {source}", .path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Corrupt image artifact '{}': {message}", .path.display())]
    Corrupt { path: PathBuf, message: String },

    #[error("Cross-validation table error on '{}': {source}", .path.display())]
    Table {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Persistent storage for reconstructed images, addressed by relative name.
pub trait ArtifactStore {
    /// Fails with [`ArtifactError::AlreadyExists`] if `overwrite` is false and
    /// `name` is taken.
    fn write(&self, image: &ImageArray, name: &Path, overwrite: bool) -> Result<(), ArtifactError>;

    fn read(&self, name: &Path) -> Result<ImageArray, ArtifactError>;

    fn exists(&self, name: &Path) -> bool;

    /// Copy `from` to `to`, replacing `to` if present.
    fn copy(&self, from: &Path, to: &Path) -> Result<(), ArtifactError>;

    /// Fails with [`ArtifactError::NotFound`] if nothing is stored under `name`.
    fn remove(&self, name: &Path) -> Result<(), ArtifactError>;
}

impl<A: ArtifactStore + ?Sized> ArtifactStore for &A {
    fn write(&self, image: &ImageArray, name: &Path, overwrite: bool) -> Result<(), ArtifactError> {
        (**self).write(image, name, overwrite)
    }

    fn read(&self, name: &Path) -> Result<ImageArray, ArtifactError> {
        (**self).read(name)
    }

    fn exists(&self, name: &Path) -> bool {
        (**self).exists(name)
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<(), ArtifactError> {
        (**self).copy(from, to)
    }

    fn remove(&self, name: &Path) -> Result<(), ArtifactError> {
        (**self).remove(name)
    }
}

/// On-disk image layout: the `(nv, nu)` shape and the IEEE-754 bit pattern of
/// every pixel in row-major order. NaN payloads, infinities and signed zeros
/// all survive, which plain JSON numbers cannot carry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredImage {
    shape: (usize, usize),
    bits: Vec<u64>,
}

impl StoredImage {
    fn encode(image: &ImageArray) -> Self {
        Self {
            shape: image.dim(),
            bits: image.iter().map(|x| x.to_bits()).collect(),
        }
    }

    fn decode(self) -> Result<ImageArray, String> {
        let shape = self.shape;
        let found = self.bits.len();
        let values: Vec<f64> = self.bits.into_iter().map(f64::from_bits).collect();
        Array2::from_shape_vec(shape, values)
            .map(ImageArray::new)
            .map_err(|e| format!("{found} pixels stored for shape {shape:?}: {e}"))
    }
}

/// Images as JSON files below a root directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| ArtifactError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &Path) -> PathBuf {
        self.root.join(name)
    }
}

fn io_error(path: PathBuf, source: io::Error) -> ArtifactError {
    if source.kind() == io::ErrorKind::NotFound {
        ArtifactError::NotFound { path }
    } else {
        ArtifactError::Io { path, source }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn write(&self, image: &ImageArray, name: &Path, overwrite: bool) -> Result<(), ArtifactError> {
        let path = self.resolve(name);
        if !overwrite && path.exists() {
            return Err(ArtifactError::AlreadyExists { path });
        }
        let bytes = serde_json::to_vec(&StoredImage::encode(image)).map_err(|source| ArtifactError::Format {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, bytes).map_err(|source| io_error(path, source))
    }

    fn read(&self, name: &Path) -> Result<ImageArray, ArtifactError> {
        let path = self.resolve(name);
        let bytes = fs::read(&path).map_err(|source| io_error(path.clone(), source))?;
        let stored: StoredImage =
            serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Format {
                path: path.clone(),
                source,
            })?;
        stored
            .decode()
            .map_err(|message| ArtifactError::Corrupt { path, message })
    }

    fn exists(&self, name: &Path) -> bool {
        self.resolve(name).is_file()
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<(), ArtifactError> {
        let src = self.resolve(from);
        let dst = self.resolve(to);
        if !src.is_file() {
            return Err(ArtifactError::NotFound { path: src });
        }
        fs::copy(&src, &dst)
            .map(|_| ())
            .map_err(|source| io_error(dst, source))
    }

    fn remove(&self, name: &Path) -> Result<(), ArtifactError> {
        let path = self.resolve(name);
        fs::remove_file(&path).map_err(|source| io_error(path, source))
    }
}

impl TrialArtifactPolicy {
    /// Publish the winning image under `canonical` and dispose of the trial
    /// images this policy does not keep.
    ///
    /// The canonical copy is written before anything is removed. Calling this
    /// again after a successful run is a no-op.
    pub fn apply<A: ArtifactStore + ?Sized>(
        &self,
        store: &A,
        trial_artifacts: &[PathBuf],
        winner: &Path,
        canonical: &Path,
    ) -> Result<(), ArtifactError> {
        if store.exists(winner) {
            if winner != canonical {
                store.copy(winner, canonical)?;
            }
        } else if !store.exists(canonical) {
            return Err(ArtifactError::NotFound {
                path: winner.to_path_buf(),
            });
        }

        match self {
            TrialArtifactPolicy::RetainAll => {}
            TrialArtifactPolicy::RetainBestOnly => {
                for name in trial_artifacts {
                    if name.as_path() == canonical {
                        continue;
                    }
                    match store.remove(name) {
                        Ok(()) | Err(ArtifactError::NotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        log::debug!(
            "[CV] applied {:?} to {} trial images; best image is {}",
            self,
            trial_artifacts.len(),
            canonical.display()
        );
        Ok(())
    }
}

/// Name under which one trial's full-data image is stored.
pub fn trial_artifact_name(l1: f64, ltsv: f64) -> PathBuf {
    PathBuf::from(format!("L1_{l1:e}_Ltsv_{ltsv:e}.{IMAGE_SUFFIX}"))
}

pub fn canonical_artifact_name(image_prefix: &str) -> PathBuf {
    PathBuf::from(format!("{image_prefix}.{IMAGE_SUFFIX}"))
}

/// Row-per-trial `L1, Ltsv, MSE` record of a search, in visitation order.
pub struct CvTableWriter {
    path: PathBuf,
    writer: csv::Writer<fs::File>,
}

impl CvTableWriter {
    pub fn create(path: &Path) -> Result<Self, ArtifactError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)
            .map_err(|source| ArtifactError::Table {
                path: path.to_path_buf(),
                source,
            })?;
        writer
            .write_record(["# L1", "Ltsv", "MSE"])
            .map_err(|source| ArtifactError::Table {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    pub fn write_row(&mut self, l1: f64, ltsv: f64, mse: f64) -> Result<(), ArtifactError> {
        self.writer
            .write_record([l1.to_string(), ltsv.to_string(), mse.to_string()])
            .map_err(|source| ArtifactError::Table {
                path: self.path.clone(),
                source,
            })?;
        // Keep completed rows on disk if the search aborts later.
        self.writer.flush().map_err(|source| ArtifactError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

pub fn read_cv_table(path: &Path) -> Result<Vec<(f64, f64, f64)>, ArtifactError> {
    let table_error = |source| ArtifactError::Table {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(table_error)?;
    let mut rows = Vec::new();
    for record in reader.deserialize::<(f64, f64, f64)>() {
        rows.push(record.map_err(table_error)?);
    }
    Ok(rows)
}
