//! # VectorIndex
//!
//! Flat embedding index over text passages.
//!
//! The index is two parallel sequences, embedding vectors and the passages
//! they were computed from, addressed by insertion position `0..N`. Search is
//! exact: every stored vector is compared with the query by squared Euclidean
//! distance (in parallel via `rayon`) and the `k` nearest are returned,
//! nearest first, ties going to the earlier insertion.
//!
//! ## Responsibilities
//! - **Dimension discipline**: the first vector fixes `D` (unless the index was
//!   pre-sized with [`VectorIndex::with_dimension`]); later vectors must match.
//! - **Atomic appends**: an [`add`](VectorIndex::add) either appends the whole
//!   batch or nothing.
//! - **Persistence**: [`save`](VectorIndex::save) / [`load`](VectorIndex::load)
//!   move both sequences together.
//! - **Approximate search** (opt-in): a `hora` HNSW index kept alongside the
//!   flat data, see [`VectorIndex::set_approximate_search`].
//!
//! ## Serialization layout
//! Two artifacts per index, named from a base name by [`IndexPaths`]:
//! - `<name>.index`: `bincode` encoding of the format version, `D`, the passage
//!   count, a `blake3` digest of the ordered passages, and the vectors.
//! - `<name>_texts.json`: the passages as a JSON array of strings.
//!
//! The digest ties the pair together; loading a vector artifact next to a
//! text artifact from another build fails instead of silently mispairing.
//!
//! ## Quick Example
//! ```
//! use iris_rag::vector_store::VectorIndex;
//!
//! let mut index = VectorIndex::new();
//! index
//!     .add(
//!         vec!["glaucoma".into(), "cataract".into()],
//!         vec![vec![0.0, 1.0], vec![1.0, 0.0]],
//!     )
//!     .unwrap();
//! let hits = index.search(&[0.9, 0.1], 1).unwrap();
//! assert_eq!(hits[0].text, "cataract");
//! ```

use std::{
    cmp::Ordering,
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{RagError, Result};

/// A fixed-length embedding produced by the embedding gateway.
pub type Embedding = Vec<f32>;

/// An index shared between the ingestion writer and concurrent query readers.
///
/// `add` needs the write half; `search` only ever takes the read half.
pub type SharedIndex = Arc<RwLock<VectorIndex>>;

/// Bumped whenever the vector artifact layout changes.
const FORMAT_VERSION: u32 = 1;

/// A retrievable passage and its position in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Insertion position in the index.
    pub id: usize,
    /// The passage text, exactly as it was indexed.
    pub text: String,
}

/// Locations of the two artifacts that make up one persisted index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPaths {
    /// Binary vector artifact.
    pub index: PathBuf,
    /// JSON text artifact.
    pub texts: PathBuf,
}

impl IndexPaths {
    /// Artifact paths for index `name` under `dir`.
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            index: dir.join(format!("{name}.index")),
            texts: dir.join(format!("{name}_texts.json")),
        }
    }
}

#[derive(Serialize)]
struct IndexArtifactRef<'a> {
    format_version: u32,
    dimension: Option<usize>,
    count: usize,
    texts_digest: String,
    vectors: &'a [Embedding],
}

#[derive(Deserialize)]
struct IndexArtifact {
    format_version: u32,
    dimension: Option<usize>,
    count: usize,
    texts_digest: String,
    vectors: Vec<Embedding>,
}

/// Ordered (vector, passage) pairs with exact k-nearest-neighbor search.
pub struct VectorIndex {
    dimension: Option<usize>,
    vectors: Vec<Embedding>,
    texts: Vec<String>,
    approximate: bool,
    ann: Option<HNSWIndex<f32, usize>>,
}

impl fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimension", &self.dimension)
            .field("len", &self.vectors.len())
            .field("approximate", &self.approximate)
            .finish()
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex {
    /// An empty index whose dimension is fixed by the first vector added.
    pub fn new() -> Self {
        Self {
            dimension: None,
            vectors: Vec::new(),
            texts: Vec::new(),
            approximate: false,
            ann: None,
        }
    }

    /// An empty index that only accepts vectors of length `dimension`.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: Some(dimension),
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// The established dimension, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Stored passages in insertion order.
    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    /// Stored vectors in insertion order.
    pub fn vectors(&self) -> &[Embedding] {
        &self.vectors
    }

    /// The passage stored at position `id`.
    pub fn chunk(&self, id: usize) -> Option<TextChunk> {
        self.texts.get(id).map(|text| TextChunk {
            id,
            text: text.clone(),
        })
    }

    pub fn is_approximate(&self) -> bool {
        self.approximate
    }

    /// Turn the HNSW side index on or off.
    ///
    /// Enabling builds the HNSW graph over everything currently stored; the
    /// graph is then rebuilt on every successful [`add`](Self::add). Disabling
    /// drops it and search goes back to the exact scan.
    ///
    /// # Errors
    /// [`RagError::Index`] if the graph cannot be built; the index stays exact.
    pub fn set_approximate_search(&mut self, enabled: bool) -> Result<()> {
        if !enabled {
            self.approximate = false;
            self.ann = None;
            return Ok(());
        }

        self.ann = match self.dimension {
            Some(dimension) if !self.vectors.is_empty() => {
                Some(build_ann(dimension, &self.vectors, &[])?)
            }
            _ => None,
        };
        self.approximate = true;
        Ok(())
    }

    /// Append `texts[i]` ↔ `vectors[i]` pairs, preserving order.
    ///
    /// Nothing is appended unless every check passes.
    ///
    /// # Errors
    /// - [`RagError::LengthMismatch`] if the two sequences differ in length.
    /// - [`RagError::DimensionMismatch`] if any vector's length differs from the
    ///   index dimension (or, for an empty index, from the first vector's).
    /// - [`RagError::Index`] if approximate search is on and the graph rebuild fails.
    pub fn add(&mut self, texts: Vec<String>, vectors: Vec<Embedding>) -> Result<()> {
        if texts.len() != vectors.len() {
            return Err(RagError::LengthMismatch {
                chunks: texts.len(),
                vectors: vectors.len(),
            });
        }
        let Some(first) = vectors.first() else {
            return Ok(());
        };

        let expected = self.dimension.unwrap_or(first.len());
        if let Some(bad) = vectors
            .iter()
            .find(|v| v.len() != expected || v.is_empty())
        {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }

        let ann = if self.approximate {
            Some(build_ann(expected, &self.vectors, &vectors)?)
        } else {
            None
        };

        let added = vectors.len();
        self.dimension = Some(expected);
        self.vectors.extend(vectors);
        self.texts.extend(texts);
        self.ann = ann;

        info!(
            added,
            total = self.vectors.len(),
            dimension = expected,
            "Appended passages to vector index"
        );
        Ok(())
    }

    /// Positions and squared distances of the `k` vectors nearest to `query`.
    ///
    /// Sorted by non-decreasing distance, ties by lower position. Returns all
    /// entries when `k >= len()`, and nothing for an empty index or `k == 0`.
    ///
    /// # Errors
    /// [`RagError::DimensionMismatch`] if the index is non-empty and `query`
    /// has the wrong length.
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        if k == 0 || self.vectors.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(expected) = self.dimension {
            if query.len() != expected {
                return Err(RagError::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }

        let mut scored: Vec<(usize, f32)> = match (&self.ann, self.approximate) {
            (Some(ann), true) => ann
                .search(query, k)
                .into_iter()
                .filter(|id| *id < self.vectors.len())
                .map(|id| (id, squared_distance(&self.vectors[id], query)))
                .collect(),
            _ => self
                .vectors
                .par_iter()
                .enumerate()
                .map(|(id, v)| (id, squared_distance(v, query)))
                .collect(),
        };

        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, by_distance_then_id);
            scored.truncate(k);
        }
        scored.sort_by(by_distance_then_id);

        debug!(k, hits = scored.len(), "Nearest-neighbor search");
        Ok(scored)
    }

    /// The `k` passages nearest to `query`, nearest first.
    ///
    /// See [`nearest`](Self::nearest) for ordering and errors.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<TextChunk>> {
        Ok(self
            .nearest(query, k)?
            .into_iter()
            .map(|(id, _)| TextChunk {
                id,
                text: self.texts[id].clone(),
            })
            .collect())
    }

    /// Write both artifacts.
    ///
    /// Each artifact is written to a temporary file in its destination
    /// directory first; the two are moved into place only after both writes
    /// succeeded. A pair already at `paths` is set aside as `*.bak` while the
    /// new one is moved in, and put back if either move fails, so a failed save
    /// leaves the previous pair loadable.
    ///
    /// # Errors
    /// - [`RagError::Io`] on any filesystem failure.
    /// - [`RagError::Index`] if encoding fails.
    pub fn save(&self, paths: &IndexPaths) -> Result<()> {
        self.save_with(paths, persist_file)
    }

    fn save_with(
        &self,
        paths: &IndexPaths,
        persist: impl Fn(NamedTempFile, &Path) -> io::Result<()>,
    ) -> Result<()> {
        let artifact = IndexArtifactRef {
            format_version: FORMAT_VERSION,
            dimension: self.dimension,
            count: self.texts.len(),
            texts_digest: texts_digest(&self.texts),
            vectors: &self.vectors,
        };
        let index_bytes = bincode::serde::encode_to_vec(&artifact, bincode::config::standard())
            .map_err(|e| RagError::Index(format!("encoding vector artifact: {e}")))?;
        let text_bytes = serde_json::to_vec_pretty(&self.texts)
            .map_err(|e| RagError::Index(format!("encoding text artifact: {e}")))?;

        let staged_texts = stage(&paths.texts, &text_bytes)?;
        let staged_index = stage(&paths.index, &index_bytes)?;

        commit_pair(
            [(staged_texts, &paths.texts), (staged_index, &paths.index)],
            persist,
        )?;

        info!(
            index = %paths.index.display(),
            texts = %paths.texts.display(),
            entries = self.texts.len(),
            "Saved vector index"
        );
        Ok(())
    }

    /// Restore an index saved with [`save`](Self::save).
    ///
    /// Either returns a complete, consistent index or an error; nothing is
    /// partially restored. The result uses exact search.
    ///
    /// # Errors
    /// - [`RagError::Io`] if either artifact is missing or unreadable.
    /// - [`RagError::Deserialization`] if either artifact fails to decode or the
    ///   pair disagrees (count, digest, vector lengths).
    pub fn load(paths: &IndexPaths) -> Result<Self> {
        let index_bytes = fs::read(&paths.index).map_err(|e| RagError::io(&paths.index, e))?;
        let text_bytes = fs::read(&paths.texts).map_err(|e| RagError::io(&paths.texts, e))?;

        let index_name = paths.index.display().to_string();
        let texts_name = paths.texts.display().to_string();

        let (artifact, _): (IndexArtifact, usize) =
            bincode::serde::decode_from_slice(&index_bytes, bincode::config::standard())
                .map_err(|e| RagError::deserialization(&index_name, e))?;
        let texts: Vec<String> = serde_json::from_slice(&text_bytes)
            .map_err(|e| RagError::deserialization(&texts_name, e))?;

        if artifact.format_version != FORMAT_VERSION {
            return Err(RagError::deserialization(
                &index_name,
                format!("unsupported format version {}", artifact.format_version),
            ));
        }
        if artifact.vectors.len() != artifact.count || texts.len() != artifact.count {
            return Err(RagError::deserialization(
                &index_name,
                format!(
                    "artifact pair disagrees: {} vectors, {} passages, header says {}",
                    artifact.vectors.len(),
                    texts.len(),
                    artifact.count
                ),
            ));
        }
        if texts_digest(&texts) != artifact.texts_digest {
            return Err(RagError::deserialization(
                &texts_name,
                "passages do not belong to this vector artifact",
            ));
        }
        match artifact.dimension {
            Some(dimension) => {
                if let Some(bad) = artifact.vectors.iter().find(|v| v.len() != dimension) {
                    return Err(RagError::deserialization(
                        &index_name,
                        format!("vector of length {} in a {dimension}-d index", bad.len()),
                    ));
                }
            }
            None if !artifact.vectors.is_empty() => {
                return Err(RagError::deserialization(
                    &index_name,
                    "vectors present without a dimension",
                ));
            }
            None => {}
        }

        info!(
            index = %paths.index.display(),
            entries = texts.len(),
            dimension = ?artifact.dimension,
            "Loaded vector index"
        );

        Ok(Self {
            dimension: artifact.dimension,
            vectors: artifact.vectors,
            texts,
            approximate: false,
            ann: None,
        })
    }

    /// Wrap the index for sharing between a writer and concurrent readers.
    pub fn into_shared(self) -> SharedIndex {
        Arc::new(RwLock::new(self))
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

fn by_distance_then_id(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    a.1.total_cmp(&b.1).then(a.0.cmp(&b.0))
}

/// Digest over the ordered passage list, length-prefixed so boundaries count.
fn texts_digest(texts: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(texts.len() as u64).to_le_bytes());
    for text in texts {
        hasher.update(&(text.len() as u64).to_le_bytes());
        hasher.update(text.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Write `bytes` to a temporary file next to `target`.
fn stage(target: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| RagError::io(&dir, e))?;

    let mut file = NamedTempFile::new_in(&dir).map_err(|e| RagError::io(&dir, e))?;
    file.write_all(bytes)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| RagError::io(target, e))?;
    Ok(file)
}

fn persist_file(file: NamedTempFile, target: &Path) -> io::Result<()> {
    file.persist(target).map(drop).map_err(|e| e.error)
}

/// `<target>.bak`, next to the target.
fn backup_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// Move staged files onto their targets as a unit.
///
/// Existing targets are renamed to their backup paths first. If any move
/// fails, the files already moved in are removed and every backup is renamed
/// back; on success the backups are deleted.
fn commit_pair(
    staged: [(NamedTempFile, &PathBuf); 2],
    persist: impl Fn(NamedTempFile, &Path) -> io::Result<()>,
) -> Result<()> {
    let mut backups: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(2);
    for (_, target) in &staged {
        if !target.exists() {
            continue;
        }
        let backup = backup_path(target);
        if let Err(e) = fs::rename(target, &backup) {
            restore_backups(&backups);
            return Err(RagError::io(*target, e));
        }
        backups.push((backup, target.to_path_buf()));
    }

    let mut placed: Vec<&Path> = Vec::with_capacity(2);
    for (file, target) in staged {
        if let Err(e) = persist(file, target.as_path()) {
            for path in &placed {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Could not remove partially saved artifact");
                }
            }
            restore_backups(&backups);
            return Err(RagError::io(target, e));
        }
        placed.push(target.as_path());
    }

    for (backup, _) in &backups {
        if let Err(e) = fs::remove_file(backup) {
            warn!(path = %backup.display(), error = %e, "Could not remove artifact backup");
        }
    }
    Ok(())
}

fn restore_backups(backups: &[(PathBuf, PathBuf)]) {
    for (backup, target) in backups.iter().rev() {
        if let Err(e) = fs::rename(backup, target) {
            warn!(
                backup = %backup.display(),
                target = %target.display(),
                error = %e,
                "Could not restore artifact backup"
            );
        }
    }
}

/// Build an HNSW graph over `existing` followed by `incoming`.
fn build_ann(
    dimension: usize,
    existing: &[Embedding],
    incoming: &[Embedding],
) -> Result<HNSWIndex<f32, usize>> {
    let mut index = HNSWIndex::<f32, usize>::new(dimension, &HNSWParams::default());
    for (id, vector) in existing.iter().chain(incoming).enumerate() {
        index
            .add(vector, id)
            .map_err(|e| RagError::Index(format!("HNSW add failed: {e}")))?;
    }
    index
        .build(Metric::Euclidean)
        .map_err(|e| RagError::Index(format!("HNSW build failed: {e}")))?;
    Ok(index)
}
