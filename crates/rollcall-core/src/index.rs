//! Known-face index: one reference embedding per person, built from a flat
//! directory of labelled images (the filename stem is the identity).

use crate::encoder::FaceEncoder;
use crate::types::Embedding;
use image::{ImageReader, RgbImage};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;
use thiserror::Error;

/// Extensions (lower-case) recognized as known-face images.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("known-faces directory {path} is unreadable: {source}")]
    DirectoryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown index policy {0:?} (expected \"rebuild\" or \"on-change\")")]
    UnknownPolicy(String),
}

/// A labelled reference embedding.
#[derive(Debug, Clone)]
pub struct KnownFace {
    pub name: String,
    pub embedding: Embedding,
    pub source: PathBuf,
}

/// Name → embedding mapping that remembers discovery order.
#[derive(Debug, Clone, Default)]
pub struct KnownFaceIndex {
    faces: Vec<KnownFace>,
}

impl KnownFaceIndex {
    /// Scan `dir` and extract the first face embedding of every image.
    ///
    /// Images that fail to decode or contain no face are skipped with a
    /// warning. Only an unreadable directory fails the whole build.
    pub fn build<E: FaceEncoder + ?Sized>(dir: &Path, encoder: &mut E) -> Result<Self, IndexError> {
        let mut index = Self::default();

        for path in image_files(dir)? {
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };

            let image = match load_image(&path) {
                Ok(img) => img,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to decode known-face image");
                    continue;
                }
            };

            match encoder.encode(&image) {
                Ok(embeddings) => match embeddings.into_iter().next() {
                    Some(embedding) => index.insert(KnownFace {
                        name,
                        embedding,
                        source: path,
                    }),
                    None => {
                        tracing::warn!(path = %path.display(), "no face found in known-face image");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to encode known-face image");
                }
            }
        }

        tracing::info!(dir = %dir.display(), faces = index.len(), "known-face index built");
        Ok(index)
    }

    /// Add a face; an existing entry with the same name is replaced in place.
    pub fn insert(&mut self, face: KnownFace) {
        match self.faces.iter_mut().find(|f| f.name == face.name) {
            Some(existing) => {
                tracing::debug!(
                    name = %face.name,
                    replaced = %existing.source.display(),
                    by = %face.source.display(),
                    "duplicate known-face name"
                );
                *existing = face;
            }
            None => self.faces.push(face),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Embedding> {
        self.faces.iter().find(|f| f.name == name).map(|f| &f.embedding)
    }

    /// Names in discovery order.
    pub fn names(&self) -> Vec<&str> {
        self.faces.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn faces(&self) -> &[KnownFace] {
        &self.faces
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Image files directly inside `dir`, sorted by file name.
fn image_files(dir: &Path) -> Result<Vec<PathBuf>, IndexError> {
    let unreadable = |source: std::io::Error| IndexError::DirectoryUnreadable {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        let path = entry.path();
        if path.is_file() && has_image_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Decode an image, sniffing the format from its content.
pub fn load_image(path: &Path) -> Result<RgbImage, image::ImageError> {
    Ok(ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?
        .to_rgb8())
}

/// Turn a user-supplied person name into a safe file stem.
///
/// Keeps ASCII alphanumerics, `-`, `_` and `.`, maps whitespace to `_`,
/// drops everything else and strips leading dots. `None` if nothing is left.
pub fn sanitize_name(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// When the cached index is rebuilt from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexPolicy {
    /// Rebuild on every request, so the index always reflects the directory.
    #[default]
    Rebuild,
    /// Rebuild only when the directory listing (names, sizes, mtimes) changes
    /// or after an explicit invalidation.
    OnChange,
}

impl fmt::Display for IndexPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexPolicy::Rebuild => "rebuild",
            IndexPolicy::OnChange => "on-change",
        })
    }
}

impl FromStr for IndexPolicy {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rebuild" | "always" => Ok(IndexPolicy::Rebuild),
            "on-change" | "on_change" | "cache" => Ok(IndexPolicy::OnChange),
            other => Err(IndexError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Snapshot of the image files in a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint(Vec<(PathBuf, u64, Option<SystemTime>)>);

impl Fingerprint {
    fn of(dir: &Path) -> Result<Self, IndexError> {
        let entries = image_files(dir)?
            .into_iter()
            .map(|path| {
                let meta = std::fs::metadata(&path).ok();
                let len = meta.as_ref().map(|m| m.len()).unwrap_or(0);
                let mtime = meta.and_then(|m| m.modified().ok());
                (path, len, mtime)
            })
            .collect();
        Ok(Self(entries))
    }
}

/// Holds the current index for one directory and decides when to rebuild it.
pub struct IndexCache {
    dir: PathBuf,
    policy: IndexPolicy,
    cached: Option<(Fingerprint, KnownFaceIndex)>,
}

impl IndexCache {
    pub fn new(dir: impl Into<PathBuf>, policy: IndexPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
            cached: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> IndexPolicy {
        self.policy
    }

    /// Force the next `refresh_index` to rebuild.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Return the index, rebuilding it first if the policy requires.
    pub fn refresh_index<E: FaceEncoder + ?Sized>(
        &mut self,
        encoder: &mut E,
    ) -> Result<&KnownFaceIndex, IndexError> {
        let fingerprint = Fingerprint::of(&self.dir)?;

        let entry = match self.cached.take() {
            Some((previous, index)) if self.policy == IndexPolicy::OnChange && previous == fingerprint => {
                tracing::debug!(dir = %self.dir.display(), "known-face index unchanged");
                (previous, index)
            }
            _ => (fingerprint, KnownFaceIndex::build(&self.dir, encoder)?),
        };

        Ok(&self.cached.insert(entry).1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncoderError;
    use crate::testing::{write_face, PixelEncoder};

    /// Wraps the pixel encoder and counts how many images it saw.
    struct CountingEncoder(usize);

    impl FaceEncoder for CountingEncoder {
        fn encode(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, EncoderError> {
            self.0 += 1;
            PixelEncoder.encode(image)
        }
    }

    #[test]
    fn test_build_one_entry_per_face_image() {
        let dir = tempfile::tempdir().unwrap();
        write_face(&dir.path().join("bob.png"), [0, 200, 0]);
        write_face(&dir.path().join("alice.jpg"), [200, 0, 0]);
        write_face(&dir.path().join("blank.jpeg"), [0, 0, 0]);
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let index = KnownFaceIndex::build(dir.path(), &mut PixelEncoder).unwrap();
        assert_eq!(index.names(), vec!["alice", "bob"]);
        assert_eq!(index.get("alice").unwrap().values, vec![200.0, 0.0, 0.0]);
        assert!(index.get("blank").is_none());
    }

    #[test]
    fn test_build_skips_undecodable_images() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"definitely not a jpeg").unwrap();
        write_face(&dir.path().join("carol.PNG"), [10, 20, 30]);

        let index = KnownFaceIndex::build(dir.path(), &mut PixelEncoder).unwrap();
        assert_eq!(index.names(), vec!["carol"]);
    }

    #[test]
    fn test_build_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = KnownFaceIndex::build(&dir.path().join("nope"), &mut PixelEncoder).unwrap_err();
        assert!(matches!(err, IndexError::DirectoryUnreadable { .. }));
    }

    #[test]
    fn test_duplicate_stem_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        write_face(&dir.path().join("dave.jpg"), [1, 1, 1]);
        write_face(&dir.path().join("dave.png"), [2, 2, 2]);

        let index = KnownFaceIndex::build(dir.path(), &mut PixelEncoder).unwrap();
        assert_eq!(index.len(), 1);
        // Sorted discovery: dave.jpg then dave.png
        assert_eq!(index.get("dave").unwrap().values, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("  Jane Doe "), Some("Jane_Doe".to_string()));
        assert_eq!(sanitize_name("../../etc/passwd"), Some("etcpasswd".to_string()));
        assert_eq!(sanitize_name("o'brien-2"), Some("obrien-2".to_string()));
        assert_eq!(sanitize_name("..."), None);
        assert_eq!(sanitize_name("   "), None);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("rebuild".parse::<IndexPolicy>().unwrap(), IndexPolicy::Rebuild);
        assert_eq!("On-Change".parse::<IndexPolicy>().unwrap(), IndexPolicy::OnChange);
        assert!("sometimes".parse::<IndexPolicy>().is_err());
        assert_eq!(IndexPolicy::OnChange.to_string(), "on-change");
    }

    #[test]
    fn test_rebuild_policy_rescans_every_time() {
        let dir = tempfile::tempdir().unwrap();
        write_face(&dir.path().join("erin.png"), [5, 5, 5]);

        let mut cache = IndexCache::new(dir.path(), IndexPolicy::Rebuild);
        let mut encoder = CountingEncoder(0);
        cache.refresh_index(&mut encoder).unwrap();
        cache.refresh_index(&mut encoder).unwrap();
        assert_eq!(encoder.0, 2);
    }

    #[test]
    fn test_on_change_policy_caches_until_directory_changes() {
        let dir = tempfile::tempdir().unwrap();
        write_face(&dir.path().join("erin.png"), [5, 5, 5]);

        let mut cache = IndexCache::new(dir.path(), IndexPolicy::OnChange);
        let mut encoder = CountingEncoder(0);
        cache.refresh_index(&mut encoder).unwrap();
        cache.refresh_index(&mut encoder).unwrap();
        assert_eq!(encoder.0, 1);

        write_face(&dir.path().join("frank.png"), [6, 6, 6]);
        let index = cache.refresh_index(&mut encoder).unwrap();
        assert_eq!(index.names(), vec!["erin", "frank"]);
        assert_eq!(encoder.0, 3);

        cache.invalidate();
        cache.refresh_index(&mut encoder).unwrap();
        assert_eq!(encoder.0, 5);
    }
}
