//! Layer descriptors and the content behind them.
//!
//! A [`Layer`] is immutable once built and is shared between images through
//! `Arc`. Its compressed bytes live in a file, in memory, or behind a
//! [`BlobSource`] (registry or daemon) that is only read on demand.

use std::fmt;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use imgkit_core::error::{ImageError, Result};
use sha2::{Digest, Sha256};

use crate::media::{self, OCI_LAYER_GZIP};
use crate::model::Descriptor;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Fetches blob bytes by digest from a backend that owns them.
pub trait BlobSource: fmt::Debug + Send + Sync {
    fn fetch(&self, digest: &str) -> Result<Vec<u8>>;
}

/// Where a layer's stored bytes come from.
#[derive(Debug, Clone)]
pub enum LayerBlob {
    /// Gzip file on disk
    File(PathBuf),
    /// Bytes held in memory
    Memory(Arc<Vec<u8>>),
    /// Fetched lazily from a registry or daemon
    Source(Arc<dyn BlobSource>),
}

/// One image layer.
#[derive(Debug, Clone)]
pub struct Layer {
    /// sha256 of the uncompressed tar stream
    pub diff_id: String,
    /// sha256 of the stored blob
    pub digest: String,
    /// Size of the stored blob in bytes
    pub size: i64,
    pub media_type: String,
    blob: LayerBlob,
}

impl Layer {
    /// Build a layer from a gzip-compressed or plain tar file.
    ///
    /// Plain tars are compressed in memory so every layer is stored gzipped.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::read_file(path, None)
    }

    /// Like [`Layer::from_file`] but trusts the caller's diff ID instead of
    /// hashing the uncompressed stream.
    pub fn from_file_with_diff_id(path: &Path, diff_id: &str) -> Result<Self> {
        Self::read_file(path, Some(diff_id))
    }

    fn read_file(path: &Path, diff_id: Option<&str>) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            ImageError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read layer {}: {}", path.display(), e),
            ))
        })?;

        if data.starts_with(&GZIP_MAGIC) {
            let diff_id = match diff_id {
                Some(d) => d.to_string(),
                None => {
                    let mut raw = Vec::new();
                    GzDecoder::new(data.as_slice()).read_to_end(&mut raw)?;
                    sha256_digest(&raw)
                }
            };
            return Ok(Self {
                diff_id,
                digest: sha256_digest(&data),
                size: data.len() as i64,
                media_type: OCI_LAYER_GZIP.to_string(),
                blob: LayerBlob::File(path.to_path_buf()),
            });
        }

        let diff_id = diff_id
            .map(str::to_string)
            .unwrap_or_else(|| sha256_digest(&data));
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&data)?;
        let compressed = encoder.finish()?;
        Ok(Self::from_bytes(compressed, &diff_id))
    }

    /// Layer over an already compressed blob whose diff ID is known.
    pub fn from_bytes(compressed: Vec<u8>, diff_id: &str) -> Self {
        Self {
            diff_id: diff_id.to_string(),
            digest: sha256_digest(&compressed),
            size: compressed.len() as i64,
            media_type: OCI_LAYER_GZIP.to_string(),
            blob: LayerBlob::Memory(Arc::new(compressed)),
        }
    }

    /// Layer described by `descriptor` whose bytes are fetched from `source`.
    pub fn from_source(descriptor: &Descriptor, diff_id: &str, source: Arc<dyn BlobSource>) -> Self {
        Self {
            diff_id: diff_id.to_string(),
            digest: descriptor.digest.clone(),
            size: descriptor.size,
            media_type: descriptor.media_type.clone(),
            blob: LayerBlob::Source(source),
        }
    }

    /// Same content under a different media type.
    pub fn with_media_type(&self, media_type: &str) -> Self {
        Self {
            media_type: media_type.to_string(),
            ..self.clone()
        }
    }

    pub fn blob(&self) -> &LayerBlob {
        &self.blob
    }

    /// The stored (usually compressed) bytes.
    pub fn compressed(&self) -> Result<Vec<u8>> {
        match &self.blob {
            LayerBlob::File(path) => Ok(std::fs::read(path)?),
            LayerBlob::Memory(data) => Ok(data.as_ref().clone()),
            LayerBlob::Source(source) => source.fetch(&self.digest),
        }
    }

    /// Reader over the uncompressed tar stream.
    pub fn uncompressed_reader(&self) -> Result<Box<dyn Read + Send>> {
        let data = self.compressed()?;
        if media::is_uncompressed_layer(&self.media_type) || !data.starts_with(&GZIP_MAGIC) {
            Ok(Box::new(Cursor::new(data)))
        } else {
            Ok(Box::new(GzDecoder::new(Cursor::new(data))))
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type.clone(),
            digest: self.digest.clone(),
            size: self.size,
            ..Default::default()
        }
    }
}

/// First layer in `layers` with the given diff ID.
pub fn find<'a>(layers: &'a [Arc<Layer>], diff_id: &str) -> Option<&'a Arc<Layer>> {
    layers.iter().find(|layer| layer.diff_id == diff_id)
}

/// Hex-encoded SHA256 of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// `sha256:`-prefixed digest of raw bytes.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", sha256_bytes(data))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write a tar holding `files`, gzipped when `gzip` is set.
    pub(crate) fn write_test_layer(path: &Path, files: &[(&str, &[u8])], gzip: bool) {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        let tar = builder.into_inner().unwrap();
        let data = if gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&tar).unwrap();
            encoder.finish().unwrap()
        } else {
            tar
        };
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(
            sha256_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(sha256_digest(b"hello").starts_with("sha256:2cf24dba"));
    }

    #[test]
    fn test_from_file_gzip_and_plain_share_diff_id() {
        let tmp = TempDir::new().unwrap();
        let gz = tmp.path().join("layer.tar.gz");
        let plain = tmp.path().join("layer.tar");
        write_test_layer(&gz, &[("etc/app", b"config")], true);
        write_test_layer(&plain, &[("etc/app", b"config")], false);

        let from_gz = Layer::from_file(&gz).unwrap();
        let from_plain = Layer::from_file(&plain).unwrap();

        assert_eq!(from_gz.diff_id, from_plain.diff_id);
        assert_eq!(from_plain.diff_id, sha256_digest(&std::fs::read(&plain).unwrap()));
        assert!(matches!(from_gz.blob(), LayerBlob::File(_)));
        assert!(matches!(from_plain.blob(), LayerBlob::Memory(_)));
        assert_eq!(from_gz.media_type, OCI_LAYER_GZIP);
    }

    #[test]
    fn test_from_file_with_diff_id_skips_hashing() {
        let tmp = TempDir::new().unwrap();
        let gz = tmp.path().join("layer.tar.gz");
        write_test_layer(&gz, &[("a", b"1")], true);

        let layer = Layer::from_file_with_diff_id(&gz, "sha256:known").unwrap();
        assert_eq!(layer.diff_id, "sha256:known");
        assert_eq!(layer.digest, sha256_digest(&std::fs::read(&gz).unwrap()));
    }

    #[test]
    fn test_from_file_missing() {
        let err = Layer::from_file(Path::new("/nonexistent/layer.tar")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/layer.tar"));
    }

    #[test]
    fn test_uncompressed_reader_round_trips_tar() {
        let tmp = TempDir::new().unwrap();
        let plain = tmp.path().join("layer.tar");
        write_test_layer(&plain, &[("hello.txt", b"hi")], false);
        let layer = Layer::from_file(&plain).unwrap();

        let mut archive = tar::Archive::new(layer.uncompressed_reader().unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["hello.txt"]);
    }

    #[test]
    fn test_with_media_type_keeps_content() {
        let layer = Layer::from_bytes(vec![1, 2, 3], "sha256:x");
        let docker = layer.with_media_type(media::DOCKER_LAYER_GZIP);
        assert_eq!(docker.digest, layer.digest);
        assert_eq!(docker.media_type, media::DOCKER_LAYER_GZIP);
        assert_eq!(docker.compressed().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_find_by_diff_id() {
        let layers = vec![
            Arc::new(Layer::from_bytes(vec![1], "sha256:a")),
            Arc::new(Layer::from_bytes(vec![2], "sha256:b")),
        ];
        assert_eq!(find(&layers, "sha256:b").unwrap().size, 1);
        assert!(find(&layers, "sha256:c").is_none());
    }
}
