//! Corpus scanning and content fingerprints.
//!
//! The corpus is either a single document or a directory walked with the
//! configured include/exclude globs. Each readable document is identified by
//! its path relative to the corpus root and fingerprinted with the SHA-256 of
//! its raw bytes, so renaming the root directory or touching mtimes never
//! invalidates a provisioned assistant.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::CorpusConfig;

/// Document id → hex SHA-256 digest. Ordered, so equal corpora serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(BTreeMap<String, String>);

impl Fingerprint {
    pub fn get(&self, document_id: &str) -> Option<&str> {
        self.0.get(document_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Fingerprint {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A readable source document, with its bytes kept for upload.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub id: String,
    pub path: PathBuf,
    pub digest: String,
    pub bytes: Vec<u8>,
}

impl SourceDocument {
    /// File name used for the upload.
    pub fn file_name(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }
}

/// A document that matched the globs but could not be read.
#[derive(Debug, Clone)]
pub struct SkippedDocument {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct CorpusScan {
    pub documents: Vec<SourceDocument>,
    pub skipped: Vec<SkippedDocument>,
}

impl CorpusScan {
    pub fn fingerprint(&self) -> Fingerprint {
        self.documents
            .iter()
            .map(|d| (d.id.clone(), d.digest.clone()))
            .collect()
    }
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn scan_corpus(corpus: &CorpusConfig) -> Result<CorpusScan> {
    let root = &corpus.root;
    if !root.exists() {
        bail!("Corpus root does not exist: {}", root.display());
    }

    let mut scan = CorpusScan::default();

    if root.is_file() {
        let id = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.display().to_string());
        read_document(root, id, &mut scan);
        return Ok(scan);
    }

    let include_set = build_globset(&corpus.include_globs)?;
    let exclude_set = build_globset(&corpus.exclude_globs)?;

    let walker = WalkDir::new(root).follow_links(corpus.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let id = e
                    .path()
                    .map(|p| relative_id(root, p))
                    .unwrap_or_else(|| root.display().to_string());
                scan.skipped.push(SkippedDocument {
                    id,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let id = relative_id(root, path);

        if exclude_set.is_match(&id) || !include_set.is_match(&id) {
            continue;
        }

        read_document(path, id, &mut scan);
    }

    // Sort for deterministic ordering
    scan.documents.sort_by(|a, b| a.id.cmp(&b.id));
    scan.skipped.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(scan)
}

fn read_document(path: &Path, id: String, scan: &mut CorpusScan) {
    match std::fs::read(path) {
        Ok(bytes) => scan.documents.push(SourceDocument {
            digest: digest_bytes(&bytes),
            id,
            path: path.to_path_buf(),
            bytes,
        }),
        Err(e) => {
            tracing::warn!(document = %id, error = %e, "skipping unreadable document");
            scan.skipped.push(SkippedDocument {
                id,
                reason: e.to_string(),
            });
        }
    }
}

fn relative_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn corpus(root: &Path, include: &[&str]) -> CorpusConfig {
        CorpusConfig {
            root: root.to_path_buf(),
            include_globs: include.iter().map(|s| s.to_string()).collect(),
            exclude_globs: vec![],
            follow_symlinks: false,
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("b.pdf"), b"second").unwrap();
        fs::write(tmp.path().join("a.pdf"), b"first").unwrap();

        let cfg = corpus(tmp.path(), &["**/*.pdf"]);
        let first = scan_corpus(&cfg).unwrap().fingerprint();
        let second = scan_corpus(&cfg).unwrap().fingerprint();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first.get("a.pdf"), Some(digest_bytes(b"first").as_str()));
    }

    #[test]
    fn test_fingerprint_ignores_root_location() {
        let one = TempDir::new().unwrap();
        let two = TempDir::new().unwrap();
        for dir in [one.path(), two.path()] {
            fs::create_dir_all(dir.join("anexos")).unwrap();
            fs::write(dir.join("ppa.pdf"), b"plano").unwrap();
            fs::write(dir.join("anexos/metas.pdf"), b"metas").unwrap();
        }

        let a = scan_corpus(&corpus(one.path(), &["**/*.pdf"])).unwrap();
        let b = scan_corpus(&corpus(two.path(), &["**/*.pdf"])).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(a.fingerprint().get("anexos/metas.pdf").is_some());
    }

    #[test]
    fn test_single_byte_change_changes_digest() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ppa.pdf");
        fs::write(&path, b"version-1").unwrap();
        fs::write(tmp.path().join("other.pdf"), b"unchanged").unwrap();
        let cfg = corpus(tmp.path(), &["**/*.pdf"]);
        let before = scan_corpus(&cfg).unwrap().fingerprint();

        fs::write(&path, b"version-2").unwrap();
        let after = scan_corpus(&cfg).unwrap().fingerprint();

        assert_ne!(before, after);
        assert_ne!(before.get("ppa.pdf"), after.get("ppa.pdf"));
        assert_eq!(before.get("other.pdf"), after.get("other.pdf"));
    }

    #[test]
    fn test_globs_filter_documents() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("ppa.pdf"), b"pdf").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"txt").unwrap();

        let scan = scan_corpus(&corpus(tmp.path(), &["**/*.pdf"])).unwrap();
        assert_eq!(scan.documents.len(), 1);
        assert_eq!(scan.documents[0].id, "ppa.pdf");
        assert_eq!(scan.documents[0].file_name(), "ppa.pdf");
    }

    #[test]
    fn test_single_file_root() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("documento_ppa.pdf");
        fs::write(&path, b"conteudo").unwrap();

        let scan = scan_corpus(&corpus(&path, &["**/*.pdf"])).unwrap();
        assert_eq!(scan.documents.len(), 1);
        assert_eq!(scan.documents[0].id, "documento_ppa.pdf");
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        assert!(scan_corpus(&corpus(&missing, &["**/*.pdf"])).is_err());
    }

    #[test]
    fn test_nested_file_name_for_upload() {
        let doc = SourceDocument {
            id: "anexos/metas.pdf".to_string(),
            path: PathBuf::from("/tmp/anexos/metas.pdf"),
            digest: String::new(),
            bytes: vec![],
        };
        assert_eq!(doc.file_name(), "metas.pdf");
    }
}
