//! Loading source files into in-memory [`Document`]s.
//!
//! Loading is best-effort: a file that cannot be read is logged and
//! reported as [`Skipped`], never aborting a directory load.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use encoding_rs::{UTF_8, WINDOWS_1252};
use rayon::prelude::*;
use serde::Serialize;

use crate::walker;

/// A supported document format, keyed by file extension.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Txt,
    Md,
    Rst,
    Py,
    Js,
    Java,
    Go,
    Rs,
    Cpp,
    Pdf,
}

impl FileType {
    pub const ALL: [FileType; 10] = [
        FileType::Txt,
        FileType::Md,
        FileType::Rst,
        FileType::Py,
        FileType::Js,
        FileType::Java,
        FileType::Go,
        FileType::Rs,
        FileType::Cpp,
        FileType::Pdf,
    ];

    /// Match a file extension, case-insensitively.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.extension() == ext)
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileType::Txt => "txt",
            FileType::Md => "md",
            FileType::Rst => "rst",
            FileType::Py => "py",
            FileType::Js => "js",
            FileType::Java => "java",
            FileType::Go => "go",
            FileType::Rs => "rs",
            FileType::Cpp => "cpp",
            FileType::Pdf => "pdf",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// The full text of one source file.
#[derive(Debug, Clone)]
pub struct Document {
    pub content: String,
    /// Canonical path of the file, used as the document's identity.
    pub source: String,
    pub file_type: FileType,
    /// Size of the file on disk in bytes.
    pub size: u64,
    /// Last modification time of the file.
    pub created_at: DateTime<Utc>,
}

/// A file that was found but not loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub source: String,
    pub reason: String,
}

/// Documents and skipped files from a single load.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub documents: Vec<Document>,
    pub skipped: Vec<Skipped>,
}

/// Aggregate figures over a set of loaded documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocumentStats {
    pub total_files: usize,
    pub total_bytes: u64,
    pub total_chars: usize,
    pub file_types: BTreeMap<FileType, usize>,
}

impl DocumentStats {
    pub fn from_documents(documents: &[Document]) -> Self {
        let mut stats = Self::default();
        for doc in documents {
            stats.total_files += 1;
            stats.total_bytes += doc.size;
            stats.total_chars += doc.content.chars().count();
            *stats.file_types.entry(doc.file_type).or_default() += 1;
        }
        stats
    }
}

/// Reads supported files from disk.
#[derive(Debug, Clone)]
pub struct DocumentLoader {
    pdf_available: bool,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentLoader {
    pub fn new() -> Self {
        let pdf_available = cfg!(feature = "pdf");
        if !pdf_available {
            tracing::debug!("built without PDF support, .pdf files will be skipped");
        }
        Self { pdf_available }
    }

    pub fn pdf_available(&self) -> bool {
        self.pdf_available
    }

    /// Load a single file, returning `None` (and logging why) when the
    /// file is missing, not a regular file, unsupported, or unreadable.
    pub fn load_file(&self, path: &Path) -> Option<Document> {
        match self.read_document(path) {
            Ok(doc) => Some(doc),
            Err(reason) => {
                tracing::warn!(path = %path.display(), %reason, "skipping file");
                None
            }
        }
    }

    /// Load every supported file under `dir`.
    pub fn load_directory(&self, dir: &Path, recursive: bool) -> Vec<Document> {
        self.scan_directory(dir, recursive).documents
    }

    /// Like [`load_directory`](Self::load_directory), but also reports the
    /// files that were skipped and why.
    pub fn scan_directory(&self, dir: &Path, recursive: bool) -> LoadOutcome {
        let discovery = match walker::discover_files(dir, recursive) {
            Ok(discovery) => discovery,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "cannot walk directory");
                return LoadOutcome {
                    documents: Vec::new(),
                    skipped: vec![Skipped {
                        source: dir.display().to_string(),
                        reason: e.to_string(),
                    }],
                };
            }
        };
        let files = discovery.files;

        tracing::debug!(
            path = %dir.display(),
            files = files.len(),
            unreadable = discovery.unreadable.len(),
            "discovered files"
        );

        let results: Vec<_> = files
            .par_iter()
            .map(|file| {
                (&file.absolute_path, self.read_document(&file.absolute_path))
            })
            .collect();

        let mut outcome = LoadOutcome {
            documents: Vec::new(),
            skipped: discovery
                .unreadable
                .into_iter()
                .map(|u| Skipped {
                    source: u.path.display().to_string(),
                    reason: u.reason,
                })
                .collect(),
        };
        for (path, result) in results {
            match result {
                Ok(doc) => outcome.documents.push(doc),
                Err(reason) => {
                    tracing::warn!(path = %path.display(), %reason, "skipping file");
                    outcome.skipped.push(Skipped {
                        source: path.display().to_string(),
                        reason,
                    });
                }
            }
        }
        outcome
    }

    /// Load a file or a directory tree.
    pub fn load_path(&self, path: &Path) -> LoadOutcome {
        if path.is_dir() {
            return self.scan_directory(path, true);
        }

        match self.read_document(path) {
            Ok(doc) => LoadOutcome {
                documents: vec![doc],
                skipped: Vec::new(),
            },
            Err(reason) => {
                tracing::warn!(path = %path.display(), %reason, "skipping file");
                LoadOutcome {
                    documents: Vec::new(),
                    skipped: vec![Skipped {
                        source: path.display().to_string(),
                        reason,
                    }],
                }
            }
        }
    }

    fn read_document(&self, path: &Path) -> Result<Document, String> {
        if !path.exists() {
            return Err("file not found".into());
        }
        let metadata = std::fs::metadata(path).map_err(|e| e.to_string())?;
        if !metadata.is_file() {
            return Err("not a regular file".into());
        }

        let file_type = FileType::from_path(path).ok_or_else(|| {
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default();
            format!("unsupported file type '{ext}'")
        })?;

        let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
        let content = match file_type {
            FileType::Pdf if !self.pdf_available => {
                return Err("PDF support is not available".into());
            }
            FileType::Pdf => extract_pdf(&bytes)?,
            _ => decode_text(&bytes)?,
        };

        let source = canonical(path).display().to_string();
        let created_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Document {
            content,
            source,
            file_type,
            size: metadata.len(),
            created_at,
        })
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Decode text as UTF-8, falling back to Windows-1252 (a superset of
/// Latin-1 that accepts every byte). NUL bytes mark the file as binary.
fn decode_text(bytes: &[u8]) -> Result<String, String> {
    if bytes.contains(&0) {
        return Err("binary content".into());
    }

    let (text, had_errors) = UTF_8.decode_with_bom_removal(bytes);
    if !had_errors {
        return Ok(text.into_owned());
    }

    tracing::debug!("content is not valid UTF-8, decoding as Windows-1252");
    let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
    Ok(text.into_owned())
}

#[cfg(feature = "pdf")]
fn extract_pdf(bytes: &[u8]) -> Result<String, String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| format!("PDF extraction failed: {e}"))
}

#[cfg(not(feature = "pdf"))]
fn extract_pdf(_bytes: &[u8]) -> Result<String, String> {
    Err("PDF support is not available".into())
}
