//! Project indexer: walk a directory, read source files and upsert them into
//! the vector index in batches.

use super::vector::{Document, IndexError, VectorIndex};
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Documents sent to the index per upsert
pub const BATCH_SIZE: usize = 100;

const IGNORE_DIRECTORIES: &[&str] = &[
    "node_modules",
    ".git",
    "__pycache__",
    "dist",
    "build",
    ".vscode",
    "venv",
    ".venv",
    "env",
    "out",
    "target",
    "cody_index",
];

const IGNORE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "svg", "ico", "webp", "mp4", "mov", "avi", "mp3", "wav",
    "zip", "tar", "gz", "rar", "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "db",
    "sqlite3", "lock", "log",
];

const IGNORE_FILES: &[&str] = &["package-lock.json", "yarn.lock", "Cargo.lock"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    /// Files read and sent to the index
    pub indexed: usize,
    /// Files that could not be read as UTF-8 or were empty
    pub skipped: usize,
    /// Documents whose content changed and were re-embedded
    pub embedded: usize,
    pub failed_batches: usize,
    pub total_documents: usize,
}

impl IndexReport {
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Indexed {} file(s), {} re-embedded, {} skipped. Total documents in index: {}.",
            self.indexed, self.embedded, self.skipped, self.total_documents
        );
        if self.failed_batches > 0 {
            out.push_str(&format!(" {} batch(es) failed.", self.failed_batches));
        }
        out
    }
}

fn is_ignored_dir(name: &str) -> bool {
    IGNORE_DIRECTORIES.contains(&name)
}

/// Whether a file (path relative to the project root) belongs in the index.
pub fn should_index(relative: &Path) -> bool {
    let name = relative.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if IGNORE_FILES.contains(&name) {
        return false;
    }
    let in_ignored_dir = relative
        .parent()
        .map(|parent| {
            parent
                .components()
                .any(|c| c.as_os_str().to_str().is_some_and(is_ignored_dir))
        })
        .unwrap_or(false);
    if in_ignored_dir {
        return false;
    }
    let ext = relative
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    !IGNORE_EXTENSIONS.contains(&ext.as_str())
}

/// Walk `root` and read every indexable file. Returns the documents (sorted
/// by id) and the number of files skipped as unreadable or empty.
pub fn collect_documents(root: &Path) -> Result<(Vec<Document>, usize), IndexError> {
    if !root.is_dir() {
        return Err(IndexError::NotADirectory(root.to_path_buf()));
    }

    let candidates: Vec<(PathBuf, String)> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !e.file_name().to_str().is_some_and(is_ignored_dir)
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let relative = e.path().strip_prefix(root).ok()?.to_path_buf();
            if !should_index(&relative) {
                return None;
            }
            let id = relative.to_string_lossy().replace('\\', "/");
            Some((e.into_path(), id))
        })
        .collect();

    let read: Vec<Option<Document>> = candidates
        .par_iter()
        .map(|(path, id)| match fs::read_to_string(path) {
            Ok(text) if !text.is_empty() => Some(Document::for_path(id, text)),
            Ok(_) => None,
            Err(err) => {
                warn!("Could not read {}: {}. Skipping.", path.display(), err);
                None
            }
        })
        .collect();

    let skipped = read.iter().filter(|d| d.is_none()).count();
    let mut documents: Vec<Document> = read.into_iter().flatten().collect();
    documents.sort_by(|a, b| a.id.cmp(&b.id));
    Ok((documents, skipped))
}

/// Index a whole project. A failing batch is logged and skipped; the rest
/// still land.
pub async fn index_project(root: &Path, index: &dyn VectorIndex) -> Result<IndexReport, IndexError> {
    info!("Indexing codebase at {}", root.display());
    let root_owned = root.to_path_buf();
    let (documents, skipped) = tokio::task::spawn_blocking(move || collect_documents(&root_owned))
        .await
        .map_err(|e| IndexError::Io(std::io::Error::other(e.to_string())))??;

    let mut report = IndexReport {
        indexed: documents.len(),
        skipped,
        ..IndexReport::default()
    };

    if documents.is_empty() {
        info!("No files found to index");
    }

    for (batch_no, batch) in documents.chunks(BATCH_SIZE).enumerate() {
        match index.upsert(batch.to_vec()).await {
            Ok(embedded) => {
                report.embedded += embedded;
                debug!("Added batch {} ({} documents)", batch_no + 1, batch.len());
            }
            Err(err) => {
                report.failed_batches += 1;
                warn!("Failed to add batch {}: {}", batch_no + 1, err);
            }
        }
    }

    report.total_documents = index.count().await;
    info!("{}", report.summary());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::vector::tests::LetterEmbedder;
    use crate::server::vector::{LocalVectorIndex, ScoredDocument};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/main.rs", b"fn main() {}");
        write(root, "src/util/mod.rs", b"pub fn util() {}");
        write(root, "README.md", b"# demo");
        write(root, "node_modules/react/index.js", b"module.exports = {}");
        write(root, "target/debug/out.rs", b"// generated");
        write(root, "assets/logo.png", b"\x89PNG");
        write(root, "package-lock.json", b"{}");
        write(root, "Cargo.lock", b"# lock");
        write(root, "empty.txt", b"");
        write(root, "binary.dat", &[0xff, 0xfe, 0x00, 0xc3]);
        dir
    }

    #[test]
    fn test_should_index_rules() {
        assert!(should_index(Path::new("src/app.ts")));
        assert!(should_index(Path::new("build.rs")));
        assert!(!should_index(Path::new("build/app.js")));
        assert!(!should_index(Path::new("a/.git/config")));
        assert!(!should_index(Path::new("img/photo.JPG")));
        assert!(!should_index(Path::new("web/yarn.lock")));
        assert!(!should_index(Path::new("server.log")));
    }

    #[test]
    fn test_collect_skips_ignored_and_unreadable() {
        let dir = project();
        let (docs, skipped) = collect_documents(dir.path()).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["README.md", "src/main.rs", "src/util/mod.rs"]);
        assert_eq!(docs[1].path(), "src/main.rs");
        // empty.txt and binary.dat
        assert_eq!(skipped, 2);
    }

    #[test]
    fn test_collect_rejects_non_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.rs");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            collect_documents(&file),
            Err(IndexError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_index_project_reports_counts() {
        let dir = project();
        let index = LocalVectorIndex::in_memory(Arc::new(LetterEmbedder::default()));
        let report = index_project(dir.path(), &index).await.unwrap();
        assert_eq!(report.indexed, 3);
        assert_eq!(report.embedded, 3);
        assert_eq!(report.total_documents, 3);
        assert_eq!(report.failed_batches, 0);

        // Second run re-embeds nothing
        let again = index_project(dir.path(), &index).await.unwrap();
        assert_eq!(again.embedded, 0);
        assert_eq!(again.total_documents, 3);
    }

    struct FlakyIndex {
        calls: AtomicUsize,
        accepted: AtomicUsize,
    }

    #[async_trait]
    impl VectorIndex for FlakyIndex {
        async fn upsert(&self, documents: Vec<Document>) -> Result<usize, IndexError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(IndexError::Embedding("quota".into()));
            }
            self.accepted.fetch_add(documents.len(), Ordering::SeqCst);
            Ok(documents.len())
        }
        async fn query(&self, _text: &str, _k: usize) -> Result<Vec<ScoredDocument>, IndexError> {
            Ok(Vec::new())
        }
        async fn count(&self) -> usize {
            self.accepted.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_failed_batch_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..(BATCH_SIZE + 5) {
            write(dir.path(), &format!("src/f{i:03}.py"), b"x = 1");
        }
        let index = FlakyIndex {
            calls: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
        };
        let report = index_project(dir.path(), &index).await.unwrap();
        assert_eq!(report.indexed, BATCH_SIZE + 5);
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.total_documents, 5);
        assert!(report.summary().contains("1 batch(es) failed"));
    }
}
