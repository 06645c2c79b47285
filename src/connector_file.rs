//! File collection connector.
//!
//! A manifest of local paths. Directory entries are expanded recursively
//! (sorted, hidden entries skipped); every resulting file must have a
//! supported extension. Each file is one unit whose name is the entry's
//! display name, or its path relative to the listed directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use zerag_core::models::{ConnectionParams, FileEntry, SourceKind};

use crate::error::{RagError, RagResult};
use crate::extract::{extract_file, DocumentFormat};
use crate::traits::{Connector, SourceUnit, UnitRef};

pub struct FileCollection {
    entries: Vec<FileEntry>,
}

impl FileCollection {
    pub fn new(params: &ConnectionParams) -> RagResult<Self> {
        if params.files.is_empty() {
            return Err(RagError::validation(
                "file data source has no files in its manifest",
            ));
        }
        for entry in &params.files {
            let path = Path::new(&entry.path);
            if entry.path.trim().is_empty() {
                return Err(RagError::validation("file entry with empty path"));
            }
            // Directories are checked when expanded.
            if !path.is_dir() {
                DocumentFormat::from_path(path).map_err(|e| RagError::validation(e.to_string()))?;
            }
        }
        Ok(Self {
            entries: params.files.clone(),
        })
    }

    fn expand(&self) -> RagResult<Vec<UnitRef>> {
        let mut units = Vec::new();
        for entry in &self.entries {
            let root = PathBuf::from(&entry.path);
            if !root.exists() {
                return Err(RagError::connection(format!(
                    "file not found: {}",
                    root.display()
                )));
            }
            if root.is_file() {
                units.push(UnitRef {
                    name: entry.display_name(),
                    locator: entry.path.clone(),
                });
                continue;
            }

            let walker = WalkDir::new(&root)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
            for item in walker {
                let item = item.map_err(|e| RagError::connection(e.to_string()))?;
                if !item.file_type().is_file() {
                    continue;
                }
                let path = item.path();
                if DocumentFormat::from_path(path).is_err() {
                    tracing::debug!(path = %path.display(), "skipping unsupported file");
                    continue;
                }
                let rel = path.strip_prefix(&root).unwrap_or(path);
                units.push(UnitRef {
                    name: rel.to_string_lossy().replace('\\', "/"),
                    locator: path.to_string_lossy().into_owned(),
                });
            }
        }
        Ok(units)
    }
}

#[async_trait]
impl Connector for FileCollection {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    async fn test_connection(&self) -> RagResult<()> {
        if self.expand()?.is_empty() {
            return Err(RagError::validation("file data source contains no ingestible files"));
        }
        Ok(())
    }

    async fn list_units(&self) -> RagResult<Vec<UnitRef>> {
        self.expand()
    }

    async fn pull_unit(&self, unit: &UnitRef) -> RagResult<Vec<SourceUnit>> {
        let path = PathBuf::from(&unit.locator);
        let text = tokio::task::spawn_blocking(move || extract_file(&path))
            .await
            .map_err(|e| RagError::Internal(e.into()))?
            .map_err(|e| RagError::connection(format!("{}: {}", unit.name, e)))?;
        Ok(vec![SourceUnit {
            unit_name: unit.name.clone(),
            row_id: None,
            text,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params(paths: &[PathBuf]) -> ConnectionParams {
        ConnectionParams {
            files: paths
                .iter()
                .map(|p| FileEntry {
                    path: p.to_string_lossy().into_owned(),
                    filename: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pulls_text_files_in_manifest_order() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("b.txt");
        let b = tmp.path().join("a.md");
        std::fs::write(&a, "first").unwrap();
        std::fs::write(&b, "# second").unwrap();

        let conn = FileCollection::new(&params(&[a, b])).unwrap();
        conn.test_connection().await.unwrap();
        let units = conn
            .pull_units(std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].unit_name, "b.txt");
        assert_eq!(units[1].text, "# second");
    }

    #[tokio::test]
    async fn directories_expand_sorted_and_skip_hidden() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("docs");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("z.txt"), "z").unwrap();
        std::fs::write(dir.join("sub/a.txt"), "a").unwrap();
        std::fs::write(dir.join(".hidden.txt"), "h").unwrap();
        std::fs::write(dir.join("image.png"), "p").unwrap();

        let conn = FileCollection::new(&params(&[dir])).unwrap();
        let names: Vec<String> = conn
            .list_units()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.name)
            .collect();
        assert_eq!(names, vec!["sub/a.txt", "z.txt"]);
    }

    #[tokio::test]
    async fn missing_file_fails_connection_test() {
        let tmp = TempDir::new().unwrap();
        let conn = FileCollection::new(&params(&[tmp.path().join("gone.txt")])).unwrap();
        assert!(matches!(
            conn.test_connection().await,
            Err(RagError::Connection(_))
        ));
    }

    #[test]
    fn unsupported_extension_and_empty_manifest_rejected() {
        assert!(matches!(
            FileCollection::new(&ConnectionParams::default()),
            Err(RagError::Validation(_))
        ));
        assert!(matches!(
            FileCollection::new(&params(&[PathBuf::from("/tmp/x.exe")])),
            Err(RagError::Validation(_))
        ));
    }
}
