use crate::error::{Result, WardenError};
use crate::service::types::ArtifactKind;
use std::fs;
use std::path::{Path, PathBuf};

/// A launchable artifact found in the configured folder.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ArtifactEntry {
    pub name: String,
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub size_bytes: u64,
}

impl ArtifactEntry {
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// List the launchable artifacts in `folder`, filtered to the kinds
/// recognized on the current platform family, files only, sorted by
/// (kind, name).
pub fn list_artifacts(folder: &Path) -> Result<Vec<ArtifactEntry>> {
    if !folder.is_dir() {
        return Err(WardenError::NotADirectory(folder.to_path_buf()));
    }

    let recognized = ArtifactKind::recognized_on_host();
    let mut entries = Vec::new();

    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(kind) = ArtifactKind::from_path(&path) else {
            continue;
        };
        if !recognized.contains(&kind) {
            continue;
        }
        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        entries.push(ArtifactEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path,
            kind,
            size_bytes,
        });
    }

    entries.sort_by(|a, b| (a.kind.label(), &a.name).cmp(&(b.kind.label(), &b.name)));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_list_artifacts_filters_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("zeta.jar"), b"jar").unwrap();
        fs::write(temp_dir.path().join("alpha.jar"), b"jar").unwrap();
        fs::write(temp_dir.path().join("runner.sh"), b"#!/bin/sh\n").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), b"not an artifact").unwrap();
        fs::create_dir(temp_dir.path().join("sub.jar")).unwrap();

        let entries = list_artifacts(temp_dir.path()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();

        #[cfg(not(windows))]
        assert_eq!(names, vec!["alpha.jar", "zeta.jar", "runner.sh"]);
        #[cfg(windows)]
        assert_eq!(names, vec!["alpha.jar", "zeta.jar"]);

        assert!(entries.iter().all(|e| e.size_bytes > 0));
    }

    #[test]
    fn test_list_artifacts_missing_folder() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");
        assert!(matches!(
            list_artifacts(&missing),
            Err(WardenError::NotADirectory(_))
        ));
    }
}
