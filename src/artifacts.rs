//! Per-item artifacts on disk.
//!
//! Every artifact we write is named after the item it came from: same base
//! name, different extension, in a different directory. So `scans/acme.pdf`
//! becomes `text/acme.txt` and later `json/acme.json`. Workers only touch
//! paths derived from their own item, so no locking is needed.

use std::ffi::OsStr;

use tokio::fs;

use crate::{errors::ItemError, prelude::*};

/// The identifier we use for an item in logs and reports: its file name.
pub fn item_id(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Compute the artifact path for `source` inside `dir`, using `extension`.
///
/// Only the last extension is replaced, so `report.v2.pdf` maps to
/// `report.v2.txt`.
pub fn artifact_path(dir: &Path, source: &Path, extension: &str) -> Result<PathBuf> {
    let file_name = source
        .file_name()
        .ok_or_else(|| anyhow!("{:?} has no file name", source.display()))?;
    let mut path = dir.join(file_name);
    path.set_extension(extension);
    Ok(path)
}

/// Create `dir` and any missing parents.
pub async fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create directory {:?}", dir.display()))
}

/// List the regular files in `dir` with the given extension, sorted by name.
///
/// Sorting gives us a stable submission order, which makes `--take-first`
/// and log output reproducible.
pub fn list_inputs(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read input directory {:?}", dir.display()))?;
    let mut paths = vec![];
    for entry in entries {
        let entry = entry.with_context(|| {
            format!("failed to read entry in {:?}", dir.display())
        })?;
        let path = entry.path();
        if path.is_file() && path.extension() == Some(OsStr::new(extension)) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Write an artifact.
///
/// We write to a temporary sibling and rename it into place, so that an
/// interrupted batch never leaves a truncated artifact that `--skip-existing`
/// would later mistake for a finished one.
pub async fn write_artifact(path: &Path, contents: &[u8]) -> Result<(), ItemError> {
    let persistence = |source| ItemError::Persistence {
        path: path.to_owned(),
        source,
    };
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".partial");
    let tmp_path = PathBuf::from(tmp_name);
    let written = match fs::write(&tmp_path, contents).await {
        Ok(()) => fs::rename(&tmp_path, path).await,
        Err(err) => Err(err),
    };
    if let Err(err) = written {
        if let Err(cleanup_err) = fs::remove_file(&tmp_path).await {
            trace!(path = %tmp_path.display(), "Could not remove partial file: {}", cleanup_err);
        }
        return Err(persistence(err));
    }
    debug!(path = %path.display(), bytes = contents.len(), "Wrote artifact");
    Ok(())
}

/// Read an existing artifact, if there is one.
///
/// Missing or unreadable artifacts are treated as "not cached".
pub async fn read_existing_artifact(path: &Path) -> Option<String> {
    match fs::read_to_string(path).await {
        Ok(contents) => Some(contents),
        Err(err) => {
            trace!(path = %path.display(), "No usable artifact: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_path_replaces_extension_only() {
        let out = Path::new("/out");
        assert_eq!(
            artifact_path(out, Path::new("scans/acme.pdf"), "txt").unwrap(),
            PathBuf::from("/out/acme.txt")
        );
        assert_eq!(
            artifact_path(out, Path::new("report.v2.pdf"), "txt").unwrap(),
            PathBuf::from("/out/report.v2.txt")
        );
        assert_eq!(
            artifact_path(out, Path::new("acme.txt"), "json").unwrap(),
            PathBuf::from("/out/acme.json")
        );
    }

    #[test]
    fn artifact_path_depends_only_on_base_name() {
        let out = Path::new("/out");
        let key = |p: &str| artifact_path(out, Path::new(p), "txt").unwrap();
        assert_eq!(key("a/x.pdf"), key("b/x.pdf"));
        assert_ne!(key("a/x.pdf"), key("a/y.pdf"));
    }

    #[test]
    fn artifact_path_rejects_paths_without_file_names() {
        assert!(artifact_path(Path::new("/out"), Path::new("/"), "txt").is_err());
    }

    #[test]
    fn list_inputs_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.pdf", "a.pdf", "notes.txt", "b.pdf", "upper.PDF"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.pdf")).unwrap();

        let names = list_inputs(dir.path(), "pdf")
            .unwrap()
            .iter()
            .map(|p| item_id(p))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.pdf", "b.pdf", "c.pdf"]);
    }

    #[test]
    fn list_inputs_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_inputs(&dir.path().join("missing"), "pdf").is_err());
    }

    #[tokio::test]
    async fn write_artifact_round_trips_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        write_artifact(&path, b"hello").await.unwrap();
        assert_eq!(read_existing_artifact(&path).await.as_deref(), Some("hello"));
        assert!(!dir.path().join("a.txt.partial").exists());
    }

    #[tokio::test]
    async fn write_artifact_reports_persistence_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("a.txt");
        let err = write_artifact(&path, b"hello").await.unwrap_err();
        assert!(matches!(err, ItemError::Persistence { .. }));
    }

    #[tokio::test]
    async fn failed_rename_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory where the artifact should go makes the
        // rename fail after the partial file was written.
        let path = dir.path().join("a.txt");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();

        let err = write_artifact(&path, b"hello").await.unwrap_err();
        assert!(matches!(err, ItemError::Persistence { .. }));
        assert!(!dir.path().join("a.txt.partial").exists());
    }
}
