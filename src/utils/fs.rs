//! Filesystem helpers for agent workspaces

use std::path::{Path, PathBuf};

use crate::error::{ConductorError, Result};

/// Ensure a directory exists, creating parents as needed
pub async fn ensure_directory(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path).await.map_err(|e| {
        ConductorError::workspace(
            "unknown",
            format!("failed to create directory {}", path.display()),
        )
        .with_source(e)
    })
}

/// Copy a file into a workspace directory, keeping its base name.
/// Returns the destination path.
pub async fn stage_file(source: &Path, work_dir: &Path) -> Result<PathBuf> {
    if !tokio::fs::try_exists(source).await.unwrap_or(false) {
        return Err(ConductorError::validation(format!(
            "source file not found: {}",
            source.display()
        )));
    }

    let file_name = source
        .file_name()
        .ok_or_else(|| ConductorError::validation(format!("not a file: {}", source.display())))?;

    ensure_directory(work_dir).await?;
    let dest = work_dir.join(file_name);
    tokio::fs::copy(source, &dest).await?;
    Ok(dest)
}

/// Base name of a path as a string, used in worker command lines
pub fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stage_file() {
        let src_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();

        let src = src_dir.path().join("a.py");
        tokio::fs::write(&src, "print('hi')").await.unwrap();

        let dest = stage_file(&src, work_dir.path()).await.unwrap();
        assert_eq!(dest, work_dir.path().join("a.py"));
        let copied = tokio::fs::read_to_string(&dest).await.unwrap();
        assert_eq!(copied, "print('hi')");
    }

    #[tokio::test]
    async fn test_stage_missing_file_fails() {
        let work_dir = TempDir::new().unwrap();
        let result = stage_file(Path::new("/no/such/file.py"), work_dir.path()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name(Path::new("/tmp/dir/a.py")), "a.py");
    }
}
