use std::path::{Path, PathBuf};

/// Roots probed when a patch or read names a file that is not at its
/// literal repository-relative location.
pub const SOURCE_ROOTS: &[&str] = &["src", "lib", "app"];

/// Resolve a repository-relative path, trying the literal location first
/// and then each source root. Returns the relative path that exists and
/// whether resolution was non-literal.
pub fn resolve_existing(repo_root: &Path, rel: &str) -> Option<(PathBuf, bool)> {
    let literal = PathBuf::from(rel);
    if repo_root.join(&literal).is_file() {
        return Some((literal, false));
    }
    for root in SOURCE_ROOTS {
        let candidate = Path::new(root).join(rel);
        if repo_root.join(&candidate).is_file() {
            return Some((candidate, true));
        }
    }
    None
}

/// Write via a temp file in the same directory plus rename, so readers
/// never observe a half-written file.
pub fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::fs::write(tmp.path(), content)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("calc.py"), "top").unwrap();
        std::fs::write(dir.path().join("src/calc.py"), "nested").unwrap();

        let (resolved, annotated) = resolve_existing(dir.path(), "calc.py").unwrap();
        assert_eq!(resolved, PathBuf::from("calc.py"));
        assert!(!annotated);
    }

    #[test]
    fn source_root_probing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/calc.py"), "nested").unwrap();

        let (resolved, annotated) = resolve_existing(dir.path(), "calc.py").unwrap();
        assert_eq!(resolved, PathBuf::from("src/calc.py"));
        assert!(annotated);

        assert!(resolve_existing(dir.path(), "missing.py").is_none());
    }

    #[test]
    fn atomic_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deep/nested/file.py");
        atomic_write(&target, "content\n").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "content\n");
    }
}
