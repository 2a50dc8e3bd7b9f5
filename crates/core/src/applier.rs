use std::collections::HashMap;
use std::path::PathBuf;

use crate::patch::{Hunk, PatchSet};
use crate::paths;
use crate::repo::{git, RepoController, RepoError};
use crate::telemetry::RunPaths;

/// Result of one apply attempt. `ok == false` leaves the working tree
/// exactly as it was.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub ok: bool,
    pub commit_id: Option<String>,
    pub message: String,
    pub files: Vec<String>,
    pub lines_changed: usize,
    pub used_fallback: bool,
}

impl ApplyOutcome {
    fn failed(message: String) -> Self {
        Self {
            ok: false,
            commit_id: None,
            message,
            files: Vec::new(),
            lines_changed: 0,
            used_fallback: false,
        }
    }
}

pub struct Applier<'a> {
    controller: &'a RepoController,
    run_paths: &'a RunPaths,
}

const RECOVERABLE_MARKERS: &[&str] = &[
    "does not apply",
    "patch failed",
    "corrupt patch",
    "while searching for",
    "no such file",
    "already exists",
];

impl<'a> Applier<'a> {
    pub fn new(controller: &'a RepoController, run_paths: &'a RunPaths) -> Self {
        Self {
            controller,
            run_paths,
        }
    }

    /// Dry-run, apply (structured or via the fallback writer), commit.
    /// `n` numbers the scratch diff under the run directory.
    pub fn apply(&self, patch_text: &str, n: u32) -> ApplyOutcome {
        let patch = match PatchSet::parse(patch_text) {
            Ok(p) => p,
            Err(e) => return ApplyOutcome::failed(format!("patch did not parse: {e}")),
        };

        // Scratch lives under the repository's metadata directory so the
        // diff's relative paths stay meaningful.
        let diff_path = self.run_paths.diff_path(n);
        if let Err(e) = std::fs::write(&diff_path, patch.render()) {
            return ApplyOutcome::failed(format!("could not write scratch patch: {e}"));
        }

        let root = self.controller.root();
        let backups = self.snapshot(&patch);

        let diff_arg = diff_path.to_string_lossy().to_string();
        let dry_run = git(root, &["apply", "--check", &diff_arg]);

        let (applied, used_fallback) = match dry_run {
            Ok(_) => match git(root, &["apply", &diff_arg]) {
                Ok(_) => (Ok(()), false),
                Err(e) => (Err(format!("git apply failed after clean check: {e}")), false),
            },
            Err(RepoError::Git { stderr, .. }) if is_recoverable(&stderr) => {
                tracing::debug!(%stderr, "dry-run failed, trying fallback writer");
                (self.fallback_write(&patch), true)
            }
            Err(e) => (Err(format!("patch rejected by dry-run: {e}")), false),
        };

        if let Err(reason) = applied {
            self.restore(&backups);
            return ApplyOutcome::failed(reason);
        }

        let files: Vec<String> = patch.touched_paths().iter().map(|s| s.to_string()).collect();
        let summary = format!("restitch: patch {} ({})", n, files.join(", "));
        match self.controller.commit(&summary) {
            Ok(commit_id) => ApplyOutcome {
                ok: true,
                commit_id: Some(commit_id),
                message: format!("patch {n} applied"),
                lines_changed: patch.changed_lines(),
                files,
                used_fallback,
            },
            Err(RepoError::EmptyCommit) => {
                self.restore(&backups);
                ApplyOutcome::failed("patch produced no change to commit".to_string())
            }
            Err(e) => {
                self.restore(&backups);
                ApplyOutcome::failed(format!("commit failed: {e}"))
            }
        }
    }

    /// Content snapshot of every file the patch touches, taken before any
    /// mutation. `None` marks a file that did not exist.
    fn snapshot(&self, patch: &PatchSet) -> HashMap<PathBuf, Option<String>> {
        let root = self.controller.root();
        let mut backups = HashMap::new();
        for file in &patch.files {
            let rel = paths::resolve_existing(root, &file.path)
                .map(|(p, _)| p)
                .unwrap_or_else(|| PathBuf::from(&file.path));
            let abs = root.join(&rel);
            let content = std::fs::read_to_string(&abs).ok();
            backups.insert(rel, content);
        }
        backups
    }

    fn restore(&self, backups: &HashMap<PathBuf, Option<String>>) {
        let root = self.controller.root();
        for (rel, backup) in backups {
            let abs = root.join(rel);
            match backup {
                Some(content) => {
                    let _ = paths::atomic_write(&abs, content);
                }
                None => {
                    if abs.exists() {
                        let _ = std::fs::remove_file(&abs);
                    }
                }
            }
        }
    }

    /// The fallback writer: resolve each target through the source roots,
    /// synthesize the post-image with tolerant context matching, write
    /// atomically.
    fn fallback_write(&self, patch: &PatchSet) -> Result<(), String> {
        let root = self.controller.root();
        for file in &patch.files {
            let (rel, annotated) = if file.is_new {
                (PathBuf::from(&file.path), false)
            } else {
                paths::resolve_existing(root, &file.path)
                    .ok_or_else(|| format!("{}: target not found in tree", file.path))?
            };
            if annotated {
                tracing::debug!(requested = %file.path, resolved = %rel.display(), "resolved patch target via source root");
            }

            let abs = root.join(&rel);
            let existing = if file.is_new {
                String::new()
            } else {
                std::fs::read_to_string(&abs).map_err(|e| format!("{}: {e}", rel.display()))?
            };

            let updated = apply_hunks(&existing, &file.hunks)
                .map_err(|e| format!("{}: {e}", rel.display()))?;
            paths::atomic_write(&abs, &updated).map_err(|e| format!("{}: {e}", rel.display()))?;
        }
        Ok(())
    }
}

fn is_recoverable(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    RECOVERABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Apply hunks to `content`, matching context with trailing whitespace
/// ignored and searching outward from the expected line when the file has
/// drifted.
pub fn apply_hunks(content: &str, hunks: &[Hunk]) -> Result<String, String> {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    let mut offset: isize = 0;

    for hunk in hunks {
        let old: Vec<&str> = hunk.old_lines();
        let new: Vec<&str> = hunk.new_lines();

        if old.is_empty() {
            // Pure addition: the old start names the line to insert after.
            let at = ((hunk.old_start as isize + offset).max(0) as usize).min(lines.len());
            lines.splice(at..at, new.iter().map(|s| s.to_string()));
            offset += new.len() as isize;
            continue;
        }

        let expected = (hunk.old_start as isize - 1 + offset).max(0) as usize;
        let found = find_block(&lines, &old, expected).ok_or_else(|| {
            format!("hunk context starting `{}` not found near line {}",
                old.first().unwrap_or(&""),
                hunk.old_start
            )
        })?;
        lines.splice(found..found + old.len(), new.iter().map(|s| s.to_string()));
        offset += new.len() as isize - old.len() as isize;
    }

    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

/// Find `block` in `lines`, preferring the match closest to `expected`.
/// Comparison ignores trailing whitespace on both sides.
fn find_block(lines: &[String], block: &[&str], expected: usize) -> Option<usize> {
    if block.len() > lines.len() {
        return None;
    }
    let matches_at = |i: usize| -> bool {
        block
            .iter()
            .enumerate()
            .all(|(j, want)| lines[i + j].trim_end() == want.trim_end())
    };
    (0..=lines.len() - block.len())
        .filter(|&i| matches_at(i))
        .min_by_key(|&i| i.abs_diff(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::git as run_git;
    use crate::telemetry::RunPaths;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        run_git(root, &["init", "-b", "main"]).unwrap();
        run_git(root, &["config", "user.email", "t@example.com"]).unwrap();
        run_git(root, &["config", "user.name", "T"]).unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(
            root.join("src/calc.py"),
            "def add(a, b):\n    return a - b\n",
        )
        .unwrap();
        run_git(root, &["add", "-A"]).unwrap();
        run_git(root, &["commit", "-m", "initial"]).unwrap();
        dir
    }

    const FIX: &str = "\
--- a/src/calc.py
+++ b/src/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a - b
+    return a + b
";

    #[test]
    fn clean_patch_applies_and_commits() {
        let dir = init_repo();
        let controller = RepoController::open(dir.path(), "t").unwrap();
        let run_paths = RunPaths::create(dir.path(), "t").unwrap();
        let applier = Applier::new(&controller, &run_paths);

        let outcome = applier.apply(FIX, 1);
        assert!(outcome.ok, "{}", outcome.message);
        assert!(outcome.commit_id.is_some());
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.lines_changed, 2);
        assert_eq!(outcome.files, vec!["src/calc.py"]);

        let content = std::fs::read_to_string(dir.path().join("src/calc.py")).unwrap();
        assert!(content.contains("return a + b"));
        assert!(run_paths.diff_path(1).exists());
    }

    #[test]
    fn drifted_context_goes_through_fallback() {
        let dir = init_repo();
        // The file gained a leading comment the patch does not know about.
        std::fs::write(
            dir.path().join("src/calc.py"),
            "# arithmetic helpers\n\ndef add(a, b):\n    return a - b\n",
        )
        .unwrap();
        run_git(dir.path(), &["add", "-A"]).unwrap();
        run_git(dir.path(), &["commit", "-m", "comment"]).unwrap();

        let controller = RepoController::open(dir.path(), "t").unwrap();
        let run_paths = RunPaths::create(dir.path(), "t").unwrap();
        let applier = Applier::new(&controller, &run_paths);

        let outcome = applier.apply(FIX, 1);
        assert!(outcome.ok, "{}", outcome.message);
        assert!(outcome.used_fallback);
        let content = std::fs::read_to_string(dir.path().join("src/calc.py")).unwrap();
        assert!(content.contains("return a + b"));
        assert!(content.contains("# arithmetic helpers"));
    }

    #[test]
    fn bare_path_resolves_through_source_root() {
        let dir = init_repo();
        let controller = RepoController::open(dir.path(), "t").unwrap();
        let run_paths = RunPaths::create(dir.path(), "t").unwrap();
        let applier = Applier::new(&controller, &run_paths);

        let patch = FIX.replace("src/calc.py", "calc.py");
        let outcome = applier.apply(&patch, 1);
        assert!(outcome.ok, "{}", outcome.message);
        let content = std::fs::read_to_string(dir.path().join("src/calc.py")).unwrap();
        assert!(content.contains("return a + b"));
    }

    #[test]
    fn unapplicable_patch_leaves_tree_untouched() {
        let dir = init_repo();
        let before = std::fs::read_to_string(dir.path().join("src/calc.py")).unwrap();
        let controller = RepoController::open(dir.path(), "t").unwrap();
        let run_paths = RunPaths::create(dir.path(), "t").unwrap();
        let applier = Applier::new(&controller, &run_paths);

        let bogus = "\
--- a/src/calc.py
+++ b/src/calc.py
@@ -1,2 +1,2 @@
 def multiply(a, b):
-    return a * b * b
+    return a * b
";
        let outcome = applier.apply(bogus, 1);
        assert!(!outcome.ok);
        assert!(outcome.commit_id.is_none());
        let after = std::fs::read_to_string(dir.path().join("src/calc.py")).unwrap();
        assert_eq!(before, after);
        assert!(controller.status_porcelain().unwrap().trim().is_empty());
    }

    #[test]
    fn new_file_creation() {
        let dir = init_repo();
        let controller = RepoController::open(dir.path(), "t").unwrap();
        let run_paths = RunPaths::create(dir.path(), "t").unwrap();
        let applier = Applier::new(&controller, &run_paths);

        let patch = "\
--- /dev/null
+++ b/src/helper.py
@@ -0,0 +1,2 @@
+def helper():
+    return 1
";
        let outcome = applier.apply(patch, 1);
        assert!(outcome.ok, "{}", outcome.message);
        let content = std::fs::read_to_string(dir.path().join("src/helper.py")).unwrap();
        assert!(content.contains("def helper()"));
    }

    #[test]
    fn apply_hunks_tolerates_trailing_whitespace() {
        let content = "def add(a, b):   \n    return a - b\n";
        let patch = PatchSet::parse(FIX).unwrap();
        let updated = apply_hunks(content, &patch.files[0].hunks).unwrap();
        assert!(updated.contains("return a + b"));
    }

    #[test]
    fn apply_hunks_rejects_missing_context() {
        let content = "something else entirely\n";
        let patch = PatchSet::parse(FIX).unwrap();
        assert!(apply_hunks(content, &patch.files[0].hunks).is_err());
    }

    #[test]
    fn find_block_prefers_nearest_match() {
        let lines: Vec<String> = ["x = 1", "pad", "x = 1", "pad", "x = 1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let block = ["x = 1"];
        assert_eq!(find_block(&lines, &block, 2), Some(2));
        assert_eq!(find_block(&lines, &block, 4), Some(4));
        assert_eq!(find_block(&lines, &block, 0), Some(0));
    }
}
