use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("patch contains no file headers")]
    Empty,

    #[error("malformed hunk header: {0}")]
    BadHunkHeader(String),

    #[error("hunk body outside any file header")]
    OrphanHunk,

    #[error("file deletion is not permitted: {0}")]
    DeletionForbidden(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Added(String),
    Removed(String),
}

impl DiffLine {
    pub fn content(&self) -> &str {
        match self {
            DiffLine::Context(s) | DiffLine::Added(s) | DiffLine::Removed(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Hunk {
    pub old_start: usize,
    pub new_start: usize,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    pub fn old_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| !matches!(l, DiffLine::Added(_)))
            .count()
    }

    pub fn new_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| !matches!(l, DiffLine::Removed(_)))
            .count()
    }

    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| !matches!(l, DiffLine::Added(_)))
            .map(|l| l.content())
            .collect()
    }

    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| !matches!(l, DiffLine::Removed(_)))
            .map(|l| l.content())
            .collect()
    }

    fn is_net_empty(&self) -> bool {
        let removed: Vec<&str> = self
            .lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Removed(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        let added: Vec<&str> = self
            .lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Added(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        removed == added
    }
}

#[derive(Debug, Clone)]
pub struct FilePatch {
    pub path: String,
    pub is_new: bool,
    pub hunks: Vec<Hunk>,
}

/// A parsed unified diff rooted at the repository top. Parsing is tolerant
/// of near-miss hunk headers (wrong advertised counts, truncated final
/// hunks); `render` re-emits a canonical form with recomputed headers, so
/// `normalize` is idempotent.
#[derive(Debug, Clone)]
pub struct PatchSet {
    pub files: Vec<FilePatch>,
}

fn strip_diff_prefix(path: &str) -> &str {
    let path = path.trim();
    // `a/foo` and `b/foo` prefixes; bare paths pass through.
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

fn parse_hunk_header(line: &str) -> Result<(usize, usize), PatchError> {
    // `@@ -l,s +l,s @@` with the counts optional.
    let inner = line
        .strip_prefix("@@ -")
        .ok_or_else(|| PatchError::BadHunkHeader(line.to_string()))?;
    let mut parts = inner.splitn(2, " +");
    let old = parts
        .next()
        .ok_or_else(|| PatchError::BadHunkHeader(line.to_string()))?;
    let new = parts
        .next()
        .and_then(|rest| rest.split(" @@").next())
        .ok_or_else(|| PatchError::BadHunkHeader(line.to_string()))?;

    let old_start = old
        .split(',')
        .next()
        .and_then(|n| n.trim().parse::<usize>().ok())
        .ok_or_else(|| PatchError::BadHunkHeader(line.to_string()))?;
    let new_start = new
        .split(',')
        .next()
        .and_then(|n| n.trim().parse::<usize>().ok())
        .ok_or_else(|| PatchError::BadHunkHeader(line.to_string()))?;

    Ok((old_start, new_start))
}

impl PatchSet {
    pub fn parse(text: &str) -> Result<Self, PatchError> {
        let mut files: Vec<FilePatch> = Vec::new();
        let mut current: Option<FilePatch> = None;
        let mut hunk: Option<Hunk> = None;
        let mut pending_new_file = false;
        let mut old_is_devnull = false;

        let flush_hunk =
            |current: &mut Option<FilePatch>, hunk: &mut Option<Hunk>| -> Result<(), PatchError> {
                if let Some(h) = hunk.take() {
                    match current.as_mut() {
                        Some(f) => f.hunks.push(h),
                        None => return Err(PatchError::OrphanHunk),
                    }
                }
                Ok(())
            };

        for line in text.lines() {
            if line.starts_with("diff --git")
                || line.starts_with("index ")
                || line.starts_with("similarity ")
            {
                continue;
            }
            if line.starts_with("new file mode") {
                pending_new_file = true;
                continue;
            }
            if line.starts_with("deleted file mode") {
                let path = current
                    .as_ref()
                    .map(|f| f.path.clone())
                    .unwrap_or_else(|| "<unknown>".to_string());
                return Err(PatchError::DeletionForbidden(path));
            }
            if let Some(old) = line.strip_prefix("--- ") {
                flush_hunk(&mut current, &mut hunk)?;
                if let Some(f) = current.take() {
                    if !f.hunks.is_empty() {
                        files.push(f);
                    }
                }
                old_is_devnull = old.trim() == "/dev/null";
                continue;
            }
            if let Some(new) = line.strip_prefix("+++ ") {
                let target = new.trim();
                if target == "/dev/null" {
                    let path = current
                        .as_ref()
                        .map(|f| f.path.clone())
                        .unwrap_or_else(|| "<unknown>".to_string());
                    return Err(PatchError::DeletionForbidden(path));
                }
                current = Some(FilePatch {
                    path: strip_diff_prefix(target).to_string(),
                    is_new: pending_new_file || old_is_devnull,
                    hunks: Vec::new(),
                });
                pending_new_file = false;
                old_is_devnull = false;
                continue;
            }
            if line.starts_with("@@ ") {
                flush_hunk(&mut current, &mut hunk)?;
                let (old_start, new_start) = parse_hunk_header(line)?;
                hunk = Some(Hunk {
                    old_start,
                    new_start,
                    lines: Vec::new(),
                });
                continue;
            }
            if let Some(h) = hunk.as_mut() {
                if let Some(rest) = line.strip_prefix('+') {
                    h.lines.push(DiffLine::Added(rest.trim_end().to_string()));
                } else if let Some(rest) = line.strip_prefix('-') {
                    h.lines.push(DiffLine::Removed(rest.trim_end().to_string()));
                } else if line == "\\ No newline at end of file" {
                    continue;
                } else {
                    let rest = line.strip_prefix(' ').unwrap_or(line);
                    h.lines.push(DiffLine::Context(rest.trim_end().to_string()));
                }
            }
        }

        flush_hunk(&mut current, &mut hunk)?;
        if let Some(f) = current.take() {
            if !f.hunks.is_empty() {
                files.push(f);
            }
        }

        if files.is_empty() {
            return Err(PatchError::Empty);
        }
        Ok(Self { files })
    }

    /// Canonical rendering: `a/`/`b/` prefixes, recomputed hunk counts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            if file.is_new {
                out.push_str("--- /dev/null\n");
            } else {
                out.push_str(&format!("--- a/{}\n", file.path));
            }
            out.push_str(&format!("+++ b/{}\n", file.path));
            for hunk in &file.hunks {
                out.push_str(&format!(
                    "@@ -{},{} +{},{} @@\n",
                    hunk.old_start,
                    hunk.old_count(),
                    hunk.new_start,
                    hunk.new_count()
                ));
                for line in &hunk.lines {
                    match line {
                        DiffLine::Context(s) => out.push_str(&format!(" {s}\n")),
                        DiffLine::Added(s) => out.push_str(&format!("+{s}\n")),
                        DiffLine::Removed(s) => out.push_str(&format!("-{s}\n")),
                    }
                }
            }
        }
        out
    }

    pub fn changed_lines(&self) -> usize {
        self.files
            .iter()
            .flat_map(|f| f.hunks.iter())
            .flat_map(|h| h.lines.iter())
            .filter(|l| !matches!(l, DiffLine::Context(_)))
            .count()
    }

    pub fn touched_paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }

    /// True when the patch's net effect on the tree is empty: every hunk's
    /// removed lines equal its added lines.
    pub fn is_noop(&self) -> bool {
        self.files
            .iter()
            .flat_map(|f| f.hunks.iter())
            .all(|h| h.is_net_empty())
    }
}

/// Parse and re-render, fixing near-miss hunk headers and stripping
/// trailing whitespace. Idempotent: normalizing a normalized patch is the
/// identity.
pub fn normalize(text: &str) -> Result<String, PatchError> {
    Ok(PatchSet::parse(text)?.render())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "\
--- a/src/calc.py
+++ b/src/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a - b
+    return a + b
";

    #[test]
    fn parses_simple_patch() {
        let patch = PatchSet::parse(SIMPLE).unwrap();
        assert_eq!(patch.files.len(), 1);
        assert_eq!(patch.files[0].path, "src/calc.py");
        assert!(!patch.files[0].is_new);
        assert_eq!(patch.changed_lines(), 2);
        assert_eq!(patch.touched_paths(), vec!["src/calc.py"]);
    }

    #[test]
    fn normalize_recomputes_wrong_counts() {
        let wrong = SIMPLE.replace("@@ -1,2 +1,2 @@", "@@ -1,9 +1,7 @@");
        let normalized = normalize(&wrong).unwrap();
        assert!(normalized.contains("@@ -1,2 +1,2 @@"));
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize(SIMPLE).unwrap();
        let twice = normalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn new_file_via_devnull_header() {
        let text = "\
--- /dev/null
+++ b/src/helper.py
@@ -0,0 +1,2 @@
+def helper():
+    return 1
";
        let patch = PatchSet::parse(text).unwrap();
        assert!(patch.files[0].is_new);
        assert_eq!(patch.files[0].path, "src/helper.py");
    }

    #[test]
    fn deletion_is_rejected() {
        let text = "\
--- a/src/old.py
+++ /dev/null
@@ -1,1 +0,0 @@
-gone
";
        assert!(matches!(
            PatchSet::parse(text),
            Err(PatchError::DeletionForbidden(_))
        ));
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(PatchSet::parse(""), Err(PatchError::Empty)));
        assert!(matches!(
            PatchSet::parse("just some prose\n"),
            Err(PatchError::Empty)
        ));
    }

    #[test]
    fn net_empty_patch_is_noop() {
        let text = "\
--- a/src/calc.py
+++ b/src/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a + b
+    return a + b
";
        let patch = PatchSet::parse(text).unwrap();
        assert!(patch.is_noop());

        let real = PatchSet::parse(SIMPLE).unwrap();
        assert!(!real.is_noop());
    }

    #[test]
    fn truncated_hunk_is_reconstructed() {
        // Advertises 4 old lines but the body was cut short; normalize
        // keeps what is there and fixes the header.
        let text = "\
--- a/src/calc.py
+++ b/src/calc.py
@@ -1,4 +1,4 @@
 def add(a, b):
-    return a - b
+    return a + b
";
        let normalized = normalize(text).unwrap();
        assert!(normalized.contains("@@ -1,2 +1,2 @@"));
    }

    #[test]
    fn git_style_headers_are_tolerated() {
        let text = format!(
            "diff --git a/src/calc.py b/src/calc.py\nindex 123..456 100644\n{SIMPLE}"
        );
        let patch = PatchSet::parse(&text).unwrap();
        assert_eq!(patch.files[0].path, "src/calc.py");
    }

    #[test]
    fn multi_file_patch() {
        let text = format!(
            "{SIMPLE}--- a/src/other.py\n+++ b/src/other.py\n@@ -1,1 +1,1 @@\n-x = 1\n+x = 2\n"
        );
        let patch = PatchSet::parse(&text).unwrap();
        assert_eq!(patch.files.len(), 2);
        assert_eq!(patch.changed_lines(), 4);
    }
}
