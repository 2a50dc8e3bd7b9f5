use std::path::{Path, PathBuf};

use restitch_config::SafetyPolicy;

use crate::patch::{DiffLine, PatchSet};

/// Outcome of a guard check. `violations` is human-readable and goes
/// verbatim into `patch_rejected` telemetry and back to the agent.
#[derive(Debug, Clone)]
pub struct GuardVerdict {
    pub ok: bool,
    pub violations: Vec<String>,
}

impl GuardVerdict {
    fn rejected(violations: Vec<String>) -> Self {
        Self {
            ok: false,
            violations,
        }
    }

    fn approved() -> Self {
        Self {
            ok: true,
            violations: Vec::new(),
        }
    }

    pub fn joined(&self) -> String {
        self.violations.join("; ")
    }
}

/// Deterministic, side-effect-free patch validator. Checks run in order
/// (format, scope, size, content, idempotence) and the first failing
/// category short-circuits the rest.
pub struct Guard {
    policy: SafetyPolicy,
    repo_root: PathBuf,
}

impl Guard {
    pub fn new(policy: SafetyPolicy, repo_root: &Path) -> Self {
        Self {
            policy,
            repo_root: repo_root.to_path_buf(),
        }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    pub fn validate(&self, patch_text: &str) -> GuardVerdict {
        // 1. Format. Parsing is the normalizer; near-miss hunk headers and
        // recoverable truncation are fixed here, the rest is rejected.
        let patch = match PatchSet::parse(patch_text) {
            Ok(p) => p,
            Err(e) => return GuardVerdict::rejected(vec![format!("format: {e}")]),
        };

        // 2. Scope.
        let scope_violations = self.check_scope(&patch);
        if !scope_violations.is_empty() {
            return GuardVerdict::rejected(scope_violations);
        }

        // 3. Size caps.
        let size_violations = self.check_size(&patch);
        if !size_violations.is_empty() {
            return GuardVerdict::rejected(size_violations);
        }

        // 4. Content of added lines.
        let content_violations = self.check_content(&patch);
        if !content_violations.is_empty() {
            return GuardVerdict::rejected(content_violations);
        }

        // 5. Idempotence.
        if patch.is_noop() {
            return GuardVerdict::rejected(vec![
                "idempotence: patch has no net effect on the working tree".to_string(),
            ]);
        }

        GuardVerdict::approved()
    }

    pub fn path_allowed(&self, path: &str) -> Result<(), String> {
        if Path::new(path).is_absolute() || path.split('/').any(|c| c == "..") {
            return Err(format!("scope: path escapes the repository: {path}"));
        }
        let allowed = self
            .policy
            .allowed_globs
            .iter()
            .filter_map(|g| glob::Pattern::new(g).ok())
            .any(|p| p.matches(path));
        if !allowed {
            return Err(format!("scope: {path} is outside the allowed source tree"));
        }
        for forbidden in &self.policy.forbidden_globs {
            if let Ok(pattern) = glob::Pattern::new(forbidden) {
                if pattern.matches(path) {
                    return Err(format!(
                        "scope: {path} matches forbidden pattern `{forbidden}`"
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_scope(&self, patch: &PatchSet) -> Vec<String> {
        patch
            .touched_paths()
            .iter()
            .filter_map(|path| self.path_allowed(path).err())
            .collect()
    }

    fn check_size(&self, patch: &PatchSet) -> Vec<String> {
        let mut violations = Vec::new();
        let changed = patch.changed_lines();
        if changed > self.policy.max_patch_lines {
            violations.push(format!(
                "size: patch changes {changed} lines, cap is {}",
                self.policy.max_patch_lines
            ));
        }
        let files = patch.files.len();
        if files > self.policy.max_files {
            violations.push(format!(
                "size: patch touches {files} files, cap is {}",
                self.policy.max_files
            ));
        }
        violations
    }

    fn check_content(&self, patch: &PatchSet) -> Vec<String> {
        let mut violations = Vec::new();

        let forbidden: Vec<regex::Regex> = self
            .policy
            .forbidden_patterns
            .iter()
            .filter_map(|p| regex::Regex::new(p).ok())
            .collect();
        let egress: Vec<regex::Regex> = self
            .policy
            .egress_patterns
            .iter()
            .filter_map(|p| regex::Regex::new(p).ok())
            .collect();

        for file in &patch.files {
            // Egress primitives are tolerated in files that already use them.
            let existing = std::fs::read_to_string(self.repo_root.join(&file.path))
                .unwrap_or_default();
            let egress_already_present = egress.iter().any(|re| re.is_match(&existing));

            for line in file
                .hunks
                .iter()
                .flat_map(|h| h.lines.iter())
                .filter_map(|l| match l {
                    DiffLine::Added(s) => Some(s.as_str()),
                    _ => None,
                })
            {
                for re in &forbidden {
                    if re.is_match(line) {
                        violations.push(format!(
                            "content: {} adds a forbidden construct (`{}`): {}",
                            file.path,
                            re.as_str(),
                            line.trim()
                        ));
                    }
                }
                if !egress_already_present {
                    for re in &egress {
                        if re.is_match(line) {
                            violations.push(format!(
                                "content: {} introduces network egress (`{}`): {}",
                                file.path,
                                re.as_str(),
                                line.trim()
                            ));
                        }
                    }
                }
            }
        }
        violations
    }
}
