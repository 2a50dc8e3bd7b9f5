use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration. Loaded from `restitch.toml` in the target
/// repository, falling back to the user config directory, falling back to
/// defaults. Credentials are never stored here; providers read them from
/// their environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limits: RunLimits,
    #[serde(default)]
    pub safety: SafetyPolicy,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub tools: ToolSettings,
}

fn default_max_iterations() -> u32 {
    6
}

fn default_max_tool_calls() -> u32 {
    20
}

fn default_test_timeout() -> u64 {
    300
}

fn default_global_timeout() -> u64 {
    1200
}

/// Iteration and wall-clock budgets. Either cap tripping terminates the run
/// cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLimits {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_tool_calls")]
    pub agent_max_tool_calls: u32,
    #[serde(default = "default_test_timeout")]
    pub test_timeout_seconds: u64,
    #[serde(default = "default_global_timeout")]
    pub global_timeout_seconds: u64,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            agent_max_tool_calls: default_max_tool_calls(),
            test_timeout_seconds: default_test_timeout(),
            global_timeout_seconds: default_global_timeout(),
        }
    }
}

fn default_max_patch_lines() -> usize {
    500
}

fn default_max_files() -> usize {
    10
}

fn default_max_read_bytes() -> usize {
    262_144
}

fn default_max_write_bytes() -> usize {
    262_144
}

fn default_allowed_globs() -> Vec<String> {
    vec!["**".to_string()]
}

/// Paths a patch or write may never touch, regardless of the allow-list:
/// test files, CI configuration, dependency manifests and lockfiles,
/// secrets, VCS internals, and build outputs.
fn default_forbidden_globs() -> Vec<String> {
    [
        "tests/**",
        "test/**",
        "**/test_*.py",
        "**/*_test.py",
        "**/conftest.py",
        "**/*_test.go",
        "**/*.test.js",
        "**/*.test.ts",
        ".github/**",
        ".gitlab-ci.yml",
        ".circleci/**",
        ".travis.yml",
        "Jenkinsfile",
        "setup.py",
        "setup.cfg",
        "pyproject.toml",
        "requirements*.txt",
        "Pipfile",
        "package.json",
        "Cargo.toml",
        "go.mod",
        "Gemfile",
        "*.lock",
        "package-lock.json",
        "yarn.lock",
        ".env",
        ".env.*",
        "**/.env",
        "**/secrets/**",
        "**/*.pem",
        "**/*.key",
        ".git/**",
        ".hg/**",
        ".svn/**",
        ".restitch/**",
        "build/**",
        "dist/**",
        "target/**",
        "node_modules/**",
        "**/__pycache__/**",
        "**/*.egg-info/**",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Regexes matched against *added* lines of a patch. Dynamic code
/// evaluation, shell-escape constructs, and hard-coded credentials are
/// always rejected; network-egress primitives are rejected unless the
/// target file already uses them.
fn default_forbidden_patterns() -> Vec<String> {
    [
        r"\beval\s*\(",
        r"\bexec\s*\(",
        r"__import__\s*\(",
        r"\bcompile\s*\(.*['\x22]exec['\x22]",
        r"subprocess\.(run|call|check_output|Popen)\s*\(.*shell\s*=\s*True",
        r"os\.system\s*\(",
        r"os\.popen\s*\(",
        r"\bpty\.spawn\s*\(",
        r"AKIA[0-9A-Z]{16}",
        r"gh[pousr]_[A-Za-z0-9_]{36,}",
        r"-----BEGIN (RSA |EC |OPENSSH )?PRIVATE KEY-----",
        r#"(?i)(api[_-]?key|apikey|secret[_-]?key|password)\s*[:=]\s*["'][A-Za-z0-9+/=]{16,}["']"#,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_egress_patterns() -> Vec<String> {
    [
        r"\bsocket\.socket\s*\(",
        r"\burllib\.request\b",
        r"\brequests\.(get|post|put|delete|request)\s*\(",
        r"\bhttp\.client\b",
        r"\baiohttp\.",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Immutable safety policy consumed by the patch guard and the tool layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyPolicy {
    #[serde(default = "default_max_patch_lines")]
    pub max_patch_lines: usize,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_read_bytes")]
    pub max_file_read_bytes: usize,
    #[serde(default = "default_max_write_bytes")]
    pub max_file_write_bytes: usize,
    #[serde(default = "default_allowed_globs")]
    pub allowed_globs: Vec<String>,
    #[serde(default = "default_forbidden_globs")]
    pub forbidden_globs: Vec<String>,
    #[serde(default = "default_forbidden_patterns")]
    pub forbidden_patterns: Vec<String>,
    #[serde(default = "default_egress_patterns")]
    pub egress_patterns: Vec<String>,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            max_patch_lines: default_max_patch_lines(),
            max_files: default_max_files(),
            max_file_read_bytes: default_max_read_bytes(),
            max_file_write_bytes: default_max_write_bytes(),
            allowed_globs: default_allowed_globs(),
            forbidden_globs: default_forbidden_globs(),
            forbidden_patterns: default_forbidden_patterns(),
            egress_patterns: default_egress_patterns(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Sandbox selection. `use_sandbox` picks the isolated backend;
/// `allow_local_fallback = false` (strict mode) makes sandbox startup
/// failure fatal instead of falling back to a plain child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default = "default_true")]
    pub use_sandbox: bool,
    #[serde(default = "default_true")]
    pub allow_local_fallback: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            use_sandbox: true,
            allow_local_fallback: true,
        }
    }
}

fn default_model_id() -> String {
    "gpt-4.1".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Overrides the capability registry's designated fallback when set.
    #[serde(default)]
    pub model_fallback_id: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Forces temperature 0.0 for reproducible batch evaluation.
    #[serde(default)]
    pub deterministic_fix: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            model_fallback_id: None,
            temperature: default_temperature(),
            deterministic_fix: false,
        }
    }
}

impl ModelSettings {
    pub fn effective_temperature(&self) -> f32 {
        if self.deterministic_fix {
            0.0
        } else {
            self.temperature
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Test command override. When unset the runner probes for a pytest
    /// project and falls back to `python -m pytest`.
    #[serde(default)]
    pub test_command: Option<String>,
    /// Extra environment for the test child.
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    /// Reading test files is allowed by default so the agent can see the
    /// expectation it must satisfy. Writes to test files are always denied.
    #[serde(default = "default_true")]
    pub allow_test_file_read: bool,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            allow_test_file_read: true,
        }
    }
}

impl Config {
    /// Load configuration for a run against `repo_root`. Repo-local
    /// `restitch.toml` wins over the user config file; both are optional.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let local = repo_root.join("restitch.toml");
        if local.is_file() {
            return Self::load_file(&local);
        }
        if let Some(user) = Self::user_config_path() {
            if user.is_file() {
                return Self::load_file(&user);
            }
        }
        Ok(Self::default())
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("restitch").join("config.toml"))
    }
}

/// Name of the private metadata directory kept under the target repository.
pub const METADATA_DIR: &str = ".restitch";

pub fn metadata_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(METADATA_DIR)
}
