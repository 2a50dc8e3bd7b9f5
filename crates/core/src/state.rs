use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use restitch_config::RunLimits;

/// Key identifying one tool invocation for loop prevention: tool name,
/// normalized argument, and the modifications epoch it ran in. Repeating a
/// key is a no-op and earns the agent a SKIP observation.
pub type ActionKey = (String, String, u64);

/// Per-run mutable state. Created at loop start, mutated only by the agent
/// loop and its tools, discarded at loop exit. Never shared across threads.
pub struct RunState {
    pub iteration: u32,
    pub max_iterations: u32,
    pub tool_calls: u32,
    pub max_tool_calls: u32,
    pub started_at: Instant,
    pub deadline: Instant,
    pub used_actions: HashSet<ActionKey>,
    /// Monotone logical clock advanced on every successful write or patch.
    pub modifications_count: u64,
    pub applied_commits: Vec<String>,
    pub test_runs: u32,
    pub patches_applied: u32,
    /// Serialized result of the most recent test run, re-served on SKIP.
    pub last_test_json: Option<String>,
    file_cache: HashMap<(PathBuf, u64), String>,
}

impl RunState {
    pub fn new(limits: &RunLimits) -> Self {
        let now = Instant::now();
        Self {
            iteration: 0,
            max_iterations: limits.max_iterations,
            tool_calls: 0,
            max_tool_calls: limits.agent_max_tool_calls,
            started_at: now,
            deadline: now + Duration::from_secs(limits.global_timeout_seconds),
            used_actions: HashSet::new(),
            modifications_count: 0,
            applied_commits: Vec::new(),
            test_runs: 0,
            patches_applied: 0,
            last_test_json: None,
            file_cache: HashMap::new(),
        }
    }

    pub fn deadline_exceeded(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn iterations_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }

    pub fn tool_calls_exhausted(&self) -> bool {
        self.tool_calls >= self.max_tool_calls
    }

    pub fn action_key(&self, name: &str, argument: &str) -> ActionKey {
        (
            name.to_string(),
            normalize_argument(argument),
            self.modifications_count,
        )
    }

    /// Returns true when this exact action already ran in the current
    /// modifications epoch.
    pub fn seen(&self, key: &ActionKey) -> bool {
        self.used_actions.contains(key)
    }

    pub fn record_action(&mut self, key: ActionKey) {
        self.used_actions.insert(key);
    }

    pub fn cache_get(&self, path: &Path) -> Option<&String> {
        self.file_cache
            .get(&(path.to_path_buf(), self.modifications_count))
    }

    pub fn cache_put(&mut self, path: PathBuf, content: String) {
        self.file_cache
            .insert((path, self.modifications_count), content);
    }

    /// Advance the logical clock after a successful write/patch. Stale cache
    /// entries die with the old epoch; entries for the touched paths are
    /// dropped outright.
    pub fn bump_modifications(&mut self, touched: &[PathBuf]) {
        self.modifications_count += 1;
        self.file_cache
            .retain(|(path, _), _| !touched.contains(path));
    }

    /// True when the given path was read (freshly or from cache) during the
    /// current modifications epoch.
    pub fn read_in_current_epoch(&self, path: &Path) -> bool {
        self.file_cache
            .contains_key(&(path.to_path_buf(), self.modifications_count))
    }
}

/// Collapse whitespace so cosmetic differences do not defeat the repetition
/// guard.
pub fn normalize_argument(argument: &str) -> String {
    argument.split_whitespace().collect::<Vec<_>>().join(" ")
}
