pub mod apply_patch;
pub mod read_file;
pub mod write_file;

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use restitch_config::ToolSettings;
use restitch_provider::{Provider, ToolDefinition};

use crate::critic::Critic;
use crate::guard::Guard;
use crate::repo::RepoController;
use crate::runner::{FailingTest, TestResult, TestRunner};
use crate::state::RunState;
use crate::telemetry::{EventKind, EventLog, RunPaths};

/// The closed set of operations the agent may invoke. Adding a tool is an
/// additive change here and in `dispatch`; there is no open extension
/// point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    ReadFile,
    WriteFile,
    ApplyPatch,
    RunTests,
    CriticReview,
    PlanTodo,
}

impl ToolName {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "read_file" => Some(Self::ReadFile),
            "write_file" => Some(Self::WriteFile),
            "apply_patch" => Some(Self::ApplyPatch),
            "run_tests" => Some(Self::RunTests),
            "critic_review" => Some(Self::CriticReview),
            "plan_todo" => Some(Self::PlanTodo),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::ApplyPatch => "apply_patch",
            Self::RunTests => "run_tests",
            Self::CriticReview => "critic_review",
            Self::PlanTodo => "plan_todo",
        }
    }

    pub fn mutates(&self) -> bool {
        matches!(self, Self::WriteFile | Self::ApplyPatch)
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definitions advertised to tool-calling models.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "read_file".into(),
            description: "Read a source file. Returns the file contents with a header noting \
                          the resolved path."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Repository-relative path"}
                },
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: "write_file".into(),
            description: "Overwrite a source file atomically with new content. Test, CI, and \
                          secret paths are always denied."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "new_content": {"type": "string"}
                },
                "required": ["path", "new_content"]
            }),
        },
        ToolDefinition {
            name: "apply_patch".into(),
            description: "Apply a unified diff to the repository. The patch is reviewed by the \
                          safety guard and the critic before it is applied and committed."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "patch": {"type": "string", "description": "Unified diff with a/ and b/ prefixes"}
                },
                "required": ["patch"]
            }),
        },
        ToolDefinition {
            name: "run_tests".into(),
            description: "Run the repository's test suite. Returns a JSON result with the \
                          failing tests."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "selectors": {"type": "string", "description": "Optional space-separated test ids"}
                }
            }),
        },
        ToolDefinition {
            name: "critic_review".into(),
            description: "Review a unified diff without applying it.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "patch": {"type": "string"}
                },
                "required": ["patch"]
            }),
        },
        ToolDefinition {
            name: "plan_todo".into(),
            description: "Record a short plan. Planning is never the last action; follow it \
                          with a concrete read, patch, or test step."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "plan": {"type": "string"}
                },
                "required": ["plan"]
            }),
        },
    ]
}

/// Everything a tool may touch, borrowed for the duration of one dispatch.
pub struct ToolCtx<'a> {
    pub controller: &'a RepoController,
    pub guard: &'a Guard,
    pub runner: &'a TestRunner,
    pub provider: &'a dyn Provider,
    pub run_paths: &'a RunPaths,
    pub settings: &'a ToolSettings,
    pub cancel: &'a CancellationToken,
}

/// What the loop needs to know about a finished tool call, beyond the
/// observation text handed back to the model.
#[derive(Debug, Default)]
pub struct ToolOutcome {
    pub observation: String,
    pub skipped: bool,
    pub applied_patch: bool,
    pub test_result: Option<TestResult>,
}

impl ToolOutcome {
    pub(crate) fn text(observation: String) -> Self {
        Self {
            observation,
            ..Self::default()
        }
    }

    pub(crate) fn skip(observation: String) -> Self {
        Self {
            observation,
            skipped: true,
            ..Self::default()
        }
    }
}

/// Central dispatcher. Errors inside tools become `ERROR:` observations;
/// only infrastructure failures (sandbox required but unavailable) come
/// back as `Err`.
pub async fn dispatch(
    name: ToolName,
    argument: &str,
    state: &mut RunState,
    failing: &[FailingTest],
    ctx: &ToolCtx<'_>,
    log: &mut EventLog,
) -> Result<ToolOutcome> {
    let key = state.action_key(name.as_str(), argument);
    if state.seen(&key) {
        let observation = skip_observation(name, argument, state, ctx);
        log.record(
            EventKind::ToolCall,
            json!({"tool": name.as_str(), "skipped": true}),
        );
        return Ok(ToolOutcome::skip(observation));
    }

    state.tool_calls += 1;
    let mut payload = json!({
        "tool": name.as_str(),
        "argument_bytes": argument.len(),
        "modifications_count": state.modifications_count,
    });
    if name == ToolName::PlanTodo {
        payload["plan"] = json!(argument);
    }
    log.record(EventKind::ToolCall, payload);

    let outcome = match name {
        ToolName::ReadFile => ToolOutcome::text(read_file::execute(argument, state, ctx)),
        ToolName::WriteFile => write_file::execute(argument, state, ctx, log),
        ToolName::ApplyPatch => apply_patch::execute(argument, state, failing, ctx, log).await,
        ToolName::RunTests => run_tests::execute(argument, state, ctx, log).await?,
        ToolName::CriticReview => critic_review(argument, failing, ctx).await,
        ToolName::PlanTodo => ToolOutcome::text(
            "OK: plan recorded. Continue with the next concrete step \
             (read_file, apply_patch, or run_tests)."
                .to_string(),
        ),
    };

    state.record_action(key);
    Ok(outcome)
}

async fn critic_review(argument: &str, failing: &[FailingTest], ctx: &ToolCtx<'_>) -> ToolOutcome {
    let critic = Critic::new(ctx.guard, ctx.provider);
    match critic.review(argument, failing).await {
        Ok(review) if review.approved => ToolOutcome::text(format!(
            "OK: critic approves this patch: {}",
            review.rationale
        )),
        Ok(review) => ToolOutcome::text(format!(
            "ERROR: critic rejects this patch: {}",
            review.rationale
        )),
        Err(e) => ToolOutcome::text(format!("ERROR: critic review unavailable: {e:#}")),
    }
}

fn skip_observation(
    name: ToolName,
    argument: &str,
    state: &RunState,
    ctx: &ToolCtx<'_>,
) -> String {
    match name {
        ToolName::ReadFile => {
            let resolved = crate::paths::resolve_existing(ctx.controller.root(), argument.trim())
                .map(|(p, _)| p)
                .unwrap_or_else(|| std::path::PathBuf::from(argument.trim()));
            match state.cache_get(&resolved) {
                Some(content) => format!(
                    "SKIP: {} was already read in this state; reuse the previous \
                     observation.\n{content}",
                    resolved.display()
                ),
                None => format!(
                    "SKIP: {} was already read in this state; reuse the previous observation.",
                    resolved.display()
                ),
            }
        }
        ToolName::RunTests => match &state.last_test_json {
            Some(json) => format!(
                "SKIP: the tests already ran with no modifications since; the result is \
                 unchanged.\n{json}"
            ),
            None => "SKIP: the tests already ran in this state.".to_string(),
        },
        ToolName::WriteFile | ToolName::ApplyPatch => {
            "SKIP: this exact modification was already attempted in this state; it would be \
             a no-op. Choose a different action."
                .to_string()
        }
        _ => "SKIP: this action already ran in this state. Choose a different action.".to_string(),
    }
}

/// Paths readable by `read_file`. Secrets and VCS internals are always off
/// limits; test files are gated by configuration.
pub fn read_allowed(path: &str, settings: &ToolSettings) -> Result<(), String> {
    if std::path::Path::new(path).is_absolute() || path.split('/').any(|c| c == "..") {
        return Err(format!("path escapes the repository: {path}"));
    }
    const DENIED: &[&str] = &[
        ".git/**",
        ".restitch/**",
        ".env",
        ".env.*",
        "**/.env",
        "**/secrets/**",
        "**/*.pem",
        "**/*.key",
    ];
    for pattern in DENIED {
        if glob::Pattern::new(pattern).map(|p| p.matches(path)).unwrap_or(false) {
            return Err(format!("{path} is not readable (matches `{pattern}`)"));
        }
    }
    if !settings.allow_test_file_read && is_test_path(path) {
        return Err(format!("{path} is a test file and test reads are disabled"));
    }
    Ok(())
}

pub fn is_test_path(path: &str) -> bool {
    const TEST_GLOBS: &[&str] = &[
        "tests/**",
        "test/**",
        "**/test_*.py",
        "**/*_test.py",
        "**/conftest.py",
    ];
    TEST_GLOBS
        .iter()
        .any(|g| glob::Pattern::new(g).map(|p| p.matches(path)).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::git;
    use restitch_config::Config;
    use restitch_provider::{Generation, GenerateRequest, ModelCapabilities, ProviderKind};

    struct ApprovingProvider {
        caps: ModelCapabilities,
    }

    impl ApprovingProvider {
        fn new() -> Self {
            Self {
                caps: ModelCapabilities {
                    model_id: "stub".into(),
                    kind: ProviderKind::OpenAI,
                    supports_tool_calls: true,
                    supports_stop: true,
                    max_tokens: 4096,
                    context_window: 128_000,
                    fallback_model: None,
                },
            }
        }
    }

    #[async_trait::async_trait]
    impl Provider for ApprovingProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn capabilities(&self) -> &ModelCapabilities {
            &self.caps
        }

        async fn generate(&self, _request: &GenerateRequest) -> anyhow::Result<Generation> {
            Ok(Generation {
                text: r#"{"decision": "approve", "rationale": "ok"}"#.into(),
                ..Generation::default()
            })
        }
    }

    struct Rig {
        _dir: tempfile::TempDir,
        controller: RepoController,
        guard: Guard,
        runner: TestRunner,
        run_paths: RunPaths,
        provider: ApprovingProvider,
        settings: restitch_config::ToolSettings,
        cancel: tokio_util::sync::CancellationToken,
    }

    impl Rig {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path();
            git(root, &["init", "-b", "main"]).unwrap();
            git(root, &["config", "user.email", "t@example.com"]).unwrap();
            git(root, &["config", "user.name", "T"]).unwrap();
            std::fs::create_dir_all(root.join("src")).unwrap();
            std::fs::write(
                root.join("src/calc.py"),
                "def add(a, b):\n    return a - b\n",
            )
            .unwrap();
            git(root, &["add", "-A"]).unwrap();
            git(root, &["commit", "-m", "initial"]).unwrap();

            let config = Config::default();
            let controller = RepoController::open(root, "rig").unwrap();
            let guard = Guard::new(config.safety.clone(), root);
            let runner = TestRunner::new(
                root,
                restitch_config::SandboxSettings {
                    use_sandbox: false,
                    allow_local_fallback: true,
                },
                restitch_config::RunnerSettings {
                    test_command: Some("echo '1 passed'".to_string()),
                    env: Vec::new(),
                },
                std::time::Duration::from_secs(10),
            );
            let run_paths = RunPaths::create(root, "rig").unwrap();
            Self {
                _dir: dir,
                controller,
                guard,
                runner,
                run_paths,
                provider: ApprovingProvider::new(),
                settings: config.tools,
                cancel: tokio_util::sync::CancellationToken::new(),
            }
        }

        fn log(&self) -> EventLog {
            EventLog::open(&self.run_paths).unwrap()
        }

        fn ctx(&self) -> ToolCtx<'_> {
            ToolCtx {
                controller: &self.controller,
                guard: &self.guard,
                runner: &self.runner,
                provider: &self.provider,
                run_paths: &self.run_paths,
                settings: &self.settings,
                cancel: &self.cancel,
            }
        }
    }

    #[tokio::test]
    async fn repeated_read_serves_identical_cached_content() {
        let rig = Rig::new();
        let mut log = rig.log();
        let mut state = RunState::new(&restitch_config::RunLimits::default());

        let ctx = rig.ctx();
        let first = dispatch(
            ToolName::ReadFile,
            "src/calc.py",
            &mut state,
            &[],
            &ctx,
            &mut log,
        )
        .await
        .unwrap();
        assert!(first.observation.starts_with("OK:"));
        assert!(!first.skipped);

        let second = dispatch(
            ToolName::ReadFile,
            "src/calc.py",
            &mut state,
            &[],
            &ctx,
            &mut log,
        )
        .await
        .unwrap();
        assert!(second.skipped);
        assert!(second.observation.starts_with("SKIP:"));
        // The cached body is byte-identical to the original read.
        let body = first.observation.splitn(2, '\n').nth(1).unwrap();
        assert!(second.observation.ends_with(body));
        // The skipped call did not consume tool budget.
        assert_eq!(state.tool_calls, 1);
    }

    #[tokio::test]
    async fn patch_against_unread_file_is_refused() {
        let rig = Rig::new();
        let mut log = rig.log();
        let mut state = RunState::new(&restitch_config::RunLimits::default());
        let patch = "--- a/src/calc.py\n+++ b/src/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a + b\n";

        let ctx = rig.ctx();
        let outcome = dispatch(
            ToolName::ApplyPatch,
            patch,
            &mut state,
            &[],
            &ctx,
            &mut log,
        )
        .await
        .unwrap();
        assert!(outcome.observation.starts_with("ERROR:"));
        assert!(outcome.observation.contains("read_file"));
        assert!(!outcome.applied_patch);
        assert_eq!(state.modifications_count, 0);
    }

    #[tokio::test]
    async fn read_then_patch_succeeds_and_advances_the_epoch() {
        let rig = Rig::new();
        let mut log = rig.log();
        let mut state = RunState::new(&restitch_config::RunLimits::default());
        let patch = "--- a/src/calc.py\n+++ b/src/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a + b\n";

        let ctx = rig.ctx();
        dispatch(
            ToolName::ReadFile,
            "src/calc.py",
            &mut state,
            &[],
            &ctx,
            &mut log,
        )
        .await
        .unwrap();
        let outcome = dispatch(
            ToolName::ApplyPatch,
            patch,
            &mut state,
            &[],
            &ctx,
            &mut log,
        )
        .await
        .unwrap();
        assert!(outcome.applied_patch, "{}", outcome.observation);
        assert_eq!(state.modifications_count, 1);
        assert_eq!(state.applied_commits.len(), 1);

        // A fresh read in the new epoch is not a SKIP.
        let reread = dispatch(
            ToolName::ReadFile,
            "src/calc.py",
            &mut state,
            &[],
            &ctx,
            &mut log,
        )
        .await
        .unwrap();
        assert!(reread.observation.starts_with("OK:"));
        assert!(reread.observation.contains("return a + b"));
    }

    #[tokio::test]
    async fn write_file_denies_test_paths_unconditionally() {
        let rig = Rig::new();
        let mut log = rig.log();
        let mut state = RunState::new(&restitch_config::RunLimits::default());
        let ctx = rig.ctx();
        let argument =
            r#"{"path": "tests/test_calc.py", "new_content": "assert True\n"}"#;
        let outcome = dispatch(
            ToolName::WriteFile,
            argument,
            &mut state,
            &[],
            &ctx,
            &mut log,
        )
        .await
        .unwrap();
        assert!(outcome.observation.starts_with("ERROR:"));
        assert_eq!(state.modifications_count, 0);
    }

    #[test]
    fn tool_names_round_trip() {
        for name in [
            ToolName::ReadFile,
            ToolName::WriteFile,
            ToolName::ApplyPatch,
            ToolName::RunTests,
            ToolName::CriticReview,
            ToolName::PlanTodo,
        ] {
            assert_eq!(ToolName::parse(name.as_str()), Some(name));
        }
        assert_eq!(ToolName::parse("rm_rf"), None);
    }

    #[test]
    fn definitions_cover_every_tool() {
        let defs = definitions();
        assert_eq!(defs.len(), 6);
        for def in &defs {
            assert!(ToolName::parse(&def.name).is_some());
        }
    }

    #[test]
    fn read_scope_rules() {
        let settings = ToolSettings::default();
        assert!(read_allowed("src/calc.py", &settings).is_ok());
        assert!(read_allowed("tests/test_calc.py", &settings).is_ok());
        assert!(read_allowed(".env", &settings).is_err());
        assert!(read_allowed(".git/config", &settings).is_err());
        assert!(read_allowed("../escape.py", &settings).is_err());
        assert!(read_allowed("/etc/passwd", &settings).is_err());

        let no_tests = ToolSettings {
            allow_test_file_read: false,
        };
        assert!(read_allowed("tests/test_calc.py", &no_tests).is_err());
        assert!(read_allowed("src/calc.py", &no_tests).is_ok());
    }

    #[test]
    fn test_path_detection() {
        assert!(is_test_path("tests/test_calc.py"));
        assert!(is_test_path("pkg/module_test.py"));
        assert!(is_test_path("tests/conftest.py"));
        assert!(!is_test_path("src/calc.py"));
    }
}
