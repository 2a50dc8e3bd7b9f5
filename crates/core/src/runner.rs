use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use restitch_config::{RunnerSettings, SandboxSettings};

const RAW_TAIL_LINES: usize = 200;
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("sandbox unavailable and local fallback is disabled: {0}")]
    SandboxUnavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailingTest {
    pub id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

/// Structured result of one test-suite execution. Serialized verbatim as
/// the `run_tests` observation and into `test-<n>.json` artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub exit_code: i32,
    pub passed: u32,
    pub failed: u32,
    pub failing: Vec<FailingTest>,
    pub duration_ms: u64,
    pub raw_tail: String,
}

impl TestResult {
    pub fn is_green(&self) -> bool {
        self.exit_code == 0 && self.failed == 0
    }

    pub fn timed_out(&self) -> bool {
        self.exit_code == -1
    }

    fn runner_error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 127,
            passed: 0,
            failed: 1,
            failing: Vec::new(),
            duration_ms: 0,
            raw_tail: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct RunOutput {
    pub result: TestResult,
    /// Set when the isolated backend was unavailable and the local fallback
    /// ran instead; carries the reason for the `sandbox_fallback` event.
    pub sandbox_fallback: Option<String>,
}

pub struct TestRunner {
    repo_root: PathBuf,
    sandbox: SandboxSettings,
    settings: RunnerSettings,
    timeout: Duration,
}

impl TestRunner {
    pub fn new(
        repo_root: &Path,
        sandbox: SandboxSettings,
        settings: RunnerSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            sandbox,
            settings,
            timeout,
        }
    }

    /// Execute the suite, preferring the isolated backend. `scratch` is the
    /// run directory for machine-readable report files.
    pub async fn run(
        &self,
        selectors: &[String],
        run_n: u32,
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, RunnerError> {
        let junit_path = scratch.join(format!("junit-{run_n}.xml"));
        let test_cmd = self.test_command(selectors, &junit_path);

        let mut fallback_reason = None;
        let (program, args) = if self.sandbox.use_sandbox {
            match self.sandboxed_command(&test_cmd) {
                Ok(wrapped) => wrapped,
                Err(reason) => {
                    if !self.sandbox.allow_local_fallback {
                        return Err(RunnerError::SandboxUnavailable(reason));
                    }
                    tracing::warn!(%reason, "sandbox unavailable, running tests locally");
                    fallback_reason = Some(reason);
                    local_command(&test_cmd)
                }
            }
        } else {
            local_command(&test_cmd)
        };

        let result = self
            .execute(&program, &args, &junit_path, cancel)
            .await;
        Ok(RunOutput {
            result,
            sandbox_fallback: fallback_reason,
        })
    }

    fn test_command(&self, selectors: &[String], junit_path: &Path) -> String {
        let mut cmd = match &self.settings.test_command {
            Some(custom) => custom.clone(),
            None => format!(
                "python -m pytest -q --tb=short --junitxml={}",
                junit_path.display()
            ),
        };
        for selector in selectors {
            // Selectors are test ids; shell metacharacters are not welcome.
            let clean: String = selector
                .chars()
                .filter(|c| c.is_alphanumeric() || "_-./:[]".contains(*c))
                .collect();
            if !clean.is_empty() {
                cmd.push(' ');
                cmd.push_str(&clean);
            }
        }
        cmd
    }

    /// Wrap the test command in a bubblewrap jail: read-only system binds,
    /// a read-write bind of the working tree only, no network, and
    /// cpu/memory/process rlimits applied inside.
    fn sandboxed_command(&self, test_cmd: &str) -> Result<(String, Vec<String>), String> {
        if !bwrap_available() {
            return Err("bwrap not found on PATH".to_string());
        }
        let root = self.repo_root.to_string_lossy().to_string();
        let cpu_secs = self.timeout.as_secs().max(1);
        let limited = format!(
            "ulimit -t {cpu_secs} -v 1048576 -u 256 2>/dev/null; exec {test_cmd}"
        );
        let mut args: Vec<String> = vec![
            "--ro-bind", "/usr", "/usr",
            "--ro-bind-try", "/lib", "/lib",
            "--ro-bind-try", "/lib64", "/lib64",
            "--ro-bind", "/bin", "/bin",
            "--ro-bind-try", "/sbin", "/sbin",
            "--ro-bind-try", "/etc", "/etc",
            "--proc", "/proc",
            "--dev", "/dev",
            "--tmpfs", "/tmp",
            "--unshare-net",
            "--die-with-parent",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        args.extend(["--bind".to_string(), root.clone(), root.clone()]);
        args.extend(["--chdir".to_string(), root]);
        args.extend(["/bin/sh".to_string(), "-c".to_string(), limited]);
        Ok(("bwrap".to_string(), args))
    }

    async fn execute(
        &self,
        program: &str,
        args: &[String],
        junit_path: &Path,
        cancel: &CancellationToken,
    ) -> TestResult {
        let start = Instant::now();

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(&self.repo_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.settings.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                return TestResult::runner_error(format!(
                    "failed to start test command `{program}`: {e}"
                ))
            }
        };

        // Drain the pipes concurrently so a chatty suite cannot deadlock on
        // a full pipe buffer.
        let stdout_task = drain(child.stdout.take());
        let stderr_task = drain(child.stderr.take());

        enum Waited {
            Done(std::io::Result<std::process::ExitStatus>),
            TimedOut,
            Cancelled,
        }

        // The child borrow inside the select must end before the kill paths
        // below may touch it.
        let waited = tokio::select! {
            result = tokio::time::timeout(self.timeout, child.wait()) => match result {
                Ok(status) => Waited::Done(status),
                Err(_) => Waited::TimedOut,
            },
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        match waited {
            Waited::Done(Ok(status)) => {
                let exit_code = status.code().unwrap_or(-1);
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                let junit = std::fs::read_to_string(junit_path).ok();
                let mut result =
                    parse_test_output(&stdout, &stderr, junit.as_deref(), exit_code);
                result.duration_ms = start.elapsed().as_millis() as u64;
                result
            }
            Waited::Done(Err(e)) => {
                TestResult::runner_error(format!("test command failed to run: {e}"))
            }
            Waited::TimedOut => {
                kill_escalating(&mut child).await;
                TestResult {
                    exit_code: -1,
                    passed: 0,
                    failed: 1,
                    failing: Vec::new(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    raw_tail: format!(
                        "test run exceeded the {}s timeout and was killed",
                        self.timeout.as_secs()
                    ),
                }
            }
            Waited::Cancelled => {
                tracing::info!("test run cancelled, terminating child");
                kill_escalating(&mut child).await;
                TestResult {
                    exit_code: -1,
                    passed: 0,
                    failed: 1,
                    failing: Vec::new(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    raw_tail: "test run cancelled".to_string(),
                }
            }
        }
    }
}

fn drain<R>(reader: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut buf = String::new();
        if let Some(mut reader) = reader {
            let mut bytes = Vec::new();
            let _ = reader.read_to_end(&mut bytes).await;
            buf = String::from_utf8_lossy(&bytes).to_string();
        }
        buf
    })
}

fn local_command(test_cmd: &str) -> (String, Vec<String>) {
    (
        "/bin/sh".to_string(),
        vec!["-c".to_string(), test_cmd.to_string()],
    )
}

fn bwrap_available() -> bool {
    std::process::Command::new("which")
        .arg("bwrap")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Kill a child politely (SIGTERM), escalating to SIGKILL after a grace
/// period. Used by cancellation paths that still hold the child handle.
pub async fn kill_escalating(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = std::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status();
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

/// Build a `TestResult` from whatever the tool gave us: JUnit XML when the
/// report file exists, stdout anchors otherwise, and a conservative guess
/// when neither parses.
pub fn parse_test_output(
    stdout: &str,
    stderr: &str,
    junit: Option<&str>,
    exit_code: i32,
) -> TestResult {
    let combined = format!("{stdout}\n{stderr}");
    let raw_tail = tail_lines(&combined, RAW_TAIL_LINES);

    let mut failing = junit.map(parse_junit).unwrap_or_default();
    if failing.is_empty() {
        failing = parse_failed_lines(stdout);
    }
    attach_locations(&mut failing, stdout);

    let (passed, mut failed) = parse_summary(stdout);
    if failed == 0 && !failing.is_empty() {
        failed = failing.len() as u32;
    }
    if exit_code != 0 && failed == 0 {
        // Could not tell what broke; report conservatively high.
        failed = 1;
    }

    TestResult {
        exit_code,
        passed,
        failed,
        failing,
        duration_ms: 0,
        raw_tail,
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// `FAILED tests/test_calc.py::test_add - assert -1 == 5`
fn parse_failed_lines(stdout: &str) -> Vec<FailingTest> {
    let re = regex::Regex::new(r"(?m)^(?:FAILED|ERROR)\s+(\S+)(?:\s+-\s+(.*))?$").unwrap();
    re.captures_iter(stdout)
        .map(|cap| FailingTest {
            id: cap[1].to_string(),
            message: cap
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
            file: None,
            line: None,
            excerpt: None,
        })
        .collect()
}

/// `===== 1 failed, 3 passed in 0.12s =====`
fn parse_summary(stdout: &str) -> (u32, u32) {
    let passed_re = regex::Regex::new(r"(\d+) passed").unwrap();
    let failed_re = regex::Regex::new(r"(\d+) (?:failed|error)").unwrap();
    let passed = passed_re
        .captures_iter(stdout)
        .last()
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);
    let failed = failed_re
        .captures_iter(stdout)
        .last()
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);
    (passed, failed)
}

/// Walk each pytest failure section (delimited by `____ name ____`) for the
/// `path:line:` traceback anchor and the first `E  ` assertion excerpt.
fn attach_locations(failing: &mut [FailingTest], stdout: &str) {
    let section_re = regex::Regex::new(r"_{4,}\s+(\S+)\s+_{4,}").unwrap();
    let loc_re = regex::Regex::new(r"(?m)^(\S+\.\w+):(\d+):").unwrap();
    let excerpt_re = regex::Regex::new(r"(?m)^E\s+(.*)$").unwrap();

    let mut sections: Vec<(String, usize)> = section_re
        .captures_iter(stdout)
        .map(|c| (c[1].to_string(), c.get(0).unwrap().end()))
        .collect();
    sections.push((String::new(), stdout.len()));

    for window in sections.windows(2) {
        let (name, start) = (&window[0].0, window[0].1);
        let end = window[1].1;
        let body = &stdout[start..end.min(stdout.len())];

        if let Some(test) = failing.iter_mut().find(|t| t.id.ends_with(name.as_str())) {
            if let Some(loc) = loc_re.captures(body) {
                test.file = Some(loc[1].to_string());
                test.line = loc[2].parse().ok();
            }
            if let Some(e) = excerpt_re.captures(body) {
                test.excerpt = Some(e[1].trim().to_string());
            }
        }
    }
}

/// Regex-level JUnit parsing, enough for name/classname/message extraction.
fn parse_junit(content: &str) -> Vec<FailingTest> {
    let testcase_re = regex::Regex::new(
        r#"<testcase[^>]*classname="([^"]*)"[^>]*name="([^"]+)"[^>]*>"#,
    )
    .unwrap();
    let failure_re = regex::Regex::new(r#"<(?:failure|error)[^>]*message="([^"]*)""#).unwrap();

    let mut failing = Vec::new();
    for cap in testcase_re.captures_iter(content) {
        let start = cap.get(0).unwrap().end();
        let end = content[start..]
            .find("</testcase>")
            .map(|i| start + i)
            .unwrap_or(content.len());
        let body = &content[start..end];
        if let Some(fail) = failure_re.captures(body) {
            let classname = cap[1].replace('.', "/");
            let id = if classname.is_empty() {
                cap[2].to_string()
            } else {
                format!("{}::{}", classname, &cap[2])
            };
            failing.push(FailingTest {
                id,
                message: unescape_xml(&fail[1]),
                file: None,
                line: None,
                excerpt: None,
            });
        }
    }
    failing
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYTEST_FAILURE: &str = r#"
============================= test session starts ==============================
collected 2 items

tests/test_calc.py .F                                                    [100%]

=================================== FAILURES ===================================
__________________________________ test_add ____________________________________

    def test_add():
>       assert add(2, 3) == 5
E       assert -1 == 5

tests/test_calc.py:6: AssertionError
=========================== short test summary info ============================
FAILED tests/test_calc.py::test_add - assert -1 == 5
========================= 1 failed, 1 passed in 0.03s ==========================
"#;

    #[test]
    fn parses_pytest_stdout_anchors() {
        let result = parse_test_output(PYTEST_FAILURE, "", None, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.passed, 1);
        assert_eq!(result.failing.len(), 1);
        let test = &result.failing[0];
        assert_eq!(test.id, "tests/test_calc.py::test_add");
        assert_eq!(test.message, "assert -1 == 5");
        assert_eq!(test.file.as_deref(), Some("tests/test_calc.py"));
        assert_eq!(test.line, Some(6));
        assert_eq!(test.excerpt.as_deref(), Some("assert -1 == 5"));
    }

    #[test]
    fn green_suite_parses_clean() {
        let stdout = "2 passed in 0.01s\n";
        let result = parse_test_output(stdout, "", None, 0);
        assert!(result.is_green());
        assert_eq!(result.passed, 2);
        assert!(result.failing.is_empty());
    }

    #[test]
    fn junit_report_wins_over_stdout() {
        let junit = r#"<testsuite><testcase classname="tests.test_calc" name="test_add" time="0.01"><failure message="assert -1 == 5">trace</failure></testcase><testcase classname="tests.test_calc" name="test_sub" time="0.01"></testcase></testsuite>"#;
        let result = parse_test_output("", "", Some(junit), 1);
        assert_eq!(result.failing.len(), 1);
        assert_eq!(result.failing[0].id, "tests/test_calc::test_add");
        assert_eq!(result.failing[0].message, "assert -1 == 5");
    }

    #[test]
    fn unparseable_failure_is_conservative() {
        let result = parse_test_output("some garbage output", "", None, 2);
        assert!(result.failed >= 1);
        assert!(result.raw_tail.contains("garbage"));
    }

    #[test]
    fn raw_tail_is_bounded() {
        let long: String = (0..500).map(|i| format!("line {i}\n")).collect();
        let result = parse_test_output(&long, "", None, 1);
        assert_eq!(result.raw_tail.lines().count(), RAW_TAIL_LINES);
        assert!(result.raw_tail.contains("line 499"));
    }

    #[test]
    fn selectors_are_sanitized() {
        let runner = TestRunner::new(
            Path::new("/tmp/repo"),
            SandboxSettings::default(),
            RunnerSettings::default(),
            Duration::from_secs(60),
        );
        let cmd = runner.test_command(
            &["tests/test_calc.py::test_add; rm -rf /".to_string()],
            Path::new("/tmp/junit.xml"),
        );
        assert!(cmd.contains("tests/test_calc.py::test_add"));
        assert!(!cmd.contains(';'));
        assert!(!cmd.contains("rm -rf"));
    }

    #[tokio::test]
    async fn startup_failure_is_a_runner_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(
            dir.path(),
            SandboxSettings {
                use_sandbox: false,
                allow_local_fallback: true,
            },
            RunnerSettings {
                test_command: Some("/nonexistent-interpreter --version".to_string()),
                env: Vec::new(),
            },
            Duration::from_secs(5),
        );
        let cancel = CancellationToken::new();
        let output = runner.run(&[], 1, dir.path(), &cancel).await.unwrap();
        assert!(!output.result.is_green());
        assert_ne!(output.result.exit_code, 0);
    }

    #[tokio::test]
    async fn timeout_kills_the_child_with_exit_minus_one() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(
            dir.path(),
            SandboxSettings {
                use_sandbox: false,
                allow_local_fallback: true,
            },
            RunnerSettings {
                test_command: Some("sleep 30".to_string()),
                env: Vec::new(),
            },
            Duration::from_millis(200),
        );
        let cancel = CancellationToken::new();
        let output = runner.run(&[], 1, dir.path(), &cancel).await.unwrap();
        assert!(output.result.timed_out());
        assert_eq!(output.result.exit_code, -1);
    }

    #[tokio::test]
    async fn strict_mode_without_sandbox_is_fatal() {
        if bwrap_available() {
            // Sandbox present; strict mode would succeed here.
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(
            dir.path(),
            SandboxSettings {
                use_sandbox: true,
                allow_local_fallback: false,
            },
            RunnerSettings::default(),
            Duration::from_secs(5),
        );
        let cancel = CancellationToken::new();
        let err = runner.run(&[], 1, dir.path(), &cancel).await;
        assert!(matches!(err, Err(RunnerError::SandboxUnavailable(_))));
    }
}
