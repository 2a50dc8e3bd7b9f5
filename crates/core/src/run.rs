use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use restitch_config::Config;

use crate::agent::{self, LoopDeps, LoopEnd};
use crate::guard::Guard;
use crate::repo::RepoController;
use crate::runner::{RunnerError, TestRunner};
use crate::telemetry::{EventKind, EventLog, RunPaths};

/// Terminal outcome of one repair run, with the CLI exit-code mapping.
#[derive(Debug)]
pub enum RunOutcome {
    /// Tests pass; the repair branch carries the fix.
    Success { branch: String, iterations: u32 },
    /// The loop gave up with tests still failing (stuck or model finished
    /// without a fix).
    TestsFailing { reason: String },
    /// A safety or budget cap tripped.
    Budget { reason: String },
    /// Unrecoverable infrastructure error: sandbox required but missing,
    /// model unavailable with no fallback, repository integrity violation.
    Infra { reason: String },
    Interrupted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success { .. } => 0,
            RunOutcome::TestsFailing { .. } => 1,
            RunOutcome::Budget { .. } => 2,
            RunOutcome::Infra { .. } => 3,
            RunOutcome::Interrupted => 130,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RunOutcome::Success { .. } => "success",
            RunOutcome::TestsFailing { .. } => "tests_failing",
            RunOutcome::Budget { .. } => "budget",
            RunOutcome::Infra { .. } => "infra",
            RunOutcome::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Success { branch, iterations } => {
                write!(f, "tests pass after {iterations} iteration(s); fix is on branch {branch}")
            }
            RunOutcome::TestsFailing { reason } => write!(f, "tests still failing: {reason}"),
            RunOutcome::Budget { reason } => write!(f, "budget exhausted: {reason}"),
            RunOutcome::Infra { reason } => write!(f, "infrastructure error: {reason}"),
            RunOutcome::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Entry point: open the repair branch, drive the agent loop, and settle
/// the repository according to the outcome.
pub async fn run_repair(
    repo_path: &Path,
    config: &Config,
    cancel: CancellationToken,
) -> RunOutcome {
    let started = Instant::now();
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string();

    let run_paths = match RunPaths::create(repo_path, &stamp) {
        Ok(p) => p,
        Err(e) => {
            return RunOutcome::Infra {
                reason: format!("cannot create run directory: {e:#}"),
            }
        }
    };
    let mut log = match EventLog::open(&run_paths) {
        Ok(l) => l,
        Err(e) => {
            return RunOutcome::Infra {
                reason: format!("cannot open event log: {e:#}"),
            }
        }
    };
    log.record(
        EventKind::RunStart,
        json!({
            "repo": repo_path.display().to_string(),
            "model": config.model.model_id,
            "max_iterations": config.limits.max_iterations,
        }),
    );

    let finish = |log: &mut EventLog, outcome: RunOutcome, iterations: u32| -> RunOutcome {
        log.record(
            EventKind::RunEnd,
            json!({
                "outcome": outcome.label(),
                "iterations": iterations,
                "duration_ms": started.elapsed().as_millis() as u64,
            }),
        );
        tracing::info!(outcome = outcome.label(), "run finished; event log at {}", log.path().display());
        outcome
    };

    // Model first: if no provider is reachable, nothing has been mutated
    // and no rollback is needed.
    let (provider, substituted) = match restitch_provider::create_with_fallback(
        &config.model.model_id,
        config.model.model_fallback_id.as_deref(),
    ) {
        Ok(pair) => pair,
        Err(e) => {
            return finish(
                &mut log,
                RunOutcome::Infra {
                    reason: format!("model unavailable: {e:#}"),
                },
                0,
            );
        }
    };
    if let Some(substituted) = &substituted {
        log.record(
            EventKind::ModelFallback,
            json!({
                "from": config.model.model_id,
                "to": substituted,
                "reason": "initialization failure",
            }),
        );
    }
    let active_model = substituted.as_deref().unwrap_or(&config.model.model_id);

    // A second provider held in reserve for a mid-run capability mismatch.
    let midrun_fallback = restitch_provider::fallback_model_for(
        active_model,
        config.model.model_fallback_id.as_deref(),
    )
    .filter(|fb| fb != active_model)
    .and_then(|fb| restitch_provider::create_provider(&fb).ok());

    let controller = match RepoController::open(repo_path, &stamp) {
        Ok(c) => c,
        Err(e) => {
            return finish(
                &mut log,
                RunOutcome::Infra {
                    reason: format!("repository integrity: {e}"),
                },
                0,
            );
        }
    };

    let guard = Guard::new(config.safety.clone(), controller.root());
    let runner = TestRunner::new(
        controller.root(),
        config.sandbox.clone(),
        config.runner.clone(),
        Duration::from_secs(config.limits.test_timeout_seconds),
    );

    let deps = LoopDeps {
        controller: &controller,
        guard: &guard,
        runner: &runner,
        run_paths: &run_paths,
        config,
        cancel: &cancel,
    };

    let loop_result = agent::run_loop(provider, midrun_fallback, &deps, &mut log).await;

    match loop_result {
        Ok((LoopEnd::Green { .. }, stats)) => {
            if stats.applied_commits.is_empty() {
                // Nothing was needed; leave no trace.
                settle_with_rollback(&controller, &mut log, false);
                return finish(
                    &mut log,
                    RunOutcome::Success {
                        branch: controller.branch_name().to_string(),
                        iterations: stats.iterations,
                    },
                    stats.iterations,
                );
            }
            // The fix stays checked out on the repair branch for review.
            finish(
                &mut log,
                RunOutcome::Success {
                    branch: controller.branch_name().to_string(),
                    iterations: stats.iterations,
                },
                stats.iterations,
            )
        }
        Ok((LoopEnd::Stuck(reason), stats)) => {
            settle_with_rollback(&controller, &mut log, true);
            finish(
                &mut log,
                RunOutcome::TestsFailing { reason },
                stats.iterations,
            )
        }
        Ok((LoopEnd::Budget(reason), stats)) => {
            settle_with_rollback(&controller, &mut log, true);
            finish(&mut log, RunOutcome::Budget { reason }, stats.iterations)
        }
        Ok((LoopEnd::Interrupted, stats)) => {
            settle_with_rollback(&controller, &mut log, true);
            finish(&mut log, RunOutcome::Interrupted, stats.iterations)
        }
        Err(e) => {
            settle_with_rollback(&controller, &mut log, true);
            let reason = match e.downcast_ref::<RunnerError>() {
                Some(RunnerError::SandboxUnavailable(detail)) => {
                    format!("sandbox required but unavailable: {detail}")
                }
                None => format!("{e:#}"),
            };
            finish(&mut log, RunOutcome::Infra { reason }, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_documented_contract() {
        assert_eq!(
            RunOutcome::Success {
                branch: "restitch/x".into(),
                iterations: 1
            }
            .exit_code(),
            0
        );
        assert_eq!(
            RunOutcome::TestsFailing {
                reason: "stuck".into()
            }
            .exit_code(),
            1
        );
        assert_eq!(
            RunOutcome::Budget {
                reason: "deadline".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            RunOutcome::Infra {
                reason: "no sandbox".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(RunOutcome::Interrupted.exit_code(), 130);
    }

    #[tokio::test]
    async fn missing_credentials_fail_with_infra_before_touching_the_repo() {
        // No provider key in the environment and no git repo either; the
        // provider check runs first and nothing is mutated.
        std::env::remove_var("OPENAI_API_KEY");
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.model.model_id = "gpt-4o-mini".into();
        config.model.model_fallback_id = None;

        let outcome = run_repair(dir.path(), &config, CancellationToken::new()).await;
        match &outcome {
            RunOutcome::Infra { reason } => assert!(reason.contains("model unavailable")),
            other => panic!("expected infra, got {other:?}"),
        }
        assert_eq!(outcome.exit_code(), 3);
        // No repair branch, no lock left behind beyond the metadata dir.
        assert!(!dir.path().join(".git").exists());
    }
}

/// Non-success settlement: discard the run's mutations, restore the
/// original checkout, and drop the repair branch if it is empty.
fn settle_with_rollback(controller: &RepoController, log: &mut EventLog, emit_event: bool) {
    if let Err(e) = controller.rollback() {
        tracing::error!(error = %e, "rollback failed");
    } else if emit_event {
        log.record(
            EventKind::Rollback,
            json!({"to": controller.base_commit()}),
        );
    }
    if let Err(e) = controller.restore_original() {
        tracing::error!(error = %e, "failed to restore original branch");
    }
    if let Err(e) = controller.cleanup() {
        tracing::warn!(error = %e, "failed to clean up repair branch");
    }
}
