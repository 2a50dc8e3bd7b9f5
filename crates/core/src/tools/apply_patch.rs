use serde_json::json;
use std::path::PathBuf;

use crate::applier::Applier;
use crate::critic::Critic;
use crate::patch::PatchSet;
use crate::paths;
use crate::runner::FailingTest;
use crate::state::RunState;
use crate::telemetry::{EventKind, EventLog};
use crate::tools::{ToolCtx, ToolOutcome};

pub async fn execute(
    argument: &str,
    state: &mut RunState,
    failing: &[FailingTest],
    ctx: &ToolCtx<'_>,
    log: &mut EventLog,
) -> ToolOutcome {
    // The agent must have looked at every file it is about to change, in
    // the current modifications epoch.
    if let Ok(patch) = PatchSet::parse(argument) {
        for file in &patch.files {
            if file.is_new {
                continue;
            }
            let resolved = paths::resolve_existing(ctx.controller.root(), &file.path)
                .map(|(p, _)| p)
                .unwrap_or_else(|| PathBuf::from(&file.path));
            if !state.read_in_current_epoch(&resolved) {
                return ToolOutcome::text(format!(
                    "ERROR: read {} with read_file before patching it; the file may have \
                     changed since you last saw it",
                    file.path
                ));
            }
        }
    }

    let critic = Critic::new(ctx.guard, ctx.provider);
    let review = match critic.review(argument, failing).await {
        Ok(r) => r,
        Err(e) => {
            return ToolOutcome::text(format!("ERROR: patch review unavailable: {e:#}"));
        }
    };
    if !review.approved {
        log.record(
            EventKind::PatchRejected,
            json!({"rationale": review.rationale}),
        );
        return ToolOutcome::text(format!(
            "ERROR: patch rejected: {}. Revise the patch and try again.",
            review.rationale
        ));
    }

    state.patches_applied += 1;
    let n = state.patches_applied;
    let applier = Applier::new(ctx.controller, ctx.run_paths);
    let outcome = applier.apply(argument, n);

    if !outcome.ok {
        state.patches_applied -= 1;
        log.record(
            EventKind::PatchApplyFailed,
            json!({"reason": outcome.message, "diagnostics": outcome.files}),
        );
        return ToolOutcome::text(format!(
            "ERROR: patch did not apply: {}. The working tree is unchanged; reformulate \
             the patch against the current file contents.",
            outcome.message
        ));
    }

    let touched: Vec<PathBuf> = outcome.files.iter().map(PathBuf::from).collect();
    if let Some(commit_id) = &outcome.commit_id {
        state.applied_commits.push(commit_id.clone());
    }
    state.bump_modifications(&touched);
    log.record(
        EventKind::PatchApplied,
        json!({
            "lines_changed": outcome.lines_changed,
            "files": outcome.files,
            "commit": outcome.commit_id,
            "fallback_writer": outcome.used_fallback,
        }),
    );

    ToolOutcome {
        observation: format!(
            "OK: patch applied as commit {} ({} lines across {} files). Run the tests next.",
            outcome
                .commit_id
                .as_deref()
                .map(|c| &c[..12.min(c.len())])
                .unwrap_or("?"),
            outcome.lines_changed,
            outcome.files.len()
        ),
        applied_patch: true,
        ..ToolOutcome::default()
    }
}
