use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;

use crate::paths;
use crate::repo::RepoError;
use crate::state::RunState;
use crate::telemetry::{EventKind, EventLog};
use crate::tools::{ToolCtx, ToolOutcome};

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    new_content: String,
}

pub fn execute(
    argument: &str,
    state: &mut RunState,
    ctx: &ToolCtx<'_>,
    log: &mut EventLog,
) -> ToolOutcome {
    let args: WriteArgs = match serde_json::from_str(argument) {
        Ok(a) => a,
        Err(e) => {
            return ToolOutcome::text(format!(
                "ERROR: write_file expects JSON {{\"path\", \"new_content\"}}: {e}"
            ))
        }
    };
    let requested = args.path.trim();

    // Write scope is the patch scope: test, CI, and secret paths are denied
    // unconditionally.
    if let Err(reason) = ctx.guard.path_allowed(requested) {
        return ToolOutcome::text(format!("ERROR: {reason}"));
    }
    let cap = ctx.guard.policy().max_file_write_bytes;
    if args.new_content.len() > cap {
        return ToolOutcome::text(format!(
            "ERROR: content is {} bytes, write cap is {cap}",
            args.new_content.len()
        ));
    }

    let root = ctx.controller.root();
    let resolved = paths::resolve_existing(root, requested)
        .map(|(p, _)| p)
        .unwrap_or_else(|| PathBuf::from(requested));
    let abs = root.join(&resolved);

    let unchanged = std::fs::read_to_string(&abs)
        .map(|existing| existing == args.new_content)
        .unwrap_or(false);
    if unchanged {
        return ToolOutcome::text(format!(
            "SKIP: {} already has exactly this content",
            resolved.display()
        ));
    }

    if let Err(e) = paths::atomic_write(&abs, &args.new_content) {
        return ToolOutcome::text(format!("ERROR: writing {}: {e}", resolved.display()));
    }

    match ctx
        .controller
        .commit(&format!("restitch: write {}", resolved.display()))
    {
        Ok(commit_id) => {
            state.applied_commits.push(commit_id.clone());
            state.bump_modifications(&[resolved.clone()]);
            state.cache_put(resolved.clone(), args.new_content.clone());
            log.record(
                EventKind::PatchApplied,
                json!({
                    "via": "write_file",
                    "file": resolved.to_string_lossy(),
                    "bytes": args.new_content.len(),
                    "commit": commit_id,
                }),
            );
            ToolOutcome::text(format!(
                "OK: wrote {} bytes to {} (commit {})",
                args.new_content.len(),
                resolved.display(),
                &commit_id[..12.min(commit_id.len())]
            ))
        }
        Err(RepoError::EmptyCommit) => ToolOutcome::text(format!(
            "SKIP: writing {} changed nothing",
            resolved.display()
        )),
        Err(e) => ToolOutcome::text(format!("ERROR: commit failed: {e}")),
    }
}
