use crate::paths;
use crate::state::RunState;
use crate::tools::{read_allowed, ToolCtx};

pub fn execute(argument: &str, state: &mut RunState, ctx: &ToolCtx<'_>) -> String {
    let requested = argument.trim();
    if requested.is_empty() {
        return "ERROR: read_file needs a repository-relative path".to_string();
    }

    if let Err(reason) = read_allowed(requested, ctx.settings) {
        return format!("ERROR: {reason}");
    }

    let root = ctx.controller.root();
    let Some((resolved, annotated)) = paths::resolve_existing(root, requested) else {
        return format!(
            "ERROR: {requested} not found (also tried the src/, lib/, and app/ roots)"
        );
    };
    // Resolution may land somewhere the literal path check did not cover.
    if let Err(reason) = read_allowed(&resolved.to_string_lossy(), ctx.settings) {
        return format!("ERROR: {reason}");
    }

    let abs = root.join(&resolved);
    let metadata = match std::fs::metadata(&abs) {
        Ok(m) => m,
        Err(e) => return format!("ERROR: cannot stat {}: {e}", resolved.display()),
    };
    let cap = ctx.guard.policy().max_file_read_bytes as u64;
    if metadata.len() > cap {
        return format!(
            "ERROR: {} is {} bytes, read cap is {cap}",
            resolved.display(),
            metadata.len()
        );
    }

    let content = match std::fs::read_to_string(&abs) {
        Ok(c) => c,
        Err(e) => return format!("ERROR: cannot read {}: {e}", resolved.display()),
    };

    state.cache_put(resolved.clone(), content.clone());

    let header = if annotated {
        format!("OK: {} (resolved from {requested})", resolved.display())
    } else {
        format!("OK: {}", resolved.display())
    };
    format!("{header}\n{content}")
}
