use crate::runner::TestResult;

/// Workflow rules shared by both protocols. The loop enforces these
/// mechanically; the prompt keeps the model from fighting the enforcement.
const WORKFLOW_RULES: &str = "\
# Workflow
1. The failing test set has already been materialized by an initial test run.
2. Read a file before you patch it. Patches against unread files are refused.
3. Propose the smallest patch that can fix the failing tests. Never touch test \
files, CI configuration, dependency manifests, or secrets; patches there are \
rejected.
4. After a patch is applied, run the tests before anything else.
5. Stop only when a test run reports zero failures.
6. Planning is allowed but never as a final step; follow a plan with a \
concrete action.";

pub fn system_prompt_tools(repo_root: &str) -> String {
    format!(
        "You are restitch, an automated repair agent. A repository at {repo_root} \
         has a failing test suite; your job is to fix the source code with minimal, \
         safe patches until the suite passes.\n\n{WORKFLOW_RULES}\n\n\
         Use the provided tools for every action. Patches are unified diffs with \
         a/ and b/ path prefixes rooted at the repository top."
    )
}

pub fn system_prompt_transcript(repo_root: &str) -> String {
    format!(
        "You are restitch, an automated repair agent. A repository at {repo_root} \
         has a failing test suite; your job is to fix the source code with minimal, \
         safe patches until the suite passes.\n\n{WORKFLOW_RULES}\n\n\
         # Protocol\n\
         Respond in exactly this form:\n\n\
         Thought: what you conclude from the last observation\n\
         Action: one of read_file, write_file, apply_patch, run_tests, critic_review, plan_todo\n\
         Action Input: the argument (a path, a unified diff, or JSON)\n\n\
         After each action the runtime inserts an Observation. Never write an \
         Observation yourself. When a test run reports zero failures, respond \
         with:\n\nFinal Answer: <one-line summary of the fix>"
    )
}

/// The opening user message: the initial test result the loop produced.
pub fn initial_user_message(result: &TestResult, result_json: &str) -> String {
    let mut failing = String::new();
    for test in result.failing.iter().take(10) {
        failing.push_str(&format!("- {}: {}\n", test.id, test.message));
    }
    if failing.is_empty() {
        failing.push_str("(failure details were not machine-readable; see raw_tail)\n");
    }
    format!(
        "The test suite was just run. {} failed, {} passed.\n\nFailing tests:\n{failing}\n\
         Full result:\n{result_json}\n\nDiagnose and fix the source code.",
        result.failed, result.passed
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_carry_the_workflow_rules() {
        let tools = system_prompt_tools("/repo");
        let transcript = system_prompt_transcript("/repo");
        for prompt in [&tools, &transcript] {
            assert!(prompt.contains("Read a file before you patch it"));
            assert!(prompt.contains("zero failures"));
        }
        assert!(transcript.contains("Action Input:"));
        assert!(!tools.contains("Action Input:"));
    }
}
