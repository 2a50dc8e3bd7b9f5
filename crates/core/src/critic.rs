use anyhow::Result;

use restitch_provider::{GenerateRequest, Message, Provider};

use crate::guard::Guard;
use crate::runner::FailingTest;

/// The semantic stage runs deterministically cold regardless of the agent's
/// configured sampling temperature.
const CRITIC_TEMPERATURE: f32 = 0.0;
const CRITIC_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct Review {
    pub approved: bool,
    pub rationale: String,
}

pub struct Critic<'a> {
    guard: &'a Guard,
    provider: &'a dyn Provider,
}

impl<'a> Critic<'a> {
    pub fn new(guard: &'a Guard, provider: &'a dyn Provider) -> Self {
        Self { guard, provider }
    }

    /// Two-stage review. The guard runs first and a rejection short-circuits
    /// the model call entirely; a patch is approved only when both stages
    /// approve.
    pub async fn review(&self, patch_text: &str, failing: &[FailingTest]) -> Result<Review> {
        let verdict = self.guard.validate(patch_text);
        if !verdict.ok {
            return Ok(Review {
                approved: false,
                rationale: verdict.joined(),
            });
        }

        let request = GenerateRequest {
            model: self.provider.capabilities().model_id.clone(),
            messages: vec![Message::user(build_review_prompt(patch_text, failing))],
            system: None,
            tools: vec![],
            stop: None,
            temperature: CRITIC_TEMPERATURE,
            max_tokens: Some(CRITIC_MAX_TOKENS),
        };
        let generation = self.provider.generate(&request).await?;

        let (approved, rationale) = parse_verdict(&generation.text).unwrap_or_else(|| {
            (
                false,
                format!(
                    "critic verdict was not parseable, rejecting conservatively: {}",
                    generation.text.chars().take(200).collect::<String>()
                ),
            )
        });
        Ok(Review { approved, rationale })
    }
}

fn build_review_prompt(patch_text: &str, failing: &[FailingTest]) -> String {
    let mut context = String::new();
    for test in failing.iter().take(10) {
        context.push_str(&format!("- {}: {}\n", test.id, test.message));
        if let Some(excerpt) = &test.excerpt {
            context.push_str(&format!("  {excerpt}\n"));
        }
    }
    if context.is_empty() {
        context.push_str("(no structured failure details available)\n");
    }

    format!(
        "You are reviewing a proposed source patch for a repository whose test \
         suite is failing.\n\n\
         Failing tests:\n{context}\n\
         Proposed patch:\n```diff\n{patch_text}\n```\n\n\
         Approve only if the patch plausibly fixes the failing tests with a \
         minimal change to source code, does not weaken or game the tests, and \
         introduces no unrelated behavior. Respond with a single JSON object:\n\
         {{\"decision\": \"approve\" | \"reject\", \"rationale\": \"one sentence\"}}"
    )
}

/// Accept a strict JSON verdict, a verdict embedded in prose, or as a last
/// resort a bare decision keyword.
fn parse_verdict(text: &str) -> Option<(bool, String)> {
    let from_json = |raw: &str| -> Option<(bool, String)> {
        let value: serde_json::Value = serde_json::from_str(raw.trim()).ok()?;
        let decision = value.get("decision")?.as_str()?.to_lowercase();
        let rationale = value
            .get("rationale")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string();
        match decision.as_str() {
            "approve" => Some((true, rationale)),
            "reject" => Some((false, rationale)),
            _ => None,
        }
    };

    if let Some(verdict) = from_json(text) {
        return Some(verdict);
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Some(verdict) = from_json(&text[start..=end]) {
                return Some(verdict);
            }
        }
    }

    let lower = text.to_lowercase();
    if lower.contains("reject") {
        return Some((false, text.trim().to_string()));
    }
    if lower.contains("approve") {
        return Some((true, text.trim().to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use restitch_config::SafetyPolicy;
    use restitch_provider::{Generation, ModelCapabilities, ProviderKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        reply: String,
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn capabilities(&self) -> &ModelCapabilities {
            static CAPS: std::sync::OnceLock<ModelCapabilities> = std::sync::OnceLock::new();
            CAPS.get_or_init(|| ModelCapabilities {
                model_id: "stub-model".into(),
                kind: ProviderKind::OpenAI,
                supports_tool_calls: true,
                supports_stop: true,
                max_tokens: 4096,
                context_window: 128_000,
                fallback_model: None,
            })
        }

        async fn generate(&self, _request: &GenerateRequest) -> Result<Generation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Generation {
                text: self.reply.clone(),
                ..Generation::default()
            })
        }
    }

    const FIX: &str = "\
--- a/src/calc.py
+++ b/src/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a - b
+    return a + b
";

    fn failing() -> Vec<FailingTest> {
        vec![FailingTest {
            id: "tests/test_calc.py::test_add".into(),
            message: "assert -1 == 5".into(),
            file: Some("tests/test_calc.py".into()),
            line: Some(6),
            excerpt: Some("assert -1 == 5".into()),
        }]
    }

    #[tokio::test]
    async fn guard_rejection_skips_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let guard = Guard::new(SafetyPolicy::default(), dir.path());
        let provider = StubProvider::new("{\"decision\": \"approve\", \"rationale\": \"ok\"}");
        let critic = Critic::new(&guard, &provider);

        let bad = FIX.replace("src/calc.py", "tests/test_calc.py");
        let review = critic.review(&bad, &failing()).await.unwrap();
        assert!(!review.approved);
        assert!(review.rationale.contains("scope"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn both_stages_must_approve() {
        let dir = tempfile::tempdir().unwrap();
        let guard = Guard::new(SafetyPolicy::default(), dir.path());

        let approving =
            StubProvider::new("{\"decision\": \"approve\", \"rationale\": \"fixes sign\"}");
        let critic = Critic::new(&guard, &approving);
        let review = critic.review(FIX, &failing()).await.unwrap();
        assert!(review.approved);
        assert_eq!(review.rationale, "fixes sign");

        let rejecting = StubProvider::new(
            "{\"decision\": \"reject\", \"rationale\": \"patch does not touch the bug\"}",
        );
        let critic = Critic::new(&guard, &rejecting);
        let review = critic.review(FIX, &failing()).await.unwrap();
        assert!(!review.approved);
    }

    #[tokio::test]
    async fn unparseable_verdict_rejects_conservatively() {
        let dir = tempfile::tempdir().unwrap();
        let guard = Guard::new(SafetyPolicy::default(), dir.path());
        let provider = StubProvider::new("hmm, hard to say");
        let critic = Critic::new(&guard, &provider);
        let review = critic.review(FIX, &failing()).await.unwrap();
        assert!(!review.approved);
        assert!(review.rationale.contains("not parseable"));
    }

    #[test]
    fn verdict_parsing_variants() {
        assert_eq!(
            parse_verdict("{\"decision\": \"approve\", \"rationale\": \"good\"}"),
            Some((true, "good".to_string()))
        );
        let embedded = "Here is my review:\n{\"decision\": \"reject\", \"rationale\": \"too broad\"}\nThanks.";
        assert_eq!(parse_verdict(embedded), Some((false, "too broad".to_string())));
        let (ok, _) = parse_verdict("I approve this change").unwrap();
        assert!(ok);
        assert_eq!(parse_verdict(""), None);
    }
}
