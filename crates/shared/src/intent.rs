use std::sync::LazyLock;

use crate::models::Intent;

#[derive(Debug, Clone)]
pub struct IntentRule {
    pub intent: Intent,
    pub phrases: Vec<String>,
}

impl IntentRule {
    pub fn new(intent: Intent, phrases: &[&str]) -> Self {
        Self {
            intent,
            phrases: phrases
                .iter()
                .map(|phrase| phrase.to_lowercase())
                .collect(),
        }
    }

    fn matches(&self, normalized_transcript: &str) -> bool {
        self.phrases
            .iter()
            .any(|phrase| normalized_transcript.contains(phrase.as_str()))
    }
}

/// Ordered phrase table. The first rule with a matching phrase wins; no match
/// means plain chat.
#[derive(Debug, Clone)]
pub struct IntentRouter {
    rules: Vec<IntentRule>,
}

impl Default for IntentRouter {
    fn default() -> Self {
        Self::new(vec![
            IntentRule::new(
                Intent::ShowCamera,
                &[
                    "show me my camera",
                    "show my camera",
                    "show me my pic",
                    "show my picture",
                ],
            ),
            IntentRule::new(
                Intent::ShareCamera,
                &["share my camera", "share my pic", "share my picture"],
            ),
            IntentRule::new(Intent::GenerateImage, &["generate image", "create image"]),
        ])
    }
}

impl IntentRouter {
    pub fn new(rules: Vec<IntentRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[IntentRule] {
        &self.rules
    }

    pub fn classify(&self, transcript: &str) -> Intent {
        let normalized = transcript.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&normalized))
            .map(|rule| rule.intent)
            .unwrap_or(Intent::PlainChat)
    }
}

static DEFAULT_ROUTER: LazyLock<IntentRouter> = LazyLock::new(IntentRouter::default);

pub fn classify(transcript: &str) -> Intent {
    DEFAULT_ROUTER.classify(transcript)
}
