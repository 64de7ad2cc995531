//! LLM-backed generator, refiner and repairer.
//!
//! Payloads are opaque text. When a model answers with JSON objects instead
//! of strings, the object is kept as compact JSON so structured ideas
//! (topic, angle, hook, ...) survive the round trip unchanged.

use std::sync::Arc;

use ai_client::{strip_code_blocks, ChatModel};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::structured::parse_structured;
use crate::traits::{Generator, Refiner, Repairer};
use crate::types::{Candidate, ScoreCard};

/// A string stays as-is; anything else becomes compact JSON.
fn payload_from_value(value: Value) -> Option<String> {
    let payload = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => return None,
        other => other.to_string(),
    };
    (!payload.is_empty()).then_some(payload)
}

fn guidance_block(instructions: Option<&str>) -> String {
    instructions
        .map(|g| format!("\n<guidelines>\n{g}\n</guidelines>\n"))
        .unwrap_or_default()
}

// =============================================================================
// LlmRepairer
// =============================================================================

const REPAIR_SYSTEM: &str = "You fix malformed JSON. Delete everything that is not JSON, \
fix any formatting issue and return only the JSON, with no explanation and no code fences.";

pub struct LlmRepairer {
    model: Arc<dyn ChatModel>,
}

impl LlmRepairer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Repairer for LlmRepairer {
    async fn repair(&self, text: &str) -> Result<String> {
        let fixed = self
            .model
            .chat_completion(REPAIR_SYSTEM, text)
            .await
            .context("JSON repair call failed")?;
        Ok(strip_code_blocks(&fixed).to_string())
    }
}

// =============================================================================
// LlmGenerator
// =============================================================================

/// Generates the initial candidate set, optionally condensing the context
/// into a style summary first.
pub struct LlmGenerator {
    model: Arc<dyn ChatModel>,
    instructions: Option<String>,
    summarize_context: bool,
    repairer: Option<Arc<dyn Repairer>>,
}

impl LlmGenerator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            instructions: None,
            summarize_context: false,
            repairer: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_style_summary(mut self, enabled: bool) -> Self {
        self.summarize_context = enabled;
        self
    }

    pub fn with_repairer(mut self, repairer: Arc<dyn Repairer>) -> Self {
        self.repairer = Some(repairer);
        self
    }

    async fn summarize(&self, context: &str) -> Result<String> {
        let system = "You analyze a creator's existing content and write a concise overview \
                      of their style, common themes and audience expectations.";
        let user = format!(
            "Content description:\n<content>\n{context}\n</content>\n\n\
             Summarize the main themes, style and audience interest found above."
        );
        let summary = self
            .model
            .chat_completion(system, &user)
            .await
            .context("Style summary call failed")?;
        Ok(summary.trim().to_string())
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(&self, context: &str, count: usize) -> Result<Vec<String>> {
        let context = if self.summarize_context {
            let summary = self.summarize(context).await?;
            debug!(chars = summary.len(), "Context summarized");
            summary
        } else {
            context.to_string()
        };

        let system = "You brainstorm original, engaging content. Keep every item distinct, \
                      creative and aligned with the context you are given.";
        let user = format!(
            "<context>\n{context}\n</context>\n{guidance}\n\
             Propose exactly {count} different items.\n\
             Return only a JSON array with one entry per item, nothing else.",
            guidance = guidance_block(self.instructions.as_deref()),
        );

        let response = self
            .model
            .chat_completion(system, &user)
            .await
            .context("Generation call failed")?;

        let items: Vec<Value> = parse_structured(&response, self.repairer.as_deref())
            .await
            .context("Generation output was not a JSON array")?;

        let payloads: Vec<String> = items
            .into_iter()
            .filter_map(payload_from_value)
            .take(count)
            .collect();

        info!(requested = count, produced = payloads.len(), "Candidates generated");
        Ok(payloads)
    }
}

// =============================================================================
// LlmRefiner
// =============================================================================

#[derive(Deserialize)]
struct RefineReply {
    #[serde(default, alias = "Feedback")]
    #[allow(dead_code)]
    feedback: Option<String>,
    refined: Option<Value>,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

impl RefineReply {
    /// The improved payload. Critique text is dropped; a reply that puts the
    /// improved fields at the top level is accepted as the payload itself.
    fn into_payload(self) -> Option<String> {
        match self.refined {
            Some(value) => payload_from_value(value),
            None if !self.rest.is_empty() => payload_from_value(Value::Object(self.rest)),
            None => None,
        }
    }
}

/// Critiques one candidate and returns a single improved version.
pub struct LlmRefiner {
    model: Arc<dyn ChatModel>,
    instructions: Option<String>,
    repairer: Option<Arc<dyn Repairer>>,
}

impl LlmRefiner {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            instructions: None,
            repairer: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_repairer(mut self, repairer: Arc<dyn Repairer>) -> Self {
        self.repairer = Some(repairer);
        self
    }
}

#[async_trait]
impl Refiner for LlmRefiner {
    async fn refine(&self, candidate: &Candidate, score: &ScoreCard) -> Result<String> {
        let system = "You are a harsh critic who makes content as unique and engaging as \
                      possible. Point out weak or cliche aspects, then fix them.";
        let user = format!(
            "{guidance}\n<candidate>\n{payload}\n</candidate>\n\n\
             In a panel test it was picked {selected} times out of {shown} ({pct:.1}%).\n\n\
             1. Critique the candidate concisely.\n\
             2. Write one improved version that keeps the same format.\n\n\
             Return only JSON, nothing else:\n\
             {{\"feedback\": \"<your critique>\", \"refined\": <the improved candidate>}}",
            guidance = guidance_block(self.instructions.as_deref()),
            payload = candidate.payload,
            selected = score.times_selected(),
            shown = score.times_shown(),
            pct = score.percentage(),
        );

        let response = self
            .model
            .chat_completion(system, &user)
            .await
            .context("Refinement call failed")?;

        let reply: RefineReply = parse_structured(&response, self.repairer.as_deref())
            .await
            .context("Refinement output was not valid JSON")?;

        reply
            .into_payload()
            .ok_or_else(|| anyhow!("Refinement returned no candidate"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::QueuedModel;

    #[tokio::test]
    async fn generator_keeps_strings_and_compacts_objects() {
        let model = Arc::new(QueuedModel::new([
            r#"```json
["First title", {"topic": "bread", "hook": "no knead"}, "", "Third title"]
```"#,
        ]));
        let generator = LlmGenerator::new(model.clone());
        let items = generator.generate("a baking channel", 5).await.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], "First title");
        let idea: Value = serde_json::from_str(&items[1]).unwrap();
        assert_eq!(idea["topic"], "bread");
        assert!(!items[1].contains('\n'));
        assert_eq!(items[2], "Third title");
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn generator_truncates_to_count() {
        let model = Arc::new(QueuedModel::new([r#"["a", "b", "c", "d"]"#]));
        let generator = LlmGenerator::new(model);
        let items = generator.generate("ctx", 2).await.unwrap();
        assert_eq!(items, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn generator_summarizes_before_generating() {
        let model = Arc::new(QueuedModel::new([
            "Calm, practical home cooking.",
            r#"["Weeknight pasta in 10 minutes"]"#,
        ]));
        let generator = LlmGenerator::new(model.clone())
            .with_style_summary(true)
            .with_instructions("Keep titles under 50 characters.");
        let items = generator.generate("list of past videos", 1).await.unwrap();
        assert_eq!(items, vec!["Weeknight pasta in 10 minutes"]);

        let prompts = model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].1.contains("Calm, practical home cooking."));
        assert!(prompts[1].1.contains("under 50 characters"));
    }

    #[tokio::test]
    async fn generator_repairs_malformed_output_once() {
        let model = Arc::new(QueuedModel::new(["[\"a\", \"b\""]));
        let repairer = Arc::new(crate::testing::StaticRepairer::new(r#"["a", "b"]"#));
        let generator = LlmGenerator::new(model).with_repairer(repairer.clone());
        let items = generator.generate("ctx", 3).await.unwrap();
        assert_eq!(items, vec!["a", "b"]);
        assert_eq!(repairer.calls(), 1);
    }

    #[tokio::test]
    async fn refiner_drops_feedback() {
        let model = Arc::new(QueuedModel::new([
            r#"{"feedback": "too vague", "refined": "I Baked Bread Every Day for a Year"}"#,
        ]));
        let refiner = LlmRefiner::new(model.clone());
        let parent = Candidate::seed("Bread stuff", 1);
        let refined = refiner
            .refine(&parent, &ScoreCard::new(10, 6))
            .await
            .unwrap();
        assert_eq!(refined, "I Baked Bread Every Day for a Year");
        assert!(model.prompts()[0].1.contains("6 times out of 10"));
    }

    #[tokio::test]
    async fn refiner_accepts_top_level_fields() {
        let model = Arc::new(QueuedModel::new([
            r#"{"Feedback": "cliche", "Topic": "Bread", "Hook": "72-hour dough"}"#,
        ]));
        let refiner = LlmRefiner::new(model);
        let parent = Candidate::seed(r#"{"Topic":"Bread"}"#, 1);
        let refined = refiner.refine(&parent, &ScoreCard::default()).await.unwrap();
        let value: Value = serde_json::from_str(&refined).unwrap();
        assert_eq!(value["Topic"], "Bread");
        assert_eq!(value["Hook"], "72-hour dough");
        assert!(value.get("Feedback").is_none());
    }

    #[tokio::test]
    async fn refiner_rejects_feedback_only_reply() {
        let model = Arc::new(QueuedModel::new([r#"{"feedback": "nothing to add"}"#]));
        let refiner = LlmRefiner::new(model);
        let parent = Candidate::seed("x", 1);
        assert!(refiner.refine(&parent, &ScoreCard::default()).await.is_err());
    }

    #[tokio::test]
    async fn repairer_strips_fences() {
        let model = Arc::new(QueuedModel::new(["```json\n{\"a\": 1}\n```"]));
        let repairer = LlmRepairer::new(model);
        assert_eq!(repairer.repair("{a: 1").await.unwrap(), "{\"a\": 1}");
    }
}
