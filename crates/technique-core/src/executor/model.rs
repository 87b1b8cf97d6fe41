//! Model-backed primitive executor.
//!
//! Renders a primitive and its input into a chat prompt, asks a
//! [`ChatModel`] for a JSON object, and returns that object as the
//! primitive's output. Transient failures and timeouts are retried a
//! bounded number of times with a fixed delay.

use std::time::Duration;

use serde_json::{Map, Value};
use technique_types::composition::Primitive;
use technique_types::llm::{ChatError, ChatMessage, ChatRequest, ChatResponse};

use super::{ExecutionContext, ExecutorError, PrimitiveExecutor};

/// A chat completion backend.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ChatModel: Send + Sync {
    fn chat(
        &self,
        request: &ChatRequest,
    ) -> impl std::future::Future<Output = Result<ChatResponse, ChatError>> + Send;
}

#[derive(Debug, Clone)]
pub struct ModelExecutorConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub system: Option<String>,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl Default for ModelExecutorConfig {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            max_tokens: 2048,
            temperature: None,
            system: Some(
                "You execute one step of a larger technique. Reply with a single JSON object \
                 and nothing else."
                    .to_string(),
            ),
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct ModelExecutor<M> {
    model: M,
    config: ModelExecutorConfig,
}

impl<M: ChatModel> ModelExecutor<M> {
    pub fn new(model: M) -> Self {
        Self::with_config(model, ModelExecutorConfig::default())
    }

    pub fn with_config(model: M, config: ModelExecutorConfig) -> Self {
        Self { model, config }
    }

    fn request(&self, primitive: &Primitive, input: &Map<String, Value>) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage::user(build_prompt(primitive, input))],
            system: self.config.system.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }
}

/// Prompt describing the step, its input, and the expected output keys.
pub fn build_prompt(primitive: &Primitive, input: &Map<String, Value>) -> String {
    let mut prompt = format!("Step: {}", primitive.name);
    if !primitive.intent.is_empty() {
        prompt.push_str(&format!("\nIntent: {}", primitive.intent));
    }
    let input = serde_json::to_string_pretty(input).unwrap_or_else(|_| "{}".to_string());
    prompt.push_str(&format!("\n\nInput:\n{input}"));
    if !primitive.outputs.is_empty() {
        prompt.push_str(&format!(
            "\n\nRespond with a JSON object containing the keys: {}",
            primitive.outputs.join(", ")
        ));
    }
    prompt
}

/// Parse a reply as a JSON object: the whole text first, then the first
/// fenced code block.
pub fn parse_reply(content: &str) -> Option<Map<String, Value>> {
    let trimmed = content.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str(trimmed) {
        return Some(map);
    }
    let start = trimmed.find("```")?;
    let after = &trimmed[start + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after.find('\n').map_or(0, |i| i + 1);
    let body = &after[body_start..];
    let end = body.find("```")?;
    match serde_json::from_str(body[..end].trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

impl<M: ChatModel> PrimitiveExecutor for ModelExecutor<M> {
    async fn execute(
        &self,
        primitive: &Primitive,
        input: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Map<String, Value>, ExecutorError> {
        let request = self.request(primitive, input);
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = ExecutorError::Failed("no attempt made".to_string());

        for attempt in 1..=attempts {
            let outcome = tokio::time::timeout(self.config.timeout, self.model.chat(&request)).await;
            let error = match outcome {
                Ok(Ok(response)) => {
                    return parse_reply(&response.content).ok_or_else(|| {
                        ExecutorError::InvalidOutput(format!(
                            "model reply for '{}' is not a JSON object",
                            primitive.id
                        ))
                    });
                }
                Ok(Err(e)) if e.is_transient() => ExecutorError::Failed(e.to_string()),
                Ok(Err(e)) => return Err(ExecutorError::Failed(e.to_string())),
                Err(_) => ExecutorError::Timeout(self.config.timeout.as_millis() as u64),
            };

            tracing::warn!(
                execution_id = %ctx.execution_id,
                primitive_id = primitive.id.as_str(),
                attempt,
                error = %error,
                "model call failed"
            );
            last_error = error;
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Replays scripted results in order; the last one repeats.
    struct ScriptedModel {
        script: Mutex<Vec<Result<String, ChatError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedModel {
        fn new(script: Vec<Result<String, ChatError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl ChatModel for ScriptedModel {
        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
            *self.calls.lock().unwrap() += 1;
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 { script.remove(0) } else { script[0].clone() }
            };
            next.map(|content| ChatResponse {
                content,
                model: request.model.clone(),
            })
        }
    }

    fn fast_config() -> ModelExecutorConfig {
        ModelExecutorConfig {
            retry_delay: Duration::from_millis(1),
            ..ModelExecutorConfig::default()
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            execution_id: Uuid::nil(),
            composition_id: "c".to_string(),
            attempt: 1,
            state: Map::new(),
        }
    }

    #[test]
    fn parses_plain_and_fenced_json() {
        assert_eq!(parse_reply(r#" {"a": 1} "#).unwrap()["a"], 1);
        let fenced = "Here you go:\n```json\n{\"a\": 2}\n```\nDone.";
        assert_eq!(parse_reply(fenced).unwrap()["a"], 2);
        assert!(parse_reply("no json here").is_none());
        assert!(parse_reply("[1, 2]").is_none());
    }

    #[test]
    fn prompt_lists_expected_outputs() {
        let primitive = Primitive::new("p", "Summarize")
            .with_intent("condense the draft")
            .with_outputs(&["summary"]);
        let input = json!({"draft": "text"}).as_object().cloned().unwrap();
        let prompt = build_prompt(&primitive, &input);
        assert!(prompt.contains("Summarize"));
        assert!(prompt.contains("condense the draft"));
        assert!(prompt.contains("\"draft\""));
        assert!(prompt.contains("summary"));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let model = ScriptedModel::new(vec![
            Err(ChatError::Overloaded("busy".into())),
            Ok(r#"{"summary": "ok"}"#.to_string()),
        ]);
        let executor = ModelExecutor::with_config(model, fast_config());
        let out = executor
            .execute(&Primitive::new("p", "P"), &Map::new(), &ctx())
            .await
            .unwrap();
        assert_eq!(out["summary"], "ok");
        assert_eq!(executor.model.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let model = ScriptedModel::new(vec![Err(ChatError::AuthenticationFailed)]);
        let executor = ModelExecutor::with_config(model, fast_config());
        let err = executor
            .execute(&Primitive::new("p", "P"), &Map::new(), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "primitive_execution_failed");
        assert_eq!(executor.model.calls(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let model = ScriptedModel::new(vec![Err(ChatError::Timeout)]);
        let executor = ModelExecutor::with_config(model, fast_config());
        assert!(executor.execute(&Primitive::new("p", "P"), &Map::new(), &ctx()).await.is_err());
        assert_eq!(executor.model.calls(), 3);
    }

    #[tokio::test]
    async fn unparseable_reply_is_invalid_output() {
        let model = ScriptedModel::new(vec![Ok("sorry, I cannot".to_string())]);
        let executor = ModelExecutor::with_config(model, fast_config());
        let err = executor
            .execute(&Primitive::new("p", "P"), &Map::new(), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "execution_output_invalid");
    }
}
