use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    config::Config,
    error::EngineError,
    machine::Transition,
    oracle::{compose_prompt, parse_transition, Oracle},
    pointer,
};

const MAX_ATTEMPTS: u32 = 3;
const TRANSITION_FN: &str = "emit_transition";

/// Network adapter speaking the chat-completions protocol. The output shape
/// is pinned to a single function call carrying the transition record; all
/// sampling knobs are zeroed for determinism.
pub struct ApiOracle {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    seed: u64,
}

impl ApiOracle {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let api_key = config
            .oracle_api_key
            .clone()
            .ok_or_else(|| anyhow!("ORACLE_API_KEY is not set"))?;
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(config.oracle_timeout)
                .build()?,
            base_url: config.oracle_base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.oracle_model.clone(),
            seed: config.oracle_seed,
        })
    }

    fn request_body(&self, messages: &serde_json::Value) -> serde_json::Value {
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0,
            "top_p": 0,
            "presence_penalty": 0,
            "frequency_penalty": 0,
            "seed": self.seed,
            "tools": [{
                "type": "function",
                "function": {
                    "name": TRANSITION_FN,
                    "description": "Emit the single transition for this tick.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "q_next": { "type": "string", "minLength": 1 },
                            "s_prime": { "type": "string" },
                            "d_next": { "type": "string", "minLength": 1 }
                        },
                        "required": ["q_next", "s_prime", "d_next"],
                        "additionalProperties": false
                    }
                }
            }],
            "tool_choice": { "type": "function", "function": { "name": TRANSITION_FN } },
        })
    }
}

// a transport failure is retried quietly; only discipline failures earn the
// corrective system note, since they are the model's fault
enum AttemptFailure {
    /// The request never produced a usable response (network, HTTP status,
    /// or a body that was not the protocol shape).
    Transport(String),
    /// The model responded, but the output failed transition validation.
    Discipline(String),
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Deserialize)]
struct FunctionCall {
    arguments: String,
}

impl Message {
    // function-call arguments verbatim; message content is the fallback
    fn raw_transition(&self) -> Option<String> {
        if let Some(calls) = &self.tool_calls {
            if let Some(call) = calls.first() {
                return Some(call.function.arguments.clone());
            }
        }
        self.content.clone()
    }
}

#[async_trait]
impl Oracle for ApiOracle {
    async fn collapse(
        &self,
        discipline: &str,
        q: &str,
        s: &str,
        d: &str,
    ) -> anyhow::Result<Transition> {
        let mut messages = vec![json!({
            "role": "user",
            "content": compose_prompt(discipline, q, s, d),
        })];

        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(&messages).await {
                Ok(mut transition) => {
                    transition.d_next = pointer::normalize(&transition.d_next);
                    debug!(attempt, "oracle transition accepted");
                    return Ok(transition);
                }
                Err(AttemptFailure::Transport(e)) => {
                    warn!(attempt, error = %e, "oracle transport failure");
                }
                Err(AttemptFailure::Discipline(e)) => {
                    warn!(attempt, error = %e, "oracle output rejected");
                    messages.push(json!({
                        "role": "system",
                        "content": format!(
                            "Your previous output was rejected: {}. Respond with exactly \
                             one call to {} carrying non-empty string fields q_next and \
                             d_next and a string s_prime.",
                            e, TRANSITION_FN
                        ),
                    }));
                }
            }
        }

        Err(EngineError::OracleInvalid(MAX_ATTEMPTS).into())
    }
}

impl ApiOracle {
    async fn attempt(&self, messages: &[serde_json::Value]) -> Result<Transition, AttemptFailure> {
        let body = self.request_body(&json!(messages));
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AttemptFailure::Transport(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AttemptFailure::Transport(format!(
                "http {}: {}",
                status.as_u16(),
                text
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AttemptFailure::Transport(format!("malformed response: {}", e)))?;
        let raw = parsed
            .choices
            .first()
            .and_then(|c| c.message.raw_transition())
            .ok_or_else(|| AttemptFailure::Discipline("response carried no content".to_string()))?;

        parse_transition(&raw).ok_or_else(|| {
            AttemptFailure::Discipline("output was not a valid transition record".to_string())
        })
    }
}
