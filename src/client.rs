use serde::Deserialize;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::config::{Profile, Role};
use crate::context::estimate_tokens;
use crate::logger::Logger;

/// Wall-clock budget for a single attempt.
const ATTEMPT_TIMEOUT_SECS: u64 = 300;

/// Backoff between consecutive attempts. Transport faults retry up to three
/// times; anything else fails the call on the spot.
const RETRY_DELAYS_SECS: [u64; 3] = [2, 8, 32];

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection refused or attempt timeout -- retried with backoff.
    #[error("transport fault: {0}")]
    Transport(String),
    /// The endpoint answered, but not with a usable chat completion.
    #[error("protocol fault: {0}")]
    Protocol(String),
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct ModelClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ModelClient {
    pub fn new(endpoint: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }

    /// One blocking chat completion. The model endpoint handles model
    /// autoswap; we just name the model and the sampling profile.
    ///
    /// Consultant-role output is stripped of `<think>…</think>` reasoning
    /// blocks; planner/implementer output is returned verbatim.
    pub async fn call(
        &self,
        model: &str,
        profile: &Profile,
        role: Role,
        system: &str,
        user: &str,
        logger: &Logger,
    ) -> Result<String, ClientError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = build_body(model, profile, system, user);

        let est_in = estimate_tokens(system) + estimate_tokens(user);
        logger.log(&format!(
            "  -> Calling {model} as {} ({est_in} est. tokens in)",
            role.name()
        ));

        let mut attempt = 0usize;
        let text = loop {
            match self.attempt(&url, &body).await {
                Ok(text) => break text,
                Err(ClientError::Transport(msg)) if attempt < RETRY_DELAYS_SECS.len() => {
                    let delay = RETRY_DELAYS_SECS[attempt];
                    attempt += 1;
                    logger.log(&format!(
                        "  !! transport fault ({msg}) -- retry {attempt}/{} in {delay}s",
                        RETRY_DELAYS_SECS.len()
                    ));
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                Err(e) => return Err(e),
            }
        };

        logger.log(&format!("  <- Got {} est. tokens back", estimate_tokens(&text)));

        if role == Role::Consultant {
            Ok(strip_think_blocks(&text))
        } else {
            Ok(text)
        }
    }

    async fn attempt(&self, url: &str, body: &Value) -> Result<String, ClientError> {
        let resp = self
            .http
            .post(url)
            .timeout(Duration::from_secs(ATTEMPT_TIMEOUT_SECS))
            .json(body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = resp.status();
        if !status.is_success() {
            let snippet: String = resp.text().await.unwrap_or_default().chars().take(300).collect();
            return Err(ClientError::Protocol(format!("HTTP {status}: {snippet}")));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::Protocol(format!("malformed response body: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ClientError::Protocol("response contained no choices".to_string()))
    }
}

fn classify_send_error(e: reqwest::Error) -> ClientError {
    if e.is_connect() || e.is_timeout() {
        ClientError::Transport(e.to_string())
    } else {
        ClientError::Protocol(e.to_string())
    }
}

/// Request body for the OpenAI-compatible endpoint. Non-streaming -- the
/// orchestrator has nowhere to show partial output anyway.
fn build_body(model: &str, profile: &Profile, system: &str, user: &str) -> Value {
    serde_json::json!({
        "model": model,
        "messages": [
            {"role": "system", "content": system},
            {"role": "user", "content": user},
        ],
        "temperature": profile.temperature,
        "top_p": profile.top_p,
        "top_k": profile.top_k,
        "min_p": profile.min_p,
        "repeat_penalty": profile.repeat_penalty,
        "max_tokens": profile.max_output_tokens,
        "stream": false,
    })
}

// ── Reasoning-block stripping ─────────────────────────────────────────────────

static THINK_BLOCK: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?s)<think>.*?</think>").unwrap());

/// Remove `<think>…</think>` blocks from model output. Reasoning models
/// sometimes omit the opening tag when the template injects it -- in that
/// case everything up to the closing tag is the reasoning.
pub fn strip_think_blocks(text: &str) -> String {
    let replaced = THINK_BLOCK.replace_all(text, "");
    let s: &str = &replaced;
    let s = match s.find("</think>") {
        Some(pos) if !s[..pos].contains("<think>") => &s[pos + "</think>".len()..],
        _ => s,
    };
    s.trim().to_string()
}
