//! Hosted chat-completion fan-out over an OpenAI-compatible HTTP API.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RemoteSettings;
use crate::error::RemoteError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

pub trait ChatCompletion {
    /// Returns the content of the first choice for `model`.
    fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String, RemoteError>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

fn first_choice(model: &str, response: CompletionResponse) -> Result<String, RemoteError> {
    response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or_else(|| RemoteError::EmptyChoices {
            model: model.to_string(),
        })
}

pub struct HostedChatClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
}

impl HostedChatClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(120))
            .build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Client for the configured `[remote]` endpoint; the key comes from the caller.
    pub fn from_settings(settings: &RemoteSettings, api_key: impl Into<String>) -> Self {
        Self::new(settings.base_url.as_str(), api_key)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

impl ChatCompletion for HostedChatClient {
    fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String, RemoteError> {
        debug!(model, messages = messages.len(), "sending chat completion");
        let body = CompletionRequest { model, messages };

        let response = self
            .agent
            .post(&self.endpoint())
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(&body)
            .map_err(|err| {
                let detail = match err {
                    ureq::Error::Status(code, response) => {
                        let text = response.into_string().unwrap_or_default();
                        format!("HTTP {}: {}", code, text.trim())
                    }
                    ureq::Error::Transport(transport) => transport.to_string(),
                };
                RemoteError::Http {
                    model: model.to_string(),
                    detail,
                }
            })?;

        let parsed: CompletionResponse = response.into_json().map_err(|source| RemoteError::Decode {
            model: model.to_string(),
            source,
        })?;
        first_choice(model, parsed)
    }
}

/// The same conversation addressed to every configured alias.
pub fn broadcast(
    aliases: &BTreeMap<String, String>,
    messages: &[ChatMessage],
) -> BTreeMap<String, Vec<ChatMessage>> {
    aliases
        .keys()
        .map(|alias| (alias.clone(), messages.to_vec()))
        .collect()
}

/// Sends each alias's conversation to the hosted model it maps to.
/// The first failing request aborts the whole fan-out.
pub fn fan_out<C: ChatCompletion + ?Sized>(
    client: &C,
    aliases: &BTreeMap<String, String>,
    conversations: &BTreeMap<String, Vec<ChatMessage>>,
) -> Result<BTreeMap<String, String>, RemoteError> {
    let mut replies = BTreeMap::new();
    for (alias, messages) in conversations {
        let model = aliases
            .get(alias)
            .ok_or_else(|| RemoteError::UnknownAlias(alias.clone()))?;
        let text = client.complete(model, messages)?;
        info!(alias = %alias, model = %model, "hosted reply received");
        replies.insert(alias.clone(), text);
    }
    Ok(replies)
}
