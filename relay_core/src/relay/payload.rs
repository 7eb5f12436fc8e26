use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::llm::adapter::{ChatMessage, GenerationOptions};
use crate::utils::{new_user_id, token_hex};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Request body for one attempt. Ids are fresh per instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamPayload {
    pub messages: Vec<ChatMessage>,
    pub id: String,
    pub user_id: Uuid,
    pub preview_token: Option<String>,
    pub code_model_mode: bool,
    pub agent_mode: Map<String, Value>,
    pub trending_agent_mode: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_selected_model: Option<String>,
    pub is_mic_mode: bool,
    pub is_chrome_ext: bool,
    pub github_token: Option<String>,
    pub web_search_mode: bool,
    pub user_system_prompt: Option<String>,
    pub mobile_client: bool,
    pub max_tokens: u64,
    pub playground_temperature: f64,
    pub playground_top_p: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Per-model keys laid over the serialized body.
    #[serde(skip)]
    pub overrides: Map<String, Value>,
}

impl UpstreamPayload {
    pub fn new(
        conversation: &[ChatMessage],
        options: &GenerationOptions,
        config: &RelayConfig,
    ) -> Self {
        let route = config.models.route(options.model.as_deref());
        Self {
            messages: conversation.iter().map(ChatMessage::without_files).collect(),
            id: token_hex(16),
            user_id: new_user_id(),
            preview_token: None,
            code_model_mode: true,
            agent_mode: Map::new(),
            trending_agent_mode: route.trending_agent_mode,
            user_selected_model: route.user_selected_model,
            is_mic_mode: false,
            is_chrome_ext: false,
            github_token: None,
            web_search_mode: true,
            user_system_prompt: None,
            mobile_client: false,
            max_tokens: config.payload.max_tokens,
            playground_temperature: options.resolved_temperature(config.payload.default_temperature),
            playground_top_p: config.payload.top_p,
            mode: None,
            overrides: route.overrides,
        }
    }

    /// Turns this payload into the follow-up request: same ids, the first
    /// pass's text as the newest assistant turn.
    pub fn continue_with(&mut self, accumulated: String) {
        self.messages.push(ChatMessage::assistant(accumulated));
        self.mode = Some("continue".to_string());
    }

    pub fn to_json(&self) -> Result<Value, RelayError> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            for (key, v) in &self.overrides {
                map.insert(key.clone(), v.clone());
            }
        }
        Ok(value)
    }

    pub fn to_body(&self) -> Result<Bytes, RelayError> {
        Ok(Bytes::from(serde_json::to_vec(&self.to_json()?)?))
    }
}
