use crate::error::RelayError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One conversation turn. Unknown keys ride along in `extra` and are forwarded as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            files: None,
            extra: Map::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Copy of this message with attachments dropped.
    pub fn without_files(&self) -> Self {
        Self {
            files: None,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default)]
    pub model: Option<String>,
    /// Number or numeric string.
    #[serde(default)]
    pub temperature: Option<Value>,
}

impl GenerationOptions {
    /// Falls back to `default` only when the value is missing or not a finite number;
    /// an explicit `0` is kept. Strings contribute their leading number, so
    /// `"0.5 warm"` reads as `0.5`.
    pub fn resolved_temperature(&self, default: f64) -> f64 {
        let parsed = match &self.temperature {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => leading_number(s),
            _ => None,
        };
        parsed.filter(|t| t.is_finite()).unwrap_or(default)
    }
}

/// Longest decimal prefix of `s` after leading whitespace, if any.
fn leading_number(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let digits = |from: usize| {
        bytes[from..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };

    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let int_digits = digits(end);
    end += int_digits;
    let mut frac_digits = 0;
    if bytes.get(end) == Some(&b'.') {
        frac_digits = digits(end + 1);
        if int_digits + frac_digits > 0 {
            end += 1 + frac_digits;
        }
    }
    if int_digits + frac_digits == 0 {
        return None;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let sign = usize::from(matches!(bytes.get(end + 1), Some(b'+' | b'-')));
        let exp_digits = digits(end + 1 + sign);
        if exp_digits > 0 {
            end += 1 + sign + exp_digits;
        }
    }
    s[..end].parse().ok()
}

/// Raw body fragments of one upstream response.
pub type FragmentStream = BoxStream<'static, Result<Bytes, RelayError>>;

#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// POST `body` upstream. A non-success status is reported as
    /// [`RelayError::UpstreamHttp`] before any fragment is returned.
    async fn post_stream(&self, body: Bytes) -> Result<FragmentStream, RelayError>;
}
