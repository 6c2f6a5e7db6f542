use std::str::FromStr;
#[cfg(feature = "gemini")]
use std::time::Duration;

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
#[cfg(feature = "gemini")]
use tracing::warn;

use crate::error::Error;

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

/// Optional external capability consulted for supplemental request headers.
/// Implementations swallow their own failures and answer `None`.
pub trait AdvisoryBackend: Send + Sync {
    fn ask(&self, prompt: &str) -> Option<String>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvisoryProvider {
    Gemini,
}

impl AdvisoryProvider {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
        }
    }
}

impl FromStr for AdvisoryProvider {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            other => Err(Error::configuration(format!(
                "unsupported advisory provider: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AdvisoryConfig {
    pub provider: String,
    pub api_key: String,
    pub model: String,
}

impl AdvisoryConfig {
    pub fn new(
        provider: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn gemini(api_key: impl Into<String>) -> Self {
        Self::new(
            AdvisoryProvider::Gemini.as_str(),
            api_key,
            DEFAULT_GEMINI_MODEL,
        )
    }

    pub(crate) fn into_backend(self) -> Result<std::sync::Arc<dyn AdvisoryBackend>, Error> {
        let provider = self.provider.parse::<AdvisoryProvider>()?;
        if self.api_key.trim().is_empty() {
            return Err(Error::configuration("advisory api key must not be empty"));
        }
        if self.model.trim().is_empty()
            || !self
                .model
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '.' | '_'))
        {
            return Err(Error::configuration(format!(
                "invalid advisory model name: {:?}",
                self.model
            )));
        }
        match provider {
            AdvisoryProvider::Gemini => build_gemini(self.api_key, self.model),
        }
    }
}

#[cfg(feature = "gemini")]
fn build_gemini(
    api_key: String,
    model: String,
) -> Result<std::sync::Arc<dyn AdvisoryBackend>, Error> {
    Ok(std::sync::Arc::new(GeminiBackend::new(api_key, model)))
}

#[cfg(not(feature = "gemini"))]
fn build_gemini(
    _api_key: String,
    _model: String,
) -> Result<std::sync::Arc<dyn AdvisoryBackend>, Error> {
    Err(Error::configuration(
        "the gemini advisory provider is not enabled in this build",
    ))
}

#[cfg(feature = "gemini")]
#[derive(Debug, thiserror::Error)]
pub(crate) enum AdvisoryError {
    #[error("advisory request failed: {0}")]
    Request(#[from] ureq::Error),
    #[error("advisory response is missing {0}")]
    MissingField(&'static str),
}

#[cfg(feature = "gemini")]
pub struct GeminiBackend {
    endpoint: String,
    model: String,
    agent: ureq::Agent,
}

#[cfg(feature = "gemini")]
impl GeminiBackend {
    const TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let model = model.into();
        let endpoint = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent?key={api_key}"
        );
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Self::TIMEOUT))
            .build()
            .new_agent();
        Self {
            endpoint,
            model,
            agent,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn generate(&self, prompt: &str) -> Result<String, AdvisoryError> {
        let payload = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        let mut response = self
            .agent
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .send_json(&payload)?;
        let body: serde_json::Value = response.body_mut().read_json()?;
        body.pointer("/candidates/0/content/parts/0/text")
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or(AdvisoryError::MissingField("candidates[0].content.parts[0].text"))
    }
}

#[cfg(feature = "gemini")]
impl std::fmt::Debug for GeminiBackend {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("GeminiBackend")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "gemini")]
impl AdvisoryBackend for GeminiBackend {
    fn ask(&self, prompt: &str) -> Option<String> {
        match self.generate(prompt) {
            Ok(text) => Some(text),
            Err(error) => {
                warn!(model = %self.model, error = %error, "advisory backend query failed");
                None
            }
        }
    }
}

pub(crate) fn header_prompt(destination: &str, failure_count: u64) -> String {
    format!(
        "Optimize HTTP headers for {destination} following {failure_count} recent failures. Return ONLY a JSON dictionary."
    )
}

/// Pulls the outermost `{...}` out of free-form advice and keeps the entries
/// that form valid string headers. Anything malformed yields an empty map.
pub(crate) fn parse_advice_headers(advice: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let (Some(start), Some(end)) = (advice.find('{'), advice.rfind('}')) else {
        return headers;
    };
    if end < start {
        return headers;
    }
    let Ok(serde_json::Value::Object(entries)) =
        serde_json::from_str::<serde_json::Value>(&advice[start..=end])
    else {
        return headers;
    };

    for (name, value) in entries {
        let Some(value) = value.as_str() else {
            continue;
        };
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        headers.insert(name, value);
    }
    headers
}
