//! Translation endpoint client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

const TRANSLATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Translation targets accepted on submission and on transcript
/// translation requests.
pub const ALLOWED_TARGETS: &[&str] = &["en", "es", "fr", "de", "it", "pt", "ja", "zh", "ko"];

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("translation failed: {0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, TranslateError>;

/// Blocking-free seam over the external translation endpoint.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TranslateResponseBody {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

/// LibreTranslate-style HTTP client with a per-call timeout.
pub struct HttpTranslator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTranslator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(TRANSLATE_TIMEOUT)
            .build()
            .expect("failed to build translation http client");
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String> {
        let url = format!("{}/translate", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "q": text,
                "source": "auto",
                "target": target_lang,
                "format": "text",
            }))
            .send()
            .await
            .map_err(|e| TranslateError::Failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TranslateError::Failed(format!(
                "endpoint returned HTTP {}",
                response.status()
            )));
        }

        let body: TranslateResponseBody = response
            .json()
            .await
            .map_err(|e| TranslateError::Failed(e.to_string()))?;
        Ok(body.translated_text)
    }
}
