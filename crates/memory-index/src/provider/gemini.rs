use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{config::RemoteProviderConfig, error::MemoryError};

use super::BatchItem;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "text-embedding-004";

/// Gemini-compatible embeddings endpoint with the equivalent batch-job
/// surface: submit inlined requests as a job, poll the operation, collect
/// responses by custom id.
pub(crate) struct GeminiEmbeddings {
    http: Client,
    base_url: String,
    model: String,
    headers: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OperationResponse {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    response: Option<serde_json::Value>,
}

impl GeminiEmbeddings {
    pub(crate) fn new(config: &RemoteProviderConfig, model: Option<String>) -> Result<Self> {
        let mut headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let has_key_header = headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("x-goog-api-key"));
        if !has_key_header {
            let api_key = config
                .api_key
                .clone()
                .or_else(|| std::env::var("GEMINI_API_KEY").ok())
                .or_else(|| std::env::var("GOOGLE_API_KEY").ok());
            match api_key {
                Some(key) => headers.push(("x-goog-api-key".to_string(), key)),
                None => {
                    return Err(MemoryError::MissingApiKey {
                        provider: "gemini",
                        hint: "set provider.gemini.apiKey or the GEMINI_API_KEY environment \
                               variable"
                            .to_string(),
                    }
                    .into())
                }
            }
        }

        let http = Client::builder()
            .build()
            .context("Failed to build HTTP client for gemini embeddings")?;

        Ok(Self {
            http,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            headers,
        })
    }

    pub(crate) fn model(&self) -> &str {
        &self.model
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        self.headers
            .iter()
            .fold(builder, |builder, (name, value)| builder.header(name, value))
    }

    pub(crate) async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [{ "text": text }] },
                })
            })
            .collect();

        let response = self
            .request(self.http.post(format!(
                "{}/models/{}:batchEmbedContents",
                self.base_url, self.model
            )))
            .json(&json!({ "requests": requests }))
            .send()
            .await
            .map_err(|error| anyhow!("gemini embeddings request failed: {error}"))?;
        let response = check_status("embeddings", response).await?;

        let parsed: BatchEmbedResponse = response
            .json()
            .await
            .map_err(|error| anyhow!("gemini embeddings response unreadable: {error}"))?;

        if parsed.embeddings.len() != texts.len() {
            bail!(
                "gemini embeddings returned {} vectors for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            );
        }
        Ok(parsed
            .embeddings
            .into_iter()
            .map(|embedding| embedding.values)
            .collect())
    }

    // ------------------------------------------------------------------
    // Batch jobs
    // ------------------------------------------------------------------

    async fn create_job(&self, items: &[BatchItem]) -> Result<OperationResponse> {
        let requests: Vec<serde_json::Value> = items
            .iter()
            .map(|item| {
                json!({
                    "customId": item.custom_id,
                    "content": { "parts": [{ "text": item.text }] },
                })
            })
            .collect();

        let response = self
            .request(self.http.post(format!("{}/batches", self.base_url)))
            .json(&json!({
                "model": format!("models/{}", self.model),
                "requests": requests,
            }))
            .send()
            .await
            .map_err(|error| anyhow!("gemini batch create failed: {error}"))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::METHOD_NOT_ALLOWED {
            return Err(MemoryError::BatchUnavailable(format!(
                "gemini batch endpoint answered {}",
                status.as_u16()
            ))
            .into());
        }
        let response = check_status("batch create", response).await?;

        response
            .json()
            .await
            .map_err(|error| anyhow!("gemini batch create response unreadable: {error}"))
    }

    async fn poll_job(&self, name: &str) -> Result<OperationResponse> {
        let response = self
            .request(self.http.get(format!("{}/{name}", self.base_url)))
            .send()
            .await
            .map_err(|error| anyhow!("gemini batch poll failed: {error}"))?;
        let response = check_status("batch poll", response).await?;

        response
            .json()
            .await
            .map_err(|error| anyhow!("gemini batch poll response unreadable: {error}"))
    }

    pub(crate) async fn run_batch_job(
        &self,
        items: &[BatchItem],
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut operation = self.create_job(items).await?;
        debug!(
            "gemini batch job {} submitted ({} items)",
            operation.name,
            items.len()
        );

        let deadline = Instant::now() + timeout;
        while !operation.done {
            if Instant::now() >= deadline {
                bail!("gemini batch job {} timed out", operation.name);
            }
            tokio::time::sleep(poll_interval).await;
            operation = self.poll_job(&operation.name).await?;
        }

        if let Some(error) = operation.error {
            bail!("gemini batch job {} failed: {error}", operation.name);
        }

        let response = operation
            .response
            .ok_or_else(|| anyhow!("gemini batch job {} completed empty", operation.name))?;
        Ok(parse_job_response(&response))
    }
}

/// The completed operation inlines one entry per request, keyed by the
/// custom id it was submitted with.
fn parse_job_response(response: &serde_json::Value) -> HashMap<String, Vec<f32>> {
    let mut vectors = HashMap::new();

    let entries = response
        .get("embeddings")
        .or_else(|| response.get("responses"))
        .and_then(|value| value.as_array());
    let Some(entries) = entries else {
        return vectors;
    };

    for entry in entries {
        let Some(custom_id) = entry
            .get("customId")
            .or_else(|| entry.get("custom_id"))
            .and_then(|id| id.as_str())
        else {
            continue;
        };

        let values = entry
            .get("values")
            .or_else(|| entry.pointer("/embedding/values"))
            .and_then(|raw| serde_json::from_value::<Vec<f32>>(raw.clone()).ok());

        if let Some(vector) = values {
            vectors.insert(custom_id.to_string(), vector);
        }
    }

    vectors
}

async fn check_status(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!(
        "gemini {operation} request failed with status {}: {}",
        status.as_u16(),
        body.chars().take(300).collect::<String>()
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_job_response;

    #[test]
    fn collects_vectors_by_custom_id() {
        let response = json!({
            "embeddings": [
                { "customId": "a", "values": [1.0, 0.0] },
                { "customId": "b", "embedding": { "values": [0.0, 1.0] } },
                { "values": [9.0] },
            ]
        });

        let vectors = parse_job_response(&response);
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors["a"], vec![1.0, 0.0]);
        assert_eq!(vectors["b"], vec![0.0, 1.0]);
    }
}
