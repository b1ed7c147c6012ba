use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{multipart, Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{config::RemoteProviderConfig, error::MemoryError};

use super::BatchItem;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "text-embedding-3-small";

/// OpenAI-compatible embeddings endpoint, plus its batch-job surface
/// (upload a JSONL request file, create a job, poll, download results).
pub(crate) struct OpenAiEmbeddings {
    http: Client,
    base_url: String,
    model: String,
    headers: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbedDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    id: String,
    status: String,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
}

impl OpenAiEmbeddings {
    pub(crate) fn new(config: &RemoteProviderConfig, model: Option<String>) -> Result<Self> {
        let mut headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let has_auth = headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("authorization"));
        if !has_auth {
            let api_key = config
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
            match api_key {
                Some(key) => headers.push(("Authorization".to_string(), format!("Bearer {key}"))),
                None => {
                    return Err(MemoryError::MissingApiKey {
                        provider: "openai",
                        hint: "set provider.openai.apiKey or the OPENAI_API_KEY environment \
                               variable"
                            .to_string(),
                    }
                    .into())
                }
            }
        }

        let http = Client::builder()
            .build()
            .context("Failed to build HTTP client for openai embeddings")?;

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
        let response = self
            .request(self.http.post(format!("{}/embeddings", self.base_url)))
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .map_err(|error| anyhow!("openai embeddings request failed: {error}"))?;
        let response = check_status("embeddings", response).await?;

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|error| anyhow!("openai embeddings response unreadable: {error}"))?;

        let mut data = parsed.data;
        data.sort_by_key(|datum| datum.index);
        if data.len() != texts.len() {
            bail!(
                "openai embeddings returned {} vectors for {} inputs",
                data.len(),
                texts.len()
            );
        }
        Ok(data.into_iter().map(|datum| datum.embedding).collect())
    }

    // ------------------------------------------------------------------
    // Batch jobs
    // ------------------------------------------------------------------

    async fn upload_requests(&self, jsonl: String) -> Result<String> {
        let part = multipart::Part::bytes(jsonl.into_bytes())
            .file_name("embeddings.jsonl")
            .mime_str("application/jsonl")
            .context("Failed to build batch upload part")?;
        let form = multipart::Form::new().text("purpose", "batch").part("file", part);

        let response = self
            .request(self.http.post(format!("{}/files", self.base_url)))
            .multipart(form)
            .send()
            .await
            .map_err(|error| anyhow!("openai batch upload failed: {error}"))?;
        let response = check_batch_endpoint("file upload", response).await?;

        let parsed: FileResponse = response
            .json()
            .await
            .map_err(|error| anyhow!("openai batch upload response unreadable: {error}"))?;
        Ok(parsed.id)
    }

    async fn create_batch(&self, input_file_id: &str) -> Result<BatchResponse> {
        let response = self
            .request(self.http.post(format!("{}/batches", self.base_url)))
            .json(&json!({
                "input_file_id": input_file_id,
                "endpoint": "/v1/embeddings",
                "completion_window": "24h",
            }))
            .send()
            .await
            .map_err(|error| anyhow!("openai batch create failed: {error}"))?;
        let response = check_batch_endpoint("batch create", response).await?;

        response
            .json()
            .await
            .map_err(|error| anyhow!("openai batch create response unreadable: {error}"))
    }

    async fn batch_status(&self, batch_id: &str) -> Result<BatchResponse> {
        let response = self
            .request(
                self.http
                    .get(format!("{}/batches/{batch_id}", self.base_url)),
            )
            .send()
            .await
            .map_err(|error| anyhow!("openai batch status failed: {error}"))?;
        let response = check_status("batch status", response).await?;

        response
            .json()
            .await
            .map_err(|error| anyhow!("openai batch status response unreadable: {error}"))
    }

    async fn download_file(&self, file_id: &str) -> Result<String> {
        let response = self
            .request(
                self.http
                    .get(format!("{}/files/{file_id}/content", self.base_url)),
            )
            .send()
            .await
            .map_err(|error| anyhow!("openai batch download failed: {error}"))?;
        let response = check_status("batch download", response).await?;

        response
            .text()
            .await
            .map_err(|error| anyhow!("openai batch result unreadable: {error}"))
    }

    pub(crate) async fn run_batch_job(
        &self,
        items: &[BatchItem],
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let lines: Vec<String> = items
            .iter()
            .map(|item| {
                json!({
                    "custom_id": item.custom_id,
                    "method": "POST",
                    "url": "/v1/embeddings",
                    "body": { "model": self.model, "input": item.text },
                })
                .to_string()
            })
            .collect();

        let file_id = self.upload_requests(lines.join("\n")).await?;
        let batch = self.create_batch(&file_id).await?;
        debug!("openai batch job {} submitted ({} items)", batch.id, items.len());

        let deadline = Instant::now() + timeout;
        let mut status = batch;
        loop {
            match status.status.as_str() {
                "completed" => break,
                "failed" | "expired" | "cancelled" | "cancelling" => {
                    let detail = status.error_file_id.as_deref().unwrap_or("no error file");
                    bail!(
                        "openai batch job {} ended as {} ({detail})",
                        status.id,
                        status.status
                    );
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                bail!("openai batch job {} timed out", status.id);
            }
            tokio::time::sleep(poll_interval).await;
            status = self.batch_status(&status.id).await?;
        }

        let output_file_id = status
            .output_file_id
            .ok_or_else(|| anyhow!("openai batch job {} completed without output", status.id))?;
        let content = self.download_file(&output_file_id).await?;
        parse_batch_output(&content)
    }
}

/// Result lines carry `{custom_id, response}`; the embedding sits either
/// directly on the response or under the proxied `body.data[0]`.
fn parse_batch_output(content: &str) -> Result<HashMap<String, Vec<f32>>> {
    let mut vectors = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        let Some(custom_id) = value.get("custom_id").and_then(|id| id.as_str()) else {
            continue;
        };
        let Some(response) = value.get("response") else {
            continue;
        };

        let embedding = response
            .get("embedding")
            .or_else(|| {
                response
                    .pointer("/body/data/0/embedding")
                    .or_else(|| response.pointer("/data/0/embedding"))
            })
            .and_then(|raw| serde_json::from_value::<Vec<f32>>(raw.clone()).ok());

        if let Some(vector) = embedding {
            vectors.insert(custom_id.to_string(), vector);
        }
    }

    Ok(vectors)
}

async fn check_status(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!(
        "openai {operation} request failed with status {}: {}",
        status.as_u16(),
        snippet(&body)
    )
}

/// Like `check_status`, but a missing endpoint becomes the explicit
/// batch-unavailable signal so the orchestrator disables batch mode
/// immediately instead of burning retries.
async fn check_batch_endpoint(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::METHOD_NOT_ALLOWED {
        return Err(MemoryError::BatchUnavailable(format!(
            "openai {operation} endpoint answered {}",
            status.as_u16()
        ))
        .into());
    }
    check_status(operation, response).await
}

fn snippet(body: &str) -> String {
    body.chars().take(300).collect()
}

#[cfg(test)]
mod tests {
    use super::parse_batch_output;

    #[test]
    fn parses_both_result_line_shapes() {
        let content = concat!(
            "{\"custom_id\":\"a\",\"response\":{\"embedding\":[1.0,2.0]}}\n",
            "{\"custom_id\":\"b\",\"response\":{\"body\":{\"data\":[{\"embedding\":[3.0]}]}}}\n",
            "garbage line\n",
            "{\"custom_id\":\"c\"}\n",
        );

        let vectors = parse_batch_output(content).expect("parse");
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors["a"], vec![1.0, 2.0]);
        assert_eq!(vectors["b"], vec![3.0]);
    }
}
