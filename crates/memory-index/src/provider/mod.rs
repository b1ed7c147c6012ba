use std::{collections::BTreeMap, collections::HashMap, fmt, time::Duration};

use anyhow::Result;
use serde::Serialize;

use crate::{
    chunking::hash_content,
    config::{ProviderConfig, ProviderSelection},
    error::{is_missing_key, MemoryError},
};

mod gemini;
mod local;
mod openai;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Local,
    Openai,
    Gemini,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Openai => "openai",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Backend {
    Local(local::LocalEmbedder),
    OpenAi(openai::OpenAiEmbeddings),
    Gemini(gemini::GeminiEmbeddings),
}

/// One embedding backend behind a uniform surface. A tagged variant rather
/// than a trait object so the batch orchestrator can ask which extra
/// capabilities (provider-side batch jobs) the backend actually has.
pub(crate) struct Provider {
    pub id: ProviderId,
    pub model: String,
    key: String,
    backend: Backend,
}

impl Provider {
    pub(crate) fn provider_key(&self) -> &str {
        &self.key
    }

    pub(crate) fn is_local(&self) -> bool {
        self.id == ProviderId::Local
    }

    pub(crate) async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| MemoryError::ProviderSetup("empty embedding response".into()).into())
    }

    pub(crate) async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match &self.backend {
            Backend::Local(embedder) => embedder.embed(texts).await,
            Backend::OpenAi(client) => client.embed(texts).await,
            Backend::Gemini(client) => client.embed(texts).await,
        }
    }

    /// The provider-side batch-job client, when this backend has one.
    pub(crate) fn batch_jobs(&self) -> Option<BatchJobs<'_>> {
        match &self.backend {
            Backend::Local(_) => None,
            Backend::OpenAi(client) => Some(BatchJobs::OpenAi(client)),
            Backend::Gemini(client) => Some(BatchJobs::Gemini(client)),
        }
    }
}

/// One item of a provider-side batch job, correlated by `custom_id`.
#[derive(Debug, Clone)]
pub(crate) struct BatchItem {
    pub custom_id: String,
    pub text: String,
}

pub(crate) enum BatchJobs<'a> {
    OpenAi(&'a openai::OpenAiEmbeddings),
    Gemini(&'a gemini::GeminiEmbeddings),
}

impl BatchJobs<'_> {
    /// Submit one batch job, poll it to completion, and hand back vectors
    /// keyed by custom id.
    pub(crate) async fn run_job(
        &self,
        items: &[BatchItem],
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<HashMap<String, Vec<f32>>> {
        match self {
            Self::OpenAi(client) => client.run_batch_job(items, poll_interval, timeout).await,
            Self::Gemini(client) => client.run_batch_job(items, poll_interval, timeout).await,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackInfo {
    pub from: String,
    pub reason: String,
}

pub(crate) struct SelectedProvider {
    pub provider: Provider,
    pub fallback: Option<FallbackInfo>,
}

/// Construct the configured provider, honoring `auto` selection and the
/// single construction-time fallback hop.
pub(crate) fn create_provider(config: &ProviderConfig) -> Result<SelectedProvider> {
    let Some(primary) = selection_to_id(config.selection) else {
        return auto_select(config);
    };

    match build_provider(primary, config) {
        Ok(provider) => Ok(SelectedProvider {
            provider,
            fallback: None,
        }),
        Err(primary_error) => {
            let fallback = config.fallback.and_then(selection_to_id);
            match fallback {
                Some(kind) if kind != primary => {
                    let provider = build_provider(kind, config)?;
                    Ok(SelectedProvider {
                        provider,
                        fallback: Some(FallbackInfo {
                            from: primary.as_str().to_string(),
                            reason: format!("{primary_error:#}"),
                        }),
                    })
                }
                _ => Err(primary_error),
            }
        }
    }
}

/// Prefer a local model only when one is actually on disk; otherwise walk
/// the remote providers, skipping the ones without credentials.
fn auto_select(config: &ProviderConfig) -> Result<SelectedProvider> {
    if let Some(path) = &config.local.model_path {
        if path.is_file() {
            let provider = build_provider(ProviderId::Local, config)?;
            return Ok(SelectedProvider {
                provider,
                fallback: None,
            });
        }
    }

    let mut skipped = Vec::new();
    for kind in [ProviderId::Openai, ProviderId::Gemini] {
        match build_provider(kind, config) {
            Ok(provider) => {
                return Ok(SelectedProvider {
                    provider,
                    fallback: None,
                })
            }
            Err(error) if is_missing_key(&error) => {
                skipped.push(format!("{kind}: {error:#}"));
            }
            Err(error) => return Err(error),
        }
    }

    Err(MemoryError::NoProvider(skipped.join("; ")).into())
}

pub(crate) fn build_provider(kind: ProviderId, config: &ProviderConfig) -> Result<Provider> {
    match kind {
        ProviderId::Local => {
            let embedder = local::LocalEmbedder::new(&config.local, config.model.clone())?;
            let model = embedder.model_name().to_string();
            let key = derive_provider_key(
                kind.as_str(),
                &embedder.key_material(),
                &model,
                &BTreeMap::new(),
            );
            Ok(Provider {
                id: kind,
                model,
                key,
                backend: Backend::Local(embedder),
            })
        }
        ProviderId::Openai => {
            let client = openai::OpenAiEmbeddings::new(&config.openai, config.model.clone())?;
            let model = client.model().to_string();
            let key = derive_provider_key(
                kind.as_str(),
                client.base_url(),
                &model,
                &config.openai.headers,
            );
            Ok(Provider {
                id: kind,
                model,
                key,
                backend: Backend::OpenAi(client),
            })
        }
        ProviderId::Gemini => {
            let client = gemini::GeminiEmbeddings::new(&config.gemini, config.model.clone())?;
            let model = client.model().to_string();
            let key = derive_provider_key(
                kind.as_str(),
                client.base_url(),
                &model,
                &config.gemini.headers,
            );
            Ok(Provider {
                id: kind,
                model,
                key,
                backend: Backend::Gemini(client),
            })
        }
    }
}

pub(crate) fn selection_to_id(selection: ProviderSelection) -> Option<ProviderId> {
    match selection {
        ProviderSelection::Auto => None,
        ProviderSelection::Local => Some(ProviderId::Local),
        ProviderSelection::Openai => Some(ProviderId::Openai),
        ProviderSelection::Gemini => Some(ProviderId::Gemini),
    }
}

/// Scope cache entries to one deployment of a provider: same id + model
/// behind a different base URL or header set must not share vectors.
/// Credential-bearing headers stay out of the digest.
fn derive_provider_key(
    id: &str,
    base_url: &str,
    model: &str,
    headers: &BTreeMap<String, String>,
) -> String {
    let mut material = format!("{id}|{base_url}|{model}");
    for (name, value) in headers {
        if is_secret_header(name) {
            continue;
        }
        material.push('|');
        material.push_str(name);
        material.push('=');
        material.push_str(value);
    }
    hash_content(&material)[..32].to_string()
}

fn is_secret_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("authorization") || lower.contains("api-key") || lower.contains("token")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{derive_provider_key, selection_to_id, ProviderId};
    use crate::config::ProviderSelection;

    #[test]
    fn provider_key_ignores_credential_headers() {
        let mut with_auth = BTreeMap::new();
        with_auth.insert("Authorization".to_string(), "Bearer secret".to_string());
        with_auth.insert("X-Api-Key".to_string(), "secret".to_string());

        let bare = derive_provider_key("openai", "https://api.example", "m", &BTreeMap::new());
        let authed = derive_provider_key("openai", "https://api.example", "m", &with_auth);
        assert_eq!(bare, authed);
    }

    #[test]
    fn provider_key_separates_deployments() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Tenant".to_string(), "a".to_string());
        let a = derive_provider_key("openai", "https://api.example", "m", &headers);
        headers.insert("X-Tenant".to_string(), "b".to_string());
        let b = derive_provider_key("openai", "https://api.example", "m", &headers);
        let c = derive_provider_key("openai", "https://other.example", "m", &BTreeMap::new());

        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn auto_has_no_direct_id() {
        assert_eq!(selection_to_id(ProviderSelection::Auto), None);
        assert_eq!(
            selection_to_id(ProviderSelection::Local),
            Some(ProviderId::Local)
        );
    }
}
