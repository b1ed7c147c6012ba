use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use fastembed::{
    InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};
use tokio::sync::OnceCell;
use tracing::info;

use crate::{config::LocalProviderConfig, error::MemoryError};

const TOKENIZER_FILES: [&str; 4] = [
    "tokenizer.json",
    "config.json",
    "special_tokens_map.json",
    "tokenizer_config.json",
];

/// On-device embeddings. The model stays unloaded until the first call so
/// constructing a manager is cheap even with a local provider configured.
pub(crate) struct LocalEmbedder {
    model_path: PathBuf,
    model_name: String,
    model: OnceCell<Arc<Mutex<TextEmbedding>>>,
}

impl LocalEmbedder {
    pub(crate) fn new(config: &LocalProviderConfig, model: Option<String>) -> Result<Self> {
        let Some(model_path) = config.model_path.clone() else {
            return Err(MemoryError::ProviderSetup(
                "no local model configured; set provider.local.modelPath".to_string(),
            )
            .into());
        };

        if !model_path.is_file() {
            return Err(MemoryError::ProviderSetup(setup_help(
                &model_path,
                "the model file does not exist",
            ))
            .into());
        }

        let model_name = model.unwrap_or_else(|| {
            model_path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "local".to_string())
        });

        Ok(Self {
            model_path,
            model_name,
            model: OnceCell::new(),
        })
    }

    pub(crate) fn model_name(&self) -> &str {
        &self.model_name
    }

    pub(crate) fn key_material(&self) -> String {
        self.model_path.display().to_string()
    }

    async fn loaded_model(&self) -> Result<Arc<Mutex<TextEmbedding>>> {
        let model = self
            .model
            .get_or_try_init(|| async {
                let path = self.model_path.clone();
                let name = self.model_name.clone();
                tokio::task::spawn_blocking(move || {
                    info!("loading local embedding model {name} from {}", path.display());
                    load_model(&path)
                })
                .await
                .context("local embedding load task failed")?
            })
            .await?;
        Ok(model.clone())
    }

    pub(crate) async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.loaded_model().await?;
        let owned: Vec<String> = texts.to_vec();

        let vectors = tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| anyhow!("local embedding model mutex poisoned"))?;
            guard
                .embed(owned, None)
                .map_err(|error| anyhow!("local embedding inference failed: {error}"))
        })
        .await
        .context("local embedding task failed")??;

        Ok(vectors.into_iter().map(sanitize_and_normalize).collect())
    }
}

fn load_model(model_path: &Path) -> Result<Arc<Mutex<TextEmbedding>>> {
    let dir = model_path.parent().unwrap_or_else(|| Path::new("."));

    let onnx = fs::read(model_path).map_err(|error| {
        MemoryError::ProviderSetup(setup_help(
            model_path,
            &format!("the model file could not be read: {error}"),
        ))
    })?;

    let read_sibling = |name: &str| -> Result<Vec<u8>> {
        fs::read(dir.join(name)).map_err(|error| {
            MemoryError::ProviderSetup(setup_help(
                model_path,
                &format!("missing tokenizer file {name}: {error}"),
            ))
            .into()
        })
    };

    let tokenizer_files = TokenizerFiles {
        tokenizer_file: read_sibling(TOKENIZER_FILES[0])?,
        config_file: read_sibling(TOKENIZER_FILES[1])?,
        special_tokens_map_file: read_sibling(TOKENIZER_FILES[2])?,
        tokenizer_config_file: read_sibling(TOKENIZER_FILES[3])?,
    };

    let model =
        UserDefinedEmbeddingModel::new(onnx, tokenizer_files).with_pooling(Pooling::Mean);

    let embedding = TextEmbedding::try_new_from_user_defined(model, InitOptionsUserDefined::default())
        .map_err(|error| {
            MemoryError::ProviderSetup(setup_help(
                model_path,
                &format!("the inference runtime rejected the model: {error}"),
            ))
        })?;

    Ok(Arc::new(Mutex::new(embedding)))
}

fn setup_help(model_path: &Path, cause: &str) -> String {
    format!(
        "could not load the local embedding model at {}: {cause}\n\
         - place the model file and its tokenizer files ({}) side by side\n\
         - or point provider.local.modelPath at a usable model\n\
         - or switch provider.selection to \"openai\" or \"gemini\"",
        model_path.display(),
        TOKENIZER_FILES.join(", "),
    )
}

/// Non-finite components become zero, then the vector is scaled to unit
/// length. An all-zero vector stays all-zero so callers can detect it.
pub(crate) fn sanitize_and_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    for value in &mut vector {
        if !value.is_finite() {
            *value = 0.0;
        }
    }

    let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}
