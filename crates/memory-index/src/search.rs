use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    batch::BatchManager,
    config::{MemoryConfig, MemorySource},
    provider::Provider,
    store::{SearchHit, Store},
};

pub(crate) const SNIPPET_MAX_CHARS: usize = 700;
const MAX_CANDIDATES: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub max_results: Option<usize>,
    pub min_score: Option<f32>,
    /// Warms the index once per unique session key.
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub path: String,
    pub source: String,
    pub start_line: usize,
    pub end_line: usize,
    pub snippet: String,
    pub score: f32,
}

/// Ranked hybrid retrieval over the store. Keyword search and the query
/// embedding run concurrently when hybrid mode is on; either half of the
/// pipeline degrading leaves the other usable.
pub(crate) async fn run_search(
    store: &Mutex<Option<Store>>,
    provider: &Provider,
    batch: &BatchManager,
    config: &MemoryConfig,
    query: &str,
    max_results: usize,
    min_score: f32,
) -> Result<Vec<SearchResult>> {
    let query = query.trim();
    if query.is_empty() || max_results == 0 {
        return Ok(Vec::new());
    }

    let candidates = MAX_CANDIDATES
        .min((max_results * config.query.candidate_multiplier.max(1)).max(1));
    let sources: Vec<&'static str> = [MemorySource::Memory, MemorySource::Sessions]
        .into_iter()
        .filter(|source| config.source_enabled(*source))
        .map(|source| source.as_str())
        .collect();
    let model = provider.model.clone();

    if config.query.hybrid {
        let match_expr = build_fts_match_expr(query);
        let keyword = async {
            match match_expr {
                Some(expr) => {
                    let guard = store.lock().await;
                    guard
                        .as_ref()
                        .context("memory store is closed")?
                        .keyword_search(&expr, &model, &sources, candidates)
                }
                None => Ok(Vec::new()),
            }
        };
        let embed = batch.embed_query(provider, query);

        let (query_vector, keyword_hits) = tokio::join!(embed, keyword);
        let vector_hits =
            vector_candidates(store, query_vector?, &model, &sources, candidates).await?;

        let merged = merge_hybrid(
            vector_hits,
            keyword_hits?,
            config.query.vector_weight,
            config.query.text_weight,
        );
        return Ok(finalize(merged, max_results, min_score));
    }

    // Vector-only mode.
    let query_vector = batch.embed_query(provider, query).await?;
    let vector_hits = vector_candidates(store, query_vector, &model, &sources, candidates).await?;
    let scored = vector_hits
        .into_iter()
        .map(|hit| {
            let score = hit.score;
            (hit, score)
        })
        .collect();
    Ok(finalize(scored, max_results, min_score))
}

async fn vector_candidates(
    store: &Mutex<Option<Store>>,
    query_vector: Vec<f32>,
    model: &str,
    sources: &[&str],
    candidates: usize,
) -> Result<Vec<SearchHit>> {
    // An all-zero embedding carries no signal; skip the vector arm.
    if query_vector.iter().all(|value| *value == 0.0) {
        return Ok(Vec::new());
    }

    let guard = store.lock().await;
    guard
        .as_ref()
        .context("memory store is closed")?
        .vector_search(&query_vector, model, sources, candidates)
}

/// Normalise both score lists by their own maxima, then combine with the
/// configured weights, matching candidates across the lists by chunk id.
pub(crate) fn merge_hybrid(
    vector_hits: Vec<SearchHit>,
    keyword_hits: Vec<SearchHit>,
    vector_weight: f32,
    text_weight: f32,
) -> Vec<(SearchHit, f32)> {
    let vector_max = positive_max(vector_hits.iter().map(|hit| hit.score));
    let text_max = positive_max(keyword_hits.iter().map(|hit| hit.score));

    struct Merged {
        hit: SearchHit,
        vector: f32,
        text: f32,
    }

    let mut by_id: HashMap<String, Merged> = HashMap::new();
    for hit in vector_hits {
        let normalized = normalize(hit.score, vector_max);
        by_id.insert(
            hit.id.clone(),
            Merged {
                hit,
                vector: normalized,
                text: 0.0,
            },
        );
    }
    for hit in keyword_hits {
        let normalized = normalize(hit.score, text_max);
        by_id
            .entry(hit.id.clone())
            .and_modify(|merged| merged.text = normalized)
            .or_insert(Merged {
                hit,
                vector: 0.0,
                text: normalized,
            });
    }

    let mut scored: Vec<(SearchHit, f32)> = by_id
        .into_values()
        .map(|merged| {
            let score = vector_weight * merged.vector + text_weight * merged.text;
            (merged.hit, score)
        })
        .collect();
    scored.sort_by(|left, right| {
        right
            .1
            .partial_cmp(&left.1)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored
}

fn finalize(
    scored: Vec<(SearchHit, f32)>,
    max_results: usize,
    min_score: f32,
) -> Vec<SearchResult> {
    scored
        .into_iter()
        .filter(|(_, score)| score.is_finite() && *score >= min_score)
        .take(max_results)
        .map(|(hit, score)| SearchResult {
            path: hit.path,
            source: hit.source,
            start_line: hit.start_line,
            end_line: hit.end_line,
            snippet: hit.text.chars().take(SNIPPET_MAX_CHARS).collect(),
            score,
        })
        .collect()
}

fn positive_max(scores: impl Iterator<Item = f32>) -> Option<f32> {
    let max = scores.filter(|score| score.is_finite()).fold(0.0f32, f32::max);
    (max > 0.0).then_some(max)
}

fn normalize(score: f32, max: Option<f32>) -> f32 {
    match max {
        Some(max) if score.is_finite() => (score / max).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

/// Neutralise FTS operators by quoting each alphanumeric term; anything
/// else in the raw query never reaches the parser.
pub(crate) fn build_fts_match_expr(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|character: char| !character.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{term}\""))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}
