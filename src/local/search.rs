//! Search resolver: similarity search mapped back onto the tree.

use tracing::{debug, warn};

use super::embed::Embedder;
use super::models::VectorHit;
use super::store::TreeGraph;
use super::vector::VectorStore;
use crate::types::{FlatKey, Modality, SearchResponse, SearchResult, TreeError, TreeResult};

pub struct SearchResolver<'a, E> {
    pub embedder: &'a E,
    pub vectors: &'a VectorStore,
}

impl<E: Embedder> SearchResolver<'_, E> {
    /// Embed `query` in the space of `modality` and return the closest
    /// records, resolved against `graph`.
    pub async fn search(
        &self,
        graph: &TreeGraph,
        query: &str,
        modality: Modality,
        limit: usize,
    ) -> TreeResult<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(TreeError::InvalidQuery("query is empty".into()));
        }
        if limit == 0 {
            return Err(TreeError::InvalidQuery("limit must be at least 1".into()));
        }

        let vector = self
            .embedder
            .embed_texts(modality, &[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector for query"))?;

        // Hits dropped during resolution and ties straddling the cut would
        // make the top `limit` depend on store order, so widen the window
        // until the cut is clean or the table is exhausted.
        let mut window = limit.saturating_mul(2);
        let mut results = loop {
            let hits = self.vectors.search(modality, &vector, window).await?;
            debug!(modality = %modality, window, hits = hits.len(), "vector search");
            let exhausted = hits.len() < window;
            let boundary = hits.last().map(VectorHit::score);
            let results = resolve_hits(graph, modality, hits);
            if exhausted || clean_cut(&results, limit, boundary) {
                break results;
            }
            window = window.saturating_mul(2);
        };
        results.truncate(limit);
        Ok(SearchResponse {
            query: query.to_string(),
            modality,
            total_results: results.len(),
            results,
        })
    }
}

/// The first `limit` results are final when there are that many and the last
/// of them scores strictly above the furthest hit fetched.
fn clean_cut(results: &[SearchResult], limit: usize, boundary: Option<f32>) -> bool {
    match (results.get(limit - 1), boundary) {
        (Some(last), Some(boundary)) => last.score > boundary,
        _ => false,
    }
}

fn resolve_hits(graph: &TreeGraph, modality: Modality, hits: Vec<VectorHit>) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = hits
        .into_iter()
        .filter_map(|hit| {
            let path = match FlatKey::parse(&hit.path) {
                Ok(path) => path,
                Err(e) => {
                    warn!(path = %hit.path, error = %e, "dropping hit with unparseable path");
                    return None;
                }
            };
            let node = graph.resolve(&path).cloned();
            if node.as_ref().is_some_and(|n| n.is_synthetic) {
                return None;
            }
            Some(SearchResult {
                score: hit.score(),
                unresolved: node.is_none(),
                path,
                modality,
                node,
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.path.as_str().cmp(b.path.as_str()))
    });
    results
}
