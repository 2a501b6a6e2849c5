//! Embedding capability.
//!
//! The indexer and the search resolver only see the [`Embedder`] trait. The
//! production implementation talks to an OpenAI-compatible `/v1/embeddings`
//! endpoint: text goes to `embedding_model`, images (and image-search query
//! text) go to `image_embedding_model`, which must serve a joint image/text
//! space such as CLIP.

use std::future::Future;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::RgbImage;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use super::LocalConfig;
use crate::extract::encode_png;
use crate::types::Modality;

/// Max inputs per embeddings request.
const BATCH_SIZE: usize = 100;

/// Turns content into vectors.
pub trait Embedder: Send + Sync + 'static {
    /// Embed texts into the vector space of `modality`.
    fn embed_texts(
        &self,
        modality: Modality,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>>> + Send;

    /// Embed a decoded image into the image space.
    fn embed_image(&self, image: &RgbImage) -> impl Future<Output = Result<Vec<f32>>> + Send;
}

/// Embedder backed by an OpenAI-compatible HTTP API.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    text_model: String,
    image_model: String,
}

impl HttpEmbedder {
    /// Build from config. A missing key only fails once a request is made, so
    /// operations that never embed work without one.
    pub fn from_config(config: &LocalConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            api_key: config.openai_api_key_secret(),
            text_model: config.embedding_model.clone(),
            image_model: config.image_embedding_model.clone(),
        }
    }

    fn model(&self, modality: Modality) -> &str {
        match modality {
            Modality::Text => &self.text_model,
            Modality::Image => &self.image_model,
        }
    }

    async fn request(&self, model: &str, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = self
            .api_key
            .as_ref()
            .context("OpenAI API key not configured. Run: tidx config set-key")?;

        let total_chars: usize = input.iter().map(|t| t.len()).sum();
        debug!(model, inputs = input.len(), total_chars, "sending embedding batch");

        let resp = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key.expose_secret()))
            .json(&serde_json::json!({
                "model": model,
                "input": input,
            }))
            .send()
            .await
            .context("Failed to call embeddings API")?;

        let status = resp.status();
        let body = resp.text().await.context("Failed to read response body")?;

        if !status.is_success() {
            bail!(
                "Embeddings API error ({} inputs, {} chars): {} - {}",
                input.len(),
                total_chars,
                status,
                body
            );
        }

        let mut response: EmbeddingResponse = serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse embeddings response: {body}"))?;
        if response.data.len() != input.len() {
            bail!(
                "Embeddings API returned {} vectors for {} inputs",
                response.data.len(),
                input.len()
            );
        }
        response.data.sort_by_key(|d| d.index);

        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}

impl Embedder for HttpEmbedder {
    async fn embed_texts(&self, modality: Modality, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.model(modality);
        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(BATCH_SIZE) {
            all_embeddings.extend(self.request(model, batch).await?);
        }
        Ok(all_embeddings)
    }

    async fn embed_image(&self, image: &RgbImage) -> Result<Vec<f32>> {
        let png = encode_png(image)?;
        let data_url = format!("data:image/png;base64,{}", STANDARD.encode(png));
        self.request(&self.image_model, &[data_url])
            .await?
            .into_iter()
            .next()
            .context("Embeddings API returned no vector for image")
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// Scale to unit length; zero vectors are returned unchanged.
pub fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

/// Element-wise mean of equally sized vectors, normalized.
pub fn mean_pool(vectors: &[Vec<f32>]) -> Result<Vec<f32>> {
    let Some(first) = vectors.first() else {
        bail!("No vectors to pool");
    };
    let dim = first.len();
    let mut sum = vec![0.0f32; dim];
    for vector in vectors {
        if vector.len() != dim {
            bail!("Cannot pool vectors of width {} and {dim}", vector.len());
        }
        sum.iter_mut().zip(vector).for_each(|(s, v)| *s += v);
    }
    let count = vectors.len() as f32;
    Ok(l2_normalize(sum.into_iter().map(|s| s / count).collect()))
}

#[cfg(test)]
pub mod testing {
    //! Deterministic in-process embedder for tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use sha2::{Digest, Sha256};

    use super::*;

    pub const DIM: usize = 8;

    /// Hashes words into buckets so texts sharing words land close together.
    /// Image vectors are derived from pixel bytes and live in a wider space,
    /// which keeps text and image tables visibly apart.
    #[derive(Default)]
    pub struct HashEmbedder {
        pub calls: AtomicUsize,
        pub fail_on: Option<String>,
    }

    impl HashEmbedder {
        pub fn failing_on(word: &str) -> Self {
            Self {
                fail_on: Some(word.to_string()),
                ..Self::default()
            }
        }

        pub fn text_vector(text: &str) -> Vec<f32> {
            let mut vector = vec![0.0f32; DIM];
            for word in text.split_whitespace() {
                let digest = Sha256::digest(word.to_lowercase().as_bytes());
                vector[digest[0] as usize % DIM] += 1.0;
            }
            if vector.iter().all(|v| *v == 0.0) {
                vector[0] = 1.0;
            }
            l2_normalize(vector)
        }

        pub fn image_vector(bytes: &[u8]) -> Vec<f32> {
            let digest = Sha256::digest(bytes);
            l2_normalize(digest[..DIM * 2].iter().map(|b| *b as f32 + 1.0).collect())
        }
    }

    impl Embedder for HashEmbedder {
        async fn embed_texts(&self, modality: Modality, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(word) = &self.fail_on {
                if texts.iter().any(|t| t.contains(word.as_str())) {
                    bail!("embedding service rejected input");
                }
            }
            Ok(texts
                .iter()
                .map(|t| match modality {
                    Modality::Text => Self::text_vector(t),
                    Modality::Image => Self::image_vector(t.as_bytes()),
                })
                .collect())
        }

        async fn embed_image(&self, image: &RgbImage) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Self::image_vector(image.as_raw()))
        }
    }
}
