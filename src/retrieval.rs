use rand::Rng;
use serde::Serialize;

use crate::encoder::EmbeddingEncoder;
use crate::index::{LoadedCollection, SearchHit};

pub const MISSING_SOURCE: &str = "[français manquant]";
pub const MISSING_TARGET: &str = "[breton manquant]";
pub const MISSING_ENTITY: &str = "[entité manquante]";

/// A French / Breton pair pulled from the index.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Example {
    pub source_text: String,
    pub target_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    None,
    Similarity,
    Random,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrievalRequest {
    pub query_text: String,
    pub mode: RetrievalMode,
    pub k: usize,
}

impl RetrievalRequest {
    /// Resolve the two example counts into one active request. Similarity wins
    /// when both are positive; a zero count means no retrieval.
    pub fn from_counts(query_text: &str, similarity_k: usize, random_k: usize) -> Self {
        let (mode, k) = if similarity_k > 0 {
            (RetrievalMode::Similarity, similarity_k)
        } else if random_k > 0 {
            (RetrievalMode::Random, random_k)
        } else {
            (RetrievalMode::None, 0)
        };
        Self {
            query_text: query_text.to_string(),
            mode,
            k,
        }
    }
}

/// `succeeded == false` means the index or encoder was unavailable, which is
/// not the same as a successful search with zero hits.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RetrievalOutcome {
    pub examples: Vec<Example>,
    pub succeeded: bool,
}

impl RetrievalOutcome {
    pub fn found(examples: Vec<Example>) -> Self {
        Self {
            examples,
            succeeded: true,
        }
    }

    pub fn empty() -> Self {
        Self::found(Vec::new())
    }

    pub fn unavailable() -> Self {
        Self {
            examples: Vec::new(),
            succeeded: false,
        }
    }
}

pub struct ExampleRetriever<'a> {
    encoder: Option<&'a dyn EmbeddingEncoder>,
    collection: Option<&'a LoadedCollection>,
    output_fields: [String; 2],
}

impl<'a> ExampleRetriever<'a> {
    pub fn new(
        encoder: Option<&'a dyn EmbeddingEncoder>,
        collection: Option<&'a LoadedCollection>,
        source_field: &str,
        target_field: &str,
    ) -> Self {
        Self {
            encoder,
            collection,
            output_fields: [source_field.to_string(), target_field.to_string()],
        }
    }

    pub fn is_available(&self) -> bool {
        self.encoder.is_some() && self.collection.is_some()
    }

    pub fn retrieve(&self, request: &RetrievalRequest) -> RetrievalOutcome {
        match request.mode {
            RetrievalMode::None => RetrievalOutcome::empty(),
            RetrievalMode::Similarity => self.similarity_search(&request.query_text, request.k),
            RetrievalMode::Random => self.random_sample(request.k),
        }
    }

    /// The `k` stored pairs nearest to `text`, best first.
    pub fn similarity_search(&self, text: &str, k: usize) -> RetrievalOutcome {
        if k == 0 {
            return RetrievalOutcome::empty();
        }
        let (Some(encoder), Some(collection)) = (self.encoder, self.collection) else {
            tracing::warn!("similarity search skipped: encoder or index unavailable");
            return RetrievalOutcome::unavailable();
        };

        tracing::info!(k, "searching similar examples");
        let query = match encoder.encode(text) {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode query");
                return RetrievalOutcome::unavailable();
            }
        };
        let hits = match collection.try_search(query, k, &self.output_fields) {
            Ok(hits) => hits,
            Err(err) => {
                tracing::error!(error = %err, "similarity search failed");
                return RetrievalOutcome::unavailable();
            }
        };
        if hits.is_empty() {
            tracing::info!("no similar examples found");
        } else {
            tracing::info!(found = hits.len(), "similar examples found");
        }
        RetrievalOutcome::found(
            hits.iter()
                .map(|hit| self.example_from_hit(hit, Some(hit.distance)))
                .collect(),
        )
    }

    pub fn random_sample(&self, k: usize) -> RetrievalOutcome {
        self.random_sample_with(k, &mut rand::thread_rng())
    }

    /// Query the index with a random unit vector. Results cluster around
    /// whatever region is closest to the query vector, so this only approximates a
    /// uniform draw over stored rows.
    pub fn random_sample_with<R: Rng>(&self, k: usize, rng: &mut R) -> RetrievalOutcome {
        if k == 0 {
            return RetrievalOutcome::empty();
        }
        let (Some(encoder), Some(collection)) = (self.encoder, self.collection) else {
            tracing::warn!("random examples skipped: encoder or index unavailable");
            return RetrievalOutcome::unavailable();
        };
        let dimension = encoder.embedding_dimension();
        if dimension == 0 {
            tracing::warn!("random examples skipped: encoder dimension unknown");
            return RetrievalOutcome::unavailable();
        }

        tracing::info!(k, "sampling random examples");
        let query = random_unit_vector(dimension, rng);
        let hits = match collection.try_search(query, k, &self.output_fields) {
            Ok(hits) => hits,
            Err(err) => {
                tracing::error!(error = %err, "random example search failed");
                return RetrievalOutcome::unavailable();
            }
        };
        if hits.is_empty() {
            tracing::info!("random search returned no examples");
        }
        RetrievalOutcome::found(hits.iter().map(|hit| self.example_from_hit(hit, None)).collect())
    }

    fn example_from_hit(&self, hit: &SearchHit, score: Option<f32>) -> Example {
        let [source_field, target_field] = &self.output_fields;
        let (source_text, target_text) = match hit.entity {
            Some(_) => (
                hit.field(source_field).unwrap_or(MISSING_SOURCE).to_string(),
                hit.field(target_field).unwrap_or(MISSING_TARGET).to_string(),
            ),
            None => (MISSING_ENTITY.to_string(), MISSING_ENTITY.to_string()),
        };
        Example {
            source_text,
            target_text,
            score,
        }
    }
}

/// Components uniform in [0, 1), rescaled to unit length when the norm is nonzero.
pub fn random_unit_vector<R: Rng>(dimension: usize, rng: &mut R) -> Vec<f32> {
    let mut v: Vec<f32> = (0..dimension).map(|_| rng.gen::<f32>()).collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}
