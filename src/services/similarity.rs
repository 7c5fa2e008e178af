//! Similarity index over finalized face embeddings: a fixed linear
//! projection into a lower-dimensional space, k-nearest-neighbor queries,
//! and periodic reclustering through a black-box collaborator.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum SimilarityError {
    #[error("failed to read projection weights at '{path}': {source}")]
    WeightsUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid projection weights: {0}")]
    WeightsInvalid(String),

    #[error("embedding has dimension {got}, projection expects {expected}")]
    Dimension { expected: usize, got: usize },
}

/// Pretrained linear projection, loaded once at process start and read-only
/// afterwards. Weights are a row-major matrix: one row per output dimension.
#[derive(Debug, Clone)]
pub struct Projection {
    matrix: Vec<Vec<f32>>,
    input_dim: usize,
}

#[derive(Deserialize)]
struct ProjectionWeights {
    matrix: Vec<Vec<f32>>,
}

impl Projection {
    /// Load weights from a JSON file. A missing or malformed file is a fatal
    /// configuration error raised before any pipeline work starts.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SimilarityError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let raw = std::fs::read(path.as_ref()).map_err(|e| SimilarityError::WeightsUnreadable {
            path: path_str.clone(),
            source: e,
        })?;
        let weights: ProjectionWeights = serde_json::from_slice(&raw)
            .map_err(|e| SimilarityError::WeightsInvalid(format!("{path_str}: {e}")))?;
        Self::from_matrix(weights.matrix)
    }

    pub fn from_matrix(matrix: Vec<Vec<f32>>) -> Result<Self, SimilarityError> {
        let input_dim = matrix
            .first()
            .map(|row| row.len())
            .ok_or_else(|| SimilarityError::WeightsInvalid("empty matrix".into()))?;
        if input_dim == 0 || matrix.iter().any(|row| row.len() != input_dim) {
            return Err(SimilarityError::WeightsInvalid(
                "matrix rows must be non-empty and uniform".into(),
            ));
        }
        Ok(Self { matrix, input_dim })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.matrix.len()
    }

    /// Project an embedding into the lower-dimensional index space.
    pub fn project(&self, embedding: &[f32]) -> Result<Vec<f32>, SimilarityError> {
        if embedding.len() != self.input_dim {
            return Err(SimilarityError::Dimension {
                expected: self.input_dim,
                got: embedding.len(),
            });
        }
        Ok(self
            .matrix
            .iter()
            .map(|row| row.iter().zip(embedding).map(|(w, x)| w * x).sum())
            .collect())
    }
}

/// Black-box clustering collaborator: vectors in, labels out.
pub trait Clusterer: Send + Sync {
    fn cluster(&self, embeddings: &[Vec<f32>]) -> Vec<i32>;
}

/// Fallback collaborator that puts every embedding in one cluster. Stands
/// in until a trained model is wired up.
pub struct UnitClusterer;

impl Clusterer for UnitClusterer {
    fn cluster(&self, embeddings: &[Vec<f32>]) -> Vec<i32> {
        vec![0; embeddings.len()]
    }
}

fn valid_embedding(embedding: &[f32], dim: usize) -> bool {
    embedding.len() == dim && embedding.iter().all(|x| x.is_finite())
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// k-nearest-neighbor search over `(asset_id, embeddings)` candidates.
///
/// Distances are Euclidean, ascending; ties keep candidate iteration order
/// (stable sort, not content-defined). Malformed embeddings are skipped with
/// a warning, never failing the query.
pub fn k_nearest(
    candidates: &[(String, Vec<Vec<f32>>)],
    query: &[f32],
    k: usize,
) -> Vec<(String, f32)> {
    let mut scored: Vec<(String, f32)> = Vec::new();
    for (asset_id, embeddings) in candidates {
        for embedding in embeddings {
            if !valid_embedding(embedding, query.len()) {
                warn!(asset_id = %asset_id, "Skipping malformed embedding in k-NN candidates");
                continue;
            }
            scored.push((asset_id.clone(), euclidean(embedding, query)));
        }
    }
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
    scored.truncate(k);
    scored
}

struct IndexEntries {
    /// Insertion-ordered so tie order stays stable across queries.
    entries: Vec<(String, Vec<Vec<f32>>)>,
    positions: HashMap<String, usize>,
    labels: Vec<i32>,
}

/// In-memory index of projected embeddings, fed from result notifications.
pub struct SimilarityIndex {
    projection: Projection,
    clusterer: Box<dyn Clusterer>,
    inner: RwLock<IndexEntries>,
}

impl SimilarityIndex {
    pub fn new(projection: Projection, clusterer: Box<dyn Clusterer>) -> Self {
        Self {
            projection,
            clusterer,
            inner: RwLock::new(IndexEntries {
                entries: Vec::new(),
                positions: HashMap::new(),
                labels: Vec::new(),
            }),
        }
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    /// Replace the asset's embeddings. Re-ingesting the same asset (a retry
    /// republishing its result) leaves the index unchanged.
    pub fn ingest(&self, asset_id: &str, embeddings: Vec<Vec<f32>>) {
        let mut guard = self.inner.write().expect("similarity index lock poisoned");
        let inner = &mut *guard;
        if let Some(&pos) = inner.positions.get(asset_id) {
            inner.entries[pos].1 = embeddings;
        } else {
            let pos = inner.entries.len();
            inner.entries.push((asset_id.to_string(), embeddings));
            inner.positions.insert(asset_id.to_string(), pos);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("similarity index lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn k_nearest(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let inner = self.inner.read().expect("similarity index lock poisoned");
        k_nearest(&inner.entries, query, k)
    }

    /// Re-run the clustering collaborator over every indexed embedding.
    pub fn recluster(&self) -> Vec<i32> {
        let mut inner = self.inner.write().expect("similarity index lock poisoned");
        let flattened: Vec<Vec<f32>> = inner
            .entries
            .iter()
            .flat_map(|(_, embeddings)| embeddings.iter().cloned())
            .collect();
        let labels = self.clusterer.cluster(&flattened);
        inner.labels = labels.clone();
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SingleLabel;

    impl Clusterer for SingleLabel {
        fn cluster(&self, embeddings: &[Vec<f32>]) -> Vec<i32> {
            vec![0; embeddings.len()]
        }
    }

    fn candidates() -> Vec<(String, Vec<Vec<f32>>)> {
        vec![
            ("A".to_string(), vec![vec![0.0, 0.0, 0.0]]),
            ("B".to_string(), vec![vec![1.0, 0.0, 0.0]]),
            ("C".to_string(), vec![vec![5.0, 5.0, 5.0]]),
        ]
    }

    #[test]
    fn test_k_nearest_sorted_ascending() {
        let result = k_nearest(&candidates(), &[0.0, 0.0, 0.0], 2);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0, "A");
        assert_eq!(result[0].1, 0.0);
        assert_eq!(result[1].0, "B");
        assert_eq!(result[1].1, 1.0);
    }

    #[test]
    fn test_k_nearest_ties_keep_candidate_order() {
        let cands = vec![
            ("first".to_string(), vec![vec![1.0, 0.0]]),
            ("second".to_string(), vec![vec![0.0, 1.0]]),
        ];
        let result = k_nearest(&cands, &[0.0, 0.0], 2);
        assert_eq!(result[0].0, "first");
        assert_eq!(result[1].0, "second");
    }

    #[test]
    fn test_k_nearest_skips_malformed_embeddings() {
        let cands = vec![
            ("bad_dim".to_string(), vec![vec![1.0]]),
            ("nan".to_string(), vec![vec![f32::NAN, 0.0, 0.0]]),
            ("ok".to_string(), vec![vec![2.0, 0.0, 0.0]]),
        ];
        let result = k_nearest(&cands, &[0.0, 0.0, 0.0], 5);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].0, "ok");
    }

    #[test]
    fn test_multiple_embeddings_per_asset() {
        let cands = vec![(
            "multi".to_string(),
            vec![vec![3.0, 0.0, 0.0], vec![0.5, 0.0, 0.0]],
        )];
        let result = k_nearest(&cands, &[0.0, 0.0, 0.0], 1);
        assert_eq!(result[0].1, 0.5);
    }

    #[test]
    fn test_projection_is_matrix_vector_product() {
        let projection =
            Projection::from_matrix(vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]).unwrap();
        assert_eq!(projection.input_dim(), 3);
        assert_eq!(projection.output_dim(), 2);
        assert_eq!(projection.project(&[3.0, 4.0, 5.0]).unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_projection_rejects_wrong_dimension() {
        let projection = Projection::from_matrix(vec![vec![1.0, 0.0]]).unwrap();
        assert!(matches!(
            projection.project(&[1.0]),
            Err(SimilarityError::Dimension {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn test_projection_load_missing_file_is_fatal() {
        let err = Projection::load("/nonexistent/weights.json").unwrap_err();
        assert!(matches!(err, SimilarityError::WeightsUnreadable { .. }));
    }

    fn sample_index() -> SimilarityIndex {
        let projection = Projection::from_matrix(vec![vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        SimilarityIndex::new(projection, Box::new(SingleLabel))
    }

    #[test]
    fn test_index_ingest_is_idempotent() {
        let index = sample_index();
        index.ingest("img_1.jpg", vec![vec![1.0, 0.0]]);
        index.ingest("img_1.jpg", vec![vec![1.0, 0.0]]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_index_query_and_recluster() {
        let index = sample_index();
        index.ingest("near", vec![vec![0.1, 0.0]]);
        index.ingest("far", vec![vec![9.0, 9.0]]);

        let result = index.k_nearest(&[0.0, 0.0], 1);
        assert_eq!(result[0].0, "near");

        assert_eq!(index.recluster(), vec![0, 0]);
    }
}
