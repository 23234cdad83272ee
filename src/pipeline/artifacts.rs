//! Versioned, append-only store of intermediate results.
//!
//! Every stage output is stored under a string id together with the ids it
//! was derived from. Payloads are shared via `Arc` and never mutated; a new
//! result always gets a new id.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::core::data::sparse_structures::CompressedSparseData;
use crate::core::methods::meta_programs::MetaProgramSet;
use crate::core::methods::nmf::NmfFactorisation;
use crate::error::{PipelineWarning, Result, ScError};
use crate::single_cell::clustering::ClusterAssignment;
use crate::single_cell::dge::MarkerTable;
use crate::single_cell::matrix_store::MatrixStore;
use crate::single_cell::processing::{Embedding, GeneTable, ScaledData};
use crate::single_cell::sc_knn_snn::NeighbourGraph;

///////////
// Enums //
///////////

/// Kind of a stored artifact
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Counts,
    Normalised,
    GeneTable,
    Scaled,
    Embedding,
    Graph,
    Clusters,
    Markers,
    Nmf,
    MetaPrograms,
}

/// Payload of an artifact
#[derive(Debug)]
pub enum ArtifactData {
    Counts(MatrixStore),
    Normalised(CompressedSparseData<f64>),
    GeneTable(GeneTable),
    Scaled(ScaledData),
    Embedding(Embedding),
    Graph(NeighbourGraph),
    Clusters(ClusterAssignment),
    Markers(MarkerTable),
    Nmf(Vec<NmfFactorisation>),
    MetaPrograms(MetaProgramSet),
}

impl ArtifactData {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactData::Counts(_) => ArtifactKind::Counts,
            ArtifactData::Normalised(_) => ArtifactKind::Normalised,
            ArtifactData::GeneTable(_) => ArtifactKind::GeneTable,
            ArtifactData::Scaled(_) => ArtifactKind::Scaled,
            ArtifactData::Embedding(_) => ArtifactKind::Embedding,
            ArtifactData::Graph(_) => ArtifactKind::Graph,
            ArtifactData::Clusters(_) => ArtifactKind::Clusters,
            ArtifactData::Markers(_) => ArtifactKind::Markers,
            ArtifactData::Nmf(_) => ArtifactKind::Nmf,
            ArtifactData::MetaPrograms(_) => ArtifactKind::MetaPrograms,
        }
    }
}

////////////////
// Structures //
////////////////

/// A stored result with its provenance
///
/// ### Fields
///
/// * `id` - Unique id.
/// * `kind` - Kind of the payload.
/// * `parents` - Ids of the artifacts it was computed from.
/// * `payload` - Shared, immutable data.
/// * `warnings` - Non-fatal issues of the producing stage.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub id: String,
    pub kind: ArtifactKind,
    pub parents: Vec<String>,
    pub payload: Arc<ArtifactData>,
    pub warnings: Vec<PipelineWarning>,
}

/// Append-only artifact store
#[derive(Clone, Debug, Default)]
pub struct ArtifactStore {
    artifacts: FxHashMap<String, Artifact>,
    order: Vec<String>,
}

/// Generates a typed accessor for one payload variant
macro_rules! typed_getter {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self, id: &str) -> Result<&$ty> {
            match self.get(id)?.payload.as_ref() {
                ArtifactData::$variant(x) => Ok(x),
                other => Err(ScError::InputFormat(format!(
                    "artifact '{}' holds {:?}, expected {:?}",
                    id,
                    other.kind(),
                    ArtifactKind::$variant
                ))),
            }
        }
    };
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new artifact
    ///
    /// ### Params
    ///
    /// * `id` - Unique id of the new artifact.
    /// * `parents` - Ids it was derived from; all must exist.
    /// * `data` - The payload.
    /// * `warnings` - Warnings of the producing stage.
    ///
    /// ### Returns
    ///
    /// The shared payload, or `DuplicateArtifact` / `MissingArtifact`.
    pub fn insert(
        &mut self,
        id: &str,
        parents: &[&str],
        data: ArtifactData,
        warnings: Vec<PipelineWarning>,
    ) -> Result<Arc<ArtifactData>> {
        if self.artifacts.contains_key(id) {
            return Err(ScError::DuplicateArtifact(id.to_string()));
        }
        if let Some(missing) = parents.iter().find(|p| !self.artifacts.contains_key(**p)) {
            return Err(ScError::MissingArtifact(missing.to_string()));
        }

        let payload = Arc::new(data);
        let artifact = Artifact {
            id: id.to_string(),
            kind: payload.kind(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            payload: Arc::clone(&payload),
            warnings,
        };
        log::debug!("Stored artifact '{}' ({:?})", id, artifact.kind);
        self.artifacts.insert(id.to_string(), artifact);
        self.order.push(id.to_string());

        Ok(payload)
    }

    pub fn get(&self, id: &str) -> Result<&Artifact> {
        self.artifacts
            .get(id)
            .ok_or_else(|| ScError::MissingArtifact(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.artifacts.contains_key(id)
    }

    /// Artifact ids in insertion order
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// All ancestors of an artifact, nearest first, without duplicates
    pub fn lineage(&self, id: &str) -> Result<Vec<String>> {
        let mut res: Vec<String> = Vec::new();
        let mut queue: Vec<String> = self.get(id)?.parents.clone();
        while !queue.is_empty() {
            let current = queue.remove(0);
            if res.contains(&current) {
                continue;
            }
            queue.extend(self.get(&current)?.parents.iter().cloned());
            res.push(current);
        }
        Ok(res)
    }

    /// Warnings of all artifacts, in insertion order
    pub fn all_warnings(&self) -> Vec<PipelineWarning> {
        self.order
            .iter()
            .filter_map(|id| self.artifacts.get(id))
            .flat_map(|a| a.warnings.iter().cloned())
            .collect()
    }

    typed_getter!(counts, Counts, MatrixStore);
    typed_getter!(normalised, Normalised, CompressedSparseData<f64>);
    typed_getter!(gene_table, GeneTable, GeneTable);
    typed_getter!(scaled, Scaled, ScaledData);
    typed_getter!(embedding, Embedding, Embedding);
    typed_getter!(graph, Graph, NeighbourGraph);
    typed_getter!(clusters, Clusters, ClusterAssignment);
    typed_getter!(markers, Markers, MarkerTable);
    typed_getter!(nmf, Nmf, Vec<NmfFactorisation>);
    typed_getter!(meta_programs, MetaPrograms, MetaProgramSet);
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(resolution: f64) -> ArtifactData {
        ArtifactData::Clusters(ClusterAssignment {
            source: "pca".to_string(),
            resolution,
            labels: vec![0, 0, 1],
            n_clusters: 2,
            modularity: 0.1,
            modularity_trace: vec![0.0, 0.1],
        })
    }

    #[test]
    fn test_insert_and_typed_get() {
        let mut store = ArtifactStore::new();
        store.insert("clusters", &[], assignment(1.0), Vec::new()).unwrap();

        let clusters = store.clusters("clusters").unwrap();
        assert_eq!(clusters.labels, vec![0, 0, 1]);
        assert_eq!(store.get("clusters").unwrap().kind, ArtifactKind::Clusters);
        assert!(matches!(
            store.embedding("clusters"),
            Err(ScError::InputFormat(_))
        ));
        assert!(matches!(store.get("nope"), Err(ScError::MissingArtifact(_))));
    }

    #[test]
    fn test_duplicate_rejected_and_original_kept() {
        let mut store = ArtifactStore::new();
        store.insert("clusters", &[], assignment(1.0), Vec::new()).unwrap();
        let res = store.insert("clusters", &[], assignment(0.6), Vec::new());

        assert!(matches!(res, Err(ScError::DuplicateArtifact(_))));
        assert_eq!(store.clusters("clusters").unwrap().resolution, 1.0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_parents_and_lineage() {
        let mut store = ArtifactStore::new();
        assert!(matches!(
            store.insert("b", &["a"], assignment(1.0), Vec::new()),
            Err(ScError::MissingArtifact(_))
        ));

        store.insert("a", &[], assignment(1.0), Vec::new()).unwrap();
        store.insert("b", &["a"], assignment(0.5), Vec::new()).unwrap();
        let warning = PipelineWarning::EmptyCluster {
            cluster: 1,
            reason: "no member cells".to_string(),
        };
        store
            .insert("c", &["b", "a"], assignment(0.2), vec![warning.clone()])
            .unwrap();

        assert_eq!(store.lineage("c").unwrap(), vec!["b", "a"]);
        assert_eq!(store.ids(), &["a", "b", "c"]);
        assert_eq!(store.all_warnings(), vec![warning]);
    }
}
