use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::core::methods::meta_programs::MetaProgramSet;
use crate::error::{PipelineWarning, Result};
use crate::pipeline::artifacts::ArtifactStore;
use crate::pipeline::runner::{PipelineOutputs, FILTERED, PCA};
use crate::single_cell::labels::label_clusters;
use crate::single_cell::clustering::ClusterAssignment;
use crate::single_cell::dge::MarkerTable;
use crate::single_cell::processing::Embedding;

#[derive(Serialize)]
struct ClusterRow<'a> {
    cell_id: &'a str,
    cluster: usize,
}

#[derive(Serialize)]
struct LabelledClusterRow<'a> {
    cell_id: &'a str,
    cluster: usize,
    label: &'a str,
}

#[derive(Serialize)]
struct MetaProgramRow<'a> {
    program: usize,
    rank: usize,
    gene: &'a str,
    weight: f64,
}

/// Write `cell_id,cluster`
///
/// ### Params
///
/// * `path` - Output file.
/// * `cell_ids` - Cell ids in row order.
/// * `assignment` - The clusters.
pub fn write_clusters(path: &Path, cell_ids: &[String], assignment: &ClusterAssignment) -> Result<()> {
    crate::ensure_dims!("cell ids vs. cluster labels", assignment.labels.len(), cell_ids.len());
    let mut wtr = csv::Writer::from_path(path)?;
    for (cell_id, &cluster) in cell_ids.iter().zip(assignment.labels.iter()) {
        wtr.serialize(ClusterRow { cell_id, cluster })?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write `cell_id,cluster,label`
pub fn write_labelled_clusters(
    path: &Path,
    cell_ids: &[String],
    assignment: &ClusterAssignment,
    cell_labels: &[String],
) -> Result<()> {
    crate::ensure_dims!("cell ids vs. cluster labels", assignment.labels.len(), cell_ids.len());
    crate::ensure_dims!("cell ids vs. cell labels", cell_labels.len(), cell_ids.len());
    let mut wtr = csv::Writer::from_path(path)?;
    for ((cell_id, &cluster), label) in cell_ids
        .iter()
        .zip(assignment.labels.iter())
        .zip(cell_labels.iter())
    {
        wtr.serialize(LabelledClusterRow {
            cell_id,
            cluster,
            label,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write `cell_id,<name>_1,<name>_2,...`
pub fn write_embedding(path: &Path, embedding: &Embedding) -> Result<()> {
    crate::ensure_dims!(
        format!("cell ids of embedding '{}'", embedding.name),
        embedding.coords.nrows(),
        embedding.cell_ids.len()
    );
    let mut wtr = csv::Writer::from_path(path)?;

    let mut header = vec!["cell_id".to_string()];
    header.extend((1..=embedding.n_dims()).map(|d| format!("{}_{}", embedding.name, d)));
    wtr.write_record(&header)?;

    for (i, cell_id) in embedding.cell_ids.iter().enumerate() {
        let mut record = Vec::with_capacity(embedding.n_dims() + 1);
        record.push(cell_id.clone());
        record.extend((0..embedding.n_dims()).map(|d| embedding.coords[(i, d)].to_string()));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write `cluster,gene,logFC,pct.in,pct.out,stat,p_val,p_val_adj`
pub fn write_markers(path: &Path, markers: &MarkerTable) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    if markers.markers.is_empty() {
        wtr.write_record([
            "cluster", "gene", "logFC", "pct.in", "pct.out", "stat", "p_val", "p_val_adj",
        ])?;
    }
    for marker in &markers.markers {
        wtr.serialize(marker)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write `program,rank,gene,weight`
pub fn write_meta_programs(path: &Path, set: &MetaProgramSet) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    if set.programs.iter().all(|p| p.genes.is_empty()) {
        wtr.write_record(["program", "rank", "gene", "weight"])?;
    }
    for program in &set.programs {
        for (rank, (gene, weight)) in program.genes.iter().enumerate() {
            wtr.serialize(MetaProgramRow {
                program: program.id,
                rank: rank + 1,
                gene,
                weight: *weight,
            })?;
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Write all warnings as a JSON array
pub fn write_warnings(path: &Path, warnings: &[PipelineWarning]) -> Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, warnings)?;
    Ok(())
}

/// Write every final output of a pipeline run into a directory
///
/// ### Params
///
/// * `dir` - Output directory; created if missing.
/// * `artifacts` - The populated store.
/// * `outputs` - Ids of the final artifacts.
/// * `cluster_labels` - Optional human readable label per cluster of the
///   main clustering.
///
/// ### Returns
///
/// The paths of the written files.
pub fn write_outputs(
    dir: &Path,
    artifacts: &ArtifactStore,
    outputs: &PipelineOutputs,
    cluster_labels: Option<&[String]>,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    let cell_ids = &artifacts.counts(FILTERED)?.cells().ids;

    let clustering = &outputs.clustering;
    let clusters = artifacts.clusters(&clustering.clusters)?;
    let path = dir.join("clusters.csv");
    match cluster_labels {
        Some(labels) => {
            let per_cell = label_clusters(clusters, labels)?;
            write_labelled_clusters(&path, cell_ids, clusters, &per_cell)?;
        }
        None => write_clusters(&path, cell_ids, clusters)?,
    }
    written.push(path);

    for id in &clustering.extra_clusters {
        let path = dir.join(format!("{}.csv", id));
        write_clusters(&path, cell_ids, artifacts.clusters(id)?)?;
        written.push(path);
    }

    let mut embeddings = vec![PCA];
    if clustering.embedding != PCA {
        embeddings.push(clustering.embedding.as_str());
    }
    for id in embeddings {
        let path = dir.join(format!("{}.csv", id));
        write_embedding(&path, artifacts.embedding(id)?)?;
        written.push(path);
    }

    let path = dir.join("markers.csv");
    write_markers(&path, artifacts.markers(&clustering.markers)?)?;
    written.push(path);

    let path = dir.join("meta_programs.csv");
    write_meta_programs(&path, artifacts.meta_programs(&outputs.meta_programs.meta_programs)?)?;
    written.push(path);

    let path = dir.join("warnings.json");
    write_warnings(&path, &artifacts.all_warnings())?;
    written.push(path);

    log::info!("Wrote {} files to {}", written.len(), dir.display());
    Ok(written)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::methods::meta_programs::MetaProgram;
    use crate::single_cell::dge::MarkerGene;
    use faer::Mat;

    fn assignment() -> ClusterAssignment {
        ClusterAssignment {
            source: "pca".to_string(),
            resolution: 1.0,
            labels: vec![1, 0],
            n_clusters: 2,
            modularity: 0.2,
            modularity_trace: vec![0.0, 0.2],
        }
    }

    fn ids() -> Vec<String> {
        vec!["s1_A".to_string(), "s1_B".to_string()]
    }

    #[test]
    fn test_cluster_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.csv");
        write_clusters(&path, &ids(), &assignment()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "cell_id,cluster\ns1_A,1\ns1_B,0\n");

        let labelled = dir.path().join("labelled.csv");
        let labels = vec!["B cell".to_string(), "T cell".to_string()];
        write_labelled_clusters(&labelled, &ids(), &assignment(), &labels).unwrap();
        let content = std::fs::read_to_string(&labelled).unwrap();
        assert_eq!(content.lines().nth(1), Some("s1_A,1,B cell"));
    }

    #[test]
    fn test_embedding_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pca.csv");
        let emb = Embedding {
            name: "pca".to_string(),
            method: "pca".to_string(),
            parent: None,
            cell_ids: ids(),
            coords: Mat::from_fn(2, 2, |i, j| (i * 2 + j) as f64 + 0.5),
            stdev: None,
            loadings: None,
            warnings: Vec::new(),
        };
        write_embedding(&path, &emb).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "cell_id,pca_1,pca_2");
        assert_eq!(lines[2], "s1_B,2.5,3.5");
    }

    #[test]
    fn test_marker_and_program_csv() {
        let dir = tempfile::tempdir().unwrap();
        let markers = MarkerTable {
            markers: vec![MarkerGene {
                cluster: 0,
                gene: "CD3E".to_string(),
                gene_index: 3,
                log_fc: 1.5,
                pct_in: 0.9,
                pct_out: 0.1,
                statistic: 4.0,
                p_val: 0.001,
                p_val_adj: 0.01,
            }],
            warnings: Vec::new(),
        };
        let path = dir.path().join("markers.csv");
        write_markers(&path, &markers).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "cluster,gene,logFC,pct.in,pct.out,stat,p_val,p_val_adj");
        assert_eq!(lines[1], "0,CD3E,1.5,0.9,0.1,4.0,0.001,0.01");

        let set = MetaProgramSet {
            programs: vec![MetaProgram {
                id: 0,
                genes: vec![("A".to_string(), 0.5), ("B".to_string(), 0.25)],
                members: vec![("s1".to_string(), 2, 0)],
            }],
            warnings: Vec::new(),
        };
        let path = dir.path().join("meta.csv");
        write_meta_programs(&path, &set).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "program,rank,gene,weight\n0,1,A,0.5\n0,2,B,0.25\n");
    }

    #[test]
    fn test_warnings_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warnings.json");
        let warnings = vec![PipelineWarning::ZeroVariance {
            gene: "G1".to_string(),
        }];
        write_warnings(&path, &warnings).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed[0]["ZeroVariance"]["gene"], "G1");
    }
}
