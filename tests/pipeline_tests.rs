use cellprog::core::base::stats::adjusted_rand_index;
use cellprog::core::data::sparse_structures::CompressedSparseData;
use cellprog::core::data::synthetic_data::{
    generate_batch_embedding, generate_group_counts, generate_program_matrix,
};
use cellprog::core::methods::nmf::{nmf_sparse, NmfParams};
use cellprog::pipeline::config::PipelineConfig;
use cellprog::pipeline::input::read_long_counts;
use cellprog::pipeline::output::write_outputs;
use cellprog::pipeline::runner::{run_pipeline, CLUSTERS, FILTERED, HARMONY};
use cellprog::single_cell::batch_corrections::{
    run_harmony, same_batch_neighbour_fraction, HarmonyParams,
};
use cellprog::single_cell::clustering::ClusterAssignment;
use cellprog::single_cell::dge::{find_markers, DeParams};
use cellprog::single_cell::matrix_store::{MatrixStore, SampleCounts};
use cellprog::single_cell::processing::{normalise_counts, NormaliseParams};

/////////////
// Helpers //
/////////////

fn sample(name: &str, counts: CompressedSparseData<u32>) -> SampleCounts {
    let (n_cells, n_genes) = counts.shape;
    SampleCounts {
        name: name.to_string(),
        barcodes: (0..n_cells).map(|i| format!("cell{}", i)).collect(),
        genes: (0..n_genes).map(|g| format!("gene{}", g)).collect(),
        counts,
    }
}

/// Long-format CSV of a dense count matrix
fn long_table(samples: &[(&str, Vec<Vec<u32>>)]) -> String {
    let mut csv = String::from("cell,sample,gene,count\n");
    for (name, rows) in samples {
        for (i, row) in rows.iter().enumerate() {
            for (g, &v) in row.iter().enumerate() {
                if v > 0 {
                    csv.push_str(&format!("c{},{},gene{},{}\n", i, name, g, v));
                }
            }
        }
    }
    csv
}

fn dense_rows(counts: &CompressedSparseData<u32>) -> Vec<Vec<u32>> {
    let dense = counts.to_dense();
    (0..dense.nrows())
        .map(|i| (0..dense.ncols()).map(|j| dense[(i, j)] as u32).collect())
        .collect()
}

///////////
// Tests //
///////////

#[test]
fn two_groups_recovered_with_defaults() {
    let data = generate_group_counts(100, 50, 2, 20.0, 2.0, 42).unwrap();
    let store = MatrixStore::from_samples(vec![sample("s1", data.counts)], "MT-").unwrap();

    let (artifacts, outputs) = run_pipeline(&store, &PipelineConfig::default()).unwrap();
    let clusters = artifacts.clusters(&outputs.clustering.clusters).unwrap();

    assert_eq!(clusters.labels.len(), 100);
    let ari = adjusted_rand_index(&clusters.labels, &data.groups);
    assert!(ari >= 0.95, "ARI {}", ari);
    assert!(clusters.modularity > 0.0);
}

#[test]
fn batch_correction_improves_mixing() {
    let data = generate_batch_embedding(2000, 3, 2, 10, 6.0, 5.0, 11).unwrap();
    let params = HarmonyParams {
        dims: 10,
        n_clusters: Some(20),
        max_iter: 10,
        ..Default::default()
    };

    let before =
        same_batch_neighbour_fraction(data.embedding.as_ref(), &data.batches, 20).unwrap();
    let res = run_harmony(data.embedding.as_ref(), &data.batches, &params).unwrap();
    let after = same_batch_neighbour_fraction(res.corrected.as_ref(), &data.batches, 20).unwrap();

    assert!(before > 0.8, "shift not visible: {}", before);
    assert!(after < before, "before {} after {}", before, after);
}

#[test]
fn nmf_separates_disjoint_programs() {
    let (x, gene_program) = generate_program_matrix(80, 12, 2, 5).unwrap();
    let params = NmfParams {
        max_iter: 1000,
        tol: 1e-10,
        seed: 42,
    };
    let res = nmf_sparse(&x, "s1", 2, &params).unwrap();

    let mut dominant = Vec::new();
    for c in 0..2 {
        let weights: Vec<f64> = (0..2)
            .map(|p| {
                (0..24)
                    .filter(|&g| gene_program[g] == p)
                    .map(|g| res.h[(g, c)])
                    .sum::<f64>()
            })
            .collect();
        let total = weights[0] + weights[1];
        let best = if weights[0] >= weights[1] { 0 } else { 1 };
        assert!(weights[1 - best] / total < 0.1, "factor {}: {:?}", c, weights);
        dominant.push(best);
    }
    dominant.sort_unstable();
    assert_eq!(dominant, vec![0, 1]);
}

#[test]
fn exclusive_gene_is_a_marker_of_its_cluster_only() {
    // gene0 only in the first 20 cells, the rest shared
    let data = generate_group_counts(40, 10, 1, 6.0, 6.0, 3).unwrap();
    let mut rows = dense_rows(&data.counts);
    for (i, row) in rows.iter_mut().enumerate() {
        row[0] = if i < 20 { 8 + (i % 3) as u32 } else { 0 };
    }
    let counts = CompressedSparseData::from_dense_rows(&rows, 10, 0).unwrap();
    let store = MatrixStore::from_samples(vec![sample("s1", counts)], "MT-").unwrap();
    let normalised = normalise_counts(&store, &NormaliseParams::default()).unwrap();

    let assignment = ClusterAssignment {
        source: "pca".to_string(),
        resolution: 1.0,
        labels: (0..40).map(|i| if i < 20 { 0 } else { 1 }).collect(),
        n_clusters: 2,
        modularity: 0.5,
        modularity_trace: vec![0.5],
    };
    let params = DeParams::default();
    let table = find_markers(&normalised, store.genes(), &assignment, &params).unwrap();

    let hit = table
        .cluster(0)
        .into_iter()
        .find(|m| m.gene == "gene0")
        .expect("gene0 missing from cluster 0 markers");
    assert_eq!(hit.pct_out, 0.0);
    assert_eq!(hit.pct_in, 1.0);
    assert!(hit.log_fc > params.de_logfc_threshold);
    assert!(hit.p_val_adj < 0.01);

    assert!(table.cluster(1).iter().all(|m| m.gene != "gene0"));
}

#[test]
fn two_samples_from_csv_to_output_files() {
    let a = generate_group_counts(60, 30, 2, 15.0, 1.0, 1).unwrap();
    let b = generate_group_counts(60, 30, 2, 15.0, 1.0, 2).unwrap();
    let csv = long_table(&[("s1", dense_rows(&a.counts)), ("s2", dense_rows(&b.counts))]);
    let store = read_long_counts(csv.as_bytes(), "MT-").unwrap();
    assert_eq!(store.n_cells(), 120);

    let config = PipelineConfig::from_json_str(
        r#"{
            "hvg": { "n_variable_features": 20 },
            "pca": { "n_pca_dims": 10 },
            "batch": { "batch_correction_dims": 10, "n_clusters": 5, "batch_correction_max_iter": 5 },
            "graph": { "neighbor_k": 10 },
            "nmf": { "nmf_rank_range": [2, 2], "max_iter": 50 },
            "meta": { "n_meta_programs": 2 }
        }"#,
    )
    .unwrap();
    let (artifacts, outputs) = run_pipeline(&store, &config).unwrap();

    assert_eq!(outputs.clustering.embedding, HARMONY);
    assert_eq!(outputs.meta_programs.n_runs + outputs.meta_programs.n_skipped, 2);
    let n_clusters = artifacts.clusters(CLUSTERS).unwrap().n_clusters;

    let dir = tempfile::tempdir().unwrap();
    let labels: Vec<String> = (0..n_clusters).map(|c| format!("type{}", c)).collect();
    let written = write_outputs(dir.path(), &artifacts, &outputs, Some(&labels)).unwrap();

    for name in [
        "clusters.csv",
        "pca.csv",
        "harmony.csv",
        "markers.csv",
        "meta_programs.csv",
        "warnings.json",
    ] {
        assert!(written.contains(&dir.path().join(name)), "missing {}", name);
    }

    let clusters_csv = std::fs::read_to_string(dir.path().join("clusters.csv")).unwrap();
    let lines: Vec<&str> = clusters_csv.lines().collect();
    assert_eq!(lines[0], "cell_id,cluster,label");
    assert_eq!(lines.len(), artifacts.counts(FILTERED).unwrap().n_cells() + 1);
    assert!(lines[1].starts_with("s1_c0,"));

    // wrong number of labels is rejected
    let wrong_count = vec!["only".to_string(); n_clusters + 1];
    assert!(write_outputs(dir.path(), &artifacts, &outputs, Some(&wrong_count)).is_err());
}
