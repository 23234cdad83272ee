use crate::error::{Result, ScError};
use crate::single_cell::clustering::ClusterAssignment;

/// Map every cell to the human-readable label of its cluster
///
/// ### Params
///
/// * `assignment` - The cluster assignment.
/// * `labels` - One label per cluster, in cluster order.
///
/// ### Returns
///
/// The label per cell, or a `Config` error if the number of labels does not
/// match the number of clusters.
pub fn label_clusters(assignment: &ClusterAssignment, labels: &[String]) -> Result<Vec<String>> {
    if labels.len() != assignment.n_clusters {
        return Err(ScError::Config(format!(
            "{} cluster labels supplied for {} clusters",
            labels.len(),
            assignment.n_clusters
        )));
    }

    Ok(assignment
        .labels
        .iter()
        .map(|&c| labels[c].clone())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment() -> ClusterAssignment {
        ClusterAssignment {
            source: "pca".to_string(),
            resolution: 1.0,
            labels: vec![0, 1, 0, 2],
            n_clusters: 3,
            modularity: 0.3,
            modularity_trace: vec![0.0, 0.3],
        }
    }

    #[test]
    fn test_labels_mapped() {
        let names: Vec<String> = ["T", "B", "NK"].iter().map(|s| s.to_string()).collect();
        let res = label_clusters(&assignment(), &names).unwrap();
        assert_eq!(res, vec!["T", "B", "T", "NK"]);
    }

    #[test]
    fn test_label_count_mismatch() {
        let names = vec!["T".to_string(), "B".to_string()];
        assert!(matches!(
            label_clusters(&assignment(), &names),
            Err(ScError::Config(_))
        ));
    }
}
