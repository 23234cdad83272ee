use faer::MatRef;
use instant_distance::{Builder, Point as DistancePoint, Search};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Instant;

///////////
// Enums //
///////////

/// Enum for the different kNN search methods
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KnnSearch {
    /// Exhaustive Euclidean search
    #[default]
    Exact,
    /// Hierarchical Navigable Small World
    Hnsw,
}

/// Helper function to get the KNN method
///
/// ### Params
///
/// * `s` - Type of KNN algorithm to use
///
/// ### Returns
///
/// Option of the KnnSearch
pub fn get_knn_method(s: &str) -> Option<KnnSearch> {
    match s.to_lowercase().as_str() {
        "exact" => Some(KnnSearch::Exact),
        "hnsw" => Some(KnnSearch::Hnsw),
        _ => None,
    }
}

////////////////
// Structures //
////////////////

#[derive(Clone, Debug)]
struct Point(Vec<f32>);

impl DistancePoint for Point {
    /// Squared Euclidean distance; does not change the rank order.
    fn distance(&self, other: &Self) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

/////////////
// Helpers //
/////////////

#[inline]
fn squared_euclidean(mat: &MatRef<f64>, i: usize, j: usize) -> f64 {
    (0..mat.ncols())
        .map(|c| {
            let d = mat[(i, c)] - mat[(j, c)];
            d * d
        })
        .sum()
}

////////////////////
// Main functions //
////////////////////

/// Exhaustive kNN search
///
/// ### Params
///
/// * `mat` - Matrix with samples in rows and embedding dimensions in columns.
/// * `k` - Number of neighbours. Capped at `n - 1`.
///
/// ### Returns
///
/// Per sample the neighbour indices, nearest first. Self is excluded and
/// equal distances are ordered by index.
pub fn generate_knn_exact(mat: MatRef<f64>, k: usize) -> Vec<Vec<usize>> {
    let n = mat.nrows();
    let k = k.min(n.saturating_sub(1));

    (0..n)
        .into_par_iter()
        .map(|i| {
            let mut dists: Vec<(f64, usize)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (squared_euclidean(&mat, i, j), j))
                .collect();

            let cmp = |a: &(f64, usize), b: &(f64, usize)| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(Ordering::Equal)
                    .then(a.1.cmp(&b.1))
            };

            if k < dists.len() && k > 0 {
                dists.select_nth_unstable_by(k - 1, cmp);
                dists.truncate(k);
            }
            dists.sort_unstable_by(cmp);
            dists.truncate(k);
            dists.into_iter().map(|(_, j)| j).collect()
        })
        .collect()
}

/// Get the kNN graph based on HNSW
///
/// This function generates the kNN graph via an approximate nearest neighbour
/// search based on the HNSW algorithm (hierarchical navigable small world).
///
/// ### Params
///
/// * `mat` - Matrix in which rows represent the samples and columns the
///   respective embeddings for that sample
/// * `k` - Number of neighbours for the KNN graph. Capped at `n - 1`.
/// * `seed` - Seed for the HNSW algorithm
///
/// ### Returns
///
/// The k-nearest neighbours based on the HNSW algorithm, nearest first.
pub fn generate_knn_hnsw(mat: MatRef<f64>, k: usize, seed: u64) -> Vec<Vec<usize>> {
    let n_samples = mat.nrows();
    let k = k.min(n_samples.saturating_sub(1));

    let points: Vec<Point> = (0..n_samples)
        .into_par_iter()
        .map(|i| Point(mat.row(i).iter().map(|&x| x as f32).collect()))
        .collect();

    let map = Builder::default()
        .seed(seed)
        .build(points.clone(), (0..n_samples).collect::<Vec<_>>());

    points
        .par_iter()
        .enumerate()
        .map(|(i, point)| {
            let mut search = Search::default();
            let mut nearest_neighbours: Vec<usize> = map
                .search(point, &mut search)
                .take(k + 1)
                .map(|item| *item.value)
                .collect();

            nearest_neighbours.retain(|&x| x != i);
            nearest_neighbours.truncate(k);
            nearest_neighbours
        })
        .collect()
}

/// Dispatch the kNN search
///
/// ### Params
///
/// * `mat` - Samples x dimensions.
/// * `k` - Number of neighbours.
/// * `method` - Which search to use.
/// * `seed` - Seed (only used by HNSW).
///
/// ### Returns
///
/// Per sample the neighbour indices, nearest first.
pub fn generate_knn(mat: MatRef<f64>, k: usize, method: KnnSearch, seed: u64) -> Vec<Vec<usize>> {
    let start = Instant::now();
    let res = match method {
        KnnSearch::Exact => generate_knn_exact(mat, k),
        KnnSearch::Hnsw => generate_knn_hnsw(mat, k, seed),
    };
    log::debug!(
        "kNN search ({:?}, k = {}) over {} samples in {:.2?}",
        method,
        k,
        mat.nrows(),
        start.elapsed()
    );
    res
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    fn create_clustered_data() -> Mat<f64> {
        let mut data = Vec::new();
        for (cx, cy) in [(0.0, 0.0), (10.0, 10.0), (-10.0, 10.0)] {
            for i in 0..50 {
                data.push(vec![
                    cx + (i as f64 * 0.1) % 2.0 - 1.0,
                    cy + (i as f64 * 0.15) % 2.0 - 1.0,
                ]);
            }
        }
        Mat::from_fn(150, 2, |i, j| data[i][j])
    }

    #[test]
    fn test_exact_knn_line() {
        let mat = Mat::from_fn(5, 1, |i, _| i as f64);
        let knn = generate_knn_exact(mat.as_ref(), 2);

        assert_eq!(knn[0], vec![1, 2]);
        // node 2 has 1 and 3 at equal distance -> lower index first
        assert_eq!(knn[2], vec![1, 3]);
        assert_eq!(knn[4], vec![3, 2]);
    }

    #[test]
    fn test_k_capped() {
        let mat = Mat::from_fn(3, 2, |i, j| (i + j) as f64);
        let knn = generate_knn_exact(mat.as_ref(), 10);
        assert!(knn.iter().all(|n| n.len() == 2));
    }

    #[test]
    fn test_hnsw_no_self_and_cluster_structure() {
        let data = create_clustered_data();
        let knn = generate_knn_hnsw(data.as_ref(), 5, 42);

        for (i, neighbours) in knn.iter().enumerate() {
            assert_eq!(neighbours.len(), 5);
            assert!(!neighbours.contains(&i));
        }
        let same_cluster = knn[0].iter().filter(|&&n| n < 50).count();
        assert!(same_cluster >= 3);
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(get_knn_method("HNSW"), Some(KnnSearch::Hnsw));
        assert_eq!(get_knn_method("exact"), Some(KnnSearch::Exact));
        assert_eq!(get_knn_method("annoy"), None);
    }
}
