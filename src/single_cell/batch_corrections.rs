use faer::{Mat, MatRef};
use rand::prelude::*;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::time::Instant;

use crate::core::base::utils::normalise_matrix_row_l2;
use crate::core::graph::knn::generate_knn_exact;
use crate::error::{PipelineWarning, Result, ScError};
use crate::single_cell::processing::Embedding;

///////////
// Enums //
///////////

/// Convergence criterion of the outer Harmony loop
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HarmonyConvergence {
    /// Mean (over cells) of half the L1 change of the responsibilities
    #[default]
    AssignmentChange,
    /// Relative change of the clustering objective
    ObjectiveChange,
}

impl HarmonyConvergence {
    /// Threshold used when none is configured
    pub fn default_threshold(&self) -> f64 {
        match self {
            HarmonyConvergence::AssignmentChange => 1e-3,
            HarmonyConvergence::ObjectiveChange => 1e-4,
        }
    }
}

/// Helper function to parse the Harmony convergence criterion
///
/// ### Params
///
/// * `s` - Name of the criterion
///
/// ### Returns
///
/// Option of the HarmonyConvergence
pub fn parse_harmony_convergence(s: &str) -> Option<HarmonyConvergence> {
    match s.to_lowercase().as_str() {
        "assignment_change" | "assignment" => Some(HarmonyConvergence::AssignmentChange),
        "objective_change" | "objective" => Some(HarmonyConvergence::ObjectiveChange),
        _ => None,
    }
}

////////////
// Params //
////////////

/// Parameters for the Harmony batch correction
///
/// ### Fields
///
/// * `dims` - Number of leading embedding dimensions to correct.
/// * `max_iter` - Maximum number of cluster/correct rounds.
/// * `n_clusters` - Number of soft clusters; `None` uses
///   `min(round(n / 30), 100)`.
/// * `sigma` - Softmax bandwidth of the soft k-means.
/// * `theta` - Strength of the batch diversity penalty.
/// * `lambda` - Ridge penalty of the per-cluster correction.
/// * `block_size` - Fraction of cells updated per responsibility block.
/// * `max_iter_cluster` - Maximum soft k-means rounds per iteration.
/// * `epsilon_cluster` - Relative objective change stopping the soft
///   k-means.
/// * `convergence` - Outer convergence criterion.
/// * `convergence_threshold` - Threshold of the criterion; `None` uses the
///   criterion's default.
/// * `seed` - Seed for reproducibility purposes.
#[derive(Clone, Debug)]
pub struct HarmonyParams {
    pub dims: usize,
    pub max_iter: usize,
    pub n_clusters: Option<usize>,
    pub sigma: f64,
    pub theta: f64,
    pub lambda: f64,
    pub block_size: f64,
    pub max_iter_cluster: usize,
    pub epsilon_cluster: f64,
    pub convergence: HarmonyConvergence,
    pub convergence_threshold: Option<f64>,
    pub seed: u64,
}

impl Default for HarmonyParams {
    fn default() -> Self {
        Self {
            dims: 30,
            max_iter: 50,
            n_clusters: None,
            sigma: 0.1,
            theta: 2.0,
            lambda: 1.0,
            block_size: 0.05,
            max_iter_cluster: 20,
            epsilon_cluster: 1e-5,
            convergence: HarmonyConvergence::AssignmentChange,
            convergence_threshold: None,
            seed: 42,
        }
    }
}

////////////////
// Structures //
////////////////

/// Result of a Harmony run
///
/// ### Fields
///
/// * `corrected` - Corrected cells x dims embedding.
/// * `n_iter` - Number of outer iterations performed.
/// * `converged` - Whether the criterion was met.
/// * `objective_trace` - Objective after every outer iteration.
/// * `warnings` - Convergence warnings.
#[derive(Clone, Debug)]
pub struct HarmonyResult {
    pub corrected: Mat<f64>,
    pub n_iter: usize,
    pub converged: bool,
    pub objective_trace: Vec<f64>,
    pub warnings: Vec<PipelineWarning>,
}

/// Internal state of the soft k-means with diversity penalty
struct HarmonyState<'a> {
    z_cos: Mat<f64>,
    centroids: Mat<f64>,
    r: Vec<Vec<f64>>,
    dist: Vec<Vec<f64>>,
    o: Vec<Vec<f64>>,
    e: Vec<Vec<f64>>,
    n_k: Vec<f64>,
    pr_b: Vec<f64>,
    batches: &'a [usize],
    params: &'a HarmonyParams,
}

/////////////
// Helpers //
/////////////

/// Map arbitrary batch labels to `0..n_batches` in order of appearance
fn dense_batches(batches: &[usize]) -> (Vec<usize>, usize) {
    let mut map: FxHashMap<usize, usize> = FxHashMap::default();
    let dense = batches
        .iter()
        .map(|b| {
            let next = map.len();
            *map.entry(*b).or_insert(next)
        })
        .collect();
    (dense, map.len())
}

#[inline]
fn row_sq_dist(a: MatRef<f64>, i: usize, b: MatRef<f64>, j: usize) -> f64 {
    (0..a.ncols())
        .map(|c| {
            let d = a[(i, c)] - b[(j, c)];
            d * d
        })
        .sum()
}

/// Seeded k-means++ seeding followed by a few Lloyd rounds
///
/// ### Returns
///
/// Row-normalised K x d centroid matrix.
fn kmeans_init(y: MatRef<f64>, k: usize, rng: &mut StdRng) -> Mat<f64> {
    let n = y.nrows();
    let d = y.ncols();

    let mut chosen = vec![rng.random_range(0..n)];
    let mut min_d: Vec<f64> = (0..n).map(|i| row_sq_dist(y, i, y, chosen[0])).collect();

    while chosen.len() < k {
        let total: f64 = min_d.iter().sum();
        let next = if total <= 0.0 {
            (0..n).find(|i| !chosen.contains(i)).unwrap_or(0)
        } else {
            let target = rng.random::<f64>() * total;
            let mut acc = 0.0;
            let mut pick = n - 1;
            for (i, &di) in min_d.iter().enumerate() {
                acc += di;
                if acc >= target && di > 0.0 {
                    pick = i;
                    break;
                }
            }
            pick
        };
        chosen.push(next);
        for (i, md) in min_d.iter_mut().enumerate() {
            *md = md.min(row_sq_dist(y, i, y, next));
        }
    }

    let mut centroids = Mat::from_fn(k, d, |c, j| y[(chosen[c], j)]);

    for _ in 0..10 {
        let assignment: Vec<usize> = (0..n)
            .into_par_iter()
            .map(|i| {
                (0..k)
                    .map(|c| (c, row_sq_dist(y, i, centroids.as_ref(), c)))
                    .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
                    .map_or(0, |(c, _)| c)
            })
            .collect();

        let mut sums = Mat::<f64>::zeros(k, d);
        let mut counts = vec![0_usize; k];
        for (i, &c) in assignment.iter().enumerate() {
            counts[c] += 1;
            for j in 0..d {
                sums[(c, j)] += y[(i, j)];
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                for j in 0..d {
                    centroids[(c, j)] = sums[(c, j)] / counts[c] as f64;
                }
            }
        }
    }

    normalise_matrix_row_l2(centroids.as_ref())
}

impl<'a> HarmonyState<'a> {
    fn new(
        z_cos: Mat<f64>,
        centroids: Mat<f64>,
        batches: &'a [usize],
        n_batches: usize,
        params: &'a HarmonyParams,
    ) -> Self {
        let n = z_cos.nrows();
        let k = centroids.nrows();
        let mut pr_b = vec![0.0; n_batches];
        for &b in batches {
            pr_b[b] += 1.0 / n as f64;
        }

        let mut state = Self {
            z_cos,
            centroids,
            r: vec![vec![0.0; k]; n],
            dist: Vec::new(),
            o: vec![vec![0.0; n_batches]; k],
            e: vec![vec![0.0; n_batches]; k],
            n_k: vec![0.0; k],
            pr_b,
            batches,
            params,
        };

        state.compute_dist();
        let sigma = params.sigma;
        state.r = state
            .dist
            .par_iter()
            .map(|d| {
                let d_min = d.iter().copied().fold(f64::INFINITY, f64::min);
                let raw: Vec<f64> = d.iter().map(|&x| (-(x - d_min) / sigma).exp()).collect();
                let total: f64 = raw.iter().sum();
                raw.into_iter().map(|x| x / total).collect()
            })
            .collect();
        state.compute_o_e();

        state
    }

    fn n_clusters(&self) -> usize {
        self.centroids.nrows()
    }

    /// Cosine distances `2 (1 - y_i . c_k)` of every cell to every centroid
    fn compute_dist(&mut self) {
        let y = self.z_cos.as_ref();
        let c = self.centroids.as_ref();
        let k = c.nrows();
        self.dist = (0..y.nrows())
            .into_par_iter()
            .map(|i| {
                (0..k)
                    .map(|ck| {
                        let dot: f64 = (0..y.ncols()).map(|j| y[(i, j)] * c[(ck, j)]).sum();
                        2.0 * (1.0 - dot)
                    })
                    .collect()
            })
            .collect();
    }

    /// Recompute observed and expected cluster x batch counts from R
    fn compute_o_e(&mut self) {
        let k = self.n_clusters();
        for row in self.o.iter_mut() {
            row.iter_mut().for_each(|v| *v = 0.0);
        }
        self.n_k = vec![0.0; k];
        for (i, r_i) in self.r.iter().enumerate() {
            let b = self.batches[i];
            for (ck, &v) in r_i.iter().enumerate() {
                self.o[ck][b] += v;
                self.n_k[ck] += v;
            }
        }
        self.refresh_expected();
    }

    fn refresh_expected(&mut self) {
        for (ck, row) in self.e.iter_mut().enumerate() {
            for (b, v) in row.iter_mut().enumerate() {
                *v = self.n_k[ck] * self.pr_b[b];
            }
        }
    }

    fn update_centroids(&mut self) {
        let k = self.n_clusters();
        let d = self.z_cos.ncols();
        let mut c = Mat::<f64>::zeros(k, d);
        for (i, r_i) in self.r.iter().enumerate() {
            for (ck, &w) in r_i.iter().enumerate() {
                for j in 0..d {
                    c[(ck, j)] += w * self.z_cos[(i, j)];
                }
            }
        }
        self.centroids = normalise_matrix_row_l2(c.as_ref());
    }

    /// Blockwise responsibility update with the diversity penalty
    fn update_r(&mut self, rng: &mut StdRng) {
        let n = self.r.len();
        let k = self.n_clusters();
        let sigma = self.params.sigma;
        let theta = self.params.theta;

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);
        let block = ((n as f64 * self.params.block_size).ceil() as usize).max(1);

        for chunk in order.chunks(block) {
            for &i in chunk {
                let b = self.batches[i];
                for ck in 0..k {
                    self.o[ck][b] -= self.r[i][ck];
                    self.n_k[ck] -= self.r[i][ck];
                }
            }
            self.refresh_expected();

            let new_rows: Vec<(usize, Vec<f64>)> = chunk
                .par_iter()
                .map(|&i| {
                    let b = self.batches[i];
                    let d = &self.dist[i];
                    let d_min = d.iter().copied().fold(f64::INFINITY, f64::min);
                    let raw: Vec<f64> = (0..k)
                        .map(|ck| {
                            let penalty = ((self.e[ck][b] + 1.0) / (self.o[ck][b].max(0.0) + 1.0))
                                .powf(theta);
                            (-(d[ck] - d_min) / sigma).exp() * penalty
                        })
                        .collect();
                    let total: f64 = raw.iter().sum();
                    (i, raw.into_iter().map(|x| x / total).collect())
                })
                .collect();

            for (i, row) in new_rows {
                let b = self.batches[i];
                for ck in 0..k {
                    self.o[ck][b] += row[ck];
                    self.n_k[ck] += row[ck];
                }
                self.r[i] = row;
            }
        }

        self.compute_o_e();
    }

    /// k-means error + entropy + diversity penalty
    fn objective(&self) -> f64 {
        let sigma = self.params.sigma;
        let theta = self.params.theta;

        let (kmeans, entropy) = self
            .r
            .par_iter()
            .zip(self.dist.par_iter())
            .map(|(r_i, d_i)| {
                r_i.iter().zip(d_i.iter()).fold((0.0, 0.0), |(km, en), (&r, &d)| {
                    let en_add = if r > 0.0 { r * r.ln() } else { 0.0 };
                    (km + r * d, en + en_add)
                })
            })
            .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));

        let mut diversity = 0.0;
        for (o_k, e_k) in self.o.iter().zip(self.e.iter()) {
            for (&o, &e) in o_k.iter().zip(e_k.iter()) {
                let o = o.max(0.0);
                diversity += o * ((o + 1.0) / (e + 1.0)).ln();
            }
        }

        kmeans + sigma * entropy + sigma * theta * diversity
    }

    /// Soft k-means rounds until the objective stabilises
    fn cluster(&mut self, rng: &mut StdRng) -> f64 {
        let mut prev = self.objective();
        for _ in 0..self.params.max_iter_cluster {
            self.update_centroids();
            self.compute_dist();
            self.update_r(rng);
            let obj = self.objective();
            let change = (prev - obj).abs() / prev.abs().max(1e-12);
            prev = obj;
            if change < self.params.epsilon_cluster {
                break;
            }
        }
        prev
    }

    /// Per cluster and batch ridge-shrunk centroid correction of the original
    /// embedding
    fn correct(&self, z_orig: MatRef<f64>) -> Mat<f64> {
        let k = self.n_clusters();
        let n_batches = self.pr_b.len();
        let d = z_orig.ncols();
        let lambda = self.params.lambda;

        let mut sums = vec![vec![vec![0.0; d]; n_batches]; k];
        for (i, r_i) in self.r.iter().enumerate() {
            let b = self.batches[i];
            for (ck, &w) in r_i.iter().enumerate() {
                for j in 0..d {
                    sums[ck][b][j] += w * z_orig[(i, j)];
                }
            }
        }

        let w_kb: Vec<Vec<Vec<f64>>> = (0..k)
            .map(|ck| {
                let total: f64 = self.o[ck].iter().sum();
                let mu_k: Vec<f64> = (0..d)
                    .map(|j| {
                        if total > 0.0 {
                            (0..n_batches).map(|b| sums[ck][b][j]).sum::<f64>() / total
                        } else {
                            0.0
                        }
                    })
                    .collect();
                (0..n_batches)
                    .map(|b| {
                        let o = self.o[ck][b];
                        if o <= 1e-12 {
                            return vec![0.0; d];
                        }
                        let shrink = o / (o + lambda);
                        (0..d)
                            .map(|j| shrink * (sums[ck][b][j] / o - mu_k[j]))
                            .collect()
                    })
                    .collect()
            })
            .collect();

        let rows: Vec<Vec<f64>> = (0..z_orig.nrows())
            .into_par_iter()
            .map(|i| {
                let b = self.batches[i];
                (0..d)
                    .map(|j| {
                        let shift: f64 = (0..k).map(|ck| self.r[i][ck] * w_kb[ck][b][j]).sum();
                        z_orig[(i, j)] - shift
                    })
                    .collect()
            })
            .collect();

        Mat::from_fn(z_orig.nrows(), d, |i, j| rows[i][j])
    }
}

/// Half of the mean L1 change of the responsibilities per cell
fn assignment_change(old: &[Vec<f64>], new: &[Vec<f64>]) -> f64 {
    if old.is_empty() {
        return 0.0;
    }
    let total: f64 = old
        .iter()
        .zip(new.iter())
        .map(|(a, b)| a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum::<f64>())
        .sum();
    total / (2.0 * old.len() as f64)
}

////////////////////
// Main functions //
////////////////////

/// Run Harmony-style batch correction
///
/// Soft k-means on the cosine-normalised embedding with a penalty that
/// favours batch-diverse clusters, followed by a ridge-shrunk per cluster
/// and batch centroid correction of the original coordinates. Repeats
/// until the configured criterion is met.
///
/// ### Params
///
/// * `embedding` - Cells x dimensions (only the first `params.dims` are
///   used).
/// * `batches` - Batch label per cell.
/// * `params` - The `HarmonyParams`.
///
/// ### Returns
///
/// The `HarmonyResult`. A single batch is returned unchanged.
pub fn run_harmony(
    embedding: MatRef<f64>,
    batches: &[usize],
    params: &HarmonyParams,
) -> Result<HarmonyResult> {
    let start = Instant::now();
    let n = embedding.nrows();
    crate::ensure_dims!("batch labels vs. embedding rows", n, batches.len());
    if n == 0 {
        return Err(ScError::InputFormat(
            "batch correction on an empty embedding".to_string(),
        ));
    }

    let dims = params.dims.min(embedding.ncols()).max(1);
    let z_orig = embedding.submatrix(0, 0, n, dims).to_owned();
    let (batches, n_batches) = dense_batches(batches);

    if n_batches < 2 {
        log::info!("Single batch; embedding returned without correction");
        return Ok(HarmonyResult {
            corrected: z_orig,
            n_iter: 0,
            converged: true,
            objective_trace: Vec::new(),
            warnings: Vec::new(),
        });
    }

    let k = params
        .n_clusters
        .unwrap_or_else(|| ((n as f64 / 30.0).round() as usize).min(100))
        .clamp(1, n);
    let threshold = params
        .convergence_threshold
        .unwrap_or_else(|| params.convergence.default_threshold());

    let mut rng = StdRng::seed_from_u64(params.seed);
    let z_cos = normalise_matrix_row_l2(z_orig.as_ref());
    let centroids = kmeans_init(z_cos.as_ref(), k, &mut rng);
    let mut state = HarmonyState::new(z_cos, centroids, &batches, n_batches, params);

    let mut corrected = z_orig.clone();
    let mut objective_trace = Vec::with_capacity(params.max_iter);
    let mut prev_r = state.r.clone();
    let mut prev_obj = state.objective();
    let mut converged = false;
    let mut n_iter = 0;

    for iter in 1..=params.max_iter {
        let obj = state.cluster(&mut rng);
        corrected = state.correct(z_orig.as_ref());
        state.z_cos = normalise_matrix_row_l2(corrected.as_ref());
        objective_trace.push(obj);
        n_iter = iter;

        let delta = match params.convergence {
            HarmonyConvergence::AssignmentChange => assignment_change(&prev_r, &state.r),
            HarmonyConvergence::ObjectiveChange => {
                (prev_obj - obj).abs() / prev_obj.abs().max(1e-12)
            }
        };
        log::debug!(
            "Harmony iteration {}: objective {:.4}, change {:.2e}",
            iter,
            obj,
            delta
        );

        if delta < threshold {
            converged = true;
            break;
        }
        prev_r.clone_from(&state.r);
        prev_obj = obj;
    }

    let mut warnings = Vec::new();
    if !converged {
        let warning = PipelineWarning::ConvergenceFailure {
            stage: "harmony".to_string(),
            iterations: n_iter,
        };
        log::warn!("{}", warning);
        warnings.push(warning);
    }

    log::info!(
        "Harmony on {} cells, {} batches, {} clusters: {} iterations in {:.2?}",
        n,
        n_batches,
        k,
        n_iter,
        start.elapsed()
    );

    Ok(HarmonyResult {
        corrected,
        n_iter,
        converged,
        objective_trace,
        warnings,
    })
}

/// Batch correct an embedding into a new `Embedding("harmony")`
///
/// ### Params
///
/// * `embedding` - The source embedding (usually PCA).
/// * `batches` - Batch label per cell.
/// * `params` - The `HarmonyParams`.
///
/// ### Returns
///
/// The corrected embedding with the convergence warnings attached.
pub fn harmonise_embedding(
    embedding: &Embedding,
    batches: &[usize],
    params: &HarmonyParams,
) -> Result<Embedding> {
    let res = run_harmony(embedding.coords.as_ref(), batches, params)?;
    Ok(Embedding {
        name: "harmony".to_string(),
        method: "harmony".to_string(),
        parent: Some(embedding.name.clone()),
        cell_ids: embedding.cell_ids.clone(),
        coords: res.corrected,
        stdev: None,
        loadings: None,
        warnings: res.warnings,
    })
}

/////////////////////
// Mixing metrics  //
/////////////////////

/// Mean fraction of each cell's k nearest neighbours from the same batch
///
/// ### Params
///
/// * `embedding` - Cells x dimensions.
/// * `batches` - Batch label per cell.
/// * `k` - Number of neighbours.
///
/// ### Returns
///
/// Value in `[0, 1]`; lower values indicate better mixing.
pub fn same_batch_neighbour_fraction(
    embedding: MatRef<f64>,
    batches: &[usize],
    k: usize,
) -> Result<f64> {
    crate::ensure_dims!("batch labels vs. embedding rows", embedding.nrows(), batches.len());
    let knn = generate_knn_exact(embedding, k);

    let fractions: Vec<f64> = knn
        .par_iter()
        .enumerate()
        .filter(|(_, nn)| !nn.is_empty())
        .map(|(i, nn)| {
            nn.iter().filter(|&&j| batches[j] == batches[i]).count() as f64 / nn.len() as f64
        })
        .collect();

    if fractions.is_empty() {
        return Ok(0.0);
    }
    Ok(fractions.iter().sum::<f64>() / fractions.len() as f64)
}

/// Calculate kBET-based mixing scores on kNN data
///
/// ### Params
///
/// * `knn_data` - kNN indices per cell.
/// * `batches` - Batch label per cell.
///
/// ### Return
///
/// Per-cell p-values of the chi-square test of the neighbourhood batch
/// composition against the global one. `Config` error with fewer than two
/// batches.
pub fn kbet(knn_data: &[Vec<usize>], batches: &[usize]) -> Result<Vec<f64>> {
    crate::ensure_dims!("batch labels vs. kNN rows", knn_data.len(), batches.len());

    let mut batch_counts: FxHashMap<usize, usize> = FxHashMap::default();
    for &batch in batches {
        *batch_counts.entry(batch).or_insert(0) += 1;
    }
    if batch_counts.len() < 2 {
        return Err(ScError::Config(
            "kBET needs at least two batches".to_string(),
        ));
    }
    let total = batches.len() as f64;
    let mut batch_ids: Vec<usize> = batch_counts.keys().copied().collect();
    batch_ids.sort_unstable();
    let dof = (batch_ids.len() - 1) as f64;
    let chi = ChiSquared::new(dof).map_err(|e| ScError::Numerical(e.to_string()))?;

    Ok(knn_data
        .par_iter()
        .map(|neighbours| {
            if neighbours.is_empty() {
                return 1.0;
            }
            let k = neighbours.len() as f64;
            let mut neighbours_count: FxHashMap<usize, usize> = FxHashMap::default();
            for &neighbour_idx in neighbours {
                *neighbours_count.entry(batches[neighbour_idx]).or_insert(0) += 1;
            }

            let chi_square: f64 = batch_ids
                .iter()
                .map(|batch_id| {
                    let expected = k * (batch_counts[batch_id] as f64 / total);
                    let observed = *neighbours_count.get(batch_id).unwrap_or(&0) as f64;
                    (observed - expected).powi(2) / expected
                })
                .sum();

            chi.sf(chi_square)
        })
        .collect())
}

/// Fraction of cells whose kBET test is not rejected at `alpha`
pub fn kbet_acceptance_rate(pvals: &[f64], alpha: f64) -> f64 {
    if pvals.is_empty() {
        return 1.0;
    }
    pvals.iter().filter(|&&p| p >= alpha).count() as f64 / pvals.len() as f64
}

///////////
// Tests //
///////////
