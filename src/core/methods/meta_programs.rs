//! Consensus of NMF programs across samples and ranks into meta-programs.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::base::utils::cosine_similarity;
use crate::core::methods::nmf::NmfFactorisation;
use crate::error::{PipelineWarning, Result, ScError};

////////////
// Params //
////////////

/// Parameters for the meta-program consensus
///
/// ### Fields
///
/// * `n_meta_programs` - Number of meta-programs to cut the tree at.
/// * `weight_explained_cutoff` - Cumulative gene weight at which the gene
///   list of a meta-program is truncated.
/// * `max_program_genes` - Maximum genes per meta-program.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaProgramParams {
    pub n_meta_programs: usize,
    pub weight_explained_cutoff: f64,
    pub max_program_genes: usize,
}

impl Default for MetaProgramParams {
    fn default() -> Self {
        Self {
            n_meta_programs: 10,
            weight_explained_cutoff: 0.7,
            max_program_genes: 100,
        }
    }
}

////////////////
// Structures //
////////////////

/// One NMF component normalised to sum 1
///
/// ### Fields
///
/// * `sample` - Sample of the factorisation.
/// * `rank` - Rank of the factorisation.
/// * `component` - Column of `H`.
/// * `weights` - Gene weights, summing to 1.
#[derive(Clone, Debug)]
pub struct ProgramVector {
    pub sample: String,
    pub rank: usize,
    pub component: usize,
    pub weights: Vec<f64>,
}

/// A program recurring across samples
///
/// ### Fields
///
/// * `id` - Meta-program index; 0 has the most members.
/// * `genes` - `(gene, weight)` ordered by decreasing weight.
/// * `members` - `(sample, rank, component)` of every member program.
#[derive(Clone, Debug, Serialize)]
pub struct MetaProgram {
    pub id: usize,
    pub genes: Vec<(String, f64)>,
    pub members: Vec<(String, usize, usize)>,
}

/// Output of the consensus
#[derive(Clone, Debug, Default)]
pub struct MetaProgramSet {
    pub programs: Vec<MetaProgram>,
    pub warnings: Vec<PipelineWarning>,
}

/////////////
// Helpers //
/////////////

/// Extract the sum-normalised program vectors of all factorisations
///
/// ### Returns
///
/// Tuple of `(programs, warnings)`; all-zero components are dropped with a
/// `ProgramDropped` warning each.
pub fn program_vectors(
    factorisations: &[NmfFactorisation],
) -> (Vec<ProgramVector>, Vec<PipelineWarning>) {
    let mut programs = Vec::new();
    let mut warnings = Vec::new();
    for f in factorisations {
        for c in 0..f.h.ncols() {
            let total: f64 = f.h.col(c).iter().sum();
            if total <= 0.0 || !total.is_finite() {
                let warning = PipelineWarning::ProgramDropped {
                    sample: f.sample.clone(),
                    rank: f.rank,
                    component: c,
                };
                log::warn!("{}", warning);
                warnings.push(warning);
                continue;
            }
            programs.push(ProgramVector {
                sample: f.sample.clone(),
                rank: f.rank,
                component: c,
                weights: f.h.col(c).iter().map(|v| v / total).collect(),
            });
        }
    }
    (programs, warnings)
}

/// Average-linkage agglomerative clustering
///
/// ### Params
///
/// * `dist` - Symmetric distance matrix.
/// * `n_groups` - Number of groups to stop at.
///
/// ### Returns
///
/// Group label per item. Labels are the index of the group's smallest
/// member until relabelled by the caller.
pub fn average_linkage(dist: &[Vec<f64>], n_groups: usize) -> Vec<usize> {
    let n = dist.len();
    let n_groups = n_groups.clamp(1, n.max(1));

    let mut d: Vec<Vec<f64>> = dist.to_vec();
    let mut sizes = vec![1_usize; n];
    let mut active = vec![true; n];
    let mut owner: Vec<usize> = (0..n).collect();
    let mut n_active = n;

    while n_active > n_groups {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..n {
            if !active[i] {
                continue;
            }
            for j in (i + 1)..n {
                if !active[j] {
                    continue;
                }
                if best.map_or(true, |(_, _, bd)| d[i][j] < bd) {
                    best = Some((i, j, d[i][j]));
                }
            }
        }
        let Some((a, b, _)) = best else {
            break;
        };

        // merge b into a (Lance-Williams update for average linkage)
        let (na, nb) = (sizes[a] as f64, sizes[b] as f64);
        for k in 0..n {
            if !active[k] || k == a || k == b {
                continue;
            }
            let merged = (na * d[a][k] + nb * d[b][k]) / (na + nb);
            d[a][k] = merged;
            d[k][a] = merged;
        }
        sizes[a] += sizes[b];
        active[b] = false;
        for o in owner.iter_mut() {
            if *o == b {
                *o = a;
            }
        }
        n_active -= 1;
    }

    owner
}

/// Mean weight per gene over the members, truncated by cumulative weight
fn aggregate_genes(
    members: &[&ProgramVector],
    genes: &[String],
    params: &MetaProgramParams,
) -> Vec<(String, f64)> {
    let n_genes = genes.len();
    let n = members.len() as f64;
    let mean: Vec<f64> = (0..n_genes)
        .map(|g| members.iter().map(|p| p.weights[g]).sum::<f64>() / n)
        .collect();

    let mut order: Vec<usize> = (0..n_genes).filter(|&g| mean[g] > 0.0).collect();
    order.sort_by(|&a, &b| mean[b].total_cmp(&mean[a]).then(a.cmp(&b)));

    let mut res = Vec::new();
    let mut cumulative = 0.0;
    for g in order {
        if res.len() >= params.max_program_genes || cumulative >= params.weight_explained_cutoff {
            break;
        }
        cumulative += mean[g];
        res.push((genes[g].clone(), mean[g]));
    }
    res
}

////////////////////
// Main functions //
////////////////////

/// Build meta-programs from the NMF factorisations
///
/// Programs (columns of every `H`) are normalised to sum 1, compared via
/// cosine similarity and grouped by average-linkage clustering on `1 -
/// cosine`, cut at `min(n_meta_programs, n_programs)` groups. Groups are
/// ordered by member count.
///
/// ### Params
///
/// * `factorisations` - Successful factorisations (all over the same genes).
/// * `genes` - Gene identifiers of the rows of `H`.
/// * `params` - The `MetaProgramParams`.
///
/// ### Returns
///
/// The `MetaProgramSet`.
pub fn build_meta_programs(
    factorisations: &[NmfFactorisation],
    genes: &[String],
    params: &MetaProgramParams,
) -> Result<MetaProgramSet> {
    let start = Instant::now();
    if params.n_meta_programs == 0 {
        return Err(ScError::Config(
            "n_meta_programs must be at least 1".to_string(),
        ));
    }
    for f in factorisations {
        crate::ensure_dims!(
            format!("program genes of sample '{}'", f.sample),
            genes.len(),
            f.h.nrows()
        );
    }

    let (programs, warnings) = program_vectors(factorisations);
    if programs.is_empty() {
        log::warn!("No NMF programs available; no meta-programs built");
        return Ok(MetaProgramSet {
            programs: Vec::new(),
            warnings,
        });
    }

    let n = programs.len();
    let dist: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            (0..n)
                .map(|j| {
                    if i == j {
                        0.0
                    } else {
                        1.0 - cosine_similarity(&programs[i].weights, &programs[j].weights)
                    }
                })
                .collect()
        })
        .collect();

    let n_groups = params.n_meta_programs.min(n);
    let owner = average_linkage(&dist, n_groups);

    let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
    for (i, &o) in owner.iter().enumerate() {
        match groups.iter_mut().find(|(id, _)| *id == o) {
            Some((_, members)) => members.push(i),
            None => groups.push((o, vec![i])),
        }
    }
    groups.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.1[0].cmp(&b.1[0])));

    let meta: Vec<MetaProgram> = groups
        .iter()
        .enumerate()
        .map(|(id, (_, members))| {
            let member_vecs: Vec<&ProgramVector> = members.iter().map(|&i| &programs[i]).collect();
            MetaProgram {
                id,
                genes: aggregate_genes(&member_vecs, genes, params),
                members: member_vecs
                    .iter()
                    .map(|p| (p.sample.clone(), p.rank, p.component))
                    .collect(),
            }
        })
        .collect();

    log::info!(
        "Built {} meta-programs from {} programs in {:.2?}",
        meta.len(),
        n,
        start.elapsed()
    );

    Ok(MetaProgramSet {
        programs: meta,
        warnings,
    })
}

///////////
// Tests //
///////////
