use statrs::distribution::{Continuous, ContinuousCDF, Normal};

////////////////
// Structures //
////////////////

/// Ranks of one sparse column
///
/// ### Fields
///
/// * `ranks` - Average ranks of the stored (non-zero) values, in input order.
/// * `zero_rank` - Average rank shared by all implicit zeros.
/// * `tie_sum` - Sum of `t^3 - t` over all tie groups (zeros included).
#[derive(Clone, Debug)]
pub struct SparseRanks {
    pub ranks: Vec<f64>,
    pub zero_rank: f64,
    pub tie_sum: f64,
}

///////////////
// Functions //
///////////////

/// Generate the rank of a vector with tie correction.
///
/// ### Params
///
/// * `vec` - The slice of numericals to rank.
///
/// ### Returns
///
/// Tuple of `(average ranks, sum of t^3 - t over the tie groups)`.
pub fn rank_vector(vec: &[f64]) -> (Vec<f64>, f64) {
    let n = vec.len();
    if n == 0 {
        return (Vec::new(), 0.0);
    }

    let mut indexed_values: Vec<(f64, usize)> =
        vec.iter().copied().enumerate().map(|(i, v)| (v, i)).collect();
    indexed_values.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

    let mut ranks = vec![0.0; n];
    let mut tie_sum = 0.0;
    let mut i = 0;
    while i < n {
        let current_value = indexed_values[i].0;
        let start = i;
        while i < n && indexed_values[i].0 == current_value {
            i += 1;
        }
        let avg_rank = (start + i + 1) as f64 / 2.0;
        for j in start..i {
            ranks[indexed_values[j].1] = avg_rank;
        }
        let t = (i - start) as f64;
        tie_sum += t * t * t - t;
    }

    (ranks, tie_sum)
}

/// Rank a sparse column of non-negative values
///
/// All implicit zeros form one tie group at the bottom.
///
/// ### Params
///
/// * `non_zero` - The stored values (all > 0).
/// * `n_total` - Length of the full column (zeros included).
///
/// ### Returns
///
/// The `SparseRanks`.
pub fn rank_sparse_column(non_zero: &[f64], n_total: usize) -> SparseRanks {
    let n_zero = n_total - non_zero.len();
    let (mut ranks, mut tie_sum) = rank_vector(non_zero);

    for r in ranks.iter_mut() {
        *r += n_zero as f64;
    }

    let z = n_zero as f64;
    tie_sum += z * z * z - z;

    SparseRanks {
        ranks,
        zero_rank: (n_zero as f64 + 1.0) / 2.0,
        tie_sum,
    }
}

/// Wilcoxon rank-sum (Mann-Whitney) z statistic
///
/// Uses the normal approximation with tie and continuity correction.
///
/// ### Params
///
/// * `rank_sum` - Sum of the ranks of the first group.
/// * `n1` - Size of the first group.
/// * `n2` - Size of the second group.
/// * `tie_sum` - Sum of `t^3 - t` over all tie groups of the pooled data.
///
/// ### Returns
///
/// The z score; positive values indicate larger values in the first group.
/// Returns 0 when the variance vanishes (e.g. all values tied).
pub fn wilcoxon_z(rank_sum: f64, n1: usize, n2: usize, tie_sum: f64) -> f64 {
    let (n1, n2) = (n1 as f64, n2 as f64);
    let n = n1 + n2;
    if n1 == 0.0 || n2 == 0.0 {
        return 0.0;
    }

    let u1 = rank_sum - n1 * (n1 + 1.0) / 2.0;
    let mean = n1 * n2 / 2.0;
    let variance = n1 * n2 / 12.0 * ((n + 1.0) - tie_sum / (n * (n - 1.0)));

    if variance <= 0.0 {
        return 0.0;
    }

    let diff = u1 - mean;
    let correction = if diff > 0.0 {
        0.5
    } else if diff < 0.0 {
        -0.5
    } else {
        0.0
    };

    (diff - correction) / variance.sqrt()
}

/// Transform a Z-score into a two-sided p-value (assuming normality).
///
/// Uses an asymptotic tail expansion for `|z| > 6`.
///
/// ### Params
///
/// * `z` - The Z score
///
/// ### Returns
///
/// The two-sided p-value
pub fn z_score_to_pval(z: f64) -> f64 {
    let normal = Normal::standard();
    let abs_z = z.abs();
    if abs_z > 6.0 {
        let pdf = normal.pdf(abs_z);
        2.0 * pdf / abs_z * (1.0 - 1.0 / (abs_z * abs_z))
    } else {
        (2.0 * normal.sf(abs_z)).min(1.0)
    }
}

/// Bonferroni adjustment
///
/// ### Params
///
/// * `pval` - Raw p-value.
/// * `n_tests` - Number of tests performed.
///
/// ### Returns
///
/// `min(1, pval * n_tests)`
#[inline]
pub fn bonferroni(pval: f64, n_tests: usize) -> f64 {
    (pval * n_tests as f64).min(1.0)
}

/// Adjusted Rand index between two partitions
///
/// ### Params
///
/// * `a` - First labelling.
/// * `b` - Second labelling (same length).
///
/// ### Returns
///
/// The ARI; 1 for identical partitions (up to relabelling).
pub fn adjusted_rand_index(a: &[usize], b: &[usize]) -> f64 {
    let n = a.len();
    let na = a.iter().copied().max().map_or(0, |m| m + 1);
    let nb = b.iter().copied().max().map_or(0, |m| m + 1);

    let mut table = vec![vec![0_usize; nb]; na];
    for (&x, &y) in a.iter().zip(b.iter()) {
        table[x][y] += 1;
    }

    let comb2 = |x: usize| (x * x.saturating_sub(1)) as f64 / 2.0;

    let sum_ij: f64 = table.iter().flatten().map(|&v| comb2(v)).sum();
    let sum_a: f64 = table.iter().map(|row| comb2(row.iter().sum())).sum();
    let sum_b: f64 = (0..nb)
        .map(|j| comb2(table.iter().map(|row| row[j]).sum()))
        .sum();

    let total = comb2(n);
    if total == 0.0 {
        return 1.0;
    }
    let expected = sum_a * sum_b / total;
    let max_index = 0.5 * (sum_a + sum_b);

    if (max_index - expected).abs() < f64::EPSILON {
        return 1.0;
    }

    (sum_ij - expected) / (max_index - expected)
}

///////////
// Tests //
///////////
