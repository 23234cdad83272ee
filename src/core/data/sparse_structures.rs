use faer::Mat;
use rayon::prelude::*;

use crate::error::{Result, ScError};

///////////
// Enums //
///////////

/// Orientation of the compressed sparse data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressedSparseFormat {
    /// Compressed sparse rows (rows = outer dimension)
    Csr,
    /// Compressed sparse columns (columns = outer dimension)
    Csc,
}

////////////////
// Structures //
////////////////

/// Structure for compressed sparse data (CSR or CSC)
///
/// ### Fields
///
/// * `data` - The non-zero values.
/// * `indices` - Inner indices of the values (columns for CSR, rows for CSC).
/// * `indptr` - Offsets of each outer slice into `data` / `indices`.
/// * `cs_type` - Whether this is CSR or CSC.
/// * `shape` - `(nrow, ncol)` of the matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressedSparseData<T> {
    pub data: Vec<T>,
    pub indices: Vec<usize>,
    pub indptr: Vec<usize>,
    pub cs_type: CompressedSparseFormat,
    pub shape: (usize, usize),
}

impl<T> CompressedSparseData<T>
where
    T: Copy + Send + Sync,
{
    /// Generate new CSR data and check its consistency
    ///
    /// ### Params
    ///
    /// * `data` - The non-zero values.
    /// * `indices` - The column indices.
    /// * `indptr` - The row pointers.
    /// * `shape` - `(nrow, ncol)`.
    ///
    /// ### Returns
    ///
    /// The validated CSR data or an `InputFormat` error.
    pub fn new_csr(
        data: Vec<T>,
        indices: Vec<usize>,
        indptr: Vec<usize>,
        shape: (usize, usize),
    ) -> Result<Self> {
        let res = Self {
            data,
            indices,
            indptr,
            cs_type: CompressedSparseFormat::Csr,
            shape,
        };
        res.validate()?;
        Ok(res)
    }

    /// Build CSR data from dense rows, skipping entries equal to `zero`
    pub fn from_dense_rows(rows: &[Vec<T>], ncol: usize, zero: T) -> Result<Self>
    where
        T: PartialEq,
    {
        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = Vec::with_capacity(rows.len() + 1);
        indptr.push(0);

        for (row_idx, row) in rows.iter().enumerate() {
            if row.len() != ncol {
                return Err(ScError::DimensionMismatch {
                    what: format!("dense row {}", row_idx),
                    expected: ncol,
                    found: row.len(),
                });
            }
            for (col_idx, &val) in row.iter().enumerate() {
                if val != zero {
                    data.push(val);
                    indices.push(col_idx);
                }
            }
            indptr.push(data.len());
        }

        Self::new_csr(data, indices, indptr, (rows.len(), ncol))
    }

    /// Number of outer slices (rows for CSR, columns for CSC)
    pub fn outer_dim(&self) -> usize {
        match self.cs_type {
            CompressedSparseFormat::Csr => self.shape.0,
            CompressedSparseFormat::Csc => self.shape.1,
        }
    }

    /// Size of the inner dimension
    pub fn inner_dim(&self) -> usize {
        match self.cs_type {
            CompressedSparseFormat::Csr => self.shape.1,
            CompressedSparseFormat::Csc => self.shape.0,
        }
    }

    /// Return the total number of NNZ values in the data
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Get the inner indices and values of one outer slice
    ///
    /// ### Params
    ///
    /// * `i` - Index of the row (CSR) or column (CSC).
    ///
    /// ### Returns
    ///
    /// Tuple of `(indices, values)`.
    #[inline]
    pub fn outer(&self, i: usize) -> (&[usize], &[T]) {
        let start = self.indptr[i];
        let end = self.indptr[i + 1];
        (&self.indices[start..end], &self.data[start..end])
    }

    /// Check the internal consistency of the compressed data
    ///
    /// Pointers must start at 0, be monotone and end at the number of
    /// non-zeroes; inner indices must be in range and strictly increasing
    /// within every outer slice.
    pub fn validate(&self) -> Result<()> {
        let outer = self.outer_dim();
        let inner = self.inner_dim();

        if self.indptr.len() != outer + 1 {
            return Err(ScError::DimensionMismatch {
                what: "index pointer length".to_string(),
                expected: outer + 1,
                found: self.indptr.len(),
            });
        }
        if self.data.len() != self.indices.len() {
            return Err(ScError::DimensionMismatch {
                what: "sparse data vs. indices".to_string(),
                expected: self.indices.len(),
                found: self.data.len(),
            });
        }
        if self.indptr[0] != 0 || self.indptr[outer] != self.data.len() {
            return Err(ScError::InputFormat(
                "index pointers must start at 0 and end at the number of non-zero values"
                    .to_string(),
            ));
        }

        for i in 0..outer {
            let (start, end) = (self.indptr[i], self.indptr[i + 1]);
            if start > end {
                return Err(ScError::InputFormat(format!(
                    "index pointers are not monotone at slice {}",
                    i
                )));
            }
            let idx = &self.indices[start..end];
            for (pos, &j) in idx.iter().enumerate() {
                if j >= inner {
                    return Err(ScError::InputFormat(format!(
                        "inner index {} out of bounds ({}) in slice {}",
                        j, inner, i
                    )));
                }
                if pos > 0 && idx[pos - 1] >= j {
                    return Err(ScError::InputFormat(format!(
                        "inner indices not strictly increasing in slice {}",
                        i
                    )));
                }
            }
        }

        Ok(())
    }

    /// Switch between CSR and CSC
    ///
    /// The matrix stays the same; only the compression direction changes.
    ///
    /// ### Returns
    ///
    /// The same matrix compressed along the other dimension.
    pub fn transform_format(&self) -> Self {
        let outer = self.outer_dim();
        let inner = self.inner_dim();

        let mut counts = vec![0_usize; inner + 1];
        for &j in &self.indices {
            counts[j + 1] += 1;
        }
        for j in 0..inner {
            counts[j + 1] += counts[j];
        }

        let indptr = counts.clone();
        let mut next = counts;
        let mut indices = vec![0_usize; self.nnz()];
        let mut data: Vec<T> = self.data.clone();

        for i in 0..outer {
            let (idx, vals) = self.outer(i);
            for (&j, &v) in idx.iter().zip(vals.iter()) {
                let pos = next[j];
                indices[pos] = i;
                data[pos] = v;
                next[j] += 1;
            }
        }

        let cs_type = match self.cs_type {
            CompressedSparseFormat::Csr => CompressedSparseFormat::Csc,
            CompressedSparseFormat::Csc => CompressedSparseFormat::Csr,
        };

        Self {
            data,
            indices,
            indptr,
            cs_type,
            shape: self.shape,
        }
    }

    /// Subset the outer dimension (rows for CSR)
    ///
    /// ### Params
    ///
    /// * `keep` - Outer indices to keep, in the order of the output.
    pub fn select_outer(&self, keep: &[usize]) -> Self {
        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = Vec::with_capacity(keep.len() + 1);
        indptr.push(0);

        for &i in keep {
            let (idx, vals) = self.outer(i);
            indices.extend_from_slice(idx);
            data.extend_from_slice(vals);
            indptr.push(data.len());
        }

        let shape = match self.cs_type {
            CompressedSparseFormat::Csr => (keep.len(), self.shape.1),
            CompressedSparseFormat::Csc => (self.shape.0, keep.len()),
        };

        Self {
            data,
            indices,
            indptr,
            cs_type: self.cs_type,
            shape,
        }
    }

    /// Subset the inner dimension (columns for CSR)
    ///
    /// ### Params
    ///
    /// * `keep` - Inner indices to keep; the position in this slice becomes
    ///   the new inner index. Must not contain duplicates.
    pub fn select_inner(&self, keep: &[usize]) -> Self {
        let mut remap = vec![usize::MAX; self.inner_dim()];
        for (new_idx, &old_idx) in keep.iter().enumerate() {
            remap[old_idx] = new_idx;
        }

        let slices: Vec<Vec<(usize, T)>> = (0..self.outer_dim())
            .into_par_iter()
            .map(|i| {
                let (idx, vals) = self.outer(i);
                let mut slice: Vec<(usize, T)> = idx
                    .iter()
                    .zip(vals.iter())
                    .filter(|(&j, _)| remap[j] != usize::MAX)
                    .map(|(&j, &v)| (remap[j], v))
                    .collect();
                slice.sort_unstable_by_key(|(j, _)| *j);
                slice
            })
            .collect();

        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = Vec::with_capacity(slices.len() + 1);
        indptr.push(0);
        for slice in slices {
            for (j, v) in slice {
                indices.push(j);
                data.push(v);
            }
            indptr.push(data.len());
        }

        let shape = match self.cs_type {
            CompressedSparseFormat::Csr => (self.shape.0, keep.len()),
            CompressedSparseFormat::Csc => (keep.len(), self.shape.1),
        };

        Self {
            data,
            indices,
            indptr,
            cs_type: self.cs_type,
            shape,
        }
    }

    /// Apply a function to every stored value
    pub fn map_values<U, F>(&self, f: F) -> CompressedSparseData<U>
    where
        U: Copy + Send + Sync,
        F: Fn(T) -> U,
    {
        CompressedSparseData {
            data: self.data.iter().map(|&v| f(v)).collect(),
            indices: self.indices.clone(),
            indptr: self.indptr.clone(),
            cs_type: self.cs_type,
            shape: self.shape,
        }
    }

    /// Remove stored entries for which `is_zero` holds
    ///
    /// ### Params
    ///
    /// * `is_zero` - Predicate marking explicitly stored zeroes.
    ///
    /// ### Returns
    ///
    /// The pruned data with the same shape and format.
    pub fn drop_stored<F>(&self, is_zero: F) -> Self
    where
        F: Fn(T) -> bool,
    {
        let mut data = Vec::with_capacity(self.data.len());
        let mut indices = Vec::with_capacity(self.indices.len());
        let mut indptr = Vec::with_capacity(self.indptr.len());
        indptr.push(0);

        for i in 0..self.outer_dim() {
            let (idx, vals) = self.outer(i);
            for (&j, &v) in idx.iter().zip(vals.iter()) {
                if !is_zero(v) {
                    data.push(v);
                    indices.push(j);
                }
            }
            indptr.push(data.len());
        }

        Self {
            data,
            indices,
            indptr,
            cs_type: self.cs_type,
            shape: self.shape,
        }
    }

    /// To a dense faer matrix
    ///
    /// Only meant for the small dense submatrices (selected features) and
    /// tests.
    pub fn to_dense(&self) -> Mat<f64>
    where
        T: Into<f64>,
    {
        let mut dense = Mat::zeros(self.shape.0, self.shape.1);
        for i in 0..self.outer_dim() {
            let (idx, vals) = self.outer(i);
            for (&j, &v) in idx.iter().zip(vals.iter()) {
                match self.cs_type {
                    CompressedSparseFormat::Csr => dense[(i, j)] = v.into(),
                    CompressedSparseFormat::Csc => dense[(j, i)] = v.into(),
                }
            }
        }
        dense
    }
}

/// Multiply the outer slices of sparse data with a dense matrix
///
/// For CSR data (n x m) and a dense matrix (m x k) this is `X * D`; for CSC
/// data it computes `X^T * D` with D being (n x k). Parallelised over the
/// outer slices.
///
/// ### Params
///
/// * `x` - The sparse data.
/// * `dense` - Dense factor with `x.inner_dim()` rows.
///
/// ### Returns
///
/// Dense matrix with `x.outer_dim()` rows.
pub fn sparse_outer_times_dense(x: &CompressedSparseData<f64>, dense: &Mat<f64>) -> Mat<f64> {
    let k = dense.ncols();
    let rows: Vec<Vec<f64>> = (0..x.outer_dim())
        .into_par_iter()
        .map(|i| {
            let mut acc = vec![0.0; k];
            let (idx, vals) = x.outer(i);
            for (&j, &v) in idx.iter().zip(vals.iter()) {
                for (c, a) in acc.iter_mut().enumerate() {
                    *a += v * dense[(j, c)];
                }
            }
            acc
        })
        .collect();

    Mat::from_fn(rows.len(), k, |i, c| rows[i][c])
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn small_matrix() -> CompressedSparseData<u32> {
        // [1, 0, 2]
        // [0, 0, 3]
        // [4, 5, 0]
        CompressedSparseData::from_dense_rows(
            &[vec![1, 0, 2], vec![0, 0, 3], vec![4, 5, 0]],
            3,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_from_dense_rows() {
        let csr = small_matrix();
        assert_eq!(csr.nnz(), 5);
        assert_eq!(csr.indptr, vec![0, 2, 3, 5]);
        assert_eq!(csr.indices, vec![0, 2, 2, 0, 1]);
    }

    #[test]
    fn test_validate_rejects_bad_indices() {
        let res = CompressedSparseData::new_csr(vec![1_u32, 2], vec![0, 3], vec![0, 1, 2], (2, 3));
        assert!(matches!(res, Err(ScError::InputFormat(_))));

        let res = CompressedSparseData::new_csr(vec![1_u32, 2], vec![1, 1], vec![0, 2, 2], (2, 3));
        assert!(matches!(res, Err(ScError::InputFormat(_))));

        let res = CompressedSparseData::new_csr(vec![1_u32], vec![1], vec![0, 1], (2, 3));
        assert!(matches!(res, Err(ScError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_transform_format() {
        let csr = small_matrix();
        let csc = csr.transform_format();

        assert_eq!(csc.cs_type, CompressedSparseFormat::Csc);
        assert_eq!(csc.indptr, vec![0, 2, 3, 5]);
        assert_eq!(csc.indices, vec![0, 2, 2, 0, 1]);
        assert_eq!(csc.data, vec![1, 4, 5, 2, 3]);
        assert!(csc.validate().is_ok());
        assert_eq!(csc.transform_format(), csr);
    }

    #[test]
    fn test_select_outer_and_inner() {
        let csr = small_matrix();

        let rows = csr.select_outer(&[2, 0]);
        assert_eq!(rows.shape, (2, 3));
        assert_eq!(rows.outer(0), (&[0_usize, 1][..], &[4_u32, 5][..]));

        let cols = csr.select_inner(&[2, 0]);
        assert_eq!(cols.shape, (3, 2));
        let dense = cols.to_dense();
        assert_eq!(dense[(0, 0)], 2.0);
        assert_eq!(dense[(0, 1)], 1.0);
        assert_eq!(dense[(1, 0)], 3.0);
        assert_eq!(dense[(2, 1)], 4.0);
        assert!(cols.validate().is_ok());
    }

    #[test]
    fn test_drop_stored_zeroes() {
        let csr =
            CompressedSparseData::new_csr(vec![1_u32, 0, 0, 3], vec![0, 2, 1, 2], vec![0, 2, 3, 4], (3, 3))
                .unwrap();
        let pruned = csr.drop_stored(|v| v == 0);

        assert_eq!(pruned.nnz(), 2);
        assert_eq!(pruned.indptr, vec![0, 1, 1, 2]);
        assert_eq!(pruned.indices, vec![0, 2]);
        assert!(pruned.validate().is_ok());
        assert_eq!(pruned.to_dense(), csr.to_dense());
    }

    #[test]
    fn test_sparse_times_dense() {
        let x = small_matrix().map_values(|v| v as f64);
        let d = Mat::from_fn(3, 1, |_, _| 1.0);

        let row_sums = sparse_outer_times_dense(&x, &d);
        assert_eq!(row_sums[(0, 0)], 3.0);
        assert_eq!(row_sums[(2, 0)], 9.0);

        let col_sums = sparse_outer_times_dense(&x.transform_format(), &d);
        assert_eq!(col_sums[(0, 0)], 5.0);
        assert_eq!(col_sums[(2, 0)], 5.0);
    }
}
