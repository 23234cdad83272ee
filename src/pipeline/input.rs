use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use std::time::Instant;

use crate::core::data::sparse_structures::CompressedSparseData;
use crate::error::{Result, ScError};
use crate::single_cell::matrix_store::{MatrixStore, SampleCounts};

/// One row of the long-format count table
#[derive(Debug, Deserialize)]
struct CountRecord {
    cell: String,
    sample: String,
    gene: String,
    count: u32,
}

/// Read a long-format count table (`cell,sample,gene,count`) from a reader
///
/// Genes are ordered by first appearance over the whole table and shared
/// by all samples; samples and cells keep their order of first appearance.
/// Repeated `(cell, gene)` pairs are summed.
///
/// ### Params
///
/// * `reader` - Source of the CSV data (with header).
/// * `mito_prefix` - Prefix of mitochondrial gene ids.
///
/// ### Returns
///
/// The concatenated `MatrixStore`.
pub fn read_long_counts<R: Read>(reader: R, mito_prefix: &str) -> Result<MatrixStore> {
    let start = Instant::now();
    let mut rdr = csv::Reader::from_reader(reader);

    let mut gene_index: FxHashMap<String, usize> = FxHashMap::default();
    let mut genes: Vec<String> = Vec::new();
    let mut sample_index: FxHashMap<String, usize> = FxHashMap::default();
    let mut samples: Vec<(String, Vec<String>, FxHashMap<String, usize>)> = Vec::new();
    // per sample: per cell sparse entries
    let mut entries: Vec<Vec<FxHashMap<usize, u32>>> = Vec::new();

    for record in rdr.deserialize() {
        let record: CountRecord = record?;
        if record.cell.is_empty() || record.sample.is_empty() || record.gene.is_empty() {
            return Err(ScError::InputFormat(
                "count table contains empty cell, sample or gene fields".to_string(),
            ));
        }

        let g = match gene_index.get(&record.gene) {
            Some(&g) => g,
            None => {
                gene_index.insert(record.gene.clone(), genes.len());
                genes.push(record.gene.clone());
                genes.len() - 1
            }
        };
        let s = match sample_index.get(&record.sample) {
            Some(&s) => s,
            None => {
                sample_index.insert(record.sample.clone(), samples.len());
                samples.push((record.sample.clone(), Vec::new(), FxHashMap::default()));
                entries.push(Vec::new());
                samples.len() - 1
            }
        };
        let (_, barcodes, cell_index) = &mut samples[s];
        let c = match cell_index.get(&record.cell) {
            Some(&c) => c,
            None => {
                cell_index.insert(record.cell.clone(), barcodes.len());
                barcodes.push(record.cell.clone());
                entries[s].push(FxHashMap::default());
                barcodes.len() - 1
            }
        };
        if record.count > 0 {
            *entries[s][c].entry(g).or_insert(0) += record.count;
        }
    }

    if samples.is_empty() {
        return Err(ScError::InputFormat("count table has no records".to_string()));
    }

    let n_genes = genes.len();
    let mut sample_counts = Vec::with_capacity(samples.len());
    for ((name, barcodes, _), cells) in samples.into_iter().zip(entries) {
        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = vec![0];
        for cell in cells {
            let mut row: Vec<(usize, u32)> = cell.into_iter().collect();
            row.sort_unstable_by_key(|(g, _)| *g);
            for (g, v) in row {
                indices.push(g);
                data.push(v);
            }
            indptr.push(data.len());
        }
        let counts = CompressedSparseData::new_csr(data, indices, indptr, (barcodes.len(), n_genes))?;
        sample_counts.push(SampleCounts {
            name,
            barcodes,
            genes: genes.clone(),
            counts,
        });
    }

    let store = MatrixStore::from_samples(sample_counts, mito_prefix)?;
    log::info!(
        "Loaded {} cells x {} genes in {:.2?}",
        store.n_cells(),
        store.n_genes(),
        start.elapsed()
    );
    Ok(store)
}

/// Read a long-format count table from a file
pub fn read_long_counts_file(path: &Path, mito_prefix: &str) -> Result<MatrixStore> {
    let file = std::fs::File::open(path)?;
    read_long_counts(std::io::BufReader::new(file), mito_prefix)
}

/// Read cluster labels, one per line (empty lines ignored)
pub fn read_labels_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_table_to_store() {
        let csv = "cell,sample,gene,count\n\
                   AAA,s1,CD3E,4\n\
                   AAA,s1,MT-CO1,1\n\
                   CCC,s1,CD3E,2\n\
                   AAA,s2,MS4A1,7\n\
                   AAA,s1,CD3E,1\n";
        let store = read_long_counts(csv.as_bytes(), "MT-").unwrap();

        assert_eq!(store.n_cells(), 3);
        assert_eq!(store.genes(), &["CD3E", "MT-CO1", "MS4A1"]);
        assert_eq!(store.cells().ids, vec!["s1_AAA", "s1_CCC", "s2_AAA"]);
        assert_eq!(store.cells().total_counts, vec![6, 2, 7]);

        let dense = store.counts().to_dense();
        assert_eq!(dense[(0, 0)], 5.0);
        assert_eq!(dense[(2, 2)], 7.0);
        assert!((store.cells().mito_fraction[0] - 1.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_bad_tables() {
        let empty = "cell,sample,gene,count\n";
        assert!(matches!(
            read_long_counts(empty.as_bytes(), "MT-"),
            Err(ScError::InputFormat(_))
        ));
        let bad_count = "cell,sample,gene,count\nA,s,G,-3\n";
        assert!(matches!(
            read_long_counts(bad_count.as_bytes(), "MT-"),
            Err(ScError::Csv(_))
        ));
    }
}
