//! Ordered collection of multiply-imputed datasets.

use tracing::debug;

use crate::{
    data::records::RecordSet,
    error::{CausalError, Result},
};

/// M complete datasets sharing schema, row count and row order.
///
/// Row `i` of every dataset refers to the same patient; construction fails
/// otherwise, before any per-imputation work can start.
#[derive(Debug, Clone)]
pub struct ImputedDatasets {
    datasets: Vec<RecordSet>,
}

impl ImputedDatasets {
    pub fn new(datasets: Vec<RecordSet>) -> Result<Self> {
        let Some(first) = datasets.first() else {
            return Err(CausalError::InconsistentImputations(
                "at least one imputed dataset is required".to_string(),
            ));
        };
        let schema = first.schema();
        for (idx, dataset) in datasets.iter().enumerate().skip(1) {
            let imputation = idx + 1;
            if dataset.len() != first.len() {
                return Err(CausalError::InconsistentImputations(format!(
                    "imputation {imputation} has {} rows, imputation 1 has {}",
                    dataset.len(),
                    first.len()
                )));
            }
            if let Some(row) = dataset
                .caseid()
                .iter()
                .zip(first.caseid())
                .position(|(a, b)| a != b)
            {
                return Err(CausalError::InconsistentImputations(format!(
                    "imputation {imputation} row {row} has caseid {} where imputation 1 has {}",
                    dataset.caseid()[row],
                    first.caseid()[row]
                )));
            }
            if dataset.schema() != schema {
                return Err(CausalError::InconsistentImputations(format!(
                    "imputation {imputation} schema differs from imputation 1"
                )));
            }
        }
        debug!(
            imputations = datasets.len(),
            records = first.len(),
            "validated imputed datasets"
        );
        Ok(Self { datasets })
    }

    /// Number of imputations (M).
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn n_records(&self) -> usize {
        self.datasets.first().map(RecordSet::len).unwrap_or(0)
    }

    /// Dataset for 1-based imputation number `imputation`.
    pub fn get(&self, imputation: usize) -> Option<&RecordSet> {
        imputation
            .checked_sub(1)
            .and_then(|idx| self.datasets.get(idx))
    }

    /// Iterate `(imputation number, dataset)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &RecordSet)> {
        self.datasets.iter().enumerate().map(|(idx, ds)| (idx + 1, ds))
    }

    pub fn as_slice(&self) -> &[RecordSet] {
        &self.datasets
    }
}
