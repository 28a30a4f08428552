//! Record sets, imputed collections and their on-disk forms.

pub mod imputed;
pub mod io;
pub mod records;
pub mod simulate;

pub use imputed::ImputedDatasets;
pub use records::{Column, ColumnKind, Factor, RecordSet};
