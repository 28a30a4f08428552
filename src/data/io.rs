//! Long-format imputed tables on disk (CSV or Parquet) via polars.

use std::{collections::BTreeMap, fs::File, path::Path};

use polars::prelude::{
    CsvReadOptions, CsvWriter, DataFrame, DataType, NamedFrom, ParquetReader,
    ParquetWriter, SerReader, SerWriter, Series,
};
use tracing::{debug, info};

use crate::{
    data::{
        imputed::ImputedDatasets,
        records::{Column, Factor, RecordSet},
    },
    error::{CausalError, Result},
    pipeline::orchestrator::RunOutput,
};

/// Default name of the imputation-index column.
pub const IMPUTATION_COLUMN: &str = ".imp";
pub const CASEID_COLUMN: &str = "caseid";

fn is_parquet(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("parquet"))
}

/// Read a CSV or Parquet table, chosen by file extension.
pub fn read_long_table(path: &Path) -> Result<DataFrame> {
    let df = if is_parquet(path) {
        ParquetReader::new(File::open(path)?).finish()?
    } else {
        CsvReadOptions::default()
            .with_has_header(true)
            .into_reader_with_file_handle(File::open(path)?)
            .finish()?
    };
    info!(path = %path.display(), rows = df.height(), columns = df.width(), "loaded table");
    Ok(df)
}

/// Write a table as CSV or Parquet, chosen by file extension.
pub fn write_frame(df: &mut DataFrame, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    if is_parquet(path) {
        ParquetWriter::new(file).finish(df)?;
    } else {
        CsvWriter::new(&mut file).finish(df)?;
    }
    info!(path = %path.display(), rows = df.height(), "wrote table");
    Ok(())
}

fn integer_column(df: &DataFrame, name: &str) -> Result<Vec<i64>> {
    let series = df
        .column(name)
        .map_err(|_| CausalError::MissingColumn(name.to_string()))?;
    let cast = series.cast(&DataType::Int64)?;
    cast.i64()?
        .into_iter()
        .enumerate()
        .map(|(row, value)| {
            value.ok_or_else(|| {
                CausalError::InvalidConfig(format!("column `{name}` is null at row {row}"))
            })
        })
        .collect()
}

enum RawColumn {
    Numeric(Vec<Option<f64>>),
    Labels(Vec<Option<String>>, Vec<String>),
}

impl RawColumn {
    fn read(series: &Series, categorical: bool) -> Result<Self> {
        if categorical || matches!(series.dtype(), DataType::String) {
            let cast = series.cast(&DataType::String)?;
            let labels: Vec<Option<String>> = cast
                .str()?
                .into_iter()
                .map(|v| v.map(str::to_string))
                .collect();
            let mut levels: Vec<String> = labels.iter().flatten().cloned().collect();
            levels.sort();
            levels.dedup();
            Ok(Self::Labels(labels, levels))
        } else {
            let cast = series.cast(&DataType::Float64)?;
            Ok(Self::Numeric(cast.f64()?.into_iter().collect()))
        }
    }

    fn take(&self, name: &str, rows: &[usize], imputation: usize) -> Result<Column> {
        let missing = || CausalError::IncompleteData {
            column: name.to_string(),
            imputation,
        };
        match self {
            Self::Numeric(values) => rows
                .iter()
                .map(|&r| values[r].filter(|v| !v.is_nan()).ok_or_else(missing))
                .collect::<Result<Vec<f64>>>()
                .map(Column::Numeric),
            Self::Labels(labels, levels) => {
                let picked = rows
                    .iter()
                    .map(|&r| labels[r].as_deref().ok_or_else(missing))
                    .collect::<Result<Vec<&str>>>()?;
                Ok(Column::Categorical(Factor::with_levels(&picked, levels.clone())))
            }
        }
    }
}

/// Split a long table into M record sets keyed by `imp_col`.
///
/// Rows with imputation index 0 (the incomplete observed data, when a long
/// table includes it) are skipped. String columns and columns named in
/// `categorical` become factors whose levels are shared by every imputation.
pub fn imputed_from_long(
    df: &DataFrame,
    id_col: &str,
    imp_col: &str,
    categorical: &[String],
) -> Result<ImputedDatasets> {
    let imp = integer_column(df, imp_col)?;
    let ids = integer_column(df, id_col)?;

    let mut by_imputation: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (row, &m) in imp.iter().enumerate() {
        by_imputation.entry(m).or_default().push(row);
    }
    if let Some(skipped) = by_imputation.remove(&0) {
        debug!(rows = skipped.len(), "skipping unimputed rows");
    }
    for (expected, &m) in (1..).zip(by_imputation.keys()) {
        if m != expected {
            return Err(CausalError::InconsistentImputations(format!(
                "imputation indices must run 1..M, found {m} where {expected} was expected"
            )));
        }
    }

    let mut raw = Vec::new();
    for series in df.get_columns() {
        let name = series.name().to_string();
        if name == id_col || name == imp_col {
            continue;
        }
        let column = RawColumn::read(series, categorical.contains(&name))?;
        raw.push((name, column));
    }

    let mut datasets = Vec::with_capacity(by_imputation.len());
    for (m, rows) in by_imputation {
        let imputation = m as usize;
        let caseid = rows.iter().map(|&r| ids[r]).collect();
        let mut records = RecordSet::new(caseid)?;
        for (name, column) in &raw {
            records = records.with_column(name.clone(), column.take(name, &rows, imputation)?)?;
        }
        datasets.push(records);
    }
    ImputedDatasets::new(datasets)
}

fn column_series(name: &str, column: &Column) -> Series {
    match column {
        Column::Numeric(values) => Series::new(name.into(), values.clone()),
        Column::Categorical(factor) => Series::new(
            name.into(),
            (0..factor.len())
                .map(|row| factor.label(row).to_string())
                .collect::<Vec<_>>(),
        ),
    }
}

/// Stack all M datasets into one table with an imputation-index column.
pub fn to_long_frame(datasets: &ImputedDatasets, id_col: &str, imp_col: &str) -> Result<DataFrame> {
    let mut imp = Vec::new();
    let mut ids = Vec::new();
    let mut parts: Vec<DataFrame> = Vec::with_capacity(datasets.len());
    for (m, records) in datasets.iter() {
        imp.extend(std::iter::repeat(m as i64).take(records.len()));
        ids.extend_from_slice(records.caseid());
        let columns = records
            .columns()
            .map(|(name, column)| column_series(name, column))
            .collect::<Vec<_>>();
        parts.push(DataFrame::new(columns)?);
    }
    let mut stacked = DataFrame::new(vec![
        Series::new(imp_col.into(), imp),
        Series::new(id_col.into(), ids),
    ])?;
    if let Some((first, rest)) = parts.split_first() {
        let mut values = first.clone();
        for part in rest {
            values.vstack_mut(part)?;
        }
        stacked.hstack_mut(values.get_columns())?;
    }
    Ok(stacked)
}

/// One row per (imputation, record) with every weight component.
pub fn weights_frame(run: &RunOutput, id_col: &str, imp_col: &str) -> Result<DataFrame> {
    let mut imp = Vec::new();
    let mut ids = Vec::new();
    let mut treated = Vec::new();
    let mut propensity = Vec::new();
    let mut distance = Vec::new();
    let mut base = Vec::new();
    let mut final_weight = Vec::new();
    let mut subclass: Vec<Option<i64>> = Vec::new();
    for (m, set) in run.results() {
        imp.extend(std::iter::repeat(*m as i64).take(set.len()));
        ids.extend_from_slice(set.caseid());
        treated.extend(set.treated().iter().map(|&t| t as i64));
        propensity.extend_from_slice(set.propensity());
        distance.extend_from_slice(set.distance());
        base.extend_from_slice(set.base_weights());
        final_weight.extend_from_slice(set.final_weights());
        subclass.extend(set.subclass().iter().map(|s| s.map(|g| g as i64)));
    }
    Ok(DataFrame::new(vec![
        Series::new(imp_col.into(), imp),
        Series::new(id_col.into(), ids),
        Series::new("treated".into(), treated),
        Series::new("propensity".into(), propensity),
        Series::new("distance".into(), distance),
        Series::new("base_weight".into(), base),
        Series::new("final_weight".into(), final_weight),
        Series::new("subclass".into(), subclass),
    ])?)
}
