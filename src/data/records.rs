//! Column-oriented patient record sets with stable per-record identity.

use std::{borrow::Cow, collections::HashSet};

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::{CausalError, Result};

/// Categorical column stored as level codes.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    levels: Vec<String>,
    codes: Vec<usize>,
}

impl Factor {
    /// Build a factor from explicit levels and per-record codes.
    pub fn new(levels: Vec<String>, codes: Vec<usize>) -> Result<Self> {
        let mut seen = HashSet::new();
        for level in &levels {
            if !seen.insert(level.as_str()) {
                return Err(CausalError::InvalidConfig(format!(
                    "duplicate factor level `{level}`"
                )));
            }
        }
        if let Some(bad) = codes.iter().find(|&&code| code >= levels.len()) {
            return Err(CausalError::InvalidConfig(format!(
                "factor code {bad} out of range for {} levels",
                levels.len()
            )));
        }
        Ok(Self { levels, codes })
    }

    /// Build a factor whose levels are the sorted unique labels.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        let mut levels: Vec<String> = labels.iter().map(|s| s.as_ref().to_string()).collect();
        levels.sort();
        levels.dedup();
        Self::with_levels(labels, levels)
    }

    /// Encode labels against a known level set; unknown labels are appended.
    pub fn with_levels<S: AsRef<str>>(labels: &[S], mut levels: Vec<String>) -> Self {
        let mut index: IndexMap<String, usize> = levels
            .iter()
            .enumerate()
            .map(|(i, level)| (level.clone(), i))
            .collect();
        let mut codes = Vec::with_capacity(labels.len());
        for label in labels {
            let label = label.as_ref();
            let code = match index.get(label) {
                Some(&code) => code,
                None => {
                    let code = levels.len();
                    levels.push(label.to_string());
                    index.insert(label.to_string(), code);
                    code
                }
            };
            codes.push(code);
        }
        Self { levels, codes }
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn codes(&self) -> &[usize] {
        &self.codes
    }

    pub fn label(&self, row: usize) -> &str {
        &self.levels[self.codes[row]]
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    fn subset(&self, rows: &[usize]) -> Self {
        Self {
            levels: self.levels.clone(),
            codes: rows.iter().map(|&r| self.codes[r]).collect(),
        }
    }
}

/// Storage kind of a column, used for schema comparisons.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Categorical { levels: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Vec<f64>),
    Categorical(Factor),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(values) => values.len(),
            Self::Categorical(factor) => factor.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::Numeric(_) => ColumnKind::Numeric,
            Self::Categorical(factor) => ColumnKind::Categorical {
                levels: factor.levels.clone(),
            },
        }
    }

    fn subset(&self, rows: &[usize]) -> Self {
        match self {
            Self::Numeric(values) => Self::Numeric(rows.iter().map(|&r| values[r]).collect()),
            Self::Categorical(factor) => Self::Categorical(factor.subset(rows)),
        }
    }
}

/// Sorted distinct values of an integer-coded numeric column.
fn integer_levels(name: &str, values: &[f64]) -> Result<Vec<i64>> {
    if values.iter().any(|v| !v.is_finite() || v.fract() != 0.0) {
        return Err(CausalError::NotCategorical(name.to_string()));
    }
    let mut distinct: Vec<i64> = values.iter().map(|&v| v as i64).collect();
    distinct.sort_unstable();
    distinct.dedup();
    Ok(distinct)
}

/// Convert an integer-valued numeric column into a factor with integer labels.
///
/// `pinned` fixes the level set; otherwise levels are the values present.
fn numeric_as_factor(name: &str, values: &[f64], pinned: Option<&[i64]>) -> Result<Factor> {
    let observed = integer_levels(name, values)?;
    let levels = pinned.unwrap_or(observed.as_slice());
    let codes = values
        .iter()
        .map(|&v| {
            levels.binary_search(&(v as i64)).map_err(|_| {
                CausalError::InvalidConfig(format!(
                    "value {v} of `{name}` is not among its pinned levels"
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Factor::new(levels.iter().map(|v| v.to_string()).collect(), codes)
}

/// Patient-level rows keyed by a unique `caseid`, stored column-wise.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSet {
    caseid: Vec<i64>,
    columns: IndexMap<String, Column>,
    /// Level sets of integer-coded columns, carried through `subset`.
    pinned: IndexMap<String, Vec<i64>>,
}

impl RecordSet {
    /// Create a record set from identifiers; identifiers must be unique.
    pub fn new(caseid: Vec<i64>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(caseid.len());
        for &id in &caseid {
            if !seen.insert(id) {
                return Err(CausalError::DuplicateCaseId(id));
            }
        }
        Ok(Self {
            caseid,
            columns: IndexMap::new(),
            pinned: IndexMap::new(),
        })
    }

    /// Attach (or replace) a column.
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Result<Self> {
        let name = name.into();
        if column.len() != self.caseid.len() {
            return Err(CausalError::LengthMismatch {
                column: name,
                expected: self.caseid.len(),
                got: column.len(),
            });
        }
        self.pinned.shift_remove(&name);
        self.columns.insert(name, column);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.caseid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caseid.is_empty()
    }

    pub fn caseid(&self) -> &[i64] {
        &self.caseid
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Result<&Column> {
        self.columns
            .get(name)
            .ok_or_else(|| CausalError::MissingColumn(name.to_string()))
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(name, col)| (name.as_str(), col))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    pub fn schema(&self) -> Vec<(String, ColumnKind)> {
        self.columns
            .iter()
            .map(|(name, col)| (name.clone(), col.kind()))
            .collect()
    }

    /// Borrow a numeric column.
    pub fn numeric(&self, name: &str) -> Result<&[f64]> {
        match self.column(name)? {
            Column::Numeric(values) => Ok(values),
            Column::Categorical(_) => Err(CausalError::InvalidConfig(format!(
                "column `{name}` is categorical, expected numeric"
            ))),
        }
    }

    /// View a column as a factor; integer-valued numeric columns are converted.
    pub fn factor(&self, name: &str) -> Result<Cow<'_, Factor>> {
        match self.column(name)? {
            Column::Categorical(factor) => Ok(Cow::Borrowed(factor)),
            Column::Numeric(values) => {
                numeric_as_factor(name, values, self.pinned.get(name).map(Vec::as_slice))
                    .map(Cow::Owned)
            }
        }
    }

    /// Fix the levels of integer-coded columns at the values present here,
    /// so subsets report the same levels as this record set.
    ///
    /// Columns already stored as factors are left alone.
    pub fn pin_levels<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        for name in names {
            let levels = match self.column(name)? {
                Column::Numeric(values) => integer_levels(name, values)?,
                Column::Categorical(_) => continue,
            };
            self.pinned.insert(name.to_string(), levels);
        }
        Ok(self)
    }

    /// Read a binary 0/1 column as booleans.
    pub fn indicator(&self, name: &str) -> Result<Vec<bool>> {
        match self.column(name)? {
            Column::Numeric(values) => values
                .iter()
                .map(|&v| {
                    if v == 1.0 {
                        Ok(true)
                    } else if v == 0.0 {
                        Ok(false)
                    } else {
                        Err(CausalError::NotBinary {
                            column: name.to_string(),
                            reason: format!("found value {v}"),
                        })
                    }
                })
                .collect(),
            Column::Categorical(factor) => Err(CausalError::NotBinary {
                column: name.to_string(),
                reason: format!("categorical with levels {:?}", factor.levels()),
            }),
        }
    }

    /// Rows at the given positions, in the given order.
    pub fn subset(&self, rows: &[usize]) -> Self {
        Self {
            caseid: rows.iter().map(|&r| self.caseid[r]).collect(),
            columns: self
                .columns
                .iter()
                .map(|(name, col)| (name.clone(), col.subset(rows)))
                .collect(),
            pinned: self.pinned.clone(),
        }
    }

    /// Group row positions by the levels of a categorical column.
    pub fn partition_by(&self, name: &str) -> Result<Vec<(String, Vec<usize>)>> {
        let factor = self.factor(name)?;
        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); factor.levels().len()];
        for (row, &code) in factor.codes().iter().enumerate() {
            groups[code].push(row);
        }
        Ok(factor
            .levels()
            .iter()
            .cloned()
            .zip(groups)
            .filter(|(_, rows)| !rows.is_empty())
            .collect())
    }
}
