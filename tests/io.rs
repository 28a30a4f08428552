mod common;

use common::*;
use polars::prelude::{DataFrame, NamedFrom, Series};
use rwe_causal::{
    data::{
        io::{imputed_from_long, read_long_table, to_long_frame, write_frame},
        ColumnKind,
    },
    error::{CausalError, ErrorKind},
};
use tempfile::tempdir;

fn long(imp: Vec<i64>, ids: Vec<i64>, age: Vec<Option<f64>>) -> DataFrame {
    let n = imp.len();
    DataFrame::new(vec![
        Series::new(".imp".into(), imp),
        Series::new("caseid".into(), ids),
        Series::new("age".into(), age),
        Series::new("stage".into(), vec![1i64, 2].repeat(n / 2)),
        Series::new("arm".into(), vec!["a", "b"].repeat(n / 2)),
    ])
    .unwrap()
}

#[test]
fn long_frame_round_trips() {
    let datasets = imputations(3);
    let frame = to_long_frame(&datasets, "caseid", ".imp").unwrap();
    assert_eq!(frame.height(), 27);

    let back = imputed_from_long(&frame, "caseid", ".imp", &[]).unwrap();
    assert_eq!(back.len(), 3);
    for m in 1..=3 {
        assert_eq!(back.get(m), datasets.get(m));
    }
}

#[test]
fn csv_and_parquet_round_trip_on_disk() {
    let dir = tempdir().unwrap();
    let datasets = imputations(2);
    for name in ["cohort.csv", "cohort.parquet"] {
        let path = dir.path().join(name);
        let mut frame = to_long_frame(&datasets, "caseid", ".imp").unwrap();
        write_frame(&mut frame, &path).unwrap();
        let table = read_long_table(&path).unwrap();
        let back = imputed_from_long(&table, "caseid", ".imp", &[]).unwrap();
        assert_eq!(back.get(2), datasets.get(2), "{name}");
    }
}

#[test]
fn unimputed_rows_are_skipped_and_levels_shared() {
    let frame = long(
        vec![0, 0, 1, 1, 2, 2],
        vec![1, 2, 1, 2, 1, 2],
        vec![None, Some(40.0), Some(41.0), Some(50.0), Some(43.0), Some(50.0)],
    );
    let datasets =
        imputed_from_long(&frame, "caseid", ".imp", &["stage".to_string()]).unwrap();
    assert_eq!(datasets.len(), 2);
    assert_eq!(datasets.n_records(), 2);
    let first = datasets.get(1).unwrap();
    assert_eq!(first.numeric("age").unwrap(), &[41.0, 50.0]);
    let stage = first.factor("stage").unwrap();
    assert_eq!(stage.levels(), &["1".to_string(), "2".to_string()]);
    assert!(matches!(
        first.column("arm").unwrap().kind(),
        ColumnKind::Categorical { .. }
    ));
}

#[test]
fn missing_value_in_an_imputation_is_rejected() {
    let frame = long(
        vec![1, 1, 2, 2],
        vec![1, 2, 1, 2],
        vec![Some(40.0), Some(50.0), None, Some(50.0)],
    );
    let err = imputed_from_long(&frame, "caseid", ".imp", &[]).unwrap_err();
    match &err {
        CausalError::IncompleteData { column, imputation } => {
            assert_eq!(column, "age");
            assert_eq!(*imputation, 2);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Consistency);
}

#[test]
fn gaps_in_imputation_indices_are_rejected() {
    let frame = long(
        vec![1, 1, 3, 3],
        vec![1, 2, 1, 2],
        vec![Some(40.0), Some(50.0), Some(41.0), Some(50.0)],
    );
    let err = imputed_from_long(&frame, "caseid", ".imp", &[]).unwrap_err();
    assert!(matches!(err, CausalError::InconsistentImputations(_)));
}

#[test]
fn mismatched_row_order_is_rejected() {
    let frame = long(
        vec![1, 1, 2, 2],
        vec![1, 2, 2, 1],
        vec![Some(40.0), Some(50.0), Some(41.0), Some(50.0)],
    );
    let err = imputed_from_long(&frame, "caseid", ".imp", &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
}
