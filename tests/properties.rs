use chrono::{Duration, TimeZone, Utc};
use glyco_flux::classifier::NearestCentroid;
use glyco_flux::cleaner::clean;
use glyco_flux::features::FeatureTable;
use glyco_flux::metrics::{above_percent, below_percent};
use glyco_flux::reducer::DimensionalityReducer;
use glyco_flux::types::{Label, Reading};
use glyco_flux::validation::{aggregate, evaluate_fold, make_folds, FoldResult, HarnessOptions};
use ndarray::Array2;
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

const TOL: f64 = 1e-6;

fn labels_from(flags: &[bool]) -> Vec<Label> {
    flags
        .iter()
        .map(|&b| if b { "case" } else { "control" }.to_string())
        .collect()
}

fn table_from(values: &[f64], rows: usize, columns: usize, labels: Vec<Label>) -> FeatureTable {
    let matrix = Array2::from_shape_vec((rows, columns), values[..rows * columns].to_vec())
        .expect("generated values fill the matrix");
    FeatureTable::new(
        (0..columns).map(|j| format!("x{}", j)).collect(),
        (0..rows).map(|i| format!("S{:03}", i)).collect(),
        labels,
        matrix,
    )
    .expect("generated table is consistent")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn clean_preserves_length_and_replaces_markers(
        entries in prop::collection::vec(prop_oneof![
            (20.0f64..400.0).prop_map(Some),
            Just(None),
        ], 0..60),
        sentinel in 10.0f64..60.0,
    ) {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let readings: Vec<Reading> = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let at = start + Duration::minutes(5 * i as i64);
                match entry {
                    Some(value) => Reading::numeric("S1", at, *value),
                    None => Reading::marker("S1", at, if i % 2 == 0 { "Low" } else { "low" }),
                }
            })
            .collect();

        let cleaned = clean(&readings, sentinel).unwrap();
        prop_assert_eq!(cleaned.len(), readings.len());
        for (entry, reading) in entries.iter().zip(&cleaned) {
            prop_assert!(reading.glucose_value.is_finite());
            match entry {
                Some(value) => {
                    prop_assert_eq!(reading.glucose_value, *value);
                    prop_assert!(!reading.imputed);
                }
                None => {
                    prop_assert_eq!(reading.glucose_value, sentinel);
                    prop_assert!(reading.imputed);
                }
            }
        }
    }

    #[test]
    fn above_percent_is_monotone_in_threshold(
        values in prop::collection::vec(20.0f64..400.0, 1..80),
        t1 in 20.0f64..400.0,
        delta in 0.0f64..200.0,
    ) {
        let t2 = t1 + delta;
        let a1 = above_percent(&values, t1).unwrap();
        let a2 = above_percent(&values, t2).unwrap();
        prop_assert!(a1 >= a2);
    }

    #[test]
    fn below_and_above_never_exceed_everything(
        values in prop::collection::vec(prop_oneof![20.0f64..400.0, Just(140.0)], 1..80),
        t in prop_oneof![20.0f64..400.0, Just(140.0)],
    ) {
        let total = below_percent(&values, t).unwrap() + above_percent(&values, t).unwrap();
        prop_assert!(total <= 100.0 + TOL);
        if values.iter().all(|&v| v != t) {
            prop_assert!((total - 100.0).abs() < TOL);
        }
    }

    #[test]
    fn folds_are_deterministic_disjoint_and_complete(
        flags in prop::collection::vec(any::<bool>(), 6..60),
        k in 2usize..6,
        seed in any::<u64>(),
    ) {
        let labels = labels_from(&flags);
        let folds = make_folds(&labels, k, seed).unwrap();
        prop_assert_eq!(&folds, &make_folds(&labels, k, seed).unwrap());

        let mut seen = vec![0usize; labels.len()];
        for fold in folds.folds() {
            for &row in &fold.members {
                seen[row] += 1;
            }
        }
        prop_assert!(seen.iter().all(|&count| count == 1));

        let sizes: Vec<usize> = folds.folds().iter().map(|f| f.members.len()).collect();
        let largest = sizes.iter().max().copied().unwrap_or(0);
        let smallest = sizes.iter().min().copied().unwrap_or(0);
        prop_assert!(largest - smallest <= 1);
    }

    #[test]
    fn pca_full_rank_round_trip(
        rows in 5usize..12,
        columns in 2usize..5,
        values in prop::collection::vec(-100.0f64..100.0, 60),
    ) {
        let labels = vec!["a".to_string(); rows];
        let table = table_from(&values, rows, columns, labels);
        let (standardized, _) = table.standardize().unwrap();

        let model = DimensionalityReducer::fit(&standardized, columns).unwrap();
        let reduced = model.transform(&standardized).unwrap();
        let restored = model.inverse_transform(&reduced).unwrap();

        for (a, b) in standardized.values().iter().zip(restored.values().iter()) {
            prop_assert!((a - b).abs() < TOL, "{} vs {}", a, b);
        }
    }

    #[test]
    fn aggregate_ignores_fold_order(
        flags in prop::collection::vec(any::<bool>(), 9..24),
        values in prop::collection::vec(-10.0f64..10.0, 48),
        order in Just((0..3usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let rows = flags.len();
        let table = table_from(&values, rows, 2, labels_from(&flags));
        let folds = make_folds(table.labels(), 3, 11).unwrap();
        let vocabulary = table.label_vocabulary();
        let options = HarnessOptions::default();

        let run = |indices: &[usize]| -> Vec<FoldResult> {
            indices
                .iter()
                .map(|&i| {
                    evaluate_fold(&table, &folds, i, &NearestCentroid, false, &options, &vocabulary)
                        .unwrap()
                })
                .collect()
        };

        let shortfalls = folds.shortfalls();
        let in_order =
            aggregate("nearest_centroid", run(&[0, 1, 2]), &vocabulary, shortfalls).unwrap();
        let shuffled = aggregate("nearest_centroid", run(&order), &vocabulary, shortfalls).unwrap();
        prop_assert_eq!(in_order, shuffled);
    }
}
