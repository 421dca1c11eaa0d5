//! Property-based tests for masking, class targets and the loss weight laws.

use proptest::prelude::*;
use wirevae::loss::{classification_targets, masked_mean};
use wirevae::{
    AutoencoderKlWireframe, ForwardOptions, ForwardOutput, IndexTensor, LossConfig, Tensor, WireframeLoss,
    WireframeVaeConfig,
};

const N: usize = 4;

fn flag_offset_tensor(flags: &[i64], cols: &[i64], rows: &[i64]) -> IndexTensor {
    let data: Vec<i64> = flags
        .iter()
        .zip(cols)
        .zip(rows)
        .flat_map(|((&f, &c), &r)| [f, c, r])
        .collect();
    IndexTensor::from_vec(data, &[1, flags.len(), 3]).unwrap()
}

fn flags_with_one_valid() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(0i64..=1, N).prop_filter("at least one valid segment", |f| f.iter().any(|&v| v == 1))
}

/// Property: values in padded positions never change the encoding or the loss.
#[test]
fn proptest_padding_is_invisible() {
    let model = AutoencoderKlWireframe::new(WireframeVaeConfig::tiny()).unwrap();
    proptest!(ProptestConfig::with_cases(16), |(
        flags in flags_with_one_valid(),
        base in prop::collection::vec(-1.0f32..1.0, N * 30),
        noise in prop::collection::vec(-5.0f32..5.0, N * 30),
        cols in prop::collection::vec(0i64..3, N),
        rows in prop::collection::vec(0i64..5, N),
        pad_cols in prop::collection::vec(0i64..3, N),
        pad_rows in prop::collection::vec(0i64..5, N),
    )| {
        let xs = Tensor::from_vec(base.clone(), &[1, N, 30]).unwrap();
        let fo = flag_offset_tensor(&flags, &cols, &rows);

        let mut perturbed = base;
        let mut cols2 = cols.clone();
        let mut rows2 = rows.clone();
        for s in 0..N {
            if flags[s] == 0 {
                perturbed[s * 30..(s + 1) * 30].copy_from_slice(&noise[s * 30..(s + 1) * 30]);
                cols2[s] = pad_cols[s];
                rows2[s] = pad_rows[s];
            }
        }
        let xs2 = Tensor::from_vec(perturbed, &[1, N, 30]).unwrap();
        let fo2 = flag_offset_tensor(&flags, &cols2, &rows2);

        let a = model.encode(&xs, &fo).unwrap().latent_dist;
        let b = model.encode(&xs2, &fo2).unwrap().latent_dist;
        prop_assert_eq!(a.mean, b.mean);
        prop_assert_eq!(a.logvar, b.logvar);

        let opts = ForwardOptions { sample_posterior: false, return_loss: true };
        let la = model.forward(&xs, &fo, opts, None).unwrap();
        let lb = model.forward(&xs2, &fo2, opts, None).unwrap();
        match (la, lb) {
            (ForwardOutput::Loss { total: ta, .. }, ForwardOutput::Loss { total: tb, .. }) => {
                prop_assert_eq!(ta, tb);
            }
            _ => prop_assert!(false, "expected loss outputs"),
        }
    });
}

/// Property: the class target is the number of flagged segments minus one.
#[test]
fn proptest_classification_target_law() {
    proptest!(|(flags in prop::collection::vec(0i64..=1, 1..16))| {
        let n = flags.len();
        let fo = flag_offset_tensor(&flags, &vec![0; n], &vec![0; n]);
        let count: i64 = flags.iter().sum();
        match classification_targets(&fo) {
            Ok(t) => prop_assert_eq!(t, vec![count - 1]),
            Err(_) => prop_assert_eq!(count, 0),
        }
    });
}

/// Property: column position weights decay monotonically from 1.2 - 0.2 ln(1.7183).
#[test]
fn proptest_column_position_weight_law() {
    proptest!(|(n in 2usize..256)| {
        let loss = WireframeLoss::new(LossConfig::default(), n, 6, 32);
        let w = &loss.col_position_weights;
        prop_assert_eq!(w.len(), n);
        prop_assert!((w[0] - (1.2 - 0.2 * 1.7183f32.ln())).abs() < 1e-6);
        prop_assert!((w[n - 1] - (1.2 - 0.2 * 3.7183f32.ln())).abs() < 1e-5);
        prop_assert!(w.windows(2).all(|p| p[0] > p[1]));
    });
}

/// Property: a masked mean ignores masked-out values and is zero on empty masks.
#[test]
fn proptest_masked_mean_ignores_masked_values() {
    proptest!(|(
        values in prop::collection::vec(-10.0f32..10.0, 1..32),
        junk in -1e3f32..1e3,
        seed in any::<u64>(),
    )| {
        let mask: Vec<bool> = (0..values.len()).map(|i| (seed >> (i % 64)) & 1 == 1).collect();
        let mut noisy = values.clone();
        for (v, &m) in noisy.iter_mut().zip(&mask) {
            if !m {
                *v = junk;
            }
        }
        prop_assert_eq!(masked_mean(&values, &mask), masked_mean(&noisy, &mask));
        if !mask.iter().any(|&m| m) {
            prop_assert_eq!(masked_mean(&values, &mask), 0.0);
        }
    });
}
