use birdcast::core::optimizer::SeriesModel;
use birdcast::core::seasonality::{seasonal_design, SeasonalityConfig};
use birdcast::core::trend::{hinge_matrix, select_changepoints, time_scale};
use birdcast::GrowthType;
use chrono::{Duration, NaiveDate};

fn build_model(growth: GrowthType) -> SeriesModel {
    let start = NaiveDate::from_ymd_opt(2019, 1, 2).unwrap();
    let ds: Vec<NaiveDate> = (0..80).map(|i| start + Duration::weeks(i)).collect();
    let (t, _, _) = time_scale(&ds).unwrap();
    let y: Vec<f64> = t
        .iter()
        .map(|ti| 0.3 + 0.2 * (2.0 * std::f64::consts::PI * ti * 1.5).sin())
        .collect();
    let t_change = select_changepoints(&t, 4, 0.8);
    let (x, sigmas) = seasonal_design(&ds, &[SeasonalityConfig::yearly(2)]);

    SeriesModel {
        growth,
        hinge: hinge_matrix(&t, &t_change),
        cap: vec![1.0; t.len()],
        t,
        y,
        x,
        sigmas,
        tau: 0.5,
    }
}

fn finite_difference(model: &SeriesModel, params: &[f64]) -> Vec<f64> {
    let eps = 1e-6;
    (0..params.len())
        .map(|i| {
            let mut plus = params.to_vec();
            let mut minus = params.to_vec();
            plus[i] += eps;
            minus[i] -= eps;
            (model.neg_log_prob(&plus) - model.neg_log_prob(&minus)) / (2.0 * eps)
        })
        .collect()
}

fn assert_gradient_matches(model: &SeriesModel, params: &[f64]) {
    let grad = model.gradient(params);
    let fd = finite_difference(model, params);
    assert_eq!(grad.len(), model.num_params());
    for i in 0..params.len() {
        let err = (grad[i] - fd[i]).abs() / fd[i].abs().max(1.0);
        assert!(
            err < 1e-4,
            "gradient mismatch for param {}: analytic={}, fd={}",
            i,
            grad[i],
            fd[i]
        );
    }
}

fn sample_params(model: &SeriesModel) -> Vec<f64> {
    let mut params = vec![0.8, -0.6];
    params.extend((0..model.s()).map(|j| 0.05 * (j as f64 + 1.0) - 0.1));
    params.push((0.1f64).ln());
    params.extend((0..model.k()).map(|j| 0.02 * j as f64 - 0.01));
    params
}

#[test]
fn gradient_matches_finite_differences_logistic() {
    let model = build_model(GrowthType::Logistic);
    assert!(model.s() > 0);
    assert_eq!(model.k(), 4);
    assert_gradient_matches(&model, &sample_params(&model));
}

#[test]
fn gradient_matches_finite_differences_linear() {
    let model = build_model(GrowthType::Linear);
    assert_gradient_matches(&model, &sample_params(&model));
}

#[test]
fn gradient_matches_at_initialization() {
    for growth in [GrowthType::Logistic, GrowthType::Linear] {
        let model = build_model(growth);
        let init = model.initialize_params();
        assert_eq!(init.len(), model.num_params());
        assert_gradient_matches(&model, &init);
    }
}
