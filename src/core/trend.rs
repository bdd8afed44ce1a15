use chrono::{Duration, NaiveDate};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Given history dates, return (t values normalized to [0,1], t_scale in days, start date)
pub fn time_scale(history: &[NaiveDate]) -> Option<(Vec<f64>, f64, NaiveDate)> {
    let t0 = *history.first()?;
    let t_last = *history.last()?;
    let span_days = (t_last - t0).num_days() as f64;
    let t_scale = span_days.max(1e-12);
    let t = scale_time(history, t0, t_scale);
    Some((t, t_scale, t0))
}

/// Map dates onto the model's time axis.
pub fn scale_time(dates: &[NaiveDate], t0: NaiveDate, t_scale: f64) -> Vec<f64> {
    dates
        .iter()
        .map(|d| (*d - t0).num_days() as f64 / t_scale)
        .collect()
}

/// Select n changepoints uniformly from first changepoint_range proportion of history
pub fn select_changepoints(t: &[f64], n: usize, changepoint_range: f64) -> Vec<f64> {
    if t.len() <= 2 || n == 0 {
        return Vec::new();
    }
    let end = ((t.len() as f64 - 1.0) * changepoint_range).floor() as usize;
    if end <= 1 {
        return Vec::new();
    }
    let mut cps = Vec::new();
    let step = (end as f64) / (n as f64 + 1.0);
    for i in 1..=n {
        let idx = (i as f64 * step).round() as usize;
        let idx = idx.clamp(1, end - 1);
        cps.push(t[idx]);
    }
    cps.sort_by(|a, b| a.total_cmp(b));
    cps.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
    cps
}

/// Hinge matrix H (T x S) with H[i,j] = max(t[i] - t_change[j], 0).
///
/// The trend argument is `k*t + m + H·delta`, which keeps the trend continuous
/// at every changepoint.
pub fn hinge_matrix(t: &[f64], t_change: &[f64]) -> Array2<f64> {
    Array2::from_shape_fn((t.len(), t_change.len()), |(i, j)| {
        (t[i] - t_change[j]).max(0.0)
    })
}

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Piecewise linear argument of the trend at each t
pub fn trend_argument(k: f64, m: f64, delta: &[f64], t: &[f64], t_change: &[f64]) -> Vec<f64> {
    t.iter()
        .map(|&ti| {
            let mut k_t = k;
            let mut m_t = m;
            for (j, &c) in t_change.iter().enumerate() {
                if ti >= c {
                    k_t += delta[j];
                    m_t -= delta[j] * c;
                }
            }
            k_t * ti + m_t
        })
        .collect()
}

/// Piecewise linear trend with changepoints
pub fn piecewise_linear(k: f64, m: f64, delta: &[f64], t: &[f64], t_change: &[f64]) -> Vec<f64> {
    trend_argument(k, m, delta, t, t_change)
}

/// Piecewise logistic trend with changepoints
/// trend = cap / (1 + exp(-(k_t * t + m_t)))
pub fn piecewise_logistic(
    k: f64,
    m: f64,
    delta: &[f64],
    t: &[f64],
    cap: &[f64],
    t_change: &[f64],
) -> Vec<f64> {
    trend_argument(k, m, delta, t, t_change)
        .into_iter()
        .zip(cap)
        .map(|(u, &c)| c * sigmoid(u))
        .collect()
}

/// Initial (k, m) for logistic growth from the first and last observed points.
pub fn logistic_init(t: &[f64], y: &[f64], cap: &[f64]) -> (f64, f64) {
    let logit = |v: f64, c: f64| {
        let p = if c > 0.0 { (v / c).clamp(0.01, 0.99) } else { 0.5 };
        (p / (1.0 - p)).ln()
    };
    let (Some(&t_first), Some(&t_last)) = (t.first(), t.last()) else {
        return (0.0, 0.0);
    };
    let u0 = logit(y[0], cap[0]);
    let u1 = logit(y[y.len() - 1], cap[cap.len() - 1]);
    let span = t_last - t_first;
    let k = if span > 1e-12 { (u1 - u0) / span } else { 0.0 };
    let m = u0 - k * t_first;
    (k, m)
}

/// Ordinary least squares to estimate k, m for linear trend y ~ k*t + m
pub fn ols_linear_trend(t: &[f64], y: &[f64]) -> (f64, f64) {
    let n = t.len() as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let sum_t: f64 = t.iter().sum();
    let sum_y: f64 = y.iter().sum();
    let sum_tt: f64 = t.iter().map(|v| v * v).sum();
    let sum_ty: f64 = t.iter().zip(y).map(|(ti, yi)| ti * yi).sum();
    let denom = n * sum_tt - sum_t * sum_t;
    if denom.abs() < 1e-12 {
        // fallback: flat
        return (0.0, sum_y / n);
    }
    let k = (n * sum_ty - sum_t * sum_y) / denom;
    let m = (sum_y - k * sum_t) / n;
    (k, m)
}

/// Step between generated future dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Weekly,
}

impl Frequency {
    pub fn step(self) -> Duration {
        match self {
            Frequency::Weekly => Duration::weeks(1),
        }
    }
}

/// Generate future dates after the last timestamp with specified frequency
pub fn future_dates(last: NaiveDate, periods: usize, freq: Frequency) -> Vec<NaiveDate> {
    let step = freq.step();
    (1..=periods as i32).map(|i| last + step * i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_time_scale() {
        let history = vec![date("2020-01-01"), date("2020-01-02"), date("2020-01-03")];

        let (t, t_scale, t0) = time_scale(&history).unwrap();

        assert_eq!(t.len(), 3);
        assert_eq!(t[0], 0.0);
        assert_eq!(t[2], 1.0);
        assert!(t[1] > 0.0 && t[1] < 1.0);
        assert_eq!(t_scale, 2.0);
        assert_eq!(t0, history[0]);
    }

    #[test]
    fn test_time_scale_empty() {
        assert!(time_scale(&[]).is_none());
    }

    #[test]
    fn test_select_changepoints() {
        let t: Vec<f64> = (0..100).map(|i| i as f64 / 100.0).collect();
        let cps = select_changepoints(&t, 5, 0.8);

        assert!(cps.len() <= 5);
        for cp in &cps {
            assert!(*cp >= 0.0 && *cp <= 0.8);
        }
    }

    #[test]
    fn test_hinge_matrix_matches_trend_argument() {
        let t = vec![0.0, 0.3, 0.6, 0.9];
        let t_change = vec![0.2, 0.5];
        let delta = [0.7, -1.1];
        let (k, m) = (0.4, -0.2);
        let h = hinge_matrix(&t, &t_change);
        let u = trend_argument(k, m, &delta, &t, &t_change);
        for i in 0..t.len() {
            let expected = k * t[i] + m + h[[i, 0]] * delta[0] + h[[i, 1]] * delta[1];
            assert!((u[i] - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_trend_is_continuous_at_changepoint() {
        let t_change = vec![0.5];
        let delta = [3.0];
        let u = trend_argument(1.0, 0.0, &delta, &[0.5 - 1e-9, 0.5], &t_change);
        assert!((u[0] - u[1]).abs() < 1e-6);
    }

    #[test]
    fn test_piecewise_linear_no_changepoints() {
        let trend = piecewise_linear(2.0, 10.0, &[], &[0.0, 0.5, 1.0], &[]);
        assert!((trend[0] - 10.0).abs() < 1e-10);
        assert!((trend[1] - 11.0).abs() < 1e-10);
        assert!((trend[2] - 12.0).abs() < 1e-10);
    }

    #[test]
    fn test_piecewise_logistic_respects_cap() {
        let t = vec![0.0, 0.5, 1.0];
        let cap = vec![1.0, 1.0, 1.0];

        let trend = piecewise_logistic(4.0, -2.0, &[], &t, &cap, &[]);

        assert!(trend.iter().all(|&x| x > 0.0 && x < 1.0));
        assert!(trend[0] < trend[1]);
        assert!(trend[1] < trend[2]);
        assert!((trend[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_sigmoid_is_stable() {
        assert_eq!(sigmoid(-1000.0), 0.0);
        assert_eq!(sigmoid(1000.0), 1.0);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-15);
    }

    #[test]
    fn test_logistic_init_recovers_endpoints() {
        let t = vec![0.0, 0.5, 1.0];
        let y = vec![0.1, 0.3, 0.5];
        let cap = vec![1.0; 3];
        let (k, m) = logistic_init(&t, &y, &cap);
        assert!((sigmoid(m) - 0.1).abs() < 1e-9);
        assert!((sigmoid(k + m) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ols_linear_trend() {
        let t = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        let y = vec![10.0, 12.0, 14.0, 16.0, 18.0];

        let (k, m) = ols_linear_trend(&t, &y);

        assert!((k - 2.0).abs() < 1e-10);
        assert!((m - 10.0).abs() < 1e-10);
    }

    #[test]
    fn test_future_dates_weekly() {
        let dates = future_dates(date("2020-01-31"), 2, Frequency::Weekly);

        assert_eq!(dates, vec![date("2020-02-07"), date("2020-02-14")]);
    }
}
