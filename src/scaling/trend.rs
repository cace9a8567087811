//! Short-horizon trend estimation over evenly spaced observations.

/// How a policy extrapolates its metric history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrendMethod {
    /// Least-squares line through the whole history.
    LinearFit,
    /// Double exponential smoothing with the given factor in `(0, 1]`.
    Ema { alpha: f64 },
}

impl TrendMethod {
    /// Project `history` `horizon` observations past its last one.
    ///
    /// Returns `None` until there are at least two observations.
    pub fn project(&self, history: &[f64], horizon: u32) -> Option<f64> {
        if history.len() < 2 {
            return None;
        }
        let last = *history.last()?;
        match *self {
            TrendMethod::LinearFit => {
                linear_slope(history).map(|slope| last + slope * horizon as f64)
            }
            TrendMethod::Ema { alpha } => {
                let (level, trend) = holt(history, alpha);
                Some(level + trend * horizon as f64)
            }
        }
    }
}

/// Slope of the least-squares line through `(i, values[i])`.
pub fn linear_slope(values: &[f64]) -> Option<f64> {
    let n = values.len() as f64;
    if values.len() < 2 {
        return None;
    }
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = values.iter().sum::<f64>() / n;

    let (num, den) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - x_mean;
            (num + dx * (y - y_mean), den + dx * dx)
        });
    if den == 0.0 {
        None
    } else {
        Some(num / den)
    }
}

fn holt(values: &[f64], alpha: f64) -> (f64, f64) {
    let mut level = values[0];
    let mut trend = values[1] - values[0];
    for &value in &values[1..] {
        let previous = level;
        level = alpha * value + (1.0 - alpha) * (level + trend);
        trend = alpha * (level - previous) + (1.0 - alpha) * trend;
    }
    (level, trend)
}
