use std::collections::VecDeque;

/// Rolling sample window with cached population statistics.
///
/// `push` never recomputes on its own; callers decide when `recompute` runs
/// so auto-update stays a policy of the owning detector.
#[derive(Debug, Clone)]
pub(crate) struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
    use_mad: bool,
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub mad: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize, use_mad: bool) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
            use_mad,
            mean: 0.0,
            std_dev: 0.0,
            median: 0.0,
            mad: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn use_mad(&self) -> bool {
        self.use_mad
    }

    pub fn set_use_mad(&mut self, use_mad: bool) {
        self.use_mad = use_mad;
    }

    /// Changing the geometry discards buffered samples.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.values.clear();
        self.mean = 0.0;
        self.std_dev = 0.0;
        self.median = 0.0;
        self.mad = 0.0;
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Replace the buffer with the tail of `values` that fits the window.
    pub fn replace(&mut self, values: &[f64]) {
        self.values.clear();
        let skip = values.len().saturating_sub(self.capacity);
        self.values.extend(values.iter().skip(skip).copied());
    }

    /// Recompute mean and population standard deviation, plus median and MAD
    /// when the robust estimator is enabled.
    pub fn recompute(&mut self) {
        let n = self.values.len();
        if n == 0 {
            self.mean = 0.0;
            self.std_dev = 0.0;
            self.median = 0.0;
            self.mad = 0.0;
            return;
        }
        let sum: f64 = self.values.iter().sum();
        self.mean = sum / n as f64;
        let var: f64 = self
            .values
            .iter()
            .map(|v| (v - self.mean).powi(2))
            .sum::<f64>()
            / n as f64;
        self.std_dev = var.sqrt();

        if self.use_mad {
            let mut sorted: Vec<f64> = self.values.iter().copied().collect();
            sorted.sort_by(|a, b| a.total_cmp(b));
            self.median = median_of_sorted(&sorted);
            let mut deviations: Vec<f64> =
                sorted.iter().map(|v| (v - self.median).abs()).collect();
            deviations.sort_by(|a, b| a.total_cmp(b));
            self.mad = median_of_sorted(&deviations);
        }
    }

    /// Score `value` against the current baseline.
    ///
    /// Returns `(score, spread_ok)`; a zero spread means the baseline cannot
    /// score anything and the caller must not flag.
    pub fn score(&self, value: f64) -> (f64, bool) {
        if self.use_mad {
            if self.mad <= 0.0 {
                (0.0, false)
            } else {
                ((value - self.median).abs() / self.mad, true)
            }
        } else if self.std_dev <= 0.0 {
            (0.0, false)
        } else {
            ((value - self.mean).abs() / self.std_dev, true)
        }
    }
}

pub(crate) fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn population_std_dev_of_two_points_is_half_the_gap() {
        let mut window = RollingWindow::new(5, false);
        window.push(10.0);
        window.push(1000.0);
        window.recompute();
        assert_eq!(window.mean, 505.0);
        assert_eq!(window.std_dev, 495.0);
        // The newest point of a two-point window always scores exactly 1.
        let (score, ok) = window.score(1000.0);
        assert!(ok);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_spread_reports_unscorable() {
        let mut window = RollingWindow::new(2, false);
        window.push(7.0);
        window.push(7.0);
        window.recompute();
        let (_, ok) = window.score(1_000_000.0);
        assert!(!ok);
    }

    #[test]
    fn mad_resists_a_single_outlier() {
        let mut window = RollingWindow::new(16, true);
        for v in [10.0, 10.1, 9.9, 10.0, 10.2, 9.8, 10.0, 400.0] {
            window.push(v);
        }
        window.recompute();
        assert!((window.median - 10.0).abs() < 0.2);
        assert!(window.mad < 1.0);
    }

    #[test]
    fn replace_keeps_only_the_tail() {
        let mut window = RollingWindow::new(3, false);
        window.replace(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        window.recompute();
        assert_eq!(window.len(), 3);
        assert_eq!(window.mean, 4.0);
    }

    #[test]
    fn median_of_even_count_averages_the_middle() {
        assert_eq!(median_of_sorted(&[1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(median_of_sorted(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(median_of_sorted(&[]), 0.0);
    }
}
