use std::{
    collections::VecDeque,
    fmt::{self, Display},
};

use comms::Collective;

use crate::Result;

const DEFAULT_WINDOW: usize = 20;

/// How a `SmoothedValue` is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueFormat {
    /// `"{median:.4} ({global_avg:.4})"`.
    #[default]
    MedianGlobal,
    /// The latest value alone.
    Value,
}

/// Tracks a series of values, giving smoothed values over a window and the
/// global series average.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    count: u64,
    total: f64,
    format: ValueFormat,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, ValueFormat::MedianGlobal)
    }
}

impl SmoothedValue {
    pub fn new(window_size: usize, format: ValueFormat) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            count: 0,
            total: 0.,
            format,
        }
    }

    /// Records `value`, observed `n` times, e.g. a batch mean over `n` samples.
    pub fn update(&mut self, value: f64, n: u64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);

        self.count += n;
        self.total += value * n as f64;
    }

    /// Adds another series' global totals to this one.
    pub fn merge(&mut self, other: &SmoothedValue) {
        self.count += other.count;
        self.total += other.total;
    }

    /// Sums `count` and `total` over every rank. The window stays local.
    pub fn synchronize(&mut self, sync: &mut dyn Collective) -> Result<()> {
        let mut buf = [self.count as f64, self.total];
        sync.all_reduce_sum_f64(&mut buf)?;

        self.count = buf[0] as u64;
        self.total = buf[1];
        Ok(())
    }

    pub(super) fn totals(&self) -> (u64, f64) {
        (self.count, self.total)
    }

    pub(super) fn set_totals(&mut self, count: u64, total: f64) {
        self.count = count;
        self.total = total;
    }

    /// The lower middle value of the window.
    pub fn median(&self) -> f64 {
        let mut sorted: Vec<_> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        match sorted.len() {
            0 => 0.,
            len => sorted[(len - 1) / 2],
        }
    }

    pub fn avg(&self) -> f64 {
        match self.window.len() {
            0 => 0.,
            len => self.window.iter().sum::<f64>() / len as f64,
        }
    }

    /// The weighted mean of every recorded value, `0` when nothing was recorded.
    pub fn global_avg(&self) -> f64 {
        match self.count {
            0 => 0.,
            count => self.total / count as f64,
        }
    }

    pub fn max(&self) -> f64 {
        self.window.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or_default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            ValueFormat::MedianGlobal => {
                write!(f, "{:.4} ({:.4})", self.median(), self.global_avg())
            }
            ValueFormat::Value => write!(f, "{}", self.value()),
        }
    }
}

#[cfg(test)]
mod tests {
    use comms::LocalGroup;

    use super::*;

    #[test]
    fn window_and_global_statistics() {
        let mut v = SmoothedValue::new(3, ValueFormat::MedianGlobal);
        for x in [5., 1., 4., 2.] {
            v.update(x, 1);
        }

        assert_eq!(v.median(), 2.);
        assert_eq!(v.avg(), 7. / 3.);
        assert_eq!(v.max(), 4.);
        assert_eq!(v.value(), 2.);
        assert_eq!(v.global_avg(), 3.);
        assert_eq!(v.to_string(), "2.0000 (3.0000)");
    }

    #[test]
    fn global_average_is_weighted_by_samples() {
        let mut a = SmoothedValue::default();
        a.update(100., 1);
        a.update(0., 3);

        let mut b = SmoothedValue::default();
        b.update(50., 4);
        a.merge(&b);

        assert_eq!(a.count(), 8);
        assert_eq!(a.global_avg(), 37.5);
    }

    #[test]
    fn empty_series_average_to_zero() {
        let v = SmoothedValue::new(1, ValueFormat::Value);
        assert_eq!(v.global_avg(), 0.);
        assert_eq!(v.median(), 0.);
        assert_eq!(v.to_string(), "0");
    }

    #[test]
    fn synchronize_sums_across_ranks() {
        let groups = LocalGroup::new(2.try_into().unwrap());

        let averages: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|mut group| {
                    s.spawn(move || {
                        let mut v = SmoothedValue::default();
                        let rank = group.rank();
                        v.update(rank as f64 * 10., rank as u64 + 1);
                        v.synchronize(&mut group).unwrap();
                        (v.count(), v.global_avg())
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // rank 0 contributes (0, 1 sample), rank 1 contributes (10, 2 samples).
        assert!(averages.iter().all(|&(c, avg)| c == 3 && (avg - 20. / 3.).abs() < 1e-9));
    }
}
