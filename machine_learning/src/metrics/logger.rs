use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    time::{Duration, Instant},
};

use comms::Collective;
use log::debug;

use super::SmoothedValue;
use crate::Result;

/// A named set of `SmoothedValue`s with batch progress reporting.
#[derive(Debug, Clone)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
    delimiter: String,
    started: Instant,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new("  ")
    }
}

impl MetricLogger {
    pub fn new(delimiter: &str) -> Self {
        Self {
            meters: BTreeMap::new(),
            delimiter: delimiter.to_string(),
            started: Instant::now(),
        }
    }

    /// Registers a meter with a custom window or format. Meters updated
    /// without being added get the default one.
    pub fn add_meter(&mut self, name: &str, meter: SmoothedValue) {
        self.meters.insert(name.to_string(), meter);
    }

    pub fn update(&mut self, name: &str, value: f64, n: u64) {
        self.meters
            .entry(name.to_string())
            .or_default()
            .update(value, n);
    }

    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    /// The global average of `name`, `0` for unknown meters.
    pub fn global_avg(&self, name: &str) -> f64 {
        self.meter(name).map(SmoothedValue::global_avg).unwrap_or_default()
    }

    /// Sums every meter's totals over all ranks in a single reduction.
    ///
    /// Every rank must hold the same meter names.
    pub fn synchronize(&mut self, sync: &mut dyn Collective) -> Result<()> {
        let mut buf: Vec<f64> = self
            .meters
            .values()
            .flat_map(|m| {
                let (count, total) = m.totals();
                [count as f64, total]
            })
            .collect();

        sync.all_reduce_sum_f64(&mut buf)?;

        for (meter, pair) in self.meters.values_mut().zip(buf.chunks_exact(2)) {
            meter.set_totals(pair[0] as u64, pair[1]);
        }

        Ok(())
    }

    /// Restarts the clock used for the progress estimates.
    pub fn start(&mut self) {
        self.started = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Logs the meters and the remaining time of the epoch every `print_freq`
    /// batches and on the last one. A `print_freq` of zero disables it.
    ///
    /// # Arguments
    /// * `header` - The phase being reported, e.g. `Epoch: [3]`.
    /// * `i` - The index of the batch that just finished.
    /// * `total` - The amount of batches in the epoch.
    /// * `print_freq` - How many batches apart the reports are.
    pub fn log_progress(&self, header: &str, i: usize, total: usize, print_freq: usize) {
        if print_freq == 0 || (i % print_freq != 0 && i + 1 != total) {
            return;
        }

        let elapsed = self.elapsed();
        let per_batch = elapsed.as_secs_f64() / (i + 1) as f64;
        let eta = Duration::from_secs_f64(per_batch * total.saturating_sub(i + 1) as f64);

        debug!(
            elapsed_secs = elapsed.as_secs_f64(), eta_secs = eta.as_secs();
            "{header} [{i}/{total}] eta: {eta:?} {}",
            self
        );
    }
}

impl Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self
            .meters
            .iter()
            .map(|(name, meter)| format!("{name}: {meter}"))
            .collect::<Vec<_>>()
            .join(&self.delimiter);

        write!(f, "{s}")
    }
}
