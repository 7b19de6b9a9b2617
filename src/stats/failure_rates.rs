//! Bayesian changepoint detection over a sequence of (failures, total) counts.
//!
//! Data points are appended oldest first. After each append the estimator tries
//! to split the open segment (everything after the last committed break) into two
//! pieces with different failure rates. A split is committed when the gain in log
//! likelihood outweighs the prior cost `-ln(probability_of_change)`.

#[derive(Debug, Clone)]
pub struct SequentialFailureRates {
    probability_of_change: f64,
    failures: Vec<u64>,
    totals: Vec<u64>,
    breaks: Vec<bool>,
    last_break: usize,
}

/// Log likelihood of `fails` failures in `total` trials at the maximum likelihood rate.
fn log_likelihood(fails: u64, total: u64) -> f64 {
    if fails == 0 || fails >= total {
        return 0.0;
    }
    let fails = fails as f64;
    let passes = total as f64 - fails;
    let p = fails / total as f64;
    fails * p.ln() + passes * (1.0 - p).ln()
}

impl SequentialFailureRates {
    pub fn new(probability_of_change: f64) -> Self {
        Self {
            probability_of_change,
            failures: Vec::new(),
            totals: Vec::new(),
            breaks: Vec::new(),
            last_break: 0,
        }
    }

    pub fn probability_of_change(&self) -> f64 {
        self.probability_of_change
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn is_break(&self, index: usize) -> bool {
        self.breaks.get(index).copied().unwrap_or(false)
    }

    pub fn breaks(&self) -> impl Iterator<Item = usize> + '_ {
        self.breaks
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| b.then_some(i))
    }

    pub fn add(&mut self, fail_count: u64, total_count: u64) {
        self.failures.push(fail_count);
        self.totals.push(total_count);
        self.breaks.push(false);

        while self.len() - self.last_break > 1 {
            if !self.try_to_break() {
                break;
            }
        }
    }

    fn counts(&self, lo: usize, hi: usize) -> (u64, u64) {
        let fails = self.failures[lo..hi].iter().sum();
        let total = self.totals[lo..hi].iter().sum();
        (fails, total)
    }

    /// `(with_break, without_break)` log likelihoods of the open segment split at `b`.
    fn split_log_likelihoods(&self, b: usize) -> (f64, f64) {
        let len = self.len();
        let (f_lo, t_lo) = self.counts(self.last_break, b);
        let (f_hi, t_hi) = self.counts(b, len);
        let with = log_likelihood(f_lo, t_lo)
            + log_likelihood(f_hi, t_hi)
            + self.probability_of_change.ln();
        let without = log_likelihood(f_lo + f_hi, t_lo + t_hi);
        (with, without)
    }

    fn try_to_break(&mut self) -> bool {
        let mut best: Option<(usize, f64)> = None;
        for b in self.last_break + 1..self.len() {
            let (with, without) = self.split_log_likelihoods(b);
            if with > without && best.map_or(true, |(_, ll)| with > ll) {
                best = Some((b, with));
            }
        }

        match best {
            Some((b, _)) => {
                self.breaks[b] = true;
                self.last_break = b;
                true
            }
            None => false,
        }
    }

    /// Gain in log likelihood from splitting the segment containing `index` at
    /// `index`, ignoring the prior. Zero for out-of-range indices and for indices
    /// that are already breaks.
    pub fn log_likelihood_improvement_from_adding_break(&self, index: usize) -> f64 {
        if index >= self.len() || self.is_break(index) {
            return 0.0;
        }

        let mut above = index;
        while above < self.len() && !self.is_break(above) {
            above += 1;
        }
        let mut below = index;
        while below > 0 && !self.is_break(below) {
            below -= 1;
        }

        let (f_lo, t_lo) = self.counts(below, index);
        let (f_hi, t_hi) = self.counts(index, above);
        let separate = log_likelihood(f_lo, t_lo) + log_likelihood(f_hi, t_hi);
        let joined = log_likelihood(f_lo + f_hi, t_lo + t_hi);
        separate - joined
    }

    /// Segments between consecutive breaks as `[start, end)` pairs.
    pub fn segments(&self) -> Vec<(usize, usize)> {
        let mut bounds: Vec<usize> = std::iter::once(0).chain(self.breaks()).collect();
        bounds.push(self.len());
        bounds.dedup();
        bounds.windows(2).map(|w| (w[0], w[1])).collect()
    }

    /// Failure-rate estimate for every index: the pooled rate of its segment,
    /// `None` where the segment has no trials.
    pub fn estimated_probabilities(&self) -> Vec<Option<f64>> {
        let mut out = Vec::with_capacity(self.len());
        for (lo, hi) in self.segments() {
            let (fails, total) = self.counts(lo, hi);
            let estimate = (total > 0).then(|| fails as f64 / total as f64);
            out.extend(std::iter::repeat(estimate).take(hi - lo));
        }
        out
    }
}
