// src/resolver/depth.rs

//! Depth vector enumeration
//!
//! A depth vector assigns each name a depth within `[low, high]`. Vectors
//! are produced by ascending total depth; vectors sharing a total come
//! out in lexicographic order. Each vector is produced exactly once.

/// All depth vectors for a set of per-position bounds
#[derive(Debug, Clone)]
pub struct DepthVectors {
    bounds: Vec<(usize, usize)>,
    total: usize,
    max_total: usize,
    current: Option<Vec<usize>>,
    done: bool,
}

impl DepthVectors {
    /// `bounds[i]` is the inclusive `(low, high)` depth range of position `i`
    pub fn new(bounds: Vec<(usize, usize)>) -> Self {
        let total = bounds.iter().map(|(l, _)| l).sum();
        let max_total = bounds.iter().map(|(_, h)| h).sum();
        let done = bounds.iter().any(|(l, h)| l > h);
        Self {
            bounds,
            total,
            max_total,
            current: None,
            done,
        }
    }

    /// Smallest vector (lexicographically) whose excess over the low
    /// bounds in `from..` is `excess`; filled from the back
    fn fill_tail(&self, v: &mut [usize], from: usize, mut excess: usize) {
        for i in (from..self.bounds.len()).rev() {
            let (low, high) = self.bounds[i];
            let add = excess.min(high - low);
            v[i] = low + add;
            excess -= add;
        }
    }

    fn first_for_total(&self) -> Vec<usize> {
        let low_sum: usize = self.bounds.iter().map(|(l, _)| l).sum();
        let mut v = vec![0; self.bounds.len()];
        self.fill_tail(&mut v, 0, self.total - low_sum);
        v
    }

    /// Lexicographic successor with the same total
    fn successor(&self, v: &[usize]) -> Option<Vec<usize>> {
        let n = v.len();
        let mut tail_excess = 0;

        for i in (0..n).rev() {
            let (_, high) = self.bounds[i];
            if tail_excess >= 1 && v[i] < high {
                let mut next = v.to_vec();
                next[i] += 1;
                self.fill_tail(&mut next, i + 1, tail_excess - 1);
                return Some(next);
            }
            tail_excess += v[i] - self.bounds[i].0;
        }

        None
    }
}

impl Iterator for DepthVectors {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.done {
            return None;
        }

        let next = match self.current.take() {
            None => Some(self.first_for_total()),
            Some(prev) => match self.successor(&prev) {
                Some(next) => Some(next),
                None if self.total < self.max_total => {
                    self.total += 1;
                    Some(self.first_for_total())
                }
                None => None,
            },
        };

        match next {
            Some(v) => {
                self.current = Some(v.clone());
                Some(v)
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Core vectors in depth order, each paired with every non-core vector
/// in depth order
#[derive(Debug, Clone)]
pub struct Combinations {
    core: DepthVectors,
    noncore_bounds: Vec<(usize, usize)>,
    current_core: Option<Vec<usize>>,
    noncore: DepthVectors,
}

impl Combinations {
    pub fn new(core_bounds: Vec<(usize, usize)>, noncore_bounds: Vec<(usize, usize)>) -> Self {
        Self {
            core: DepthVectors::new(core_bounds),
            noncore: DepthVectors::new(noncore_bounds.clone()),
            noncore_bounds,
            current_core: None,
        }
    }
}

impl Iterator for Combinations {
    /// Core depths followed by non-core depths
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        loop {
            if let Some(core) = &self.current_core
                && let Some(noncore) = self.noncore.next()
            {
                let mut combined = core.clone();
                combined.extend(noncore);
                return Some(combined);
            }

            self.current_core = Some(self.core.next()?);
            self.noncore = DepthVectors::new(self.noncore_bounds.clone());
        }
    }
}
