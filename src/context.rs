use bitflags::bitflags;
use ndarray::{s, Array1, Array2};

bitflags! {
    /// Functionality flags for contexts
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flag: u32 {
        /// Allocate the max-product buffers (Viterbi)
        const VITERBI = 0x01;
        /// Allocate the forward-backward buffers (marginals)
        const MARGINALS = 0x02;
    }
}

/// Context maintains the lattice state for one chain.
///
/// Potentials are kept in the log domain (`state`, `trans`, `start`) and
/// exponentiated into product form before running the recurrences. Forward
/// rows are rescaled by their row sum on every step, with the scale logs
/// summed into the log partition function; this is the sole
/// numerical-stability mechanism.
#[derive(Debug, Clone)]
pub struct Context {
    flag: Flag,
    /// The total number of distinct labels
    pub num_labels: usize,
    /// The number of items in the current instance
    pub num_items: usize,
    cap_items: usize,
    /// Logarithm of the normalization factor for the instance.
    ///
    /// This is equivalent to the total score of all paths in the lattice.
    log_norm: f64,
    /// State scores: a `[T][L]` matrix whose element `[t][l]` presents the
    /// total score of observation features associating label #l at #t
    pub state: Array2<f64>,
    /// Transition scores: a `[L][L]` matrix whose element `[i][j]` represents
    /// the score of the transition feature associating labels #i and #j
    pub trans: Array2<f64>,
    /// Start scores: a `[L]` vector scoring the boundary transition into the
    /// first item
    pub start: Array1<f64>,
    exp_state: Array2<f64>,
    exp_trans: Array2<f64>,
    exp_start: Array1<f64>,
    /// Scaled forward scores
    alpha: Array2<f64>,
    /// Scaled backward scores
    beta: Array2<f64>,
    /// Per-row scaling coefficients for alpha and beta
    scale: Array1<f64>,
    /// Max-product scores (Viterbi work space)
    delta: Array2<f64>,
    /// Back-pointers: `[t][j]` holds the label #i yielding the maximum score
    /// arriving at (t, j)
    backward_edge: Array2<u32>,
}

impl Context {
    pub fn new(flag: Flag, num_labels: usize, hint_items: usize) -> Self {
        let l = num_labels;
        let mut ctx = Self {
            flag,
            num_labels: l,
            num_items: 0,
            cap_items: 0,
            log_norm: 0.0,
            state: Array2::zeros((0, l)),
            trans: Array2::zeros((l, l)),
            start: Array1::zeros(l),
            exp_state: Array2::zeros((0, l)),
            exp_trans: Array2::zeros((l, l)),
            exp_start: Array1::zeros(l),
            alpha: Array2::zeros((0, l)),
            beta: Array2::zeros((0, l)),
            scale: Array1::zeros(0),
            delta: Array2::zeros((0, l)),
            backward_edge: Array2::zeros((0, l)),
        };
        if hint_items > 0 {
            ctx.set_num_items(hint_items);
            ctx.num_items = 0;
        }
        ctx
    }

    /// Set the current instance length, growing the buffers when needed.
    ///
    /// Growing reallocates the per-item matrices; callers refill the state
    /// scores afterwards. Transition and start scores are unaffected.
    pub fn set_num_items(&mut self, t: usize) {
        self.num_items = t;
        if self.cap_items < t {
            let l = self.num_labels;
            self.state = Array2::zeros((t, l));
            if self.flag.contains(Flag::MARGINALS) {
                self.exp_state = Array2::zeros((t, l));
                self.alpha = Array2::zeros((t, l));
                self.beta = Array2::zeros((t, l));
                self.scale = Array1::zeros(t);
            }
            if self.flag.contains(Flag::VITERBI) {
                self.delta = Array2::zeros((t, l));
                self.backward_edge = Array2::zeros((t, l));
            }
            self.cap_items = t;
        }
    }

    /// Zero the state scores of the current instance
    pub fn reset_state(&mut self) {
        let t = self.num_items;
        if t > 0 {
            self.state.slice_mut(s![..t, ..]).fill(0.0);
        }
    }

    /// Exponentiate the transition and start scores
    pub fn exp_transitions(&mut self) {
        self.exp_trans.assign(&self.trans);
        self.exp_trans.mapv_inplace(f64::exp);
        self.exp_start.assign(&self.start);
        self.exp_start.mapv_inplace(f64::exp);
    }

    /// Exponentiate the state scores of the current instance
    pub fn exp_states(&mut self) {
        let t = self.num_items;
        self.exp_state
            .slice_mut(s![..t, ..])
            .assign(&self.state.slice(s![..t, ..]));
        self.exp_state
            .slice_mut(s![..t, ..])
            .mapv_inplace(f64::exp);
    }

    /// Run the scaled forward recursion and return the log partition
    /// function.
    ///
    /// Returns a non-finite value when a forward row underflows to zero (or
    /// overflows); the caller skips the instance in that case.
    pub fn forward(&mut self) -> f64 {
        let t_len = self.num_items;
        let l = self.num_labels;

        for j in 0..l {
            self.alpha[[0, j]] = self.exp_start[j] * self.exp_state[[0, j]];
        }
        let mut sum: f64 = (0..l).map(|j| self.alpha[[0, j]]).sum();
        if !(sum > 0.0 && sum.is_finite()) {
            self.log_norm = f64::NEG_INFINITY;
            return self.log_norm;
        }
        self.scale[0] = 1.0 / sum;
        for j in 0..l {
            self.alpha[[0, j]] *= self.scale[0];
        }

        for t in 1..t_len {
            for j in 0..l {
                let mut total = 0.0;
                for i in 0..l {
                    total += self.alpha[[t - 1, i]] * self.exp_trans[[i, j]];
                }
                self.alpha[[t, j]] = total * self.exp_state[[t, j]];
            }
            sum = (0..l).map(|j| self.alpha[[t, j]]).sum();
            if !(sum > 0.0 && sum.is_finite()) {
                self.log_norm = f64::NEG_INFINITY;
                return self.log_norm;
            }
            self.scale[t] = 1.0 / sum;
            for j in 0..l {
                self.alpha[[t, j]] *= self.scale[t];
            }
        }

        self.log_norm = -(0..t_len).map(|t| self.scale[t].ln()).sum::<f64>();
        self.log_norm
    }

    /// Run the scaled backward recursion; requires a prior [`forward`](Self::forward)
    pub fn backward(&mut self) {
        let t_len = self.num_items;
        let l = self.num_labels;

        for j in 0..l {
            self.beta[[t_len - 1, j]] = self.scale[t_len - 1];
        }
        for t in (0..t_len - 1).rev() {
            for i in 0..l {
                let mut total = 0.0;
                for j in 0..l {
                    total +=
                        self.exp_trans[[i, j]] * self.exp_state[[t + 1, j]] * self.beta[[t + 1, j]];
                }
                self.beta[[t, i]] = total * self.scale[t];
            }
        }
    }

    /// Log partition function of the last forward pass
    pub fn log_norm(&self) -> f64 {
        self.log_norm
    }

    /// Marginal probability of label #i at item #t
    #[inline]
    pub fn marginal_state(&self, t: usize, i: usize) -> f64 {
        self.alpha[[t, i]] * self.beta[[t, i]] / self.scale[t]
    }

    /// Marginal probability of the transition (#t-1, #i) -> (#t, #j); t >= 1
    #[inline]
    pub fn marginal_edge(&self, t: usize, i: usize, j: usize) -> f64 {
        self.alpha[[t - 1, i]] * self.exp_trans[[i, j]] * self.exp_state[[t, j]] * self.beta[[t, j]]
    }

    /// Log score of a label path, including the boundary transition
    pub fn score(&self, labels: &[u32]) -> f64 {
        let mut score = self.start[labels[0] as usize];
        for (t, &y) in labels.iter().enumerate() {
            score += self.state[[t, y as usize]];
            if t > 0 {
                score += self.trans[[labels[t - 1] as usize, y as usize]];
            }
        }
        score
    }

    /// Max-product search for the best label path.
    ///
    /// Returns the path and its log score.
    pub fn viterbi(&mut self) -> (Vec<u32>, f64) {
        let t_len = self.num_items;
        let l = self.num_labels;

        // Compute the scores at (0, *)
        for j in 0..l {
            self.delta[[0, j]] = self.start[j] + self.state[[0, j]];
        }

        // Compute the scores at (t, *)
        for t in 1..t_len {
            for j in 0..l {
                let mut max_score = f64::NEG_INFINITY;
                let mut argmax_score = 0;
                for i in 0..l {
                    // Transit from (t-1, i) to (t, j)
                    let score = self.delta[[t - 1, i]] + self.trans[[i, j]];
                    if max_score < score {
                        max_score = score;
                        argmax_score = i;
                    }
                }
                self.backward_edge[[t, j]] = argmax_score as u32;
                self.delta[[t, j]] = max_score + self.state[[t, j]];
            }
        }

        // Find the label reaching the end with the maximum score
        let mut max_score = f64::NEG_INFINITY;
        let mut labels = vec![0u32; t_len];
        for j in 0..l {
            let score = self.delta[[t_len - 1, j]];
            if max_score < score {
                max_score = score;
                labels[t_len - 1] = j as u32;
            }
        }

        // Tag labels by tracing the backward links
        for t in (0..t_len - 1).rev() {
            let next_label = labels[t + 1] as usize;
            labels[t] = self.backward_edge[[t + 1, next_label]];
        }

        (labels, max_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_context() -> Context {
        // 3 labels, 3 items, all potentials distinct
        let mut ctx = Context::new(Flag::VITERBI | Flag::MARGINALS, 3, 3);
        ctx.set_num_items(3);
        let mut v = 0.05;
        for j in 0..3 {
            ctx.start[j] = v;
            v += 0.13;
        }
        for i in 0..3 {
            for j in 0..3 {
                ctx.trans[[i, j]] = v;
                v += 0.17;
            }
        }
        for t in 0..3 {
            for j in 0..3 {
                ctx.state[[t, j]] = v;
                v -= 0.29;
            }
        }
        ctx.exp_transitions();
        ctx.exp_states();
        ctx
    }

    /// Enumerate all paths by brute force: (log Z, best path, best score)
    fn enumerate(ctx: &Context) -> (f64, Vec<u32>, f64) {
        let mut best_path = Vec::new();
        let mut best_score = f64::NEG_INFINITY;
        let mut scores = Vec::new();
        for a in 0..3u32 {
            for b in 0..3u32 {
                for c in 0..3u32 {
                    let path = vec![a, b, c];
                    let score = ctx.score(&path);
                    scores.push(score);
                    if score > best_score {
                        best_score = score;
                        best_path = path;
                    }
                }
            }
        }
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let log_z = max + scores.iter().map(|s| (s - max).exp()).sum::<f64>().ln();
        (log_z, best_path, best_score)
    }

    #[test]
    fn test_partition_function() {
        let mut ctx = filled_context();
        let log_z = ctx.forward();
        let (expected, _, _) = enumerate(&ctx);
        assert!((log_z - expected).abs() < 1e-12);
    }

    #[test]
    fn test_marginals_normalize() {
        let mut ctx = filled_context();
        ctx.forward();
        ctx.backward();
        for t in 0..3 {
            let total: f64 = (0..3).map(|i| ctx.marginal_state(t, i)).sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
        for t in 1..3 {
            let mut total = 0.0;
            for i in 0..3 {
                for j in 0..3 {
                    total += ctx.marginal_edge(t, i, j);
                }
            }
            assert!((total - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_viterbi_matches_enumeration() {
        let mut ctx = filled_context();
        let (path, score) = ctx.viterbi();
        let (_, best_path, best_score) = enumerate(&ctx);
        assert_eq!(path, best_path);
        assert!((score - best_score).abs() < 1e-12);
        // the returned score is the path score, recomputed
        assert!((ctx.score(&path) - score).abs() < 1e-12);
    }

    #[test]
    fn test_underflow_is_reported() {
        let mut ctx = Context::new(Flag::MARGINALS, 2, 2);
        ctx.set_num_items(2);
        ctx.state.fill(-1e4);
        ctx.exp_transitions();
        ctx.exp_states();
        assert!(!ctx.forward().is_finite());
    }

    #[test]
    fn test_single_item_chain() {
        let mut ctx = Context::new(Flag::VITERBI | Flag::MARGINALS, 2, 1);
        ctx.set_num_items(1);
        ctx.start[0] = 0.1;
        ctx.start[1] = 0.4;
        ctx.state[[0, 0]] = 1.0;
        ctx.state[[0, 1]] = 0.2;
        ctx.exp_transitions();
        ctx.exp_states();
        let log_z = ctx.forward();
        ctx.backward();
        let expected = (1.1f64.exp() + 0.6f64.exp()).ln();
        assert!((log_z - expected).abs() < 1e-12);
        let total: f64 = (0..2).map(|i| ctx.marginal_state(0, i)).sum();
        assert!((total - 1.0).abs() < 1e-12);
        let (path, _) = ctx.viterbi();
        assert_eq!(path, vec![0]);
    }
}
