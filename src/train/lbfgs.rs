//! Limited-memory BFGS with optional orthant-wise projection for L1.
//!
//! The optimizer is driven by reverse communication: the caller evaluates
//! the objective and gradient at the current iterate, passes them to
//! [`Lbfgs::step`], and acts on the returned [`Outcome`]. On `Continue` the
//! iterate has been moved to the next trial point and must be re-evaluated.
//!
//! In L1 mode the caller's objective must include the `C * ||x||_1` penalty
//! term while the gradient stays that of the smooth part; the pseudo-gradient
//! and the orthant projection are handled here.

use std::collections::VecDeque;

/// Result of one optimization step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Evaluate the objective at the updated iterate and call back
    Continue,
    /// The iterate satisfies a convergence test
    Converged,
    /// No further progress is possible; the iterate holds the best point
    /// seen so far
    Failed,
}

/// L-BFGS hyper-parameters.
#[derive(Debug, Clone)]
pub struct LbfgsParams {
    /// Number of correction pairs kept
    pub memory: usize,
    /// Gradient-norm convergence threshold
    pub epsilon: f64,
    /// Relative objective-decrease convergence threshold
    pub delta: f64,
    /// Maximum objective evaluations per line search
    pub max_linesearch: usize,
    /// Sufficient-decrease coefficient
    pub c1: f64,
    /// Curvature coefficient
    pub c2: f64,
    /// Orthant-wise L1 penalty; `None` disables L1 handling
    pub l1: Option<f64>,
}

impl Default for LbfgsParams {
    fn default() -> Self {
        Self {
            memory: 100,
            epsilon: 1e-5,
            delta: 1e-5,
            max_linesearch: 20,
            c1: 1e-4,
            c2: 0.9,
            l1: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Search,
}

/// Limited-memory BFGS optimizer state.
pub struct Lbfgs {
    params: LbfgsParams,
    s_mem: VecDeque<Vec<f64>>,
    y_mem: VecDeque<Vec<f64>>,
    rho_mem: VecDeque<f64>,
    phase: Phase,
    iter: usize,
    dir: Vec<f64>,
    x0: Vec<f64>,
    fx0: f64,
    g0: Vec<f64>,
    pg0: Vec<f64>,
    dginit: f64,
    step: f64,
    nfev: usize,
    orthant: Vec<f64>,
    prev_fx: f64,
    best_x: Vec<f64>,
    best_fx: f64,
    search_failures: usize,
}

impl Lbfgs {
    pub fn new(n: usize, params: LbfgsParams) -> Self {
        Self {
            params,
            s_mem: VecDeque::new(),
            y_mem: VecDeque::new(),
            rho_mem: VecDeque::new(),
            phase: Phase::Init,
            iter: 0,
            dir: vec![0.0; n],
            x0: vec![0.0; n],
            fx0: 0.0,
            g0: vec![0.0; n],
            pg0: vec![0.0; n],
            dginit: 0.0,
            step: 0.0,
            nfev: 0,
            orthant: vec![0.0; n],
            prev_fx: f64::INFINITY,
            best_x: Vec::new(),
            best_fx: f64::INFINITY,
            search_failures: 0,
        }
    }

    /// Number of accepted iterations so far
    pub fn iterations(&self) -> usize {
        self.iter
    }

    /// Copy the best evaluated iterate into `x`
    pub fn restore_best(&self, x: &mut [f64]) {
        if !self.best_x.is_empty() {
            x.copy_from_slice(&self.best_x);
        }
    }

    /// Advance the optimizer with the objective value and gradient evaluated
    /// at `x`.
    pub fn step(&mut self, x: &mut [f64], fx: f64, g: &[f64]) -> Outcome {
        if !fx.is_finite() {
            self.restore_best(x);
            return Outcome::Failed;
        }
        if fx < self.best_fx {
            self.best_fx = fx;
            self.best_x = x.to_vec();
        }

        match self.phase {
            Phase::Init => self.first_step(x, fx, g),
            Phase::Search => self.search_step(x, fx, g),
        }
    }

    fn first_step(&mut self, x: &mut [f64], fx: f64, g: &[f64]) -> Outcome {
        let pg = self.pseudo_gradient(x, g);
        if self.gradient_converged(x, &pg) {
            return Outcome::Converged;
        }
        self.dir = pg.iter().map(|v| -v).collect();
        self.begin_search(x, fx, g, pg, true);
        self.phase = Phase::Search;
        Outcome::Continue
    }

    fn search_step(&mut self, x: &mut [f64], fx: f64, g: &[f64]) -> Outcome {
        self.nfev += 1;

        // Sufficient decrease along the actual displacement; with orthant
        // clipping the displacement is not exactly step * dir.
        let disp_dg: f64 = self
            .pg0
            .iter()
            .zip(x.iter().zip(&self.x0))
            .map(|(pg, (xi, x0i))| pg * (xi - x0i))
            .sum();
        let sufficient = fx <= self.fx0 + self.params.c1 * disp_dg;
        let curvature = if self.params.l1.is_some() {
            true
        } else {
            let dg: f64 = g.iter().zip(&self.dir).map(|(a, b)| a * b).sum();
            dg >= self.params.c2 * self.dginit
        };

        if sufficient && curvature && disp_dg < 0.0 {
            self.accept(x, fx, g)
        } else {
            self.reject(x, sufficient)
        }
    }

    fn accept(&mut self, x: &mut [f64], fx: f64, g: &[f64]) -> Outcome {
        let s: Vec<f64> = x.iter().zip(&self.x0).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = g.iter().zip(&self.g0).map(|(a, b)| a - b).collect();
        let ys: f64 = y.iter().zip(&s).map(|(a, b)| a * b).sum();

        // A coordinate pulled out of its orthant invalidates the pair
        let flipped = self.params.l1.is_some()
            && x.iter()
                .zip(&self.x0)
                .any(|(&xi, &x0i)| x0i != 0.0 && xi == 0.0);
        if ys > 1e-10 && !flipped {
            if self.s_mem.len() == self.params.memory {
                self.s_mem.pop_front();
                self.y_mem.pop_front();
                self.rho_mem.pop_front();
            }
            self.rho_mem.push_back(1.0 / ys);
            self.s_mem.push_back(s);
            self.y_mem.push_back(y);
        }

        self.iter += 1;
        self.search_failures = 0;

        let pg = self.pseudo_gradient(x, g);
        if self.gradient_converged(x, &pg) {
            return Outcome::Converged;
        }
        let rel = (self.prev_fx - fx) / fx.abs().max(self.prev_fx.abs()).max(1.0);
        if rel < self.params.delta {
            return Outcome::Converged;
        }
        self.prev_fx = fx;

        self.dir = self.two_loop(&pg);
        self.project_direction(&pg);
        let mut dg: f64 = pg.iter().zip(&self.dir).map(|(a, b)| a * b).sum();
        if !(dg < 0.0) {
            // The approximation produced a non-descent direction; fall back
            // to steepest descent once before giving up.
            if self.s_mem.is_empty() {
                self.restore_best(x);
                return Outcome::Failed;
            }
            self.clear_memory();
            self.dir = pg.iter().map(|v| -v).collect();
            dg = pg.iter().zip(&self.dir).map(|(a, b)| a * b).sum();
            if !(dg < 0.0) {
                self.restore_best(x);
                return Outcome::Failed;
            }
        }

        self.begin_search(x, fx, g, pg, false);
        Outcome::Continue
    }

    fn reject(&mut self, x: &mut [f64], sufficient: bool) -> Outcome {
        if self.nfev >= self.params.max_linesearch
            || self.step < 1e-20
            || self.step > 1e20
        {
            self.search_failures += 1;
            if self.search_failures >= 2 {
                self.restore_best(x);
                return Outcome::Failed;
            }
            // Restart the search from the last accepted point along
            // steepest descent.
            self.clear_memory();
            self.dir = self.pg0.iter().map(|v| -v).collect();
            self.dginit = self.pg0.iter().zip(&self.dir).map(|(a, b)| a * b).sum();
            if !(self.dginit < 0.0) {
                self.restore_best(x);
                return Outcome::Failed;
            }
            let norm = norm2(&self.dir);
            self.step = 1.0 / norm;
            self.nfev = 0;
            self.propose(x);
            return Outcome::Continue;
        }

        // Backtrack when sufficient decrease failed; a pure curvature
        // failure widens the step instead.
        if sufficient && self.params.l1.is_none() {
            self.step *= 2.1;
        } else {
            self.step *= 0.5;
        }
        self.propose(x);
        Outcome::Continue
    }

    fn begin_search(&mut self, x: &mut [f64], fx: f64, g: &[f64], pg: Vec<f64>, first: bool) {
        self.x0.copy_from_slice(x);
        self.fx0 = fx;
        self.g0.copy_from_slice(g);
        self.pg0 = pg;
        self.dginit = self
            .pg0
            .iter()
            .zip(&self.dir)
            .map(|(a, b)| a * b)
            .sum();
        if self.params.l1.is_some() {
            for i in 0..x.len() {
                self.orthant[i] = if self.x0[i] != 0.0 {
                    self.x0[i].signum()
                } else {
                    -sign(self.pg0[i])
                };
            }
        }
        self.step = if first { 1.0 / norm2(&self.dir) } else { 1.0 };
        self.nfev = 0;
        self.propose(x);
    }

    fn propose(&self, x: &mut [f64]) {
        for i in 0..x.len() {
            x[i] = self.x0[i] + self.step * self.dir[i];
        }
        if self.params.l1.is_some() {
            // Clip coordinates crossing zero to exactly zero
            for i in 0..x.len() {
                if x[i] * self.orthant[i] < 0.0 {
                    x[i] = 0.0;
                }
            }
        }
    }

    fn clear_memory(&mut self) {
        self.s_mem.clear();
        self.y_mem.clear();
        self.rho_mem.clear();
    }

    /// Two-loop recursion: approximate -H * pg
    fn two_loop(&self, pg: &[f64]) -> Vec<f64> {
        let mut q = pg.to_vec();
        let k = self.s_mem.len();
        let mut alpha = vec![0.0; k];
        for i in (0..k).rev() {
            let a = self.rho_mem[i]
                * self.s_mem[i].iter().zip(&q).map(|(s, q)| s * q).sum::<f64>();
            alpha[i] = a;
            for (qj, yj) in q.iter_mut().zip(&self.y_mem[i]) {
                *qj -= a * yj;
            }
        }
        if k > 0 {
            let last = k - 1;
            let yy: f64 = self.y_mem[last].iter().map(|v| v * v).sum();
            let sy = 1.0 / self.rho_mem[last];
            let gamma = sy / yy;
            for qj in q.iter_mut() {
                *qj *= gamma;
            }
        }
        for i in 0..k {
            let b = self.rho_mem[i]
                * self.y_mem[i].iter().zip(&q).map(|(y, q)| y * q).sum::<f64>();
            for (qj, sj) in q.iter_mut().zip(&self.s_mem[i]) {
                *qj += (alpha[i] - b) * sj;
            }
        }
        q.iter().map(|v| -v).collect()
    }

    /// Project the direction into the orthant of the pseudo-gradient
    fn project_direction(&mut self, pg: &[f64]) {
        if self.params.l1.is_none() {
            return;
        }
        for (d, &pgi) in self.dir.iter_mut().zip(pg) {
            if *d * pgi >= 0.0 {
                *d = 0.0;
            }
        }
    }

    fn gradient_converged(&self, x: &[f64], pg: &[f64]) -> bool {
        norm2(pg) / norm2(x).max(1.0) < self.params.epsilon
    }

    /// Pseudo-gradient of the L1-penalized objective; plain gradient
    /// otherwise.
    ///
    /// Where a coordinate sits exactly at zero, the one-sided derivative
    /// minimizing the objective along the axis is chosen; the coordinate
    /// stays at zero when neither side descends.
    fn pseudo_gradient(&self, x: &[f64], g: &[f64]) -> Vec<f64> {
        match self.params.l1 {
            None => g.to_vec(),
            Some(c) => x
                .iter()
                .zip(g)
                .map(|(&xi, &gi)| {
                    if xi > 0.0 {
                        gi + c
                    } else if xi < 0.0 {
                        gi - c
                    } else if gi + c < 0.0 {
                        gi + c
                    } else if gi - c > 0.0 {
                        gi - c
                    } else {
                        0.0
                    }
                })
                .collect(),
        }
    }
}

fn norm2(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<F>(mut eval: F, n: usize, params: LbfgsParams, max_iter: usize) -> (Vec<f64>, Outcome)
    where
        F: FnMut(&[f64], &mut [f64]) -> f64,
    {
        let mut opt = Lbfgs::new(n, params);
        let mut x = vec![0.0; n];
        let mut g = vec![0.0; n];
        let mut outcome = Outcome::Continue;
        for _ in 0..max_iter {
            let fx = eval(&x, &mut g);
            outcome = opt.step(&mut x, fx, &g);
            if outcome != Outcome::Continue {
                break;
            }
        }
        opt.restore_best(&mut x);
        (x, outcome)
    }

    #[test]
    fn test_quadratic_converges() {
        let a = [3.0, -1.0, 0.5, 7.0];
        let (x, outcome) = run(
            |x, g| {
                let mut fx = 0.0;
                for i in 0..4 {
                    let d = x[i] - a[i];
                    fx += 0.5 * d * d;
                    g[i] = d;
                }
                fx
            },
            4,
            LbfgsParams::default(),
            200,
        );
        assert_eq!(outcome, Outcome::Converged);
        for i in 0..4 {
            assert!((x[i] - a[i]).abs() < 1e-3, "{x:?}");
        }
    }

    #[test]
    fn test_ill_conditioned_quadratic() {
        let scale = [100.0, 1.0, 0.01];
        let a = [1.0, 2.0, 3.0];
        let (x, outcome) = run(
            |x, g| {
                let mut fx = 0.0;
                for i in 0..3 {
                    let d = x[i] - a[i];
                    fx += 0.5 * scale[i] * d * d;
                    g[i] = scale[i] * d;
                }
                fx
            },
            3,
            LbfgsParams {
                delta: 0.0,
                epsilon: 1e-8,
                ..LbfgsParams::default()
            },
            2000,
        );
        assert_eq!(outcome, Outcome::Converged);
        for i in 0..3 {
            assert!((x[i] - a[i]).abs() < 1e-3, "{x:?}");
        }
    }

    #[test]
    fn test_l1_soft_threshold() {
        // min 0.5 * ||x - a||^2 + ||x||_1 has the soft-thresholded solution
        let a = [3.0, 0.1, -2.0];
        let c = 1.0;
        let (x, outcome) = run(
            |x, g| {
                let mut fx = 0.0;
                for i in 0..3 {
                    let d = x[i] - a[i];
                    fx += 0.5 * d * d;
                    g[i] = d;
                }
                fx + c * x.iter().map(|v| v.abs()).sum::<f64>()
            },
            3,
            LbfgsParams {
                l1: Some(c),
                ..LbfgsParams::default()
            },
            500,
        );
        assert_eq!(outcome, Outcome::Converged);
        assert!((x[0] - 2.0).abs() < 1e-3, "{x:?}");
        assert_eq!(x[1], 0.0, "{x:?}");
        assert!((x[2] + 1.0).abs() < 1e-3, "{x:?}");
    }

    #[test]
    fn test_non_finite_objective_fails() {
        let mut opt = Lbfgs::new(2, LbfgsParams::default());
        let mut x = vec![0.0; 2];
        assert_eq!(opt.step(&mut x, f64::NAN, &[1.0, 1.0]), Outcome::Failed);
    }
}
