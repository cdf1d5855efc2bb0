//! Limited-memory BFGS over a flat `f64` vector.
//!
//! The objective is queried through two callbacks, a loss followed by the
//! gradient at the same point, and the number of such evaluations per
//! `minimize` call is capped.

use crate::Error;
use std::collections::VecDeque;

/// A function the solver can minimize. For every point, `loss` is called
/// first and `grads` second.
pub trait Objective {
    fn loss(&mut self, x: &[f64]) -> Result<f64, Error>;
    fn grads(&mut self, x: &[f64]) -> Result<Vec<f64>, Error>;
}

/// Why the solver stopped
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The largest gradient component fell below the tolerance
    GradientTolerance,
    /// The last step barely changed the objective
    RelativeReduction,
    /// The evaluation budget ran out
    EvaluationLimit,
    /// No acceptable step could be found along the search direction, or the
    /// gradient stopped being finite
    LineSearchFailed,
}

/// The best point found by a `minimize` call
#[derive(Clone, Debug)]
pub struct Minimum {
    pub x: Vec<f64>,
    pub value: f64,
    pub evaluations: usize,
    pub iterations: usize,
    pub stop: StopReason,
}

#[derive(Clone, Debug)]
pub struct Lbfgs {
    /// Number of correction pairs kept
    pub memory: usize,
    /// Evaluations allowed per `minimize` call
    pub max_evaluations: usize,
    /// Stop once `max |g_i|` drops to this
    pub gradient_tolerance: f64,
    /// Stop once the relative reduction drops to `factor * f64::EPSILON`
    pub reduction_factor: f64,
    /// Trial steps allowed per line search
    pub max_line_search: usize,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self {
            memory: 10,
            max_evaluations: 15000,
            gradient_tolerance: 1e-5,
            reduction_factor: 1e7,
            max_line_search: 20,
        }
    }
}

/// Sufficient decrease constant of the Armijo condition
const ARMIJO: f64 = 1e-4;

struct Correction {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn max_abs(v: &[f64]) -> f64 {
    v.iter().fold(0.0f64, |m, x| m.max(x.abs()))
}

impl Lbfgs {
    pub fn with_max_evaluations(max_evaluations: usize) -> Self {
        Self {
            max_evaluations,
            ..Self::default()
        }
    }

    /// Minimizes `objective` starting from `x0`. Solver state is not kept
    /// between calls.
    pub fn minimize<O: Objective>(&self, objective: &mut O, x0: Vec<f64>) -> Result<Minimum, Error> {
        let mut evaluate = |x: &[f64]| -> Result<(f64, Vec<f64>), Error> {
            let f = objective.loss(x)?;
            let g = objective.grads(x)?;
            Ok((f, g))
        };

        let mut x = x0;
        let (mut f, mut g) = evaluate(&x)?;
        let mut used = 1;

        let mut history: VecDeque<Correction> = VecDeque::with_capacity(self.memory);
        let mut iterations = 0;

        let stop = loop {
            // a NaN would otherwise vanish in `max_abs`
            if g.iter().any(|v| !v.is_finite()) {
                break StopReason::LineSearchFailed;
            }

            if max_abs(&g) <= self.gradient_tolerance {
                break StopReason::GradientTolerance;
            }

            if used >= self.max_evaluations {
                break StopReason::EvaluationLimit;
            }

            let mut d = self.direction(&g, &history);
            let mut slope = dot(&d, &g);
            if slope >= 0.0 || !slope.is_finite() {
                // curvature information went stale, restart from steepest descent
                history.clear();
                d = g.iter().map(|v| -v).collect();
                slope = -dot(&g, &g);
            }

            let mut step = if iterations == 0 {
                (1.0 / dot(&d, &d).sqrt()).min(1.0)
            } else {
                1.0
            };

            // Backtracking line search
            let mut trials = 0;
            let accepted = loop {
                if used >= self.max_evaluations {
                    break None;
                }

                let candidate: Vec<f64> = x.iter().zip(&d).map(|(xi, di)| xi + step * di).collect();
                let (fc, gc) = evaluate(&candidate)?;
                used += 1;
                trials += 1;

                if fc.is_finite() && fc <= f + ARMIJO * step * slope {
                    break Some((candidate, fc, gc));
                }

                if trials >= self.max_line_search {
                    break None;
                }

                // minimizer of the quadratic through f, slope and fc, kept
                // within [0.1, 0.5] of the current step
                let next = if fc.is_finite() {
                    let denom = 2.0 * (fc - f - slope * step);
                    if denom > 0.0 {
                        -slope * step * step / denom
                    } else {
                        0.5 * step
                    }
                } else {
                    0.1 * step
                };
                step = next.max(0.1 * step).min(0.5 * step);
            };

            let (x_new, f_new, g_new) = match accepted {
                Some(a) => a,
                None if used >= self.max_evaluations => break StopReason::EvaluationLimit,
                None => break StopReason::LineSearchFailed,
            };

            let s: Vec<f64> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
            let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
            let sy = dot(&s, &y);
            if sy > f64::EPSILON * dot(&y, &y) {
                if history.len() == self.memory {
                    history.pop_front();
                }
                history.push_back(Correction { s, y, rho: 1.0 / sy });
            }

            let reduction = (f - f_new) / f.abs().max(f_new.abs()).max(1.0);

            x = x_new;
            f = f_new;
            g = g_new;
            iterations += 1;

            log::trace!("lbfgs iteration {}: f = {:.6e}", iterations, f);

            if reduction <= self.reduction_factor * f64::EPSILON {
                break StopReason::RelativeReduction;
            }
        };

        log::debug!(
            "lbfgs stopped after {} iterations, {} evaluations: {:?}",
            iterations,
            used,
            stop
        );

        Ok(Minimum {
            x,
            value: f,
            evaluations: used,
            iterations,
            stop,
        })
    }

    /// Two-loop recursion: `-H g` for the inverse Hessian approximation `H`
    fn direction(&self, g: &[f64], history: &VecDeque<Correction>) -> Vec<f64> {
        let mut q: Vec<f64> = g.to_vec();
        let mut alphas = Vec::with_capacity(history.len());

        for c in history.iter().rev() {
            let alpha = c.rho * dot(&c.s, &q);
            for (qi, yi) in q.iter_mut().zip(&c.y) {
                *qi -= alpha * yi;
            }
            alphas.push(alpha);
        }

        if let Some(last) = history.back() {
            let gamma = 1.0 / (last.rho * dot(&last.y, &last.y));
            for qi in &mut q {
                *qi *= gamma;
            }
        }

        for (c, alpha) in history.iter().zip(alphas.iter().rev()) {
            let beta = c.rho * dot(&c.y, &q);
            for (qi, si) in q.iter_mut().zip(&c.s) {
                *qi += (alpha - beta) * si;
            }
        }

        for qi in &mut q {
            *qi = -*qi;
        }
        q
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Evaluates a closure, recording how often each callback runs
    struct Counted<F> {
        f: F,
        losses: usize,
        grads: usize,
        pending: Option<Vec<f64>>,
    }

    impl<F> Counted<F>
    where
        F: Fn(&[f64]) -> (f64, Vec<f64>),
    {
        fn new(f: F) -> Self {
            Self {
                f,
                losses: 0,
                grads: 0,
                pending: None,
            }
        }
    }

    impl<F> Objective for Counted<F>
    where
        F: Fn(&[f64]) -> (f64, Vec<f64>),
    {
        fn loss(&mut self, x: &[f64]) -> Result<f64, Error> {
            assert!(self.pending.is_none());
            self.losses += 1;
            let (f, g) = (self.f)(x);
            self.pending = Some(g);
            Ok(f)
        }

        fn grads(&mut self, _x: &[f64]) -> Result<Vec<f64>, Error> {
            self.grads += 1;
            Ok(self.pending.take().unwrap())
        }
    }

    fn quadratic(x: &[f64]) -> (f64, Vec<f64>) {
        // sum of i * (x_i - i)^2
        let f = x
            .iter()
            .enumerate()
            .map(|(i, v)| (i + 1) as f64 * (v - i as f64).powi(2))
            .sum();
        let g = x
            .iter()
            .enumerate()
            .map(|(i, v)| 2.0 * (i + 1) as f64 * (v - i as f64))
            .collect();
        (f, g)
    }

    fn rosenbrock(x: &[f64]) -> (f64, Vec<f64>) {
        let (a, b) = (x[0], x[1]);
        let f = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
        let g = vec![
            -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
            200.0 * (b - a * a),
        ];
        (f, g)
    }

    #[test]
    fn solves_a_quadratic() {
        let solver = Lbfgs {
            reduction_factor: 0.0,
            ..Lbfgs::default()
        };
        let mut obj = Counted::new(quadratic);
        let min = solver.minimize(&mut obj, vec![10.0; 6]).unwrap();

        for (i, v) in min.x.iter().enumerate() {
            assert!((v - i as f64).abs() < 1e-4, "x[{}] = {}", i, v);
        }
        assert!(min.value < 1e-8);
        assert_eq!(obj.losses, min.evaluations);
        assert_eq!(obj.grads, min.evaluations);
    }

    #[test]
    fn solves_rosenbrock() {
        let solver = Lbfgs {
            reduction_factor: 0.0,
            ..Lbfgs::default()
        };
        let mut obj = Counted::new(rosenbrock);
        let min = solver.minimize(&mut obj, vec![-1.2, 1.0]).unwrap();

        assert!((min.x[0] - 1.0).abs() < 1e-3, "{:?}", min);
        assert!((min.x[1] - 1.0).abs() < 1e-3, "{:?}", min);
    }

    #[test]
    fn respects_the_evaluation_cap() {
        let mut obj = Counted::new(rosenbrock);
        let min = Lbfgs::with_max_evaluations(20)
            .minimize(&mut obj, vec![-1.2, 1.0])
            .unwrap();

        assert_eq!(min.stop, StopReason::EvaluationLimit);
        assert!(min.evaluations <= 20);
        assert_eq!(obj.losses, min.evaluations);

        // the returned point is never worse than the start
        assert!(min.value <= rosenbrock(&[-1.2, 1.0]).0);
        assert_eq!(min.value, rosenbrock(&min.x).0);
    }

    #[test]
    fn stops_immediately_at_a_minimum() {
        let mut obj = Counted::new(quadratic);
        let min = Lbfgs::default()
            .minimize(&mut obj, vec![0.0, 1.0, 2.0])
            .unwrap();

        assert_eq!(min.stop, StopReason::GradientTolerance);
        assert_eq!(min.evaluations, 1);
        assert_eq!(min.iterations, 0);
    }

    #[test]
    fn non_finite_gradient_is_a_failure() {
        let mut obj = Counted::new(|x: &[f64]| (x[0] * x[0], vec![f64::NAN; x.len()]));
        let min = Lbfgs::default().minimize(&mut obj, vec![3.0, 4.0]).unwrap();

        assert_eq!(min.stop, StopReason::LineSearchFailed);
        assert_eq!(min.evaluations, 1);
        assert_eq!(min.x, vec![3.0, 4.0]);
    }

    #[test]
    fn propagates_objective_errors() {
        struct Broken;
        impl Objective for Broken {
            fn loss(&mut self, _x: &[f64]) -> Result<f64, Error> {
                Ok(1.0)
            }
            fn grads(&mut self, _x: &[f64]) -> Result<Vec<f64>, Error> {
                Err(crate::errors::ProtocolViolation::GradsBeforeLoss.into())
            }
        }

        assert!(Lbfgs::default().minimize(&mut Broken, vec![0.0]).is_err());
    }
}
