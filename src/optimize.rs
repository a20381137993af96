//! Batch minimization of an [`Objective`] over a flat parameter vector.

use log::{debug, warn};
use ndarray::Array1;

use crate::error::{Error, Result};
use crate::objective::Objective;

/// Outcome of one minimizer call.
#[derive(Clone, Debug)]
pub struct Minimization {
    pub params: Array1<f64>,
    /// Loss at the starting point, then after every successful line search.
    pub losses: Vec<f64>,
    /// Number of objective evaluations spent.
    pub evaluations: usize,
}

impl Minimization {
    pub fn initial_loss(&self) -> f64 {
        self.losses[0]
    }

    pub fn final_loss(&self) -> f64 {
        self.losses[self.losses.len() - 1]
    }
}

/// Anything that can improve a flat parameter vector given a loss and its gradient.
///
/// Implementations must never return parameters with a higher loss than `start`.
pub trait Minimizer {
    fn minimize(
        &self,
        objective: &dyn Objective,
        start: Array1<f64>,
        line_searches: usize,
    ) -> Result<Minimization>;
}

/// Nonlinear conjugate gradient with Polak-Ribière directions and a line search
/// that interpolates (quadratic / cubic) and extrapolates until the strong
/// Wolfe-Powell conditions hold.
#[derive(Clone, Debug)]
pub struct ConjugateGradient {
    /// Do not re-evaluate within this fraction of the current bracket
    pub interpolate: f64,
    /// Extrapolate at most this many times the current step
    pub extrapolate: f64,
    /// Evaluations allowed per line search
    pub max_evaluations: usize,
    /// Largest allowed growth of the initial step between line searches
    pub max_slope_ratio: f64,
    /// Curvature condition constant
    pub sig: f64,
    /// Sufficient decrease constant
    pub rho: f64,
}

impl Default for ConjugateGradient {
    fn default() -> Self {
        Self {
            interpolate: 0.1,
            extrapolate: 3.0,
            max_evaluations: 20,
            max_slope_ratio: 10.0,
            sig: 0.1,
            rho: 0.05,
        }
    }
}

impl Minimizer for ConjugateGradient {
    fn minimize(
        &self,
        objective: &dyn Objective,
        start: Array1<f64>,
        line_searches: usize,
    ) -> Result<Minimization> {
        let (int, ext, sig, rho) = (self.interpolate, self.extrapolate, self.sig, self.rho);

        let mut x = start;
        let (mut f1, mut df1) = objective.loss_and_gradient(x.view())?;
        let mut evaluations = 1;
        let mut losses = vec![f1];

        let mut s = -&df1;
        let mut d1 = -s.dot(&s);
        let mut z1 = 1.0 / (1.0 - d1);
        let mut searches = 0;
        let mut failed_last = false;

        while searches < line_searches {
            searches += 1;
            let (x0, f0, df0) = (x.clone(), f1, df1.clone());

            let mut budget = self.max_evaluations;
            let (step, mut f2, mut df2) =
                step_and_evaluate(objective, &mut x, &s, z1, &mut budget, &mut evaluations)?;
            z1 = step;
            let mut d2 = df2.dot(&s);
            let (mut f3, mut d3, mut z3) = (f1, d1, -z1);
            let mut limit = -1.0;
            let mut success = false;

            loop {
                // shrink while the step is too long or the slope too steep
                while (f2 > f1 + z1 * rho * d1 || d2 > -sig * d1) && budget > 0 {
                    limit = z1;
                    let mut z2 = if f2 > f1 {
                        z3 - (0.5 * d3 * z3 * z3) / (d3 * z3 + f2 - f3)
                    } else {
                        let a = 6.0 * (f2 - f3) / z3 + 3.0 * (d2 + d3);
                        let b = 3.0 * (f3 - f2) - z3 * (d3 + 2.0 * d2);
                        ((b * b - a * d2 * z3 * z3).sqrt() - b) / a
                    };
                    if !z2.is_finite() {
                        z2 = z3 / 2.0;
                    }
                    z2 = z2.min(int * z3).max((1.0 - int) * z3);
                    (z2, f2, df2) = step_and_evaluate(
                        objective,
                        &mut x,
                        &s,
                        z2,
                        &mut budget,
                        &mut evaluations,
                    )?;
                    z1 += z2;
                    budget = budget.saturating_sub(1);
                    d2 = df2.dot(&s);
                    z3 -= z2;
                }

                if f2 > f1 + z1 * rho * d1 || d2 > -sig * d1 {
                    break;
                } else if d2 > sig * d1 {
                    success = true;
                    break;
                } else if budget == 0 {
                    break;
                }

                // extrapolate along the cubic
                let a = 6.0 * (f2 - f3) / z3 + 3.0 * (d2 + d3);
                let b = 3.0 * (f3 - f2) - z3 * (d3 + 2.0 * d2);
                let mut z2 = -d2 * z3 * z3 / (b + (b * b - a * d2 * z3 * z3).sqrt());
                if !z2.is_finite() || z2 < 0.0 {
                    z2 = if limit < -0.5 {
                        z1 * (ext - 1.0)
                    } else {
                        (limit - z1) / 2.0
                    };
                } else if limit > -0.5 && z2 + z1 > limit {
                    z2 = (limit - z1) / 2.0;
                } else if limit < -0.5 && z2 + z1 > z1 * ext {
                    z2 = z1 * (ext - 1.0);
                } else if z2 < -z3 * int {
                    z2 = -z3 * int;
                } else if limit > -0.5 && z2 < (limit - z1) * (1.0 - int) {
                    z2 = (limit - z1) * (1.0 - int);
                }
                f3 = f2;
                d3 = d2;
                (z2, f2, df2) =
                    step_and_evaluate(objective, &mut x, &s, z2, &mut budget, &mut evaluations)?;
                z3 = -z2;
                z1 += z2;
                budget = budget.saturating_sub(1);
                d2 = df2.dot(&s);
            }

            if success {
                f1 = f2;
                losses.push(f1);
                debug!("line search {searches}: loss {f1:.6}");
                let beta = (df2.dot(&df2) - df1.dot(&df2)) / df1.dot(&df1);
                s = &s * beta - &df2;
                df1 = df2;
                d2 = df1.dot(&s);
                if d2 > 0.0 {
                    s = -&df1;
                    d2 = -s.dot(&s);
                }
                z1 *= self.max_slope_ratio.min(d1 / (d2 - f64::MIN_POSITIVE));
                d1 = d2;
                failed_last = false;
            } else {
                x = x0;
                f1 = f0;
                df1 = df0;
                if failed_last || searches >= line_searches {
                    if failed_last {
                        warn!("line search failed twice in a row at loss {f1:.6}");
                    }
                    break;
                }
                // restart along steepest descent
                s = -&df1;
                d1 = -s.dot(&s);
                z1 = 1.0 / (1.0 - d1);
                failed_last = true;
            }
        }

        Ok(Minimization {
            params: x,
            losses,
            evaluations,
        })
    }
}

/// Moves `x` by `step` along `direction` and evaluates there.
///
/// A step whose loss is not finite overshot; it is taken back and halved,
/// spending `budget`, until the loss is finite. Only when the budget is gone
/// does the overflow reach the caller.
fn step_and_evaluate(
    objective: &dyn Objective,
    x: &mut Array1<f64>,
    direction: &Array1<f64>,
    mut step: f64,
    budget: &mut usize,
    evaluations: &mut usize,
) -> Result<(f64, f64, Array1<f64>)> {
    loop {
        x.scaled_add(step, direction);
        *evaluations += 1;
        match objective.loss_and_gradient(x.view()) {
            Ok((loss, gradient)) => return Ok((step, loss, gradient)),
            Err(Error::NonFinite(what)) if *budget > 0 => {
                debug!("{what} at step {step:.3e}, halving");
                x.scaled_add(-step, direction);
                step /= 2.0;
                *budget -= 1;
            }
            Err(err) => return Err(err),
        }
    }
}
