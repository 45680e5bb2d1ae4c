//! # Output-Distribution Families
//!
//! The closed set of observation models a run can select. Each family supplies
//! its canonical starting hyperparameters, the latent-scale log-PMF and its
//! first two derivatives (consumed by the Laplace approximation in the default
//! engine), and an observation sampler (consumed by the posterior-predictive
//! sampler). The family is chosen once per run and threaded through the
//! fitting pipeline as a value; call sites match on the enum, never on strings.

use rand::rngs::StdRng;
use rand_distr::{Bernoulli, Distribution, Gamma, Poisson};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Observation model for the per-feature count series.
///
/// Count families use an exponential link: the latent function `f` maps to the
/// mean rate `mu = exp(f)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    /// Gaussian noise on (optionally log1p-transformed) observations.
    Gaussian,
    /// Poisson counts with rate `exp(f)`.
    Poisson,
    /// Negative binomial (NB2) counts: `Var(Y) = mu + alpha * mu^2`.
    NegativeBinomial,
    /// Negative binomial with a zero-inflation gate whose open probability
    /// grows with the predicted rate, governed by the saturation constant `km`.
    ZeroInflatedNegativeBinomial,
}

impl Family {
    /// Stable name used in checkpoint keys and log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Family::Gaussian => "Gaussian",
            Family::Poisson => "Poisson",
            Family::NegativeBinomial => "Negative_binomial",
            Family::ZeroInflatedNegativeBinomial => "Zero_inflated_negative_binomial",
        }
    }

    /// Whether the family carries a dispersion nuisance parameter (`alpha`).
    pub fn has_dispersion(&self) -> bool {
        matches!(
            self,
            Family::NegativeBinomial | Family::ZeroInflatedNegativeBinomial
        )
    }

    /// Whether the family carries a saturation nuisance parameter (`km`).
    pub fn has_saturation(&self) -> bool {
        matches!(self, Family::ZeroInflatedNegativeBinomial)
    }

    /// Log-probability of one observation given the latent value `f`.
    ///
    /// Defined for the count families only; the Gaussian family is handled in
    /// closed form by the engine and returns NaN here.
    pub fn log_pmf(&self, y: f64, f: f64, alpha: f64, km: f64) -> f64 {
        let mu = f.exp();
        match self {
            Family::Gaussian => f64::NAN,
            Family::Poisson => y * f - mu - ln_gamma(y + 1.0),
            Family::NegativeBinomial => nb_log_pmf(y, mu, alpha),
            Family::ZeroInflatedNegativeBinomial => {
                // psi is the zero-gate probability; it decays as the rate grows.
                let psi = km / (km + mu);
                let nb = nb_log_pmf(y, mu, alpha);
                if y == 0.0 {
                    log_sum_exp(psi.ln(), (1.0 - psi).ln() + nb)
                } else {
                    (1.0 - psi).ln() + nb
                }
            }
        }
    }

    /// First derivative of `log_pmf` with respect to the latent value `f`.
    pub fn d_log_pmf(&self, y: f64, f: f64, alpha: f64, km: f64) -> f64 {
        let mu = f.exp();
        match self {
            Family::Gaussian => f64::NAN,
            Family::Poisson => y - mu,
            Family::NegativeBinomial => {
                let r = 1.0 / alpha;
                y - mu * (r + y) / (r + mu)
            }
            Family::ZeroInflatedNegativeBinomial => {
                // The gate couples mu into both mixture branches; central
                // differences keep the curvature consistent with log_pmf.
                let h = 1e-5;
                (self.log_pmf(y, f + h, alpha, km) - self.log_pmf(y, f - h, alpha, km)) / (2.0 * h)
            }
        }
    }

    /// Negated second derivative of `log_pmf` with respect to `f`, floored at
    /// a small positive value so the Laplace Newton step stays well posed.
    pub fn curvature(&self, y: f64, f: f64, alpha: f64, km: f64) -> f64 {
        let mu = f.exp();
        let w = match self {
            Family::Gaussian => f64::NAN,
            Family::Poisson => mu,
            Family::NegativeBinomial => {
                let r = 1.0 / alpha;
                mu * r * (r + y) / ((r + mu) * (r + mu))
            }
            Family::ZeroInflatedNegativeBinomial => {
                let h = 1e-4;
                -(self.log_pmf(y, f + h, alpha, km) - 2.0 * self.log_pmf(y, f, alpha, km)
                    + self.log_pmf(y, f - h, alpha, km))
                    / (h * h)
            }
        };
        w.max(1e-12)
    }

    /// Draws `n` observation samples at one predicted mean rate.
    ///
    /// Negative binomial draws use the gamma-Poisson mixture with
    /// `r = 1/alpha` failures and success probability `p = r/(mean+r)`. The
    /// zero-inflated family draws a single Bernoulli gate per rate: a closed
    /// gate yields an all-zero trajectory.
    pub fn sample_counts(&self, mean: f64, alpha: f64, km: f64, n: usize, rng: &mut StdRng) -> Vec<f64> {
        if mean <= 0.0 || !mean.is_finite() {
            return vec![0.0; n];
        }
        match self {
            Family::Gaussian => vec![mean; n],
            Family::Poisson => {
                let pois = Poisson::new(mean).expect("positive mean");
                (0..n).map(|_| pois.sample(rng)).collect()
            }
            Family::NegativeBinomial => sample_negative_binomial(mean, alpha, n, rng),
            Family::ZeroInflatedNegativeBinomial => {
                let psi = 1.0 - mean / (km + mean);
                let gate = Bernoulli::new((1.0 - psi).clamp(0.0, 1.0)).expect("probability in [0,1]");
                if gate.sample(rng) {
                    sample_negative_binomial(mean, alpha, n, rng)
                } else {
                    vec![0.0; n]
                }
            }
        }
    }
}

fn sample_negative_binomial(mean: f64, alpha: f64, n: usize, rng: &mut StdRng) -> Vec<f64> {
    let r = 1.0 / alpha.max(1e-10);
    let p = r / (mean + r);
    // lambda ~ Gamma(r, (1-p)/p) followed by Poisson(lambda) is NB(r, p).
    let gamma = Gamma::new(r, (1.0 - p) / p).expect("valid gamma parameters");
    (0..n)
        .map(|_| {
            let lambda: f64 = gamma.sample(rng);
            if lambda <= 0.0 {
                0.0
            } else {
                Poisson::new(lambda).expect("positive rate").sample(rng)
            }
        })
        .collect()
}

/// NB2 log-PMF parameterized by mean `mu` and dispersion `alpha`.
fn nb_log_pmf(y: f64, mu: f64, alpha: f64) -> f64 {
    let r = 1.0 / alpha.max(1e-10);
    let p = r / (r + mu);
    ln_gamma(y + r) - ln_gamma(r) - ln_gamma(y + 1.0) + r * p.ln() + y * (1.0 - p).ln()
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    if m.is_infinite() && m < 0.0 {
        return f64::NEG_INFINITY;
    }
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// Lanczos approximation (g=7, n=9) of the log-gamma function.
pub fn ln_gamma(x: f64) -> f64 {
    if x <= 0.0 {
        return f64::INFINITY;
    }
    let coefficients = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        return PI.ln() - (PI * x).sin().ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut a = coefficients[0];
    let t = x + 7.5;
    for (i, &coeff) in coefficients.iter().enumerate().skip(1) {
        a += coeff / (x + i as f64);
    }
    0.5 * (2.0 * PI).ln() + t.ln() * (x + 0.5) - t + a.ln()
}
