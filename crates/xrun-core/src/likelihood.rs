use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{Result, XrunError};
use crate::model::Output;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dist", rename_all = "snake_case")]
pub enum Distribution {
    Normal { mean: f64, sd: f64 },
    Uniform { lower: f64, upper: f64 },
}

impl Distribution {
    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            Distribution::Normal { mean, sd } => mean.is_finite() && sd.is_finite() && sd > 0.0,
            Distribution::Uniform { lower, upper } => {
                lower.is_finite() && upper.is_finite() && upper > lower
            }
        };
        if ok {
            Ok(())
        } else {
            Err(XrunError::Configuration(format!(
                "invalid distribution parameters: {:?}",
                self
            )))
        }
    }

    pub fn logpdf(&self, x: f64) -> f64 {
        if x.is_nan() {
            return f64::NAN;
        }
        match *self {
            Distribution::Normal { mean, sd } => {
                let z = (x - mean) / sd;
                -0.5 * z * z - sd.ln() - 0.5 * (2.0 * PI).ln()
            }
            Distribution::Uniform { lower, upper } => {
                if x >= lower && x <= upper {
                    -(upper - lower).ln()
                } else {
                    f64::NEG_INFINITY
                }
            }
        }
    }

    pub fn ppf(&self, p: f64) -> f64 {
        if p.is_nan() || !(0.0..=1.0).contains(&p) {
            return f64::NAN;
        }
        match *self {
            Distribution::Normal { mean, sd } => mean + sd * norm_ppf(p),
            Distribution::Uniform { lower, upper } => lower + p * (upper - lower),
        }
    }

    pub fn interval(&self, alpha: f64) -> (f64, f64) {
        let alpha = alpha.clamp(0.0, 1.0);
        match *self {
            Distribution::Normal { mean, sd } => {
                let z = norm_ppf(0.5 + alpha / 2.0);
                (mean - sd * z, mean + sd * z)
            }
            Distribution::Uniform { lower, upper } => {
                let center = 0.5 * (lower + upper);
                let half = 0.5 * alpha * (upper - lower);
                (center - half, center + half)
            }
        }
    }

    pub fn contains(&self, x: f64, alpha: f64) -> bool {
        let (lo, hi) = self.interval(alpha);
        x >= lo && x <= hi
    }
}

// Inverse of the standard normal CDF (Acklam's rational approximation,
// relative error below 1.2e-9).
pub fn norm_ppf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p.is_nan() || !(0.0..=1.0).contains(&p) {
        return f64::NAN;
    }
    if p == 0.0 {
        return f64::NEG_INFINITY;
    }
    if p == 1.0 {
        return f64::INFINITY;
    }
    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -norm_ppf(1.0 - p)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodTerm {
    pub name: String,
    #[serde(flatten)]
    pub dist: Distribution,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Likelihood {
    terms: Vec<LikelihoodTerm>,
}

impl Likelihood {
    pub fn new(terms: Vec<LikelihoodTerm>) -> Result<Self> {
        let lik = Self { terms };
        lik.validate()?;
        Ok(lik)
    }

    pub fn validate(&self) -> Result<()> {
        for (i, term) in self.terms.iter().enumerate() {
            term.dist.validate()?;
            if self.terms[..i].iter().any(|t| t.name == term.name) {
                return Err(XrunError::Configuration(format!(
                    "duplicate likelihood term {:?}",
                    term.name
                )));
            }
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.terms.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Distribution> {
        self.terms.iter().find(|t| t.name == name).map(|t| &t.dist)
    }

    pub fn terms(&self) -> &[LikelihoodTerm] {
        &self.terms
    }

    pub fn logpdf(&self, output: &Output) -> Vec<f64> {
        self.terms
            .iter()
            .map(|t| {
                output
                    .get(&t.name)
                    .map(|v| t.dist.logpdf(v.as_scalar()))
                    .unwrap_or(f64::NAN)
            })
            .collect()
    }
}
