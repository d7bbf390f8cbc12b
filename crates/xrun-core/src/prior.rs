use rand::distributions::Open01;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::str::FromStr;

use crate::error::{Result, XrunError};
use crate::likelihood::Distribution;
use crate::params::ParamSpace;

#[derive(Debug, Clone, PartialEq)]
pub struct Prior {
    pub name: String,
    pub dist: Distribution,
}

impl Prior {
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = |why: &str| {
            XrunError::Configuration(format!("invalid prior spec {:?}: {}", spec, why))
        };
        let (name, rhs) = spec
            .split_once('=')
            .ok_or_else(|| invalid("expected NAME=U?LO,HI or NAME=N?MEAN,SD"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        let (kind, args) = rhs
            .split_once('?')
            .ok_or_else(|| invalid("missing distribution code"))?;
        let args = args
            .split(',')
            .map(|s| s.trim().parse::<f64>().map_err(|_| invalid("not a number")))
            .collect::<Result<Vec<_>>>()?;
        let [a, b] = args[..] else {
            return Err(invalid("expected two numbers"));
        };
        let dist = match kind.trim() {
            "U" => Distribution::Uniform { lower: a, upper: b },
            "N" => Distribution::Normal { mean: a, sd: b },
            other => return Err(invalid(&format!("unknown distribution {:?}", other))),
        };
        dist.validate()?;
        Ok(Self {
            name: name.to_string(),
            dist,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleMethod {
    #[default]
    MonteCarlo,
    LatinHypercube,
}

impl FromStr for SampleMethod {
    type Err = XrunError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "montecarlo" => Ok(SampleMethod::MonteCarlo),
            "lhs" => Ok(SampleMethod::LatinHypercube),
            other => Err(XrunError::Configuration(format!(
                "unknown sampling method {:?} (expected montecarlo or lhs)",
                other
            ))),
        }
    }
}

impl ParamSpace {
    pub fn sample(
        priors: &[Prior],
        size: usize,
        method: SampleMethod,
        seed: Option<u64>,
    ) -> Result<Self> {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut columns = Vec::with_capacity(priors.len());
        for prior in priors {
            let quantiles: Vec<f64> = match method {
                SampleMethod::MonteCarlo => (0..size).map(|_| rng.sample(Open01)).collect(),
                SampleMethod::LatinHypercube => {
                    let mut strata: Vec<usize> = (0..size).collect();
                    strata.shuffle(&mut rng);
                    strata
                        .into_iter()
                        .map(|k| (k as f64 + rng.sample::<f64, _>(Open01)) / size as f64)
                        .collect()
                }
            };
            columns.push(quantiles.into_iter().map(|u| prior.dist.ppf(u)).collect::<Vec<_>>());
        }
        let rows = (0..size)
            .map(|i| columns.iter().map(|c| c[i]).collect())
            .collect();
        ParamSpace::new(priors.iter().map(|p| p.name.clone()).collect(), rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priors() -> Vec<Prior> {
        vec![
            Prior::parse("a=U?0,1").expect("uniform"),
            Prior::parse("b=N?10,2").expect("normal"),
        ]
    }

    #[test]
    fn parse_reads_both_distribution_codes() {
        let p = priors();
        assert_eq!(p[0].dist, Distribution::Uniform { lower: 0.0, upper: 1.0 });
        assert_eq!(p[1].dist, Distribution::Normal { mean: 10.0, sd: 2.0 });
        assert!(Prior::parse("a=X?0,1").is_err());
        assert!(Prior::parse("a=U?1,0").is_err());
        assert!(Prior::parse("a=N?0").is_err());
        assert!(Prior::parse("a=0,1").is_err());
    }

    #[test]
    fn same_seed_gives_same_table() {
        let one = ParamSpace::sample(&priors(), 10, SampleMethod::MonteCarlo, Some(4)).expect("one");
        let two = ParamSpace::sample(&priors(), 10, SampleMethod::MonteCarlo, Some(4)).expect("two");
        let other = ParamSpace::sample(&priors(), 10, SampleMethod::MonteCarlo, Some(5)).expect("other");
        assert_eq!(one, two);
        assert_ne!(one, other);
        assert_eq!(one.size(), 10);
        assert_eq!(one.names(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn uniform_draws_stay_inside_bounds() {
        let space = ParamSpace::sample(&priors(), 200, SampleMethod::MonteCarlo, Some(1)).expect("sample");
        for i in 0..space.size() {
            let row = space.row(i).expect("row");
            assert!(row[0] > 0.0 && row[0] < 1.0, "{:?}", row);
            assert!(row[1].is_finite());
        }
    }

    #[test]
    fn latin_hypercube_fills_every_stratum() {
        let size = 8;
        let space =
            ParamSpace::sample(&priors(), size, SampleMethod::LatinHypercube, Some(7)).expect("sample");
        let mut strata: Vec<usize> = (0..size)
            .map(|i| (space.row(i).expect("row")[0] * size as f64) as usize)
            .collect();
        strata.sort_unstable();
        assert_eq!(strata, (0..size).collect::<Vec<_>>());
        assert_eq!("lhs".parse::<SampleMethod>().expect("lhs"), SampleMethod::LatinHypercube);
        assert!("grid".parse::<SampleMethod>().is_err());
    }
}
