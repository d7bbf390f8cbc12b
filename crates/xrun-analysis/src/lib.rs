use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use tracing::{info, warn};

use xrun_core::params::render_table;
use xrun_core::{
    atomic_write_bytes, atomic_write_json_pretty, ensure_dir, format_value, Likelihood, Model,
    Result, XrunError,
};

pub const OUTPUT_FILE: &str = "output.txt";
pub const LOGLIKS_FILE: &str = "logliks.txt";
pub const WEIGHTS_FILE: &str = "weights.txt";
pub const VALID_FILE: &str = "valid.txt";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table<T> {
    names: Vec<String>,
    rows: Vec<Vec<T>>,
}

impl<T> Table<T> {
    pub fn new(names: Vec<String>, rows: Vec<Vec<T>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == names.len()));
        Self { names, rows }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn rows(&self) -> &[Vec<T>] {
        &self.rows
    }

    pub fn nrows(&self) -> usize {
        self.rows.len()
    }

    pub fn ncols(&self) -> usize {
        self.names.len()
    }

    pub fn row(&self, i: usize) -> Option<&[T]> {
        self.rows.get(i).map(Vec::as_slice)
    }

    pub fn column(&self, name: &str) -> Option<Vec<&T>> {
        let j = self.names.iter().position(|n| n == name)?;
        Some(self.rows.iter().map(|r| &r[j]).collect())
    }

    fn render(&self, cell: impl Fn(&T) -> String) -> String {
        let rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|r| r.iter().map(&cell).collect())
            .collect();
        render_table(&self.names, &rows)
    }
}

impl Table<f64> {
    pub fn to_table_string(&self) -> String {
        self.render(|v| format_value(*v))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_bytes(path, self.to_table_string().as_bytes())
    }
}

impl Table<bool> {
    pub fn to_table_string(&self) -> String {
        self.render(|v| if *v { "1" } else { "0" }.to_string())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_bytes(path, self.to_table_string().as_bytes())
    }
}

pub struct Analysis {
    members: Vec<Box<dyn Model>>,
    loaded: Vec<bool>,
    likelihood: Likelihood,
}

impl Analysis {
    pub fn load(mut members: Vec<Box<dyn Model>>, likelihood: Likelihood) -> Self {
        let loaded = members
            .iter_mut()
            .enumerate()
            .map(|(i, m)| match m.load() {
                Ok(()) => true,
                Err(err) => {
                    warn!(runid = i, rundir = %m.rundir().display(), "could not load run {}: {}", i, err);
                    false
                }
            })
            .collect();
        Self {
            members,
            loaded,
            likelihood,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn likelihood(&self) -> &Likelihood {
        &self.likelihood
    }

    pub fn members(&self) -> &[Box<dyn Model>] {
        &self.members
    }

    pub fn is_success(&self, i: usize) -> bool {
        self.loaded.get(i).copied().unwrap_or(false) && self.members[i].status().is_success()
    }

    pub fn successes(&self) -> usize {
        (0..self.len()).filter(|&i| self.is_success(i)).count()
    }

    pub fn postprocess(&self) -> Vec<Option<Value>> {
        self.members
            .iter()
            .enumerate()
            .map(|(i, m)| {
                if !self.is_success(i) {
                    return None;
                }
                match m.postprocess() {
                    Ok(v) => Some(v),
                    Err(err) => {
                        warn!(runid = i, "postprocess of run {} failed: {}", i, err);
                        None
                    }
                }
            })
            .collect()
    }

    pub fn first_valid(&self) -> Result<usize> {
        (0..self.len())
            .find(|&i| self.is_success(i))
            .ok_or(XrunError::NoSuccessfulRun)
    }

    pub fn output_names(&self) -> Result<Vec<String>> {
        let i = self.first_valid()?;
        Ok(self.members[i].output().keys().cloned().collect())
    }

    pub fn output(&self, names: Option<&[String]>) -> Result<Table<f64>> {
        let names = match names {
            Some(names) => names.to_vec(),
            None => self.output_names()?,
        };
        let rows = self
            .members
            .iter()
            .enumerate()
            .map(|(i, m)| {
                if !self.is_success(i) {
                    return vec![f64::NAN; names.len()];
                }
                names
                    .iter()
                    .map(|n| m.output().get(n).map_or(f64::NAN, |v| v.as_scalar()))
                    .collect()
            })
            .collect();
        Ok(Table::new(names, rows))
    }

    pub fn params(&self, names: Option<&[String]>) -> Result<Table<f64>> {
        let names = match names {
            Some(names) => names.to_vec(),
            None => self.members[self.first_valid()?].params().names().to_vec(),
        };
        let rows = self
            .members
            .iter()
            .map(|m| {
                names
                    .iter()
                    .map(|n| m.params().get(n).unwrap_or(f64::NAN))
                    .collect()
            })
            .collect();
        Ok(Table::new(names, rows))
    }

    // Columns follow the ensemble likelihood; each member is scored with
    // its own term of the same name. NaN where either side is missing.
    pub fn logliks(&self) -> Table<f64> {
        let names = self.likelihood.names();
        let rows = self
            .members
            .iter()
            .enumerate()
            .map(|(i, m)| {
                if !self.is_success(i) {
                    return vec![f64::NAN; names.len()];
                }
                names
                    .iter()
                    .map(|n| match (m.likelihood().get(n), m.output().get(n)) {
                        (Some(d), Some(v)) => d.logpdf(v.as_scalar()),
                        _ => f64::NAN,
                    })
                    .collect()
            })
            .collect();
        Table::new(names, rows)
    }

    pub fn weight(&self) -> Vec<f64> {
        let logliks = self.logliks();
        logliks
            .rows()
            .iter()
            .enumerate()
            .map(|(i, row)| {
                if !self.is_success(i) || row.iter().any(|v| v.is_nan()) {
                    0.0
                } else {
                    row.iter().sum::<f64>().exp()
                }
            })
            .collect()
    }

    pub fn valids(&self, alpha: Option<f64>, names: Option<&[String]>) -> Result<Table<bool>> {
        let names = match names {
            Some(names) => names.to_vec(),
            None => self.likelihood.names(),
        };
        if let Some(n) = names.iter().find(|n| self.likelihood.get(n).is_none()) {
            return Err(XrunError::Configuration(format!(
                "no likelihood term {:?}; available: {}",
                n,
                self.likelihood.names().join(" ")
            )));
        }
        let rows = self
            .members
            .iter()
            .enumerate()
            .map(|(i, m)| {
                if !self.is_success(i) {
                    return vec![false; names.len()];
                }
                let alpha = match alpha {
                    Some(alpha) => alpha,
                    None => return vec![true; names.len()],
                };
                names
                    .iter()
                    .map(|n| match (m.likelihood().get(n), m.output().get(n)) {
                        (Some(d), Some(v)) => d.contains(v.as_scalar(), alpha),
                        _ => false,
                    })
                    .collect()
            })
            .collect();
        Ok(Table::new(names, rows))
    }

    pub fn valid(&self, alpha: Option<f64>, names: Option<&[String]>) -> Result<Vec<bool>> {
        let valids = self.valids(alpha, names)?;
        Ok(valids.rows().iter().map(|r| r.iter().all(|v| *v)).collect())
    }
}

pub fn effective_sample_size(weights: &[f64]) -> f64 {
    let sum: f64 = weights.iter().sum();
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    if sum_sq > 0.0 {
        sum * sum / sum_sq
    } else {
        0.0
    }
}

pub fn write_analysis(dir: &Path, analysis: &Analysis, alpha: Option<f64>) -> Result<Value> {
    let first_valid = analysis.first_valid()?;
    ensure_dir(dir)?;
    analysis.output(None)?.write(&dir.join(OUTPUT_FILE))?;
    analysis.logliks().write(&dir.join(LOGLIKS_FILE))?;

    let weights = analysis.weight();
    let n = weights.len();
    Table::new(
        vec!["weight".to_string()],
        weights.iter().map(|w| vec![*w]).collect(),
    )
    .write(&dir.join(WEIGHTS_FILE))?;
    let valid = analysis.valid(alpha, None)?;
    Table::new(
        vec!["valid".to_string()],
        valid.iter().map(|v| vec![*v]).collect(),
    )
    .write(&dir.join(VALID_FILE))?;

    let summary = json!({
        "schema_version": "xrun_analysis_v1",
        "members": n,
        "successes": analysis.successes(),
        "first_valid": first_valid,
        "alpha": alpha,
        "valid": valid.iter().filter(|v| **v).count(),
        "effective_sample_size": effective_sample_size(&weights),
        "output_names": analysis.output_names()?,
        "likelihood_names": analysis.likelihood().names(),
    });
    atomic_write_json_pretty(&dir.join(SUMMARY_FILE), &summary)?;
    info!(dir = %dir.display(), members = n, "analysis written");
    Ok(summary)
}
