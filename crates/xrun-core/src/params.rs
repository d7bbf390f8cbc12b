use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Result, XrunError};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParamSet {
    names: Vec<String>,
    values: Vec<f64>,
}

impl ParamSet {
    pub fn new(names: Vec<String>, values: Vec<f64>) -> Result<Self> {
        if names.len() != values.len() {
            return Err(XrunError::Configuration(format!(
                "parameter set has {} names but {} values",
                names.len(),
                values.len()
            )));
        }
        Ok(Self { names, values })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.names
            .iter()
            .map(|s| s.as_str())
            .zip(self.values.iter().copied())
    }

    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}

pub fn format_value(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value)
    } else {
        format!("{:?}", value)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParamSpace {
    names: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl ParamSpace {
    pub fn new(names: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(XrunError::Configuration(format!(
                    "invalid parameter name {:?}",
                    name
                )));
            }
            if names[..i].contains(name) {
                return Err(XrunError::Configuration(format!(
                    "duplicate parameter name {:?}",
                    name
                )));
            }
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != names.len() {
                return Err(XrunError::Configuration(format!(
                    "row {} has {} values, expected {}",
                    i,
                    row.len(),
                    names.len()
                )));
            }
        }
        Ok(Self { names, rows })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(|r| r.as_slice())
    }

    pub fn pset(&self, index: usize) -> Result<ParamSet> {
        let row = self.row(index).ok_or(XrunError::InvalidIndex {
            index,
            size: self.size(),
        })?;
        ParamSet::new(self.names.clone(), row.to_vec())
    }

    // Full factorial design; the last parameter varies fastest.
    pub fn product(params: &[DiscreteParam]) -> Result<Self> {
        let names: Vec<String> = params.iter().map(|p| p.name.clone()).collect();
        if params.is_empty() {
            return Self::new(names, Vec::new());
        }
        let mut rows: Vec<Vec<f64>> = vec![Vec::new()];
        for p in params {
            let mut next = Vec::with_capacity(rows.len() * p.values.len());
            for row in &rows {
                for v in &p.values {
                    let mut r = row.clone();
                    r.push(*v);
                    next.push(r);
                }
            }
            rows = next;
        }
        Self::new(names, rows)
    }

    pub fn to_table_string(&self) -> String {
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|r| r.iter().map(|v| format_value(*v)).collect())
            .collect();
        render_table(&self.names, &cells)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty() && !l.trim_start().starts_with('#'));
        let names: Vec<String> = match lines.next() {
            Some((_, header)) => header.split_whitespace().map(|s| s.to_string()).collect(),
            None => return Ok(Self::empty()),
        };
        let mut rows = Vec::new();
        for (lineno, line) in lines {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != names.len() {
                return Err(XrunError::ParamsFormat {
                    line: lineno + 1,
                    message: format!("expected {} fields, found {}", names.len(), fields.len()),
                });
            }
            let mut row = Vec::with_capacity(fields.len());
            for field in fields {
                let v = field.parse::<f64>().map_err(|_| XrunError::ParamsFormat {
                    line: lineno + 1,
                    message: format!("not a number: {:?}", field),
                })?;
                row.push(v);
            }
            rows.push(row);
        }
        Self::new(names, rows)
    }

    pub fn read(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        crate::atomic_write_bytes(path, self.to_table_string().as_bytes())
    }
}

pub fn render_table(names: &[String], rows: &[Vec<String>]) -> String {
    let widths: Vec<usize> = names
        .iter()
        .enumerate()
        .map(|(j, n)| {
            rows.iter()
                .filter_map(|r| r.get(j))
                .map(|c| c.len())
                .chain(std::iter::once(n.len()))
                .max()
                .unwrap_or(0)
                .max(6)
        })
        .collect();
    let mut out = String::new();
    let mut push_line = |cells: &[String]| {
        let line = cells
            .iter()
            .zip(widths.iter())
            .map(|(c, w)| format!("{:>width$}", c, width = *w))
            .collect::<Vec<_>>()
            .join(" ");
        out.push_str(&line);
        out.push('\n');
    };
    push_line(names);
    for row in rows {
        push_line(row.as_slice());
    }
    out
}

pub const MAX_RANGE_VALUES: usize = 1_000_000;

// One factor of a factorial design: `name=v1,v2,...` or
// `name=start:stop:step` (stop excluded).
#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteParam {
    pub name: String,
    pub values: Vec<f64>,
}

impl DiscreteParam {
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = |why: &str| {
            XrunError::Configuration(format!("invalid parameter spec {:?}: {}", spec, why))
        };
        let (name, rhs) = spec
            .split_once('=')
            .ok_or_else(|| invalid("expected NAME=VALUES"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        let number = |s: &str| s.trim().parse::<f64>().map_err(|_| invalid("not a number"));
        let values = if rhs.contains(':') {
            let parts: Vec<&str> = rhs.split(':').collect();
            if parts.len() != 3 {
                return Err(invalid("range must be START:STOP:STEP"));
            }
            let (start, stop, step) = (number(parts[0])?, number(parts[1])?, number(parts[2])?);
            if !(step > 0.0) || !start.is_finite() || !stop.is_finite() {
                return Err(invalid("range needs finite bounds and a positive step"));
            }
            let n = ((stop - start) / step).ceil().max(0.0);
            if n > MAX_RANGE_VALUES as f64 {
                return Err(invalid(&format!(
                    "range expands to more than {} values",
                    MAX_RANGE_VALUES
                )));
            }
            let n = n as usize;
            (0..n).map(|i| start + step * i as f64).collect()
        } else {
            rhs.split(',').map(number).collect::<Result<Vec<_>>>()?
        };
        if values.is_empty() {
            return Err(invalid("no values"));
        }
        Ok(Self {
            name: name.to_string(),
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> ParamSpace {
        let a = DiscreteParam::parse("a=2,3,4").expect("a");
        let b = DiscreteParam::parse("b=0,1").expect("b");
        ParamSpace::product(&[a, b]).expect("product")
    }

    #[test]
    fn product_varies_last_parameter_fastest() {
        let space = grid();
        assert_eq!(space.size(), 6);
        assert_eq!(space.row(0), Some(&[2.0, 0.0][..]));
        assert_eq!(space.row(1), Some(&[2.0, 1.0][..]));
        assert_eq!(space.row(5), Some(&[4.0, 1.0][..]));
        let pset = space.pset(3).expect("pset");
        assert_eq!(pset.get("a"), Some(3.0));
        assert_eq!(pset.get("b"), Some(1.0));
        assert_eq!(pset.get("c"), None);
    }

    #[test]
    fn table_text_matches_expected_layout() {
        let text = grid().to_table_string();
        let expected = "     a      b\n     2      0\n     2      1\n     3      0\n     3      1\n     4      0\n     4      1\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn params_file_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("params.txt");
        let space = ParamSpace::new(
            vec!["x".to_string(), "rate".to_string()],
            vec![vec![0.1, -3.0], vec![1e-7, 2.5e20]],
        )
        .expect("space");
        space.write(&path).expect("write");
        let back = ParamSpace::read(&path).expect("read");
        assert_eq!(back, space);
    }

    #[test]
    fn parse_reports_bad_rows() {
        let err = ParamSpace::parse("a b\n1 2\n3\n").expect_err("short row");
        match err {
            XrunError::ParamsFormat { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {}", other),
        }
        assert!(ParamSpace::parse("a\nfoo\n").is_err());
        assert_eq!(ParamSpace::parse("").expect("empty").size(), 0);
    }

    #[test]
    fn pset_out_of_range_is_invalid_index() {
        match grid().pset(6) {
            Err(XrunError::InvalidIndex { index, size }) => {
                assert_eq!((index, size), (6, 6));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn range_spec_excludes_stop() {
        let p = DiscreteParam::parse("t=0:1:0.25").expect("range");
        assert_eq!(p.values, vec![0.0, 0.25, 0.5, 0.75]);
        assert!(DiscreteParam::parse("t=0:1:0").is_err());
        assert!(DiscreteParam::parse("t=").is_err());
        assert!(DiscreteParam::parse("=1,2").is_err());
        assert!(DiscreteParam::parse("t").is_err());
    }

    #[test]
    fn oversized_range_is_rejected() {
        let err = DiscreteParam::parse("t=0:1:1e-300").expect_err("too many values");
        assert!(err.to_string().contains("more than"), "{}", err);
        let p = DiscreteParam::parse("t=0:1000:0.001").expect("at the cap");
        assert_eq!(p.values.len(), MAX_RANGE_VALUES);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = ParamSpace::new(vec!["a".to_string(), "a".to_string()], vec![])
            .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate"), "{}", err);
    }

    #[test]
    fn format_value_is_compact() {
        assert_eq!(format_value(2.0), "2");
        assert_eq!(format_value(-0.5), "-0.5");
        assert_eq!(format_value(1e-7), "1e-7");
        assert_eq!(format_value(f64::NAN), "NaN");
    }
}
