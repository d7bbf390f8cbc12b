use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use xrun_core::{format_value, ParamSpace, Result, XrunError};

pub const DEFAULT_RUNDIR: &str = "default";

#[derive(Debug, Clone, PartialEq)]
pub enum RundirMode {
    Template(String),
    Auto,
}

#[derive(Debug, Clone)]
pub struct RundirResolver {
    expdir: PathBuf,
    mode: RundirMode,
}

impl RundirResolver {
    pub fn template(expdir: impl Into<PathBuf>, template: &str) -> Result<Self> {
        if !template.contains("{}") && !template.contains("{runid}") {
            return Err(XrunError::Configuration(format!(
                "rundir template {:?} must contain {{}} or {{runid}}",
                template
            )));
        }
        Ok(Self {
            expdir: expdir.into(),
            mode: RundirMode::Template(template.to_string()),
        })
    }

    pub fn auto(expdir: impl Into<PathBuf>) -> Self {
        Self {
            expdir: expdir.into(),
            mode: RundirMode::Auto,
        }
    }

    pub fn expdir(&self) -> &Path {
        &self.expdir
    }

    pub fn mode(&self) -> &RundirMode {
        &self.mode
    }

    pub fn rundir(&self, runid: Option<usize>, space: &ParamSpace) -> Result<PathBuf> {
        let runid = match runid {
            Some(i) => i,
            None => return Ok(self.expdir.join(DEFAULT_RUNDIR)),
        };
        match &self.mode {
            RundirMode::Template(template) => {
                if runid >= space.size() {
                    return Err(XrunError::InvalidIndex {
                        index: runid,
                        size: space.size(),
                    });
                }
                let id = runid.to_string();
                Ok(self
                    .expdir
                    .join(template.replace("{runid}", &id).replace("{}", &id)))
            }
            RundirMode::Auto => {
                let row = space.row(runid).ok_or(XrunError::InvalidIndex {
                    index: runid,
                    size: space.size(),
                })?;
                Ok(self.expdir.join(autofolder(space.names(), row)))
            }
        }
    }

    pub fn check_unique(&self, space: &ParamSpace) -> Result<()> {
        if self.mode != RundirMode::Auto {
            return Ok(());
        }
        if space.names().is_empty() && space.size() > 0 {
            return Err(XrunError::Configuration(format!(
                "autodir needs named parameters; unnamed members would share {:?}",
                DEFAULT_RUNDIR
            )));
        }
        let mut seen: BTreeMap<String, usize> = BTreeMap::new();
        for i in 0..space.size() {
            let row = space.row(i).unwrap_or(&[]);
            let name = autofolder(space.names(), row);
            if let Some(first) = seen.insert(name.clone(), i) {
                return Err(XrunError::Configuration(format!(
                    "members {} and {} resolve to the same run directory {:?}",
                    first, i, name
                )));
            }
        }
        Ok(())
    }
}

// `a=2,b=0.5`; names are percent-escaped outside `[A-Za-z0-9._-]` so the
// mapping stays injective.
pub fn autofolder(names: &[String], values: &[f64]) -> String {
    if names.is_empty() {
        return DEFAULT_RUNDIR.to_string();
    }
    names
        .iter()
        .zip(values.iter())
        .map(|(n, v)| format!("{}={}", sanitize_name(n), format_value(normalize_zero(*v))))
        .collect::<Vec<_>>()
        .join(",")
}

fn normalize_zero(v: f64) -> f64 {
    if v == 0.0 {
        0.0
    } else {
        v
    }
}

fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b"._-".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrun_core::DiscreteParam;

    fn space() -> ParamSpace {
        ParamSpace::product(&[
            DiscreteParam::parse("a=2,3").expect("a"),
            DiscreteParam::parse("b=0,0.5").expect("b"),
        ])
        .expect("space")
    }

    #[test]
    fn template_substitutes_index() {
        let r = RundirResolver::template("out", "run_{runid}").expect("template");
        assert_eq!(r.rundir(Some(3), &space()).expect("rundir"), PathBuf::from("out/run_3"));
        let r = RundirResolver::template("out", "{}").expect("template");
        assert_eq!(r.rundir(Some(0), &space()).expect("rundir"), PathBuf::from("out/0"));
        assert_eq!(r.rundir(None, &space()).expect("default"), PathBuf::from("out/default"));
    }

    #[test]
    fn template_without_placeholder_is_rejected() {
        let err = RundirResolver::template("out", "fixed").expect_err("no placeholder");
        assert!(matches!(err, XrunError::Configuration(_)));
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let r = RundirResolver::template("out", "{}").expect("template");
        assert!(matches!(
            r.rundir(Some(4), &space()),
            Err(XrunError::InvalidIndex { index: 4, size: 4 })
        ));
        assert!(RundirResolver::auto("out").rundir(Some(9), &space()).is_err());
    }

    #[test]
    fn auto_mode_names_directories_from_values() {
        let r = RundirResolver::auto("out");
        let s = space();
        assert_eq!(r.rundir(Some(1), &s).expect("rundir"), PathBuf::from("out/a=2,b=0.5"));
        let all: Vec<PathBuf> = (0..s.size())
            .map(|i| r.rundir(Some(i), &s).expect("rundir"))
            .collect();
        let mut dedup = all.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), all.len());
        assert_eq!(r.rundir(Some(1), &s).expect("again"), all[1]);
        r.check_unique(&s).expect("unique");
    }

    #[test]
    fn auto_mode_detects_duplicate_rows() {
        let s = ParamSpace::new(vec!["a".to_string()], vec![vec![1.0], vec![2.0], vec![1.0]])
            .expect("space");
        let err = RundirResolver::auto("out").check_unique(&s).expect_err("collision");
        assert!(err.to_string().contains("members 0 and 2"), "{}", err);
        RundirResolver::template("out", "{}")
            .expect("template")
            .check_unique(&s)
            .expect("template mode never collides");
    }

    #[test]
    fn auto_mode_rejects_unnamed_members() {
        let s = ParamSpace::new(Vec::new(), vec![Vec::new()]).expect("space");
        let err = RundirResolver::auto("out").check_unique(&s).expect_err("collision");
        assert!(err.to_string().contains("autodir"), "{}", err);
        RundirResolver::auto("out")
            .check_unique(&ParamSpace::empty())
            .expect("empty space has no members");
    }

    #[test]
    fn names_are_escaped_injectively() {
        assert_eq!(sanitize_name("g1.a"), "g1.a");
        assert_eq!(sanitize_name("a/b"), "a%2Fb");
        assert_ne!(sanitize_name("a/b"), sanitize_name("a_b"));
        assert_eq!(autofolder(&[], &[]), "default");
        assert_eq!(
            autofolder(&["x".to_string()], &[-0.0]),
            autofolder(&["x".to_string()], &[0.0])
        );
    }
}
