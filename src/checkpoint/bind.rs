use super::params::ParamMap;
use crate::error::BindError;
use crate::symbol::{ParamKind, ParamSpec};
use std::collections::BTreeSet;

/// Outcome of matching a graph against a parameter map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindReport {
    /// Graph parameters taken from the checkpoint.
    pub bound: Vec<String>,
    /// Graph parameters absent from the checkpoint. They keep their initialization.
    pub missing: Vec<String>,
    /// Checkpoint entries with no counterpart in the graph. They are ignored.
    pub unused: Vec<String>,
}

impl BindReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Fails when any graph parameter was left unbound.
    pub fn require_complete(self) -> Result<Self, BindError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(BindError::Missing(self.missing))
        }
    }

    pub fn log(&self) {
        log::info!(
            "bound {} parameters ({} missing, {} unused)",
            self.bound.len(),
            self.missing.len(),
            self.unused.len()
        );
        for name in &self.missing {
            log::warn!("{name} is not in the checkpoint, keeping its initial value");
        }
        for name in &self.unused {
            log::debug!("ignoring checkpoint entry {name}");
        }
    }
}

/// Records lookups against a [`ParamMap`] to build a [`BindReport`].
#[derive(Debug)]
pub struct Matcher<'a> {
    params: &'a ParamMap,
    used: BTreeSet<(ParamKind, &'a str)>,
    report: BindReport,
}

impl<'a> Matcher<'a> {
    pub fn new(params: &'a ParamMap) -> Self {
        Self {
            params,
            used: BTreeSet::new(),
            report: BindReport::default(),
        }
    }

    /// Looks up `name`, checking the stored shape against `expected`.
    ///
    /// Returns `Ok(None)` and records the name as missing when the checkpoint lacks it.
    pub fn lookup(
        &mut self,
        kind: ParamKind,
        name: &str,
        expected: &[usize],
    ) -> Result<Option<&'a burn::tensor::TensorData>, BindError> {
        let Some((key, data)) = self.params.map_entry(kind, name) else {
            self.report.missing.push(name.to_string());
            return Ok(None);
        };
        if data.shape != expected {
            return Err(BindError::Shape {
                name: name.to_string(),
                expected: expected.to_vec(),
                found: data.shape.clone(),
            });
        }
        self.used.insert((kind, key));
        self.report.bound.push(name.to_string());
        Ok(Some(data))
    }

    pub fn finish(mut self) -> BindReport {
        self.report.unused = self
            .params
            .iter()
            .filter(|(kind, name, _)| !self.used.contains(&(*kind, *name)))
            .map(|(kind, name, _)| format!("{}:{name}", kind.prefix()))
            .collect();
        self.report
    }
}

/// Matches graph parameters by name and shape, without materializing any tensor.
pub fn match_params(specs: &[ParamSpec], params: &ParamMap) -> Result<BindReport, BindError> {
    let mut matcher = Matcher::new(params);
    for spec in specs {
        matcher.lookup(spec.kind, &spec.name, &spec.shape)?;
    }
    Ok(matcher.finish())
}
