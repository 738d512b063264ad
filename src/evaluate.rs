//! Plan evaluation: stream data from the inputs into the output, one
//! variable at a time, honoring the plan's size contract.
//!
//! The evaluator is single pass in both nodes and variables, never re-sorts,
//! and never re-reads index arrays. The only shared mutable state is the
//! output writer. Cancellation is cooperative and checked between nodes and
//! between variables.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::HandleCache;
use crate::config::{Config, VariableSpec};
use crate::errors::{Error, Result};
use crate::granule::{GranuleStore, OutputGranule};
use crate::plan::Plan;

/// Cooperative cancellation flag, shareable across threads.
///
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Walk the plan and copy every variable into the output.
///
/// Variables without an unlimited dimension are copied once, from the first
/// retained granule that carries them; failures there are logged and the
/// variable is left at the writer's default. Failures writing an
/// unlimited-backed variable are fatal.
///
pub fn evaluate(
    config: &Config,
    plan: &Plan,
    store: &dyn GranuleStore,
    out: &mut dyn OutputGranule,
    cancel: &CancelToken,
) -> Result<()> {
    let reader = HandleCache::new(store);

    let (once, unlimited): (Vec<&VariableSpec>, Vec<&VariableSpec>) = config
        .variables
        .iter()
        .partition(|v| !config.is_unlimited_backed(v));

    for var in once {
        cancel.check()?;
        copy_once(config, plan, &reader, out, var);
    }

    for var in unlimited {
        cancel.check()?;
        copy_unlimited(config, plan, &reader, out, var, cancel)?;
    }

    Ok(())
}

/// One-shot copy of a variable with no unlimited dimension.
fn copy_once(
    config: &Config,
    plan: &Plan,
    reader: &HandleCache<'_>,
    out: &mut dyn OutputGranule,
    var: &VariableSpec,
) {
    let source = plan
        .retained
        .iter()
        .map(|&id| plan.node(id))
        .find(|node| {
            node.as_input()
                .map(|input| input.granule.present_vars.contains(&var.name))
                .unwrap_or(false)
        });
    let node = match source {
        Some(node) => node,
        None => {
            log::debug!("{}: absent from every input, leaving default", var.name);
            return;
        }
    };

    let ranges: Vec<Range<usize>> = var
        .dimensions
        .iter()
        .map(|d| 0..config.dim(d).and_then(|d| d.size).unwrap_or(0))
        .collect();

    // Recover locally: the output keeps whatever the writer defaulted to.
    let result = node
        .data_for(var, config, reader)
        .and_then(|data| out.write(&var.name, &ranges, &data));
    if let Err(err) = result {
        log::warn!("error copying one-shot variable {}: {err}", var.name);
    }
}

/// Copy an unlimited-backed variable node by node along its primary
/// unlimited dimension.
fn copy_unlimited(
    config: &Config,
    plan: &Plan,
    reader: &HandleCache<'_>,
    out: &mut dyn OutputGranule,
    var: &VariableSpec,
    cancel: &CancelToken,
) -> Result<()> {
    let primary = var
        .dimensions
        .iter()
        .find(|d| config.dim(d).map(|d| d.is_unlimited()).unwrap_or(false))
        .expect("unlimited-backed variable");
    let dim_plan = plan
        .dim_plan(primary)
        .ok_or_else(|| Error::ConfigInvalid(format!("no plan for dimension {primary}")))?;

    for (id, window) in &dim_plan.entries {
        cancel.check()?;
        let node = plan.node(*id);

        let mut ranges: Vec<Range<usize>> = Vec::with_capacity(var.dimensions.len());
        for name in &var.dimensions {
            let dim = config
                .dim(name)
                .ok_or_else(|| Error::ConfigInvalid(format!("unknown dimension {name}")))?;
            let range = if name == primary {
                window.clone()
            } else if let Some(size) = dim.size {
                0..size
            } else if dim.flatten {
                0..node.size_along(name)
            } else {
                // Another unlimited dimension: this node's window there, if
                // it has one.
                plan.dim_plan(name)
                    .and_then(|p| p.window_of(*id))
                    .cloned()
                    .unwrap_or(0..0)
            };
            ranges.push(range);
        }

        if ranges.iter().any(|r| r.is_empty()) {
            continue;
        }

        let data = node.data_for(var, config, reader)?;
        let expected: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
        if data.shape() != expected.as_slice() {
            return Err(Error::SchemaMismatch(format!(
                "{}: node produced shape {:?}, window wants {:?}",
                var.name,
                data.shape(),
                expected
            )));
        }
        out.write(&var.name, &ranges, &data)?;
    }

    Ok(())
}
