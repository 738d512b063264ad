//! Global attribute strategies.
//!
//! Each output attribute is compiled from the stream of input attribute
//! values by a small stateful reducer: `observe` once per retained granule,
//! in plan order, then `finalize` against the aggregation context. Strategy
//! names are part of the external configuration grammar and are closed.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::bounds::{datetime_format, TimeUnits};
use crate::config::{Config, GlobalAttrSpec, ResolvedBounds};
use crate::data::AttrValue;
use crate::errors::{Error, Result};

/// The closed set of attribute aggregation strategies.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Ignore observations; emit the configured `value`.
    Static,
    /// The first observed value.
    First,
    /// The last observed value.
    Last,
    /// Distinct observed values joined comma-separated, in first-seen order.
    UniqueList,
    /// Observations summed as integers.
    IntSum,
    /// Observations summed as floats.
    FloatSum,
    /// Like `first`, but a differing later observation is fatal.
    Constant,
    /// The UTC timestamp of finalization.
    DateCreated,
    /// The lower aggregation bound, or the first retained index value.
    TimeCoverageStart,
    /// The upper aggregation bound, or the last retained index value.
    TimeCoverageEnd,
    /// The output filename.
    Filename,
    /// The input filename contributing the first retained record.
    FirstInputFilename,
    /// The input filename contributing the last retained record.
    LastInputFilename,
    /// The number of retained granules.
    InputCount,
    /// The engine version string.
    NcaggVersion,
    /// Do not emit the attribute at all.
    Remove,
}

/// Everything `finalize` may need beyond the observations themselves. Built
/// by the top-level call; in particular the engine version is injected here
/// rather than read from ambient state.
///
#[derive(Debug, Clone)]
pub struct FinalizeContext<'a> {
    pub output_path: &'a str,
    pub bounds: ResolvedBounds,
    pub index_units: Option<TimeUnits>,
    pub first_index_value: Option<f64>,
    pub last_index_value: Option<f64>,
    pub version: &'a str,
}

impl FinalizeContext<'_> {
    fn coverage(&self, bound: Option<f64>, observed: Option<f64>) -> Option<String> {
        let value = bound.or(observed)?;
        let dt = self.index_units.as_ref()?.num2date(value)?;
        Some(datetime_format(dt))
    }

    fn coverage_start(&self) -> Option<String> {
        if let Some(t) = self.bounds.min_time {
            return Some(datetime_format(t));
        }
        self.coverage(self.bounds.min, self.first_index_value)
    }

    fn coverage_end(&self) -> Option<String> {
        if let Some(t) = self.bounds.max_time {
            return Some(datetime_format(t));
        }
        self.coverage(self.bounds.max, self.last_index_value)
    }
}

/// Per-strategy accumulator state.
#[derive(Debug)]
enum State {
    Inert,
    Value(Option<AttrValue>),
    Uniques(Vec<String>),
    IntSum(i64),
    FloatSum(f64),
    Name(Option<String>),
    Count(usize),
}

fn initial_state(strategy: Strategy) -> State {
    match strategy {
        Strategy::First | Strategy::Last | Strategy::Constant => State::Value(None),
        Strategy::UniqueList => State::Uniques(Vec::new()),
        Strategy::IntSum => State::IntSum(0),
        Strategy::FloatSum => State::FloatSum(0.0),
        Strategy::FirstInputFilename | Strategy::LastInputFilename => State::Name(None),
        Strategy::InputCount => State::Count(0),
        _ => State::Inert,
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Drives one reducer per configured global attribute.
///
pub struct AttributeHandler {
    entries: Vec<(GlobalAttrSpec, State)>,
}

impl AttributeHandler {
    pub fn new(config: &Config) -> Self {
        let entries = config
            .global_attributes
            .iter()
            .map(|spec| (spec.clone(), initial_state(spec.strategy)))
            .collect();
        AttributeHandler { entries }
    }

    /// Feed one granule's attribute values through every reducer. Granules
    /// must arrive in plan order.
    ///
    pub fn observe_granule(
        &mut self,
        path: &str,
        attrs: &HashMap<String, Option<AttrValue>>,
    ) -> Result<()> {
        for (spec, state) in &mut self.entries {
            let observed = attrs.get(&spec.name).and_then(|v| v.as_ref());
            match (spec.strategy, &mut *state) {
                (Strategy::First, State::Value(held)) => {
                    if held.is_none() {
                        *held = observed.cloned();
                    }
                }
                (Strategy::Last, State::Value(held)) => {
                    *held = observed.cloned();
                }
                (Strategy::Constant, State::Value(held)) => {
                    if let Some(observed) = observed {
                        match held {
                            None => *held = Some(observed.clone()),
                            Some(prev) if prev != observed => {
                                return Err(Error::AttrNotConstant(format!(
                                    "{}: {prev} -> {observed} in {path}",
                                    spec.name
                                )));
                            }
                            Some(_) => {}
                        }
                    }
                }
                (Strategy::UniqueList, State::Uniques(seen)) => {
                    if let Some(observed) = observed {
                        for each in observed.to_string().split(',') {
                            let each = each.trim();
                            if !each.is_empty() && !seen.iter().any(|s| s == each) {
                                seen.push(each.to_string());
                            }
                        }
                    }
                }
                (Strategy::IntSum, State::IntSum(total)) => {
                    match observed.and_then(AttrValue::as_i64) {
                        Some(v) => *total += v,
                        None => log::debug!("{}: skipping non integer observation", spec.name),
                    }
                }
                (Strategy::FloatSum, State::FloatSum(total)) => {
                    match observed.and_then(AttrValue::as_f64) {
                        Some(v) => *total += v,
                        None => log::debug!("{}: skipping non float observation", spec.name),
                    }
                }
                (Strategy::FirstInputFilename, State::Name(held)) => {
                    if held.is_none() {
                        *held = Some(basename(path));
                    }
                }
                (Strategy::LastInputFilename, State::Name(held)) => {
                    *held = Some(basename(path));
                }
                (Strategy::InputCount, State::Count(count)) => {
                    *count += 1;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Produce the output attributes in configuration order. Attributes that
    /// finalize to nothing (and `remove`) are omitted.
    ///
    pub fn finalize(&self, ctx: &FinalizeContext<'_>) -> Vec<(String, AttrValue)> {
        self.entries
            .iter()
            .filter_map(|(spec, state)| {
                let value = match (spec.strategy, state) {
                    (Strategy::Static, _) => spec.value.clone(),
                    (Strategy::First | Strategy::Last | Strategy::Constant, State::Value(held)) => {
                        held.clone()
                    }
                    (Strategy::UniqueList, State::Uniques(seen)) => {
                        if seen.is_empty() {
                            None
                        } else {
                            Some(AttrValue::Str(seen.join(", ")))
                        }
                    }
                    (Strategy::IntSum, State::IntSum(total)) => Some(AttrValue::Int(*total)),
                    (Strategy::FloatSum, State::FloatSum(total)) => Some(AttrValue::Float(*total)),
                    (Strategy::DateCreated, _) => {
                        Some(AttrValue::Str(datetime_format(Utc::now().naive_utc())))
                    }
                    (Strategy::TimeCoverageStart, _) => ctx.coverage_start().map(AttrValue::Str),
                    (Strategy::TimeCoverageEnd, _) => ctx.coverage_end().map(AttrValue::Str),
                    (Strategy::Filename, _) => Some(AttrValue::Str(basename(ctx.output_path))),
                    (
                        Strategy::FirstInputFilename | Strategy::LastInputFilename,
                        State::Name(held),
                    ) => held.clone().map(AttrValue::Str),
                    (Strategy::InputCount, State::Count(count)) => {
                        Some(AttrValue::Int(*count as i64))
                    }
                    (Strategy::NcaggVersion, _) => Some(AttrValue::Str(ctx.version.to_string())),
                    (Strategy::Remove, _) => None,
                    _ => None,
                };
                value.map(|v| (spec.name.clone(), v))
            })
            .collect()
    }
}
