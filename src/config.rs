//! Product configuration: the dimensions, variables, and global attributes of
//! the aggregation output, plus the per-unlimited-dimension indexing rules.
//!
//! The JSON surface is three ordered arrays, `"dimensions"`, `"variables"`,
//! and `"global attributes"`. Array order is semantically significant: it is
//! the declaration order of the output file. Unknown fields anywhere are a
//! validation failure.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::attributes::Strategy;
use crate::bounds::{DateExpr, TimeUnits};
use crate::cadence::Cadence;
use crate::data::{default_fill_value, AttrValue, DataType};
use crate::errors::{Error, Result};
use crate::granule::GranuleSchema;

/// An aggregation bound: numeric in the units of the index variable, or a
/// `TYYYY[MM[DD[HH[MM]]]]` date expression.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bound {
    Value(f64),
    Time(String),
}

/// A dimension of the output, with the optional unlimited-dimension
/// configuration that drives sorting, deduplication, gap fill, and bounds.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DimensionSpec {
    pub name: String,

    /// Fixed size, or `None` for unlimited.
    pub size: Option<usize>,

    /// Variable whose values index this dimension. Required for the sort,
    /// fill, and bound features; without it records are concatenated in
    /// filename order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_by: Option<String>,

    /// Fixed index into each other dimension of `index_by`, used to project
    /// a multidimensional index variable down to one dimension.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub other_dim_indices: HashMap<String, usize>,

    /// Expected sample rate in Hz, keyed by dimension name. The entry for
    /// this dimension itself governs gap and overlap detection; entries for
    /// inner dimensions govern synthesized index values in fill records.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub expected_cadence: HashMap<String, f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Bound>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Bound>,

    /// Append records left-justified, ignoring their original outer index.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub flatten: bool,
}

impl DimensionSpec {
    pub fn is_unlimited(&self) -> bool {
        self.size.is_none()
    }

    /// Whether this dimension carries the full indexing configuration.
    pub fn is_indexed(&self) -> bool {
        self.is_unlimited() && self.index_by.is_some() && !self.flatten
    }

    /// The cadence of the dimension itself, if configured.
    pub fn cadence(&self) -> Option<Cadence> {
        self.expected_cadence
            .get(&self.name)
            .copied()
            .and_then(Cadence::new)
    }
}

/// A variable of the output.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableSpec {
    pub name: String,
    pub dimensions: Vec<String>,
    pub datatype: DataType,
    #[serde(default)]
    pub attributes: HashMap<String, AttrValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunksizes: Option<Vec<usize>>,
}

impl VariableSpec {
    pub fn fill_value(&self) -> Option<&AttrValue> {
        self.attributes.get("_FillValue")
    }

    pub fn units(&self) -> Option<&str> {
        self.attributes.get("units").and_then(AttrValue::as_str)
    }
}

/// One output global attribute and the strategy that compiles it from the
/// stream of input attribute values.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalAttrSpec {
    pub name: String,
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<AttrValue>,
}

/// Numeric bounds for one indexed dimension, after date expressions have been
/// cast through the index variable's units.
///
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResolvedBounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_time: Option<NaiveDateTime>,
    pub max_time: Option<NaiveDateTime>,
}

/// The complete product configuration.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub dimensions: Vec<DimensionSpec>,
    pub variables: Vec<VariableSpec>,
    #[serde(rename = "global attributes")]
    pub global_attributes: Vec<GlobalAttrSpec>,
}

impl Config {
    /// Parse and validate a configuration from its JSON surface.
    ///
    pub fn from_json(json: &str) -> Result<Config> {
        let config: Config =
            serde_json::from_str(json).map_err(|err| Error::ConfigInvalid(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("config serializes")
    }

    /// Derive the default configuration from a sample granule's schema: every
    /// dimension, every variable (with a `_FillValue` defaulted where
    /// missing), and every global attribute under the `first` strategy except
    /// the well-known timestamp attributes, which get their own strategies.
    ///
    pub fn from_schema(schema: &GranuleSchema) -> Config {
        let dimensions = schema
            .dims
            .iter()
            .map(|d| DimensionSpec {
                name: d.name.clone(),
                size: if d.unlimited { None } else { Some(d.size) },
                index_by: None,
                other_dim_indices: HashMap::new(),
                expected_cadence: HashMap::new(),
                min: None,
                max: None,
                flatten: false,
            })
            .collect();

        let variables = schema
            .variables
            .iter()
            .map(|v| {
                let mut attributes = v.attributes.clone();
                if !attributes.contains_key("_FillValue") {
                    if let Some(fill) = default_fill_value(v.datatype) {
                        attributes.insert("_FillValue".to_string(), fill);
                    }
                }
                VariableSpec {
                    name: v.name.clone(),
                    dimensions: v.dimensions.clone(),
                    datatype: v.datatype,
                    attributes,
                    chunksizes: v.chunksizes.clone(),
                }
            })
            .collect();

        let global_attributes = schema
            .global_attrs
            .iter()
            .map(|(name, _)| GlobalAttrSpec {
                name: name.clone(),
                strategy: match name.as_str() {
                    "date_created" => Strategy::DateCreated,
                    "time_coverage_start" => Strategy::TimeCoverageStart,
                    "time_coverage_end" => Strategy::TimeCoverageEnd,
                    _ => Strategy::First,
                },
                value: None,
            })
            .collect();

        Config {
            dimensions,
            variables,
            global_attributes,
        }
    }

    pub fn dim(&self, name: &str) -> Option<&DimensionSpec> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn var(&self, name: &str) -> Option<&VariableSpec> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Unlimited dimensions, in declaration order.
    pub fn udims(&self) -> impl Iterator<Item = &DimensionSpec> {
        self.dimensions.iter().filter(|d| d.is_unlimited())
    }

    /// The dimension that orders attribute observation and defines the
    /// retained-granule sequence: the first indexed unlimited dimension,
    /// falling back to the first unlimited dimension.
    pub fn primary_udim(&self) -> Option<&DimensionSpec> {
        self.udims()
            .find(|d| d.is_indexed())
            .or_else(|| self.udims().next())
    }

    /// Whether a variable is backed by at least one unlimited dimension.
    pub fn is_unlimited_backed(&self, var: &VariableSpec) -> bool {
        var.dimensions
            .iter()
            .any(|d| self.dim(d).map(|d| d.is_unlimited()).unwrap_or(false))
    }

    /// Cast a dimension's bounds to numbers in the index variable's units.
    ///
    /// A lone date-expression bound implies the other end of the interval:
    /// `min` alone extends one period forward, `max` alone one period back.
    ///
    pub fn resolved_bounds(&self, dim: &DimensionSpec) -> Result<ResolvedBounds> {
        if dim.min.is_none() && dim.max.is_none() {
            return Ok(ResolvedBounds::default());
        }

        let units = || -> Result<TimeUnits> {
            let index_by = dim.index_by.as_deref().ok_or_else(|| {
                Error::ConfigInvalid(format!("bounds on {} require index_by", dim.name))
            })?;
            let units = self
                .var(index_by)
                .and_then(|v| v.units())
                .ok_or_else(|| {
                    Error::ConfigInvalid(format!(
                        "date bounds on {} require a units attribute on {index_by}",
                        dim.name
                    ))
                })?;
            TimeUnits::parse(units)
        };

        let mut resolved = ResolvedBounds::default();
        let mut min_expr = None;
        let mut max_expr = None;

        match &dim.min {
            Some(Bound::Value(v)) => resolved.min = Some(*v),
            Some(Bound::Time(expr)) => min_expr = Some(DateExpr::parse(expr)?),
            None => {}
        }
        match &dim.max {
            Some(Bound::Value(v)) => resolved.max = Some(*v),
            Some(Bound::Time(expr)) => max_expr = Some(DateExpr::parse(expr)?),
            None => {}
        }

        // Infer the missing end of a lone date bound.
        if dim.max.is_none() {
            if let Some(expr) = min_expr {
                max_expr = Some(expr);
                resolved.min_time = Some(expr.start());
                resolved.max_time = Some(expr.next());
            }
        }
        if dim.min.is_none() {
            if let Some(expr) = max_expr {
                resolved.min_time = Some(expr.prev());
                resolved.max_time = Some(expr.start());
            }
        }
        if resolved.min_time.is_none() {
            resolved.min_time = min_expr.map(|e| e.start());
        }
        if resolved.max_time.is_none() && dim.max.is_some() {
            resolved.max_time = max_expr.map(|e| e.start());
        }

        if resolved.min_time.is_some() || resolved.max_time.is_some() {
            let units = units()?;
            if resolved.min.is_none() {
                resolved.min = resolved.min_time.map(|t| units.date2num(t));
            }
            if resolved.max.is_none() {
                resolved.max = resolved.max_time.map(|t| units.date2num(t));
            }
        }

        if let (Some(min), Some(max)) = (resolved.min, resolved.max) {
            if min >= max {
                return Err(Error::ConfigInvalid(format!(
                    "{}: bounds are not an interval: {min} >= {max}",
                    dim.name
                )));
            }
        }

        Ok(resolved)
    }

    /// Check the interlinking requirements between dimensions, variables, and
    /// attribute strategies. Individual field shapes were already enforced by
    /// deserialization.
    ///
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::ConfigInvalid(msg));

        let mut dim_names = HashSet::new();
        for dim in &self.dimensions {
            if !dim_names.insert(dim.name.as_str()) {
                return bad(format!("duplicate dimension: {}", dim.name));
            }
            if dim.size == Some(0) {
                return bad(format!("dimension {} has size 0", dim.name));
            }
        }

        let mut var_names = HashSet::new();
        let mut used_dims = HashSet::new();
        for var in &self.variables {
            if !var_names.insert(var.name.as_str()) {
                return bad(format!("duplicate variable: {}", var.name));
            }
            for dim in &var.dimensions {
                if !dim_names.contains(dim.as_str()) {
                    return bad(format!(
                        "variable {} depends on unconfigured dimension {dim}",
                        var.name
                    ));
                }
                used_dims.insert(dim.as_str());
            }
            if let Some(chunks) = &var.chunksizes {
                if chunks.len() != var.dimensions.len() {
                    return bad(format!(
                        "variable {}: {} chunksizes for {} dimensions",
                        var.name,
                        chunks.len(),
                        var.dimensions.len()
                    ));
                }
            }
        }

        for dim in &self.dimensions {
            if !used_dims.contains(dim.name.as_str()) {
                return bad(format!("unused dimension: {}", dim.name));
            }
        }

        let mut attr_names = HashSet::new();
        for attr in &self.global_attributes {
            if !attr_names.insert(attr.name.as_str()) {
                return bad(format!("duplicate global attribute: {}", attr.name));
            }
        }

        for dim in &self.dimensions {
            self.validate_udc(dim)?;
        }

        Ok(())
    }

    fn validate_udc(&self, dim: &DimensionSpec) -> Result<()> {
        let bad = |msg: String| Err(Error::ConfigInvalid(msg));

        let has_udc = dim.index_by.is_some()
            || !dim.other_dim_indices.is_empty()
            || !dim.expected_cadence.is_empty()
            || dim.min.is_some()
            || dim.max.is_some();

        let index_by = match &dim.index_by {
            Some(name) => name,
            None => {
                if has_udc {
                    return bad(format!(
                        "dimension {} has indexing configuration but no index_by",
                        dim.name
                    ));
                }
                return Ok(());
            }
        };

        if !dim.is_unlimited() {
            return bad(format!("index_by on fixed-size dimension {}", dim.name));
        }

        let index_var = match self.var(index_by) {
            Some(var) => var,
            None => return bad(format!("index_by variable not found: {index_by}")),
        };
        if index_var.datatype == DataType::Str {
            return Err(Error::IndexVarNonNumeric(index_by.clone()));
        }
        if index_var.dimensions.first().map(String::as_str) != Some(dim.name.as_str()) {
            return bad(format!(
                "index variable {index_by} is not indexed by {} along its outer dimension",
                dim.name
            ));
        }

        for (other, index) in &dim.other_dim_indices {
            if !index_var.dimensions.iter().any(|d| d == other) {
                return bad(format!(
                    "other_dim_indices names {other}, not a dimension of {index_by}"
                ));
            }
            if let Some(size) = self.dim(other).and_then(|d| d.size) {
                if *index >= size {
                    return bad(format!(
                        "other_dim_indices[{other}] = {index} out of range for size {size}"
                    ));
                }
            }
        }

        for (name, hz) in &dim.expected_cadence {
            if !index_var.dimensions.iter().any(|d| d == name) {
                return bad(format!(
                    "expected_cadence names {name}, not a dimension of {index_by}"
                ));
            }
            if Cadence::new(*hz).is_none() {
                return bad(format!("expected_cadence[{name}] = {hz} is not a rate"));
            }
        }

        // Surfaces date-expression and units problems before any I/O.
        self.resolved_bounds(dim)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_config_json;

    #[test]
    fn test_roundtrip_preserves_order() {
        let config = Config::from_json(&sample_config_json()).unwrap();
        let names: Vec<_> = config.global_attributes.iter().map(|a| &a.name).collect();
        assert_eq!(names, ["title", "processing_level", "date_created"]);

        let reparsed = Config::from_json(&config.to_json()).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let json = sample_config_json().replace("\"flatten\": false", "\"take_dim_indices\": {}");
        assert!(matches!(
            Config::from_json(&json),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let json = sample_config_json().replace("\"first\"", "\"mean\"");
        assert!(matches!(
            Config::from_json(&json),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_variable_with_unknown_dim_rejected() {
        let mut config = Config::from_json(&sample_config_json()).unwrap();
        config.variables[1].dimensions = vec!["no_such_dim".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unconfigured dimension"));
    }

    #[test]
    fn test_chunksizes_length_checked() {
        let mut config = Config::from_json(&sample_config_json()).unwrap();
        config.variables[0].chunksizes = Some(vec![128, 1]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("chunksizes"));
    }

    #[test]
    fn test_cadence_must_reference_index_var_dim() {
        let mut config = Config::from_json(&sample_config_json()).unwrap();
        config.dimensions[0].expected_cadence = [("elsewhere".to_string(), 1.0)].into_iter().collect();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("expected_cadence"));
    }

    #[test]
    fn test_udc_without_index_by_rejected() {
        let mut config = Config::from_json(&sample_config_json()).unwrap();
        config.dimensions[0].index_by = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no index_by"));
    }

    #[test]
    fn test_index_var_must_be_numeric() {
        let mut config = Config::from_json(&sample_config_json()).unwrap();
        config.variables[0].datatype = crate::data::DataType::Str;
        assert!(matches!(
            config.validate(),
            Err(Error::IndexVarNonNumeric(_))
        ));
    }

    #[test]
    fn test_from_schema_defaults() {
        use crate::granule::{DimSchema, GranuleSchema, VarSchema};
        use std::collections::HashMap;

        let schema = GranuleSchema {
            dims: vec![DimSchema {
                name: "record_number".to_string(),
                size: 60,
                unlimited: true,
            }],
            variables: vec![VarSchema {
                name: "time".to_string(),
                dimensions: vec!["record_number".to_string()],
                datatype: crate::data::DataType::F64,
                attributes: HashMap::new(),
                chunksizes: Some(vec![128]),
            }],
            global_attrs: vec![
                (
                    "title".to_string(),
                    AttrValue::Str("magnetometer".to_string()),
                ),
                ("date_created".to_string(), AttrValue::Str("x".to_string())),
            ],
        };

        let config = Config::from_schema(&schema);
        config.validate().unwrap();
        assert_eq!(config.dimensions[0].size, None);
        assert!(config.variables[0].attributes.contains_key("_FillValue"));
        assert_eq!(config.global_attributes[0].strategy, Strategy::First);
        assert_eq!(config.global_attributes[1].strategy, Strategy::DateCreated);
    }

    #[test]
    fn test_numeric_bounds_resolve_directly() {
        let config = Config::from_json(&sample_config_json()).unwrap();
        let mut dim = config.dim("record_number").unwrap().clone();
        dim.min = Some(Bound::Value(10.0));
        dim.max = Some(Bound::Value(20.0));
        let bounds = config.resolved_bounds(&dim).unwrap();
        assert_eq!(bounds.min, Some(10.0));
        assert_eq!(bounds.max, Some(20.0));
    }

    #[test]
    fn test_lone_date_bound_implies_interval() {
        let config = Config::from_json(&sample_config_json()).unwrap();
        let mut dim = config.dim("record_number").unwrap().clone();
        dim.min = Some(Bound::Time("T20170214".to_string()));
        dim.max = None;

        // time units in the sample config: seconds since 2017-02-14 00:00:00
        let bounds = config.resolved_bounds(&dim).unwrap();
        assert_eq!(bounds.min, Some(0.0));
        assert_eq!(bounds.max, Some(86400.0));
    }

    #[test]
    fn test_lone_max_date_bound_steps_back() {
        let config = Config::from_json(&sample_config_json()).unwrap();
        let mut dim = config.dim("record_number").unwrap().clone();
        dim.min = None;
        dim.max = Some(Bound::Time("T20170215".to_string()));

        let bounds = config.resolved_bounds(&dim).unwrap();
        assert_eq!(bounds.min, Some(0.0));
        assert_eq!(bounds.max, Some(86400.0));
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let config = Config::from_json(&sample_config_json()).unwrap();
        let mut dim = config.dim("record_number").unwrap().clone();
        dim.min = Some(Bound::Value(20.0));
        dim.max = Some(Bound::Value(10.0));
        assert!(config.resolved_bounds(&dim).is_err());
    }
}
