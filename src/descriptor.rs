//! One-shot granule inspection.
//!
//! A descriptor records everything the planner needs to know about a granule
//! without reading bulk variable data: dimension sizes, the projected index
//! values for every indexed unlimited dimension, presence of configured
//! variables, and the raw values of configured global attributes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::Config;
use crate::data::AttrValue;
use crate::errors::{Error, Result};
use crate::granule::{Granule, GranuleStore};

#[derive(Debug, Clone)]
pub struct GranuleDescriptor {
    pub path: String,

    /// Size of each configured dimension in this granule. A dimension the
    /// granule doesn't carry gets size 1: it implicitly depends on file, and
    /// one descriptor represents one file.
    pub dim_sizes: HashMap<String, usize>,

    /// Projected `index_by` values in raw record order, per indexed unlimited
    /// dimension.
    pub projections: HashMap<String, Vec<f64>>,

    /// Raw values of each configured global attribute.
    pub attrs: HashMap<String, Option<AttrValue>>,

    /// Configured variables this granule actually carries. Missing variables
    /// are later substituted with their fill value.
    pub present_vars: HashSet<String>,

    /// Dimension list of each present variable as the granule declares it.
    /// May be shorter than the configured list when the output introduces
    /// per-file dimensions the granule doesn't have.
    pub var_dims: HashMap<String, Vec<String>>,
}

impl GranuleDescriptor {
    /// Inspect `path` against `config` in a single pass. No bulk variable
    /// data is read here.
    ///
    pub fn inspect(store: &dyn GranuleStore, path: &str, config: &Config) -> Result<Arc<Self>> {
        let handle = store.open(path)?;
        let schema = handle.schema()?;

        let mut dim_sizes = HashMap::new();
        for dim in &config.dimensions {
            let size = match schema.dim(&dim.name) {
                Some(found) => {
                    if let Some(fixed) = dim.size {
                        if found.size != fixed {
                            return Err(Error::SchemaMismatch(format!(
                                "{path}: dimension {} has size {}, config says {fixed}",
                                dim.name, found.size
                            )));
                        }
                    }
                    found.size
                }
                None => 1,
            };
            dim_sizes.insert(dim.name.clone(), size);
        }

        let mut present_vars = HashSet::new();
        let mut var_dims = HashMap::new();
        for var in &config.variables {
            match schema.variable(&var.name) {
                Some(found) => {
                    if found.datatype != var.datatype {
                        return Err(Error::SchemaMismatch(format!(
                            "{path}: variable {} is {}, config says {}",
                            var.name, found.datatype, var.datatype
                        )));
                    }
                    // The granule's dimension list must be an in-order subset
                    // of the configured one; missing dimensions become
                    // synthetic size-1 axes at evaluation time.
                    let mut expected = var.dimensions.iter();
                    for dim in &found.dimensions {
                        if !expected.any(|d| d == dim) {
                            return Err(Error::SchemaMismatch(format!(
                                "{path}: variable {} has unexpected dimension {dim}",
                                var.name
                            )));
                        }
                    }
                    present_vars.insert(var.name.clone());
                    var_dims.insert(var.name.clone(), found.dimensions.clone());
                }
                None => {
                    log::debug!("{path}: variable {} missing, will fill", var.name);
                }
            }
        }

        let mut projections = HashMap::new();
        for dim in config.dimensions.iter().filter(|d| d.is_indexed()) {
            let index_by = dim.index_by.as_deref().expect("is_indexed");
            let index_var = config
                .var(index_by)
                .ok_or_else(|| Error::ConfigInvalid(format!("index_by not found: {index_by}")))?;
            if !present_vars.contains(index_by) {
                return Err(Error::SchemaMismatch(format!(
                    "{path}: missing index variable {index_by}"
                )));
            }

            let other: HashMap<String, usize> = index_var
                .dimensions
                .iter()
                .filter(|d| *d != &dim.name)
                .map(|d| {
                    let index = dim.other_dim_indices.get(d).copied().unwrap_or(0);
                    (d.clone(), index)
                })
                .collect();

            let values = handle.read_index(index_by, &other)?.to_vec();
            let size = dim_sizes[&dim.name];
            if values.len() != size {
                return Err(Error::SchemaMismatch(format!(
                    "{path}: {index_by} projects to {} values along {} of size {size}",
                    values.len(),
                    dim.name
                )));
            }
            projections.insert(dim.name.clone(), values);
        }

        let mut attrs = HashMap::new();
        for spec in &config.global_attributes {
            attrs.insert(spec.name.clone(), handle.attr(&spec.name)?);
        }

        Ok(Arc::new(GranuleDescriptor {
            path: path.to_string(),
            dim_sizes,
            projections,
            attrs,
            present_vars,
            var_dims,
        }))
    }

    pub fn size_along(&self, dim: &str) -> usize {
        self.dim_sizes.get(dim).copied().unwrap_or(1)
    }
}
