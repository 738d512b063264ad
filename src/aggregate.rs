//! The top-level blocking call: plan, evaluate, finalize.

use crate::attributes::{AttributeHandler, FinalizeContext};
use crate::bounds::TimeUnits;
use crate::config::Config;
use crate::descriptor::GranuleDescriptor;
use crate::errors::{Error, Result};
use crate::evaluate::{evaluate, CancelToken};
use crate::granule::{DimSchema, Granule, GranuleStore, OutputGranule, OutputLayout, OutputSink};
use crate::plan::Plan;

/// Aggregate `paths` into `output_path` through the given store and sink.
///
/// With no configuration, a default is derived from the first input's schema.
/// The output is created under a temporary name and renamed into place on
/// success; on any failure the temporary is discarded and nothing remains at
/// `output_path`.
///
pub fn aggregate_with(
    store: &dyn GranuleStore,
    sink: &dyn OutputSink,
    paths: &[&str],
    output_path: &str,
    config: Option<Config>,
    cancel: &CancelToken,
) -> Result<()> {
    if paths.is_empty() {
        return Err(Error::NoInputs);
    }
    let mut paths: Vec<&str> = paths.to_vec();
    paths.sort_unstable();

    let config = match config {
        Some(config) => {
            config.validate()?;
            config
        }
        None => {
            let schema = store.open(paths[0])?.schema()?;
            let config = Config::from_schema(&schema);
            config.validate()?;
            config
        }
    };

    let descriptors: Vec<_> = paths
        .iter()
        .map(|path| GranuleDescriptor::inspect(store, path, &config))
        .collect::<Result<_>>()?;

    let plan = Plan::build(&config, descriptors)?;

    // Compile attributes before any output exists, so a non-constant
    // attribute aborts without leaving anything behind.
    let mut attrs = AttributeHandler::new(&config);
    for granule in plan.retained_granules() {
        attrs.observe_granule(&granule.path, &granule.attrs)?;
    }

    let layout = output_layout(&config, &plan);
    let tmp_path = format!("{output_path}.ncagg-tmp");
    let mut writer = sink.create(&tmp_path, &layout)?;

    if let Err(err) = evaluate(&config, &plan, store, writer.as_mut(), cancel) {
        writer.discard();
        return Err(err);
    }

    let index_units = plan
        .primary
        .as_deref()
        .and_then(|name| config.dim(name))
        .and_then(|dim| dim.index_by.as_deref())
        .and_then(|index_by| config.var(index_by))
        .and_then(|var| var.units())
        .and_then(|units| TimeUnits::parse(units).ok());
    let ctx = FinalizeContext {
        output_path,
        bounds: plan.bounds,
        index_units,
        first_index_value: plan.first_index_value,
        last_index_value: plan.last_index_value,
        version: crate::VERSION,
    };
    for (name, value) in attrs.finalize(&ctx) {
        if let Err(err) = writer.set_global_attr(&name, &value) {
            writer.discard();
            return Err(err);
        }
    }

    writer.finalize(output_path)
}

fn output_layout(config: &Config, plan: &Plan) -> OutputLayout {
    let dims = config
        .dimensions
        .iter()
        .map(|dim| DimSchema {
            name: dim.name.clone(),
            size: dim.size.unwrap_or_else(|| plan.output_size(&dim.name)),
            unlimited: dim.is_unlimited(),
        })
        .collect();
    let global_attrs = config
        .global_attributes
        .iter()
        .filter(|a| a.strategy != crate::attributes::Strategy::Remove)
        .map(|a| a.name.clone())
        .collect();
    OutputLayout {
        dims,
        variables: config.variables.clone(),
        global_attrs,
    }
}

/// Aggregate real NetCDF files. Available with the `netcdf` feature.
///
#[cfg(feature = "netcdf")]
pub fn aggregate(paths: &[&str], output_path: &str, config: Option<Config>) -> Result<()> {
    let store = crate::netcdf::NetcdfStore;
    let sink = crate::netcdf::NetcdfSink;
    aggregate_with(
        &store,
        &sink,
        paths,
        output_path,
        config,
        &CancelToken::new(),
    )
}
