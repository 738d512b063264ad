//! Aggregate many small, time-indexed NetCDF granules into one larger file.
//!
//! Aggregation is a two step process. A planner computes, for each unlimited
//! dimension, which slices of which inputs contribute to the output and in
//! what order, interleaved with explicit fill segments covering gaps,
//! overlaps, and bound chops. An evaluator then walks the plan and streams
//! data from the inputs into the output, one variable at a time, without
//! re-reading or re-sorting anything.
//!
//! The engine reads and writes through the abstract contracts in
//! [`granule`]; enable the `netcdf` feature for an adapter over real NetCDF
//! files and the [`aggregate`] convenience entry point.

mod aggregate;
mod attributes;
mod bounds;
mod cache;
mod cadence;
mod config;
mod data;
mod descriptor;
mod errors;
mod evaluate;
pub mod granule;
mod plan;

#[cfg(feature = "netcdf")]
mod netcdf;

pub use aggregate::aggregate_with;
#[cfg(feature = "netcdf")]
pub use aggregate::aggregate;

pub use attributes::{AttributeHandler, FinalizeContext, Strategy};
pub use bounds::{datetime_format, DateExpr, TimeUnits};
pub use cache::HandleCache;
pub use cadence::Cadence;
pub use config::{Bound, Config, DimensionSpec, GlobalAttrSpec, ResolvedBounds, VariableSpec};
pub use data::{default_fill_value, AttrValue, DataArray, DataType};
pub use descriptor::GranuleDescriptor;
pub use errors::{Error, Result};
pub use evaluate::{evaluate, CancelToken};
pub use plan::{DimPlan, FillSegment, IndexedView, InputSlice, Node, Plan, Segment};

#[cfg(feature = "netcdf")]
pub use crate::netcdf::{NetcdfSink, NetcdfStore};

/// Engine version, emitted by the `ncagg_version` attribute strategy.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod testing;
