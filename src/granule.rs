//! Contracts between the engine and the physical NetCDF layer.
//!
//! The engine never touches files directly. It reads granules through
//! [`GranuleStore`]/[`Granule`] and writes the aggregation through
//! [`OutputSink`]/[`OutputGranule`]; any adapter satisfying these traits will
//! do. The `netcdf` feature provides one over real NetCDF files, and the test
//! suite provides an in-memory one.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use ndarray::Array1;

use crate::config::VariableSpec;
use crate::data::{AttrValue, DataArray, DataType};
use crate::errors::Result;

/// One dimension as reported by a granule.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimSchema {
    pub name: String,
    pub size: usize,
    pub unlimited: bool,
}

/// One variable as reported by a granule.
///
#[derive(Debug, Clone, PartialEq)]
pub struct VarSchema {
    pub name: String,
    pub dimensions: Vec<String>,
    pub datatype: DataType,
    pub attributes: HashMap<String, AttrValue>,
    pub chunksizes: Option<Vec<usize>>,
}

/// Everything a single inspection pass can learn about a granule without
/// reading bulk data.
///
#[derive(Debug, Clone, Default)]
pub struct GranuleSchema {
    pub dims: Vec<DimSchema>,
    pub variables: Vec<VarSchema>,
    /// Global attributes in file order.
    pub global_attrs: Vec<(String, AttrValue)>,
}

impl GranuleSchema {
    pub fn dim(&self, name: &str) -> Option<&DimSchema> {
        self.dims.iter().find(|d| d.name == name)
    }

    pub fn variable(&self, name: &str) -> Option<&VarSchema> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// Opens granules read-only, re-entrant across granules.
///
pub trait GranuleStore {
    fn open(&self, path: &str) -> Result<Arc<dyn Granule>>;
}

/// An open input granule.
///
/// Handles are acquired for the duration of a read and released on drop; the
/// engine may keep a bounded number of them alive in an LRU but adapters must
/// tolerate per-call open/close.
///
pub trait Granule: Send + Sync {
    fn path(&self) -> &str;

    fn schema(&self) -> Result<GranuleSchema>;

    /// Project a (possibly multidimensional) index variable to a 1-D numeric
    /// sequence. `other_dim_indices` fixes every dimension of `var` except
    /// the one being projected along. Cells at the variable's fill value come
    /// back as NaN.
    fn read_index(
        &self,
        var: &str,
        other_dim_indices: &HashMap<String, usize>,
    ) -> Result<Array1<f64>>;

    /// Read a hyperslab of a variable, one half-open range per dimension.
    fn read_slice(&self, var: &str, ranges: &[Range<usize>]) -> Result<DataArray>;

    /// One global attribute, or `None` when the granule doesn't carry it.
    fn attr(&self, name: &str) -> Result<Option<AttrValue>>;
}

/// The fully resolved shape of the output file: planned sizes for unlimited
/// dimensions, variable declarations with chunk sizes, and the ordered global
/// attribute placeholders.
///
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub dims: Vec<DimSchema>,
    pub variables: Vec<VariableSpec>,
    pub global_attrs: Vec<String>,
}

/// Creates output granules under a temporary name.
///
pub trait OutputSink {
    fn create(&self, path: &str, layout: &OutputLayout) -> Result<Box<dyn OutputGranule>>;
}

/// An output granule being written.
///
/// The engine writes each variable's disjoint windows exactly once and sets
/// global attributes in configuration order before finalizing.
///
pub trait OutputGranule {
    /// Write `data` into the window described by `ranges`, one half-open
    /// range per dimension of `var`.
    fn write(&mut self, var: &str, ranges: &[Range<usize>], data: &DataArray) -> Result<()>;

    fn set_global_attr(&mut self, name: &str, value: &AttrValue) -> Result<()>;

    /// Atomically rename the finished temp file into place.
    fn finalize(self: Box<Self>, final_path: &str) -> Result<()>;

    /// Drop the partial output, leaving nothing behind.
    fn discard(self: Box<Self>);
}
