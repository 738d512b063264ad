//! In-memory implementations of the granule contracts, plus shared fixtures.
//!
//! Tests drive the whole engine against these instead of real NetCDF files:
//! a `MemoryStore` of hand-built granules on the read side, a `MemorySink`
//! capturing the written output on the write side.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use ndarray::{Array1, ArrayD, IxDyn};
use parking_lot::Mutex;

use crate::config::{Config, DimensionSpec, VariableSpec};
use crate::data::{AttrValue, DataArray, DataType};
use crate::descriptor::GranuleDescriptor;
use crate::errors::{Error, Result};
use crate::granule::{
    DimSchema, Granule, GranuleSchema, GranuleStore, OutputGranule, OutputLayout, OutputSink,
    VarSchema,
};

pub(crate) struct MemoryGranuleBuilder {
    path: String,
    dims: Vec<DimSchema>,
    vars: Vec<VarSchema>,
    data: HashMap<String, DataArray>,
    attrs: Vec<(String, AttrValue)>,
}

impl MemoryGranuleBuilder {
    pub fn new(path: &str) -> Self {
        MemoryGranuleBuilder {
            path: path.to_string(),
            dims: Vec::new(),
            vars: Vec::new(),
            data: HashMap::new(),
            attrs: Vec::new(),
        }
    }

    pub fn dim(mut self, name: &str, size: usize) -> Self {
        self.dims.push(DimSchema {
            name: name.to_string(),
            size,
            unlimited: false,
        });
        self
    }

    pub fn unlimited_dim(mut self, name: &str, size: usize) -> Self {
        self.dims.push(DimSchema {
            name: name.to_string(),
            size,
            unlimited: true,
        });
        self
    }

    fn shape_of(&self, dims: &[&str]) -> Vec<usize> {
        dims.iter()
            .map(|name| {
                self.dims
                    .iter()
                    .find(|d| d.name == *name)
                    .unwrap_or_else(|| panic!("declare dimension {name} first"))
                    .size
            })
            .collect()
    }

    pub fn var(mut self, name: &str, dims: &[&str], data: DataArray) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert("_FillValue".to_string(), AttrValue::Float(-9999.0));
        self.vars.push(VarSchema {
            name: name.to_string(),
            dimensions: dims.iter().map(|d| d.to_string()).collect(),
            datatype: data.datatype(),
            attributes,
            chunksizes: None,
        });
        self.data.insert(name.to_string(), data);
        self
    }

    pub fn var_f64(self, name: &str, dims: &[&str], values: &[f64]) -> Self {
        let shape = self.shape_of(dims);
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values.to_vec()).expect("shape");
        self.var(name, dims, DataArray::F64(data))
    }

    pub fn var_f32(self, name: &str, dims: &[&str], values: &[f32]) -> Self {
        let shape = self.shape_of(dims);
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values.to_vec()).expect("shape");
        self.var(name, dims, DataArray::F32(data))
    }

    pub fn attr(mut self, name: &str, value: AttrValue) -> Self {
        self.attrs.push((name.to_string(), value));
        self
    }

    fn build(self) -> MemoryGranule {
        MemoryGranule {
            path: self.path,
            schema: GranuleSchema {
                dims: self.dims,
                variables: self.vars,
                global_attrs: self.attrs,
            },
            data: self.data,
        }
    }
}

pub(crate) struct MemoryGranule {
    path: String,
    schema: GranuleSchema,
    data: HashMap<String, DataArray>,
}

impl Granule for MemoryGranule {
    fn path(&self) -> &str {
        &self.path
    }

    fn schema(&self) -> Result<GranuleSchema> {
        Ok(self.schema.clone())
    }

    fn read_index(
        &self,
        var: &str,
        other_dim_indices: &HashMap<String, usize>,
    ) -> Result<Array1<f64>> {
        let schema = self
            .schema
            .variable(var)
            .ok_or_else(|| Error::Store(format!("{}: no variable {var}", self.path)))?;
        if schema.datatype == DataType::Str {
            return Err(Error::IndexVarNonNumeric(var.to_string()));
        }
        let data = &self.data[var];
        let free: Vec<usize> = schema
            .dimensions
            .iter()
            .enumerate()
            .filter(|(_, d)| !other_dim_indices.contains_key(*d))
            .map(|(k, _)| k)
            .collect();
        if free.len() != 1 {
            return Err(Error::Store(format!(
                "{var}: projection must fix all dimensions but one"
            )));
        }
        let axis = free[0];
        let fill = schema.attributes.get("_FillValue").and_then(AttrValue::as_f64);

        let n = data.shape()[axis];
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let index: Vec<usize> = schema
                .dimensions
                .iter()
                .enumerate()
                .map(|(k, d)| if k == axis { i } else { other_dim_indices[d] })
                .collect();
            let v = data
                .get_f64(&index)
                .ok_or_else(|| Error::IndexVarNonNumeric(var.to_string()))?;
            out.push(if Some(v) == fill { f64::NAN } else { v });
        }
        Ok(Array1::from(out))
    }

    fn read_slice(&self, var: &str, ranges: &[Range<usize>]) -> Result<DataArray> {
        let data = self
            .data
            .get(var)
            .ok_or_else(|| Error::Store(format!("{}: no variable {var}", self.path)))?;
        if ranges.len() != data.shape().len() {
            return Err(Error::Store(format!(
                "{var}: {} ranges for {} dimensions",
                ranges.len(),
                data.shape().len()
            )));
        }
        let mut out = data.clone();
        for (axis, range) in ranges.iter().enumerate() {
            out = out.slice_along(axis, range.clone());
        }
        Ok(out)
    }

    fn attr(&self, name: &str) -> Result<Option<AttrValue>> {
        Ok(self
            .schema
            .global_attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone()))
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    granules: Mutex<HashMap<String, Arc<MemoryGranule>>>,
    opens: Mutex<HashMap<String, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn add(&self, builder: MemoryGranuleBuilder) {
        let granule = builder.build();
        self.granules
            .lock()
            .insert(granule.path.clone(), Arc::new(granule));
    }

    pub fn open_count(&self, path: &str) -> usize {
        self.opens.lock().get(path).copied().unwrap_or(0)
    }
}

impl GranuleStore for MemoryStore {
    fn open(&self, path: &str) -> Result<Arc<dyn Granule>> {
        let granule = self
            .granules
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Store(format!("no such granule: {path}")))?;
        *self.opens.lock().entry(path.to_string()).or_insert(0) += 1;
        Ok(granule)
    }
}

/// The finished output captured by a [`MemorySink`].
pub(crate) struct MemoryOutput {
    pub layout: OutputLayout,
    pub data: HashMap<String, DataArray>,
    pub attrs: Vec<(String, AttrValue)>,
}

impl MemoryOutput {
    pub fn size_of(&self, dim: &str) -> usize {
        self.layout
            .dims
            .iter()
            .find(|d| d.name == dim)
            .map(|d| d.size)
            .unwrap_or_else(|| panic!("no dimension {dim}"))
    }

    pub fn f64s(&self, var: &str) -> Vec<f64> {
        match &self.data[var] {
            DataArray::F64(arr) => arr.iter().copied().collect(),
            DataArray::F32(arr) => arr.iter().map(|&v| v as f64).collect(),
            DataArray::I64(arr) => arr.iter().map(|&v| v as f64).collect(),
            DataArray::I32(arr) => arr.iter().map(|&v| v as f64).collect(),
            other => panic!("f64s over {:?}", other.datatype()),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Reinterpret the finished output as an input granule, for idempotence
    /// tests.
    pub fn as_granule(&self, path: &str) -> MemoryGranuleBuilder {
        let vars = self
            .layout
            .variables
            .iter()
            .map(|v| VarSchema {
                name: v.name.clone(),
                dimensions: v.dimensions.clone(),
                datatype: v.datatype,
                attributes: v.attributes.clone(),
                chunksizes: v.chunksizes.clone(),
            })
            .collect();
        MemoryGranuleBuilder {
            path: path.to_string(),
            dims: self.layout.dims.clone(),
            vars,
            data: self.data.clone(),
            attrs: self.attrs.clone(),
        }
    }
}

#[derive(Default)]
pub(crate) struct MemorySink {
    files: Arc<Mutex<HashMap<String, MemoryOutput>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn take(&self, path: &str) -> MemoryOutput {
        self.files
            .lock()
            .remove(path)
            .unwrap_or_else(|| panic!("no output at {path}"))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }
}

impl OutputSink for MemorySink {
    fn create(&self, path: &str, layout: &OutputLayout) -> Result<Box<dyn OutputGranule>> {
        let mut data = HashMap::new();
        for var in &layout.variables {
            let shape: Vec<usize> = var
                .dimensions
                .iter()
                .map(|name| {
                    layout
                        .dims
                        .iter()
                        .find(|d| d.name == *name)
                        .map(|d| d.size)
                        .unwrap_or(0)
                })
                .collect();
            data.insert(
                var.name.clone(),
                DataArray::full(var.datatype, &shape, var.fill_value()),
            );
        }
        Ok(Box::new(MemoryOutputGranule {
            files: Arc::clone(&self.files),
            out: Some(MemoryOutput {
                layout: layout.clone(),
                data,
                attrs: Vec::new(),
            }),
            tmp_path: path.to_string(),
        }))
    }
}

struct MemoryOutputGranule {
    files: Arc<Mutex<HashMap<String, MemoryOutput>>>,
    out: Option<MemoryOutput>,
    #[allow(dead_code)]
    tmp_path: String,
}

impl OutputGranule for MemoryOutputGranule {
    fn write(&mut self, var: &str, ranges: &[Range<usize>], data: &DataArray) -> Result<()> {
        let out = self.out.as_mut().expect("not finalized");
        let target = out
            .data
            .get_mut(var)
            .ok_or_else(|| Error::Store(format!("no variable {var} in output")))?;
        target.assign_window(ranges, data)
    }

    fn set_global_attr(&mut self, name: &str, value: &AttrValue) -> Result<()> {
        let out = self.out.as_mut().expect("not finalized");
        out.attrs.push((name.to_string(), value.clone()));
        Ok(())
    }

    fn finalize(mut self: Box<Self>, final_path: &str) -> Result<()> {
        let out = self.out.take().expect("not finalized");
        self.files.lock().insert(final_path.to_string(), out);
        Ok(())
    }

    fn discard(self: Box<Self>) {}
}

pub(crate) fn sample_config_json() -> String {
    r#"{
    "dimensions": [
        {
            "name": "record_number",
            "size": null,
            "index_by": "time",
            "expected_cadence": {"record_number": 1.0},
            "flatten": false
        }
    ],
    "variables": [
        {
            "name": "time",
            "dimensions": ["record_number"],
            "datatype": "float64",
            "attributes": {
                "units": "seconds since 2017-02-14 00:00:00",
                "_FillValue": -9999.0
            },
            "chunksizes": [128]
        },
        {
            "name": "flux",
            "dimensions": ["record_number"],
            "datatype": "float64",
            "attributes": {"_FillValue": -9999.0}
        }
    ],
    "global attributes": [
        {"name": "title", "strategy": "first"},
        {"name": "processing_level", "strategy": "unique_list"},
        {"name": "date_created", "strategy": "date_created"}
    ]
}"#
    .to_string()
}

/// One unlimited record dimension indexed by `time` at 1 Hz, with a `flux`
/// data variable. The shape most of the planner and evaluator tests use.
pub(crate) fn sample_config() -> Config {
    Config::from_json(&sample_config_json()).expect("sample config is valid")
}

/// Multidimensional time: `OB_time(report_number, samples_per_record)` at
/// 1 Hz outer, 10 Hz inner, projected through sample 0.
pub(crate) fn multidim_config() -> Config {
    let config = Config {
        dimensions: vec![
            DimensionSpec {
                name: "report_number".to_string(),
                size: None,
                index_by: Some("OB_time".to_string()),
                other_dim_indices: [("samples_per_record".to_string(), 0)].into_iter().collect(),
                expected_cadence: [
                    ("report_number".to_string(), 1.0),
                    ("samples_per_record".to_string(), 10.0),
                ]
                .into_iter()
                .collect(),
                min: None,
                max: None,
                flatten: false,
            },
            DimensionSpec {
                name: "samples_per_record".to_string(),
                size: Some(10),
                index_by: None,
                other_dim_indices: HashMap::new(),
                expected_cadence: HashMap::new(),
                min: None,
                max: None,
                flatten: false,
            },
        ],
        variables: vec![
            VariableSpec {
                name: "OB_time".to_string(),
                dimensions: vec!["report_number".to_string(), "samples_per_record".to_string()],
                datatype: DataType::F64,
                attributes: [
                    (
                        "units".to_string(),
                        AttrValue::Str("seconds since 2000-01-01 12:00:00".to_string()),
                    ),
                    ("_FillValue".to_string(), AttrValue::Float(-9999.0)),
                ]
                .into_iter()
                .collect(),
                chunksizes: None,
            },
            VariableSpec {
                name: "counts".to_string(),
                dimensions: vec!["report_number".to_string(), "samples_per_record".to_string()],
                datatype: DataType::F64,
                attributes: [("_FillValue".to_string(), AttrValue::Float(-999.0))]
                    .into_iter()
                    .collect(),
                chunksizes: None,
            },
        ],
        global_attributes: Vec::new(),
    };
    config.validate().expect("multidim config is valid");
    config
}

/// An indexed `time` dimension plus a flattened `feature_number` dimension.
pub(crate) fn flatten_config() -> Config {
    let config = Config {
        dimensions: vec![
            DimensionSpec {
                name: "time".to_string(),
                size: None,
                index_by: Some("time".to_string()),
                other_dim_indices: HashMap::new(),
                expected_cadence: [("time".to_string(), 1.0)].into_iter().collect(),
                min: None,
                max: None,
                flatten: false,
            },
            DimensionSpec {
                name: "feature_number".to_string(),
                size: None,
                index_by: None,
                other_dim_indices: HashMap::new(),
                expected_cadence: HashMap::new(),
                min: None,
                max: None,
                flatten: true,
            },
        ],
        variables: vec![
            VariableSpec {
                name: "time".to_string(),
                dimensions: vec!["time".to_string()],
                datatype: DataType::F64,
                attributes: [("_FillValue".to_string(), AttrValue::Float(-9999.0))]
                    .into_iter()
                    .collect(),
                chunksizes: None,
            },
            VariableSpec {
                name: "flux".to_string(),
                dimensions: vec!["time".to_string(), "feature_number".to_string()],
                datatype: DataType::F64,
                attributes: [("_FillValue".to_string(), AttrValue::Float(-9999.0))]
                    .into_iter()
                    .collect(),
                chunksizes: None,
            },
        ],
        global_attributes: Vec::new(),
    };
    config.validate().expect("flatten config is valid");
    config
}

/// Two unlimited dimensions, each indexed by its own time variable at 1 Hz:
/// `record_number` by `time` (the primary) and `report_number` by
/// `report_time`, with a `summary` data variable along the latter.
pub(crate) fn two_indexed_config() -> Config {
    let dim = |name: &str, index_by: &str| DimensionSpec {
        name: name.to_string(),
        size: None,
        index_by: Some(index_by.to_string()),
        other_dim_indices: HashMap::new(),
        expected_cadence: [(name.to_string(), 1.0)].into_iter().collect(),
        min: None,
        max: None,
        flatten: false,
    };
    let var = |name: &str, dim: &str, units: bool| {
        let mut attributes: HashMap<String, AttrValue> =
            [("_FillValue".to_string(), AttrValue::Float(-9999.0))]
                .into_iter()
                .collect();
        if units {
            attributes.insert(
                "units".to_string(),
                AttrValue::Str("seconds since 2017-02-14 00:00:00".to_string()),
            );
        }
        VariableSpec {
            name: name.to_string(),
            dimensions: vec![dim.to_string()],
            datatype: DataType::F64,
            attributes,
            chunksizes: None,
        }
    };
    let config = Config {
        dimensions: vec![
            dim("record_number", "time"),
            dim("report_number", "report_time"),
        ],
        variables: vec![
            var("time", "record_number", true),
            var("flux", "record_number", false),
            var("report_time", "report_number", true),
            var("summary", "report_number", false),
        ],
        global_attributes: Vec::new(),
    };
    config.validate().expect("two indexed config is valid");
    config
}

/// Two granules named `a.nc` and `b.nc` with the given time values. Flux is
/// a global running index so tests can tell exactly which record landed
/// where.
pub(crate) fn two_granule_store(a_times: &[f64], b_times: &[f64]) -> MemoryStore {
    let store = MemoryStore::new();
    let flux_a: Vec<f64> = (0..a_times.len()).map(|i| i as f64).collect();
    let flux_b: Vec<f64> = (0..b_times.len())
        .map(|i| (a_times.len() + i) as f64)
        .collect();
    store.add(
        MemoryGranuleBuilder::new("a.nc")
            .unlimited_dim("record_number", a_times.len())
            .var_f64("time", &["record_number"], a_times)
            .var_f64("flux", &["record_number"], &flux_a),
    );
    store.add(
        MemoryGranuleBuilder::new("b.nc")
            .unlimited_dim("record_number", b_times.len())
            .var_f64("time", &["record_number"], b_times)
            .var_f64("flux", &["record_number"], &flux_b),
    );
    store
}

pub(crate) fn inspect_all(
    store: &MemoryStore,
    config: &Config,
    paths: &[&str],
) -> Vec<Arc<GranuleDescriptor>> {
    paths
        .iter()
        .map(|path| GranuleDescriptor::inspect(store, path, config).expect("inspect"))
        .collect()
}
