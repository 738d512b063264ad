//! Granule store and output sink over real NetCDF files, via the `netcdf`
//! crate. Compiled only with the `netcdf` feature.
//!
//! The underlying C library is not thread safe, so each open file sits
//! behind a mutex; the engine is single-threaded blocking anyway. String
//! variables are declared but not copied by this adapter.

use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use ndarray::{Array1, ArrayD, IxDyn};
use parking_lot::Mutex;

use crate::data::{AttrValue, DataArray, DataType};
use crate::errors::{Error, Result};
use crate::granule::{
    DimSchema, Granule, GranuleSchema, GranuleStore, OutputGranule, OutputLayout, OutputSink,
    VarSchema,
};

impl From<netcdf::Error> for Error {
    fn from(err: netcdf::Error) -> Self {
        Error::Store(err.to_string())
    }
}

fn from_nc_attr(value: netcdf::AttributeValue) -> Option<AttrValue> {
    use netcdf::AttributeValue as A;
    Some(match value {
        A::Schar(v) => AttrValue::Int(v as i64),
        A::Uchar(v) => AttrValue::Int(v as i64),
        A::Short(v) => AttrValue::Int(v as i64),
        A::Ushort(v) => AttrValue::Int(v as i64),
        A::Int(v) => AttrValue::Int(v as i64),
        A::Uint(v) => AttrValue::Int(v as i64),
        A::Longlong(v) => AttrValue::Int(v),
        A::Ulonglong(v) => AttrValue::Int(v as i64),
        A::Float(v) => AttrValue::Float(v as f64),
        A::Double(v) => AttrValue::Float(v),
        A::Str(v) => AttrValue::Str(v),
        A::Schars(v) => AttrValue::IntList(v.into_iter().map(|x| x as i64).collect()),
        A::Uchars(v) => AttrValue::IntList(v.into_iter().map(|x| x as i64).collect()),
        A::Shorts(v) => AttrValue::IntList(v.into_iter().map(|x| x as i64).collect()),
        A::Ushorts(v) => AttrValue::IntList(v.into_iter().map(|x| x as i64).collect()),
        A::Ints(v) => AttrValue::IntList(v.into_iter().map(|x| x as i64).collect()),
        A::Uints(v) => AttrValue::IntList(v.into_iter().map(|x| x as i64).collect()),
        A::Longlongs(v) => AttrValue::IntList(v),
        A::Ulonglongs(v) => AttrValue::IntList(v.into_iter().map(|x| x as i64).collect()),
        A::Floats(v) => AttrValue::FloatList(v.into_iter().map(|x| x as f64).collect()),
        A::Doubles(v) => AttrValue::FloatList(v),
        A::Strs(v) => AttrValue::StrList(v),
        _ => return None,
    })
}

fn to_nc_attr(value: &AttrValue) -> netcdf::AttributeValue {
    use netcdf::AttributeValue as A;
    match value {
        AttrValue::Int(v) => A::Longlong(*v),
        AttrValue::Float(v) => A::Double(*v),
        AttrValue::Str(v) => A::Str(v.clone()),
        AttrValue::IntList(v) => A::Longlongs(v.clone()),
        AttrValue::FloatList(v) => A::Doubles(v.clone()),
        AttrValue::StrList(v) => A::Strs(v.clone()),
    }
}

fn datatype_of(var: &netcdf::Variable<'_>) -> Option<DataType> {
    use netcdf::types::{FloatType, IntType, NcVariableType};
    Some(match var.vartype() {
        NcVariableType::Int(IntType::I8) => DataType::I8,
        NcVariableType::Int(IntType::U8) => DataType::U8,
        NcVariableType::Int(IntType::I16) => DataType::I16,
        NcVariableType::Int(IntType::U16) => DataType::U16,
        NcVariableType::Int(IntType::I32) => DataType::I32,
        NcVariableType::Int(IntType::U32) => DataType::U32,
        NcVariableType::Int(IntType::I64) => DataType::I64,
        NcVariableType::Int(IntType::U64) => DataType::U64,
        NcVariableType::Float(FloatType::F32) => DataType::F32,
        NcVariableType::Float(FloatType::F64) => DataType::F64,
        NcVariableType::String => DataType::Str,
        _ => return None,
    })
}

/// Opens NetCDF granules read-only.
pub struct NetcdfStore;

impl GranuleStore for NetcdfStore {
    fn open(&self, path: &str) -> Result<Arc<dyn Granule>> {
        let file = netcdf::open(path)?;
        Ok(Arc::new(NetcdfGranule {
            path: path.to_string(),
            file: Mutex::new(file),
        }))
    }
}

pub struct NetcdfGranule {
    path: String,
    file: Mutex<netcdf::File>,
}

impl NetcdfGranule {
    fn read_typed(
        file: &netcdf::File,
        var_name: &str,
        datatype: DataType,
        ranges: &[Range<usize>],
    ) -> Result<DataArray> {
        let var = file
            .variable(var_name)
            .ok_or_else(|| Error::Store(format!("no variable {var_name}")))?;
        let shape: Vec<usize> = ranges.iter().map(Range::len).collect();

        macro_rules! read {
            ($variant:ident, $ty:ty) => {{
                let values: Vec<$ty> = if ranges.is_empty() {
                    var.get_values(..)?
                } else {
                    var.get_values(ranges)?
                };
                let arr = ArrayD::from_shape_vec(IxDyn(&shape), values)
                    .map_err(|err| Error::Store(err.to_string()))?;
                Ok(DataArray::$variant(arr))
            }};
        }

        match datatype {
            DataType::I8 => read!(I8, i8),
            DataType::U8 => read!(U8, u8),
            DataType::I16 => read!(I16, i16),
            DataType::U16 => read!(U16, u16),
            DataType::I32 => read!(I32, i32),
            DataType::U32 => read!(U32, u32),
            DataType::I64 => read!(I64, i64),
            DataType::U64 => read!(U64, u64),
            DataType::F32 => read!(F32, f32),
            DataType::F64 => read!(F64, f64),
            DataType::Str => Err(Error::Store(format!(
                "{var_name}: string variables are not copied by the netcdf adapter"
            ))),
        }
    }
}

impl Granule for NetcdfGranule {
    fn path(&self) -> &str {
        &self.path
    }

    fn schema(&self) -> Result<GranuleSchema> {
        let file = self.file.lock();
        let dims = file
            .dimensions()
            .map(|d| DimSchema {
                name: d.name(),
                size: d.len(),
                unlimited: d.is_unlimited(),
            })
            .collect();

        let mut variables = Vec::new();
        for var in file.variables() {
            let datatype = match datatype_of(&var) {
                Some(datatype) => datatype,
                None => {
                    log::debug!("{}: skipping variable {} of unsupported type", self.path, var.name());
                    continue;
                }
            };
            let mut attributes = HashMap::new();
            for attr in var.attributes() {
                if let Some(value) = attr.value().ok().and_then(from_nc_attr) {
                    attributes.insert(attr.name().to_string(), value);
                }
            }
            variables.push(VarSchema {
                name: var.name(),
                dimensions: var.dimensions().iter().map(|d| d.name()).collect(),
                datatype,
                attributes,
                chunksizes: None,
            });
        }

        let mut global_attrs = Vec::new();
        for attr in file.attributes() {
            if let Some(value) = attr.value().ok().and_then(from_nc_attr) {
                global_attrs.push((attr.name().to_string(), value));
            }
        }

        Ok(GranuleSchema {
            dims,
            variables,
            global_attrs,
        })
    }

    fn read_index(
        &self,
        var_name: &str,
        other_dim_indices: &HashMap<String, usize>,
    ) -> Result<Array1<f64>> {
        let file = self.file.lock();
        let var = file
            .variable(var_name)
            .ok_or_else(|| Error::Store(format!("{}: no variable {var_name}", self.path)))?;
        if matches!(datatype_of(&var), Some(DataType::Str) | None) {
            return Err(Error::IndexVarNonNumeric(var_name.to_string()));
        }

        let mut ranges = Vec::new();
        let mut free = 0;
        for dim in var.dimensions() {
            match other_dim_indices.get(&dim.name()) {
                Some(&index) => ranges.push(index..index + 1),
                None => {
                    free += 1;
                    ranges.push(0..dim.len());
                }
            }
        }
        if free != 1 {
            return Err(Error::Store(format!(
                "{var_name}: projection must fix all dimensions but one"
            )));
        }

        let fill = var
            .attribute("_FillValue")
            .and_then(|a| a.value().ok())
            .and_then(from_nc_attr)
            .and_then(|v| v.as_f64());
        let values: Vec<f64> = var.get_values(ranges.as_slice())?;
        Ok(Array1::from(
            values
                .into_iter()
                .map(|v| if Some(v) == fill { f64::NAN } else { v })
                .collect::<Vec<f64>>(),
        ))
    }

    fn read_slice(&self, var_name: &str, ranges: &[Range<usize>]) -> Result<DataArray> {
        let file = self.file.lock();
        let var = file
            .variable(var_name)
            .ok_or_else(|| Error::Store(format!("{}: no variable {var_name}", self.path)))?;
        let datatype = datatype_of(&var)
            .ok_or_else(|| Error::Store(format!("{var_name}: unsupported datatype")))?;
        drop(var);
        Self::read_typed(&file, var_name, datatype, ranges)
    }

    fn attr(&self, name: &str) -> Result<Option<AttrValue>> {
        let file = self.file.lock();
        Ok(file
            .attribute(name)
            .and_then(|a| a.value().ok())
            .and_then(from_nc_attr))
    }
}

/// Creates NetCDF output files under a temp name, renaming on finalize.
pub struct NetcdfSink;

impl OutputSink for NetcdfSink {
    fn create(&self, path: &str, layout: &OutputLayout) -> Result<Box<dyn OutputGranule>> {
        let mut file = netcdf::create(path)?;

        for dim in &layout.dims {
            if dim.unlimited {
                file.add_unlimited_dimension(&dim.name)?;
            } else {
                file.add_dimension(&dim.name, dim.size)?;
            }
        }

        for var in &layout.variables {
            let dims: Vec<&str> = var.dimensions.iter().map(String::as_str).collect();

            macro_rules! declare {
                ($ty:ty) => {
                    file.add_variable::<$ty>(&var.name, &dims)?
                };
            }
            let mut nc_var = match var.datatype {
                DataType::I8 => declare!(i8),
                DataType::U8 => declare!(u8),
                DataType::I16 => declare!(i16),
                DataType::U16 => declare!(u16),
                DataType::I32 => declare!(i32),
                DataType::U32 => declare!(u32),
                DataType::I64 => declare!(i64),
                DataType::U64 => declare!(u64),
                DataType::F32 => declare!(f32),
                DataType::F64 => declare!(f64),
                DataType::Str => file.add_string_variable(&var.name, &dims)?,
            };

            if let Some(chunks) = &var.chunksizes {
                nc_var.set_chunking(chunks)?;
            }
            nc_var.set_compression(7, true)?;
            for (name, value) in &var.attributes {
                nc_var.put_attribute(name.as_str(), to_nc_attr(value))?;
            }
        }

        Ok(Box::new(NetcdfOutput {
            tmp_path: path.to_string(),
            file: Some(file),
        }))
    }
}

pub struct NetcdfOutput {
    tmp_path: String,
    file: Option<netcdf::FileMut>,
}

impl OutputGranule for NetcdfOutput {
    fn write(&mut self, var_name: &str, ranges: &[Range<usize>], data: &DataArray) -> Result<()> {
        let file = self.file.as_mut().expect("not finalized");
        let mut var = file
            .variable_mut(var_name)
            .ok_or_else(|| Error::Store(format!("no variable {var_name} in output")))?;

        macro_rules! write {
            ($arr:expr) => {{
                let values: Vec<_> = $arr.iter().cloned().collect();
                if ranges.is_empty() {
                    var.put_values(&values, ..)?;
                } else {
                    var.put_values(&values, ranges)?;
                }
                Ok(())
            }};
        }

        match data {
            DataArray::I8(arr) => write!(arr),
            DataArray::U8(arr) => write!(arr),
            DataArray::I16(arr) => write!(arr),
            DataArray::U16(arr) => write!(arr),
            DataArray::I32(arr) => write!(arr),
            DataArray::U32(arr) => write!(arr),
            DataArray::I64(arr) => write!(arr),
            DataArray::U64(arr) => write!(arr),
            DataArray::F32(arr) => write!(arr),
            DataArray::F64(arr) => write!(arr),
            DataArray::Str(_) => Err(Error::Store(format!(
                "{var_name}: string variables are not copied by the netcdf adapter"
            ))),
        }
    }

    fn set_global_attr(&mut self, name: &str, value: &AttrValue) -> Result<()> {
        let file = self.file.as_mut().expect("not finalized");
        file.add_attribute(name, to_nc_attr(value))?;
        Ok(())
    }

    fn finalize(mut self: Box<Self>, final_path: &str) -> Result<()> {
        // Close the file before renaming it into place.
        drop(self.file.take());
        std::fs::rename(&self.tmp_path, final_path)?;
        Ok(())
    }

    fn discard(mut self: Box<Self>) {
        drop(self.file.take());
        if Path::new(&self.tmp_path).exists() {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
