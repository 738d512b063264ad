//! Typed value model shared by the configuration surface, the granule
//! contracts, and the evaluator.
//!
//! A `DataArray` is a tagged wrapper over `ndarray::ArrayD` in each supported
//! NetCDF datatype. The engine never transforms values: the only operations
//! are allocation at fill, reordering, windowed copies, and NaN-to-fill
//! substitution.

use std::fmt;
use std::ops::Range;

use ndarray::{ArrayD, Axis, IxDyn, Slice, SliceInfoElem};
use num_traits::NumCast;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// The closed set of variable datatypes the engine understands.
///
/// Serialized names follow the numpy-style strings the configuration surface
/// uses (`"int8"`, `"float32"`, `"str"`).
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Str,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::I8 => "int8",
            DataType::U8 => "uint8",
            DataType::I16 => "int16",
            DataType::U16 => "uint16",
            DataType::I32 => "int32",
            DataType::U32 => "uint32",
            DataType::I64 => "int64",
            DataType::U64 => "uint64",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
            DataType::Str => "str",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "int8" | "i1" | "byte" => DataType::I8,
            "uint8" | "u1" | "ubyte" => DataType::U8,
            "int16" | "i2" | "short" => DataType::I16,
            "uint16" | "u2" | "ushort" => DataType::U16,
            "int32" | "i4" | "int" => DataType::I32,
            "uint32" | "u4" | "uint" => DataType::U32,
            "int64" | "i8" | "long" => DataType::I64,
            "uint64" | "u8" | "ulong" => DataType::U64,
            "float32" | "f4" | "float" => DataType::F32,
            "float64" | "f8" | "double" => DataType::F64,
            "str" | "string" => DataType::Str,
            other => {
                return Err(Error::ConfigInvalid(format!("unknown datatype: {other:?}")))
            }
        })
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for DataType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        DataType::parse(&name).map_err(serde::de::Error::custom)
    }
}

/// A scalar or small-vector attribute value, as found on variables and in the
/// global attribute stream.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    StrList(Vec<String>),
}

impl AttrValue {
    /// Numeric view of the value, parsing strings when possible.
    ///
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::Float(v) => Some(*v),
            AttrValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Float(v) => Some(*v as i64),
            AttrValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Str(s) => f.write_str(s),
            AttrValue::IntList(v) => write!(f, "{v:?}"),
            AttrValue::FloatList(v) => write!(f, "{v:?}"),
            AttrValue::StrList(v) => write!(f, "{v:?}"),
        }
    }
}

/// Default fill values per datatype, matching the NetCDF library defaults
/// used when a variable carries no explicit `_FillValue`.
///
fn default_numeric<T: NumCast>(datatype: DataType) -> T {
    match datatype {
        DataType::I8 => T::from(-127_i8),
        DataType::U8 => T::from(255_u8),
        DataType::I16 => T::from(-32767_i16),
        DataType::U16 => T::from(65535_u16),
        DataType::I32 => T::from(-2147483647_i32),
        DataType::U32 => T::from(4294967295_u32),
        DataType::I64 => T::from(-9223372036854775806_i64),
        DataType::U64 => T::from(18446744073709551614_u64),
        DataType::F32 => T::from(9.96921e+36_f32),
        DataType::F64 => T::from(9.969209968386869e+36_f64),
        DataType::Str => None,
    }
    .expect("default fill representable in its own type")
}

macro_rules! each_numeric {
    ($macro:ident) => {
        $macro!(I8, i8);
        $macro!(U8, u8);
        $macro!(I16, i16);
        $macro!(U16, u16);
        $macro!(I32, i32);
        $macro!(U32, u32);
        $macro!(I64, i64);
        $macro!(U64, u64);
        $macro!(F32, f32);
        $macro!(F64, f64);
    };
}

/// An n-dimensional array in one of the supported datatypes.
///
#[derive(Debug, Clone, PartialEq)]
pub enum DataArray {
    I8(ArrayD<i8>),
    U8(ArrayD<u8>),
    I16(ArrayD<i16>),
    U16(ArrayD<u16>),
    I32(ArrayD<i32>),
    U32(ArrayD<u32>),
    I64(ArrayD<i64>),
    U64(ArrayD<u64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    Str(ArrayD<String>),
}

/// Dispatch over every variant, rebuilding the same variant from the result.
macro_rules! map_variants {
    ($value:expr, $arr:ident => $body:expr) => {
        match $value {
            DataArray::I8($arr) => DataArray::I8($body),
            DataArray::U8($arr) => DataArray::U8($body),
            DataArray::I16($arr) => DataArray::I16($body),
            DataArray::U16($arr) => DataArray::U16($body),
            DataArray::I32($arr) => DataArray::I32($body),
            DataArray::U32($arr) => DataArray::U32($body),
            DataArray::I64($arr) => DataArray::I64($body),
            DataArray::U64($arr) => DataArray::U64($body),
            DataArray::F32($arr) => DataArray::F32($body),
            DataArray::F64($arr) => DataArray::F64($body),
            DataArray::Str($arr) => DataArray::Str($body),
        }
    };
}

/// Dispatch over matching variant pairs; mismatched datatypes fall through.
macro_rules! zip_variants {
    ($a:expr, $b:expr, ($x:ident, $y:ident) => $body:expr, _ => $other:expr) => {
        match ($a, $b) {
            (DataArray::I8($x), DataArray::I8($y)) => $body,
            (DataArray::U8($x), DataArray::U8($y)) => $body,
            (DataArray::I16($x), DataArray::I16($y)) => $body,
            (DataArray::U16($x), DataArray::U16($y)) => $body,
            (DataArray::I32($x), DataArray::I32($y)) => $body,
            (DataArray::U32($x), DataArray::U32($y)) => $body,
            (DataArray::I64($x), DataArray::I64($y)) => $body,
            (DataArray::U64($x), DataArray::U64($y)) => $body,
            (DataArray::F32($x), DataArray::F32($y)) => $body,
            (DataArray::F64($x), DataArray::F64($y)) => $body,
            (DataArray::Str($x), DataArray::Str($y)) => $body,
            _ => $other,
        }
    };
}

fn numeric_fill<T: NumCast>(datatype: DataType, fill: Option<&AttrValue>) -> T {
    let cast = match fill {
        Some(AttrValue::Int(v)) => T::from(*v),
        Some(AttrValue::Float(v)) => T::from(*v),
        Some(AttrValue::Str(s)) => s.trim().parse::<f64>().ok().and_then(T::from),
        _ => None,
    };
    // An absent or unrepresentable _FillValue falls back to the datatype
    // default.
    cast.unwrap_or_else(|| default_numeric(datatype))
}

impl DataArray {
    pub fn datatype(&self) -> DataType {
        match self {
            DataArray::I8(_) => DataType::I8,
            DataArray::U8(_) => DataType::U8,
            DataArray::I16(_) => DataType::I16,
            DataArray::U16(_) => DataType::U16,
            DataArray::I32(_) => DataType::I32,
            DataArray::U32(_) => DataType::U32,
            DataArray::I64(_) => DataType::I64,
            DataArray::U64(_) => DataType::U64,
            DataArray::F32(_) => DataType::F32,
            DataArray::F64(_) => DataType::F64,
            DataArray::Str(_) => DataType::Str,
        }
    }

    pub fn shape(&self) -> &[usize] {
        map_variants_shape(self)
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate an array of `shape` filled with the variable's fill value,
    /// falling back to the datatype default when none is configured.
    ///
    pub fn full(datatype: DataType, shape: &[usize], fill: Option<&AttrValue>) -> DataArray {
        macro_rules! alloc {
            ($variant:ident, $ty:ty) => {
                if datatype == DataType::$variant {
                    let value: $ty = numeric_fill(datatype, fill);
                    return DataArray::$variant(ArrayD::from_elem(IxDyn(shape), value));
                }
            };
        }
        each_numeric!(alloc);

        let value = match fill {
            Some(AttrValue::Str(s)) => s.clone(),
            _ => String::new(),
        };
        DataArray::Str(ArrayD::from_elem(IxDyn(shape), value))
    }

    /// Rows of `axis` picked out by `indices`, in that order. Used to apply a
    /// sort permutation to an out-of-order granule.
    ///
    pub fn select(&self, axis: usize, indices: &[usize]) -> DataArray {
        map_variants!(self, arr => arr.select(Axis(axis), indices))
    }

    /// An owned copy of the `range` window along `axis`.
    ///
    pub fn slice_along(&self, axis: usize, range: Range<usize>) -> DataArray {
        map_variants!(self, arr => {
            arr.slice_axis(Axis(axis), Slice::from(range.clone())).to_owned()
        })
    }

    /// Copy `src` into the window of this array starting at `offset` along
    /// `axis`. Shapes must agree on every other axis and datatypes must match.
    ///
    pub fn assign_along(&mut self, axis: usize, offset: usize, src: &DataArray) -> Result<()> {
        let len = src.shape()[axis];
        zip_variants!(&mut *self, src, (dst, s) => {
            dst.slice_axis_mut(Axis(axis), Slice::from(offset..offset + len))
                .assign(s);
            Ok(())
        }, _ => Err(Error::SchemaMismatch(format!(
            "cannot copy {} data into {} array",
            src.datatype(),
            self.datatype()
        ))))
    }

    /// Copy `src` into the window described by `ranges`, one half-open range
    /// per dimension. The shape of `src` must equal the window's.
    ///
    pub fn assign_window(&mut self, ranges: &[Range<usize>], src: &DataArray) -> Result<()> {
        let info: Vec<SliceInfoElem> = ranges
            .iter()
            .map(|r| SliceInfoElem::Slice {
                start: r.start as isize,
                end: Some(r.end as isize),
                step: 1,
            })
            .collect();
        zip_variants!(&mut *self, src, (dst, s) => {
            dst.slice_mut(info.as_slice()).assign(s);
            Ok(())
        }, _ => Err(Error::SchemaMismatch(format!(
            "cannot copy {} data into {} array",
            src.datatype(),
            self.datatype()
        ))))
    }

    /// Add a synthetic axis of size 1 at `axis`, aligning granule data with a
    /// configuration that introduces a per-file dimension.
    ///
    pub fn insert_axis(self, axis: usize) -> DataArray {
        map_variants!(self, arr => arr.insert_axis(Axis(axis)))
    }

    /// Replace non-finite values with the fill value. Only float arrays can
    /// hold NaN; everything else passes through untouched.
    ///
    pub fn fill_nan(&mut self, fill: Option<&AttrValue>) {
        match self {
            DataArray::F32(arr) => {
                let fill: f32 = numeric_fill(DataType::F32, fill);
                arr.mapv_inplace(|v| if v.is_finite() { v } else { fill });
            }
            DataArray::F64(arr) => {
                let fill: f64 = numeric_fill(DataType::F64, fill);
                arr.mapv_inplace(|v| if v.is_finite() { v } else { fill });
            }
            _ => {}
        }
    }

    /// Cast an array of synthesized f64 index values to the declared type of
    /// the index variable. String index variables are not sortable and are
    /// rejected upstream.
    ///
    pub fn from_f64(datatype: DataType, values: ArrayD<f64>) -> Result<DataArray> {
        macro_rules! cast {
            ($variant:ident, $ty:ty) => {
                if datatype == DataType::$variant {
                    return Ok(DataArray::$variant(
                        values.mapv(|v| <$ty as NumCast>::from(v).unwrap_or_default()),
                    ));
                }
            };
        }
        each_numeric!(cast);
        Err(Error::IndexVarNonNumeric("string index values".to_string()))
    }

    /// Numeric view of one cell, used to project index variables.
    ///
    pub fn get_f64(&self, index: &[usize]) -> Option<f64> {
        macro_rules! get {
            ($variant:ident, $ty:ty) => {
                if let DataArray::$variant(arr) = self {
                    return arr.get(IxDyn(index)).copied().and_then(|v| NumCast::from(v));
                }
            };
        }
        each_numeric!(get);
        None
    }
}

fn map_variants_shape(value: &DataArray) -> &[usize] {
    match value {
        DataArray::I8(arr) => arr.shape(),
        DataArray::U8(arr) => arr.shape(),
        DataArray::I16(arr) => arr.shape(),
        DataArray::U16(arr) => arr.shape(),
        DataArray::I32(arr) => arr.shape(),
        DataArray::U32(arr) => arr.shape(),
        DataArray::I64(arr) => arr.shape(),
        DataArray::U64(arr) => arr.shape(),
        DataArray::F32(arr) => arr.shape(),
        DataArray::F64(arr) => arr.shape(),
        DataArray::Str(arr) => arr.shape(),
    }
}

/// The default `_FillValue` written into derived configurations for variables
/// that don't declare one. String variables carry no fill value; the unsigned
/// 64-bit default is only representable approximately as an attribute.
///
pub fn default_fill_value(datatype: DataType) -> Option<AttrValue> {
    Some(match datatype {
        DataType::Str => return None,
        DataType::U64 => AttrValue::Float(1.8446744073709552e19),
        DataType::F32 => AttrValue::Float(default_numeric(datatype)),
        DataType::F64 => AttrValue::Float(default_numeric(datatype)),
        _ => AttrValue::Int(default_numeric(datatype)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_datatype_names_roundtrip() {
        for dt in [
            DataType::I8,
            DataType::U8,
            DataType::I16,
            DataType::U16,
            DataType::I32,
            DataType::U32,
            DataType::I64,
            DataType::U64,
            DataType::F32,
            DataType::F64,
            DataType::Str,
        ] {
            assert_eq!(DataType::parse(dt.name()).unwrap(), dt);
        }
        assert!(DataType::parse("complex64").is_err());
    }

    #[test]
    fn test_attr_value_untagged_json() {
        let v: AttrValue = serde_json::from_str("3").unwrap();
        assert_eq!(v, AttrValue::Int(3));
        let v: AttrValue = serde_json::from_str("3.5").unwrap();
        assert_eq!(v, AttrValue::Float(3.5));
        let v: AttrValue = serde_json::from_str("\"GOES-16\"").unwrap();
        assert_eq!(v, AttrValue::Str("GOES-16".to_string()));
        let v: AttrValue = serde_json::from_str("[1, 2, 4]").unwrap();
        assert_eq!(v, AttrValue::IntList(vec![1, 2, 4]));
    }

    #[test]
    fn test_full_uses_configured_fill() {
        let fill = AttrValue::Int(-99);
        let arr = DataArray::full(DataType::I16, &[2, 3], Some(&fill));
        assert_eq!(arr.shape(), &[2, 3]);
        assert_eq!(arr.get_f64(&[1, 2]), Some(-99.0));
    }

    #[test]
    fn test_full_defaults_per_datatype() {
        let arr = DataArray::full(DataType::F32, &[4], None);
        assert_eq!(arr.get_f64(&[0]), Some(9.96921e+36_f32 as f64));
        let arr = DataArray::full(DataType::I32, &[1], None);
        assert_eq!(arr.get_f64(&[0]), Some(-2147483647.0));
    }

    #[test]
    fn test_select_applies_permutation() {
        let arr = DataArray::F64(arr1(&[10.0, 12.0, 11.0]).into_dyn());
        let sorted = arr.select(0, &[0, 2, 1]);
        assert_eq!(
            sorted,
            DataArray::F64(arr1(&[10.0, 11.0, 12.0]).into_dyn())
        );
    }

    #[test]
    fn test_assign_along_window() {
        let mut out = DataArray::full(DataType::F64, &[4, 2], Some(&AttrValue::Float(-1.0)));
        let part = DataArray::F64(
            ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
        );
        out.assign_along(0, 1, &part).unwrap();
        assert_eq!(out.get_f64(&[0, 0]), Some(-1.0));
        assert_eq!(out.get_f64(&[1, 0]), Some(1.0));
        assert_eq!(out.get_f64(&[2, 1]), Some(4.0));
        assert_eq!(out.get_f64(&[3, 1]), Some(-1.0));
    }

    #[test]
    fn test_assign_along_type_mismatch() {
        let mut out = DataArray::full(DataType::F64, &[2], None);
        let part = DataArray::full(DataType::I32, &[1], None);
        assert!(out.assign_along(0, 0, &part).is_err());
    }

    #[test]
    fn test_fill_nan_substitution() {
        let mut arr = DataArray::F32(arr1(&[1.0_f32, f32::NAN, 3.0]).into_dyn());
        arr.fill_nan(Some(&AttrValue::Float(-9999.0)));
        assert_eq!(
            arr,
            DataArray::F32(arr1(&[1.0_f32, -9999.0, 3.0]).into_dyn())
        );
    }

    #[test]
    fn test_from_f64_casts_to_declared_type() {
        let values = arr1(&[1.0, 2.0, 3.0]).into_dyn();
        let arr = DataArray::from_f64(DataType::I32, values).unwrap();
        assert_eq!(arr, DataArray::I32(arr1(&[1, 2, 3]).into_dyn()));
        assert!(DataArray::from_f64(DataType::Str, arr1(&[1.0]).into_dyn()).is_err());
    }
}
