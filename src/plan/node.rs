//! Plan nodes: the two kinds of contribution along an unlimited dimension.
//!
//! An `InputSlice` references a granule and realizes, through its per-dim
//! mini-plan, a sorted, deduplicated, cadence-filled view of that granule's
//! own records. A `FillSegment` synthesizes missing records. Both answer the
//! same two questions: how many records along a dimension, and what data for
//! a variable. The raw granule file is never modified and bulk data is only
//! read inside `data_for`.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};

use crate::cache::HandleCache;
use crate::cadence::Cadence;
use crate::config::{Config, VariableSpec};
use crate::data::DataArray;
use crate::descriptor::GranuleDescriptor;
use crate::errors::Result;
use crate::granule::Granule;

/// A run of synthesized records along one unlimited dimension.
///
/// When the dimension's index variable is requested and every one of its
/// dimensions has a configured cadence, the segment emits a monotonically
/// increasing lattice of index values starting at `start`; any other variable
/// comes out at its fill value.
///
#[derive(Debug, Clone, PartialEq)]
pub struct FillSegment {
    pub dim: String,
    pub count: usize,
    /// First synthesized index value; `None` when no cadence is configured.
    pub start: Option<f64>,
}

impl FillSegment {
    /// Data of shape `shape` for `var`, whose dimension list positions the
    /// fill dimension. `skip` offsets the lattice when only the tail of the
    /// segment is being materialized.
    ///
    pub fn data(
        &self,
        var: &VariableSpec,
        config: &Config,
        shape: &[usize],
        skip: usize,
    ) -> Result<DataArray> {
        let dim = config.dim(&self.dim);
        let lattice = dim.and_then(|dim| {
            if dim.index_by.as_deref() != Some(var.name.as_str()) {
                return None;
            }
            if shape.len() != var.dimensions.len() {
                return None;
            }
            let start = self.start?;
            let steps: Vec<f64> = var
                .dimensions
                .iter()
                .map(|d| dim.expected_cadence.get(d).copied().and_then(Cadence::new))
                .collect::<Option<Vec<Cadence>>>()?
                .iter()
                .map(Cadence::step)
                .collect();
            let along = var.dimensions.iter().position(|d| d == &self.dim)?;
            Some((start, steps, along))
        });

        match lattice {
            Some((start, steps, along)) => {
                let values = ArrayD::from_shape_fn(IxDyn(shape), |idx| {
                    let mut value = start;
                    for (k, step) in steps.iter().enumerate() {
                        let offset = if k == along { idx[k] + skip } else { idx[k] };
                        value += offset as f64 * step;
                    }
                    value
                });
                DataArray::from_f64(var.datatype, values)
            }
            None => Ok(DataArray::full(var.datatype, shape, var.fill_value())),
        }
    }
}

/// One contiguous piece of a mini-plan: either a range of records in the
/// granule's sorted order, or an inner fill.
///
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Records(Range<usize>),
    Fill(FillSegment),
}

impl Segment {
    fn len(&self) -> usize {
        match self {
            Segment::Records(range) => range.len(),
            Segment::Fill(fill) => fill.count,
        }
    }
}

/// The sorted, deduplicated, cadence-filled view a granule presents of itself
/// along one indexed unlimited dimension, plus the external trim the planner
/// applies for bound chop and neighbor overlap.
///
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedView {
    /// Sort permutation into raw record order; `None` when the granule is
    /// already in order and segments address raw records directly.
    pub order: Option<Vec<usize>>,
    pub segments: Vec<Segment>,
    /// Index value of every row of the view, synthesized rows included.
    pub values: Vec<f64>,
    /// External trim, in view coordinates.
    pub start: usize,
    pub stop: usize,
}

impl IndexedView {
    /// Build the view from a granule's projected index values. Records with
    /// non-finite or non-positive index values are invalid and excluded;
    /// repeated index values collapse to the first occurrence; holes larger
    /// than the gap threshold become inner fills.
    ///
    pub fn build(dim: &str, projected: &[f64], cadence: Option<Cadence>) -> IndexedView {
        let n = projected.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| projected[a].total_cmp(&projected[b]));

        let mut segments: Vec<Segment> = Vec::new();
        let mut values: Vec<f64> = Vec::new();
        let mut open: Option<usize> = None;
        let mut last_kept: Option<f64> = None;

        let mut close = |open: &mut Option<usize>, segments: &mut Vec<Segment>, end: usize| {
            if let Some(start) = open.take() {
                segments.push(Segment::Records(start..end));
            }
        };

        for (i, &raw) in order.iter().enumerate() {
            let v = projected[raw];
            if !v.is_finite() || v <= 0.0 {
                close(&mut open, &mut segments, i);
                continue;
            }
            if let (Some(prev), Some(c)) = (last_kept, cadence) {
                if v - prev <= c.bound_slack() {
                    // A repeat of the record we already kept.
                    close(&mut open, &mut segments, i);
                    continue;
                }
                let missing = c.records_between(prev, v);
                if missing > 0 {
                    close(&mut open, &mut segments, i);
                    segments.push(Segment::Fill(FillSegment {
                        dim: dim.to_string(),
                        count: missing,
                        start: Some(prev + c.step()),
                    }));
                    for j in 1..=missing {
                        values.push(prev + j as f64 * c.step());
                    }
                }
            }
            if open.is_none() {
                open = Some(i);
            }
            values.push(v);
            last_kept = Some(v);
        }
        close(&mut open, &mut segments, n);

        let identity = order.iter().enumerate().all(|(i, &raw)| i == raw);
        let stop = values.len();
        IndexedView {
            order: if identity { None } else { Some(order) },
            segments,
            values,
            start: 0,
            stop,
        }
    }

    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.stop
    }

    pub fn first_value(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.values[self.start])
    }

    pub fn last_value(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.values[self.stop - 1])
    }

    /// Drop leading rows below `min` and trailing rows at or above `max`,
    /// half-open with a slack that only forgives float noise.
    ///
    pub fn chop(&mut self, min: Option<f64>, max: Option<f64>, slack: f64) {
        if let Some(min) = min {
            while self.start < self.stop && self.values[self.start] < min - slack {
                self.start += 1;
            }
        }
        if let Some(max) = max {
            while self.start < self.stop && self.values[self.stop - 1] >= max - slack {
                self.stop -= 1;
            }
        }
    }

    /// Drop leading rows that overlap the previous granule's last kept value.
    ///
    pub fn trim_overlap(&mut self, prev_last: f64, tolerance: f64) {
        while self.start < self.stop && self.values[self.start] <= prev_last + tolerance {
            self.start += 1;
        }
    }
}

/// A granule's contribution to the plan.
///
#[derive(Debug, Clone)]
pub struct InputSlice {
    pub granule: Arc<GranuleDescriptor>,
    pub(crate) views: HashMap<String, IndexedView>,
}

impl InputSlice {
    pub fn new(granule: Arc<GranuleDescriptor>) -> InputSlice {
        InputSlice {
            granule,
            views: HashMap::new(),
        }
    }

    pub fn view(&self, dim: &str) -> Option<&IndexedView> {
        self.views.get(dim)
    }

    pub fn size_along(&self, dim: &str) -> usize {
        match self.views.get(dim) {
            Some(view) => view.len(),
            None => self.granule.size_along(dim),
        }
    }

    fn output_shape(&self, var: &VariableSpec, config: &Config) -> Vec<usize> {
        var.dimensions
            .iter()
            .map(|d| match self.views.get(d) {
                Some(view) => view.len(),
                None => match config.dim(d).and_then(|d| d.size) {
                    Some(fixed) => fixed,
                    None => self.granule.size_along(d),
                },
            })
            .collect()
    }

    /// Materialize this node's rows for `var`: shape equal to the variable's
    /// declared shape with the indexed dimension replaced by `size_along`.
    ///
    /// An in-order granule is streamed segment by segment without a whole
    /// variable read; an out-of-order granule is read once inside this call
    /// and reordered through the sort permutation.
    ///
    pub fn data_for(
        &self,
        var: &VariableSpec,
        config: &Config,
        reader: &HandleCache<'_>,
    ) -> Result<DataArray> {
        let fill = var.fill_value();

        if !self.granule.present_vars.contains(&var.name) {
            return Ok(DataArray::full(
                var.datatype,
                &self.output_shape(var, config),
                fill,
            ));
        }

        let handle = reader.get(&self.granule.path)?;
        let gdims = &self.granule.var_dims[&var.name];
        let gshape: Vec<usize> = gdims.iter().map(|d| self.granule.size_along(d)).collect();

        let indexed = gdims
            .iter()
            .position(|d| self.views.contains_key(d))
            .map(|axis| (axis, &self.views[&gdims[axis]]));

        let mut data = match indexed {
            None => {
                let ranges: Vec<Range<usize>> = gshape.iter().map(|&s| 0..s).collect();
                handle.read_slice(&var.name, &ranges)?
            }
            Some((axis, view)) => {
                let mut shape = gshape.clone();
                shape[axis] = view.len();
                let mut out = DataArray::full(var.datatype, &shape, fill);

                // Whole-variable read, deferred until an out-of-order segment
                // actually needs it.
                let mut full: Option<DataArray> = None;
                let mut pos = 0;
                let mut cursor = 0;
                for segment in &view.segments {
                    let size = segment.len();
                    let lo = view.start.max(pos);
                    let hi = view.stop.min(pos + size);
                    if lo < hi {
                        let local = (lo - pos)..(hi - pos);
                        let part = match segment {
                            Segment::Records(range) => {
                                let rows = range.start + local.start..range.start + local.end;
                                match &view.order {
                                    None => {
                                        let ranges: Vec<Range<usize>> = gshape
                                            .iter()
                                            .enumerate()
                                            .map(|(k, &s)| {
                                                if k == axis {
                                                    rows.clone()
                                                } else {
                                                    0..s
                                                }
                                            })
                                            .collect();
                                        handle.read_slice(&var.name, &ranges)?
                                    }
                                    Some(order) => {
                                        if full.is_none() {
                                            let ranges: Vec<Range<usize>> =
                                                gshape.iter().map(|&s| 0..s).collect();
                                            full = Some(handle.read_slice(&var.name, &ranges)?);
                                        }
                                        full.as_ref()
                                            .expect("read above")
                                            .select(axis, &order[rows])
                                    }
                                }
                            }
                            Segment::Fill(inner) => {
                                let mut seg_shape = shape.clone();
                                seg_shape[axis] = local.len();
                                inner.data(var, config, &seg_shape, local.start)?
                            }
                        };
                        out.assign_along(axis, cursor, &part)?;
                        cursor += hi - lo;
                    }
                    pos += size;
                    if pos >= view.stop {
                        break;
                    }
                }
                out
            }
        };

        data.fill_nan(fill);
        Ok(align_axes(data, &var.dimensions, gdims))
    }
}

/// Insert size-1 axes wherever the configuration declares a dimension the
/// granule doesn't carry.
fn align_axes(mut data: DataArray, config_dims: &[String], granule_dims: &[String]) -> DataArray {
    if config_dims.len() == granule_dims.len() {
        return data;
    }
    let mut have = granule_dims.iter().peekable();
    for (axis, dim) in config_dims.iter().enumerate() {
        if have.peek() == Some(&dim) {
            have.next();
        } else {
            data = data.insert_axis(axis);
        }
    }
    data
}

/// A plan element along an unlimited dimension.
///
#[derive(Debug, Clone)]
pub enum Node {
    Input(InputSlice),
    Fill(FillSegment),
}

impl Node {
    /// Number of records this node contributes along `dim`. Fixed once the
    /// plan is sealed; a fill segment contributes only to its own dimension.
    ///
    pub fn size_along(&self, dim: &str) -> usize {
        match self {
            Node::Input(input) => input.size_along(dim),
            Node::Fill(fill) => {
                if fill.dim == dim {
                    fill.count
                } else {
                    0
                }
            }
        }
    }

    /// The node's data for `var`: the variable's declared shape with the
    /// plan dimension replaced by `size_along`. Never returns NaN where the
    /// variable has a fill value.
    ///
    pub fn data_for(
        &self,
        var: &VariableSpec,
        config: &Config,
        reader: &HandleCache<'_>,
    ) -> Result<DataArray> {
        match self {
            Node::Input(input) => input.data_for(var, config, reader),
            Node::Fill(fill) => {
                let shape: Vec<usize> = var
                    .dimensions
                    .iter()
                    .map(|d| {
                        if d == &fill.dim {
                            fill.count
                        } else {
                            config.dim(d).and_then(|d| d.size).unwrap_or(0)
                        }
                    })
                    .collect();
                fill.data(var, config, &shape, 0)
            }
        }
    }

    pub fn as_input(&self) -> Option<&InputSlice> {
        match self {
            Node::Input(input) => Some(input),
            Node::Fill(_) => None,
        }
    }

    pub(crate) fn as_input_mut(&mut self) -> Option<&mut InputSlice> {
        match self {
            Node::Input(input) => Some(input),
            Node::Fill(_) => None,
        }
    }
}
