//! Plan construction.
//!
//! Planning is pure CPU over descriptor metadata: no bulk data is read. For
//! each unlimited dimension the plan records an ordered node list and the
//! precomputed write window of every node, so the evaluator can stream data
//! without re-reading or re-sorting anything.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use crate::config::{Config, DimensionSpec, ResolvedBounds};
use crate::descriptor::GranuleDescriptor;
use crate::errors::{Error, Result};
use crate::plan::node::{FillSegment, IndexedView, InputSlice, Node};

/// The visit order and write windows along one unlimited dimension.
///
#[derive(Debug, Clone)]
pub struct DimPlan {
    pub dim: String,
    /// Node ids paired with their write window, in visit order. Windows are
    /// cumulative except along a flattened dimension, where every node is
    /// left-justified at zero.
    pub entries: Vec<(usize, Range<usize>)>,
    pub output_size: usize,
    window_by_node: HashMap<usize, Range<usize>>,
}

impl DimPlan {
    fn new(dim: &str, entries: Vec<(usize, Range<usize>)>, output_size: usize) -> DimPlan {
        let window_by_node = entries.iter().cloned().collect();
        DimPlan {
            dim: dim.to_string(),
            entries,
            output_size,
            window_by_node,
        }
    }

    /// The window a particular node writes along this dimension, if the node
    /// appears in this dimension's plan at all.
    pub fn window_of(&self, node: usize) -> Option<&Range<usize>> {
        self.window_by_node.get(&node)
    }
}

/// The finished aggregation plan.
///
/// Invariant: for every unlimited dimension, the concatenation of node sizes
/// equals `output_size`, and windows are disjoint and ordered.
///
#[derive(Debug)]
pub struct Plan {
    nodes: Vec<Node>,
    dims: HashMap<String, DimPlan>,

    /// Input node ids in primary order, after bound chop and dedup. This is
    /// the granule sequence attribute strategies observe.
    pub retained: Vec<usize>,

    pub primary: Option<String>,
    pub bounds: ResolvedBounds,
    pub first_index_value: Option<f64>,
    pub last_index_value: Option<f64>,
}

impl Plan {
    pub fn node(&self, id: usize) -> &Node {
        &self.nodes[id]
    }

    pub fn dim_plan(&self, dim: &str) -> Option<&DimPlan> {
        self.dims.get(dim)
    }

    /// Planned size of an unlimited dimension (fixed dimensions keep their
    /// configured size and are not recorded here).
    pub fn output_size(&self, dim: &str) -> usize {
        self.dims.get(dim).map(|p| p.output_size).unwrap_or(0)
    }

    pub fn retained_granules(&self) -> impl Iterator<Item = &Arc<GranuleDescriptor>> {
        self.retained
            .iter()
            .filter_map(|&id| self.nodes[id].as_input())
            .map(|input| &input.granule)
    }

    /// Build the plan over the given granules.
    ///
    /// The primary dimension is planned first: granules are ordered by their
    /// first projected index value, each granule's mini-plan is chopped to
    /// the bounds and trimmed against its neighbor, and fill segments cover
    /// the leading edge, the gaps, and the trailing edge. Every other
    /// unlimited dimension then follows the retained granule order.
    ///
    pub fn build(config: &Config, descriptors: Vec<Arc<GranuleDescriptor>>) -> Result<Plan> {
        if descriptors.is_empty() {
            return Err(Error::NoInputs);
        }
        let mut descriptors = descriptors;
        descriptors.sort_by(|a, b| a.path.cmp(&b.path));

        let mut nodes: Vec<Node> = descriptors
            .iter()
            .map(|g| Node::Input(InputSlice::new(Arc::clone(g))))
            .collect();
        let input_ids: Vec<usize> = (0..nodes.len()).collect();

        let primary = config.primary_udim().cloned();
        let mut plan = Plan {
            nodes: Vec::new(),
            dims: HashMap::new(),
            retained: input_ids.clone(),
            primary: primary.as_ref().map(|d| d.name.clone()),
            bounds: ResolvedBounds::default(),
            first_index_value: None,
            last_index_value: None,
        };

        let mut primary_order: Option<Vec<usize>> = None;
        if let Some(dim) = primary.as_ref().filter(|d| d.is_indexed()) {
            plan.bounds = config.resolved_bounds(dim)?;
            primary_order = Some(plan_indexed_dim(
                dim,
                &plan.bounds,
                &mut nodes,
                &input_ids,
                &mut plan.retained,
                &mut plan.first_index_value,
                &mut plan.last_index_value,
            ));
        }

        plan.nodes = nodes;
        for dim in config.udims() {
            let dim_plan = if primary_order.is_some()
                && Some(dim.name.as_str()) == plan.primary.as_deref()
            {
                let ids = primary_order.clone().expect("checked above");
                let (entries, total) = cumulative(&plan.nodes, &ids, &dim.name);
                DimPlan::new(&dim.name, entries, total)
            } else if dim.flatten {
                let entries: Vec<(usize, Range<usize>)> = plan
                    .retained
                    .iter()
                    .map(|&id| (id, 0..plan.nodes[id].size_along(&dim.name)))
                    .collect();
                let output_size = entries.iter().map(|(_, w)| w.end).max().unwrap_or(0);
                DimPlan::new(&dim.name, entries, output_size)
            } else if dim.is_indexed() {
                // A secondary indexed dimension gets each granule's internal
                // sorted view, but keeps the primary's outer order and is not
                // chopped or deduplicated across granules.
                let cadence = dim.cadence();
                for &id in &plan.retained.clone() {
                    let input = plan.nodes[id].as_input().expect("retained are inputs");
                    let projected = input.granule.projections[&dim.name].clone();
                    let view = IndexedView::build(&dim.name, &projected, cadence);
                    plan.nodes[id]
                        .as_input_mut()
                        .expect("retained are inputs")
                        .views
                        .insert(dim.name.clone(), view);
                }
                let (entries, total) = cumulative(&plan.nodes, &plan.retained, &dim.name);
                DimPlan::new(&dim.name, entries, total)
            } else {
                let (entries, total) = cumulative(&plan.nodes, &plan.retained, &dim.name);
                DimPlan::new(&dim.name, entries, total)
            };
            plan.dims.insert(dim.name.clone(), dim_plan);
        }

        Ok(plan)
    }
}

fn cumulative(nodes: &[Node], ids: &[usize], dim: &str) -> (Vec<(usize, Range<usize>)>, usize) {
    let mut offset = 0;
    let mut entries = Vec::with_capacity(ids.len());
    for &id in ids {
        let size = nodes[id].size_along(dim);
        entries.push((id, offset..offset + size));
        offset += size;
    }
    (entries, offset)
}

/// Sort, chop, dedup, and gap-fill the primary dimension. Returns the node
/// visit order (inputs interleaved with fills) and rewrites `retained` to the
/// surviving input ids.
///
#[allow(clippy::too_many_arguments)]
fn plan_indexed_dim(
    dim: &DimensionSpec,
    bounds: &ResolvedBounds,
    nodes: &mut Vec<Node>,
    input_ids: &[usize],
    retained: &mut Vec<usize>,
    first_index_value: &mut Option<f64>,
    last_index_value: &mut Option<f64>,
) -> Vec<usize> {
    let cadence = dim.cadence();

    // Step 1 and 2: per-granule sorted views, ordered by first index value.
    let mut entries: Vec<(usize, IndexedView)> = Vec::new();
    for &id in input_ids {
        let granule = &nodes[id].as_input().expect("inputs").granule;
        let view = IndexedView::build(&dim.name, &granule.projections[&dim.name], cadence);
        if view.is_empty() {
            log::warn!(
                "{}: no valid records along {}, dropping",
                granule.path,
                dim.name
            );
            continue;
        }
        entries.push((id, view));
    }
    entries.sort_by(|a, b| {
        let a = a.1.first_value().expect("nonempty view");
        let b = b.1.first_value().expect("nonempty view");
        a.total_cmp(&b)
    });

    // Step 3: chop to the half-open bound interval.
    let slack = cadence.map(|c| c.bound_slack()).unwrap_or(0.0);
    entries.retain_mut(|(id, view)| {
        view.chop(bounds.min, bounds.max, slack);
        if view.is_empty() {
            let granule = &nodes[*id].as_input().expect("inputs").granule;
            log::info!("granule not in bounds: {}", granule.path);
            false
        } else {
            true
        }
    });

    // Step 4: trim each granule's overlap with its predecessor; ties keep
    // the earlier granule's record.
    if let Some(c) = cadence {
        let mut kept: Vec<(usize, IndexedView)> = Vec::new();
        for (id, mut view) in entries {
            if let Some(prev_last) = kept.last().and_then(|(_, v)| v.last_value()) {
                view.trim_overlap(prev_last, c.overlap_tolerance());
            }
            if view.is_empty() {
                let granule = &nodes[id].as_input().expect("inputs").granule;
                log::info!("granule fully overlapped, dropping: {}", granule.path);
            } else {
                kept.push((id, view));
            }
        }
        entries = kept;
    }

    if entries.is_empty() {
        log::warn!("no granules left along {} after chop and dedup", dim.name);
    }

    *first_index_value = entries.first().and_then(|(_, v)| v.first_value());
    *last_index_value = entries.last().and_then(|(_, v)| v.last_value());

    // Step 5: leading, interior, and trailing fill segments.
    let mut order: Vec<usize> = Vec::new();
    retained.clear();

    let mut push_fill = |nodes: &mut Vec<Node>, order: &mut Vec<usize>, count: usize, start: f64| {
        nodes.push(Node::Fill(FillSegment {
            dim: dim.name.clone(),
            count,
            start: Some(start),
        }));
        order.push(nodes.len() - 1);
    };

    if let (Some(c), Some(min), Some((_, first))) = (cadence, bounds.min, entries.first()) {
        let first = first.first_value().expect("nonempty view");
        let count = ((first - min) * c.hz()).round().max(0.0) as usize;
        if count > 0 {
            push_fill(nodes, &mut order, count, first - count as f64 * c.step());
        }
    }

    let mut prev_last: Option<f64> = None;
    for (id, view) in entries {
        if let (Some(c), Some(prev)) = (cadence, prev_last) {
            let next = view.first_value().expect("nonempty view");
            let missing = c.records_between(prev, next);
            if missing > 0 {
                push_fill(nodes, &mut order, missing, prev + c.step());
            }
        }
        prev_last = view.last_value();
        nodes[id]
            .as_input_mut()
            .expect("inputs")
            .views
            .insert(dim.name.clone(), view);
        order.push(id);
        retained.push(id);
    }

    if let (Some(c), Some(max), Some(last)) = (cadence, bounds.max, prev_last) {
        let count = c.records_between(last, max);
        if count > 0 {
            push_fill(nodes, &mut order, count, last + c.step());
        }
    }

    order
}
