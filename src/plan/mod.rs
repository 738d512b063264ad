pub mod node;
pub mod planner;

pub use node::{FillSegment, IndexedView, InputSlice, Node, Segment};
pub use planner::{DimPlan, Plan};
