#[allow(clippy::module_inception)]
mod sequence;
pub(crate) use sequence::Sequence;

mod sort_key;
pub(crate) use sort_key::SortKey;

mod priority_queue;
pub(crate) use priority_queue::PriorityQueue;
