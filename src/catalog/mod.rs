//! Capability catalog: the merged, qualified view of every backend's tools.

pub mod aggregator;
pub mod capability;
pub mod snapshot;

pub use aggregator::CatalogAggregator;
pub use capability::{qualify, split_qualified, Capability, QUALIFIED_NAME_SEPARATOR};
pub use snapshot::CatalogSnapshot;
