//! Built-in filters.

mod clip;
mod distributor;
mod lock;
mod tee;

pub use clip::ClipFilter;
pub use distributor::DistributorFilter;
pub use lock::LockFilter;
pub use tee::TeeFilter;
