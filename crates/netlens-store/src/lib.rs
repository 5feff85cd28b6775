pub mod filter;
pub mod store;

pub use filter::RequestFilter;
pub use store::{RequestStore, StoreConfig};
