pub mod db;
pub mod domain;
pub mod store;

pub use domain::Reading;
pub use store::{AggregateQueries, ReadingStore, StoreError};
