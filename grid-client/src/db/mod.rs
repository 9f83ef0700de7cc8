pub mod pg_store;
pub mod reading_queries;
pub mod schema;

pub use pg_store::PgStore;
pub use schema::{create_schema, TimescaleOptions};
