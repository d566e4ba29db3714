pub mod bulk;
pub mod config;
pub mod query;

pub use bulk::{BulkOperationClient, ByteStream, OperationStatus, ShopifyBulkClient};
