mod retry;
mod rocksdb;

pub use self::rocksdb::{CollectionOptions, RocksDbStore};
pub use retry::{with_retry, RetryConfig};
