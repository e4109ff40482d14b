pub mod backend;
pub mod error;
pub mod job_state;
pub mod memory;
pub mod redis_store;
pub mod traits;

pub use backend::connect;
pub use error::StoreError;
pub use job_state::{JobState, Recorded};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use traits::{CountedInsert, GuardedCounter, KvStore};
