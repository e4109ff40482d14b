pub mod backend;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod redis_queue;
pub mod task;

pub use backend::connect;
pub use consumer::{QueueHealth, TaskQueue};
pub use error::QueueError;
pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;
pub use task::FetchTask;
