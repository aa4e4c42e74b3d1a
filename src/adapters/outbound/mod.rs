mod cache_store;
mod memory_store;
mod redis_store;
mod session_store;

pub use cache_store::CacheStore;
pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use session_store::{SessionStore, DEFAULT_SESSION_TTL};
