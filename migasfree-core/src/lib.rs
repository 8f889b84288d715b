//! Shared primitives for the migasfree-swarm control plane: typed config,
//! the common error taxonomy, the Redis-backed directory/metrics/queue
//! client, and the read-only Postgres client.

pub mod config;
pub mod error;
pub mod postgres;
pub mod redis;

pub use config::Config;
pub use error::CoreError;
pub use postgres::PostgresClient;
pub use redis::{AgentPage, AgentRecord, NodeStat, RedisDirectory, RelayRecord, SaturationHistoryEntry, SaturationSnapshot};
