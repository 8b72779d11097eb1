//! Shale - content-addressed object storage
//!
//! A log-structured CAS engine and its cluster front-end:
//! - objects named by the SHA-1 of their bytes
//! - append-only data files with an append-only index log
//! - consistent-hash replication across failure domains
//! - conservative mark-and-sweep garbage collection

pub mod aio;
pub mod aws;
pub mod balancer;
pub mod client;
pub mod config;
pub mod error;
pub mod index;
pub mod key;
pub mod sharding;
pub mod sink;
pub mod store;
pub mod wire;

pub use balancer::Balancer;
pub use client::{CasClient, DEFAULT_MAX_OBJECT_IN_KEY_SIZE, DEFAULT_SERVER_ADDR, SERVER_ENV_VAR};
pub use config::{BackendConfig, BalancerConfig};
pub use error::{Result, ShaleError};
pub use index::{DATA_FILE_COUNT, INDEX_ENTRY_SIZE, IndexEntry, IndexSet};
pub use key::{ObjectKey, decode_inline_key, inline_key, is_inline_key};
pub use sharding::{Backend, ShardingInfo};
pub use sink::{ByteSink, CollectSink, WriterSink};
pub use store::{Capacity, ListMode, PutOutcome, StoreEngine, StoreOptions};
