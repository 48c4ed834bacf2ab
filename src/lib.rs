//! Asynchronous Redis client core.
//!
//! Two subsystems make up the crate: an incremental, zero-copy RESP2/RESP3
//! codec ([`decode`], [`encode`], [`chain`]) and a connection runtime that
//! drives each TCP socket full-duplex through a pair of byte pipes
//! ([`pipe`], [`connection`]), multiplexing concurrent callers over a
//! bounded, named [`pool`].
//!
//! ```no_run
//! use std::time::Duration;
//! use redis_conduit::{PoolRegistry, RedisOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> redis_conduit::Result<()> {
//! let registry = PoolRegistry::new();
//! registry.add("cache", RedisOptions::from_connection_string("localhost:6379")?);
//!
//! let cancel = CancellationToken::new();
//! let mut conn = registry
//!     .rent("cache", Duration::from_secs(5), &cancel)
//!     .await?;
//! let reply = conn.issue(&["PING"], &cancel).await?;
//! println!("{reply:?}");
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod config;
pub mod connection;
pub mod decode;
pub mod encode;
pub mod error;
pub mod pipe;
pub mod pool;
pub mod reply;

pub use config::{ConfigError, Endpoint, Host, RedisOptions, RespVersion};
pub use connection::{Connection, ConnectionStatus};
pub use decode::{RespReader, TokenKind};
pub use encode::{ByteSink, RespWriter};
pub use error::{EncodeError, Error, ProtocolError, ProtocolErrorKind, Result};
pub use pool::{ConnectionPool, PoolRegistry, PooledConnection};
pub use reply::Reply;
