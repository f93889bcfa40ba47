//! corral — a supervised subprocess worker pool with framed RPC dispatch.
//!
//! A [`Pool`] spawns a bounded set of worker processes, ships named jobs to
//! them over a length-prefixed key/value wire protocol, and returns a
//! future per job. Workers are recycled after a configured number of
//! calls, pruned when idle, force-terminated on timeout, and replaced when
//! they crash.
//!
//! ```no_run
//! use corral::{CallOptions, FieldValues, Pool, PoolConfig, builtin};
//!
//! # async fn demo() -> corral::Result<()> {
//! let mut config = PoolConfig::new("/usr/local/bin/corral-worker");
//! config.min = 2;
//! config.max = 8;
//!
//! let pool = Pool::new(config);
//! pool.start().await?;
//!
//! let args = FieldValues::new().with("text", "hello");
//! let reply = pool.submit(&builtin::ECHO, args, CallOptions::default()).await?;
//! assert_eq!(reply.get_str("text"), Some("hello"));
//!
//! pool.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod launcher;
pub mod pool;
pub mod protocol;
pub mod worker;

pub use config::{LaunchSpec, PoolConfig, Signal};
pub use connector::{CompletionHandle, ExitOutcome, WorkerClient};
pub use error::{CorralError, Result};
pub use pool::{Call, CallOptions, Pool, PoolStatus};
pub use protocol::builtin;
pub use protocol::{Command, Field, FieldKind, FieldValue, FieldValues};
