//! # Lessor
//!
//! Bounded lifecycle management for expensive, reusable resources.
//!
//! - [`Pool`] leases resources (connections, channels, subprocesses) out
//!   exclusively, reusing idle ones, capping how many are open and retiring
//!   them after a maximum lifetime. Acquires past the cap wait in line.
//! - [`Workshop`] shares long-lived workers between concurrent jobs, always
//!   assigning work to the least-loaded one. Hiring never waits.
//! - [`Registry`] maps names to pools or workshops with lock-free reads.
//!
//! ```no_run
//! use lessor::{Pool, PoolConfig, Resource};
//!
//! struct Conn;
//! impl Resource for Conn {}
//!
//! # async fn demo() -> lessor::Result<()> {
//! let pool = Pool::with_config(
//!     "upstream",
//!     || async { Ok::<_, std::io::Error>(Conn) },
//!     PoolConfig { max_open: 8, ..Default::default() },
//! )?;
//! let conn = pool.get().await?;
//! drop(conn); // back to the pool
//! pool.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod dependency;
pub mod error;
pub mod pool;
pub mod registry;
pub mod resource;
pub mod workshop;

pub use context::Context;
pub use dependency::{DependencyTracker, Removal};
pub use error::{BoxError, Error, Result};
pub use pool::{AvatarId, Lease, Pool, PoolConfig, PoolStats};
pub use registry::{Closeable, Pools, Registry, Workshops};
pub use resource::{Factory, Resource};
pub use workshop::{Hired, Worker, WorkerId, Workshop, WorkshopConfig, WorkshopStats};
