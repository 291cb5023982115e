//! Client connection core for the brook native protocol.
//!
//! The heart of this crate is [`Context`]: a synchronous, event-fed state
//! machine that owns the handshake sequencing, tag-based request/reply
//! correlation, the operation and stream registries, and the drain
//! synchronization primitive. It performs no I/O itself; [`driver::run`]
//! pumps a real Unix or TCP socket through it on a tokio runtime, and tests
//! feed it framed bytes directly.
//!
//! ```no_run
//! use brook_client::{Context, ContextState, driver};
//!
//! # async fn demo() -> brook_client::ClientResult<()> {
//! let mut ctx = Context::new("example");
//! ctx.set_state_callback(|c| {
//!     if c.state() == ContextState::Ready {
//!         c.disconnect();
//!     }
//! });
//! ctx.connect(Some("/run/brook/native"))?;
//! driver::run(&mut ctx).await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod context;
pub mod cookie;
pub mod driver;
pub mod error;

mod connector;
mod dispatch;
mod operation;
mod stream;
mod transport;

pub use config::ClientConfig;
pub use connector::ServerAddress;
pub use context::{Context, ContextState};
pub use error::{ClientError, ClientResult};
pub use operation::OperationHandle;
pub use stream::{StreamDirection, StreamId, StreamState};
