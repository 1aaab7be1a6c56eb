//! # adaptive-limiter
//!
//! A BBR-inspired adaptive admission control limiter for HTTP services.
//!
//! Instead of a fixed requests-per-second ceiling, the limiter derives a
//! sustainable concurrency bound from recently observed throughput and
//! latency (a Little's-law estimate), and only sheds load once the host
//! CPU is also running hot. This keeps services healthy under load spikes
//! without throttling traffic the host could comfortably serve.
//!
//! ## Architecture
//!
//! - `error`: crate-wide error type and HTTP translation
//! - `window`: rolling time-bucket aggregator backing both throughput and
//!   latency statistics
//! - `cpu`: process-wide CPU load sampling and EMA smoothing
//! - `bbr`: the admission decision engine (`Limiter`, `Completion`)
//! - `middleware`: axum integration
//!
//! ## Example
//!
//! ```no_run
//! use adaptive_limiter::Limiter;
//!
//! # async fn run() -> Result<(), adaptive_limiter::LimiterError> {
//! let limiter = Limiter::new()?;
//! let completion = limiter.allow()?;
//! // ... serve the request ...
//! drop(completion);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Crate-wide error type and HTTP translation.
pub mod error;

/// Rolling time-bucket aggregator.
pub mod window;

/// Process-wide CPU load estimation.
pub mod cpu;

/// The BBR-inspired admission decision engine.
pub mod bbr;

/// axum middleware adapter.
pub mod middleware;

pub use bbr::{Completion, Limiter, LimiterBuilder, LimiterOptions};
pub use cpu::{CpuSampler, CpuSnapshot, CpuSource};
pub use error::{LimiterError, LimiterResult};
pub use window::{Clock, RollingWindow, SystemClock};

/// Crate version, as declared in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, as declared in `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
