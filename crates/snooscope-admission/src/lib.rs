//! Request pacing for outbound calls.
//!
//! An admission token spaces calls to one remote domain at a configured
//! rate and adapts that rate to the error mix it observes. Two variants
//! share one contract:
//!
//! - [`Pacer`]: the last-grant timestamp lives behind an in-process mutex.
//! - [`SharedPacer`]: the last-grant timestamp lives in a `pacing` table
//!   inside the shared store file, so several worker processes observe a
//!   single pacing line.
//!
//! Holders call `acquire()` then make exactly one attempt, reporting the
//! result via `record_outcome`. Dropping an in-flight `acquire()` future
//! (caller cancelled) never consumes the slot.
//!
//! ```rust
//! use snooscope_admission::{Outcome, Pacer, PacerConfig};
//!
//! # async fn example() {
//! let pacer = PacerConfig::builder()
//!     .rate(2.0)
//!     .max_rate(10.0)
//!     .name("forum")
//!     .build_local();
//!
//! let waited = pacer.acquire().await;
//! // ... one request ...
//! pacer.record_outcome(Outcome::Ok);
//! # let _ = waited;
//! # }
//! ```

mod adaptive;
mod config;
mod events;
mod pacer;
mod shared;

pub use adaptive::AdaptiveRate;
pub use config::{PacerConfig, PacerConfigBuilder};
pub use events::AdmissionEvent;
pub use pacer::{AdmissionToken, Outcome, Pacer};
pub use shared::SharedPacer;
