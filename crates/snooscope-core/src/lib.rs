//! Shared vocabulary for the snooscope scraping runtime.
//!
//! This crate holds the pieces every other snooscope crate speaks in:
//!
//! - The domain model: [`Post`], [`User`], [`Session`] and friends
//! - The [`ScrapeError`] taxonomy that classifies every failure as
//!   transient, permanent, skipped, cancelled, or fatal
//! - The [`EventBus`], a non-blocking fan-out of lifecycle and progress
//!   events to any number of live subscribers
//!
//! ## Error taxonomy
//!
//! Components never invent their own retry semantics; they classify into
//! [`ScrapeError`] and let the caller decide:
//!
//! ```rust
//! use snooscope_core::ScrapeError;
//!
//! fn handle(err: ScrapeError) {
//!     if err.is_transient() {
//!         // back off and retry
//!     } else if err.is_permanent() {
//!         // record and move on to the next unit of work
//!     }
//! }
//! ```
//!
//! ## Event fan-out
//!
//! Publishing never blocks and never fails: a subscriber that stops
//! draining its queue loses its own frames and nobody else's.
//!
//! ```rust
//! use snooscope_core::bus::{EventBus, EventKind};
//!
//! # async fn example() {
//! let bus = EventBus::new(64);
//! let mut sub = bus.subscribe(Some(vec![EventKind::Progress]));
//! // publishers call bus.publish(event) from anywhere
//! while let Some(event) = sub.recv().await {
//!     println!("{}", serde_json::to_string(&event).unwrap());
//! }
//! # }
//! ```

pub mod bus;
pub mod error;
pub mod events;
pub mod model;
pub mod session;

pub use bus::{Event, EventBus, EventKind, Subscription};
pub use error::ScrapeError;
pub use model::{ContentType, LinkPreview, Post, Sort, TimeFilter, User};
pub use session::{
    MetricSample, PlanEntry, Session, SessionOptions, SessionStatus, SessionView,
};
