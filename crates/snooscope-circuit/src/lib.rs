//! Circuit breaker for snooscope's outbound call paths.
//!
//! A breaker watches consecutive failures against one remote endpoint and
//! short-circuits callers while that endpoint is misbehaving:
//!
//! - **Closed**: calls pass; consecutive failures are counted.
//! - **Open**: calls fail fast with `CircuitOpen` and cost nothing — in
//!   particular they consume no admission slot.
//! - **Half-open**: after the cool-down one probe at a time is let
//!   through; enough consecutive successes re-close the circuit, any
//!   failure re-opens it.
//!
//! The breaker decorates plain async calls:
//!
//! ```rust
//! use snooscope_circuit::CircuitBreakerConfig;
//! use snooscope_core::ScrapeError;
//!
//! # async fn example() -> Result<(), ScrapeError> {
//! let breaker = CircuitBreakerConfig::builder()
//!     .failure_threshold(5)
//!     .cool_down(std::time::Duration::from_secs(30))
//!     .name("forum")
//!     .build();
//!
//! let body = breaker
//!     .call(async {
//!         // one outbound attempt
//!         Ok::<_, ScrapeError>("response")
//!     })
//!     .await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

mod breaker;
mod config;
mod events;

pub use breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use config::{CircuitBreakerConfig, CircuitBreakerConfigBuilder};
pub use events::CircuitEvent;
