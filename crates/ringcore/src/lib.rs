//! ringcore: bounded lock-free ring buffers for the taskmill runtime.
//!
//! Two queue disciplines, both power-of-two capacity, both copying elements
//! by value:
//!
//! - [`SpscRing`]: single-producer single-consumer, two cache-line-isolated
//!   atomic indices. The cheapest possible handoff when the endpoint
//!   discipline can be guaranteed by the caller.
//! - [`MpmcRing`]: multi-producer multi-consumer, per-slot sequence numbers
//!   (Vyukov bounded queue). Safe under arbitrary concurrency.
//!
//! [`IdleWait`] paces a consumer between an empty poll and a real park:
//! a short busy-wait window for work that is about to land, a few scheduler
//! yields after that, then a signal to park.
//!
//! # Example
//!
//! ```
//! use ringcore::MpmcRing;
//!
//! let ring = MpmcRing::<u64>::with_capacity(8);
//! assert!(ring.push(42));
//! assert_eq!(ring.pop(), Some(42));
//! assert_eq!(ring.pop(), None);
//! ```

mod idle;
mod mpmc;
mod spsc;

pub use idle::IdleWait;
pub use mpmc::MpmcRing;
pub use spsc::SpscRing;
