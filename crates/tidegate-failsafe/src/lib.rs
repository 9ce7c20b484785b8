//! tidegate-failsafe — the circuit breaker in front of every scaling action.
//!
//! ```text
//! failsafe_mode  failure_count >= threshold  →  result
//! ─────────────  ─────────────────────────────  ──────────────────────────
//! true           (any)                          blocked, no side effects
//! false          yes                            trip: persist, notify, blocked
//! false          no                             permitted, no side effects
//! ```
//!
//! A tripped breaker only clears through `Failsafe::set_mode(.., false, ..)`,
//! which also resets the failure count. There is no time-based recovery.

pub mod breaker;

pub use breaker::{Failsafe, GateDecision};
