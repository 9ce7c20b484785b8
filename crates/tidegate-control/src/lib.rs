//! tidegate-control — the scaling control loop.
//!
//! One cycle per worker pool:
//!
//! ```text
//! read state (init if missing)
//!   └─ stale and pause_on_stale_state? ── skip
//! failsafe gate ── blocked? ── stop
//! planner.plan(pool)
//!   ├─ ScaleOut(n)   → planner.scale_out
//!   └─ ScaleIn(ips)  → NodeLifecycle, one node at a time
//! failure → failure_count += 1 (conditional write, re-read on conflict)
//! success → failure_count reset to 0
//! ```
//!
//! The next cycle's gate check sees the updated count and trips the
//! breaker once it reaches the pool's retry threshold.

pub mod controller;

pub use controller::{CycleOutcome, ScaleDecision, ScalingController, ScalingPlanner};
