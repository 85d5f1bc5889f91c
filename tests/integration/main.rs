//! sdncore integration test harness.
//!
//! Every test starts its own control plane on a loopback port and drives it
//! with scripted fake switches speaking the OpenFlow 1.3 subset over real
//! TCP. No privileges or external switches are needed:
//!
//!   cargo test --test integration
//!
//! Each test owns its controller and shuts it down before returning.

mod admission;
mod lifecycle;

pub use infra::*;
