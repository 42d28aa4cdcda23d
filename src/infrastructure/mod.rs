//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Storage implementations (contact store, registry, history)
//! - Protocol implementations (SIP)
//! - Timers and metrics

pub mod metrics;
pub mod persistence;
pub mod protocols;
pub mod refresher;
