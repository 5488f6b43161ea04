//! Background Tasks Module
//!
//! Contains background tasks that run periodically during server operation.
//! The cluster health-check loop lives with the cluster manager.

mod cleanup;

pub use cleanup::{
    CleanupReport, CleanupScheduler, SchedulerStats, EPHEMERAL_PATTERNS,
    EVICTION_TRIGGER_PERCENT,
};
