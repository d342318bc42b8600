//! Long-lived background tasks.

pub mod broadcast_loop;
pub mod dispatch_loop;
pub mod monitor_loop;
pub mod telemetry_loop;
