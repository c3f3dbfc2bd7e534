// src/supervisor/mod.rs
//! Fleet supervision: worker process lifecycle, ports, logs, limits,
//! and the operator-facing control API.

pub mod api;
pub mod log_aggregator;
pub mod port_allocator;
pub mod process_manager;
pub mod resource_manager;

pub use api::SupervisorApi;
pub use log_aggregator::{LogAggregator, LogEntry, LogLevel};
pub use port_allocator::PortAllocator;
pub use process_manager::{
    ProcessManager, ProcessManagerConfig, ProcessRecord, ProcessSnapshot, ProcessState,
    RestartPolicy, RestartPolicyKind, SpawnSpec,
};
pub use resource_manager::{ResourceLimits, ResourceManager, ResourceUsage};
