// src/runtime/mod.rs
//! Worker-side runtime: configuration, boot timing, the three serving
//! surfaces, and the lifecycle controller that sequences them.

pub mod boot_metrics;
pub mod http_surface;
pub mod lifecycle;
pub mod rpc_surface;
pub mod runtime_config;
pub mod ui_surface;

pub use boot_metrics::BootMetrics;
pub use http_surface::HttpSurface;
pub use lifecycle::{boot_budget_verdict, BootVerdict, LifecycleState, RuntimeLifecycleController};
pub use rpc_surface::{RpcRequest, RpcResponse, RpcSurface};
pub use runtime_config::RuntimeConfig;
pub use ui_surface::UiSurface;
