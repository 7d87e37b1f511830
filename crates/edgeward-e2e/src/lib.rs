//! End-to-end test utilities for the edgeward orchestrator
//!
//! This crate provides test harnesses for exercising the orchestrator against the
//! simulated backend, a scripted client, and a mock Caddy admin API, without a real proxy.

pub mod failing_store;
pub mod harness;
pub mod mock_control_plane;
pub mod scripted_proxy;

pub use failing_store::FailingStore;
pub use harness::{fast_settings, fast_simulation, init_test, operator_ip, TestEnv, PROXY_HOST_IP};
pub use mock_control_plane::{MockControlPlane, RecordedRequest};
pub use scripted_proxy::{ProxyCall, ScriptedFailure, ScriptedProxyClient};
