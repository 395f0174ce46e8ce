//! Unified service runtime.
//!
//! One listener, demultiplexed into RPC and HTTP traffic, served with a
//! single interceptor pipeline that also backs an in-process call channel,
//! under a Created → Running → Stopping → Closed lifecycle.

pub mod config;
pub mod demux;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod registry;
pub mod resilience;
pub mod rpc;
pub mod runtime;
pub mod server;

pub use config::RuntimeConfig;
pub use error::{BoxError, Error, HookPhase, ServeError, ShutdownErrors};
pub use lifecycle::{RuntimeState, Signals, Termination};
pub use registry::{MemoryRegistry, NoopRegistry, Registration, Registry};
pub use rpc::{CallContext, CallOrigin, Code, Interceptors, Invoker, ServiceDesc, ServiceInfo, Status};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeOptions};
