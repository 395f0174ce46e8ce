//! RPC subsystem.
//!
//! # Data Flow
//! ```text
//! Network:     h2 request → server.rs (frame.rs decode) → dispatch.rs
//! In-process:  invoker.rs → client chains → dispatch.rs
//!
//! dispatch.rs: table.rs lookup → server chains (interceptor.rs) → handler
//! ```
//!
//! # Design Decisions
//! - One [`ServiceTable`] and one [`Pipeline`] serve both channels
//! - Messages stay encoded (`Bytes`) through the chain; handlers decode
//! - Per-call state travels in an explicit [`CallContext`]

pub mod context;
pub mod descriptor;
pub mod dispatch;
pub mod frame;
pub mod health;
pub mod interceptor;
pub mod invoker;
pub mod server;
pub mod status;
pub mod table;

pub use context::{CallContext, CallOrigin};
pub use descriptor::{MessageStream, ServiceDesc, ServiceInfo};
pub use dispatch::{Dispatcher, MethodKind};
pub use interceptor::{
    stream_fn, unary_fn, InterceptorSet, Interceptors, Pipeline, StreamInterceptor, StreamNext,
    UnaryInterceptor, UnaryNext,
};
pub use invoker::Invoker;
pub use server::RpcServer;
pub use status::{Code, Status};
pub use table::ServiceTable;
