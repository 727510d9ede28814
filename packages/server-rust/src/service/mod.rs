//! Service-entry dispatch.
//!
//! 1. **Entries** (`entry`, `route`): routable units with their handler and governance
//! 2. **Registry** (`registry`): atomically swapped route table
//! 3. **Binding** (`binder`): HTTP / RPC arguments -> ordered, coerced values
//! 4. **Pipeline** (`pipeline`, `protocol`): resolve, authorize, bind, execute, render
//! 5. **Middleware** (`middleware`): Tower layers (outcome classes, admission, timeout)
//! 6. **Background workers** (`worker`): periodic tasks such as TCC recovery

pub mod binder;
pub mod config;
pub mod context;
pub mod entry;
pub mod handler;
pub mod hooks;
pub mod middleware;
pub mod operation;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod route;
pub mod worker;

pub use binder::{
    bind_http, bind_rpc, build_http_request, BindingError, BoundArguments, ComplexType, ParameterFrom,
    ParameterType, RpcParameter,
};
pub use config::ServerConfig;
pub use context::{CallState, FinishedCall, ServerCallContext};
pub use entry::{DescriptorError, GovernanceOptions, HttpMethod, ServiceEntry, ServiceProtocol, TccMethods};
pub use handler::{handler_fn, ServiceHandler};
pub use hooks::{
    Authorizer, DiagnosticListener, GovernanceAuthorizer, HandleKey, HandleMonitor, HandleStats,
    MetricsHandleMonitor, PipelineHooks, TracingDiagnosticListener,
};
pub use operation::{CallError, Invocation};
pub use pipeline::{CallRunner, DispatchOutcome, DispatchPipeline, InboundMeta};
pub use protocol::{HttpMessageHandler, HttpRequest, HttpResponse, MessageReceivedHandler, RpcMessageHandler};
pub use registry::{RegistryError, ResolvedEntry, RouteTable, ServiceEntryRegistry};
pub use route::RouteTemplate;
pub use worker::{BackgroundRunnable, BackgroundWorker, WorkerError};
