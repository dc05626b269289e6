pub mod dispatch;
pub mod pipeline;
pub mod runtime;
pub mod server;

pub use dispatch::Dispatcher;
pub use pipeline::{ControlMsg, ControlOp, Pipeline};
pub use server::{client_request, run_daemon};
