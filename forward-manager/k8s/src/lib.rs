#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod context;
pub mod forward;
pub mod monitor;
pub mod preflight;

pub use self::context::{ClusterContext, ContextError, ContextStore};
pub use self::forward::{ForwardError, InitError, OutputBuffer, PortForwarder};
pub use self::monitor::{monitor_pod, POD_CHECK_INTERVAL};
pub use self::preflight::{check_port_forward_access, PermissionError};
