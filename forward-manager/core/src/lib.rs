#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod session;
pub mod store;

pub use self::cache::Cache;
pub use self::session::{
    PortForwardRequest, Session, SessionStatus, SessionSummary, StopOrDeleteRequest, StopSignal,
    ValidationError,
};
pub use self::store::{scoped_cluster_name, NotFound, SessionStore};
