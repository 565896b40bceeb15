//! optrap - transparent interception of operation-table calls
//!
//! This library lets independent modules attach pre/post handlers to the
//! operations (function pointer tables) of objects they do not own, without
//! changing the objects' type or the calling code. Operation tables are
//! either referenced through a pointer field (indirect) or embedded in the
//! object (direct); prototype tables can be watched through factories so
//! objects created from them are picked up automatically.

pub mod addr;
pub mod cli;
pub mod collision;
pub mod config;
pub mod engine;
pub mod error;
pub mod factory;
pub mod instrumentor;
pub mod interceptor;
pub mod keyed_store;
pub mod payload;
pub(crate) mod payload_container;
pub mod policy;
pub mod schema;
pub mod selftest;

pub use addr::Addr;
pub use config::{EngineConfig, PatchMode};
pub use engine::Engine;
pub use error::{InterceptError, Result};
pub use factory::FactoryInterceptor;
pub use instrumentor::{ForgetOutcome, WatchOutcome};
pub use interceptor::{IntermediateInfo, Interceptor};
pub use payload::{Handler, ModuleHandle, ModuleRef, Payload};
pub use policy::PatchPolicy;
pub use schema::{IntermediateOp, OpsSchema};
