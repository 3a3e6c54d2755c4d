//! Core library for the message-aware gRPC reverse proxy.
//!
//! The proxy binary wires these pieces together: [`config`] loads the YAML
//! configuration, [`descriptor`]/[`reflection`] build the schema the proxy
//! needs to decode envelope fields, [`route`] decides what a given method
//! does with its frames, [`envelope`] does the per-frame decode/inspect/sign
//! work, [`crypto`] backs the signing step, and [`director`] drives the
//! actual bidirectional byte pump between client and backend.

pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod descriptor;
pub mod director;
pub mod envelope;
pub mod error;
pub mod metadata;
pub mod reflection;
pub mod route;

pub use config::Config;
pub use crypto::{CryptoEngineKind, CryptoMaterials};
pub use descriptor::DescriptorRegistry;
pub use director::StreamDirector;
pub use error::{ProxyError, Result};
pub use route::RouteTable;
