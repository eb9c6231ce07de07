//! kiln-lib: a content-addressed build engine.
//!
//! A build graph is assembled with the [`graph`] builder, marshaled into a
//! [`definition::Definition`], solved into filesystem snapshots by the
//! [`solve::Solver`] and delivered by [`export`]ers. [`session::Engine`] ties
//! the stages together:
//! - `graph`: immutable states and exec builders
//! - `definition`: the flattened, validated, wire-encodable graph
//! - `solve`: cached, parallel execution of definition nodes
//! - `image`: local OCI-style image store
//! - `export`: local directory and image exporters
//! - `metadata`: the per-build key/value record

pub mod cancel;
pub mod consts;
pub mod definition;
pub mod export;
pub mod gc;
pub mod graph;
pub mod image;
pub mod metadata;
pub mod platform;
pub mod progress;
pub mod session;
pub mod solve;
pub mod store_lock;
pub mod util;
