//! Domain model of the Ocular security scanning operator.
//!
//! Holds the custom resources of the `ocular.crashoverride.run` group together with
//! everything both the manager and the sidecar need to agree on: the parameter
//! schema and its environment variable mapping, the environment contract of stage
//! and search pods, label keys, child names and the phase state machines.

pub mod conditions;
pub mod env;
pub mod labels;
pub mod naming;
pub mod params;
pub mod resources;
pub mod state;

mod error;
pub use error::Error;

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
