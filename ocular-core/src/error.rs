use thiserror::Error;

use crate::params::ParameterError;

/// Errors raised by the domain model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A status was asked to move along an edge its transition table does not have.
    #[error("illegal {kind} transition from {from} to {to}")]
    IllegalTransition {
        /// Kind of the object whose status moved.
        kind: &'static str,
        /// Phase before the transition.
        from: String,
        /// Requested phase.
        to: String,
    },

    /// Parameter settings do not match the declared schema.
    #[error(transparent)]
    Parameters(#[from] ParameterError),
}
