//! Errors raised while validating a job, before any probe is sent.
//!
//! Connectivity failures never show up here: a refused, timed out or
//! unreachable probe is recorded as a closed result instead.
use thiserror::Error;

/// A scan or discovery job that cannot be run as specified.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidSpec {
    /// The network block could not be parsed as CIDR notation.
    #[error("invalid CIDR block {input:?}: {reason}")]
    Cidr {
        /// Text that was handed to the parser.
        input: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// A worker pool needs at least one worker.
    #[error("concurrency bound must be at least 1")]
    ZeroConcurrency,

    /// A zero timeout would close every unit without trying it.
    #[error("{0} timeout must be greater than zero")]
    ZeroTimeout(&'static str),

    /// The target is neither an address, a CIDR block nor a resolvable name.
    #[error("host {0:?} could not be resolved")]
    UnresolvableHost(String),

    /// Discovery was configured without any port to try.
    #[error("{0} port list is empty")]
    EmptyPortList(&'static str),
}

/// Result type used by job validation.
pub type Result<T> = std::result::Result<T, InvalidSpec>;

#[cfg(test)]
mod tests {
    use super::InvalidSpec;

    #[test]
    fn messages_name_the_offending_input() {
        let err = InvalidSpec::Cidr {
            input: "10.0.0.0/40".to_owned(),
            reason: "invalid length".to_owned(),
        };
        assert!(err.to_string().contains("\"10.0.0.0/40\""));
        assert_eq!(
            InvalidSpec::ZeroTimeout("probe").to_string(),
            "probe timeout must be greater than zero"
        );
    }
}
