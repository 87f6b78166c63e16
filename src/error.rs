use thiserror::Error;

/// Errors reported by the maps in this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The operation cannot give a meaningful answer on this map.
    ///
    /// Returned by membership queries on maps whose values can be reclaimed
    /// at any moment: the answer may already be wrong when it is returned.
    #[error("{operation} is pointless on a map whose values may be reclaimed concurrently")]
    PointlessOperation {
        /// Name of the rejected operation
        operation: &'static str,
    },

    /// A construction parameter is out of range.
    #[error("invalid map configuration: {reason}")]
    InvalidConfig {
        /// What was wrong with the configuration
        reason: &'static str,
    },
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_problem() {
        let e = Error::PointlessOperation {
            operation: "contains_key",
        };
        assert!(e.to_string().starts_with("contains_key is pointless"));

        let e = Error::InvalidConfig {
            reason: "load factor must be positive",
        };
        assert_eq!(
            e.to_string(),
            "invalid map configuration: load factor must be positive"
        );
    }
}
