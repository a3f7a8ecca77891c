use thiserror::Error;

/// One independent write of the ingestion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistStep {
    Delivery,
    Payment,
    Order,
    /// Item at this index of the order's item list.
    Item(usize),
}

impl std::fmt::Display for PersistStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delivery => f.write_str("delivery"),
            Self::Payment => f.write_str("payment"),
            Self::Order => f.write_str("order"),
            Self::Item(index) => write!(f, "item[{index}]"),
        }
    }
}

/// Failures of the ingestion and query paths.
///
/// Adapter errors are flattened into `reason` strings (with their context
/// chain) so the variants stay comparable in tests.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("malformed order payload: {reason}")]
    Decode { reason: String },

    #[error("order_uid is empty")]
    MissingOrderUid,

    #[error("persisting {step} failed: {reason}")]
    Persist { step: PersistStep, reason: String },

    #[error("loading order {order_uid} failed: {reason}")]
    Load { order_uid: String, reason: String },

    #[error("order {order_uid} not found")]
    NotFound { order_uid: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_display() {
        assert_eq!(PersistStep::Delivery.to_string(), "delivery");
        assert_eq!(PersistStep::Item(2).to_string(), "item[2]");
    }

    #[test]
    fn test_error_messages() {
        let err = ServiceError::Persist {
            step: PersistStep::Order,
            reason: "UNIQUE constraint failed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "persisting order failed: UNIQUE constraint failed"
        );
        assert_eq!(
            ServiceError::NotFound {
                order_uid: "x".to_string()
            }
            .to_string(),
            "order x not found"
        );
    }
}
