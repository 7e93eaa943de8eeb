use std::fmt;

/// Lifecycle of a single `handle` call.
///
/// `Pending -> Locked -> (FraudRejected | Persisted) -> Completed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    Locked,
    FraudRejected,
    Persisted,
    Completed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Pending => "pending",
            Stage::Locked => "locked",
            Stage::FraudRejected => "fraud_rejected",
            Stage::Persisted => "persisted",
            Stage::Completed => "completed",
        };
        f.write_str(name)
    }
}
