use thiserror::Error;

/// Faults reported by the sensor collaborator. All of them are transient.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("sensor did not answer within the read timeout")]
    Timeout,
    #[error("sensor frame checksum mismatch")]
    ChecksumMismatch,
    #[error("sensor bus error: {0}")]
    Bus(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActuatorError {
    #[error("failed to drive output pin: {0}")]
    Pin(String),
}

/// A deferred job the queue refused. The job travels back to the submitter,
/// which owns it again and must release it.
#[derive(Error)]
pub enum SubmitError<J> {
    #[error("deferred work queue is full")]
    Full(J),
    #[error("deferred work queue has no consumer")]
    Disconnected(J),
}

impl<J> SubmitError<J> {
    pub fn into_job(self) -> J {
        match self {
            Self::Full(job) | Self::Disconnected(job) => job,
        }
    }
}

impl<J> std::fmt::Debug for SubmitError<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Disconnected(_) => f.write_str("Disconnected(..)"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection closed before the deferred response was written")]
    Closed,
    #[error("socket send failed: {0}")]
    Send(String),
}
