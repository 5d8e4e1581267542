//! Typed error taxonomy for the control loop.
//!
//! Fieldbus and decision-service failures are caught at the phase boundary by
//! the orchestrator and folded into a cycle outcome; they never escape the
//! cycle handler. Startup failures use `anyhow` in `main` instead.

use thiserror::Error;

/// Fieldbus I/O failures, one variant per contract operation.
#[derive(Debug, Clone, Error)]
pub enum FieldbusError {
    #[error("PLC connection failed: {detail}")]
    Connection { detail: String },

    #[error("read of {addr} failed: {detail}")]
    Read { addr: String, detail: String },

    #[error("write of {addr} failed: {detail}")]
    Write { addr: String, detail: String },
}

/// Remote decision-service failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecisionError {
    #[error("decision request timed out")]
    Timeout,

    #[error("decision service unreachable: {detail}")]
    Unreachable { detail: String },

    #[error("decision service returned status {status}")]
    ServiceError { status: u16 },

    #[error("decision response failed schema validation: {detail}")]
    SchemaError { detail: String },
}
