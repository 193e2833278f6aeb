use thiserror::Error;

/// Error taxonomy for the request-handling pipeline.
///
/// `Capture` and `Resolution` are absorbed at the point they occur (logged,
/// the offending capture or resource skipped); the remaining variants are
/// attached to the exchange's failure slot and routed to the status-code
/// error handler.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    /// A body matcher threw during evaluation. The resource is skipped.
    #[error("matcher evaluation failed for resource {resource_id}: {reason}")]
    Resolution { resource_id: String, reason: String },

    #[error("script {script} failed: {cause}")]
    Script { script: String, cause: anyhow::Error },

    /// A capture source could not be evaluated. The single capture is skipped.
    #[error("capture {name} failed: {reason}")]
    Capture { name: String, reason: String },

    #[error("failed to render response: {0}")]
    Render(String),

    #[error("transmission failed: {0}")]
    Transmission(String),

    #[error("no route matched")]
    RouteNotFound,
}

impl EngineError {
    /// Status code emitted when this error reaches the client.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::RouteNotFound => 404,
            _ => 500,
        }
    }
}
