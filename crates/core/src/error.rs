use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid status transition for phase {phase} from {from} to {to}")]
    InvalidStatusTransition {
        phase: String,
        from: String,
        to: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),
}
