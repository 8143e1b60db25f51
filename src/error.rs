/// Typed error classes for the execution core
///
/// Storage and wiring code propagates `anyhow::Error`; the enums here name the
/// failures that the engine records on runs, nodes and jobs.

use thiserror::Error;

/// Failure while tokenizing, parsing or evaluating a conditional expression
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("unexpected character '{found}' at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },

    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),

    #[error("unterminated template expression starting at offset {0}")]
    UnterminatedTemplate(usize),

    #[error("unexpected token {found}, expected {expected}")]
    UnexpectedToken { found: String, expected: String },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("expression nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("empty expression")]
    Empty,
}

/// A single finding reported by graph validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("no trigger node found")]
    MissingTrigger,

    #[error("multiple trigger nodes found: {0:?}")]
    MultipleTriggers(Vec<String>),

    #[error("node '{0}' is not connected to any edge")]
    OrphanNode(String),

    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },
}

/// Run-level failure classes recorded by the executor
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Handler(String),

    #[error("workflow execution timed out after {0}ms")]
    Timeout(u64),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }
}
