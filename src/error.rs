use thiserror::Error;

/// Errors raised by the vocabulary, program and data layers
#[derive(Debug, Error)]
pub enum VrError {
    #[error("token index {index} is outside the program vocabulary (size {size})")]
    UnknownTokenIndex { index: i64, size: usize },

    #[error("token '{0}' is missing from the vocabulary")]
    UnknownToken(String),

    #[error("function '{token}' has unsupported arity {arity}")]
    UnsupportedArity { token: String, arity: usize },

    #[error("vocabulary map '{map}' is not dense: missing index {missing}")]
    SparseVocabulary { map: &'static str, missing: usize },

    #[error("batch has {questions} questions but {programs} programs")]
    ProgramCountMismatch { questions: usize, programs: usize },

    #[error("model requires programs but the question store has none")]
    MissingPrograms,

    #[error("image index {index} is outside the feature store (size {size})")]
    ImageIndexOutOfRange { index: i64, size: usize },

    #[error("{field} value {value} at row {row} is outside 0..{size}")]
    IndexOutOfRange { field: &'static str, row: usize, value: i64, size: usize },

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("invalid npy file: {0}")]
    Npy(String),

    #[error("invalid s-expression: {0}")]
    Sexp(String),
}
