//! Error types for model building, training, and persistence.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by vocabulary construction, training, queries, and I/O.
#[derive(Debug, Error)]
pub enum Error {
    /// Every token was pruned; no parameter matrices can be sized.
    #[error("no trainable words: the vocabulary is empty after pruning")]
    EmptyVocab,

    /// `train`, a similarity query, or a save was attempted on a model with
    /// no vocabulary.
    #[error("you must build the vocabulary before training the model")]
    VocabNotBuilt,

    /// Lookup of a token that is not in the vocabulary.
    #[error("word {0:?} not in vocabulary")]
    WordNotFound(String),

    /// A vector file ended before the row count declared in its header.
    #[error("unexpected end of file: header declared {expected} vectors, found {found}")]
    UnexpectedEof { expected: usize, found: usize },

    /// Malformed header, vocabulary line, or container record.
    #[error("format error: {0}")]
    Format(String),

    /// Sentence scoring requires hierarchical softmax.
    #[error("scoring requires a model trained with hierarchical softmax")]
    ScoreRequiresHs,

    /// A training thread panicked.
    #[error("worker thread panicked during training")]
    WorkerPanic,

    /// Model container (de)serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
