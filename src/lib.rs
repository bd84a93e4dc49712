//! Word embedding training and similarity queries.
//!
//! This crate trains dense vector representations for words from a corpus of
//! tokenized sentences (the classic skip-gram / CBOW models, with either
//! hierarchical softmax or negative sampling as the objective) and serves
//! nearest-neighbor and similarity queries over the trained vectors.
//!
//! Typical use:
//!
//! ```no_run
//! use wordvec::{LineCorpus, Model, ModelConfig};
//!
//! # fn main() -> wordvec::Result<()> {
//! let corpus = LineCorpus::new("corpus.txt");
//! let mut model = Model::new(ModelConfig {
//!     size: 100,
//!     min_count: 5,
//!     ..ModelConfig::default()
//! });
//! model.build_vocab(&corpus)?;
//! model.train(&corpus)?;
//! for (word, score) in model.similar_by_word("computer", 10)? {
//!     println!("{word} {score}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Training is concurrent and intentionally lock-free: worker threads apply
//! gradient updates to shared parameter matrices without synchronization
//! (Hogwild SGD). With `workers = 1` and a fixed seed, results are
//! bit-for-bit reproducible; with more workers, updates race by design and
//! only statistical consistency is guaranteed.

pub mod corpus;
pub mod error;
pub mod io;
pub mod model;
mod rng;
pub mod similar;
pub mod train;
pub mod vocab;

pub use corpus::{Corpus, LineCorpus};
pub use error::{Error, Result};
pub use io::Precision;
pub use model::{Model, ModelConfig};
pub use similar::Query;
pub use train::TrainParams;
pub use vocab::{TrimRule, VocabWord, Vocabulary};

/// Precision of float numbers.
#[allow(non_camel_case_types)]
pub type real = f32;

/// Number of entries in the precomputed sigmoid table.
pub(crate) const EXP_TABLE_SIZE: usize = 1000;

/// Dot products outside `(-MAX_EXP, MAX_EXP)` saturate the sigmoid.
pub(crate) const MAX_EXP: real = 6.0;

/// Sentences longer than this are split into contiguous chunks before they
/// are handed to worker threads, so long documents interleave fairly with
/// short ones and per-job memory stays bounded.
pub(crate) const MAX_SENTENCE_LENGTH: usize = 1000;
