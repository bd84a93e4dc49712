//! The model: configuration, parameter matrices, and the normalized-vector
//! cache.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use aligned_box::AlignedBox;
use serde::{Deserialize, Serialize};

use crate::corpus::Corpus;
use crate::error::{Error, Result};
use crate::rng::Rng;
use crate::vocab::{TrimRule, Vocabulary};
use crate::{real, EXP_TABLE_SIZE, MAX_EXP};

/// An `f32` cell that tolerates unsynchronized concurrent updates.
///
/// All parameter matrices are made of these. Reads and writes are relaxed
/// atomics: racing Hogwild updates may interleave, which is an accepted
/// accuracy/throughput trade-off, not a bug.
#[derive(Default)]
#[repr(transparent)]
pub(crate) struct Real {
    bits: AtomicU32,
}

impl Real {
    pub fn get(&self) -> real {
        real::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: real) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, x: real) {
        self.set(self.get() + x);
    }
}

/// Training hyperparameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding vector length (number of dimensions).
    pub size: usize,
    /// Maximum skip length between words; the effective radius per position
    /// is drawn uniformly from `1..=window`.
    pub window: usize,
    /// Subsampling threshold for frequent words; 0 disables. Useful range is
    /// `(0, 1e-5)`.
    pub sample: real,
    /// Train with hierarchical softmax.
    pub hs: bool,
    /// Number of negative examples per positive one; 0 disables negative
    /// sampling. Common values are 3-10.
    pub negative: usize,
    /// Use the continuous bag-of-words architecture instead of skip-gram.
    pub cbow: bool,
    /// CBOW projects the mean of the context vectors; `false` uses the sum.
    pub cbow_mean: bool,
    /// Discard words that appear fewer than this many times.
    pub min_count: u64,
    /// Prune the in-progress vocabulary whenever it grows past this.
    pub max_vocab_size: Option<usize>,
    /// Starting learning rate.
    pub alpha: real,
    /// Floor of the learning-rate decay.
    pub min_alpha: real,
    /// Seed for matrix initialization and training randomness.
    pub seed: u64,
    /// Number of training worker threads.
    pub workers: usize,
    /// Training passes over the corpus per `train` call.
    pub epochs: usize,
    /// Maximum number of words per job handed to a worker.
    pub batch_words: usize,
    /// Number of entries in the negative-sampling unigram table.
    pub ns_table_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            size: 100,
            window: 5,
            sample: 1e-3,
            hs: false,
            negative: 5,
            cbow: false,
            cbow_mean: true,
            min_count: 5,
            max_vocab_size: None,
            alpha: 0.025,
            min_alpha: 0.0001,
            seed: 1,
            workers: 3,
            epochs: 5,
            batch_words: 10_000,
            ns_table_size: 10_000_000,
        }
    }
}

/// State of the lazily materialized unit-normalized copy of the input
/// matrix. A `Computed` cache whose generation lags the model's is stale and
/// gets rebuilt on next use. Never persisted.
pub(crate) enum NormCache {
    Absent,
    Computed { generation: u64, rows: Vec<real> },
}

/// A word-embedding model: vocabulary, parameter matrices, and everything
/// needed to train them and query the result.
pub struct Model {
    pub config: ModelConfig,
    pub(crate) vocab: Option<Vocabulary>,
    /// The learned word vectors, `vocab_size x size`, row-major.
    pub(crate) syn0: AlignedBox<[Real]>,
    /// Hierarchical-softmax output weights, `(vocab_size - 1) x size`.
    pub(crate) syn1: AlignedBox<[Real]>,
    /// Negative-sampling output weights, `vocab_size x size`.
    pub(crate) syn1neg: AlignedBox<[Real]>,
    /// Per-row gradient multiplier in `[0, 1]`; 0 freezes a row.
    pub(crate) syn0_lockf: Vec<real>,
    pub(crate) exp_table: Vec<real>,
    pub(crate) unigram_table: Vec<u32>,
    /// Bumped by every parameter mutation; the norm cache is valid only when
    /// its generation matches.
    pub(crate) generation: AtomicU64,
    pub(crate) norms: RwLock<NormCache>,
    /// Effective learning rate at the end of the previous `train` call, used
    /// to warn about rising-alpha misuse across calls.
    pub(crate) last_end_alpha: Option<real>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub(crate) fn placeholder() -> AlignedBox<[Real]> {
    AlignedBox::slice_from_default(128, 128).expect("memory allocation failed")
}

pub(crate) fn build_exp_table() -> Vec<real> {
    (0..EXP_TABLE_SIZE)
        .map(|i| {
            let x = (i as real / EXP_TABLE_SIZE as real * 2.0 - 1.0) * MAX_EXP;
            let e = (x as f64).exp() as real;
            e / (e + 1.0)
        })
        .collect()
}

impl Model {
    pub fn new(config: ModelConfig) -> Self {
        Model {
            config,
            vocab: None,
            syn0: placeholder(),
            syn1: placeholder(),
            syn1neg: placeholder(),
            syn0_lockf: Vec::new(),
            exp_table: build_exp_table(),
            unigram_table: Vec::new(),
            generation: AtomicU64::new(0),
            norms: RwLock::new(NormCache::Absent),
            last_end_alpha: None,
        }
    }

    /// The vocabulary, or [`Error::VocabNotBuilt`] if `build_vocab` has not
    /// run yet.
    pub fn vocab(&self) -> Result<&Vocabulary> {
        self.vocab.as_ref().ok_or(Error::VocabNotBuilt)
    }

    /// Scans the corpus once and builds the vocabulary, then sizes and
    /// initializes the parameter matrices.
    ///
    /// Rebuilding on an already-trained model discards all learned
    /// parameters.
    pub fn build_vocab<C: Corpus + ?Sized>(&mut self, corpus: &C) -> Result<()> {
        self.build_vocab_with_rule(corpus, |_, _, _| TrimRule::Default)
    }

    /// Like [`Model::build_vocab`], with a per-token pruning callback.
    pub fn build_vocab_with_rule<C, R>(&mut self, corpus: &C, trim_rule: R) -> Result<()>
    where
        C: Corpus + ?Sized,
        R: Fn(&str, u64, u64) -> TrimRule,
    {
        let mut vocab = Vocabulary::build(
            corpus,
            self.config.min_count,
            self.config.max_vocab_size,
            trim_rule,
        )?;
        if self.config.hs {
            vocab.assign_huffman_codes();
        }
        self.vocab = Some(vocab);
        self.init_net();
        if self.config.negative > 0 {
            self.rebuild_unigram_table();
        }
        self.last_end_alpha = None;
        self.bump_generation();
        Ok(())
    }

    /// Allocates the matrices: small deterministic random values for the
    /// input rows (seeded from the configured seed plus the row index, so the
    /// initial state is reproducible regardless of worker count), zeros for
    /// both output matrices.
    fn init_net(&mut self) {
        let vocab_size = self.vocab.as_ref().map_or(0, Vocabulary::len);
        let size = self.config.size;

        self.syn0 = AlignedBox::slice_from_default(128, vocab_size * size)
            .expect("memory allocation failed");
        if self.config.hs {
            self.syn1 = AlignedBox::slice_from_default(128, vocab_size.saturating_sub(1) * size)
                .expect("memory allocation failed");
        } else {
            self.syn1 = placeholder();
        }
        if self.config.negative > 0 {
            self.syn1neg = AlignedBox::slice_from_default(128, vocab_size * size)
                .expect("memory allocation failed");
        } else {
            self.syn1neg = placeholder();
        }

        for row in 0..vocab_size {
            let mut rng = Rng(self.config.seed.wrapping_add(row as u64));
            for b in 0..size {
                self.syn0[row * size + b].set((rng.rand_real() - 0.5) / size as real);
            }
        }
        self.syn0_lockf = vec![1.0; vocab_size];
    }

    /// Builds the table that negative sampling draws from: each word occupies
    /// a share proportional to `count^0.75`.
    pub(crate) fn rebuild_unigram_table(&mut self) {
        let vocab = self.vocab.as_ref().expect("vocabulary must exist");
        let table_size = self.config.ns_table_size;
        let power = 0.75f64;
        let train_words_pow: f64 = vocab.iter().map(|vw| (vw.count as f64).powf(power)).sum();

        self.unigram_table = Vec::with_capacity(table_size);
        let mut i = 0;
        let mut d1 = (vocab.word(i).count as f64).powf(power) / train_words_pow;
        for a in 0..table_size {
            self.unigram_table.push(i as u32);
            if a as f64 / table_size as f64 > d1 {
                i += 1;
                if i >= vocab.len() {
                    i = vocab.len() - 1;
                } else {
                    d1 += (vocab.word(i).count as f64).powf(power) / train_words_pow;
                }
            }
        }
    }

    /// Approximates the logistic function `1 / (1 + e^-x)` with the
    /// precomputed table, saturating outside `(-MAX_EXP, MAX_EXP)`.
    pub(crate) fn sigmoid(&self, x: real) -> real {
        if x > MAX_EXP {
            1.0
        } else if x < -MAX_EXP {
            0.0
        } else {
            self.exp_table
                [((x + MAX_EXP) * ((EXP_TABLE_SIZE / MAX_EXP as usize / 2) as real)) as usize]
        }
    }

    /// Freezes (`factor = 0.0`) or re-enables (`1.0`) gradient updates for
    /// one input row. Intermediate values scale the updates.
    pub fn set_lock_factor(&mut self, index: usize, factor: real) {
        self.syn0_lockf[index] = factor;
    }

    pub fn lock_factor(&self, index: usize) -> real {
        self.syn0_lockf[index]
    }

    /// The raw (untrained-or-trained, unnormalized) vector for a word.
    pub fn vector(&self, word: &str) -> Result<Vec<real>> {
        let vocab = self.vocab()?;
        let index = vocab
            .get(word)
            .ok_or_else(|| Error::WordNotFound(word.to_string()))?;
        Ok(self.input_row(index))
    }

    pub(crate) fn input_row(&self, index: usize) -> Vec<real> {
        let size = self.config.size;
        (0..size).map(|d| self.syn0[index * size + d].get()).collect()
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Runs `f` against the unit-normalized copy of the input matrix,
    /// rebuilding it first if it is absent or stale.
    pub(crate) fn with_norms<T>(&self, f: impl FnOnce(&[real]) -> T) -> Result<T> {
        let generation = self.generation.load(Ordering::Acquire);
        {
            let cache = self.norms.read().expect("norm cache lock poisoned");
            if let NormCache::Computed {
                generation: cached,
                rows,
            } = &*cache
            {
                if *cached == generation {
                    return Ok(f(rows));
                }
            }
        }

        let vocab = self.vocab()?;
        let size = self.config.size;
        let mut rows = vec![0.0; vocab.len() * size];
        for i in 0..vocab.len() {
            let row = &mut rows[i * size..][..size];
            for (d, cell) in row.iter_mut().enumerate() {
                *cell = self.syn0[i * size + d].get();
            }
            let norm = crate::similar::norm(row);
            if norm > 0.0 {
                for cell in row.iter_mut() {
                    *cell /= norm;
                }
            }
        }

        let out = f(&rows);
        let mut cache = self.norms.write().expect("norm cache lock poisoned");
        *cache = NormCache::Computed { generation, rows };
        Ok(out)
    }

    /// Forces the normalized cache to be (re)built now.
    pub fn init_sims(&self) -> Result<()> {
        self.with_norms(|_| ())
    }

    /// True when the normalized cache exists and matches the current
    /// parameters.
    pub fn norms_ready(&self) -> bool {
        let cache = self.norms.read().expect("norm cache lock poisoned");
        match &*cache {
            NormCache::Computed { generation, .. } => {
                *generation == self.generation.load(Ordering::Acquire)
            }
            NormCache::Absent => false,
        }
    }
}
