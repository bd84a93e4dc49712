//! The concurrent SGD training loop.
//!
//! One feeder thread streams sentences into fixed-size jobs on a bounded
//! queue; a pool of workers pulls jobs and applies in-place gradient updates
//! to the shared parameter matrices. The matrices are written without locks
//! (Hogwild): concurrent updates to the same row may interleave, trading a
//! little accuracy for throughput. With a single worker and a fixed seed the
//! run is bit-for-bit reproducible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::corpus::Corpus;
use crate::error::{Error, Result};
use crate::model::Model;
use crate::rng::Rng;
use crate::vocab::Vocabulary;
use crate::{real, MAX_EXP, MAX_SENTENCE_LENGTH};

/// How often (in words) each worker refreshes its learning rate from the
/// global progress counter.
const ALPHA_REFRESH_INTERVAL: u64 = 10_000;

/// Per-call overrides for `train`. Fields left `None` fall back to the
/// model's configuration.
#[derive(Clone, Debug, Default)]
pub struct TrainParams {
    /// Expected number of in-vocabulary words per epoch; defaults to the
    /// count observed while building the vocabulary. Only used for the
    /// learning-rate schedule.
    pub total_words: Option<u64>,
    pub epochs: Option<usize>,
    pub alpha: Option<real>,
    pub min_alpha: Option<real>,
}

/// One unit of work: a batch of sentences, already encoded as vocabulary
/// indices.
type Job = Vec<Vec<usize>>;

impl Model {
    /// Trains the model on `corpus` with the configured hyperparameters.
    /// Returns the number of raw words processed.
    pub fn train<C: Corpus + Sync + ?Sized>(&mut self, corpus: &C) -> Result<u64> {
        self.train_with(corpus, TrainParams::default())
    }

    /// Trains with per-call parameter overrides.
    ///
    /// The vocabulary must already be built. The learning rate decays
    /// linearly from `alpha` to `min_alpha` as a function of words processed
    /// versus the estimated total across all epochs. Any error in the feeder
    /// or a worker aborts the call and is propagated.
    pub fn train_with<C: Corpus + Sync + ?Sized>(
        &mut self,
        corpus: &C,
        params: TrainParams,
    ) -> Result<u64> {
        let vocab = self.vocab()?;
        let epochs = params.epochs.unwrap_or(self.config.epochs);
        let alpha_start = params.alpha.unwrap_or(self.config.alpha);
        let alpha_min = params.min_alpha.unwrap_or(self.config.min_alpha);
        let words_per_epoch = params.total_words.unwrap_or(vocab.train_words);
        let total_words = words_per_epoch.saturating_mul(epochs as u64);
        let workers = self.config.workers.max(1);
        let batch_words = self.config.batch_words.max(MAX_SENTENCE_LENGTH);

        if let Some(prev_end) = self.last_end_alpha {
            if alpha_start > prev_end {
                warn!(
                    alpha_start,
                    previous_end = prev_end,
                    "effective alpha higher than at the end of the previous \
                     training cycle; multi-call schedules usually decay"
                );
            }
        }

        let progress = AtomicU64::new(0);
        let this: &Model = &*self;
        let vocab: &Vocabulary = vocab;

        let (tx, rx) = crossbeam_channel::bounded::<Job>(2 * workers);
        thread::scope(|scope| -> Result<()> {
            let feeder = scope.spawn(move || -> Result<()> {
                let mut job: Job = Vec::new();
                let mut job_words = 0usize;
                for _epoch in 0..epochs {
                    for sentence in corpus.sentences()? {
                        let sentence = sentence?;
                        let ids: Vec<usize> =
                            sentence.iter().filter_map(|t| vocab.get(t)).collect();
                        for chunk in ids.chunks(MAX_SENTENCE_LENGTH) {
                            if job_words + chunk.len() > batch_words && !job.is_empty() {
                                // send blocks when the queue is full; an Err
                                // means every worker is gone, so stop feeding.
                                if tx.send(std::mem::take(&mut job)).is_err() {
                                    return Ok(());
                                }
                                job_words = 0;
                            }
                            job_words += chunk.len();
                            job.push(chunk.to_vec());
                        }
                    }
                }
                if !job.is_empty() {
                    let _ = tx.send(job);
                }
                Ok(())
            });

            let handles: Vec<_> = (0..workers)
                .map(|id| {
                    let rx = rx.clone();
                    let progress = &progress;
                    scope.spawn(move || {
                        this.train_worker(id, rx, progress, total_words, alpha_start, alpha_min)
                    })
                })
                .collect();
            drop(rx);

            let mut first_err = None;
            match feeder.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => first_err = Some(err),
                Err(_) => first_err = Some(Error::WorkerPanic),
            }
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => first_err = first_err.or(Some(err)),
                    Err(_) => first_err = first_err.or(Some(Error::WorkerPanic)),
                }
            }
            match first_err {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })?;

        let processed = progress.load(Ordering::Relaxed);
        let decayed =
            alpha_start * (1.0 - processed as real / (total_words + 1) as real);
        self.last_end_alpha = Some(decayed.max(alpha_min));
        self.bump_generation();
        Ok(processed)
    }

    fn train_worker(
        &self,
        id: usize,
        rx: Receiver<Job>,
        progress: &AtomicU64,
        total_words: u64,
        alpha_start: real,
        alpha_min: real,
    ) -> Result<()> {
        let vocab = self.vocab()?;
        let size = self.config.size;
        let window = self.config.window.max(1);

        let mut rng = Rng(self.config.seed.wrapping_add(id as u64));
        let mut neu1: Vec<real> = vec![0.0; size];
        let mut neu1e: Vec<real> = vec![0.0; size];
        let mut sen: Vec<usize> = Vec::with_capacity(MAX_SENTENCE_LENGTH);

        let mut alpha = alpha_start;
        let mut word_count: u64 = 0;
        let mut last_word_count: u64 = 0;

        for job in rx.iter() {
            for sentence in &job {
                word_count += sentence.len() as u64;
                self.subsample_into(vocab, sentence, &mut rng, &mut sen);

                for pos in 0..sen.len() {
                    // Random radius up to `window`: near context gets more
                    // weight without a fixed cutoff.
                    let radius = window - rng.rand_u64() as usize % window;
                    if self.config.cbow {
                        self.cbow_step(vocab, &sen, pos, radius, alpha, &mut rng, &mut neu1, &mut neu1e);
                    } else {
                        self.skipgram_step(vocab, &sen, pos, radius, alpha, &mut rng, &mut neu1e);
                    }
                }

                if word_count - last_word_count > ALPHA_REFRESH_INTERVAL {
                    let n = word_count - last_word_count;
                    let global = progress.fetch_add(n, Ordering::Relaxed) + n;
                    last_word_count = word_count;
                    alpha = (alpha_start
                        * (1.0 - global as real / (total_words + 1) as real))
                        .max(alpha_min);
                    debug!(
                        worker = id,
                        alpha,
                        progress_pct =
                            global as f64 / (total_words + 1) as f64 * 100.0,
                        "training progress"
                    );
                }
            }
        }

        progress.fetch_add(word_count - last_word_count, Ordering::Relaxed);
        Ok(())
    }

    /// Subsampling randomly discards frequent words while keeping the
    /// ranking the same. Applied per training pass; the vocabulary itself is
    /// untouched.
    fn subsample_into(
        &self,
        vocab: &Vocabulary,
        sentence: &[usize],
        rng: &mut Rng,
        sen: &mut Vec<usize>,
    ) {
        sen.clear();
        let sample = self.config.sample;
        for &word in sentence {
            if sample > 0.0 {
                let f = vocab.word(word).count as real;
                let k = sample * vocab.train_words as real;
                let keep = ((f / k).sqrt() + 1.0) * k / f;
                if keep < rng.rand_real() {
                    continue;
                }
            }
            sen.push(word);
        }
    }

    /// One skip-gram position: each (center, context) pair trains the
    /// context word's input vector against the center word's output rows.
    #[allow(clippy::too_many_arguments)]
    fn skipgram_step(
        &self,
        vocab: &Vocabulary,
        sen: &[usize],
        pos: usize,
        radius: usize,
        alpha: real,
        rng: &mut Rng,
        neu1e: &mut [real],
    ) {
        let size = self.config.size;
        let word = sen[pos];

        let start = pos.saturating_sub(radius);
        let stop = (pos + radius + 1).min(sen.len());
        for c in start..stop {
            if c == pos {
                continue;
            }
            let context = sen[c];
            let l1 = context * size;
            neu1e.fill(0.0);

            if self.config.hs {
                let vw = vocab.word(word);
                for d in 0..vw.code.len() {
                    let l2 = vw.point[d] as usize * size;
                    // Propagate hidden -> output.
                    let f = (0..size)
                        .map(|k| self.syn0[l1 + k].get() * self.syn1[l2 + k].get())
                        .sum::<real>();
                    if f <= -MAX_EXP || f >= MAX_EXP {
                        continue;
                    }
                    let f = self.sigmoid(f);
                    // 'g' is the gradient multiplied by the learning rate.
                    let g = ((1 - vw.code[d]) as real - f) * alpha;
                    // Propagate errors output -> hidden.
                    for k in 0..size {
                        neu1e[k] += g * self.syn1[l2 + k].get();
                    }
                    // Learn weights hidden -> output.
                    for k in 0..size {
                        self.syn1[l2 + k].add(g * self.syn0[l1 + k].get());
                    }
                }
            }

            if self.config.negative > 0 && vocab.len() > 1 {
                self.negative_step(vocab, word, l1, alpha, rng, neu1e);
            }

            // Learn weights input -> hidden, scaled by the row's lock factor.
            let lock = self.syn0_lockf[context];
            for k in 0..size {
                self.syn0[l1 + k].add(lock * neu1e[k]);
            }
        }
    }

    /// One CBOW position: the mean (or sum) of the context vectors predicts
    /// the center word; the gradient is distributed back equally to every
    /// contributing context row.
    #[allow(clippy::too_many_arguments)]
    fn cbow_step(
        &self,
        vocab: &Vocabulary,
        sen: &[usize],
        pos: usize,
        radius: usize,
        alpha: real,
        rng: &mut Rng,
        neu1: &mut [real],
        neu1e: &mut [real],
    ) {
        let size = self.config.size;
        let word = sen[pos];

        let start = pos.saturating_sub(radius);
        let stop = (pos + radius + 1).min(sen.len());

        // in -> hidden
        neu1.fill(0.0);
        neu1e.fill(0.0);
        let mut cw = 0usize;
        for c in start..stop {
            if c == pos {
                continue;
            }
            let l1 = sen[c] * size;
            for k in 0..size {
                neu1[k] += self.syn0[l1 + k].get();
            }
            cw += 1;
        }
        if cw == 0 {
            return;
        }
        if self.config.cbow_mean {
            for k in 0..size {
                neu1[k] /= cw as real;
            }
        }

        if self.config.hs {
            let vw = vocab.word(word);
            for d in 0..vw.code.len() {
                let l2 = vw.point[d] as usize * size;
                let f = (0..size)
                    .map(|k| neu1[k] * self.syn1[l2 + k].get())
                    .sum::<real>();
                if f <= -MAX_EXP || f >= MAX_EXP {
                    continue;
                }
                let f = self.sigmoid(f);
                let g = ((1 - vw.code[d]) as real - f) * alpha;
                for k in 0..size {
                    neu1e[k] += g * self.syn1[l2 + k].get();
                }
                for k in 0..size {
                    self.syn1[l2 + k].add(g * neu1[k]);
                }
            }
        }

        if self.config.negative > 0 && vocab.len() > 1 {
            self.negative_step_hidden(vocab, word, neu1, alpha, rng, neu1e);
        }

        // hidden -> in: distribute the gradient back to every context row.
        let back_scale = if self.config.cbow_mean {
            1.0
        } else {
            1.0 / cw as real
        };
        for c in start..stop {
            if c == pos {
                continue;
            }
            let context = sen[c];
            let l1 = context * size;
            let lock = self.syn0_lockf[context] * back_scale;
            for k in 0..size {
                self.syn0[l1 + k].add(lock * neu1e[k]);
            }
        }
    }

    /// Negative sampling against the input row at `l1` (skip-gram side).
    fn negative_step(
        &self,
        vocab: &Vocabulary,
        word: usize,
        l1: usize,
        alpha: real,
        rng: &mut Rng,
        neu1e: &mut [real],
    ) {
        let size = self.config.size;
        for d in 0..self.config.negative + 1 {
            let target;
            let label;
            if d == 0 {
                target = word;
                label = 1.0;
            } else {
                target = match self.draw_negative(vocab, word, rng) {
                    Some(t) => t,
                    None => continue,
                };
                label = 0.0;
            }
            let l2 = target * size;
            let f = (0..size)
                .map(|k| self.syn0[l1 + k].get() * self.syn1neg[l2 + k].get())
                .sum::<real>();
            let g = (label - self.sigmoid(f)) * alpha;
            for k in 0..size {
                neu1e[k] += g * self.syn1neg[l2 + k].get();
            }
            for k in 0..size {
                self.syn1neg[l2 + k].add(g * self.syn0[l1 + k].get());
            }
        }
    }

    /// Negative sampling against an explicit hidden-layer vector (CBOW side).
    fn negative_step_hidden(
        &self,
        vocab: &Vocabulary,
        word: usize,
        hidden: &[real],
        alpha: real,
        rng: &mut Rng,
        neu1e: &mut [real],
    ) {
        let size = self.config.size;
        for d in 0..self.config.negative + 1 {
            let target;
            let label;
            if d == 0 {
                target = word;
                label = 1.0;
            } else {
                target = match self.draw_negative(vocab, word, rng) {
                    Some(t) => t,
                    None => continue,
                };
                label = 0.0;
            }
            let l2 = target * size;
            let f = (0..size)
                .map(|k| hidden[k] * self.syn1neg[l2 + k].get())
                .sum::<real>();
            let g = (label - self.sigmoid(f)) * alpha;
            for k in 0..size {
                neu1e[k] += g * self.syn1neg[l2 + k].get();
            }
            for k in 0..size {
                self.syn1neg[l2 + k].add(g * hidden[k]);
            }
        }
    }

    /// Draws one negative target from the unigram table, never the word
    /// being predicted, never index 0 as a table-miss fallback.
    fn draw_negative(&self, vocab: &Vocabulary, word: usize, rng: &mut Rng) -> Option<usize> {
        let r = rng.rand_u64();
        let mut target =
            self.unigram_table[(r >> 16) as usize % self.unigram_table.len()] as usize;
        if target == 0 {
            target = r as usize % (vocab.len() - 1) + 1;
        }
        if target == word {
            None
        } else {
            Some(target)
        }
    }

    /// Computes a log-probability score per sentence under the trained
    /// hierarchical-softmax model without updating any parameters.
    ///
    /// Fails with [`Error::ScoreRequiresHs`] on models configured for
    /// negative sampling only.
    pub fn score<C: Corpus + ?Sized>(&self, corpus: &C) -> Result<Vec<real>> {
        if !self.config.hs {
            return Err(Error::ScoreRequiresHs);
        }
        let vocab = self.vocab()?;
        let size = self.config.size;
        let window = self.config.window;

        let mut scores = Vec::new();
        for sentence in corpus.sentences()? {
            let sentence = sentence?;
            let ids: Vec<usize> = sentence.iter().filter_map(|t| vocab.get(t)).collect();
            let mut log_prob = 0.0f64;

            for pos in 0..ids.len() {
                let start = pos.saturating_sub(window);
                let stop = (pos + window + 1).min(ids.len());
                if self.config.cbow {
                    let mut hidden = vec![0.0 as real; size];
                    let mut cw = 0usize;
                    for c in start..stop {
                        if c == pos {
                            continue;
                        }
                        let l1 = ids[c] * size;
                        for k in 0..size {
                            hidden[k] += self.syn0[l1 + k].get();
                        }
                        cw += 1;
                    }
                    if cw == 0 {
                        continue;
                    }
                    if self.config.cbow_mean {
                        for cell in hidden.iter_mut() {
                            *cell /= cw as real;
                        }
                    }
                    log_prob += self.path_log_prob(vocab, ids[pos], &hidden);
                } else {
                    for c in start..stop {
                        if c == pos {
                            continue;
                        }
                        let hidden = self.input_row(ids[c]);
                        log_prob += self.path_log_prob(vocab, ids[pos], &hidden);
                    }
                }
            }
            scores.push(log_prob as real);
        }
        Ok(scores)
    }

    /// Log-probability of `word` along its Huffman path given a hidden-layer
    /// vector, computed exactly (no table) since scoring is a read path.
    fn path_log_prob(&self, vocab: &Vocabulary, word: usize, hidden: &[real]) -> f64 {
        let size = self.config.size;
        let vw = vocab.word(word);
        let mut lp = 0.0f64;
        for d in 0..vw.code.len() {
            let l2 = vw.point[d] as usize * size;
            let f: f64 = (0..size)
                .map(|k| hidden[k] as f64 * self.syn1[l2 + k].get() as f64)
                .sum();
            // Training pushes sigmoid(f) toward 1 - bit, so
            // P(bit) = sigmoid(f) for bit 0 and sigmoid(-f) for bit 1.
            let sign = if vw.code[d] == 0 { 1.0 } else { -1.0 };
            lp -= (-sign * f).exp().ln_1p();
        }
        lp
    }
}
