//! End-to-end tests over a small fixed corpus.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Arc, Mutex};

use wordvec::{real, Error, Model, ModelConfig, Precision, TrainParams, TrimRule};

/// Collects formatted log output so tests can assert on emitted warnings.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> LogCapture {
        self.clone()
    }
}

/// Runs `f` with a capturing subscriber installed and returns the log text.
fn capture_logs(f: impl FnOnce() -> anyhow::Result<()>) -> anyhow::Result<String> {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_ansi(false)
        .finish();
    tracing::subscriber::with_default(subscriber, f)?;
    Ok(capture.contents())
}

/// Nine short sentences; 12 distinct tokens, 29 occurrences.
fn sentences() -> Vec<Vec<String>> {
    [
        &["human", "interface", "computer"][..],
        &["survey", "user", "computer", "system", "response", "time"],
        &["eps", "user", "interface", "system"],
        &["system", "human", "system", "eps"],
        &["user", "response", "time"],
        &["trees"],
        &["graph", "trees"],
        &["graph", "minors", "trees"],
        &["graph", "minors", "survey"],
    ]
    .iter()
    .map(|s| s.iter().map(|w| w.to_string()).collect())
    .collect()
}

fn test_config() -> ModelConfig {
    ModelConfig {
        size: 4,
        min_count: 1,
        // Tiny corpus: don't subsample, keep the tables small.
        sample: 0.0,
        seed: 42,
        workers: 1,
        epochs: 10,
        ns_table_size: 10_000,
        ..ModelConfig::default()
    }
}

fn bits(v: &[real]) -> Vec<u32> {
    v.iter().map(|x| x.to_bits()).collect()
}

#[test]
fn vocab_covers_whole_corpus_at_min_count_1() -> anyhow::Result<()> {
    let corpus = sentences();
    let mut model = Model::new(test_config());
    model.build_vocab(&corpus)?;

    let vocab = model.vocab()?;
    assert_eq!(vocab.len(), 12);
    let total: u64 = vocab.iter().map(|vw| vw.count).sum();
    assert_eq!(total, 29);
    assert_eq!(vocab.train_words, 29);
    // "system" occurs 4 times, more than anything else.
    assert_eq!(vocab.word(0).word, "system");
    Ok(())
}

#[test]
fn trim_rule_semantics() -> anyhow::Result<()> {
    let mut corpus = sentences();
    corpus.push(vec!["occurs_only_once".to_string()]);

    let mut model = Model::new(ModelConfig {
        min_count: 2,
        ..test_config()
    });
    model.build_vocab_with_rule(&corpus, |word, _, _| {
        if word == "human" {
            TrimRule::Discard
        } else {
            TrimRule::Default
        }
    })?;

    let vocab = model.vocab()?;
    assert!(!vocab.contains("human")); // discarded despite count 2
    assert!(!vocab.contains("occurs_only_once")); // default rule, below min_count
    assert!(vocab.contains("interface")); // default rule, at min_count
    Ok(())
}

#[test]
fn train_requires_vocabulary() {
    let corpus = sentences();
    let mut model = Model::new(test_config());
    let err = model.train(&corpus).unwrap_err();
    assert!(matches!(err, Error::VocabNotBuilt));
}

#[test]
fn training_produces_vectors_of_configured_dimension() -> anyhow::Result<()> {
    let corpus = sentences();
    let mut model = Model::new(ModelConfig {
        size: 2,
        hs: true,
        negative: 0,
        ..test_config()
    });
    model.build_vocab(&corpus)?;
    model.train(&corpus)?;
    assert_eq!(model.vector("graph")?.len(), 2);
    assert_eq!(model.vector("system")?.len(), 2);
    Ok(())
}

#[test]
fn single_worker_runs_are_bit_identical() -> anyhow::Result<()> {
    let corpus = sentences();
    for (hs, negative, cbow) in [(true, 0, false), (false, 2, false), (true, 2, true)] {
        let config = ModelConfig {
            hs,
            negative,
            cbow,
            ..test_config()
        };
        let mut a = Model::new(config.clone());
        let mut b = Model::new(config);
        a.build_vocab(&corpus)?;
        b.build_vocab(&corpus)?;
        a.train(&corpus)?;
        b.train(&corpus)?;
        for vw in a.vocab()?.iter() {
            assert_eq!(
                bits(&a.vector(&vw.word)?),
                bits(&b.vector(&vw.word)?),
                "vectors for {:?} differ (hs={hs} negative={negative} cbow={cbow})",
                vw.word
            );
        }
    }
    Ok(())
}

#[test]
fn locked_rows_do_not_move() -> anyhow::Result<()> {
    let corpus = sentences();
    for cbow in [false, true] {
        let mut model = Model::new(ModelConfig {
            hs: true,
            negative: 2,
            cbow,
            ..test_config()
        });
        model.build_vocab(&corpus)?;

        let locked_word = model.vocab()?.word(0).word.clone();
        let unlocked_word = model.vocab()?.word(1).word.clone();
        let locked_before = model.vector(&locked_word)?;
        let unlocked_before = model.vector(&unlocked_word)?;
        model.set_lock_factor(0, 0.0);

        model.train(&corpus)?;

        assert_eq!(
            bits(&locked_before),
            bits(&model.vector(&locked_word)?),
            "locked vector moved (cbow={cbow})"
        );
        assert_ne!(
            bits(&unlocked_before),
            bits(&model.vector(&unlocked_word)?),
            "unlocked vector did not move (cbow={cbow})"
        );
    }
    Ok(())
}

#[test]
fn full_model_round_trip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.bin");

    let corpus = sentences();
    let mut model = Model::new(ModelConfig {
        hs: true,
        negative: 2,
        ..test_config()
    });
    model.build_vocab(&corpus)?;
    model.train(&corpus)?;
    model.init_sims()?;
    assert!(model.norms_ready());

    model.save(&path, None)?;
    let loaded = Model::load(&path, false)?;

    // The normalized cache is never persisted.
    assert!(!loaded.norms_ready());
    assert_eq!(loaded.vocab()?.len(), model.vocab()?.len());
    for vw in model.vocab()?.iter() {
        let (a, b) = (model.vector(&vw.word)?, loaded.vector(&vw.word)?);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
        assert_eq!(loaded.vocab()?.word(loaded.vocab()?.get(&vw.word).unwrap()).count, vw.count);
    }
    Ok(())
}

#[test]
fn spilled_matrices_round_trip_with_and_without_mmap() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.bin");

    let corpus = sentences();
    let mut model = Model::new(ModelConfig {
        hs: true,
        ..test_config()
    });
    model.build_vocab(&corpus)?;
    model.train(&corpus)?;

    // sep_limit 0 spills every matrix to sibling files.
    model.save(&path, Some(0))?;
    assert!(path.with_file_name("model.bin.syn0.vec").exists());

    for mmap in [false, true] {
        let loaded = Model::load(&path, mmap)?;
        assert_eq!(loaded.vocab()?.len(), 12);
        for vw in model.vocab()?.iter() {
            let (a, b) = (model.vector(&vw.word)?, loaded.vector(&vw.word)?);
            assert_eq!(bits(&a), bits(&b), "mmap={mmap}");
        }
    }
    Ok(())
}

#[test]
fn word2vec_format_round_trip_binary_and_text() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let corpus = sentences();
    let mut model = Model::new(test_config());
    model.build_vocab(&corpus)?;
    model.train(&corpus)?;

    for (binary, name) in [(true, "vectors.bin"), (false, "vectors.txt")] {
        let path = dir.path().join(name);
        model.save_word2vec_format(&path, None, binary, Precision::F32)?;
        let loaded = Model::load_word2vec_format(&path, None, binary, None, Precision::F32)?;
        assert_eq!(loaded.vocab()?.len(), 12);
        let (a, b) = (model.vector("graph")?, loaded.vector("graph")?);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5, "binary={binary}");
        }
    }
    Ok(())
}

#[test]
fn word2vec_format_half_precision() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vectors.f16.bin");
    let corpus = sentences();
    let mut model = Model::new(test_config());
    model.build_vocab(&corpus)?;
    model.train(&corpus)?;

    model.save_word2vec_format(&path, None, true, Precision::F16)?;
    let loaded = Model::load_word2vec_format(&path, None, true, None, Precision::F16)?;
    let (a, b) = (model.vector("trees")?, loaded.vector("trees")?);
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < 1e-2);
    }
    Ok(())
}

#[test]
fn word2vec_format_vocab_sidecar_recovers_counts() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vectors.bin");
    let vocab_path = dir.path().join("vectors.vocab");
    let corpus = sentences();
    let mut model = Model::new(test_config());
    model.build_vocab(&corpus)?;

    model.save_word2vec_format(&path, Some(&vocab_path), true, Precision::F32)?;
    let loaded =
        Model::load_word2vec_format(&path, Some(&vocab_path), true, None, Precision::F32)?;
    let vocab = loaded.vocab()?;
    assert_eq!(vocab.word(vocab.get("graph").unwrap()).count, 3);
    assert_eq!(vocab.word(vocab.get("system").unwrap()).count, 4);
    Ok(())
}

#[test]
fn word2vec_format_limit() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vectors.bin");
    let corpus = sentences();
    let mut model = Model::new(test_config());
    model.build_vocab(&corpus)?;

    model.save_word2vec_format(&path, None, true, Precision::F32)?;
    let loaded = Model::load_word2vec_format(&path, None, true, Some(3), Precision::F32)?;
    assert_eq!(loaded.vocab()?.len(), 3);
    // The first rows are the most frequent words.
    assert!(loaded.vocab()?.contains("system"));
    Ok(())
}

#[test]
fn truncated_vector_file_is_an_eof_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    for binary in [true, false] {
        let path = dir.path().join(if binary { "t.bin" } else { "t.txt" });
        let corpus = sentences();
        let mut model = Model::new(test_config());
        model.build_vocab(&corpus)?;
        model.save_word2vec_format(&path, None, binary, Precision::F32)?;

        // Overwrite the declared vocabulary size with a bigger one.
        let mut f = OpenOptions::new().write(true).open(&path)?;
        f.write_all(b"13")?;

        let err =
            Model::load_word2vec_format(&path, None, binary, None, Precision::F32).unwrap_err();
        assert!(
            matches!(err, Error::UnexpectedEof { expected: 13, .. }),
            "binary={binary}, got {err}"
        );
    }
    Ok(())
}

#[test]
fn most_similar_by_word_and_by_own_vector_agree() -> anyhow::Result<()> {
    let corpus = sentences();
    let mut model = Model::new(ModelConfig {
        hs: true,
        negative: 0,
        ..test_config()
    });
    model.build_vocab(&corpus)?;
    model.train(&corpus)?;

    let by_word = model.similar_by_word("graph", 10)?;
    let graph_vector = model.norm_vector("graph")?;
    let by_vector: Vec<(String, real)> = model
        .similar_by_vector(&graph_vector, 11)?
        .into_iter()
        .filter(|(w, _)| w != "graph")
        .collect();
    assert_eq!(by_word.len(), by_vector.len());
    for ((wa, sa), (wb, sb)) in by_word.iter().zip(by_vector.iter()) {
        assert_eq!(wa, wb);
        assert!((sa - sb).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn similarity_and_n_similarity() -> anyhow::Result<()> {
    let corpus = sentences();
    let mut model = Model::new(test_config());
    model.build_vocab(&corpus)?;
    model.train(&corpus)?;

    // Self-similarity is the maximum possible score.
    assert!((model.similarity("graph", "graph")? - 1.0).abs() < 1e-5);

    let single = model.similarity("graph", "trees")?;
    let n = model.n_similarity(&["graph"], &["trees"])?;
    assert!((single - n).abs() < 1e-5);

    let sym = model.n_similarity(&["graph", "trees"], &["trees", "graph"])?;
    assert!((sym - 1.0).abs() < 1e-5);

    assert!(matches!(
        model.similarity("graph", "voynich"),
        Err(Error::WordNotFound(_))
    ));
    Ok(())
}

#[test]
fn scoring_requires_hierarchical_softmax() -> anyhow::Result<()> {
    let corpus = sentences();

    let mut ns_model = Model::new(test_config());
    ns_model.build_vocab(&corpus)?;
    ns_model.train(&corpus)?;
    assert!(matches!(ns_model.score(&corpus), Err(Error::ScoreRequiresHs)));

    let mut hs_model = Model::new(ModelConfig {
        hs: true,
        negative: 0,
        ..test_config()
    });
    hs_model.build_vocab(&corpus)?;
    hs_model.train(&corpus)?;
    let scores = hs_model.score(&corpus)?;
    assert_eq!(scores.len(), corpus.len());
    for score in scores {
        assert!(score <= 0.0, "log-probabilities cannot be positive");
    }
    Ok(())
}

#[test]
fn multiple_calls_with_explicit_schedule() -> anyhow::Result<()> {
    let corpus = sentences();
    let mut model = Model::new(ModelConfig {
        hs: true,
        ..test_config()
    });
    model.build_vocab(&corpus)?;
    model.train_with(
        &corpus,
        TrainParams {
            alpha: Some(0.025),
            min_alpha: Some(0.01),
            epochs: Some(2),
            ..TrainParams::default()
        },
    )?;
    // A second, lower-alpha call continues training without complaint.
    model.train_with(
        &corpus,
        TrainParams {
            alpha: Some(0.01),
            min_alpha: Some(0.001),
            epochs: Some(2),
            ..TrainParams::default()
        },
    )?;
    Ok(())
}

#[test]
fn norm_cache_goes_stale_after_training() -> anyhow::Result<()> {
    let corpus = sentences();
    let mut model = Model::new(test_config());
    model.build_vocab(&corpus)?;
    model.init_sims()?;
    assert!(model.norms_ready());

    model.train(&corpus)?;
    assert!(!model.norms_ready());
    model.init_sims()?;
    assert!(model.norms_ready());
    Ok(())
}

#[test]
fn character_soup_sentence_warns_but_builds() -> anyhow::Result<()> {
    let mut corpus = sentences();
    // The visible symptom of feeding a bare string where a token list was
    // expected: one "sentence" per character.
    corpus.push("human".chars().map(|c| c.to_string()).collect());

    let mut model = Model::new(test_config());
    let log = capture_logs(|| {
        model.build_vocab(&corpus)?;
        Ok(())
    })?;

    assert!(
        log.contains("single-character"),
        "shape warning not emitted: {log:?}"
    );
    // The warning is advisory; the build itself succeeds.
    assert!(model.vocab()?.contains("graph"));
    assert!(model.vocab()?.contains("h"));
    Ok(())
}

#[test]
fn rising_alpha_across_calls_warns_but_trains() -> anyhow::Result<()> {
    let corpus = sentences();
    let mut model = Model::new(ModelConfig {
        hs: true,
        ..test_config()
    });
    model.build_vocab(&corpus)?;
    model.train_with(
        &corpus,
        TrainParams {
            alpha: Some(0.025),
            min_alpha: Some(0.001),
            epochs: Some(1),
            ..TrainParams::default()
        },
    )?;

    // A higher starting rate than the previous call ended with is suspicious
    // but legal.
    let log = capture_logs(|| {
        let words = model.train_with(
            &corpus,
            TrainParams {
                alpha: Some(0.1),
                min_alpha: Some(0.001),
                epochs: Some(1),
                ..TrainParams::default()
            },
        )?;
        assert!(words > 0);
        Ok(())
    })?;

    assert!(
        log.contains("alpha higher"),
        "rising-alpha warning not emitted: {log:?}"
    );
    Ok(())
}

#[test]
fn eof_error_reports_header_count_when_limited() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("short.txt");
    let mut f = File::create(&path)?;
    writeln!(f, "5 2")?;
    writeln!(f, "alpha 0.1 0.2")?;
    writeln!(f, "beta 0.3 0.4")?;
    drop(f);

    // Even with a smaller limit, the diagnostic names the header's count.
    let err =
        Model::load_word2vec_format(&path, None, false, Some(4), Precision::F32).unwrap_err();
    assert!(
        matches!(
            err,
            Error::UnexpectedEof {
                expected: 5,
                found: 2
            }
        ),
        "got {err}"
    );
    Ok(())
}

#[test]
fn most_similar_accepts_mixed_word_and_vector_terms() -> anyhow::Result<()> {
    let corpus = sentences();
    let mut model = Model::new(ModelConfig {
        hs: true,
        negative: 0,
        ..test_config()
    });
    model.build_vocab(&corpus)?;
    model.train(&corpus)?;

    let results = model.most_similar(&["graph".into(), "trees".into()], &["minors".into()], 5)?;
    assert_eq!(results.len(), 5);
    for (word, _) in &results {
        assert!(word != "graph" && word != "trees" && word != "minors");
    }
    for pair in results.windows(2) {
        assert!(pair[0].1 >= pair[1].1);
    }

    let v = model.norm_vector("graph")?;
    let by_vec_ref = model.most_similar(&[(&v).into()], &[], 3)?;
    let by_slice = model.most_similar(&[v.as_slice().into()], &[], 3)?;
    assert_eq!(by_vec_ref, by_slice);
    Ok(())
}

#[test]
fn hogwild_training_with_multiple_workers_completes() -> anyhow::Result<()> {
    // Results race by design; this only checks that a multi-worker run
    // finishes and produces usable vectors.
    let corpus: Vec<Vec<String>> = sentences()
        .into_iter()
        .cycle()
        .take(500)
        .collect();
    let mut model = Model::new(ModelConfig {
        workers: 4,
        epochs: 2,
        negative: 2,
        ..test_config()
    });
    model.build_vocab(&corpus)?;
    let words = model.train(&corpus)?;
    assert!(words > 0);
    assert_eq!(model.similar_by_word("graph", 5)?.len(), 5);
    Ok(())
}
