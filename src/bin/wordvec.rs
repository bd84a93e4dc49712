use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use wordvec::{real, LineCorpus, Model, ModelConfig, Precision};

#[derive(Parser)]
#[command(about = "WORD VECTOR estimation toolkit", long_about = None)]
struct Options {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train word vectors from a text corpus (one sentence per line)
    Train(TrainOptions),
    /// Interactively query the nearest words in a trained vector file
    Distance(DistanceOptions),
}

#[derive(Parser)]
struct TrainOptions {
    /// Use text data from FILE to train the model
    #[arg(long = "train", value_name = "FILE")]
    train_file: PathBuf,

    /// Use FILE to save the resulting word vectors
    #[arg(long = "output", value_name = "FILE")]
    output_file: PathBuf,

    /// Set size of word vectors; default is 100
    #[arg(long, default_value_t = 100)]
    size: usize,

    /// Set max skip length between words
    #[arg(long, default_value_t = 5)]
    window: usize,

    /// Set threshold for occurrence of words. Those that appear with higher
    /// frequency in the training data will be randomly down-sampled; default
    /// is 1e-3, useful range is (0, 1e-5)
    #[arg(long, default_value_t = 1e-3)]
    sample: real,

    /// Use Hierarchical Softmax
    #[arg(long)]
    hs: bool,

    /// Number of negative examples; default is 5, common values are 3 - 10 (0 = not used)
    #[arg(long, default_value_t = 5)]
    negative: usize,

    /// Use N threads
    #[arg(long = "threads", value_name = "N", default_value_t = 3)]
    num_threads: usize,

    /// Run more training iterations
    #[arg(long, default_value_t = 5)]
    iter: usize,

    /// Discard words that appear less than N times
    #[arg(long = "min-count", value_name = "N", default_value_t = 5)]
    min_count: u64,

    /// Set the starting learning rate; default is 0.025 for skip-gram and 0.05 for CBOW
    #[arg(long)]
    alpha: Option<real>,

    /// Random seed for reproducible runs (with --threads 1)
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Save the resulting vectors in binary mode
    #[arg(long)]
    binary: bool,

    /// The vocabulary will be saved to FILE
    #[arg(long = "save-vocab", value_name = "FILE")]
    save_vocab_file: Option<PathBuf>,

    /// Also save the full model (vocabulary, all matrices, hyperparameters) to FILE
    #[arg(long = "save-model", value_name = "FILE")]
    save_model_file: Option<PathBuf>,

    /// Use the continuous bag of words model (otherwise, use skip-gram model)
    #[arg(long)]
    cbow: bool,
}

#[derive(Parser)]
struct DistanceOptions {
    /// Contains word projections
    #[arg(value_name = "FILE")]
    file_name: PathBuf,

    /// The vector file is in binary mode
    #[arg(long)]
    binary: bool,

    /// Number of closest words to show
    #[arg(long, default_value_t = 40)]
    topn: usize,
}

fn train(options: TrainOptions) -> Result<()> {
    let config = ModelConfig {
        size: options.size,
        window: options.window,
        sample: options.sample,
        hs: options.hs,
        negative: options.negative,
        cbow: options.cbow,
        min_count: options.min_count,
        alpha: options
            .alpha
            .unwrap_or(if options.cbow { 0.05 } else { 0.025 }),
        seed: options.seed,
        workers: options.num_threads,
        epochs: options.iter,
        ..ModelConfig::default()
    };

    let corpus = LineCorpus::new(&options.train_file);
    let mut model = Model::new(config);

    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")?);
    bar.enable_steady_tick(Duration::from_millis(100));

    bar.set_message("building vocabulary");
    model
        .build_vocab(&corpus)
        .context("error building vocabulary")?;
    let vocab = model.vocab()?;
    bar.println(format!(
        "Vocab size: {}\nWords in train file: {}",
        vocab.len(),
        vocab.train_words
    ));

    bar.set_message("training");
    let words = model.train(&corpus).context("error during training")?;
    bar.finish_with_message(format!("trained on {words} words"));

    model
        .save_word2vec_format(
            &options.output_file,
            options.save_vocab_file.as_deref(),
            options.binary,
            Precision::F32,
        )
        .context("error writing output file")?;
    if let Some(model_file) = &options.save_model_file {
        model
            .save(model_file, Some(64 * 1024 * 1024))
            .context("error writing model file")?;
    }
    Ok(())
}

fn distance(options: DistanceOptions) -> Result<()> {
    let model = Model::load_word2vec_format(
        &options.file_name,
        None,
        options.binary,
        None,
        Precision::F32,
    )
    .context("error loading vector file")?;

    let stdin = io::stdin();
    loop {
        print!("Enter word (EXIT to break): ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let word = line.trim();
        if word == "EXIT" {
            break;
        }
        match model.similar_by_word(word, options.topn) {
            Ok(neighbors) => {
                println!("\n{:>50}    Cosine distance", "Word");
                println!("{}", "-".repeat(72));
                for (neighbor, score) in neighbors {
                    println!("{neighbor:>50}    {score:.6}");
                }
            }
            Err(err) => println!("{err}"),
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .init();

    let options = Options::parse();
    let result = match options.command {
        Command::Train(opts) => train(opts),
        Command::Distance(opts) => distance(opts),
    };
    if let Err(err) = result {
        eprintln!("{err:#}");
        process::exit(1);
    }
}
