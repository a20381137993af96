use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;

use mnist_dbn::checkpoint::{load_network, save_network};
use mnist_dbn::finetune::{evaluate, finetune, log_evaluation, FinetuneConfig};
use mnist_dbn::mnist_loader::{self, NUM_CLASSES};
use mnist_dbn::optimize::ConjugateGradient;
use mnist_dbn::pretrain::{pretrain_stack, PretrainConfig, UniformDraws};
use mnist_dbn::Network;
use rand::{rngs::StdRng, SeedableRng};

/// Deep belief network digit classifier.
#[derive(Parser, Debug)]
#[command(name = "mnist_dbn", about = "Pretrain, fine-tune and evaluate a DBN on MNIST")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Greedy layer-wise pretraining of a freshly initialized stack
    Pretrain {
        #[arg(long)]
        train_images: PathBuf,
        #[arg(long)]
        train_labels: PathBuf,
        /// Hidden layer widths, bottom to top
        #[arg(long, value_delimiter = ',', default_value = "500,500,2000")]
        hidden: Vec<usize>,
        #[arg(long, default_value_t = 10)]
        epochs: usize,
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Supervised fine-tuning of a pretrained model by conjugate gradient
    Finetune {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        train_images: PathBuf,
        #[arg(long)]
        train_labels: PathBuf,
        #[arg(long, requires = "test_labels")]
        test_images: Option<PathBuf>,
        #[arg(long, requires = "test_images")]
        test_labels: Option<PathBuf>,
        #[arg(long, default_value_t = 10)]
        epochs: usize,
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,
        #[arg(long, default_value_t = 3)]
        line_searches: usize,
        /// Epochs that only adjust the classification layer
        #[arg(long, default_value_t = 5)]
        last_layer_epochs: usize,
        /// Shuffle the training set with this seed before batching
        #[arg(long)]
        shuffle_seed: Option<u64>,
        /// Evaluation batches over the training set, must divide its rows
        #[arg(long, default_value_t = 600)]
        train_eval_batches: usize,
        /// Evaluation batches over the test set, must divide its rows
        #[arg(long, default_value_t = 100)]
        test_eval_batches: usize,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Report misclassifications and cross-entropy of a saved model
    Evaluate {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        images: PathBuf,
        #[arg(long)]
        labels: PathBuf,
        #[arg(long, default_value_t = 100)]
        batches: usize,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match Args::parse().command {
        Command::Pretrain {
            train_images,
            train_labels,
            hidden,
            epochs,
            batch_size,
            seed,
            output,
        } => {
            if hidden.is_empty() {
                bail!("at least one hidden layer is required");
            }
            let train = mnist_loader::load(&train_images, &train_labels)
                .context("loading training set")?;

            let mut widths = vec![train.images.ncols()];
            widths.extend(hidden);
            widths.push(NUM_CLASSES);
            let mut network = Network::random(&widths, &mut StdRng::seed_from_u64(seed));
            info!("Pretraining {widths:?}");

            let config = PretrainConfig {
                epochs,
                batch_size,
                ..PretrainConfig::default()
            };
            let errors = pretrain_stack(
                &mut network,
                train.images.view(),
                &config,
                &mut UniformDraws::seeded(seed.wrapping_add(1)),
            )
            .context("pretraining")?;
            for (layer, errors) in errors.iter().enumerate() {
                if let Some(last) = errors.last() {
                    info!("layer {layer}: final reconstruction error {last:.2}");
                }
            }
            save_network(&output, &network)?;
        }
        Command::Finetune {
            model,
            train_images,
            train_labels,
            test_images,
            test_labels,
            epochs,
            batch_size,
            line_searches,
            last_layer_epochs,
            shuffle_seed,
            train_eval_batches,
            test_eval_batches,
            output,
        } => {
            let mut network = load_network(&model).context("loading model")?;
            let mut train = mnist_loader::load(&train_images, &train_labels)
                .context("loading training set")?;
            if let Some(seed) = shuffle_seed {
                train = train.shuffled(seed);
            }
            let test = match (test_images, test_labels) {
                (Some(images), Some(labels)) => {
                    Some(mnist_loader::load(&images, &labels).context("loading test set")?)
                }
                _ => None,
            };

            let config = FinetuneConfig {
                epochs,
                batch_size,
                line_searches,
                last_layer_epochs,
                train_eval_batches,
                test_eval_batches,
            };

            info!("Before fine-tuning");
            log_evaluation("train", &evaluate(&network, &train, config.train_eval_batches)?);
            if let Some(test) = &test {
                log_evaluation("test", &evaluate(&network, test, config.test_eval_batches)?);
            }

            finetune(
                &mut network,
                &train,
                test.as_ref(),
                &config,
                &ConjugateGradient::default(),
            )
            .context("fine-tuning")?;
            save_network(&output, &network)?;
        }
        Command::Evaluate {
            model,
            images,
            labels,
            batches,
        } => {
            let network = load_network(&model).context("loading model")?;
            let data = mnist_loader::load(&images, &labels).context("loading evaluation set")?;
            let evaluation = evaluate(&network, &data, batches)?;
            log_evaluation("eval", &evaluation);
            println!(
                "{} / {} correct",
                evaluation.correct,
                evaluation.correct + evaluation.misclassified
            );
        }
    }
    Ok(())
}
