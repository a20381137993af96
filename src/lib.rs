//! Deep-belief-network digit classifier: greedy RBM pretraining with CD-1,
//! then supervised fine-tuning by batch conjugate gradient with backpropagation.

pub mod checkpoint;
pub mod codec;
pub mod dataset;
pub mod error;
pub mod evaluate;
pub mod finetune;
pub mod mnist_loader;
pub mod network;
pub mod objective;
pub mod optimize;
pub mod pretrain;
pub mod rbm;

pub use dataset::Dataset;
pub use error::{Error, Result};
pub use network::{Layer, Network};
