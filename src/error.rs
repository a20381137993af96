use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A flat parameter vector does not hold exactly as many elements as its manifest describes.
    #[error("flat vector has {found} elements, manifest describes {expected}")]
    LengthMismatch { expected: usize, found: usize },

    #[error("shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<(usize, usize)>,
        found: Vec<(usize, usize)>,
    },

    #[error("layer {layer} has {hidden} hidden units but the layer above has {visible} visible units")]
    LayerWidthMismatch {
        layer: usize,
        hidden: usize,
        visible: usize,
    },

    #[error("{rows} rows cannot be split into batches of {batch_size}")]
    BatchPartition { rows: usize, batch_size: usize },

    /// The unnormalized exp scores overflowed or a row normalized to nothing.
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),

    #[error("{}: {reason}", path.display())]
    Dataset { path: PathBuf, reason: String },

    #[error("checkpoint is missing tensor `{0}`")]
    MissingTensor(String),

    #[error("malformed checkpoint: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn dataset(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Dataset {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
