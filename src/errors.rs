
use thiserror::Error;

use crate::chains::SymbolKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
  #[error("malformed input: {0}")]
  InputFormat(String),

  #[error("no terminal chain for {kind:?} of length {length}")]
  MissingTerminal { kind: SymbolKind, length: usize },

  #[error("probability violation: {0}")]
  ProbabilityViolation(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl Error {
  pub fn input(msg: impl Into<String>) -> Error {
    Error::InputFormat(msg.into())
  }

  pub fn probability(msg: impl Into<String>) -> Error {
    Error::ProbabilityViolation(msg.into())
  }
}
