// lib.rs
// Description: Minimal transformer language model with manual forward and backward
//              passes. No autodiff: every layer implements its analytic gradient and
//              returns an explicit forward context consumed by the matching backward.
// History:
// - 2026-03-02: Initial crate layout.
// Author: Marcus Schlieper

pub mod layer;
pub mod math;
pub mod model;
pub mod tokenizer;
pub mod train;

pub use layer::{ParameterTensor, PositionalEncoding};
pub use model::{Adam, CrossEntropyLoss, TransformerConfig, TransformerModel};
pub use tokenizer::{CharTokenizer, PairTokenizer, Tokenizer};
pub use train::{generate, Dataset, Trainer};
