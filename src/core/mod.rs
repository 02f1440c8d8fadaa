pub mod checkpoint;
pub mod config;
pub mod error;
pub mod image;
pub mod names;
pub mod nnblocks;
pub mod scratch;
pub mod similarity;
pub mod tensor;
pub mod tokenizer;
pub mod transformer;
pub mod types;
