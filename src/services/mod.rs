mod chunker;
mod encoder;
mod extract;
mod runlog;
mod store;

pub use chunker::TokenChunker;
pub use encoder::{Encoder, OnnxEncoder};
pub use extract::extract_text;
pub use runlog::{RunLog, RunRecord};
pub use store::{ChunkStore, EmbeddingSink, mean_vectors};
