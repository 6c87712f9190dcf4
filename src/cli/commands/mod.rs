mod embed;
mod merge;
mod status;

pub use embed::{EmbedArgs, handle_embed};
pub use merge::{MergeArgs, handle_merge};
pub use status::{StatusArgs, handle_status};
