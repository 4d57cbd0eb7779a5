mod chunk_store;
mod state_store;

pub use chunk_store::{ChunkStore, ChunkStoreBuilder};
pub use state_store::{StateStore, StateStoreBuilder};
