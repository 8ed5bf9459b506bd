//! Directory-backed image datasets: loading, caching, batching and the
//! per-epoch shuffle.

pub mod batcher;
pub mod loader;
pub mod shuffle;

pub use batcher::{autotune_depth, batch_from_set, batch_indices, for_each_batch, shuffled_batches, Batch};
pub use loader::{list_classes, load_splits, to_pixels, DatasetSplits, ImageSet, Sample};
pub use shuffle::ShuffleBuffer;
