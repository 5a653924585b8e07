//! Static separator index for Lacuna.
//!
//! Maps a search key to the storage segment that may contain it, through a
//! shallow fan-out tree over the per-segment minimum keys.

mod static_index;

pub use static_index::StaticIndex;
