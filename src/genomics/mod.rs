//! Genomics primitives shared by every pipeline stage.
//!
//! This module exposes reference access, one-hot windows, signal tracks,
//! element tables and the dinucleotide shuffle used for control sequences.

mod elements;
mod onehot;
mod reference;
mod shuffle;
mod signal;

pub use elements::{ClassMap, Element, ElementsTable, TableError, TsvTable};
pub use onehot::{
    base_index, is_blank, one_hot_encode, onehot_to_chars, Window, ALPHABET, NUM_BASES,
};
pub use reference::{
    fetch_padded, fetch_window, valid_range, FaidxGenome, GenomeError, GenomeSource,
    InMemoryGenome,
};
pub use shuffle::{dinucleotide_shuffle, example_rng};
pub use signal::{signal_window, BedGraphTrack, SignalTrack};
