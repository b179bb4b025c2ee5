//! Prepares a recorded hymn (a multi-track Standard MIDI File) for playback during a
//! service: prelude, verses split at their fermatas, postlude and a panic file, each of
//! them a self-contained MIDI file.
//!
//! The crate does no I/O. Hand `assemble` a parsed `midly::Smf` and `Options`, get back
//! one `Smf` per `OutputKey`.

pub mod assemble;
pub mod bars;
pub mod channels;
pub mod cleanup;
pub mod cut;
pub mod error;
pub mod fermata;
pub mod midi;
pub mod notes;
pub mod panic_track;

#[cfg(test)]
mod testing;

pub use assemble::{FermataSpec, Options, OutputKey, Outputs, Range, TempoOverride, assemble};
pub use bars::{Length, Position};
pub use channels::{Coupler, TrackSelector};
pub use cleanup::NotePolicy;
pub use error::{Error, Result};
