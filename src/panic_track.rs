//! The "panic" output: a note-off for every note a song ever plays.

use std::collections::BTreeSet;

use crate::midi::{NoteEvent, Song, Timed, note_event, note_off};
use crate::notes::NoteKey;

/// A single-track song that stops every (channel, pitch) started anywhere in `song`,
/// in (channel, pitch) order, all at tick 0.
pub fn all_notes_off<'a>(song: &Song<'a>) -> Song<'a> {
    let used: BTreeSet<NoteKey> = song
        .events()
        .filter_map(|ev| match note_event(&ev.kind) {
            Some(NoteEvent::On { channel, key, .. }) => Some(NoteKey::new(channel, key)),
            _ => None,
        })
        .collect();

    let mut track: Vec<Timed<'a>> = used.into_iter().map(|k| Timed::new(0, note_off(k.channel, k.key))).collect();
    track.push(Timed::end_of_track(0));
    Song { ppq: song.ppq, tracks: vec![track] }
}
