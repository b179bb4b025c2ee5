//! Post-processing passes over a resequenced song.
//!
//! Every pass returns a new song and is idempotent: running it on its own output changes
//! nothing.

use std::collections::BTreeMap;

use log::warn;
use midly::{MetaMessage, MidiMessage, TrackEventKind};

use crate::midi::{Event, NoteEvent, Song, Tick, Timed, is_note_off, note_event, note_off};
use crate::notes::{NoteKey, NoteTracker};

/// What to do with a note-on for a key that is already sounding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NotePolicy {
    /// Drop the new note-on; the note keeps sounding.
    #[default]
    Hold,
    /// Stop the note and start it again.
    Restart,
}

/// Rebuild `song` from its merged events. `f` pushes the replacement of each event into
/// the event's track; `EndOfTrack` markers are carried over.
fn rebuild<'a, F>(song: &Song<'a>, mut f: F) -> Song<'a>
where
    F: FnMut(&Event<'a>, &mut Vec<Timed<'a>>),
{
    let mut out = Song { ppq: song.ppq, tracks: vec![Vec::new(); song.tracks.len()] };
    for ev in song.events() {
        f(&ev, &mut out.tracks[ev.track]);
    }
    for (track, tr) in song.tracks.iter().enumerate() {
        if let Some(end) = tr.iter().rev().find(|ev| ev.is_end_of_track()) {
            out.tracks[track].push(*end);
        }
    }
    out
}

/// Drop controller and program changes.
pub fn remove_redundant_events<'a>(song: &Song<'a>) -> Song<'a> {
    rebuild(song, |ev, tr| {
        if !matches!(
            ev.kind,
            TrackEventKind::Midi { message: MidiMessage::Controller { .. } | MidiMessage::ProgramChange { .. }, .. }
        ) {
            tr.push(Timed::new(ev.tick, ev.kind));
        }
    })
}

/// Keep one tempo event per tick: the first one, carrying the value of the last.
pub fn remove_redundant_tempos<'a>(song: &Song<'a>) -> Song<'a> {
    let mut by_tick = BTreeMap::new();
    for ev in song.events() {
        if let TrackEventKind::Meta(MetaMessage::Tempo(t)) = ev.kind {
            by_tick.entry(ev.tick).and_modify(|e: &mut (usize, usize, _)| e.2 = t).or_insert((ev.track, ev.index, t));
        }
    }

    rebuild(song, |ev, tr| match ev.kind {
        TrackEventKind::Meta(MetaMessage::Tempo(_)) => {
            if let Some(&(track, index, t)) = by_tick.get(&ev.tick) {
                if (track, index) == (ev.track, ev.index) {
                    tr.push(Timed::new(ev.tick, TrackEventKind::Meta(MetaMessage::Tempo(t))));
                }
            }
        }
        _ => tr.push(Timed::new(ev.tick, ev.kind)),
    })
}

/// Resolve note-ons for keys that are already sounding.
///
/// Tracking does not count references, so the first note-off of a key always ends it.
/// Under `Restart` a note-off is inserted right before the repeated note-on, unless the
/// note started on this very tick, in which case the repeat is dropped.
pub fn remove_redundant_notes<'a>(song: &Song<'a>, policy: NotePolicy) -> Song<'a> {
    let mut tracker = NoteTracker::new(false);
    rebuild(song, |ev, tr| {
        if let Some(NoteEvent::On { channel, key, .. }) = note_event(&ev.kind) {
            let k = NoteKey::new(channel, key);
            if tracker.is_playing(k) {
                if policy == NotePolicy::Restart && tracker.start_tick(k).is_some_and(|start| ev.tick > start) {
                    tr.push(Timed::new(ev.tick, note_off(channel, key)));
                    tr.push(Timed::new(ev.tick, ev.kind));
                    tracker.restart(k, ev.tick, ev.track);
                }
                return;
            }
        }
        tracker.handle(ev.tick, ev.track, &ev.kind);
        tr.push(Timed::new(ev.tick, ev.kind));
    })
}

/// Within each run of same-tick events of a track, move the note-offs to the front.
pub fn order_note_offs<'a>(song: &Song<'a>) -> Song<'a> {
    let tracks = song
        .tracks
        .iter()
        .map(|tr| {
            let mut tr = tr.clone();
            for run in tr.chunk_by_mut(|a, b| a.tick == b.tick) {
                run.sort_by_key(|ev| !is_note_off(&ev.kind));
            }
            tr
        })
        .collect();
    Song { ppq: song.ppq, tracks }
}

/// Shift the song so the first note event is at tick 0 and cut everything after the last.
pub fn trim<'a>(song: &Song<'a>) -> Song<'a> {
    let mut first: Option<Tick> = None;
    let mut last: Tick = 0;
    for ev in song.events().filter(|ev| note_event(&ev.kind).is_some()) {
        first.get_or_insert(ev.tick);
        last = ev.tick;
    }
    let first = first.unwrap_or_else(|| {
        warn!("trimming a song without notes, everything collapses to tick 0");
        0
    });
    let length = (last - first).max(0);

    let tracks = song
        .tracks
        .iter()
        .map(|tr| tr.iter().map(|ev| Timed::new((ev.tick - first).clamp(0, length), ev.kind)).collect())
        .collect();
    Song { ppq: song.ppq, tracks }
}
