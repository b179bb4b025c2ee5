//! Cutting tick ranges out of a song and stitching them into a new one.
//!
//! Each output segment has to play on its own: before the notes of a cut are copied,
//! the tempo, signature and controller events between the previous cut and this one are
//! replayed so the segment starts in the right state.

use std::{collections::BTreeMap, ops::ControlFlow};

use log::debug;

use crate::cleanup::{NotePolicy, order_note_offs, remove_redundant_notes};
use crate::fermata::Window;
use crate::midi::{NoteEvent, Song, Tick, Timed, note_event, note_off};
use crate::notes::{NoteKey, NoteTracker};

/// A tick range selected for an output, with padding around it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cut {
    pub rest_before: Tick,
    pub begin: Tick,
    pub end: Tick,
    pub rest_after: Tick,
    /// Notes may already be sounding at `begin`.
    pub dirty_begin: bool,
    /// Notes sounding at `end` keep sounding through `rest_after`.
    pub dirty_end: bool,
    /// Stop every note at `end`, dirty or not.
    pub all_off_at_end: bool,
}

impl Cut {
    pub fn new(begin: Tick, end: Tick) -> Self {
        Self { begin, end, ..Self::default() }
    }

    pub fn with_rest_after(self, rest_after: Tick) -> Self {
        Self { rest_after, ..self }
    }

    fn contains(&self, tick: Tick) -> bool {
        self.begin <= tick && tick < self.end
    }
}

/// Split cuts at every fermata they contain.
///
/// A fermata splits a cut into the part up to the hold (sustained for `extend` ticks),
/// the release of the chord (followed by `rest` ticks of silence) and whatever follows
/// the release. `windows` must be sorted by hold tick.
pub fn split_fermatas(cuts: &[Cut], windows: &[Window]) -> Vec<Cut> {
    let mut out = Vec::with_capacity(cuts.len());
    for &cut in cuts {
        let mut tail = cut;
        for w in windows {
            let fits = tail.contains(w.hold) && (w.is_open() || w.release <= tail.end);
            if !fits {
                continue;
            }
            debug!("splitting cut {}..{} at fermata {}..{}", tail.begin, tail.end, w.hold, w.release);

            out.push(Cut { end: w.hold, rest_after: w.extend, dirty_end: true, all_off_at_end: false, ..tail });
            if w.is_open() {
                tail.begin = w.hold;
            } else {
                out.push(Cut {
                    rest_before: 0,
                    begin: w.hold,
                    end: w.release,
                    rest_after: w.rest,
                    dirty_begin: true,
                    dirty_end: true,
                    all_off_at_end: true,
                });
                tail.begin = w.release;
            }
            tail.rest_before = 0;
            tail.dirty_begin = true;
        }
        out.push(tail);
    }
    out
}

/// Writes events into the output and keeps track of what it left sounding.
struct Writer<'a> {
    song: Song<'a>,
    sounding: NoteTracker,
}

impl<'a> Writer<'a> {
    fn emit(&mut self, tick: Tick, track: usize, kind: midly::TrackEventKind<'a>) {
        self.sounding.handle(tick, track, &kind);
        self.song.track_mut(track).push(Timed::new(tick, kind));
    }

    /// Turn off every note in `keys` at `tick` on the track that owns it.
    fn release(&mut self, tick: Tick, keys: BTreeMap<NoteKey, usize>) {
        for (key, track) in keys {
            self.emit(tick, track, note_off(key.channel, key.key));
        }
    }
}

/// Build a new song from `cuts` of `source`.
///
/// Output track `i` holds the material of source track `i`. The result has its redundant
/// note-ons resolved with `policy` and note-offs ordered first within each tick.
pub fn resequence<'a>(source: &Song<'a>, cuts: &[Cut], policy: NotePolicy) -> Song<'a> {
    let mut w = Writer { song: Song::new(source.ppq), sounding: NoteTracker::new(false) };
    w.song.track_mut(source.tracks.len().saturating_sub(1));

    let mut out: Tick = 0;
    let mut prev_end: Tick = 0;
    for cut in cuts {
        let window_start = if cut.begin < prev_end { 0 } else { prev_end };
        let offset = out + cut.rest_before - cut.begin;

        // Notes the source had sounding at `begin`; a dirty begin may have to close them.
        let mut source_notes = NoteTracker::new(true);
        let mut inherited: BTreeMap<NoteKey, usize> = BTreeMap::new();
        let mut entered = false;

        source.visit(|ev| {
            if ev.tick >= cut.end {
                return ControlFlow::Break(());
            }
            if ev.tick >= cut.begin && !entered {
                entered = true;
                if cut.dirty_begin {
                    inherited = playing_with_owner(&source_notes);
                }
            }

            let note = note_event(&ev.kind);
            if ev.tick < cut.begin {
                source_notes.handle(ev.tick, ev.track, &ev.kind);
                if ev.tick >= window_start && !matches!(note, Some(NoteEvent::On { .. })) {
                    w.emit(out, ev.track, ev.kind);
                }
                return ControlFlow::Continue(());
            }

            if let Some(NoteEvent::Off { channel, key }) = note {
                let key = NoteKey::new(channel, key);
                if !w.sounding.is_playing(key) {
                    inherited.remove(&key);
                }
            }
            w.emit(ev.tick + offset, ev.track, ev.kind);
            ControlFlow::Continue(())
        });
        if !entered && cut.dirty_begin {
            inherited = playing_with_owner(&source_notes);
        }

        out += cut.rest_before + (cut.end - cut.begin).max(0);
        if !cut.dirty_end || cut.all_off_at_end {
            let mut stop = playing_with_owner(&w.sounding);
            for (key, track) in inherited {
                stop.entry(key).or_insert(track);
            }
            w.release(out, stop);
        }
        out += cut.rest_after;
        prev_end = cut.end;
    }

    w.song.close_tracks(out);
    let song = remove_redundant_notes(&w.song, policy);
    order_note_offs(&song)
}

fn playing_with_owner(tracker: &NoteTracker) -> BTreeMap<NoteKey, usize> {
    tracker
        .notes_playing()
        .into_iter()
        .filter_map(|key| tracker.owning_track(key).map(|track| (key, track)))
        .collect()
}
