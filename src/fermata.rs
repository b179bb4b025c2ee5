//! Finding silent instants and fermata hold/release windows.
//!
//! Both scans walk the merged timeline one tick at a time. Within a tick the note-offs
//! are applied before everything else, so a boundary where one chord ends and the next
//! begins on the same tick counts as silent.

use std::iter::Peekable;

use log::debug;

use crate::error::{Error, Result};
use crate::midi::{Event, Events, Song, Tick, is_note_off};
use crate::notes::{NoteKey, NoteTracker};

/// A fermata as configured: where it is and how much time to add.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fermata {
    pub anchor: Tick,
    /// Extra ticks the held chord is sustained.
    pub extend: Tick,
    /// Silence inserted after the chord is released.
    pub rest: Tick,
}

/// Where a fermata's notes are held and where the music resumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub hold: Tick,
    /// -1 when nothing is played after the fermata.
    pub release: Tick,
    pub extend: Tick,
    pub rest: Tick,
}

impl Window {
    pub fn is_open(&self) -> bool {
        self.release < 0
    }
}

impl Fermata {
    pub fn window(&self, song: &Song<'_>) -> Result<Window> {
        let (hold, release) = fermata_window(song, self.anchor)?;
        debug!("fermata at {}: hold {hold}, release {release}", self.anchor);
        Ok(Window { hold, release, extend: self.extend, rest: self.rest })
    }
}

/// Merged events bunched by tick.
struct TickGroups<'s, 'a> {
    events: Peekable<Events<'s, 'a>>,
}

impl<'a> Iterator for TickGroups<'_, 'a> {
    type Item = (Tick, Vec<Event<'a>>);

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.events.next()?;
        let tick = first.tick;
        let mut group = vec![first];
        while let Some(ev) = self.events.next_if(|ev| ev.tick == tick) {
            group.push(ev);
        }
        Some((tick, group))
    }
}

fn tick_groups<'s, 'a>(song: &'s Song<'a>) -> TickGroups<'s, 'a> {
    TickGroups { events: song.events().peekable() }
}

fn apply_offs(tracker: &mut NoteTracker, group: &[Event<'_>]) {
    for ev in group.iter().filter(|ev| is_note_off(&ev.kind)) {
        tracker.handle(ev.tick, ev.track, &ev.kind);
    }
}

fn apply_rest(tracker: &mut NoteTracker, group: &[Event<'_>]) {
    for ev in group.iter().filter(|ev| !is_note_off(&ev.kind)) {
        tracker.handle(ev.tick, ev.track, &ev.kind);
    }
}

/// Nearest tick to `target` at which no note is sustained across, at most `radius` away.
pub fn adjust_tick(song: &Song<'_>, target: Tick, radius: Tick) -> Result<Tick> {
    let mut tracker = NoteTracker::new(true);
    let mut best: Option<Tick> = None;
    let mut consider = |candidate: Tick| {
        if best.is_none_or(|b| (candidate - target).abs() < (b - target).abs()) {
            best = Some(candidate);
        }
    };

    // Silent stretches are [since, tick]; before the first note the song is silent.
    let mut silent_since: Option<Tick> = Some(0);
    for (tick, group) in tick_groups(song) {
        apply_offs(&mut tracker, &group);
        if !tracker.playing() && silent_since.is_none() {
            silent_since = Some(tick);
        }
        apply_rest(&mut tracker, &group);
        if tracker.playing() {
            if let Some(since) = silent_since.take() {
                consider(if target < since {
                    since
                } else if target > tick {
                    tick
                } else {
                    target
                });
            }
        }
        if tick > target + radius {
            break;
        }
    }
    if let Some(since) = silent_since {
        consider(since.max(target));
    }

    match best {
        Some(b) if (b - target).abs() <= radius => Ok(b),
        _ => Err(Error::NoSilentTick { tick: target, best, radius }),
    }
}

enum State {
    Before,
    Holding(Vec<NoteKey>),
    Waiting,
}

/// Hold and release ticks of the fermata anchored at `anchor`.
///
/// The chord sounding at the first event at or after the anchor is the fermata chord.
/// `hold` is the tick where the first of its notes is released; `release` is the first
/// tick after all of them stopped where something sounds again, or -1 if the song ends
/// first.
pub fn fermata_window(song: &Song<'_>, anchor: Tick) -> Result<(Tick, Tick)> {
    let mut tracker = NoteTracker::new(true);
    let mut state = State::Before;
    let mut hold: Option<Tick> = None;
    let mut release: Option<Tick> = None;
    let mut last: Tick = anchor;

    for (tick, group) in tick_groups(song) {
        last = tick;
        apply_offs(&mut tracker, &group);
        if let State::Holding(chord) = &state {
            if hold.is_none() && chord.iter().any(|k| !tracker.is_playing(*k)) {
                hold = Some(tick);
            }
            if chord.iter().all(|k| !tracker.is_playing(*k)) {
                state = State::Waiting;
            }
        }
        apply_rest(&mut tracker, &group);

        match state {
            State::Before if tick >= anchor => {
                let chord = tracker.notes_playing();
                if chord.is_empty() {
                    hold = Some(tick);
                    state = State::Waiting;
                } else {
                    state = State::Holding(chord);
                }
            }
            State::Waiting if tracker.playing() => {
                release = Some(tick);
                break;
            }
            _ => {}
        }
    }

    if matches!(state, State::Before) {
        return Err(Error::FermataOutOfRange(anchor));
    }
    let release = release.unwrap_or(-1);
    let mut hold = hold.unwrap_or(last);
    if hold == release {
        hold -= 1;
    }
    Ok((hold, release))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    /// Two voices in 4/4 with 4 ticks per beat. Both hold a half-note chord from 16 to 24
    /// and move on together at 24.
    fn chorale() -> Song<'static> {
        song(vec![
            vec![
                (0, on(0, 60)),
                (8, off(0, 60)),
                (8, on(0, 62)),
                (16, off(0, 62)),
                (16, on(0, 64)),
                (24, off(0, 64)),
                (24, on(0, 65)),
                (32, off(0, 65)),
            ],
            vec![(0, on(1, 48)), (16, off(1, 48)), (16, on(1, 43)), (24, off(1, 43)), (24, on(1, 41)), (32, off(1, 41))],
        ])
    }

    #[test]
    fn legato_boundary_is_silent() {
        assert_eq!(adjust_tick(&chorale(), 16, 0).unwrap(), 16);
        assert_eq!(adjust_tick(&chorale(), 0, 0).unwrap(), 0);
    }

    #[test]
    fn adjust_finds_the_nearest_boundary() {
        let s = chorale();
        assert_eq!(adjust_tick(&s, 13, 4).unwrap(), 16);
        assert_eq!(adjust_tick(&s, 18, 4).unwrap(), 16);
        assert_eq!(adjust_tick(&s, 40, 10).unwrap(), 40);
        // equally far from 16 and 24: the earlier one wins
        assert_eq!(adjust_tick(&s, 20, 4).unwrap(), 16);
    }

    #[test]
    fn adjust_reports_exhausted_radius() {
        let s = song(vec![vec![(0, on(0, 60)), (100, off(0, 60))]]);
        match adjust_tick(&s, 50, 10) {
            Err(Error::NoSilentTick { tick, best, radius }) => {
                assert_eq!((tick, radius), (50, 10));
                assert_eq!(best, Some(0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn simultaneous_release_and_restart_backs_hold_off_by_one() {
        let (hold, release) = fermata_window(&chorale(), 16).unwrap();
        assert_eq!((hold, release), (23, 24));
    }

    #[test]
    fn staggered_release() {
        // The bass lets go at 20, the melody at 24, the next chord comes at 26.
        let s = song(vec![
            vec![(16, on(0, 64)), (24, off(0, 64)), (26, on(0, 65)), (30, off(0, 65))],
            vec![(16, on(1, 43)), (20, off(1, 43))],
        ]);
        let (hold, release) = fermata_window(&s, 16).unwrap();
        assert_eq!((hold, release), (20, 26));
        assert!(hold >= 16 && hold <= release);
    }

    #[test]
    fn anchor_between_events_uses_the_next_chord() {
        let (hold, release) = fermata_window(&chorale(), 13).unwrap();
        assert_eq!((hold, release), (23, 24));
    }

    #[test]
    fn final_fermata_is_open_ended() {
        let (hold, release) = fermata_window(&chorale(), 24).unwrap();
        assert_eq!((hold, release), (32, -1));
    }

    #[test]
    fn anchor_past_the_end_is_an_error() {
        assert!(matches!(fermata_window(&chorale(), 40), Err(Error::FermataOutOfRange(40))));
    }

    #[test]
    fn window_carries_padding() {
        let w = Fermata { anchor: 16, extend: 4, rest: 2 }.window(&chorale()).unwrap();
        assert_eq!(w, Window { hold: 23, release: 24, extend: 4, rest: 2 });
        assert!(!w.is_open());
    }
}
