//! Which notes are sounding at the current point of the merged timeline.

use std::collections::BTreeMap;

use midly::TrackEventKind;

use crate::midi::{NoteEvent, Tick, note_event};

/// Identifies one sounding note regardless of velocity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NoteKey {
    pub channel: u8,
    pub key: u8,
}

impl NoteKey {
    pub fn new(channel: u8, key: u8) -> Self {
        Self { channel, key }
    }
}

impl From<NoteEvent> for NoteKey {
    fn from(ev: NoteEvent) -> Self {
        Self::new(ev.channel(), ev.key())
    }
}

#[derive(Clone, Copy, Debug)]
struct Sounding {
    track: usize,
    start: Tick,
    count: u32,
}

/// Note on/off state tracker.
///
/// In counting mode overlapping note-ons of the same key nest, and the key only stops
/// once as many note-offs have arrived. Otherwise the first note-off ends the note.
#[derive(Clone, Debug, Default)]
pub struct NoteTracker {
    counting: bool,
    notes: BTreeMap<NoteKey, Sounding>,
}

impl NoteTracker {
    pub fn new(counting: bool) -> Self {
        Self { counting, notes: BTreeMap::new() }
    }

    /// Feed one event.
    ///
    /// Returns whether the event changed the key's sounding state (a note started from
    /// silence, or its last reference stopped) and the track that owns the note. Events
    /// that are not notes return `(false, track)`.
    pub fn handle(&mut self, tick: Tick, track: usize, kind: &TrackEventKind<'_>) -> (bool, usize) {
        let Some(ev) = note_event(kind) else {
            return (false, track);
        };
        let key = NoteKey::from(ev);

        match ev {
            NoteEvent::On { .. } => match self.notes.get_mut(&key) {
                Some(s) => {
                    if self.counting {
                        s.count += 1;
                    }
                    (false, s.track)
                }
                None => {
                    self.notes.insert(key, Sounding { track, start: tick, count: 1 });
                    (true, track)
                }
            },
            NoteEvent::Off { .. } => match self.notes.get_mut(&key) {
                Some(s) => {
                    let owner = s.track;
                    s.count = s.count.saturating_sub(1);
                    if !self.counting || s.count == 0 {
                        self.notes.remove(&key);
                        (true, owner)
                    } else {
                        (false, owner)
                    }
                }
                // already off
                None => (false, track),
            },
        }
    }

    /// Mark a note as started at `tick`, replacing any previous state for the key.
    pub fn restart(&mut self, key: NoteKey, tick: Tick, track: usize) {
        self.notes.insert(key, Sounding { track, start: tick, count: 1 });
    }

    pub fn stop(&mut self, key: NoteKey) {
        self.notes.remove(&key);
    }

    pub fn playing(&self) -> bool {
        !self.notes.is_empty()
    }

    /// Sounding keys, sorted by (channel, pitch).
    pub fn notes_playing(&self) -> Vec<NoteKey> {
        self.notes.keys().copied().collect()
    }

    pub fn is_playing(&self, key: NoteKey) -> bool {
        self.notes.contains_key(&key)
    }

    pub fn start_tick(&self, key: NoteKey) -> Option<Tick> {
        self.notes.get(&key).map(|s| s.start)
    }

    pub fn owning_track(&self, key: NoteKey) -> Option<usize> {
        self.notes.get(&key).map(|s| s.track)
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    #[test]
    fn counting_mode_needs_matching_offs() {
        let mut t = NoteTracker::new(true);
        assert_eq!(t.handle(0, 0, &on(0, 60)), (true, 0));
        assert_eq!(t.handle(2, 1, &on(0, 60)), (false, 0));
        assert_eq!(t.handle(4, 1, &off(0, 60)), (false, 0));
        assert!(t.is_playing(NoteKey::new(0, 60)));
        assert_eq!(t.handle(6, 0, &off(0, 60)), (true, 0));
        assert!(!t.playing());
        // already off
        assert_eq!(t.handle(8, 0, &off(0, 60)), (false, 0));
    }

    #[test]
    fn plain_mode_first_off_wins_and_owner_sticks() {
        let mut t = NoteTracker::new(false);
        assert_eq!(t.handle(0, 3, &on(1, 50)), (true, 3));
        assert_eq!(t.handle(1, 5, &on(1, 50)), (false, 3));
        assert_eq!(t.owning_track(NoteKey::new(1, 50)), Some(3));
        assert_eq!(t.start_tick(NoteKey::new(1, 50)), Some(0));
        assert_eq!(t.handle(2, 5, &off(1, 50)), (true, 3));
        assert!(!t.playing());
    }

    #[test]
    fn notes_playing_is_sorted_by_channel_then_pitch() {
        let mut t = NoteTracker::new(false);
        for (ch, key) in [(2, 10), (0, 70), (2, 5), (0, 60)] {
            t.handle(0, 0, &on(ch, key));
        }
        assert_eq!(
            t.notes_playing(),
            vec![NoteKey::new(0, 60), NoteKey::new(0, 70), NoteKey::new(2, 5), NoteKey::new(2, 10)]
        );
    }

    #[test]
    fn activations_are_conserved_over_a_sequence() {
        let events = [on(0, 60), on(0, 60), on(0, 62), off(0, 60), off(0, 62), off(0, 60)];
        let mut t = NoteTracker::new(true);
        let mut started = 0;
        let mut stopped = 0;
        for (i, ev) in events.iter().enumerate() {
            let (changed, _) = t.handle(i as Tick, 0, ev);
            if changed {
                if is_on(ev) { started += 1 } else { stopped += 1 }
            }
        }
        assert_eq!(started, 2);
        assert_eq!(stopped, 2);
        assert!(!t.playing());
    }

    fn is_on(kind: &TrackEventKind<'_>) -> bool {
        crate::midi::is_note_on(kind)
    }
}
