//! midi.rs
//!
//! This module turns a parsed Standard MIDI File (SMF) into a `Song`: the same tracks,
//! but with every event stamped with its absolute tick instead of a delta. Everything
//! else in the crate works on `Song`s and only converts back to `Smf` at the very end.
//!
//! ### Quick primer on SMF timing
//! - Each track is a list of (delta, message) pairs. The delta is the number of ticks
//!   since the previous event *on the same track*.
//! - Ticks are only comparable across tracks once the deltas are accumulated, which is
//!   what `Song::from_smf` does.
//! - The header's pulses-per-quarter-note (PPQ) says how many ticks one quarter note lasts.
//!
//! This module takes care of:
//!  - Accumulating deltas into absolute ticks, and back
//!  - Normalizing NoteOn with velocity=0 into a note-off
//!  - Merging all tracks into one chronological event stream (`Song::events`, `Song::visit`)

use std::ops::ControlFlow;

use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind,
    num::{u15, u28},
};

use crate::error::{Error, Result};

/// Absolute time in ticks.
pub type Tick = i64;

/// A track event tied to an absolute tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timed<'a> {
    pub tick: Tick,
    pub kind: TrackEventKind<'a>,
}

impl<'a> Timed<'a> {
    pub fn new(tick: Tick, kind: TrackEventKind<'a>) -> Self {
        Self { tick, kind }
    }

    pub fn end_of_track(tick: Tick) -> Self {
        Self::new(tick, TrackEventKind::Meta(MetaMessage::EndOfTrack))
    }

    pub fn is_end_of_track(&self) -> bool {
        matches!(self.kind, TrackEventKind::Meta(MetaMessage::EndOfTrack))
    }
}

/// One event of the merged timeline.
///
/// `index` is the position of the event inside its own track, so passes that walk the
/// merged stream can point back at the event they want to change.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Event<'a> {
    pub tick: Tick,
    pub track: usize,
    pub index: usize,
    pub kind: TrackEventKind<'a>,
}

/// The note part of a channel message, with NoteOn velocity=0 folded into `Off`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoteEvent {
    On { channel: u8, key: u8, vel: u8 },
    Off { channel: u8, key: u8 },
}

impl NoteEvent {
    pub fn channel(&self) -> u8 {
        match *self {
            NoteEvent::On { channel, .. } | NoteEvent::Off { channel, .. } => channel,
        }
    }

    pub fn key(&self) -> u8 {
        match *self {
            NoteEvent::On { key, .. } | NoteEvent::Off { key, .. } => key,
        }
    }
}

/// Classify an event as a note start or note stop.
pub fn note_event(kind: &TrackEventKind<'_>) -> Option<NoteEvent> {
    let TrackEventKind::Midi { channel, message } = *kind else {
        return None;
    };
    let channel = channel.as_int();
    match message {
        // NoteOn with velocity=0 is equivalent to NoteOff
        MidiMessage::NoteOn { key, vel } if vel.as_int() == 0 => {
            Some(NoteEvent::Off { channel, key: key.as_int() })
        }
        MidiMessage::NoteOn { key, vel } => Some(NoteEvent::On {
            channel,
            key: key.as_int(),
            vel: vel.as_int(),
        }),
        MidiMessage::NoteOff { key, .. } => Some(NoteEvent::Off { channel, key: key.as_int() }),
        _ => None,
    }
}

pub fn is_note_on(kind: &TrackEventKind<'_>) -> bool {
    matches!(note_event(kind), Some(NoteEvent::On { .. }))
}

pub fn is_note_off(kind: &TrackEventKind<'_>) -> bool {
    matches!(note_event(kind), Some(NoteEvent::Off { .. }))
}

/// A note-off message ready to be placed in a track.
pub fn note_off<'a>(channel: u8, key: u8) -> TrackEventKind<'a> {
    TrackEventKind::Midi {
        channel: channel.into(),
        message: MidiMessage::NoteOff { key: key.into(), vel: 0.into() },
    }
}

/// A multi-track performance with absolute ticks.
///
/// Tracks are kept sorted by tick. An `EndOfTrack` event, when present, is the last
/// event of its track and marks the track's length.
#[derive(Clone, Debug, PartialEq)]
pub struct Song<'a> {
    /// Pulses per quarter note (from header)
    pub ppq: u16,
    pub tracks: Vec<Vec<Timed<'a>>>,
}

impl<'a> Song<'a> {
    pub fn new(ppq: u16) -> Self {
        Self { ppq, tracks: Vec::new() }
    }

    /// Accumulate every track's deltas into absolute ticks.
    ///
    /// SMPTE timecode files have no notion of beats, so they are rejected.
    pub fn from_smf(smf: &Smf<'a>) -> Result<Self> {
        let ppq = match smf.header.timing {
            Timing::Metrical(t) => t.as_int(),
            Timing::Timecode(..) => return Err(Error::UnsupportedTiming),
        };

        let tracks = smf
            .tracks
            .iter()
            .map(|tr| {
                let mut abs_ticks: Tick = 0;
                tr.iter()
                    .map(|ev| {
                        abs_ticks += Tick::from(ev.delta.as_int());
                        Timed::new(abs_ticks, ev.kind)
                    })
                    .collect()
            })
            .collect();

        Ok(Self { ppq, tracks })
    }

    /// Convert back to delta times. Every track ends with exactly one `EndOfTrack`.
    pub fn to_smf(&self) -> Smf<'a> {
        let format = if self.tracks.len() <= 1 { Format::SingleTrack } else { Format::Parallel };
        let header = Header::new(format, Timing::Metrical(u15::new(self.ppq)));

        let tracks = self
            .tracks
            .iter()
            .map(|tr| {
                let mut out: Vec<TrackEvent<'a>> = Vec::with_capacity(tr.len() + 1);
                let mut last: Tick = 0;
                for ev in tr.iter().filter(|ev| !ev.is_end_of_track()) {
                    push(&mut out, ev.tick - last, ev.kind);
                    last = last.max(ev.tick);
                }
                let end = track_end(tr).max(last);
                push(&mut out, end - last, TrackEventKind::Meta(MetaMessage::EndOfTrack));
                out
            })
            .collect();

        Smf { header, tracks }
    }

    /// Borrow a track for writing, growing the track list if it does not exist yet.
    pub fn track_mut(&mut self, track: usize) -> &mut Vec<Timed<'a>> {
        if self.tracks.len() <= track {
            self.tracks.resize_with(track + 1, Vec::new);
        }
        &mut self.tracks[track]
    }

    /// Tick of the last event of any track, `EndOfTrack` markers included.
    pub fn end_tick(&self) -> Tick {
        self.tracks.iter().map(|tr| track_end(tr)).max().unwrap_or(0)
    }

    /// Append an `EndOfTrack` at `tick` to every track that does not have one yet.
    pub fn close_tracks(&mut self, tick: Tick) {
        for tr in &mut self.tracks {
            if !tr.last().is_some_and(Timed::is_end_of_track) {
                let end = track_end(tr).max(tick);
                tr.push(Timed::end_of_track(end));
            }
        }
    }

    /// The merged timeline, lazily.
    pub fn events(&self) -> Events<'_, 'a> {
        Events { tracks: &self.tracks, cursors: vec![0; self.tracks.len()] }
    }

    /// Push-style traversal of the merged timeline.
    ///
    /// The callback returns `ControlFlow::Break(())` to stop early; no further events are
    /// produced after that.
    pub fn visit<F>(&self, mut f: F)
    where
        F: FnMut(&Event<'a>) -> ControlFlow<()>,
    {
        for ev in self.events() {
            if f(&ev).is_break() {
                break;
            }
        }
    }
}

fn track_end(track: &[Timed<'_>]) -> Tick {
    track.iter().map(|ev| ev.tick).max().unwrap_or(0)
}

fn push<'a>(track: &mut Vec<TrackEvent<'a>>, delta: Tick, kind: TrackEventKind<'a>) {
    let delta = u28::new(delta.max(0) as u32);
    track.push(TrackEvent { delta, kind });
}

/// K-way merge over the tracks of a `Song`.
///
/// At each step the globally earliest pending event is yielded; ties go to the lower
/// track index, and events of one track keep their order. `EndOfTrack` markers are
/// skipped.
pub struct Events<'s, 'a> {
    tracks: &'s [Vec<Timed<'a>>],
    cursors: Vec<usize>,
}

impl<'a> Iterator for Events<'_, 'a> {
    type Item = Event<'a>;

    fn next(&mut self) -> Option<Event<'a>> {
        let mut best: Option<(Tick, usize)> = None;
        for (track, tr) in self.tracks.iter().enumerate() {
            let cursor = &mut self.cursors[track];
            while tr.get(*cursor).is_some_and(Timed::is_end_of_track) {
                *cursor += 1;
            }
            let Some(ev) = tr.get(*cursor) else { continue };
            if best.is_none_or(|(tick, _)| ev.tick < tick) {
                best = Some((ev.tick, track));
            }
        }

        let (tick, track) = best?;
        let index = self.cursors[track];
        self.cursors[track] += 1;
        Some(Event { tick, track, index, kind: self.tracks[track][index].kind })
    }
}
