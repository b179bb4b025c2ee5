//! Builders for synthetic songs used by the unit tests.

use midly::{MetaMessage, MidiMessage, TrackEventKind};

use crate::midi::{NoteEvent, Song, Tick, Timed, note_event};

/// Resolution used by most tests: one beat is four ticks.
pub const PPQ: u16 = 4;

pub fn song(tracks: Vec<Vec<(Tick, TrackEventKind<'static>)>>) -> Song<'static> {
    song_with_ppq(PPQ, tracks)
}

pub fn song_with_ppq(ppq: u16, tracks: Vec<Vec<(Tick, TrackEventKind<'static>)>>) -> Song<'static> {
    Song {
        ppq,
        tracks: tracks
            .into_iter()
            .map(|tr| tr.into_iter().map(|(tick, kind)| Timed::new(tick, kind)).collect())
            .collect(),
    }
}

pub fn on(channel: u8, key: u8) -> TrackEventKind<'static> {
    TrackEventKind::Midi {
        channel: channel.into(),
        message: MidiMessage::NoteOn { key: key.into(), vel: 100.into() },
    }
}

pub fn off(channel: u8, key: u8) -> TrackEventKind<'static> {
    TrackEventKind::Midi {
        channel: channel.into(),
        message: MidiMessage::NoteOff { key: key.into(), vel: 0.into() },
    }
}

pub fn cc(channel: u8, controller: u8, value: u8) -> TrackEventKind<'static> {
    TrackEventKind::Midi {
        channel: channel.into(),
        message: MidiMessage::Controller { controller: controller.into(), value: value.into() },
    }
}

pub fn program(channel: u8, program: u8) -> TrackEventKind<'static> {
    TrackEventKind::Midi {
        channel: channel.into(),
        message: MidiMessage::ProgramChange { program: program.into() },
    }
}

pub fn tempo(us_per_qn: u32) -> TrackEventKind<'static> {
    TrackEventKind::Meta(MetaMessage::Tempo(us_per_qn.into()))
}

/// `denominator_pow` is the SMF encoding: 2 means quarter notes.
pub fn time_sig(numerator: u8, denominator_pow: u8) -> TrackEventKind<'static> {
    TrackEventKind::Meta(MetaMessage::TimeSignature(numerator, denominator_pow, 24, 8))
}

pub fn name(text: &'static str) -> TrackEventKind<'static> {
    TrackEventKind::Meta(MetaMessage::TrackName(text.as_bytes()))
}

pub fn eot() -> TrackEventKind<'static> {
    TrackEventKind::Meta(MetaMessage::EndOfTrack)
}

pub fn ticks_of(song: &Song<'_>, track: usize) -> Vec<Tick> {
    song.tracks[track].iter().map(|ev| ev.tick).collect()
}

/// Every note event of the song in merged order.
pub fn notes(song: &Song<'_>) -> Vec<(Tick, NoteEvent)> {
    song.events().filter_map(|ev| note_event(&ev.kind).map(|n| (ev.tick, n))).collect()
}

pub fn note_ons(song: &Song<'_>) -> usize {
    notes(song).iter().filter(|(_, n)| matches!(n, NoteEvent::On { .. })).count()
}
