//! Channel remapping for organ registration.
//!
//! All channel messages of a song are moved onto the primary channel of the organ.
//! Tracks that carry the melody or the bass can additionally be copied onto their own
//! channel, so that a separate manual or the pedal can double them.

use midly::{MetaMessage, TrackEventKind, num::u4};
use regex::Regex;

use crate::error::{Error, Result};
use crate::midi::{Song, Timed};

const MAX_CHANNEL: u8 = 15;

/// Which source tracks a coupler applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackSelector {
    /// Explicit track indices.
    Tracks(Vec<usize>),
    /// Regex matched against each track's name.
    Name(String),
}

impl TrackSelector {
    /// Indices of the tracks of `song` this selector picks.
    pub fn resolve(&self, song: &Song<'_>) -> Result<Vec<usize>> {
        match self {
            TrackSelector::Tracks(indices) => Ok(indices.clone()),
            TrackSelector::Name(pattern) => {
                let re = Regex::new(pattern)
                    .map_err(|source| Error::BadPattern { pattern: pattern.clone(), source })?;
                Ok((0..song.tracks.len())
                    .filter(|&i| track_name(song, i).is_some_and(|name| re.is_match(&name)))
                    .collect())
            }
        }
    }
}

/// The name of a track, from its first `TrackName` meta event.
pub fn track_name(song: &Song<'_>, track: usize) -> Option<String> {
    song.tracks.get(track)?.iter().find_map(|ev| match ev.kind {
        TrackEventKind::Meta(MetaMessage::TrackName(name)) => Some(String::from_utf8_lossy(name).into_owned()),
        _ => None,
    })
}

/// A set of tracks doubled onto an extra channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coupler {
    pub selector: TrackSelector,
    pub channel: Option<u8>,
}

/// Channel layout of the output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelMap {
    pub channel: u8,
    pub melody: Option<Coupler>,
    pub bass: Option<Coupler>,
}

/// A coupler with its selector already resolved against the source song.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Doubling {
    pub tracks: Vec<usize>,
    pub channel: u8,
}

impl ChannelMap {
    /// Resolve the couplers against `source`. Couplers without a channel, or with the
    /// primary channel, double nothing and are left out.
    ///
    /// Fails with `BadChannel` if the primary or a coupler channel is not a MIDI channel.
    pub fn doublings(&self, source: &Song<'_>) -> Result<Vec<Doubling>> {
        let couplers = [&self.melody, &self.bass];
        let channels = couplers.iter().flat_map(|c| c.iter()).filter_map(|c| c.channel);
        if let Some(bad) = std::iter::once(self.channel).chain(channels).find(|&c| c > MAX_CHANNEL) {
            return Err(Error::BadChannel(bad));
        }

        let mut out = Vec::new();
        for coupler in couplers.into_iter().flatten() {
            let Some(channel) = coupler.channel.filter(|&c| c != self.channel) else {
                continue;
            };
            out.push(Doubling { tracks: coupler.selector.resolve(source)?, channel });
        }
        Ok(out)
    }
}

fn with_channel<'a>(kind: TrackEventKind<'a>, channel: u8) -> TrackEventKind<'a> {
    let ch = u4::new(channel);
    match kind {
        TrackEventKind::Midi { message, .. } => TrackEventKind::Midi { channel: ch, message },
        TrackEventKind::Meta(MetaMessage::MidiChannel(_)) => TrackEventKind::Meta(MetaMessage::MidiChannel(ch)),
        other => other,
    }
}

/// Move every channel message of `song` onto `channel`, then append one track per
/// doubling carrying the channel messages of the selected tracks on the doubling's
/// channel.
///
/// Channels are taken modulo 16; `ChannelMap::doublings` rejects anything larger.
pub fn remap_channels<'a>(song: &Song<'a>, channel: u8, doublings: &[Doubling]) -> Song<'a> {
    let mut out = Song {
        ppq: song.ppq,
        tracks: song
            .tracks
            .iter()
            .map(|tr| tr.iter().map(|ev| Timed::new(ev.tick, with_channel(ev.kind, channel))).collect())
            .collect(),
    };

    for d in doublings {
        let mut copy: Vec<Timed<'a>> = d
            .tracks
            .iter()
            .filter_map(|&i| song.tracks.get(i))
            .flatten()
            .filter(|ev| matches!(ev.kind, TrackEventKind::Midi { .. }))
            .map(|ev| Timed::new(ev.tick, with_channel(ev.kind, d.channel)))
            .collect();
        copy.sort_by_key(|ev| ev.tick);

        let end = d.tracks.iter().filter_map(|&i| song.tracks.get(i)).flatten().map(|ev| ev.tick).max().unwrap_or(0);
        copy.push(Timed::end_of_track(end));
        out.tracks.push(copy);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{NoteEvent, note_event};
    use crate::testing::*;

    fn channels(song: &Song<'_>) -> Vec<u8> {
        let mut chans: Vec<u8> = song
            .events()
            .filter_map(|ev| match ev.kind {
                TrackEventKind::Midi { channel, .. } => Some(channel.as_int()),
                _ => None,
            })
            .collect();
        chans.sort();
        chans.dedup();
        chans
    }

    #[test]
    fn everything_lands_on_the_target_channel() {
        let s = song(vec![
            vec![(0, time_sig(3, 2)), (0, on(0, 60)), (4, off(0, 60))],
            vec![
                (0, TrackEventKind::Meta(MetaMessage::MidiChannel(3.into()))),
                (0, program(3, 19)),
                (0, on(3, 48)),
                (4, off(3, 48)),
            ],
        ]);
        let out = remap_channels(&s, 5, &[]);
        assert_eq!(channels(&out), vec![5]);
        assert_eq!(out.tracks[0][0].kind, time_sig(3, 2));
        assert_eq!(out.tracks[1][0].kind, TrackEventKind::Meta(MetaMessage::MidiChannel(5.into())));
        assert_eq!(out.tracks.len(), 2);
    }

    #[test]
    fn melody_is_doubled_on_its_own_channel() {
        let s = song(vec![
            vec![(0, name("Soprano")), (0, tempo(500_000)), (0, on(0, 72)), (4, off(0, 72)), (6, eot())],
            vec![(0, name("Bass")), (0, on(1, 40)), (4, off(1, 40))],
        ]);
        let map = ChannelMap {
            channel: 0,
            melody: Some(Coupler { selector: TrackSelector::Name("(?i)^sop".into()), channel: Some(2) }),
            bass: Some(Coupler { selector: TrackSelector::Tracks(vec![1]), channel: Some(0) }),
        };
        let doublings = map.doublings(&s).unwrap();
        assert_eq!(doublings, vec![Doubling { tracks: vec![0], channel: 2 }]);

        let out = remap_channels(&s, map.channel, &doublings);
        assert_eq!(out.tracks.len(), 3);
        let doubled: Vec<_> = out.tracks[2].iter().map(|ev| (ev.tick, note_event(&ev.kind))).collect();
        assert_eq!(
            doubled,
            vec![
                (0, Some(NoteEvent::On { channel: 2, key: 72, vel: 100 })),
                (4, Some(NoteEvent::Off { channel: 2, key: 72 })),
                (6, None),
            ]
        );
        assert_eq!(channels(&out), vec![0, 2]);
    }

    #[test]
    fn bad_pattern_is_reported() {
        let s = song(vec![vec![(0, name("Soprano"))]]);
        let err = TrackSelector::Name("(".into()).resolve(&s).unwrap_err();
        assert!(matches!(err, Error::BadPattern { ref pattern, .. } if pattern == "("));
    }

    #[test]
    fn unset_coupler_channel_doubles_nothing() {
        let s = song(vec![vec![(0, on(0, 60))]]);
        let map = ChannelMap {
            channel: 0,
            melody: Some(Coupler { selector: TrackSelector::Tracks(vec![0]), channel: None }),
            bass: None,
        };
        assert!(map.doublings(&s).unwrap().is_empty());
        assert_eq!(track_name(&s, 0), None);
    }

    #[test]
    fn channels_past_fifteen_are_rejected() {
        let s = song(vec![vec![(0, on(0, 60))]]);
        let primary = ChannelMap { channel: 16, ..ChannelMap::default() };
        assert!(matches!(primary.doublings(&s), Err(Error::BadChannel(16))));

        let coupler = ChannelMap {
            channel: 0,
            melody: None,
            bass: Some(Coupler { selector: TrackSelector::Tracks(vec![0]), channel: Some(200) }),
        };
        assert!(matches!(coupler.doublings(&s), Err(Error::BadChannel(200))));
    }
}
