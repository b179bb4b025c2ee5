//! The output assembler: from one hymn recording to the set of files the service
//! player needs.
//!
//! - `Prelude`: selected ranges of the hymn, played before the singing starts
//! - `Verse`: the whole hymn, repeated for the requested number of verses
//! - `Part(n)`: one verse split at its fermatas, so the organist can wait on each one
//! - `Postlude`: selected ranges played after the last verse
//! - `Panic`: note-offs for every note the hymn uses

use std::{collections::BTreeMap, fmt, str::FromStr};

use log::{debug, warn};
use midly::{MetaMessage, Smf, TrackEventKind, num::u24};

use crate::bars::{Bars, Length, Position};
use crate::channels::{ChannelMap, Coupler, remap_channels};
use crate::cleanup::{NotePolicy, remove_redundant_events, remove_redundant_tempos, trim};
use crate::cut::{Cut, resequence, split_fermatas};
use crate::error::{Error, Result};
use crate::fermata::{Fermata, Window, adjust_tick};
use crate::midi::{Song, Tick, Timed};
use crate::panic_track::all_notes_off;

/// 120 BPM, the SMF default when a file has no tempo event.
const DEFAULT_US_PER_QN: u32 = 500_000;

/// Name of one output of the assembler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputKey {
    Prelude,
    Verse,
    Part(usize),
    Postlude,
    Panic,
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKey::Prelude => f.write_str("prelude"),
            OutputKey::Verse => f.write_str("verse"),
            OutputKey::Part(n) => write!(f, "part-{n:02}"),
            OutputKey::Postlude => f.write_str("postlude"),
            OutputKey::Panic => f.write_str("panic"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TempoOverride {
    /// Play everything at this many quarter notes per minute.
    Bpm(f64),
    /// Multiply every tempo by this factor.
    Scale(f64),
}

/// A fermata as given by the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FermataSpec {
    pub at: Position,
    pub extend: Length,
    pub rest: Length,
}

impl FromStr for FermataSpec {
    type Err = Error;

    /// `POSITION[,EXTEND[,REST]]`, e.g. `2:1,1,1/2`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(',');
        let at = parts.next().unwrap_or_default().parse()?;
        let extend = parts.next().map(str::parse).transpose()?.unwrap_or_default();
        let rest = parts.next().map(str::parse).transpose()?.unwrap_or_default();
        if parts.next().is_some() {
            return Err(Error::BadPosition(s.to_string()));
        }
        Ok(Self { at, extend, rest })
    }
}

/// A range of the hymn, end exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub begin: Position,
    pub end: Position,
}

impl FromStr for Range {
    type Err = Error;

    /// `BEGIN..END`, e.g. `1:1..3:1`.
    fn from_str(s: &str) -> Result<Self> {
        let (begin, end) = s.split_once("..").ok_or_else(|| Error::BadPosition(s.to_string()))?;
        Ok(Self { begin: begin.parse()?, end: end.parse()? })
    }
}

/// Everything the assembler can be told. Unset optional values fall back to defaults at
/// use, so "not given" and "zero" stay distinguishable.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Primary organ channel; channels are left alone when unset.
    pub channel: Option<u8>,
    pub melody: Option<Coupler>,
    pub bass: Option<Coupler>,
    pub policy: NotePolicy,
    pub fermatas: Vec<FermataSpec>,
    pub prelude: Vec<Range>,
    pub postlude: Vec<Range>,
    pub rest_between_verses: Option<Length>,
    pub verses: u32,
    pub tempo: Option<TempoOverride>,
    /// How far a range boundary may move to land on a silent tick. Defaults to an
    /// eighth note.
    pub search_radius: Option<Length>,
    /// Keep controller and program changes.
    pub keep_controls: bool,
}

pub type Outputs<'a> = BTreeMap<OutputKey, Smf<'a>>;

/// Turn one parsed hymn into all of its outputs.
///
/// Any error aborts the whole call; there is no partial result.
pub fn assemble<'a>(smf: &Smf<'a>, opts: &Options) -> Result<Outputs<'a>> {
    let source = Song::from_smf(smf)?;
    let bars = Bars::from_song(&source)?;
    let verse_end = bars.end_tick();
    debug!("{} tracks, {} bars, {verse_end} ticks", source.tracks.len(), bars.len());

    let mut windows = opts
        .fermatas
        .iter()
        .map(|f| {
            let anchor = bars.to_tick(&f.at)?;
            let fermata = Fermata {
                anchor,
                extend: bars.length_ticks(anchor, &f.extend)?,
                rest: bars.length_ticks(anchor, &f.rest)?,
            };
            fermata.window(&source)
        })
        .collect::<Result<Vec<Window>>>()?;
    windows.sort_by_key(|w| w.hold);

    let rest = match &opts.rest_between_verses {
        Some(len) => bars.length_ticks(verse_end, len)?,
        None => 0,
    };

    let doublings = match opts.channel {
        Some(channel) => {
            let map = ChannelMap { channel, melody: opts.melody.clone(), bass: opts.bass.clone() };
            map.doublings(&source)?
        }
        None => {
            if opts.melody.is_some() || opts.bass.is_some() {
                warn!("melody/bass couplers need a primary channel, ignoring them");
            }
            Vec::new()
        }
    };

    let finish = |song: Song<'a>, trimmed: bool| -> Smf<'a> {
        let mut song = if opts.keep_controls { song } else { remove_redundant_events(&song) };
        song = remove_redundant_tempos(&song);
        if trimmed {
            song = trim(&song);
        }
        if let Some(tempo) = opts.tempo {
            song = override_tempo(&song, tempo);
        }
        if let Some(channel) = opts.channel {
            song = remap_channels(&song, channel, &doublings);
        }
        song.to_smf()
    };

    let mut outputs = Outputs::new();

    if !opts.prelude.is_empty() {
        let cuts = range_cuts(&source, &bars, &opts.prelude, opts.search_radius)?;
        let cuts = split_fermatas(&cuts, &windows);
        outputs.insert(OutputKey::Prelude, finish(resequence(&source, &cuts, opts.policy), true));
    }

    if opts.verses > 0 {
        let cuts: Vec<Cut> = (0..opts.verses)
            .map(|v| Cut::new(0, verse_end).with_rest_after(if v + 1 < opts.verses { rest } else { 0 }))
            .collect();
        let cuts = split_fermatas(&cuts, &windows);
        outputs.insert(OutputKey::Verse, finish(resequence(&source, &cuts, opts.policy), false));
    }

    let parts = split_fermatas(&[Cut::new(0, verse_end).with_rest_after(rest)], &windows);
    for (n, cut) in parts.iter().enumerate() {
        debug!("part {n}: {}..{} (+{})", cut.begin, cut.end, cut.rest_after);
        outputs.insert(OutputKey::Part(n), finish(resequence(&source, &[*cut], opts.policy), false));
    }

    if !opts.postlude.is_empty() {
        let cuts = range_cuts(&source, &bars, &opts.postlude, opts.search_radius)?;
        let cuts = split_fermatas(&cuts, &windows);
        outputs.insert(OutputKey::Postlude, finish(resequence(&source, &cuts, opts.policy), true));
    }

    let everything = match opts.channel {
        Some(channel) => remap_channels(&source, channel, &doublings),
        None => source.clone(),
    };
    outputs.insert(OutputKey::Panic, all_notes_off(&everything).to_smf());

    Ok(outputs)
}

/// One cut per range, with both ends moved onto the nearest silent tick.
fn range_cuts(source: &Song<'_>, bars: &Bars, ranges: &[Range], radius: Option<Length>) -> Result<Vec<Cut>> {
    let radius = radius.unwrap_or(Length::notes(1, 8));
    let limit = bars.end_tick();
    let snap = |pos: &Position| -> Result<Tick> {
        let target = bars.to_tick(pos)?;
        adjust_tick(source, target, bars.length_ticks(target, &radius)?)
    };

    ranges
        .iter()
        .map(|r| {
            let (begin, end) = (snap(&r.begin)?, snap(&r.end)?);
            if begin < 0 || begin >= end || end > limit {
                return Err(Error::RangeOutOfBounds { begin, end, limit });
            }
            Ok(Cut::new(begin, end))
        })
        .collect()
}

/// Replace or scale every tempo event. A song without a tempo at tick 0 gets one.
pub fn override_tempo<'a>(song: &Song<'a>, tempo: TempoOverride) -> Song<'a> {
    let factor = match tempo {
        TempoOverride::Bpm(v) | TempoOverride::Scale(v) => v,
    };
    if !(factor.is_finite() && factor > 0.0) {
        warn!("ignoring tempo override {tempo:?}");
        return song.clone();
    }
    let apply = |us_per_qn: u32| -> u24 {
        let us = match tempo {
            TempoOverride::Bpm(bpm) => 60_000_000.0 / bpm,
            TempoOverride::Scale(f) => f64::from(us_per_qn) / f,
        };
        u24::new((us.round() as u32).clamp(1, 0xFF_FFFF))
    };

    let mut out = song.clone();
    let mut at_zero = false;
    for ev in out.tracks.iter_mut().flatten() {
        if let TrackEventKind::Meta(MetaMessage::Tempo(t)) = ev.kind {
            at_zero |= ev.tick == 0;
            ev.kind = TrackEventKind::Meta(MetaMessage::Tempo(apply(t.as_int())));
        }
    }
    if !at_zero {
        let kind = TrackEventKind::Meta(MetaMessage::Tempo(apply(DEFAULT_US_PER_QN)));
        out.track_mut(0).insert(0, Timed::new(0, kind));
    }
    out
}
