//! Bar/beat model: the mapping between musical positions and absolute ticks.
//!
//! The bars are derived from the time-signature meta events of a song. Bars tile the
//! timeline without gaps; a signature change that falls inside a bar truncates that bar,
//! and the last bar is padded up to a whole number of beats so that "one bar past the
//! end" still resolves.

use std::{collections::BTreeMap, fmt, str::FromStr};

use midly::{MetaMessage, TrackEventKind};
use num_rational::Ratio;

use crate::error::{Error, Result};
use crate::midi::{Song, Tick};

/// Longest amount a `Length` may resolve to: the largest SMF delta time.
const MAX_LENGTH: Tick = 0x0FFF_FFFF;

/// One bar of the timeline.
///
/// `numerator`/`denominator` describe the bar as it is actually laid out, which for a
/// truncated bar differs from the signature that was in force (`orig_*`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bar {
    pub begin: Tick,
    pub length: Tick,
    pub numerator: i64,
    pub denominator: i64,
    pub beat_length: Tick,
    pub orig_numerator: u8,
    pub orig_denominator: u32,
}

impl Bar {
    pub fn end(&self) -> Tick {
        self.begin + self.length
    }
}

#[derive(Clone, Copy, Debug)]
struct Signature {
    start: Tick,
    bar_length: Tick,
    beat_length: Tick,
    numerator: u8,
    denominator: u32,
}

impl Signature {
    fn new(start: Tick, ppq: u16, numerator: u8, denominator_pow: u8) -> Result<Self> {
        let denominator = 1u32.checked_shl(u32::from(denominator_pow)).unwrap_or(0);
        let uneven = Error::UnevenBeat { numerator, denominator, ppq };

        let whole = 4 * Tick::from(ppq);
        let den = Tick::from(denominator);
        if whole == 0 || numerator == 0 || den == 0 || whole % den != 0 {
            return Err(uneven);
        }
        let beat_length = whole / den;
        Ok(Self {
            start,
            bar_length: beat_length * Tick::from(numerator),
            beat_length,
            numerator,
            denominator,
        })
    }

    fn bar(&self, begin: Tick, beats: Tick) -> Bar {
        Bar {
            begin,
            length: beats * self.beat_length,
            numerator: beats,
            denominator: Tick::from(self.denominator),
            beat_length: self.beat_length,
            orig_numerator: self.numerator,
            orig_denominator: self.denominator,
        }
    }

    /// A bar cut short by the next signature. Its beat shrinks to the largest length that
    /// divides both the partial length and the signature's beat.
    fn partial_bar(&self, begin: Tick, length: Tick) -> Bar {
        let beats = Ratio::new(length, self.beat_length);
        Bar {
            begin,
            length,
            numerator: *beats.numer(),
            denominator: Tick::from(self.denominator) * beats.denom(),
            beat_length: self.beat_length / beats.denom(),
            orig_numerator: self.numerator,
            orig_denominator: self.denominator,
        }
    }
}

/// The bar sequence of one song.
#[derive(Clone, Debug)]
pub struct Bars {
    ppq: u16,
    bars: Vec<Bar>,
}

impl Bars {
    pub fn from_song(song: &Song<'_>) -> Result<Self> {
        let ppq = song.ppq;
        let end = song.end_tick();

        // Implicit 4/4 at the start; a later definition at the same tick replaces it.
        let mut changes: BTreeMap<Tick, Signature> = BTreeMap::new();
        changes.insert(0, Signature::new(0, ppq, 4, 2)?);
        for tr in &song.tracks {
            for ev in tr {
                if let TrackEventKind::Meta(MetaMessage::TimeSignature(num, den, _, _)) = ev.kind {
                    changes.insert(ev.tick, Signature::new(ev.tick, ppq, num, den)?);
                }
            }
        }
        changes.retain(|&start, _| start == 0 || start < end);
        let changes: Vec<Signature> = changes.into_values().collect();

        let mut bars = Vec::new();
        let mut tick: Tick = 0;
        let mut current = 0;
        loop {
            while changes.get(current + 1).is_some_and(|s| s.start <= tick) {
                current += 1;
            }
            let sig = changes[current];
            let next = changes.get(current + 1).map(|s| s.start);

            let length = next.map_or(sig.bar_length, |n| sig.bar_length.min(n - tick));
            if length < sig.bar_length {
                bars.push(sig.partial_bar(tick, length));
                tick += length;
                continue;
            }

            if tick + sig.bar_length >= end {
                let beats = if end > tick {
                    (end - tick + sig.beat_length - 1) / sig.beat_length
                } else {
                    Tick::from(sig.numerator)
                };
                bars.push(sig.bar(tick, beats));
                break;
            }

            bars.push(sig.bar(tick, Tick::from(sig.numerator)));
            tick += sig.bar_length;
        }

        Ok(Self { ppq, bars })
    }

    pub fn as_slice(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// End of the last bar.
    pub fn end_tick(&self) -> Tick {
        self.bars.last().map_or(0, Bar::end)
    }

    /// Absolute tick of a position. `bar == len() + 1` at beat 1 is the end of the last bar.
    pub fn to_tick(&self, pos: &Position) -> Result<Tick> {
        let out_of_range = || Error::PositionOutOfRange { bar: pos.bar, beat: pos.beat };
        if pos.bar == 0 || pos.beat == 0 {
            return Err(out_of_range());
        }

        let index = (pos.bar - 1) as usize;
        if index == self.bars.len() {
            return if pos.beat == 1 && pos.num == 0 { Ok(self.end_tick()) } else { Err(out_of_range()) };
        }
        let bar = self.bars.get(index).ok_or_else(out_of_range)?;
        if Tick::from(pos.beat) > bar.numerator {
            return Err(out_of_range());
        }
        let fraction = self.fraction(bar, pos.num, pos.den).ok_or_else(out_of_range)?;
        (Tick::from(pos.beat - 1) * bar.beat_length)
            .checked_add(fraction)
            .and_then(|t| t.checked_add(bar.begin))
            .ok_or_else(out_of_range)
    }

    /// Bar index (0-based) and beat offset (0-based, fractional) of a tick.
    pub fn from_tick(&self, tick: Tick) -> Result<(usize, Ratio<Tick>)> {
        let (index, bar) = self
            .bars
            .iter()
            .enumerate()
            .find(|(_, b)| b.begin <= tick && tick < b.end())
            .ok_or(Error::TickOutOfRange(tick))?;
        Ok((index, Ratio::new(tick - bar.begin, bar.beat_length)))
    }

    /// The bar containing `tick`; the end tick itself belongs to the last bar.
    pub fn bar_at(&self, tick: Tick) -> Result<&Bar> {
        match self.from_tick(tick) {
            Ok((index, _)) => Ok(&self.bars[index]),
            Err(e) => match self.bars.last() {
                Some(last) if tick == last.end() => Ok(last),
                _ => Err(e),
            },
        }
    }

    /// Ticks covered by `length` when measured in the bar containing `at`.
    pub fn length_ticks(&self, at: Tick, length: &Length) -> Result<Tick> {
        let bar = self.bar_at(at)?;
        length
            .beats
            .checked_mul(bar.beat_length)
            .zip(self.fraction(bar, length.num, length.den))
            .and_then(|(beats, fraction)| beats.checked_add(fraction))
            .filter(|ticks| (0..=MAX_LENGTH).contains(ticks))
            .ok_or_else(|| Error::BadLength(length.to_string()))
    }

    /// A positive fraction is in beats of `bar`, a negative one counts notes of 1/den.
    /// `None` when the value does not fit a tick.
    fn fraction(&self, bar: &Bar, num: i64, den: i64) -> Option<Tick> {
        if num == 0 || den <= 0 {
            return Some(0);
        }
        let (unit, count) = if num > 0 {
            (bar.beat_length, num)
        } else {
            (4 * Tick::from(self.ppq), num.checked_neg()?)
        };
        Some(Ratio::new(unit.checked_mul(count)?, den).to_integer())
    }
}

/// A symbolic position: 1-based bar and beat plus a fraction of a beat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    pub bar: u32,
    pub beat: u32,
    pub num: i64,
    pub den: i64,
}

impl Position {
    pub fn new(bar: u32, beat: u32) -> Self {
        Self { bar, beat, num: 0, den: 1 }
    }

    pub fn with_fraction(self, num: i64, den: i64) -> Self {
        Self { num, den, ..self }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bar, self.beat)?;
        if self.num != 0 {
            write!(f, "+{}/{}", self.num, self.den)?;
        }
        Ok(())
    }
}

impl FromStr for Position {
    type Err = Error;

    /// `BAR:BEAT` or `BAR:BEAT+NUM/DEN`.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::BadPosition(s.to_string());
        let (bar, rest) = s.trim().split_once(':').ok_or_else(bad)?;
        let (beat, fraction) = match rest.split_once('+') {
            Some((beat, fraction)) => (beat, Some(fraction)),
            None => (rest, None),
        };
        let bar: u32 = bar.trim().parse().map_err(|_| bad())?;
        let beat: u32 = beat.trim().parse().map_err(|_| bad())?;
        if bar == 0 || beat == 0 {
            return Err(bad());
        }
        let pos = Position::new(bar, beat);
        match fraction {
            Some(f) => {
                let (num, den) = parse_fraction(f).ok_or_else(bad)?;
                Ok(pos.with_fraction(num, den))
            }
            None => Ok(pos),
        }
    }
}

/// An additive amount of musical time, e.g. how long a fermata is extended.
///
/// `num/den` is a fraction of a beat when `num` is positive; a negative `num` means
/// `-num` notes of value 1/den instead (`-1/8` is one eighth note).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Length {
    pub beats: i64,
    pub num: i64,
    pub den: i64,
}

impl Length {
    pub const ZERO: Length = Length { beats: 0, num: 0, den: 1 };

    pub fn beats(beats: i64) -> Self {
        Self { beats, ..Self::ZERO }
    }

    pub fn notes(count: i64, den: i64) -> Self {
        Self { beats: 0, num: -count, den }
    }
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.beats, self.num) {
            (beats, 0) => write!(f, "{beats}"),
            (0, num) => write!(f, "{num}/{}", self.den),
            (beats, num) => write!(f, "{beats}+{num}/{}", self.den),
        }
    }
}

impl Default for Length {
    fn default() -> Self {
        Self::ZERO
    }
}

impl FromStr for Length {
    type Err = Error;

    /// `BEATS`, `NUM/DEN`, `BEATS+NUM/DEN` or `-NOTES/DEN`.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::BadLength(s.to_string());
        let s = s.trim();
        let (beats, fraction) = match s.split_once('+') {
            Some((beats, fraction)) => (Some(beats), Some(fraction)),
            None if s.contains('/') => (None, Some(s)),
            None => (Some(s), None),
        };
        let beats = match beats {
            Some(b) => b.trim().parse::<i64>().map_err(|_| bad())?,
            None => 0,
        };
        if beats < 0 {
            return Err(bad());
        }
        let (num, den) = match fraction {
            Some(f) => parse_fraction(f).ok_or_else(bad)?,
            None => (0, 1),
        };
        Ok(Length { beats, num, den })
    }
}

fn parse_fraction(s: &str) -> Option<(i64, i64)> {
    let (num, den) = s.trim().split_once('/')?;
    let num = num.trim().parse().ok()?;
    let den: i64 = den.trim().parse().ok()?;
    (den > 0).then_some((num, den))
}
