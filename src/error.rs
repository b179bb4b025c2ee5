use crate::midi::Tick;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("SMPTE timecode files are not supported, a metrical resolution is required")]
    UnsupportedTiming,

    #[error("time signature {numerator}/{denominator} does not divide {ppq} ticks per quarter evenly")]
    UnevenBeat { numerator: u8, denominator: u32, ppq: u16 },

    #[error("tick {0} is outside of the bar map")]
    TickOutOfRange(Tick),

    #[error("position {bar}:{beat} is outside of the bar map")]
    PositionOutOfRange { bar: u32, beat: u32 },

    #[error("no silent tick near {tick}: best candidate {best:?}, search radius {radius}")]
    NoSilentTick { tick: Tick, best: Option<Tick>, radius: Tick },

    #[error("fermata at tick {0} is out of range")]
    FermataOutOfRange(Tick),

    #[error("range {begin}..{end} is outside of the file (0..{limit})")]
    RangeOutOfBounds { begin: Tick, end: Tick, limit: Tick },

    #[error("MIDI channel {0} does not exist, channels are 0-15")]
    BadChannel(u8),

    #[error("bad track name pattern {pattern:?}: {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("bad position {0:?}, expected BAR:BEAT or BAR:BEAT+NUM/DEN")]
    BadPosition(String),

    #[error("bad length {0:?}, expected BEATS, NUM/DEN, BEATS+NUM/DEN or -NOTES/DEN")]
    BadLength(String),
}

pub type Result<T> = std::result::Result<T, Error>;
