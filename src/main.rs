use anyhow::{Context, Result, bail};
use clap::Parser;
use log::info;
use midly::Smf;
use std::{fs, path::{Path, PathBuf}};

use hymn_splitter::{
    Coupler, FermataSpec, Length, NotePolicy, Options, Outputs, Range, TempoOverride, TrackSelector, assemble,
};

#[derive(Parser, Debug)]
#[command(about = "Split a hymn recording into prelude, verse, part, postlude and panic files")]
struct Opt {
    /// Hymn as a Standard MIDI File
    input: PathBuf,
    /// Directory the outputs are written to (created if missing)
    output: PathBuf,

    /// Organ channel every event is moved to (0-15)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..16))]
    channel: Option<u8>,

    /// Tracks carrying the melody, e.g. 0 or 0,1
    #[arg(long, value_delimiter = ',', conflicts_with = "melody_name")]
    melody_tracks: Vec<usize>,
    /// Regex matched against track names to find the melody
    #[arg(long)]
    melody_name: Option<String>,
    /// Channel the melody is doubled onto
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..16))]
    melody_channel: Option<u8>,

    /// Tracks carrying the bass line
    #[arg(long, value_delimiter = ',', conflicts_with = "bass_name")]
    bass_tracks: Vec<usize>,
    /// Regex matched against track names to find the bass
    #[arg(long)]
    bass_name: Option<String>,
    /// Channel the bass is doubled onto (the pedal)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..16))]
    bass_channel: Option<u8>,

    /// Restart repeated notes instead of holding them
    #[arg(long)]
    restart: bool,

    /// Fermata as BAR:BEAT[+N/D][,EXTEND[,REST]], repeatable
    #[arg(long = "fermata")]
    fermatas: Vec<FermataSpec>,
    /// Range played as prelude, BEGIN..END, repeatable
    #[arg(long)]
    prelude: Vec<Range>,
    /// Range played as postlude, BEGIN..END, repeatable
    #[arg(long)]
    postlude: Vec<Range>,

    /// Rest between verses, in beats (e.g. 2, 1/2, -1/8 for an eighth note)
    #[arg(long, allow_hyphen_values = true)]
    rest: Option<Length>,
    /// Number of verses in the verse file; 0 skips it
    #[arg(long, default_value_t = 1)]
    verses: u32,

    /// Play at this many quarter notes per minute
    #[arg(long, conflicts_with = "tempo_scale")]
    bpm: Option<f64>,
    /// Multiply every tempo by this factor
    #[arg(long)]
    tempo_scale: Option<f64>,

    /// How far a range boundary may move to find a silent tick
    #[arg(long, allow_hyphen_values = true)]
    radius: Option<Length>,
    /// Keep controller and program changes
    #[arg(long)]
    keep_controls: bool,
}

fn coupler(tracks: &[usize], name: &Option<String>, channel: Option<u8>) -> Option<Coupler> {
    let selector = match name {
        Some(pattern) => TrackSelector::Name(pattern.clone()),
        None if !tracks.is_empty() => TrackSelector::Tracks(tracks.to_vec()),
        None => return None,
    };
    Some(Coupler { selector, channel })
}

impl Opt {
    fn options(&self) -> Options {
        Options {
            channel: self.channel,
            melody: coupler(&self.melody_tracks, &self.melody_name, self.melody_channel),
            bass: coupler(&self.bass_tracks, &self.bass_name, self.bass_channel),
            policy: if self.restart { NotePolicy::Restart } else { NotePolicy::Hold },
            fermatas: self.fermatas.clone(),
            prelude: self.prelude.clone(),
            postlude: self.postlude.clone(),
            rest_between_verses: self.rest,
            verses: self.verses,
            tempo: self.bpm.map(TempoOverride::Bpm).or(self.tempo_scale.map(TempoOverride::Scale)),
            search_radius: self.radius,
            keep_controls: self.keep_controls,
        }
    }
}

/// Write each output as `<key>.mid` into `dir`.
fn write_outputs(dir: &Path, outputs: &Outputs<'_>) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut written = Vec::with_capacity(outputs.len());
    for (key, smf) in outputs {
        let path = dir.join(format!("{key}.mid"));
        smf.save(&path).with_context(|| format!("writing {}", path.display()))?;
        info!("{key}: {} tracks -> {}", smf.tracks.len(), path.display());
        written.push(path);
    }
    Ok(written)
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::parse();

    let bytes = fs::read(&opt.input).with_context(|| format!("reading {}", opt.input.display()))?;
    let smf = Smf::parse(&bytes).with_context(|| format!("parsing {}", opt.input.display()))?;
    info!("{}: {} tracks, {:?}", opt.input.display(), smf.tracks.len(), smf.header.timing);

    let outputs = assemble(&smf, &opt.options()).with_context(|| format!("processing {}", opt.input.display()))?;
    if outputs.is_empty() {
        bail!("nothing to write for {}", opt.input.display());
    }
    let written = write_outputs(&opt.output, &outputs)?;
    println!("Wrote {} files to {}", written.len(), opt.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hymn_splitter::{OutputKey, Position};
    use midly::{
        Format, Header, MetaMessage, MidiMessage, Timing, TrackEvent, TrackEventKind,
        num::{u4, u7, u15, u28},
    };
    use tempfile::tempdir;

    fn tiny_smf() -> Smf<'static> {
        let ev = |delta: u32, kind| TrackEvent { delta: u28::new(delta), kind };
        let on = |key: u8| TrackEventKind::Midi {
            channel: u4::new(0),
            message: MidiMessage::NoteOn { key: u7::new(key), vel: u7::new(90) },
        };
        let off = |key: u8| TrackEventKind::Midi {
            channel: u4::new(0),
            message: MidiMessage::NoteOff { key: u7::new(key), vel: u7::new(0) },
        };
        Smf {
            header: Header::new(Format::SingleTrack, Timing::Metrical(u15::new(4))),
            tracks: vec![vec![
                ev(0, on(60)),
                ev(16, off(60)),
                ev(0, TrackEventKind::Meta(MetaMessage::EndOfTrack)),
            ]],
        }
    }

    #[test]
    fn flags_fill_options() {
        let opt = Opt::try_parse_from([
            "hymn-splitter", "in.mid", "out",
            "--channel", "3",
            "--melody-name", "^Sop",
            "--melody-channel", "4",
            "--bass-tracks", "2,3",
            "--fermata", "2:1,1,1/2",
            "--prelude", "1:1..2:1",
            "--rest", "2",
            "--radius", "-1/16",
            "--verses", "3",
            "--bpm", "72",
            "--restart",
        ])
        .unwrap();
        let o = opt.options();
        assert_eq!(o.channel, Some(3));
        assert_eq!(o.melody, Some(Coupler { selector: TrackSelector::Name("^Sop".into()), channel: Some(4) }));
        assert_eq!(o.bass, Some(Coupler { selector: TrackSelector::Tracks(vec![2, 3]), channel: None }));
        assert_eq!(o.fermatas.len(), 1);
        assert_eq!(o.fermatas[0].at, Position::new(2, 1));
        assert_eq!(o.prelude[0].end, Position::new(2, 1));
        assert_eq!(o.rest_between_verses, Some(Length::beats(2)));
        assert_eq!(o.search_radius, Some(Length::notes(1, 16)));
        assert_eq!(o.verses, 3);
        assert_eq!(o.tempo, Some(TempoOverride::Bpm(72.0)));
        assert_eq!(o.policy, NotePolicy::Restart);
    }

    #[test]
    fn bad_flags_are_rejected() {
        assert!(Opt::try_parse_from(["hymn-splitter", "in.mid", "out", "--channel", "16"]).is_err());
        assert!(Opt::try_parse_from(["hymn-splitter", "in.mid", "out", "--fermata", "two"]).is_err());
        assert!(Opt::try_parse_from(["hymn-splitter", "in.mid", "out", "--bpm", "60", "--tempo-scale", "2"]).is_err());
    }

    #[test]
    fn outputs_are_written_as_midi_files() {
        let dir = tempdir().unwrap();
        let smf = tiny_smf();
        let outputs = assemble(&smf, &Options { verses: 1, ..Options::default() }).unwrap();
        let written = write_outputs(&dir.path().join("hymn"), &outputs).unwrap();

        let names: Vec<_> = written.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["verse.mid", "part-00.mid", "panic.mid"]);

        let bytes = fs::read(dir.path().join("hymn").join(format!("{}.mid", OutputKey::Panic))).unwrap();
        let panic = Smf::parse(&bytes).unwrap();
        assert_eq!(panic.tracks.len(), 1);
        assert_eq!(panic.tracks[0].len(), 2);
    }
}
