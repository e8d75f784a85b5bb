use std::path::{Path, PathBuf};

use itertools::Itertools;

use crate::{
    inspect::{play, PlayArgs, Played},
    iterator::Step,
    midi::MidiCommand,
    pcm::PcmFeed,
};

/// MIDI ticks per quarter note; at 120 BPM one MIDI tick is one song tick.
pub const EXPORT_TIME_BASE: u16 = 30;
const EXPORT_TEMPO: u32 = 60_000_000 / 120;

#[derive(clap::Args)]
pub struct Args {
    #[command(flatten)]
    play: PlayArgs,
    /// MIDI file to write; samples are written next to it
    #[arg(short, long)]
    output: PathBuf,
}

/// Converts a channel voice message. System messages have no Standard MIDI File counterpart.
pub fn midi_event(cmd: &MidiCommand) -> Option<ghakuf::messages::MidiEvent> {
    use ghakuf::messages::MidiEvent::*;

    let ch = cmd.channel()?;
    let (a, b) = (cmd.param(0), cmd.param(1));
    Some(match cmd.status() & 0xf0 {
        0x80 => NoteOff {
            ch,
            note: a,
            velocity: b,
        },
        0x90 => NoteOn {
            ch,
            note: a,
            velocity: b,
        },
        0xa0 => PolyphonicKeyPressure {
            ch,
            note: a,
            velocity: b,
        },
        0xb0 => ControlChange {
            ch,
            control: a,
            data: b,
        },
        0xc0 => ProgramChange { ch, program: a },
        0xd0 => ChannelPressure { ch, pressure: a },
        0xe0 => PitchBendChange {
            ch,
            data: (((b as i16) << 7) | a as i16) - 0x2000,
        },
        _ => return None,
    })
}

/// Where the `index`th sample of a song exported to `output` goes.
pub fn sample_path(output: &Path, index: usize) -> PathBuf {
    output.with_extension(format!("pcm{index}.wav"))
}

struct TimedEvent {
    time: u32,
    ch: u8,
    event: ghakuf::messages::MidiEvent,
}

/// Writes played events as a format 1 file: a tempo track with cue and loop markers, then one
/// track per MIDI channel.
pub fn write_midi(
    events: &[(u32, Step)],
    end: u32,
    w: &mut impl std::io::Write,
) -> std::io::Result<()> {
    use ghakuf::messages::{
        Message::*,
        MetaEvent::{CuePoint, EndOfTrack, Marker, SetTempo},
    };

    let mut midi = ghakuf::writer::Writer::new();
    midi.format(1);
    midi.time_base(EXPORT_TIME_BASE);

    let mut tempo_map = vec![MetaEvent {
        delta_time: 0,
        event: SetTempo,
        data: EXPORT_TEMPO.to_be_bytes()[1..].to_vec(),
    }];
    let mut last = 0;
    let mut channel_events = Vec::new();
    for (time, step) in events {
        let marker = match step {
            Step::Midi(cmd) => {
                if let (Some(ch), Some(event)) = (cmd.channel(), midi_event(cmd)) {
                    channel_events.push(TimedEvent {
                        time: *time,
                        ch,
                        event,
                    });
                }
                continue;
            }
            Step::Loop => (Marker, "loop".to_owned()),
            Step::AbsoluteCue(cue) => (CuePoint, format!("cue {cue}")),
            Step::RelativeCue(cue) => (CuePoint, format!("cue +{cue}")),
            _ => continue,
        };
        tempo_map.push(MetaEvent {
            delta_time: time - last,
            event: marker.0,
            data: marker.1.into_bytes(),
        });
        last = *time;
    }
    tempo_map.push(MetaEvent {
        delta_time: end.saturating_sub(last),
        event: EndOfTrack,
        data: Vec::new(),
    });

    // stable, so each channel keeps its events in time order
    channel_events.sort_by_key(|e| e.ch);
    let mut messages = Vec::new();
    for (ch, group) in &channel_events.into_iter().group_by(|e| e.ch) {
        log::trace!("Writing track for channel {ch}");
        messages.push(TrackChange);
        let mut last = 0;
        for TimedEvent { time, event, .. } in group {
            messages.push(MidiEvent {
                delta_time: time - last,
                event,
            });
            last = time;
        }
        messages.push(MetaEvent {
            delta_time: end.saturating_sub(last),
            event: EndOfTrack,
            data: Vec::new(),
        });
    }

    for message in &tempo_map {
        midi.push(message);
    }
    for message in &messages {
        midi.push(message);
    }
    midi.write_to_io(w)
}

pub fn export(args: Args) -> std::io::Result<()> {
    let Args { play: args, output } = args;
    let (_, mut slot) = args.open()?;

    let mut events = Vec::new();
    let mut samples: Vec<PcmFeed> = Vec::new();
    let end = play(&mut slot, args.max_ticks, |time, event| match event {
        Played::Step(step) => events.push((time, step)),
        Played::Pcm(Some(feed)) => samples.push(feed),
        Played::Pcm(None) => log::warn!("Sample announced at tick {time} has no data"),
    });

    let mut w = std::io::BufWriter::new(std::fs::File::create(&output)?);
    write_midi(&events, end, &mut w)?;
    log::info!(
        "Wrote {} events over {end} ticks to `{}`",
        events.len(),
        output.display()
    );

    for (index, feed) in samples.iter().enumerate() {
        let path = sample_path(&output, index);
        let mut w = std::io::BufWriter::new(std::fs::File::create(&path)?);
        feed.write_wav(&mut w)?;
        log::info!(
            "Wrote {} bytes at {} Hz to `{}`",
            feed.len(),
            feed.rate,
            path.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghakuf::messages::MidiEvent;
    use hex_literal::hex;

    #[test]
    fn channel_messages_convert() {
        let cmd = MidiCommand::from_bytes(&hex!("93 3c 7f"));
        assert!(matches!(
            midi_event(&cmd),
            Some(MidiEvent::NoteOn {
                ch: 3,
                note: 0x3c,
                velocity: 0x7f
            })
        ));
        let bend = MidiCommand::pitch_bend_center(2);
        assert!(matches!(
            midi_event(&bend),
            Some(MidiEvent::PitchBendChange { ch: 2, data: 0 })
        ));
        let program = MidiCommand::from_bytes(&hex!("c1 05"));
        assert!(matches!(
            midi_event(&program),
            Some(MidiEvent::ProgramChange { ch: 1, program: 5 })
        ));
        assert!(midi_event(&MidiCommand::from_bytes(&hex!("fc"))).is_none());
    }

    #[test]
    fn samples_sit_next_to_the_midi_file() {
        assert_eq!(
            sample_path(Path::new("out/song.mid"), 2),
            Path::new("out/song.pcm2.wav")
        );
    }

    #[test]
    fn writes_a_standard_midi_file() {
        let events = [
            (0, Step::Midi(MidiCommand::from_bytes(&hex!("90 3c 7f")))),
            (0, Step::Midi(MidiCommand::from_bytes(&hex!("91 40 7f")))),
            (10, Step::AbsoluteCue(2)),
            (12, Step::Midi(MidiCommand::from_bytes(&hex!("80 3c 00")))),
        ];
        let mut out = Vec::new();
        write_midi(&events, 20, &mut out).unwrap();
        assert_eq!(&out[..4], b"MThd");
        assert_eq!(&out[8..10], &hex!("00 01"));
        assert_eq!(&out[12..14], &EXPORT_TIME_BASE.to_be_bytes());
    }
}
