use crate::channel::{ChannelCursor, ChannelState};
use arrayvec::ArrayVec;
use nom::{bytes::complete::take_while, error::ParseError, number::complete::be_u8, IResult};
use std::{collections::VecDeque, sync::Arc};

pub const MIDI_CHANNELS: usize = 16;
pub const MIDI_RHYTHM_CHANNEL: u8 = 9;

pub const SCI_MIDI_EOT: u8 = 0xfc;
pub const SCI_MIDI_SET_SIGNAL: u8 = 0xcf;
pub const SCI_MIDI_SET_POLYPHONY: u8 = 0x4b;
pub const SCI_MIDI_RESET_ON_SUSPEND: u8 = 0x4c;
pub const SCI_MIDI_CHANNEL_MUTE: u8 = 0x4e;
pub const SCI_MIDI_SET_REVERB: u8 = 0x50;
pub const SCI_MIDI_HOLD: u8 = 0x52;
pub const SCI_MIDI_CUMULATIVE_CUE: u8 = 0x60;
pub const SCI_MIDI_CHANNEL_NOTES_OFF: u8 = 0x7b;
pub const SCI_MIDI_SET_SIGNAL_LOOP: u8 = 0x7f;
pub const SCI_MIDI_TIME_EXPANSION_PREFIX: u8 = 0x80;
pub const SCI_MIDI_TIME_EXPANSION_LENGTH: u32 = 240;
/// Running-status cache value before any status byte was read. Never a valid command.
pub const SCI_MIDI_NO_STATUS: u8 = 0xfe;

/// Loop counter used together with [`ParseFlags::LOOPS_UNLIMITED`]; any value above one works.
pub const LOOPS_FOREVER: i32 = 99;

/// Parameter bytes following a status byte, by high nibble.
pub const MIDI_CMDLEN: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 2, 2, 2, 2, 1, 1, 2, 0];

/// Controllers seen in shipped games with no known meaning; dropped silently.
const SKIPPED_CONTROLLERS: [u8; 5] = [0x04, 0x46, 0x61, 0x73, 0xd1];

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ParseFlags: u32 {
        /// Looping never consumes the loop counter
        const LOOPS_UNLIMITED = 0b01;
        /// Cumulative cues add their value byte instead of counting by one
        const PARAMETRIC_CUE = 0b10;
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MidiCommand(ArrayVec<u8, 3>);

impl MidiCommand {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.iter().copied().take(3).collect())
    }
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
    #[inline]
    pub fn status(&self) -> u8 {
        self.0.first().copied().unwrap_or(0)
    }
    /// Channel of a channel-voice message.
    #[inline]
    pub fn channel(&self) -> Option<u8> {
        match self.status() {
            s @ 0x80..=0xef => Some(s & 0x0f),
            _ => None,
        }
    }
    #[inline]
    pub fn param(&self, index: usize) -> u8 {
        self.0.get(index + 1).copied().unwrap_or(0)
    }
    pub fn remapped(mut self, remap: &[u8; MIDI_CHANNELS]) -> Self {
        if let Some(ch) = self.channel() {
            self.0[0] = (self.0[0] & 0xf0) | (remap[ch as usize] & 0x0f);
        }
        self
    }
    pub fn notes_off(channel: u8) -> Self {
        Self::from_bytes(&[0xb0 | (channel & 0x0f), SCI_MIDI_CHANNEL_NOTES_OFF, 0])
    }
    pub fn pitch_bend_center(channel: u8) -> Self {
        Self::from_bytes(&[0xe0 | (channel & 0x0f), 0x00, 0x40])
    }
}

impl std::fmt::Debug for MidiCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MidiCommand({:02x?})", self.as_bytes())
    }
}

/// Decodes one delta time. Each expansion prefix adds a fixed 240 ticks; the first other byte
/// ends the sequence and is added as-is.
pub fn delta_time<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], u32, E> {
    let (input, prefixes) = take_while(|b| b == SCI_MIDI_TIME_EXPANSION_PREFIX)(input)?;
    let (input, last) = be_u8(input)?;
    Ok((
        input,
        prefixes.len() as u32 * SCI_MIDI_TIME_EXPANSION_LENGTH + last as u32,
    ))
}

/// Outcome of decoding one step of a track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Decoded {
    Delay(u32),
    Midi(MidiCommand),
    Loop,
    AbsoluteCue(u8),
    RelativeCue(u32),
    Finished,
    /// A hold controller matched the configured hold value
    Hold,
    /// Consumed without anything to report; fetch the next command
    Skip,
}

/// Decoder state shared by every track of one song.
#[derive(Clone, Debug)]
pub(crate) struct SongState {
    pub data: Arc<[u8]>,
    pub loops: i32,
    /// Cumulative cue counter
    pub ccc: u32,
    pub reset_flag: u8,
    pub reverb: u8,
    pub muted: u16,
    pub polyphony: [u8; MIDI_CHANNELS],
    pub hold: Option<u8>,
    pub active_channels: usize,
    /// Synthesized commands waiting to be delivered before the next decoded one
    pub pending: VecDeque<MidiCommand>,
}

impl SongState {
    pub fn new(data: Arc<[u8]>) -> Self {
        Self {
            data,
            loops: 0,
            ccc: 0,
            reset_flag: 0,
            reverb: 0,
            muted: 0,
            polyphony: [0; MIDI_CHANNELS],
            hold: None,
            active_channels: 0,
            pending: VecDeque::new(),
        }
    }
    /// Queues a pitch wheel recentre for every channel that has played a note.
    pub fn queue_synth_reset(&mut self, saw_notes: u16) {
        self.pending.extend(
            (0..MIDI_CHANNELS as u8)
                .filter(|ch| saw_notes & (1 << ch) != 0)
                .map(MidiCommand::pitch_bend_center),
        );
    }
    pub fn process_channel(&mut self, channel: &mut ChannelCursor, flags: ParseFlags) -> Decoded {
        if channel.offset > channel.end {
            return overrun(channel, 0);
        }
        match channel.state {
            ChannelState::Finished => Decoded::Finished,
            ChannelState::DeltaTime => {
                let Some(data) = self.data.get(channel.offset..channel.end) else {
                    return overrun(channel, 1);
                };
                let ticks = match delta_time::<()>(data) {
                    Ok((rest, ticks)) => {
                        channel.offset += data.len() - rest.len();
                        ticks
                    }
                    Err(_) => return overrun(channel, 1),
                };
                channel.delay = channel.delay.saturating_add(ticks as i32);
                channel.timepos_increment = ticks as i32;
                channel.state = ChannelState::Command;
                if ticks > 0 {
                    return Decoded::Delay(ticks);
                }
                self.command(channel, flags)
            }
            ChannelState::Command => self.command(channel, flags),
            state => {
                log::warn!("Track {} cannot decode in state {state:?}", channel.id);
                channel.state = ChannelState::Finished;
                Decoded::Finished
            }
        }
    }
    fn command(&mut self, channel: &mut ChannelCursor, flags: ParseFlags) -> Decoded {
        channel.total_timepos += channel.timepos_increment;
        channel.timepos_increment = 0;
        channel.state = ChannelState::DeltaTime;

        let status = match self.data.get(channel.offset) {
            Some(&b) if channel.offset < channel.end => b,
            _ => return overrun(channel, 1),
        };
        let cmd = if status & 0x80 != 0 {
            channel.offset += 1;
            status
        } else {
            channel.last_cmd
        };
        if cmd == SCI_MIDI_NO_STATUS {
            log::warn!(
                "Corrupted sound resource: track {} has no running status at {:#x}",
                channel.id,
                channel.offset
            );
            channel.state = ChannelState::Finished;
            return Decoded::Finished;
        }

        let op = cmd >> 4;
        let ch = cmd & 0x0f;
        let params = MIDI_CMDLEN[op as usize] as usize;
        let Some(args) = self
            .data
            .get(channel.offset..channel.offset + params)
            .filter(|_| channel.offset + params <= channel.end)
        else {
            return overrun(channel, params);
        };
        let mut command = MidiCommand::from_bytes(&[cmd]);
        command.0.extend(args.iter().copied());
        channel.offset += params;
        channel.last_cmd = cmd;

        let controller = op == 0xb;
        let global = op == 0xf
            || cmd == SCI_MIDI_SET_SIGNAL
            || (controller && command.param(0) == SCI_MIDI_CUMULATIVE_CUE);
        if !global && !channel.plays(ch) {
            return Decoded::Skip;
        }

        match cmd {
            SCI_MIDI_EOT => {
                if self.loops > 1 {
                    if !flags.contains(ParseFlags::LOOPS_UNLIMITED) {
                        self.loops -= 1;
                    }
                    log::debug!(
                        "Track {} looping {:#x} -> {:#x}, {} passes left",
                        channel.id,
                        channel.offset,
                        channel.loop_offset,
                        self.loops
                    );
                    self.queue_synth_reset(channel.saw_notes);
                    channel.rewind_to_loop();
                    Decoded::Loop
                } else {
                    channel.state = ChannelState::Finished;
                    Decoded::Finished
                }
            }
            SCI_MIDI_SET_SIGNAL => match command.param(0) {
                SCI_MIDI_SET_SIGNAL_LOOP => {
                    channel.mark_loop_point();
                    Decoded::Skip
                }
                cue => Decoded::AbsoluteCue(cue),
            },
            _ if controller => self.controller(ch, command, flags),
            _ => {
                if op == 0x9 && command.param(1) != 0 {
                    channel.notes_played += 1;
                    channel.saw_notes |= 1 << ch;
                }
                Decoded::Midi(command)
            }
        }
    }
    fn controller(&mut self, ch: u8, command: MidiCommand, flags: ParseFlags) -> Decoded {
        let value = command.param(1);
        match command.param(0) {
            SCI_MIDI_CUMULATIVE_CUE => {
                if flags.contains(ParseFlags::PARAMETRIC_CUE) {
                    self.ccc += value as u32;
                } else {
                    self.ccc += 1;
                }
                Decoded::RelativeCue(self.ccc)
            }
            SCI_MIDI_RESET_ON_SUSPEND => {
                self.reset_flag = value;
                Decoded::Skip
            }
            SCI_MIDI_SET_POLYPHONY => {
                self.polyphony[ch as usize] = value;
                Decoded::Skip
            }
            SCI_MIDI_SET_REVERB => {
                self.reverb = value;
                Decoded::Skip
            }
            SCI_MIDI_CHANNEL_MUTE => {
                log::debug!("Channel {ch} mute {value}");
                if value != 0 {
                    self.muted |= 1 << ch;
                } else {
                    self.muted &= !(1 << ch);
                }
                Decoded::Skip
            }
            SCI_MIDI_HOLD => match self.hold {
                Some(hold) if hold == value => Decoded::Hold,
                _ => Decoded::Skip,
            },
            c if SKIPPED_CONTROLLERS.contains(&c) => Decoded::Skip,
            // modulation, volume, pan, expression, sustain, reset all and the rest go to the synth
            _ => Decoded::Midi(command),
        }
    }
}

fn overrun(channel: &mut ChannelCursor, wanted: usize) -> Decoded {
    log::warn!(
        "Reached end of track {} without terminator ({:#x}+{wanted}/{:#x})",
        channel.id,
        channel.offset,
        channel.end
    );
    channel.state = ChannelState::Finished;
    Decoded::Finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PLAYMASK_ALL;
    use hex_literal::hex;

    fn track(bytes: &[u8]) -> (SongState, ChannelCursor) {
        let song = SongState::new(Arc::from(bytes));
        let mut channel = ChannelCursor::new(0, 0, bytes.len());
        channel.playmask = PLAYMASK_ALL;
        (song, channel)
    }

    fn drain(song: &mut SongState, channel: &mut ChannelCursor, flags: ParseFlags) -> Vec<Decoded> {
        let mut out = Vec::new();
        loop {
            let step = song.process_channel(channel, flags);
            let done = step == Decoded::Finished;
            out.push(step);
            if done || out.len() > 64 {
                return out;
            }
        }
    }

    #[test]
    fn time_expansion_prefix() {
        assert_eq!(delta_time::<()>(&hex!("80 80 10")), Ok((&[][..], 496)));
        assert_eq!(delta_time::<()>(&hex!("05 90")), Ok((&[0x90][..], 5)));
        assert_eq!(delta_time::<()>(&hex!("80 00")), Ok((&[][..], 240)));
        assert!(delta_time::<()>(&hex!("80 80")).is_err());
    }

    #[test]
    fn running_status_reuses_previous_command() {
        let (mut song, mut channel) = track(&hex!("00 90 3c 7f 00 40 7f 05 3c 00 00 fc"));
        let steps = drain(&mut song, &mut channel, ParseFlags::empty());
        assert_eq!(
            steps,
            [
                Decoded::Midi(MidiCommand::from_bytes(&hex!("90 3c 7f"))),
                Decoded::Midi(MidiCommand::from_bytes(&hex!("90 40 7f"))),
                Decoded::Delay(5),
                Decoded::Midi(MidiCommand::from_bytes(&hex!("90 3c 00"))),
                Decoded::Finished,
            ]
        );
        assert_eq!(channel.notes_played, 2);
        assert_eq!(channel.total_timepos, 5);
    }

    #[test]
    fn data_byte_without_status_is_corrupt() {
        let (mut song, mut channel) = track(&hex!("00 3c 7f"));
        assert_eq!(song.process_channel(&mut channel, ParseFlags::empty()), Decoded::Finished);
        assert_eq!(channel.state, ChannelState::Finished);
    }

    #[test]
    fn truncated_parameters_finish_the_track() {
        let (mut song, mut channel) = track(&hex!("00 90 3c"));
        assert_eq!(song.process_channel(&mut channel, ParseFlags::empty()), Decoded::Finished);
        assert_eq!(channel.state, ChannelState::Finished);
        let (mut song, mut channel) = track(&hex!("80 80"));
        assert_eq!(song.process_channel(&mut channel, ParseFlags::empty()), Decoded::Finished);
    }

    #[test]
    fn masked_channels_are_skipped() {
        let (mut song, mut channel) = track(&hex!("00 91 3c 7f 00 cf 05 00 b1 60 01 00 fc"));
        channel.playmask = 0b1;
        let steps = drain(&mut song, &mut channel, ParseFlags::PARAMETRIC_CUE);
        assert_eq!(
            steps,
            [
                Decoded::Skip,
                Decoded::AbsoluteCue(5),
                Decoded::RelativeCue(1),
                Decoded::Finished,
            ]
        );
        assert_eq!(channel.saw_notes, 0);
    }

    #[test]
    fn signal_loop_marks_the_loop_point() {
        let (mut song, mut channel) = track(&hex!("00 cf 7f 04 90 3c 7f 00 fc"));
        song.loops = 2;
        let steps = drain(&mut song, &mut channel, ParseFlags::empty());
        assert_eq!(steps[0], Decoded::Skip);
        assert_eq!(steps[1], Decoded::Delay(4));
        assert_eq!(steps[3], Decoded::Loop);
        assert_eq!(channel.loop_offset, 3);
        assert_eq!(song.loops, 1);
        assert_eq!(song.pending.pop_front(), Some(MidiCommand::pitch_bend_center(0)));
        assert_eq!(steps[4], Decoded::Delay(4));
        assert_eq!(*steps.last().unwrap(), Decoded::Finished);
    }

    #[test]
    fn unlimited_loops_keep_the_counter() {
        let (mut song, mut channel) = track(&hex!("00 fc"));
        song.loops = 2;
        for _ in 0..3 {
            assert_eq!(
                song.process_channel(&mut channel, ParseFlags::LOOPS_UNLIMITED),
                Decoded::Loop
            );
        }
        assert_eq!(song.loops, 2);
    }

    #[test]
    fn cumulative_cues() {
        let bytes = hex!("00 b0 60 03 00 b0 60 02 00 fc");
        let (mut song, mut channel) = track(&bytes);
        let steps = drain(&mut song, &mut channel, ParseFlags::PARAMETRIC_CUE);
        assert_eq!(steps[..2], [Decoded::RelativeCue(3), Decoded::RelativeCue(5)]);

        let (mut song, mut channel) = track(&bytes);
        let steps = drain(&mut song, &mut channel, ParseFlags::empty());
        assert_eq!(steps[..2], [Decoded::RelativeCue(1), Decoded::RelativeCue(2)]);
    }

    #[test]
    fn controller_handling() {
        let (mut song, mut channel) = track(&hex!(
            "00 b2 4b 04 00 b2 4c 01 00 b2 50 03 00 b2 4e 01 00 b2 46 10 00 b2 07 64 00 b2 52 02 00 fc"
        ));
        song.hold = Some(2);
        let steps = drain(&mut song, &mut channel, ParseFlags::empty());
        assert_eq!(
            steps,
            [
                Decoded::Skip,
                Decoded::Skip,
                Decoded::Skip,
                Decoded::Skip,
                Decoded::Skip,
                Decoded::Midi(MidiCommand::from_bytes(&hex!("b2 07 64"))),
                Decoded::Hold,
                Decoded::Finished,
            ]
        );
        assert_eq!(song.polyphony[2], 4);
        assert_eq!(song.reset_flag, 1);
        assert_eq!(song.reverb, 3);
        assert_eq!(song.muted, 1 << 2);
    }

    #[test]
    fn remap_only_touches_channel_messages() {
        let mut remap = [0u8; MIDI_CHANNELS];
        for (i, r) in remap.iter_mut().enumerate() {
            *r = i as u8;
        }
        remap[1] = 4;
        let cmd = MidiCommand::from_bytes(&hex!("91 3c 7f")).remapped(&remap);
        assert_eq!(cmd.as_bytes(), hex!("94 3c 7f"));
        let eot = MidiCommand::from_bytes(&[SCI_MIDI_EOT]).remapped(&remap);
        assert_eq!(eot.as_bytes(), [SCI_MIDI_EOT]);
    }
}
