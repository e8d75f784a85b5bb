use crate::{
    channel::{ChannelCursor, ChannelState, PLAYMASK_ALL},
    device::DeviceMask,
    iterator::{
        BoxedIterator, Delivery, IteratorCore, Message, MessageBody, Recipient, SongIterator,
        SongIteratorId, Step,
    },
    midi::{
        Decoded, ParseFlags, SongState, LOOPS_FOREVER, MIDI_CHANNELS, MIDI_RHYTHM_CHANNEL,
        SCI_MIDI_EOT,
    },
    pcm::{ticks_for, PcmFeed},
};
use binrw::BinRead;
use std::{io::Cursor, ops::Range, sync::Arc};

/// First track byte, after the format byte and the 16 channel entries.
pub const SCI0_MIDI_OFFSET: usize = 33;
/// Format byte of songs carrying a digital sample after the track.
pub const SCI0_PCM_FORMAT: u8 = 2;
const SCI0_PCM_DATA_OFFSET: usize = 0x2c;

#[derive(Clone, Debug, BinRead)]
#[br(little, magic = b"\x1a\x00\x01\x00")]
struct PcmHeader {
    #[br(pad_before = 0x0a)]
    rate: u16,
    #[br(pad_before = 0x10)]
    size: u16,
}

/// Location of the sample trailing an SCI0 track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sci0Pcm {
    /// Offset of the sample header
    pub offset: usize,
    pub rate: u32,
    pub size: usize,
}

impl Sci0Pcm {
    #[inline]
    pub fn data_range(&self) -> Range<usize> {
        let start = self.offset + SCI0_PCM_DATA_OFFSET;
        start..start + self.size
    }
}

/// Finds the sample header following one of the first two end-of-track markers.
pub fn locate_pcm(data: &[u8]) -> Option<Sci0Pcm> {
    if data.first() != Some(&SCI0_PCM_FORMAT) {
        return None;
    }
    let mut offset = SCI0_MIDI_OFFSET;
    let mut header = None;
    for _ in 0..2 {
        if offset >= data.len() {
            break;
        }
        let Some(pos) = data[offset..].iter().position(|&b| b == SCI_MIDI_EOT) else {
            log::warn!("Playing unterminated song");
            return None;
        };
        offset += pos + 1;
        if let Ok(h) = PcmHeader::read(&mut Cursor::new(&data[offset..])) {
            header = Some(h);
            break;
        }
    }
    let Some(header) = header else {
        log::warn!("Song indicates presence of PCM, but none found (finally at offset {offset:04x})");
        return None;
    };
    let available = data.len().saturating_sub(offset + SCI0_PCM_DATA_OFFSET);
    let mut size = header.size as usize;
    if size != available {
        log::warn!(
            "PCM advertises {size} bytes of data, but {available} bytes are trailing in the resource"
        );
        size = size.min(available);
    }
    Some(Sci0Pcm {
        offset,
        rate: header.rate as u32,
        size,
    })
}

/// Single-track SCI0 song, optionally followed by a digital sample.
pub struct Sci0Iterator {
    song: SongState,
    channel: ChannelCursor,
    loop_forever: bool,
    core: IteratorCore,
}

impl Sci0Iterator {
    pub fn new(data: Arc<[u8]>, id: SongIteratorId) -> Self {
        let mut core = IteratorCore::new(id);
        core.channel_mask = PLAYMASK_ALL;
        let mut it = Self {
            song: SongState::new(data),
            channel: ChannelCursor {
                playmask: PLAYMASK_ALL,
                ..Default::default()
            },
            loop_forever: false,
            core,
        };
        it.init();
        it
    }
    #[inline]
    pub fn playmask(&self) -> u16 {
        self.channel.playmask
    }
    #[inline]
    pub fn loops(&self) -> i32 {
        self.song.loops
    }
    #[inline]
    pub fn state(&self) -> ChannelState {
        self.channel.state
    }
    #[inline]
    pub fn pcm(&self) -> Option<Sci0Pcm> {
        locate_pcm(&self.song.data)
    }
    pub fn set_loops(&mut self, loops: i32) {
        self.loop_forever = loops < 0;
        self.song.loops = if self.loop_forever {
            LOOPS_FOREVER
        } else {
            loops
        };
    }
    /// Enables the channels the song declares for any of `devices`. The rhythm channel is left
    /// to [`Self::set_rhythm`].
    pub fn set_playmask(&mut self, devices: DeviceMask) {
        let mut mask = 0u16;
        for ch in 0..MIDI_CHANNELS {
            if ch == MIDI_RHYTHM_CHANNEL as usize {
                continue;
            }
            let flags = self.song.data.get(2 + 2 * ch).copied().unwrap_or(0);
            if flags & devices.bits() != 0 {
                mask |= 1 << ch;
            }
        }
        self.channel.playmask = mask;
        self.core.channel_mask = mask;
    }
    pub fn set_rhythm(&mut self, on: bool) {
        let bit = 1 << MIDI_RHYTHM_CHANNEL;
        if on {
            self.channel.playmask |= bit;
        } else {
            self.channel.playmask &= !bit;
        }
        self.core.channel_mask = self.channel.playmask;
    }
    #[inline]
    fn parse_flags(&self) -> ParseFlags {
        if self.loop_forever {
            ParseFlags::PARAMETRIC_CUE | ParseFlags::LOOPS_UNLIMITED
        } else {
            ParseFlags::PARAMETRIC_CUE
        }
    }
    fn finish(&mut self) -> Step {
        self.channel.state = ChannelState::Finished;
        self.song.active_channels = 0;
        self.song.loops = 0;
        Step::Finished
    }
    fn announce_pcm(&mut self) -> Step {
        if self.pcm().is_none() {
            return self.finish();
        }
        let data = &self.song.data;
        let offset = self.channel.offset;
        // a track made of nothing but the terminator only exists to carry the sample
        let empty_track =
            data.get(offset) == Some(&0) && data.get(offset + 1) == Some(&SCI_MIDI_EOT);
        self.channel.state = if empty_track {
            ChannelState::PcmMagicDelta
        } else {
            ChannelState::DeltaTime
        };
        Step::Pcm
    }
    fn pcm_delay(&mut self) -> Step {
        let ticks = self.pcm().and_then(|pcm| ticks_for(pcm.size, pcm.rate));
        match ticks {
            Some(ticks) if ticks > 0 => {
                log::debug!("Delaying {ticks} ticks for sample playback");
                self.channel.state = ChannelState::Finished;
                Step::Delay(ticks)
            }
            _ => self.finish(),
        }
    }
}

impl SongIterator for Sci0Iterator {
    fn kind(&self) -> &'static str {
        "SCI0"
    }
    fn next_command(&mut self) -> Step {
        if let Some(cmd) = self.song.pending.pop_front() {
            return Step::Midi(cmd);
        }
        loop {
            match self.channel.state {
                ChannelState::Uninitialised => {
                    log::warn!("Attempt to read command from uninitialized iterator");
                    self.init();
                }
                ChannelState::Pcm => return self.announce_pcm(),
                ChannelState::PcmMagicDelta => return self.pcm_delay(),
                _ => {
                    let flags = self.parse_flags();
                    match self.song.process_channel(&mut self.channel, flags) {
                        Decoded::Skip | Decoded::Hold => {}
                        Decoded::Delay(ticks) => return Step::Delay(ticks),
                        Decoded::Midi(cmd) => return Step::Midi(cmd),
                        Decoded::Loop => return Step::Loop,
                        Decoded::AbsoluteCue(cue) => return Step::AbsoluteCue(cue),
                        Decoded::RelativeCue(cue) => return Step::RelativeCue(cue),
                        Decoded::Finished => return self.finish(),
                    }
                }
            }
        }
    }
    fn handle_message(mut self: Box<Self>, msg: &Message) -> Delivery {
        if msg.recipient() != Recipient::Song {
            return Delivery::Rejected(self);
        }
        match &msg.body {
            MessageBody::SetLoops(loops) => self.set_loops(*loops),
            MessageBody::Stop => {
                if msg.id == self.core.id {
                    self.channel.state = ChannelState::Finished;
                }
            }
            MessageBody::SetPlaymask(mask) => self.set_playmask(mask.devices),
            MessageBody::SetRhythm(on) => self.set_rhythm(*on),
            MessageBody::Clone(delta) => {
                let clone = self.duplicate(*delta);
                return Delivery::Cloned {
                    original: self,
                    clone,
                };
            }
            MessageBody::SetHold(_) => return Delivery::Rejected(self),
            _ => {
                let (active, size, loops) = (
                    self.song.active_channels,
                    self.song.data.len(),
                    self.song.loops,
                );
                let handled = self.core.handle_common(
                    "SCI0",
                    msg,
                    format_args!("active={active} size={size} loops={loops}"),
                );
                if !handled {
                    return Delivery::Rejected(self);
                }
            }
        }
        Delivery::Accepted(Some(self))
    }
    fn init(&mut self) {
        self.core.fade = Default::default();
        self.core.priority = 0;
        self.song.reset_flag = 0;
        self.song.ccc = 0;
        self.song.active_channels = 1;
        self.song.pending.clear();
        self.set_loops(0);

        let playmask = self.channel.playmask;
        self.channel = ChannelCursor::new(0, SCI0_MIDI_OFFSET, self.song.data.len());
        self.channel.playmask = playmask;
        if self.song.data.first() == Some(&SCI0_PCM_FORMAT) {
            self.channel.state = ChannelState::Pcm;
        }
    }
    fn time_position(&self) -> i32 {
        self.channel.total_timepos
    }
    fn pcm_feed(&mut self) -> Option<PcmFeed> {
        let pcm = self.pcm()?;
        if self.channel.state != ChannelState::PcmMagicDelta {
            // the sample replaces the music
            self.channel.state = ChannelState::Finished;
        }
        Some(PcmFeed::new(
            self.song.data.clone(),
            pcm.data_range(),
            pcm.rate,
        ))
    }
    fn duplicate(&self, _delta: i32) -> BoxedIterator {
        Box::new(Self {
            song: self.song.clone(),
            channel: self.channel.clone(),
            loop_forever: self.loop_forever,
            core: self.core.duplicate(),
        })
    }
    fn core(&self) -> &IteratorCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut IteratorCore {
        &mut self.core
    }
}
