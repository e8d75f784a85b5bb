use crate::{
    channel::{ChannelCursor, ChannelState, PLAYMASK_ALL},
    device::{sci1_device_id, sci1_device_name, SCI1_DEVICE_NONE},
    fast_forward::FastForwardIterator,
    iterator::{
        BoxedIterator, Delivery, IteratorCore, Message, MessageBody, Recipient, SongIterator,
        SongIteratorId, Step,
    },
    midi::{Decoded, ParseFlags, SongState, LOOPS_FOREVER, MIDI_CHANNELS},
    pcm::PcmFeed,
};
use arrayvec::ArrayVec;
use binrw::BinRead;
use nom::{
    bytes::complete::{tag, take},
    error::{context, ContextError, ParseError},
    multi::many_till,
    number::complete::{be_u8, le_u16},
    IResult,
};
use std::{collections::VecDeque, io::Cursor, sync::Arc};

/// Leading byte of the optional priority block.
pub const SCI1_PRIORITY_MARKER: u8 = 0xf0;
const SCI1_PRIORITY_BLOCK_LEN: usize = 8;
/// Terminates the device list and each device's track list.
pub const SCI1_TABLE_END: u8 = 0xff;
/// First byte of a track holding a digital sample instead of MIDI.
pub const SCI1_SAMPLE_MARKER: u8 = 0xfe;
const SCI1_SAMPLE_HEADER_LEN: usize = 10;
const SCI1_MAX_LOOPS: i32 = 0x7fff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sci1TrackEntry {
    pub info: [u8; 2],
    pub offset: u16,
    pub length: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sci1Device {
    pub id: u8,
    pub tracks: Vec<Sci1TrackEntry>,
}

/// Device table at the start of an SCI1 song.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sci1Header {
    pub priority: Option<u8>,
    pub devices: Vec<Sci1Device>,
}

fn track_entry<'a, E: ParseError<&'a [u8]>>(
    input: &'a [u8],
) -> IResult<&'a [u8], Sci1TrackEntry, E> {
    let (input, info) = take(2usize)(input)?;
    let (input, offset) = le_u16(input)?;
    let (input, length) = le_u16(input)?;
    Ok((
        input,
        Sci1TrackEntry {
            info: [info[0], info[1]],
            offset,
            length,
        },
    ))
}

impl Sci1Header {
    pub fn parse<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        data: &'a [u8],
    ) -> IResult<&'a [u8], Self, E> {
        let (mut input, priority) = if data.first() == Some(&SCI1_PRIORITY_MARKER) {
            let (input, block) = context("priority block", take(SCI1_PRIORITY_BLOCK_LEN))(data)?;
            (input, Some(block[1]))
        } else {
            (data, None)
        };
        let mut devices = Vec::new();
        loop {
            let (rest, id) = context("device id", be_u8)(input)?;
            if id == SCI1_TABLE_END {
                return Ok((rest, Self { priority, devices }));
            }
            let (rest, (tracks, _)) = context(
                "track table",
                many_till(track_entry, tag(&[SCI1_TABLE_END][..])),
            )(rest)?;
            devices.push(Sci1Device { id, tracks });
            input = rest;
        }
    }
    pub fn device(&self, id: u8) -> Option<&Sci1Device> {
        self.devices.iter().find(|d| d.id == id)
    }
}

#[derive(Clone, Debug, BinRead)]
#[br(little, magic = 0xfeu8)]
pub struct Sci1SampleHeader {
    pub unknown: u8,
    pub rate: i16,
    pub length: u16,
    /// Song tick at which the sample starts
    pub begin: i16,
    pub end: i16,
}

#[derive(Clone, Debug)]
struct Sci1Sample {
    rate: u32,
    start: usize,
    length: usize,
    /// Ticks after the previous sample in the list
    delta: i32,
    announced: bool,
}

/// Multi-track SCI1 song with samples interleaved by song time.
pub struct Sci1Iterator {
    song: SongState,
    channels: ArrayVec<ChannelCursor, MIDI_CHANNELS>,
    samples: VecDeque<Sci1Sample>,
    track_polyphony: ArrayVec<u8, MIDI_CHANNELS>,
    track_importance: ArrayVec<u8, MIDI_CHANNELS>,
    device_id: u8,
    initialised: bool,
    /// The selected device has no tracks
    broken: bool,
    loop_forever: bool,
    /// Extra delay to report before resuming, set by cloning
    delay_remaining: i32,
    looped_channels: usize,
    core: IteratorCore,
}

impl Sci1Iterator {
    pub fn new(data: Arc<[u8]>, id: SongIteratorId) -> Self {
        Self {
            song: SongState::new(data),
            channels: ArrayVec::new(),
            samples: VecDeque::new(),
            track_polyphony: ArrayVec::new(),
            track_importance: ArrayVec::new(),
            device_id: 0x00,
            initialised: false,
            broken: false,
            loop_forever: false,
            delay_remaining: 0,
            looped_channels: 0,
            core: IteratorCore::new(id),
        }
    }
    #[inline]
    pub fn device_id(&self) -> u8 {
        self.device_id
    }
    /// Selects the hardware whose track list is played; takes effect on the next initialisation.
    #[inline]
    pub fn set_device_id(&mut self, device_id: u8) {
        self.device_id = device_id;
    }
    #[inline]
    pub fn priority(&self) -> u8 {
        self.core.priority
    }
    #[inline]
    pub fn track_count(&self) -> usize {
        self.channels.len()
    }
    #[inline]
    pub fn polyphony(&self, track: usize) -> Option<u8> {
        self.track_polyphony.get(track).copied()
    }
    #[inline]
    pub fn importance(&self, track: usize) -> Option<u8> {
        self.track_importance.get(track).copied()
    }
    #[inline]
    pub fn pending_samples(&self) -> usize {
        self.samples.iter().filter(|s| !s.announced).count()
    }
    #[inline]
    pub fn loops(&self) -> i32 {
        self.song.loops
    }
    pub fn set_loops(&mut self, loops: i32) {
        self.loop_forever = !(0..=SCI1_MAX_LOOPS).contains(&loops);
        self.song.loops = if self.loop_forever {
            LOOPS_FOREVER
        } else {
            loops
        };
    }
    #[inline]
    pub fn set_hold(&mut self, hold: u8) {
        self.song.hold = Some(hold);
    }
    fn add_sample(&mut self, start: usize) {
        let data = &self.song.data;
        let header = match Sci1SampleHeader::read(&mut Cursor::new(&data[start..])) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("Truncated sample header at {start:#x}: {e}");
                return;
            }
        };
        if header.unknown != 0 {
            log::warn!(
                "Sample at {start:#x} has unexpected header byte {:#04x}",
                header.unknown
            );
        }
        let begin = start + SCI1_SAMPLE_HEADER_LEN;
        let available = data.len() - begin.min(data.len());
        let mut length = header.length as usize;
        if length > available {
            log::warn!("Sample at {start:#x} claims {length} bytes, only {available} present");
            length = available;
        }
        log::debug!(
            "Sample at {start:#x}: {length} bytes at {}Hz, ticks {}..{}",
            header.rate,
            header.begin,
            header.end
        );
        let sample = Sci1Sample {
            rate: header.rate.max(0) as u32,
            start: begin,
            length,
            delta: header.begin as i32,
            announced: false,
        };
        let pos = self
            .samples
            .iter()
            .position(|s| s.delta >= sample.delta)
            .unwrap_or(self.samples.len());
        self.samples.insert(pos, sample);
    }
    /// Ticks until the next channel command or sample is due.
    fn smallest_delta(&self) -> Option<i32> {
        let channels = self
            .channels
            .iter()
            .filter(|c| c.state == ChannelState::Command)
            .map(|c| c.delay);
        let sample = self
            .samples
            .front()
            .filter(|s| !s.announced)
            .map(|s| s.delta);
        channels.chain(sample).min()
    }
    fn update_delta(&mut self, ticks: i32) {
        for channel in self
            .channels
            .iter_mut()
            .filter(|c| c.state == ChannelState::Command)
        {
            channel.delay -= ticks;
        }
        if let Some(sample) = self.samples.front_mut().filter(|s| !s.announced) {
            sample.delta -= ticks;
        }
    }
    /// Restarts every pending track once all active tracks reached their end.
    fn sync_loop(&mut self) -> Option<Step> {
        if self.looped_channels == 0 || self.looped_channels < self.song.active_channels {
            return None;
        }
        for channel in self
            .channels
            .iter_mut()
            .filter(|c| c.state == ChannelState::Pending)
        {
            channel.state = ChannelState::DeltaTime;
        }
        self.looped_channels = 0;
        if !self.loop_forever {
            self.song.loops -= 1;
        }
        log::debug!("SCI1 song looping, {} passes left", self.song.loops);
        Some(Step::Loop)
    }
    fn rewind_to_hold(&mut self) -> Step {
        log::debug!("Hold point reached, rewinding");
        let saw_notes = self.channels.iter().fold(0, |seen, c| seen | c.saw_notes);
        self.song.queue_synth_reset(saw_notes);
        for channel in &mut self.channels {
            channel.rewind_to_start();
        }
        self.looped_channels = 0;
        self.song.active_channels = self.channels.len();
        Step::Loop
    }
    fn finish(&mut self) -> Step {
        for channel in &mut self.channels {
            channel.state = ChannelState::Finished;
        }
        self.song.active_channels = 0;
        self.song.loops = 0;
        Step::Finished
    }
}

impl SongIterator for Sci1Iterator {
    fn kind(&self) -> &'static str {
        "SCI1"
    }
    fn next_command(&mut self) -> Step {
        if !self.initialised {
            self.init();
        }
        if self.broken {
            return Step::Finished;
        }
        if self.delay_remaining > 0 {
            let ticks = std::mem::take(&mut self.delay_remaining);
            return Step::Delay(ticks as u32);
        }
        if self.looped_channels == 0 {
            if let Some(cmd) = self.song.pending.pop_front() {
                return Step::Midi(cmd);
            }
        }
        loop {
            if self.samples.front().is_some_and(|s| s.announced) {
                log::debug!("Dropping sample that was never fetched");
                self.samples.pop_front();
            }
            let due = self
                .channels
                .iter()
                .position(|c| c.state == ChannelState::DeltaTime);
            let index = match due {
                Some(index) => index,
                None => {
                    let Some(ticks) = self.smallest_delta() else {
                        return self.finish();
                    };
                    if ticks > 0 {
                        self.update_delta(ticks);
                        return Step::Delay(ticks as u32);
                    }
                    if let Some(sample) = self
                        .samples
                        .front_mut()
                        .filter(|s| !s.announced && s.delta <= 0)
                    {
                        sample.announced = true;
                        return Step::Pcm;
                    }
                    let ready = self
                        .channels
                        .iter()
                        .position(|c| c.state == ChannelState::Command && c.delay <= 0);
                    match ready {
                        Some(index) => index,
                        None => return self.finish(),
                    }
                }
            };
            let channel = &mut self.channels[index];
            match self.song.process_channel(channel, ParseFlags::LOOPS_UNLIMITED) {
                Decoded::Skip | Decoded::Delay(_) => {}
                Decoded::Midi(cmd) => return Step::Midi(cmd),
                Decoded::AbsoluteCue(cue) => return Step::AbsoluteCue(cue),
                Decoded::RelativeCue(cue) => return Step::RelativeCue(cue),
                Decoded::Loop => {
                    channel.state = ChannelState::Pending;
                    channel.delay = 0;
                    self.looped_channels += 1;
                    if let Some(step) = self.sync_loop() {
                        return step;
                    }
                }
                Decoded::Hold => return self.rewind_to_hold(),
                Decoded::Finished => {
                    self.song.active_channels = self.song.active_channels.saturating_sub(1);
                    if let Some(step) = self.sync_loop() {
                        return step;
                    }
                }
            }
        }
    }
    fn handle_message(mut self: Box<Self>, msg: &Message) -> Delivery {
        if msg.recipient() != Recipient::Song {
            return Delivery::Rejected(self);
        }
        let own = msg.id == self.core.id;
        match &msg.body {
            MessageBody::SetPlaymask(mask) if own => {
                self.device_id = sci1_device_id(*mask);
                if self.device_id == SCI1_DEVICE_NONE {
                    log::warn!("No SCI1 device for {:?}", mask.devices);
                }
                if !self.initialised {
                    self.init();
                    return Delivery::Accepted(Some(self));
                }
                let mut offset = self
                    .channels
                    .iter()
                    .filter(|c| c.state != ChannelState::Finished)
                    .map(|c| c.scheduled_timepos())
                    .max()
                    .unwrap_or(0);
                self.init();
                if offset > 0 {
                    log::debug!(
                        "Device switched to {}, skipping {offset} ticks",
                        sci1_device_name(self.device_id)
                    );
                    // a clone's delay still plays before the skipped part
                    let pending = std::mem::take(&mut self.delay_remaining);
                    let ff = FastForwardIterator::new(self, offset).after_delay(pending);
                    return Delivery::Accepted(Some(Box::new(ff)));
                }
            }
            MessageBody::SetLoops(loops) if own => self.set_loops(*loops),
            MessageBody::SetHold(hold) => self.set_hold(*hold),
            MessageBody::SetRhythm(_) => {}
            MessageBody::Stop if own => {
                if !self.initialised {
                    self.init();
                }
                for channel in &mut self.channels {
                    channel.state = ChannelState::Finished;
                }
                self.samples.clear();
                self.song.active_channels = 0;
            }
            MessageBody::Clone(delta) => {
                let clone = self.duplicate(*delta);
                return Delivery::Cloned {
                    original: self,
                    clone,
                };
            }
            MessageBody::SetPlaymask(_) | MessageBody::SetLoops(_) | MessageBody::Stop => {}
            _ => {
                let (active, device, loops, samples) = (
                    self.song.active_channels,
                    self.device_id,
                    self.song.loops,
                    self.samples.len(),
                );
                let handled = self.core.handle_common(
                    "SCI1",
                    msg,
                    format_args!("active={active} device={device:#04x} loops={loops} samples={samples}"),
                );
                if !handled {
                    return Delivery::Rejected(self);
                }
            }
        }
        Delivery::Accepted(Some(self))
    }
    fn init(&mut self) {
        self.initialised = true;
        self.broken = false;
        self.channels.clear();
        self.samples.clear();
        self.track_polyphony.clear();
        self.track_importance.clear();
        self.looped_channels = 0;
        self.song.ccc = 0;
        self.song.pending.clear();
        self.core.channel_mask = 0;

        let data = self.song.data.clone();
        let header = match Sci1Header::parse::<()>(&data) {
            Ok((_, header)) => header,
            Err(_) => {
                log::warn!("Malformed SCI1 device table");
                self.broken = true;
                return;
            }
        };
        if let Some(priority) = header.priority {
            self.core.priority = priority;
        }
        let Some(device) = header.device(self.device_id) else {
            log::warn!(
                "Song does not support device {:#04x} ({})",
                self.device_id,
                sci1_device_name(self.device_id)
            );
            self.broken = true;
            return;
        };
        for entry in &device.tracks {
            let start = entry.offset as usize;
            let Some(&first) = data.get(start) else {
                log::warn!("Track at {start:#x} lies outside the resource");
                continue;
            };
            if first == SCI1_SAMPLE_MARKER {
                self.add_sample(start);
                continue;
            }
            if self.channels.is_full() {
                log::warn!("Ignoring track at {start:#x}: more than {MIDI_CHANNELS} channel tracks");
                continue;
            }
            let hints = data.get(start + 1).copied().unwrap_or(0);
            let end = (start + entry.length as usize).min(data.len());
            let mut channel = ChannelCursor::new(first & 0x0f, start + 2, end);
            channel.playmask = PLAYMASK_ALL;
            self.core.channel_mask |= 1 << channel.id;
            self.track_importance.push(hints & 0x0f);
            self.track_polyphony.push(hints >> 4);
            self.channels.push(channel);
        }
        let mut previous = 0;
        for sample in &mut self.samples {
            let at = sample.delta;
            sample.delta -= previous;
            previous = at;
        }
        self.song.active_channels = self.channels.len();
    }
    fn time_position(&self) -> i32 {
        self.channels
            .iter()
            .map(|c| c.total_timepos)
            .max()
            .unwrap_or(0)
    }
    fn pcm_feed(&mut self) -> Option<PcmFeed> {
        if !self.samples.front()?.announced {
            return None;
        }
        let sample = self.samples.pop_front()?;
        Some(PcmFeed::new(
            self.song.data.clone(),
            sample.start..sample.start + sample.length,
            sample.rate,
        ))
    }
    fn duplicate(&self, delta: i32) -> BoxedIterator {
        Box::new(Self {
            song: self.song.clone(),
            channels: self.channels.clone(),
            samples: self.samples.clone(),
            track_polyphony: self.track_polyphony.clone(),
            track_importance: self.track_importance.clone(),
            device_id: self.device_id,
            initialised: self.initialised,
            broken: self.broken,
            loop_forever: self.loop_forever,
            delay_remaining: self.delay_remaining + delta,
            looped_channels: self.looped_channels,
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
