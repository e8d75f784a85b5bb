use std::{path::PathBuf, sync::Arc};

use itertools::Itertools;

use crate::{
    device::{sci1_device_id, sci1_device_name, DeviceMask, PlayMask},
    driver::{songit_handle_message, songit_new, songit_next, songit_pcm_feed, SongKind},
    iterator::{IteratorSlot, Message, MessageBody, ReaderMask, Step},
    pcm::PcmFeed,
    resource::{load_song, SongSummary},
};

/// Song iterator ID used for files played from the command line
pub const CLI_SONG_ID: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Device {
    Mt32,
    Fb01,
    Adlib,
    Mt540,
    Tandy,
    PcSpeaker,
}

impl From<Device> for DeviceMask {
    fn from(device: Device) -> Self {
        match device {
            Device::Mt32 => DeviceMask::MT32,
            Device::Fb01 => DeviceMask::FB01,
            Device::Adlib => DeviceMask::ADLIB,
            Device::Mt540 => DeviceMask::MT540,
            Device::Tandy => DeviceMask::TANDY,
            Device::PcSpeaker => DeviceMask::PC_SPEAKER,
        }
    }
}

#[derive(clap::Args)]
pub struct PlayArgs {
    /// Song resource to play
    pub input: PathBuf,
    /// Treat the song as SCI1 instead of SCI0
    #[arg(long, default_value_t = false)]
    pub sci1: bool,
    /// Input has no patch file header
    #[arg(long, default_value_t = false)]
    pub raw: bool,
    /// Output devices to play for, comma separated [default: all]
    #[arg(short, long, value_enum, value_delimiter = ',')]
    pub device: Vec<Device>,
    /// Digital sample output is available
    #[arg(long, default_value_t = false)]
    pub pcm: bool,
    /// Number of passes through the song, negative to loop forever
    #[arg(short, long, allow_negative_numbers = true)]
    pub loops: Option<i32>,
    /// Hold value that stops the song at its hold point
    #[arg(long)]
    pub hold: Option<u8>,
    /// Stop playing after this many ticks
    #[arg(long, default_value_t = 60 * 60 * 10)]
    pub max_ticks: u32,
}

impl PlayArgs {
    #[inline]
    pub fn kind(&self) -> SongKind {
        match self.sci1 {
            true => SongKind::Sci1,
            false => SongKind::Sci0,
        }
    }
    pub fn playmask(&self) -> Option<PlayMask> {
        if self.device.is_empty() && !self.pcm {
            return None;
        }
        let devices = match self.device.is_empty() {
            true => DeviceMask::all(),
            false => self
                .device
                .iter()
                .fold(DeviceMask::empty(), |mask, &d| mask | DeviceMask::from(d)),
        };
        Some(PlayMask::new(devices).with_pcm(self.pcm))
    }
    /// Loads the song and sends it the configured messages.
    pub fn open(&self) -> std::io::Result<(Arc<[u8]>, IteratorSlot)> {
        let data = load_song(&self.input, self.raw)?;
        let mut slot = songit_new(data.clone(), self.kind(), CLI_SONG_ID);
        if slot.is_none() {
            return Err(crate::invalid_data(format_args!(
                "`{}` is not a playable song",
                self.input.display()
            )));
        }
        let mut messages = Vec::new();
        if let Some(mask) = self.playmask() {
            if self.sci1 {
                let id = sci1_device_id(mask);
                log::debug!("Playing for device 0x{id:02x} ({})", sci1_device_name(id));
            }
            messages.push(MessageBody::SetPlaymask(mask));
        }
        if let Some(loops) = self.loops {
            messages.push(MessageBody::SetLoops(loops));
        }
        if let Some(hold) = self.hold {
            messages.push(MessageBody::SetHold(hold));
        }
        for body in messages {
            let msg = Message::new(CLI_SONG_ID, body);
            if !songit_handle_message(&mut slot, &msg) {
                log::warn!("Song ignored {:?}", msg.body);
            }
        }
        Ok((data, slot))
    }
}

/// An event surfaced while playing a song, stamped with its song time.
#[derive(Clone, Debug)]
pub enum Played {
    Step(Step),
    Pcm(Option<PcmFeed>),
}

/// Plays `slot` to the end or until `max_ticks` have passed. Returns the song length in ticks.
pub fn play(
    slot: &mut IteratorSlot,
    max_ticks: u32,
    mut on_event: impl FnMut(u32, Played),
) -> u32 {
    let mask = ReaderMask::ALL | ReaderMask::MAY_CLEAN | ReaderMask::MAY_FREE;
    let mut time = 0u32;
    loop {
        match songit_next(slot, mask) {
            Step::Finished => return time,
            Step::Delay(ticks) => {
                time = time.saturating_add(ticks);
                if time >= max_ticks {
                    log::warn!("Stopped playing after {time} ticks");
                    return time;
                }
            }
            Step::Pcm => on_event(time, Played::Pcm(songit_pcm_feed(slot))),
            step => on_event(time, Played::Step(step)),
        }
    }
}

pub(crate) fn describe(step: &Step) -> String {
    match step {
        Step::Midi(cmd) => format!(
            "MIDI {}",
            cmd.as_bytes()
                .iter()
                .format_with(" ", |b, f| f(&format_args!("{b:02x}")))
        ),
        Step::AbsoluteCue(cue) => format!("cue {cue}"),
        Step::RelativeCue(cue) => format!("cue +{cue}"),
        step => format!("{step:?}"),
    }
}

fn log_summary(summary: &SongSummary) {
    match summary {
        SongSummary::Sci0(sci0) => {
            log::info!("SCI0 song, format {}", sci0.format);
            log::info!("  CH VOICES DEVICES");
            for (ch, channel) in sci0.channels.iter().enumerate() {
                log::info!(
                    "  {ch: <2} {: <6} {}",
                    channel.voices,
                    channel
                        .devices
                        .iter_names()
                        .map(|(name, _)| name)
                        .format(",")
                );
            }
            match &sci0.pcm {
                Some(pcm) => log::info!(
                    "  PCM at 0x{:x}: {} bytes at {} Hz",
                    pcm.offset,
                    pcm.size,
                    pcm.rate
                ),
                None => log::info!("  No PCM"),
            }
        }
        SongSummary::Sci1(sci1) => {
            log::info!(
                "SCI1 song, priority {}",
                sci1.header
                    .priority
                    .map_or_else(|| "-".to_owned(), |p| p.to_string())
            );
            for (device, (id, samples)) in sci1.header.devices.iter().zip(&sci1.samples) {
                log::info!("  DEVICE 0x{id:02x} {}", sci1_device_name(*id));
                log::info!("    TRACK INFO  OFFSET LENGTH");
                for (index, track) in device.tracks.iter().enumerate() {
                    log::info!(
                        "    {index: <5} {:02x}{:02x}  0x{: <4x} 0x{:x}",
                        track.info[0],
                        track.info[1],
                        track.offset,
                        track.length
                    );
                }
                for sample in samples {
                    log::info!(
                        "    sample in track {}: {} bytes at {} Hz, starts at tick {}",
                        sample.track,
                        sample.length,
                        sample.rate,
                        sample.begin
                    );
                }
            }
        }
    }
}

#[derive(clap::Args)]
pub struct Args {
    #[command(flatten)]
    play: PlayArgs,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PlayStats {
    pub ticks: u32,
    pub midi: usize,
    pub notes: usize,
    pub cues: usize,
    pub loops: usize,
    pub samples: usize,
}

impl PlayStats {
    pub fn record(&mut self, event: &Played) {
        match event {
            Played::Step(Step::Midi(cmd)) => {
                self.midi += 1;
                if cmd.status() & 0xf0 == 0x90 && cmd.param(1) != 0 {
                    self.notes += 1;
                }
            }
            Played::Step(step) if step.is_cue() => self.cues += 1,
            Played::Step(Step::Loop) => self.loops += 1,
            Played::Pcm(_) => self.samples += 1,
            Played::Step(_) => {}
        }
    }
}

pub fn inspect(args: Args) -> std::io::Result<()> {
    let Args { play: args } = args;
    let verbose = crate::is_log_level(log::LevelFilter::Debug);
    let (data, mut slot) = args.open()?;

    let hash = blake3::hash(&data);
    log::info!("Size: 0x{:x}", data.len());
    log::info!("Hash: 0x{hash}");
    log_summary(&SongSummary::read(&data, args.kind())?);

    if verbose {
        songit_handle_message(&mut slot, &Message::new(CLI_SONG_ID, MessageBody::Print(1)));
        log::debug!("  TICK     EVENT");
    }
    let mut stats = PlayStats::default();
    let ticks = play(&mut slot, args.max_ticks, |time, event| {
        if verbose {
            let text = match &event {
                Played::Step(step) => describe(step),
                Played::Pcm(Some(feed)) => format!("PCM {} bytes at {} Hz", feed.len(), feed.rate),
                Played::Pcm(None) => "PCM (no data)".to_owned(),
            };
            log::debug!("  {time: <8} {text}");
        }
        stats.record(&event);
    });
    stats.ticks = ticks;
    log::info!(
        "Played {} ticks ({:.2}s)",
        stats.ticks,
        stats.ticks as f64 / 60.0
    );
    log::info!(
        "  {} MIDI events, {} notes, {} cues, {} loops, {} samples",
        stats.midi,
        stats.notes,
        stats.cues,
        stats.loops,
        stats.samples
    );
    Ok(())
}
