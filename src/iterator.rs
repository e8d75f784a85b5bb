use crate::{
    device::PlayMask,
    midi::{MidiCommand, MIDI_CHANNELS},
    pcm::PcmFeed,
};
use indexmap::IndexMap;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

pub type SongIteratorId = u32;
pub type InstanceId = u64;
pub type BoxedIterator = Box<dyn SongIterator>;
/// The driver-owned place a current iterator lives in. Morphing swaps its content.
pub type IteratorSlot = Option<BoxedIterator>;
/// A caller-owned slot that other iterators may track without owning it.
pub type SharedIterator = Arc<Mutex<IteratorSlot>>;

#[inline]
pub fn shared(it: IteratorSlot) -> SharedIterator {
    Arc::new(Mutex::new(it))
}

/// One playback event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Wait this many ticks before asking again
    Delay(u32),
    Midi(MidiCommand),
    Loop,
    AbsoluteCue(u8),
    RelativeCue(u32),
    /// A sample is ready; fetch it with [`SongIterator::pcm_feed`]
    Pcm,
    Finished,
    /// The iterator must be replaced through a morph acknowledgement
    Morph,
}

impl Step {
    #[inline]
    pub fn delay(&self) -> Option<u32> {
        match self {
            Self::Delay(ticks) => Some(*ticks),
            _ => None,
        }
    }
    #[inline]
    pub fn is_cue(&self) -> bool {
        matches!(self, Self::AbsoluteCue(_) | Self::RelativeCue(_))
    }
    pub(crate) fn remapped(self, remap: &[u8; MIDI_CHANNELS]) -> Self {
        match self {
            Self::Midi(cmd) => Self::Midi(cmd.remapped(remap)),
            step => step,
        }
    }
}

bitflags::bitflags! {
    /// Selects which steps wake the caller of `songit_next`, plus what the driver may do to the
    /// slot. `Finished` is always reported.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ReaderMask: u32 {
        const DELAY = 0b00000001;
        const MIDI = 0b00000010;
        const LOOP = 0b00000100;
        const CUE = 0b00001000;
        const PCM = 0b00010000;
        const ALL = 0b00011111;
        /// Drop the iterator from the slot once it finishes
        const MAY_FREE = 0b00100000;
        /// Replace a finished iterator that still owns channels with a cleanup iterator
        const MAY_CLEAN = 0b01000000;
    }
}

impl ReaderMask {
    pub fn wants(self, step: &Step) -> bool {
        match step {
            Step::Delay(_) => self.contains(Self::DELAY),
            Step::Midi(_) => self.contains(Self::MIDI),
            Step::Loop => self.contains(Self::LOOP),
            Step::AbsoluteCue(_) | Step::RelativeCue(_) => self.contains(Self::CUE),
            Step::Pcm => self.contains(Self::PCM),
            Step::Finished => true,
            Step::Morph => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FadeAction {
    #[default]
    None,
    FadeAndStop,
    FadeAndContinue,
}

/// Volume envelope requested for a song; stored for the sound manager to apply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FadeParams {
    pub action: FadeAction,
    pub final_volume: i32,
    pub ticks_per_step: i32,
    pub step_size: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recipient {
    /// Song-level control, understood by song iterators and forwarded by wrappers
    Song,
    /// Addressed to a wrapping iterator only
    Wrapper,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MessageBody {
    /// Passes to play; negative means forever
    SetLoops(i32),
    SetFade(FadeParams),
    SetPlaymask(PlayMask),
    SetHold(u8),
    SetRhythm(bool),
    Stop,
    /// Duplicate the iterator, shifting its pending delay by this many ticks
    Clone(i32),
    /// Log the iterator tree, starting at this indentation level
    Print(usize),
    AckMorph,
}

impl MessageBody {
    #[inline]
    pub fn recipient(&self) -> Recipient {
        match self {
            Self::AckMorph => Recipient::Wrapper,
            _ => Recipient::Song,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Song the message is meant for; only some messages check it
    pub id: SongIteratorId,
    pub body: MessageBody,
}

impl Message {
    #[inline]
    pub fn new(id: SongIteratorId, body: MessageBody) -> Self {
        Self { id, body }
    }
    #[inline]
    pub fn recipient(&self) -> Recipient {
        self.body.recipient()
    }
}

/// What became of an iterator after it was handed a message.
pub enum Delivery {
    /// Not addressed to this iterator; it is returned untouched
    Rejected(BoxedIterator),
    /// Handled. The slot holds the iterator to use from now on, which may be a different one, or
    /// nothing when the iterator dissolved.
    Accepted(IteratorSlot),
    Cloned {
        original: BoxedIterator,
        clone: BoxedIterator,
    },
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(it) => f.debug_tuple("Rejected").field(&it.kind()).finish(),
            Self::Accepted(it) => f
                .debug_tuple("Accepted")
                .field(&it.as_ref().map(|it| it.kind()))
                .finish(),
            Self::Cloned { original, clone } => f
                .debug_struct("Cloned")
                .field("original", &original.kind())
                .field("clone", &clone.kind())
                .finish(),
        }
    }
}

pub trait SongIterator: Send {
    fn kind(&self) -> &'static str;
    fn next_command(&mut self) -> Step;
    fn handle_message(self: Box<Self>, msg: &Message) -> Delivery;
    fn init(&mut self) {}
    /// Song time in ticks.
    fn time_position(&self) -> i32 {
        0
    }
    /// The sample announced by the last [`Step::Pcm`].
    fn pcm_feed(&mut self) -> Option<PcmFeed> {
        None
    }
    fn duplicate(&self, delta: i32) -> BoxedIterator;
    fn core(&self) -> &IteratorCore;
    fn core_mut(&mut self) -> &mut IteratorCore;
}

/// Fetches the next step with the iterator's channel remap applied.
pub(crate) fn next_remapped(it: &mut dyn SongIterator) -> Step {
    let step = it.next_command();
    step.remapped(&it.core().channel_remap)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

/// Identifies an iterator that is being released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Corpse {
    pub id: SongIteratorId,
    pub instance: InstanceId,
}

pub type DeathListener = Box<dyn FnMut(Corpse) + Send>;

#[derive(Default)]
pub struct DeathListeners {
    next_token: u64,
    listeners: IndexMap<ListenerToken, DeathListener>,
}

impl DeathListeners {
    pub fn add(&mut self, listener: DeathListener) -> ListenerToken {
        let token = ListenerToken(self.next_token);
        self.next_token += 1;
        self.listeners.insert(token, listener);
        token
    }
    pub fn remove(&mut self, token: ListenerToken) {
        if self.listeners.shift_remove(&token).is_none() {
            panic!("death listener {token:?} was never registered");
        }
    }
    #[inline]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
    pub fn append(&mut self, other: &mut Self) {
        for (_, listener) in other.listeners.drain(..) {
            self.add(listener);
        }
    }
    pub fn clear(&mut self) {
        self.listeners.clear();
    }
    fn notify(&mut self, corpse: Corpse) {
        for (_, mut listener) in self.listeners.drain(..) {
            listener(corpse);
        }
    }
}

impl fmt::Debug for DeathListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.listeners.keys()).finish()
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct IteratorFlags: u32 {
        const CLONE = 0b1;
    }
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

pub const IDENTITY_REMAP: [u8; MIDI_CHANNELS] =
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

/// State every iterator carries. Dropping it notifies the death listeners, so it must stay the
/// last field of each iterator.
#[derive(Debug)]
pub struct IteratorCore {
    pub id: SongIteratorId,
    /// Channels this iterator may have sounding
    pub channel_mask: u16,
    pub channel_remap: [u8; MIDI_CHANNELS],
    pub fade: FadeParams,
    pub priority: u8,
    pub flags: IteratorFlags,
    instance: InstanceId,
    listeners: DeathListeners,
}

impl IteratorCore {
    pub fn new(id: SongIteratorId) -> Self {
        Self {
            id,
            channel_mask: 0,
            channel_remap: IDENTITY_REMAP,
            fade: FadeParams::default(),
            priority: 0,
            flags: IteratorFlags::empty(),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            listeners: DeathListeners::default(),
        }
    }
    /// Copy for a cloned iterator: same settings, fresh identity, no listeners.
    pub fn duplicate(&self) -> Self {
        let mut core = Self::new(self.id);
        core.channel_mask = self.channel_mask;
        core.channel_remap = self.channel_remap;
        core.fade = self.fade;
        core.priority = self.priority;
        core.flags = self.flags;
        core
    }
    #[inline]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }
    #[inline]
    pub fn corpse(&self) -> Corpse {
        Corpse {
            id: self.id,
            instance: self.instance,
        }
    }
    #[inline]
    pub fn is_clone(&self) -> bool {
        self.flags.contains(IteratorFlags::CLONE)
    }
    pub fn add_death_listener(
        &mut self,
        listener: impl FnMut(Corpse) + Send + 'static,
    ) -> ListenerToken {
        self.listeners.add(Box::new(listener))
    }
    /// Panics if the token does not belong to this iterator.
    pub fn remove_death_listener(&mut self, token: ListenerToken) {
        self.listeners.remove(token);
    }
    #[inline]
    pub fn death_listeners(&self) -> &DeathListeners {
        &self.listeners
    }
    pub fn clear_death_listeners(&mut self) {
        self.listeners.clear();
    }
    /// Moves every listener of `from` onto this iterator.
    pub fn transfer_death_listeners(&mut self, from: &mut IteratorCore) {
        self.listeners.append(&mut from.listeners);
    }
    /// Takes over from a wrapper that is morphing into this iterator. The wrapper's remap applies
    /// on top of ours and its listeners move here.
    pub fn adopt_wrapper(&mut self, wrapper: &mut IteratorCore) {
        for to in self.channel_remap.iter_mut() {
            *to = wrapper.channel_remap[*to as usize % MIDI_CHANNELS];
        }
        self.transfer_death_listeners(wrapper);
    }
    /// Handles the messages whose meaning is the same for every song iterator.
    pub(crate) fn handle_common(&mut self, kind: &str, msg: &Message, detail: fmt::Arguments) -> bool {
        match &msg.body {
            MessageBody::SetFade(fade) => {
                self.fade = *fade;
                true
            }
            MessageBody::Print(indent) => {
                log::info!(
                    "{:width$}{kind} [{:08x}] mask={:04x} {detail}",
                    "",
                    self.id,
                    self.channel_mask,
                    width = indent * 2
                );
                true
            }
            _ => false,
        }
    }
}

impl Drop for IteratorCore {
    fn drop(&mut self) {
        if !self.listeners.is_empty() {
            log::trace!("Notifying {} death listeners of {:?}", self.listeners.len(), self.corpse());
            let corpse = self.corpse();
            self.listeners.notify(corpse);
        }
    }
}
