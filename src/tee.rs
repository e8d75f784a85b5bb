use crate::{
    driver::{songit_handle_message, songit_next},
    iterator::{
        BoxedIterator, Delivery, IteratorCore, IteratorSlot, Message, MessageBody, ReaderMask,
        SharedIterator, SongIterator, Step,
    },
    midi::{MIDI_CHANNELS, MIDI_RHYTHM_CHANNEL},
    pcm::PcmFeed,
};
use std::sync::{Arc, MutexGuard, PoisonError};

bitflags::bitflags! {
    /// Per-child state of a [`TeeIterator`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TeeStatus: u8 {
        /// Has not finished yet
        const ACTIVE = 0b001;
        /// Holds a fetched delay that was not surfaced yet
        const READY = 0b010;
        /// Announced the sample the caller will ask for next
        const PCM = 0b100;
    }
}

enum ChildSlot {
    Owned(IteratorSlot),
    /// Polled through a slot someone else owns
    Shared(SharedIterator),
}

fn lock(shared: &SharedIterator) -> MutexGuard<'_, IteratorSlot> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChildSlot {
    fn with<R>(&mut self, f: impl FnOnce(&mut IteratorSlot) -> R) -> R {
        match self {
            Self::Owned(slot) => f(slot),
            Self::Shared(shared) => f(&mut lock(shared)),
        }
    }
    #[inline]
    fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }
}

struct TeeChild {
    slot: ChildSlot,
    status: TeeStatus,
    pending: Step,
}

impl TeeChild {
    fn new(slot: ChildSlot) -> Self {
        Self {
            slot,
            status: TeeStatus::ACTIVE,
            pending: Step::Finished,
        }
    }
    fn fetch(&mut self) -> Step {
        let mask = if self.slot.is_owned() {
            ReaderMask::ALL | ReaderMask::MAY_FREE | ReaderMask::MAY_CLEAN
        } else {
            ReaderMask::ALL
        };
        self.slot.with(|slot| songit_next(slot, mask))
    }
    #[inline]
    fn ready_delay(&self) -> Option<u32> {
        if self.status.contains(TeeStatus::ACTIVE | TeeStatus::READY) {
            self.pending.delay()
        } else {
            None
        }
    }
}

/// Moves every channel the right child shares with the left one to a channel neither uses.
/// Returns the channels the combined stream may sound.
fn remap_collisions(left_mask: u16, right: &mut IteratorCore) -> u16 {
    let mut used = left_mask | right.channel_mask;
    let mut combined = left_mask;
    for ch in 0..MIDI_CHANNELS as u8 {
        let bit = 1 << ch;
        if right.channel_mask & bit == 0 {
            continue;
        }
        let mut target = ch;
        if left_mask & bit != 0 && ch != MIDI_RHYTHM_CHANNEL {
            let free = (0..MIDI_CHANNELS as u8)
                .find(|&c| c != MIDI_RHYTHM_CHANNEL && used & (1 << c) == 0);
            match free {
                Some(free) => {
                    used |= 1 << free;
                    target = free;
                }
                None => log::warn!("No free channel to move channel {ch} to, it will collide"),
            }
        }
        right.channel_remap[ch as usize] = target;
        combined |= 1 << target;
    }
    combined
}

/// Plays two iterators as one stream, merging their events by time.
pub struct TeeIterator {
    children: [TeeChild; 2],
    ready_to_morph: bool,
    core: IteratorCore,
}

impl TeeIterator {
    /// Combines two iterators the tee owns. Once one of them finishes, the tee morphs into the
    /// other.
    pub fn new(left: BoxedIterator, mut right: BoxedIterator) -> Self {
        let mut core = IteratorCore::new(left.core().id);
        core.priority = left.core().priority.max(right.core().priority);
        core.channel_mask = remap_collisions(left.core().channel_mask, right.core_mut());
        Self::with_children(
            ChildSlot::Owned(Some(left)),
            ChildSlot::Owned(Some(right)),
            core,
        )
    }
    /// Combines two iterators owned elsewhere. The tee never frees or replaces them and keeps
    /// running for as long as either one plays.
    pub fn shared(left: SharedIterator, right: SharedIterator) -> Self {
        let mut core = IteratorCore::new(0);
        if Arc::ptr_eq(&left, &right) {
            log::warn!("Tee over a single shared iterator, playing it once");
            if let Some(it) = lock(&left).as_ref() {
                core.id = it.core().id;
                core.channel_mask = it.core().channel_mask;
            }
            return Self::with_children(ChildSlot::Shared(left), ChildSlot::Owned(None), core);
        }
        {
            let left_guard = lock(&left);
            let mut right_guard = lock(&right);
            let left_mask = left_guard.as_ref().map_or(0, |it| it.core().channel_mask);
            if let Some(it) = left_guard.as_ref() {
                core.id = it.core().id;
            }
            if let Some(it) = right_guard.as_mut() {
                core.channel_mask = remap_collisions(left_mask, it.core_mut());
            } else {
                core.channel_mask = left_mask;
            }
        }
        Self::with_children(ChildSlot::Shared(left), ChildSlot::Shared(right), core)
    }
    fn with_children(left: ChildSlot, right: ChildSlot, core: IteratorCore) -> Self {
        Self {
            children: [TeeChild::new(left), TeeChild::new(right)],
            ready_to_morph: false,
            core,
        }
    }
    #[inline]
    pub fn status(&self) -> [TeeStatus; 2] {
        [self.children[0].status, self.children[1].status]
    }
    fn active(&self) -> impl Iterator<Item = usize> + '_ {
        (0..2).filter(|&i| self.children[i].status.contains(TeeStatus::ACTIVE))
    }
    /// Surfaces the smaller of the ready delays and keeps the other one in step.
    fn pick_delay(&mut self) -> Option<Step> {
        let [left, right] = &mut self.children;
        let ticks = match (left.ready_delay(), right.ready_delay()) {
            (Some(l), Some(r)) if r == l => {
                left.status.remove(TeeStatus::READY);
                right.status.remove(TeeStatus::READY);
                r
            }
            (Some(l), Some(r)) if r < l => {
                right.status.remove(TeeStatus::READY);
                left.pending = Step::Delay(l - r);
                r
            }
            (Some(l), Some(r)) => {
                left.status.remove(TeeStatus::READY);
                right.pending = Step::Delay(r - l);
                l
            }
            (Some(l), None) => {
                left.status.remove(TeeStatus::READY);
                l
            }
            (None, Some(r)) => {
                right.status.remove(TeeStatus::READY);
                r
            }
            (None, None) => return None,
        };
        Some(Step::Delay(ticks))
    }
}

impl SongIterator for TeeIterator {
    fn kind(&self) -> &'static str {
        "Tee"
    }
    fn next_command(&mut self) -> Step {
        if self.ready_to_morph {
            return Step::Morph;
        }
        'fetch: loop {
            let active: Vec<usize> = self.active().collect();
            match active[..] {
                [] => return Step::Finished,
                [only] if self.children[only].slot.is_owned() => {
                    self.ready_to_morph = true;
                    let child = &mut self.children[only];
                    if child.status.contains(TeeStatus::READY) {
                        child.status.remove(TeeStatus::READY);
                        return std::mem::replace(&mut child.pending, Step::Finished);
                    }
                    return Step::Morph;
                }
                _ => {}
            }
            for i in active {
                let child = &mut self.children[i];
                if child.status.contains(TeeStatus::READY) {
                    continue;
                }
                child.status.remove(TeeStatus::PCM);
                match child.fetch() {
                    Step::Finished => {
                        log::debug!("Tee child {i} finished");
                        child.status.remove(TeeStatus::ACTIVE);
                        continue 'fetch;
                    }
                    Step::Delay(ticks) => {
                        child.pending = Step::Delay(ticks);
                        child.status.insert(TeeStatus::READY);
                    }
                    Step::Pcm => {
                        child.status.insert(TeeStatus::PCM);
                        return Step::Pcm;
                    }
                    step => return step,
                }
            }
            return self.pick_delay().unwrap_or(Step::Finished);
        }
    }
    fn handle_message(mut self: Box<Self>, msg: &Message) -> Delivery {
        match &msg.body {
            MessageBody::AckMorph => {
                let active: Vec<usize> = self.active().collect();
                match active[..] {
                    [] => {
                        log::debug!("Tee dissolved, both children finished");
                        Delivery::Accepted(None)
                    }
                    [only] if self.children[only].slot.is_owned() => {
                        let taken = match &mut self.children[only].slot {
                            ChildSlot::Owned(slot) => slot.take(),
                            ChildSlot::Shared(_) => None,
                        };
                        let Some(mut child) = taken else {
                            return Delivery::Accepted(None);
                        };
                        child.core_mut().adopt_wrapper(&mut self.core);
                        log::debug!("Tee morphing into {}", child.kind());
                        Delivery::Accepted(Some(child))
                    }
                    _ => {
                        log::warn!("Tee cannot morph with {} children playing", active.len());
                        Delivery::Accepted(Some(self))
                    }
                }
            }
            MessageBody::Clone(delta) => {
                let clone = self.duplicate(*delta);
                Delivery::Cloned {
                    original: self,
                    clone,
                }
            }
            MessageBody::Print(indent) => {
                let status = self.status();
                self.core.handle_common(
                    "Tee",
                    msg,
                    format_args!("left={:?} right={:?}", status[0], status[1]),
                );
                let print = Message::new(msg.id, MessageBody::Print(indent + 1));
                for child in &mut self.children {
                    child.slot.with(|slot| songit_handle_message(slot, &print));
                }
                Delivery::Accepted(Some(self))
            }
            _ => {
                let mut accepted = false;
                if let MessageBody::SetFade(fade) = &msg.body {
                    self.core.fade = *fade;
                    accepted = true;
                }
                for child in &mut self.children {
                    accepted |= child.slot.with(|slot| songit_handle_message(slot, msg));
                }
                match accepted {
                    true => Delivery::Accepted(Some(self)),
                    false => Delivery::Rejected(self),
                }
            }
        }
    }
    fn init(&mut self) {
        self.ready_to_morph = false;
        for child in &mut self.children {
            child.status = TeeStatus::ACTIVE;
            child.slot.with(|slot| {
                if let Some(it) = slot.as_mut() {
                    it.init();
                }
            });
        }
    }
    fn time_position(&self) -> i32 {
        self.children
            .iter()
            .map(|child| match &child.slot {
                ChildSlot::Owned(slot) => slot.as_ref().map_or(0, |it| it.time_position()),
                ChildSlot::Shared(shared) => lock(shared).as_ref().map_or(0, |it| it.time_position()),
            })
            .max()
            .unwrap_or(0)
    }
    fn pcm_feed(&mut self) -> Option<PcmFeed> {
        let child = self
            .children
            .iter_mut()
            .find(|c| c.status.contains(TeeStatus::PCM))?;
        child.status.remove(TeeStatus::PCM);
        child.slot.with(|slot| slot.as_mut()?.pcm_feed())
    }
    fn duplicate(&self, delta: i32) -> BoxedIterator {
        let children = [&self.children[0], &self.children[1]].map(|child| {
            let copy = match &child.slot {
                ChildSlot::Owned(slot) => slot.as_ref().map(|it| it.duplicate(delta)),
                ChildSlot::Shared(shared) => lock(shared).as_ref().map(|it| it.duplicate(delta)),
            };
            TeeChild {
                slot: ChildSlot::Owned(copy),
                status: child.status,
                pending: child.pending.clone(),
            }
        });
        Box::new(Self {
            children,
            ready_to_morph: self.ready_to_morph,
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
