use crate::{
    iterator::{
        BoxedIterator, Delivery, IteratorCore, Message, MessageBody, SongIterator, SongIteratorId,
        Step,
    },
    midi::MidiCommand,
};

/// Silences every channel a finished iterator may have left sounding, lowest channel first.
pub struct CleanupIterator {
    core: IteratorCore,
}

impl CleanupIterator {
    pub fn new(id: SongIteratorId, channel_mask: u16) -> Self {
        let mut core = IteratorCore::new(id);
        core.channel_mask = channel_mask;
        Self { core }
    }
    /// Takes the place of `finished`: same channels, same remap, same listeners.
    pub(crate) fn replacing(finished: &mut dyn SongIterator) -> Self {
        let old = finished.core_mut();
        let mut it = Self::new(old.id, old.channel_mask);
        it.core.channel_remap = old.channel_remap;
        it.core.transfer_death_listeners(old);
        it
    }
}

impl SongIterator for CleanupIterator {
    fn kind(&self) -> &'static str {
        "Cleanup"
    }
    fn next_command(&mut self) -> Step {
        let mask = self.core.channel_mask;
        if mask == 0 {
            return Step::Finished;
        }
        let ch = mask.trailing_zeros() as u8;
        self.core.channel_mask = mask & (mask - 1);
        Step::Midi(MidiCommand::notes_off(ch))
    }
    fn handle_message(mut self: Box<Self>, msg: &Message) -> Delivery {
        if let MessageBody::Clone(delta) = &msg.body {
            let clone = self.duplicate(*delta);
            return Delivery::Cloned {
                original: self,
                clone,
            };
        }
        if self.core.handle_common("Cleanup", msg, format_args!("")) {
            Delivery::Accepted(Some(self))
        } else {
            Delivery::Rejected(self)
        }
    }
    fn duplicate(&self, _delta: i32) -> BoxedIterator {
        Box::new(Self {
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

/// Waits a fixed number of ticks, then finishes.
pub struct TimerIterator {
    ticks: u32,
    core: IteratorCore,
}

impl TimerIterator {
    pub fn new(ticks: u32) -> Self {
        Self {
            ticks,
            core: IteratorCore::new(0),
        }
    }
}

impl SongIterator for TimerIterator {
    fn kind(&self) -> &'static str {
        "Timer"
    }
    fn next_command(&mut self) -> Step {
        match std::mem::take(&mut self.ticks) {
            0 => Step::Finished,
            ticks => Step::Delay(ticks),
        }
    }
    fn handle_message(mut self: Box<Self>, msg: &Message) -> Delivery {
        if let MessageBody::Clone(delta) = &msg.body {
            let clone = self.duplicate(*delta);
            return Delivery::Cloned {
                original: self,
                clone,
            };
        }
        let ticks = self.ticks;
        if self
            .core
            .handle_common("Timer", msg, format_args!("ticks={ticks}"))
        {
            Delivery::Accepted(Some(self))
        } else {
            Delivery::Rejected(self)
        }
    }
    fn duplicate(&self, delta: i32) -> BoxedIterator {
        let mut timer = Self::new(self.ticks.saturating_add_signed(delta));
        timer.core = self.core.duplicate();
        Box::new(timer)
    }
    fn core(&self) -> &IteratorCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut IteratorCore {
        &mut self.core
    }
}
