use crate::midi::SCI_MIDI_NO_STATUS;

pub const PLAYMASK_NONE: u16 = 0;
pub const PLAYMASK_ALL: u16 = 0xffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialised,
    DeltaTime,
    Command,
    Pcm,
    PcmMagicDelta,
    Pending,
    Finished,
}

/// Read position and loop bookkeeping for one MIDI track inside a song resource.
///
/// Offsets index the owning iterator's resource buffer; `end` never exceeds its length.
#[derive(Clone, Debug)]
pub struct ChannelCursor {
    /// MIDI channel number the track was declared for
    pub id: u8,
    pub state: ChannelState,
    pub offset: usize,
    pub loop_offset: usize,
    pub initial_offset: usize,
    pub end: usize,
    pub playmask: u16,
    /// Ticks until this track's next command, relative to the song clock
    pub delay: i32,
    pub loop_timepos: i32,
    pub total_timepos: i32,
    pub timepos_increment: i32,
    /// Running-status cache
    pub last_cmd: u8,
    pub notes_played: u32,
    /// Channels that have sounded a note since the track was created
    pub saw_notes: u16,
}

impl Default for ChannelCursor {
    fn default() -> Self {
        Self {
            id: 0,
            state: ChannelState::Uninitialised,
            offset: 0,
            loop_offset: 0,
            initial_offset: 0,
            end: 0,
            playmask: PLAYMASK_NONE,
            delay: 0,
            loop_timepos: 0,
            total_timepos: 0,
            timepos_increment: 0,
            last_cmd: SCI_MIDI_NO_STATUS,
            notes_played: 0,
            saw_notes: 0,
        }
    }
}

impl ChannelCursor {
    pub fn new(id: u8, offset: usize, end: usize) -> Self {
        Self {
            id,
            state: ChannelState::DeltaTime,
            offset,
            loop_offset: offset,
            initial_offset: offset,
            end,
            ..Default::default()
        }
    }
    #[inline]
    pub fn plays(&self, channel: u8) -> bool {
        self.playmask & (1 << (channel & 0x0f)) != 0
    }
    /// Neither waiting for a synchronised loop nor done.
    #[inline]
    pub fn is_live(&self) -> bool {
        !matches!(self.state, ChannelState::Pending | ChannelState::Finished)
    }
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.offset)
    }
    pub fn mark_loop_point(&mut self) {
        self.loop_offset = self.offset;
        self.loop_timepos = self.total_timepos;
    }
    pub fn rewind_to_loop(&mut self) {
        self.offset = self.loop_offset;
        self.notes_played = 0;
        self.state = ChannelState::DeltaTime;
        self.total_timepos = self.loop_timepos;
        self.timepos_increment = 0;
        self.last_cmd = SCI_MIDI_NO_STATUS;
    }
    pub fn rewind_to_start(&mut self) {
        self.offset = self.initial_offset;
        self.notes_played = 0;
        self.state = ChannelState::DeltaTime;
        self.total_timepos = 0;
        self.timepos_increment = 0;
        self.delay = 0;
        self.last_cmd = SCI_MIDI_NO_STATUS;
    }
    /// Song time at which this track's next command takes effect.
    #[inline]
    pub fn scheduled_timepos(&self) -> i32 {
        self.total_timepos + self.timepos_increment - self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cursor_points_every_offset_at_start() {
        let cursor = ChannelCursor::new(3, 33, 100);
        assert_eq!(cursor.state, ChannelState::DeltaTime);
        assert_eq!(cursor.loop_offset, 33);
        assert_eq!(cursor.initial_offset, 33);
        assert_eq!(cursor.remaining(), 67);
        assert_eq!(cursor.last_cmd, SCI_MIDI_NO_STATUS);
        assert!(!cursor.plays(3));
    }

    #[test]
    fn loop_rewind_restores_loop_point_and_time() {
        let mut cursor = ChannelCursor::new(0, 10, 50);
        cursor.offset = 20;
        cursor.total_timepos = 120;
        cursor.mark_loop_point();
        cursor.offset = 40;
        cursor.total_timepos = 300;
        cursor.notes_played = 7;
        cursor.last_cmd = 0x90;
        cursor.state = ChannelState::Command;

        cursor.rewind_to_loop();
        assert_eq!(cursor.offset, 20);
        assert_eq!(cursor.total_timepos, 120);
        assert_eq!(cursor.notes_played, 0);
        assert_eq!(cursor.state, ChannelState::DeltaTime);
        assert_eq!(cursor.last_cmd, SCI_MIDI_NO_STATUS);

        cursor.delay = 9;
        cursor.rewind_to_start();
        assert_eq!(cursor.offset, 10);
        assert_eq!(cursor.total_timepos, 0);
        assert_eq!(cursor.delay, 0);
    }

    #[test]
    fn pending_and_finished_are_not_live() {
        let mut cursor = ChannelCursor::new(0, 0, 1);
        assert!(cursor.is_live());
        cursor.state = ChannelState::Pending;
        assert!(!cursor.is_live());
        cursor.state = ChannelState::Finished;
        assert!(!cursor.is_live());
    }
}
