use std::{ops::Range, sync::Arc};

/// SCI sound timer rate, used to express sample lengths as song ticks.
pub const PCM_TICKS_PER_SECOND: u32 = 50;

/// A digital sample embedded in a song resource: unsigned 8-bit mono.
///
/// The feed shares the resource buffer and only records where the sample lives in it.
#[derive(Clone, Debug)]
pub struct PcmFeed {
    pub rate: u32,
    data: Arc<[u8]>,
    range: Range<usize>,
}

impl PcmFeed {
    pub(crate) fn new(data: Arc<[u8]>, range: Range<usize>, rate: u32) -> Self {
        debug_assert!(range.end <= data.len());
        Self { rate, data, range }
    }
    #[inline]
    pub fn samples(&self) -> &[u8] {
        &self.data[self.range.clone()]
    }
    #[inline]
    pub fn len(&self) -> usize {
        self.range.len()
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
    /// Playback length in timer ticks, rounded up.
    pub fn duration_ticks(&self) -> Option<u32> {
        ticks_for(self.len(), self.rate)
    }
    pub fn iter_i16(&self) -> impl Iterator<Item = i16> + '_ {
        self.samples().iter().map(|&s| ((s as i16) - 0x80) << 8)
    }
    pub fn write_wav(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        let wave_size = self.len() * 2 + 4 + 8 + 16 + 8;
        w.write_all(b"RIFF")?;
        w.write_all(&(wave_size as u32).to_le_bytes())?;
        w.write_all(b"WAVE")?;

        w.write_all(b"fmt ")?;
        w.write_all(&16u32.to_le_bytes())?; // fmt size
        w.write_all(&1u16.to_le_bytes())?; // WAVE_FORMAT_PCM
        w.write_all(&1u16.to_le_bytes())?; // nchannels
        w.write_all(&self.rate.to_le_bytes())?;
        w.write_all(&(2 * self.rate).to_le_bytes())?; // data rate
        w.write_all(&2u16.to_le_bytes())?; // sample size
        w.write_all(&16u16.to_le_bytes())?; // bits per sample

        w.write_all(b"data")?;
        w.write_all(&((self.len() * 2) as u32).to_le_bytes())?;
        for sample in self.iter_i16() {
            w.write_all(&sample.to_le_bytes())?;
        }
        Ok(())
    }
}

#[inline]
pub(crate) fn ticks_for(len: usize, rate: u32) -> Option<u32> {
    if rate == 0 {
        return None;
    }
    let total = len as u64 * PCM_TICKS_PER_SECOND as u64;
    Some(total.div_ceil(rate as u64) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_rounds_up() {
        let data: Arc<[u8]> = Arc::from(vec![0x80u8; 1000]);
        let feed = PcmFeed::new(data.clone(), 0..1000, 11025);
        assert_eq!(feed.duration_ticks(), Some(5));
        let feed = PcmFeed::new(data.clone(), 0..882, 22050);
        assert_eq!(feed.duration_ticks(), Some(2));
        let feed = PcmFeed::new(data, 0..10, 0);
        assert_eq!(feed.duration_ticks(), None);
    }

    #[test]
    fn wav_output() {
        let data: Arc<[u8]> = Arc::from(&[0xffu8, 0x00, 0x80, 0x80, 0x7f][..]);
        let feed = PcmFeed::new(data, 0..3, 8000);
        assert_eq!(feed.iter_i16().collect::<Vec<_>>(), [0x7f00, i16::MIN, 0]);
        let mut out = Vec::new();
        feed.write_wav(&mut out).unwrap();
        assert_eq!(out.len(), 44 + 6);
        assert_eq!(&out[..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(out[4..8].try_into().unwrap()) as usize, out.len() - 8);
        assert_eq!(u32::from_le_bytes(out[24..28].try_into().unwrap()), 8000);
        assert_eq!(&out[36..40], b"data");
        assert_eq!(&out[44..], [0x00, 0x7f, 0x00, 0x80, 0x00, 0x00]);
    }
}
