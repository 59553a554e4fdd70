//! Lock-free single-producer single-consumer ring buffer for streamed audio.
//!
//! A [`StreamingRingBuffer`] is created with a fixed capacity (a whole number of
//! blocks) and then split into a [`StreamWriter`] for the producing thread and a
//! [`StreamReader`] that is handed to the renderer through a pull-stream node.
//!
//! All transfers are frame-granular and all-or-nothing: a write that does not
//! fit, or a read asking for more frames than are buffered, fails without
//! moving any data.

use crate::error::{PetalScapeError, Result};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::fmt;

/// Sample layout of a stream. Samples are interleaved `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(PetalScapeError::Validation(format!(
                "stream format needs a non-zero sample rate and channel count, got {}Hz x {}",
                self.sample_rate, self.channels
            )));
        }
        Ok(())
    }

    fn samples(&self, frames: usize) -> usize {
        frames * self.channels as usize
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::new(48000, 2)
    }
}

/// Owner of the ring storage until it is split into its two halves.
pub struct StreamingRingBuffer {
    format: StreamFormat,
    block_frames: usize,
    capacity_frames: usize,
    rb: HeapRb<f32>,
}

impl StreamingRingBuffer {
    /// Creates a buffer holding `block_count` blocks of `block_frames` frames.
    pub fn new(format: StreamFormat, block_frames: usize, block_count: usize) -> Result<Self> {
        let capacity_frames = block_frames.checked_mul(block_count).ok_or_else(|| {
            PetalScapeError::RingBuffer("ring buffer capacity overflows".into())
        })?;
        Self::with_capacity(format, capacity_frames, block_frames)
    }

    /// Creates a buffer of `capacity_frames` frames.
    ///
    /// The capacity must be a non-zero multiple of `block_frames`.
    pub fn with_capacity(
        format: StreamFormat,
        capacity_frames: usize,
        block_frames: usize,
    ) -> Result<Self> {
        format.validate()?;
        if block_frames == 0 {
            return Err(PetalScapeError::RingBuffer(
                "block size must be non-zero".into(),
            ));
        }
        if capacity_frames == 0 || capacity_frames % block_frames != 0 {
            return Err(PetalScapeError::RingBuffer(format!(
                "capacity of {} frames is not a non-zero multiple of the {}-frame block size",
                capacity_frames, block_frames
            )));
        }

        log::debug!(
            "Creating streaming ring buffer: {} frames ({} blocks of {}), {} channels",
            capacity_frames,
            capacity_frames / block_frames,
            block_frames,
            format.channels
        );

        Ok(Self {
            format,
            block_frames,
            capacity_frames,
            rb: HeapRb::new(format.samples(capacity_frames)),
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn block_frames(&self) -> usize {
        self.block_frames
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// Splits the buffer into its producer and consumer halves.
    pub fn split(self) -> (StreamWriter, StreamReader) {
        let (producer, consumer) = self.rb.split();
        (
            StreamWriter {
                format: self.format,
                capacity_frames: self.capacity_frames,
                producer,
            },
            StreamReader {
                format: self.format,
                capacity_frames: self.capacity_frames,
                consumer,
            },
        )
    }
}

impl fmt::Debug for StreamingRingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingRingBuffer")
            .field("format", &self.format)
            .field("block_frames", &self.block_frames)
            .field("capacity_frames", &self.capacity_frames)
            .finish()
    }
}

/// Producer half, owned by the thread generating audio.
pub struct StreamWriter {
    format: StreamFormat,
    capacity_frames: usize,
    producer: HeapProd<f32>,
}

impl StreamWriter {
    /// Appends `frame_count` frames taken from the front of `samples`.
    pub fn write(&mut self, samples: &[f32], frame_count: usize) -> Result<()> {
        let needed = self.format.samples(frame_count);
        if samples.len() < needed {
            return Err(PetalScapeError::RingBuffer(format!(
                "write of {} frames needs {} samples, got {}",
                frame_count,
                needed,
                samples.len()
            )));
        }
        if frame_count > self.free_frames() {
            return Err(PetalScapeError::RingBuffer(format!(
                "not enough space: {} frames requested, {} free",
                frame_count,
                self.free_frames()
            )));
        }

        let pushed = self.producer.push_slice(&samples[..needed]);
        debug_assert_eq!(pushed, needed);
        Ok(())
    }

    pub fn free_frames(&self) -> usize {
        self.producer.vacant_len() / self.format.channels as usize
    }

    pub fn available_frames(&self) -> usize {
        self.producer.occupied_len() / self.format.channels as usize
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }
}

impl fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter")
            .field("format", &self.format)
            .field("free_frames", &self.free_frames())
            .finish()
    }
}

/// Consumer half, owned by the render callback.
pub struct StreamReader {
    format: StreamFormat,
    capacity_frames: usize,
    consumer: HeapCons<f32>,
}

impl StreamReader {
    /// Reads exactly `frame_count` frames into the front of `buffer`.
    pub fn read(&mut self, buffer: &mut [f32], frame_count: usize) -> Result<()> {
        let needed = self.format.samples(frame_count);
        if buffer.len() < needed {
            return Err(PetalScapeError::RingBuffer(format!(
                "read of {} frames needs room for {} samples, got {}",
                frame_count,
                needed,
                buffer.len()
            )));
        }
        if frame_count > self.available_frames() {
            return Err(PetalScapeError::RingBuffer(format!(
                "not enough data: {} frames requested, {} available",
                frame_count,
                self.available_frames()
            )));
        }

        let popped = self.consumer.pop_slice(&mut buffer[..needed]);
        debug_assert_eq!(popped, needed);
        Ok(())
    }

    pub fn available_frames(&self) -> usize {
        self.consumer.occupied_len() / self.format.channels as usize
    }

    pub fn free_frames(&self) -> usize {
        self.consumer.vacant_len() / self.format.channels as usize
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }
}

impl fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("format", &self.format)
            .field("available_frames", &self.available_frames())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_buffer(block_frames: usize, block_count: usize) -> (StreamWriter, StreamReader) {
        StreamingRingBuffer::new(StreamFormat::new(48000, 2), block_frames, block_count)
            .unwrap()
            .split()
    }

    #[test]
    fn test_capacity_must_be_block_multiple() {
        let format = StreamFormat::new(48000, 1);
        assert!(StreamingRingBuffer::with_capacity(format, 1000, 256).is_err());
        assert!(StreamingRingBuffer::with_capacity(format, 0, 256).is_err());
        assert!(StreamingRingBuffer::with_capacity(format, 1024, 0).is_err());

        let rb = StreamingRingBuffer::with_capacity(format, 1024, 256).unwrap();
        assert_eq!(rb.capacity_frames(), 1024);
        assert_eq!(rb.block_frames(), 256);
    }

    #[test]
    fn test_invalid_format_rejected() {
        assert!(StreamingRingBuffer::new(StreamFormat::new(48000, 0), 64, 4).is_err());
        assert!(StreamingRingBuffer::new(StreamFormat::new(0, 2), 64, 4).is_err());
    }

    #[test]
    fn test_write_then_read_preserves_frames() {
        let (mut writer, mut reader) = stereo_buffer(4, 2);
        let samples: Vec<f32> = (0..8).map(|i| i as f32).collect();

        writer.write(&samples, 4).unwrap();
        assert_eq!(reader.available_frames(), 4);
        assert_eq!(writer.free_frames(), 4);

        let mut out = [0.0f32; 8];
        reader.read(&mut out, 4).unwrap();
        assert_eq!(&out[..], &samples[..]);
        assert_eq!(reader.available_frames(), 0);
        assert_eq!(writer.free_frames(), 8);
    }

    #[test]
    fn test_overfull_write_commits_nothing() {
        let (mut writer, reader) = stereo_buffer(2, 2);
        writer.write(&[1.0; 6], 3).unwrap();

        let result = writer.write(&[2.0; 4], 2);
        assert!(matches!(result, Err(PetalScapeError::RingBuffer(_))));
        assert_eq!(reader.available_frames(), 3);
        assert_eq!(writer.free_frames(), 1);
    }

    #[test]
    fn test_underfull_read_consumes_nothing() {
        let (mut writer, mut reader) = stereo_buffer(2, 2);
        writer.write(&[0.5; 4], 2).unwrap();

        let mut out = [0.0f32; 6];
        assert!(reader.read(&mut out, 3).is_err());
        assert_eq!(out, [0.0; 6]);
        assert_eq!(reader.available_frames(), 2);
    }

    #[test]
    fn test_short_slices_rejected() {
        let (mut writer, mut reader) = stereo_buffer(4, 1);
        assert!(writer.write(&[0.0; 3], 2).is_err());
        assert_eq!(reader.available_frames(), 0);

        writer.write(&[0.0; 4], 2).unwrap();
        let mut out = [0.0f32; 2];
        assert!(reader.read(&mut out, 2).is_err());
        assert_eq!(reader.available_frames(), 2);
    }

    #[test]
    fn test_wraparound() {
        let (mut writer, mut reader) = stereo_buffer(2, 2);
        let mut out = [0.0f32; 6];

        for round in 0..5 {
            let value = round as f32;
            writer.write(&[value; 6], 3).unwrap();
            reader.read(&mut out, 3).unwrap();
            assert_eq!(out, [value; 6]);
        }
        assert_eq!(writer.free_frames(), writer.capacity_frames());
    }

    #[test]
    fn test_cross_thread_transfer() {
        let (mut writer, mut reader) = stereo_buffer(64, 4);
        let total_blocks = 100;

        let producer = std::thread::spawn(move || {
            let mut written = 0;
            while written < total_blocks {
                let block = [written as f32; 128];
                if writer.write(&block, 64).is_ok() {
                    written += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut out = [0.0f32; 128];
        let mut read = 0;
        while read < total_blocks {
            if reader.read(&mut out, 64).is_ok() {
                assert!(out.iter().all(|&s| s == read as f32));
                read += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }
}
