/**
 * ============================================================================
 * WAV INTERMEDIATE MODULE
 * ============================================================================
 *
 * PURPOSE: Merge-mode audio intermediate, header-tagged with the capture
 * format so the merge pass needs no out-of-band parameters
 *
 * WavStream is an io::Write over raw little-endian capture bytes, so it
 * plugs into the pipe writer exactly like the encoder's stdin does.
 * Partial samples are carried over between writes.
 *
 * ============================================================================
 */

use crate::recording::error::{RecorderError, Result};
use crate::recording::logger::SessionLogger;
use crate::recording::types::{AudioFormat, SampleEncoding};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub struct WavStream {
    writer: WavWriter<BufWriter<File>>,
    format: AudioFormat,
    pending: Vec<u8>,
    samples: u64,
    log: SessionLogger,
}

impl WavStream {
    pub fn create(path: &Path, format: AudioFormat, log: SessionLogger) -> Result<Self> {
        let sample_format = match (format.encoding, format.bits_per_sample) {
            (SampleEncoding::Float, 32) => SampleFormat::Float,
            (SampleEncoding::Int, 8 | 16 | 24 | 32) => SampleFormat::Int,
            (encoding, bits) => {
                return Err(RecorderError::InvalidConfig(format!(
                    "WAV intermediate cannot store {:?} {}-bit samples",
                    encoding, bits
                )));
            }
        };

        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: format.bits_per_sample,
            sample_format,
        };

        let writer = WavWriter::create(path, spec)
            .map_err(|e| RecorderError::Io(io::Error::other(format!("Failed to create {:?}: {}", path, e))))?;

        Ok(Self {
            writer,
            format,
            pending: Vec::new(),
            samples: 0,
            log,
        })
    }

    pub fn samples_written(&self) -> u64 {
        self.samples
    }

    // Rewrite the header with final lengths and close the file
    pub fn finalize(self) -> Result<()> {
        if !self.pending.is_empty() {
            self.log
                .warn(format_args!("Dropping {} trailing bytes of a partial sample", self.pending.len()));
        }
        self.writer
            .finalize()
            .map_err(|e| RecorderError::Io(io::Error::other(e.to_string())))
    }

    fn write_sample_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        let result = match (self.format.encoding, self.format.bits_per_sample) {
            (SampleEncoding::Float, _) => {
                self.writer.write_sample(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            // Unsigned 8-bit PCM on the wire, hound takes it signed
            (_, 8) => self.writer.write_sample((bytes[0] as i16 - 128) as i8),
            (_, 16) => self.writer.write_sample(i16::from_le_bytes([bytes[0], bytes[1]])),
            (_, 24) => {
                let value = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8;
                self.writer.write_sample(value)
            }
            _ => self
                .writer
                .write_sample(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        };
        self.samples += 1;
        result.map_err(hound_to_io)
    }
}

impl Write for WavStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let width = (self.format.bits_per_sample / 8) as usize;
        self.pending.extend_from_slice(buf);

        let whole = self.pending.len() - self.pending.len() % width;
        let data = std::mem::take(&mut self.pending);
        for sample in data[..whole].chunks_exact(width) {
            self.write_sample_bytes(sample)?;
        }
        self.pending = data[whole..].to_vec();

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().map_err(hound_to_io)
    }
}

fn hound_to_io(e: hound::Error) -> io::Error {
    match e {
        hound::Error::IoError(io) => io,
        other => io::Error::other(other.to_string()),
    }
}
