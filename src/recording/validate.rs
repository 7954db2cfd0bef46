/**
 * ============================================================================
 * OUTPUT VALIDATION MODULE
 * ============================================================================
 *
 * PURPOSE: Cheap structural probe of a finished container
 *
 * Only the leading bytes are inspected; nothing is decoded. A failed probe
 * is reported as a warning by the caller and the file is always kept.
 *
 * ============================================================================
 */

use crate::recording::logger::SessionLogger;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const PROBE_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    // ISO base media (mp4, mov, m4a)
    IsoBmff,
    // EBML (mkv, webm)
    Matroska,
    Wav,
    Avi,
    MpegTs,
}

impl ContainerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ContainerKind::IsoBmff => "mp4",
            ContainerKind::Matroska => "matroska",
            ContainerKind::Wav => "wav",
            ContainerKind::Avi => "avi",
            ContainerKind::MpegTs => "mpegts",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Missing,
    Empty,
    Unrecognized { size: u64 },
    Valid { kind: ContainerKind, size: u64 },
}

impl ProbeResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ProbeResult::Valid { .. })
    }

    pub fn size(&self) -> u64 {
        match self {
            ProbeResult::Unrecognized { size } | ProbeResult::Valid { size, .. } => *size,
            _ => 0,
        }
    }

    pub fn kind(&self) -> Option<ContainerKind> {
        match self {
            ProbeResult::Valid { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

// Identify a container from its first bytes
pub fn sniff_header(header: &[u8]) -> Option<ContainerKind> {
    if header.len() >= 8 {
        let box_type = &header[4..8];
        if matches!(box_type, b"ftyp" | b"moov" | b"mdat" | b"free" | b"wide" | b"skip") {
            return Some(ContainerKind::IsoBmff);
        }
    }
    if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(ContainerKind::Matroska);
    }
    if header.len() >= 12 && &header[0..4] == b"RIFF" {
        return match &header[8..12] {
            b"WAVE" => Some(ContainerKind::Wav),
            b"AVI " => Some(ContainerKind::Avi),
            _ => None,
        };
    }
    if header.first() == Some(&0x47) {
        return Some(ContainerKind::MpegTs);
    }
    None
}

pub fn probe_container(path: &Path, log: &SessionLogger) -> ProbeResult {
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return ProbeResult::Missing,
    };
    if size == 0 {
        return ProbeResult::Empty;
    }

    let mut header = [0u8; PROBE_BYTES];
    let read = match File::open(path).and_then(|mut file| read_prefix(&mut file, &mut header)) {
        Ok(n) => n,
        Err(e) => {
            log.warn(format_args!("Failed to read header of {:?}: {}", path, e));
            return ProbeResult::Unrecognized { size };
        }
    };

    match sniff_header(&header[..read]) {
        Some(kind) => ProbeResult::Valid { kind, size },
        None => ProbeResult::Unrecognized { size },
    }
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
