//! Offline capture file reading.
use pcap::Capture;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub mod packet;

pub use packet::{DecodedPacket, LinkKind};

/// Failure to turn a capture file into packets.
///
/// Always recoverable: the pipeline substitutes the fallback feature vector.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Failed to open capture {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: pcap::Error,
    },

    #[error("Failed to read frame {frame}: {source}")]
    Read {
        frame: usize,
        #[source]
        source: pcap::Error,
    },
}

/// Read every frame of a pcap/pcapng file and decode it.
///
/// Either the whole file decodes or an error is returned; a partially read
/// stream is never handed back.
pub fn read_capture<P: AsRef<Path>>(path: P) -> Result<Vec<DecodedPacket>, CaptureError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(CaptureError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let mut capture = Capture::from_file(path).map_err(|source| CaptureError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let linktype = capture.get_datalink();
    let link = LinkKind::from_linktype(linktype.0);
    info!("Reading {} (link type {}, decoded as {:?})", path.display(), linktype.0, link);

    let mut packets = Vec::new();
    loop {
        match capture.next_packet() {
            Ok(frame) => packets.push(DecodedPacket::decode(link, frame.data)),
            Err(pcap::Error::NoMorePackets) => break,
            Err(source) => {
                return Err(CaptureError::Read {
                    frame: packets.len(),
                    source,
                })
            }
        }

        if packets.len().is_multiple_of(10_000) {
            debug!("Decoded {} frames", packets.len());
        }
    }

    info!("Decoded {} packets from {}", packets.len(), path.display());
    Ok(packets)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::packet::tests::{tcp_frame, udp_frame};
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Write frames as a classic little-endian pcap with Ethernet link type.
    pub fn write_pcap(frames: &[Vec<u8>]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let mut header = Vec::new();
        header.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes());
        header.extend_from_slice(&2u16.to_le_bytes());
        header.extend_from_slice(&4u16.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&65535u32.to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());
        file.write_all(&header).unwrap();

        for (i, frame) in frames.iter().enumerate() {
            let mut record = Vec::with_capacity(16 + frame.len());
            record.extend_from_slice(&(1_700_000_000u32 + i as u32).to_le_bytes());
            record.extend_from_slice(&0u32.to_le_bytes());
            record.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            record.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            record.extend_from_slice(frame);
            file.write_all(&record).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn reads_written_capture() {
        let frames = vec![
            tcp_frame(40000, 80, b"GET / HTTP/1.1\r\n\r\n"),
            udp_frame(40001, 53, &[0u8; 20]),
        ];
        let file = write_pcap(&frames);

        let packets = read_capture(file.path()).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].tcp, Some((40000, 80)));
        assert_eq!(packets[0].length, frames[0].len());
        assert_eq!(packets[1].udp, Some((40001, 53)));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = read_capture("/nonexistent/capture.pcap").unwrap_err();
        assert!(matches!(err, CaptureError::NotFound { .. }));
    }

    #[test]
    fn garbage_file_fails_to_open() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"definitely not a capture file").unwrap();
        file.flush().unwrap();

        let err = read_capture(file.path()).unwrap_err();
        assert!(matches!(err, CaptureError::Open { .. }));
    }
}
