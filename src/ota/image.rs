//! Bench transport: streams an app image from a `file://` URL.
//!
//! Mirrors what `esp_https_ota` does on target closely enough to exercise
//! the updater on a host: the descriptor is read from the image header, the
//! body arrives in fixed-size chunks, and `finish` checks the SHA-256 of the
//! received image before writing it to the destination.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::config::OtaConfig;

use super::descriptor::{AppDescriptor, APP_DESC_SIZE};
use super::transport::{Fault, FaultKind, OtaSession, OtaTransport, Progress};

/// First byte of every ESP app image.
pub const IMAGE_MAGIC: u8 = 0xE9;
/// esp_image_header_t (24) + first esp_image_segment_header_t (8)
pub const APP_DESC_OFFSET: usize = 32;
const HEADER_LEN: usize = APP_DESC_OFFSET + APP_DESC_SIZE;

/// Assemble an image the transport accepts: header, descriptor, body.
pub fn build_image(desc: &AppDescriptor, body: &[u8]) -> Vec<u8> {
    let mut image = vec![0u8; APP_DESC_OFFSET];
    image[0] = IMAGE_MAGIC;
    image.extend_from_slice(desc.as_bytes());
    image.extend_from_slice(body);
    image
}

pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub struct ImageTransport {
    destination: PathBuf,
    expected_sha256: Option<[u8; 32]>,
}

impl ImageTransport {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            expected_sha256: None,
        }
    }

    /// Refuse to commit unless the received image hashes to `digest`.
    pub fn with_expected_sha256(mut self, digest: [u8; 32]) -> Self {
        self.expected_sha256 = Some(digest);
        self
    }
}

impl OtaTransport for ImageTransport {
    type Session = ImageSession;

    fn begin(&mut self, config: &OtaConfig) -> Result<ImageSession, Fault> {
        if config.scheme().as_deref() != Some("file") {
            return Err(Fault::new(
                FaultKind::Config,
                -1,
                format!("bench transport only serves file:// URLs, got '{}'", config.url),
            ));
        }

        let path = PathBuf::from(config.location());
        let file = File::open(&path).map_err(|e| {
            Fault::new(
                FaultKind::Transport,
                e.raw_os_error().unwrap_or(-1),
                format!("cannot open {}: {}", path.display(), e),
            )
        })?;
        let total = file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| Fault::new(FaultKind::Transport, -1, e.to_string()))?;

        log::info!("Bench OTA source {} ({} bytes)", path.display(), total);

        Ok(ImageSession {
            file,
            total,
            received: Vec::new(),
            chunk: vec![0u8; config.buffer_size],
            destination: self.destination.clone(),
            expected_sha256: self.expected_sha256,
        })
    }
}

pub struct ImageSession {
    file: File,
    total: u64,
    received: Vec<u8>,
    chunk: Vec<u8>,
    destination: PathBuf,
    expected_sha256: Option<[u8; 32]>,
}

impl ImageSession {
    fn read_chunk(&mut self, limit: usize) -> Result<usize, Fault> {
        let limit = limit.min(self.chunk.len());
        loop {
            match self.file.read(&mut self.chunk[..limit]) {
                Ok(n) => {
                    self.received.extend_from_slice(&self.chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Fault::new(
                        FaultKind::Transport,
                        e.raw_os_error().unwrap_or(-1),
                        format!("read failed: {}", e),
                    ))
                }
            }
        }
    }
}

impl OtaSession for ImageSession {
    fn image_descriptor(&mut self) -> Result<AppDescriptor, Fault> {
        if self.chunk.len() < HEADER_LEN {
            self.chunk.resize(HEADER_LEN, 0);
        }
        while self.received.len() < HEADER_LEN {
            let want = HEADER_LEN - self.received.len();
            if self.read_chunk(want)? == 0 {
                return Err(Fault::new(
                    FaultKind::Protocol,
                    self.received.len() as i32,
                    "image shorter than its header",
                ));
            }
        }

        if self.received[0] != IMAGE_MAGIC {
            return Err(Fault::new(
                FaultKind::Protocol,
                self.received[0] as i32,
                "bad image magic",
            ));
        }
        AppDescriptor::from_bytes(&self.received[APP_DESC_OFFSET..HEADER_LEN])
            .map_err(|e| Fault::new(FaultKind::Protocol, e.code(), e.to_string()))
    }

    fn perform(&mut self) -> Result<Progress, Fault> {
        let len = self.chunk.len();
        match self.read_chunk(len)? {
            0 => Ok(Progress::Complete),
            _ => Ok(Progress::InProgress),
        }
    }

    fn image_len_read(&self) -> u32 {
        self.received.len() as u32
    }

    fn is_complete_data_received(&self) -> bool {
        self.received.len() as u64 == self.total
    }

    fn finish(self) -> Result<(), Fault> {
        let digest = Sha256::digest(&self.received);
        if let Some(expected) = self.expected_sha256 {
            if digest.as_slice() != expected.as_slice() {
                return Err(Fault::new(
                    FaultKind::Protocol,
                    -1,
                    format!("image SHA-256 mismatch, got {}", sha256_hex(&self.received)),
                ));
            }
        }

        std::fs::write(&self.destination, &self.received).map_err(|e| {
            Fault::new(
                FaultKind::Transport,
                e.raw_os_error().unwrap_or(-1),
                format!("cannot write {}: {}", self.destination.display(), e),
            )
        })?;
        log::info!(
            "Committed {} bytes to {}",
            self.received.len(),
            self.destination.display()
        );
        Ok(())
    }

    fn abort(self) {
        log::warn!("Bench OTA aborted after {} bytes", self.received.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_image_layout() {
        let desc = AppDescriptor::new("node", "2.0.0", [0; 32]);
        let image = build_image(&desc, &[1, 2, 3]);
        assert_eq!(image[0], IMAGE_MAGIC);
        assert_eq!(image.len(), HEADER_LEN + 3);
        assert_eq!(&image[APP_DESC_OFFSET..HEADER_LEN], &desc.as_bytes()[..]);
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_begin_rejects_non_file_urls() {
        let mut transport = ImageTransport::new(std::env::temp_dir().join("unused.bin"));
        let cfg = OtaConfig::new("https://fw.local/app.bin");
        let fault = transport.begin(&cfg).err().unwrap();
        assert_eq!(fault.kind, FaultKind::Config);
    }
}
