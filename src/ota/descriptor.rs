// Application descriptor: the fixed 256-byte esp_app_desc_t blob at the start
// of every app image. Published verbatim as the OTA_APP_DESC payload.

use crate::error::{Error, OtaStep};

pub const APP_DESC_SIZE: usize = 256;
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;

// Field offsets in esp_app_desc_t
const OFF_MAGIC: usize = 0;
const OFF_SECURE_VERSION: usize = 4;
const OFF_VERSION: usize = 16;
const OFF_PROJECT_NAME: usize = 48;
const OFF_TIME: usize = 80;
const OFF_DATE: usize = 96;
const OFF_IDF_VER: usize = 112;
const OFF_ELF_SHA256: usize = 144;

#[derive(Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    raw: [u8; APP_DESC_SIZE],
}

impl AppDescriptor {
    /// Parse a descriptor, checking size and magic word.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let raw: [u8; APP_DESC_SIZE] = bytes.try_into().map_err(|_| Error::Protocol {
            step: OtaStep::Descriptor,
            raw: bytes.len() as i32,
        })?;
        let descriptor = Self { raw };
        if descriptor.magic() != APP_DESC_MAGIC {
            return Err(Error::Protocol {
                step: OtaStep::Descriptor,
                raw: descriptor.magic() as i32,
            });
        }
        Ok(descriptor)
    }

    /// Build a descriptor for a bench image.
    pub fn new(project_name: &str, version: &str, elf_sha256: [u8; 32]) -> Self {
        let mut raw = [0u8; APP_DESC_SIZE];
        raw[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&APP_DESC_MAGIC.to_le_bytes());
        write_str(&mut raw[OFF_VERSION..OFF_PROJECT_NAME], version);
        write_str(&mut raw[OFF_PROJECT_NAME..OFF_TIME], project_name);
        raw[OFF_ELF_SHA256..OFF_ELF_SHA256 + 32].copy_from_slice(&elf_sha256);
        Self { raw }
    }

    pub fn as_bytes(&self) -> &[u8; APP_DESC_SIZE] {
        &self.raw
    }

    pub fn magic(&self) -> u32 {
        u32::from_le_bytes([self.raw[0], self.raw[1], self.raw[2], self.raw[3]])
    }

    pub fn secure_version(&self) -> u32 {
        let b = &self.raw[OFF_SECURE_VERSION..OFF_SECURE_VERSION + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn version(&self) -> &str {
        read_str(&self.raw[OFF_VERSION..OFF_PROJECT_NAME])
    }

    pub fn project_name(&self) -> &str {
        read_str(&self.raw[OFF_PROJECT_NAME..OFF_TIME])
    }

    pub fn build_time(&self) -> &str {
        read_str(&self.raw[OFF_TIME..OFF_DATE])
    }

    pub fn build_date(&self) -> &str {
        read_str(&self.raw[OFF_DATE..OFF_IDF_VER])
    }

    pub fn idf_version(&self) -> &str {
        read_str(&self.raw[OFF_IDF_VER..OFF_ELF_SHA256])
    }

    pub fn elf_sha256(&self) -> &[u8] {
        &self.raw[OFF_ELF_SHA256..OFF_ELF_SHA256 + 32]
    }
}

impl std::fmt::Debug for AppDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppDescriptor")
            .field("project_name", &self.project_name())
            .field("version", &self.version())
            .field("secure_version", &self.secure_version())
            .field("idf_version", &self.idf_version())
            .finish()
    }
}

fn write_str(field: &mut [u8], value: &str) {
    // Keep a trailing NUL
    let len = value.len().min(field.len() - 1);
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
}

fn read_str(field: &[u8]) -> &str {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}
