//! Bootloader info record.
//!
//! The record is a length byte followed by tagged little-endian fields. The
//! device sends a fixed record built from compile-time constants, the host
//! decodes it to learn the flash geometry and where the bootloader lives.

use crate::flash::{BOOT_START, FLASH_SIZE, ROW_WORDS};

/// Length of the padded identification string
pub const NAME_LEN: usize = 20;

/// Size byte value: number of record bytes following it
pub const INFO_SIZE: u8 = 23 + NAME_LEN as u8;

/// Full record length on the wire, including the size byte
pub const INFO_LEN: usize = 1 + INFO_SIZE as usize;

/// Bootloader firmware revision, 0.1
pub const REVISION: u16 = 0x0100;

/// Field tags
pub mod tag {
    pub const FAMILY: u8 = 1;
    pub const MCU_ID: u8 = 2;
    pub const ERASE_ROW: u8 = 3;
    pub const WRITE_ROW: u8 = 4;
    pub const REVISION: u8 = 5;
    pub const BOOT_START: u8 = 6;
    pub const NAME: u8 = 7;
    pub const FLASH_SIZE: u8 = 8;
}

/// Device families known to the protocol
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Family {
    Pic16 = 1,
    Pic18 = 2,
    Pic18fj = 3,
    Pic24 = 4,
    DsPic = 10,
    Pic32 = 20,
}

impl Family {
    pub fn from_tag(v: u16) -> Option<Self> {
        let f = match v {
            1 => Family::Pic16,
            2 => Family::Pic18,
            3 => Family::Pic18fj,
            4 => Family::Pic24,
            10 => Family::DsPic,
            20 => Family::Pic32,
            _ => return None,
        };
        Some(f)
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum InfoError {
    #[cfg_attr(feature = "std", error("info record truncated"))]
    Truncated,
    #[cfg_attr(feature = "std", error("info record size {0} does not match its contents"))]
    Size(u8),
    #[cfg_attr(feature = "std", error("unsupported info field 0x{0:02x}"))]
    UnsupportedField(u8),
    #[cfg_attr(feature = "std", error("info field 0x{0:02x} missing"))]
    MissingField(u8),
    #[cfg_attr(feature = "std", error("unusable flash geometry"))]
    Geometry,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Raw family tag, see [`Family`]
    pub family: u16,
    /// Total program flash in bytes
    pub flash_size: u32,
    /// Erase row size in words
    pub erase_row: u16,
    /// Write row size in words
    pub write_row: u16,
    pub revision: u16,
    /// Word address of the first bootloader row
    pub boot_start: u32,
    pub name: [u8; NAME_LEN],
}

/// The record this build reports
pub const DEVICE_INFO: DeviceInfo = DeviceInfo {
    family: Family::Pic16 as u16,
    flash_size: FLASH_SIZE,
    erase_row: ROW_WORDS as u16,
    write_row: ROW_WORDS as u16,
    revision: REVISION,
    boot_start: BOOT_START as u32,
    name: pad_name(b"BuckClick"),
};

/// Zero pad an identification string, truncating past `NAME_LEN`
pub const fn pad_name(s: &[u8]) -> [u8; NAME_LEN] {
    let mut name = [0u8; NAME_LEN];
    let mut i = 0;
    while i < s.len() && i < NAME_LEN {
        name[i] = s[i];
        i += 1;
    }
    name
}

struct Record {
    buf: [u8; INFO_LEN],
    len: usize,
}

impl Record {
    fn bytes(&mut self, data: &[u8]) {
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    fn word(&mut self, tag: u8, v: u16) {
        self.bytes(&[tag]);
        self.bytes(&v.to_le_bytes());
    }

    fn long(&mut self, tag: u8, v: u32) {
        self.bytes(&[tag]);
        self.bytes(&v.to_le_bytes());
    }
}

impl DeviceInfo {
    /// Encode the record as sent on the wire, size byte first
    pub fn to_bytes(&self) -> [u8; INFO_LEN] {
        let mut r = Record {
            buf: [0u8; INFO_LEN],
            len: 0,
        };

        r.bytes(&[INFO_SIZE]);
        r.word(tag::FAMILY, self.family);
        r.long(tag::FLASH_SIZE, self.flash_size);
        r.word(tag::ERASE_ROW, self.erase_row);
        r.word(tag::WRITE_ROW, self.write_row);
        r.word(tag::REVISION, self.revision);
        r.long(tag::BOOT_START, self.boot_start);
        r.bytes(&[tag::NAME]);
        r.bytes(&self.name);

        debug_assert_eq!(r.len, INFO_LEN);
        r.buf
    }

    /// Decode the fields following the size byte.
    ///
    /// Fields may appear in any order. The MCU id field is obsolete and
    /// rejected, as is any tag this decoder does not know.
    pub fn from_fields(fields: &[u8]) -> Result<Self, InfoError> {
        let mut family = None;
        let mut flash_size = None;
        let mut erase_row = None;
        let mut write_row = None;
        let mut revision = None;
        let mut boot_start = None;
        let mut name = None;

        let mut rest = fields;
        while let Some((t, tail)) = rest.split_first() {
            let len = match *t {
                tag::FAMILY | tag::ERASE_ROW | tag::WRITE_ROW | tag::REVISION => 2,
                tag::FLASH_SIZE | tag::BOOT_START => 4,
                tag::NAME => NAME_LEN,
                other => return Err(InfoError::UnsupportedField(other)),
            };
            if tail.len() < len {
                return Err(InfoError::Truncated);
            }
            let (v, tail) = tail.split_at(len);

            match *t {
                tag::FAMILY => family = Some(le16(v)),
                tag::ERASE_ROW => erase_row = Some(le16(v)),
                tag::WRITE_ROW => write_row = Some(le16(v)),
                tag::REVISION => revision = Some(le16(v)),
                tag::FLASH_SIZE => flash_size = Some(le32(v)),
                tag::BOOT_START => boot_start = Some(le32(v)),
                _ => {
                    let mut n = [0u8; NAME_LEN];
                    n.copy_from_slice(v);
                    name = Some(n);
                }
            }
            rest = tail;
        }

        Ok(Self {
            family: family.ok_or(InfoError::MissingField(tag::FAMILY))?,
            flash_size: flash_size.ok_or(InfoError::MissingField(tag::FLASH_SIZE))?,
            erase_row: erase_row.ok_or(InfoError::MissingField(tag::ERASE_ROW))?,
            write_row: write_row.ok_or(InfoError::MissingField(tag::WRITE_ROW))?,
            revision: revision.ok_or(InfoError::MissingField(tag::REVISION))?,
            boot_start: boot_start.ok_or(InfoError::MissingField(tag::BOOT_START))?,
            name: name.unwrap_or([0u8; NAME_LEN]),
        })
    }

    /// Decode a complete record, size byte first
    pub fn from_bytes(record: &[u8]) -> Result<Self, InfoError> {
        let (size, fields) = record.split_first().ok_or(InfoError::Truncated)?;
        if fields.len() != usize::from(*size) {
            return Err(InfoError::Size(*size));
        }
        Self::from_fields(fields)
    }

    pub fn family(&self) -> Option<Family> {
        Family::from_tag(self.family)
    }

    /// Identification string up to the first zero byte
    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

fn le16(v: &[u8]) -> u16 {
    u16::from_le_bytes([v[0], v[1]])
}

fn le32(v: &[u8]) -> u32 {
    u32::from_le_bytes([v[0], v[1], v[2], v[3]])
}
