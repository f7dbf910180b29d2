//! Firmware images for the host programmer.
//!
//! Images are word addressed. Intel HEX files for 14-bit cores are byte
//! addressed, two bytes per word with the low byte first, so byte address
//! `2n` holds the low half of word `n`.

use std::path::Path;

/// Word value of locations a HEX file leaves unset
pub const BLANK_WORD: u16 = 0xFFFF;

/// MOVLP k, load the upper program counter bits
const OP_MOVLP: u16 = 0x3180;
/// GOTO k, jump within the current 2K page
const OP_GOTO: u16 = 0x2800;
const PAGE_MASK: u16 = 0x07FF;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ImageError {
    #[error("unable to read firmware file: {0}")]
    Io(String),
    #[error("invalid Intel HEX: {0}")]
    Hex(String),
    #[error("image holds {words} words, at least {required} needed")]
    TooSmall { words: usize, required: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    words: Vec<u16>,
}

impl Image {
    /// Create an image of `len` blank words
    pub fn blank(len: usize) -> Self {
        Self {
            words: vec![BLANK_WORD; len],
        }
    }

    pub fn from_words(words: Vec<u16>) -> Self {
        Self { words }
    }

    /// Read an Intel HEX file into an image of `len` words
    pub fn from_file<P: AsRef<Path>>(path: P, len: usize) -> Result<Self, ImageError> {
        let p = path.as_ref();
        let text = std::fs::read_to_string(p).map_err(|e| ImageError::Io(e.to_string()))?;

        info!("Read {} as Intel HEX", p.display());
        Self::from_ihex(&text, len)
    }

    /// Parse Intel HEX text into an image of `len` words.
    ///
    /// Data beyond the image, such as configuration words, is skipped.
    pub fn from_ihex(text: &str, len: usize) -> Result<Self, ImageError> {
        use ihex::Record::*;

        let mut image = Self::blank(len);
        let mut base_address = 0u32;
        let mut skipped = 0usize;

        for record in ihex::Reader::new(text) {
            let record = record.map_err(|e| ImageError::Hex(e.to_string()))?;

            match record {
                Data { offset, value } => {
                    let start = base_address + u32::from(offset);
                    for (i, b) in value.iter().enumerate() {
                        if !image.set_byte(start + i as u32, *b) {
                            skipped += 1;
                        }
                    }
                }
                ExtendedSegmentAddress(address) => base_address = u32::from(address) * 16,
                ExtendedLinearAddress(address) => base_address = u32::from(address) << 16,
                EndOfFile | StartSegmentAddress { .. } | StartLinearAddress(_) => (),
            }
        }

        if skipped > 0 {
            warn!("Skipped {} bytes outside program flash", skipped);
        }

        Ok(image)
    }

    fn set_byte(&mut self, byte_address: u32, b: u8) -> bool {
        let w = match self.words.get_mut((byte_address / 2) as usize) {
            Some(w) => w,
            None => return false,
        };
        *w = if byte_address % 2 == 0 {
            (*w & 0xFF00) | u16::from(b)
        } else {
            (*w & 0x00FF) | (u16::from(b) << 8)
        };
        true
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Up to `len` words starting at `address`, shorter at the image end
    pub fn row(&self, address: u16, len: u16) -> &[u16] {
        let start = usize::from(address).min(self.words.len());
        let end = (start + usize::from(len)).min(self.words.len());
        &self.words[start..end]
    }

    /// Whether a run of words was left entirely unset
    pub fn is_blank(words: &[u16]) -> bool {
        words.iter().all(|w| *w == BLANK_WORD)
    }

    /// Move the application's reset vector below the bootloader.
    ///
    /// The first two words are copied to `boot_start - 2`, where the
    /// bootloader jumps to start the application, and replaced with a long
    /// jump to `boot_start` so a reset always enters the bootloader.
    pub fn relocate_reset_vector(&mut self, boot_start: u16) -> Result<(), ImageError> {
        let required = usize::from(boot_start);
        if boot_start < 4 || self.words.len() < required {
            return Err(ImageError::TooSmall {
                words: self.words.len(),
                required: required.max(4),
            });
        }

        let app = required - 2;
        self.words.copy_within(0..2, app);

        self.words[0] = OP_MOVLP | (boot_start >> 8);
        self.words[1] = OP_GOTO | (boot_start & PAGE_MASK);

        debug!(
            "Reset vector relocated to 0x{:04x}: {:04x} {:04x}",
            app, self.words[app], self.words[app + 1]
        );
        Ok(())
    }
}
