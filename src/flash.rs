//! Program flash layout, controller abstraction and write sequencing.
//!
//! Flash is word addressed. Erase works on whole rows, writes are staged word
//! by word into the controller's row latches and only reach the array when a
//! committing write is issued.

/// Total program flash, in bytes of the two byte word representation
pub const FLASH_SIZE: u32 = 8192;

/// Number of addressable program words
pub const FLASH_WORDS: u16 = (FLASH_SIZE / 2) as u16;

/// Words per row, for both erase and write
pub const ROW_WORDS: usize = 32;

const ROW_MASK: u16 = ROW_WORDS as u16 - 1;

/// First word of the resident bootloader, row aligned
pub const BOOT_START: u16 = 0x0E00;

/// Long jump into the application, placed just below the bootloader
pub const APP_START: u16 = BOOT_START - 2;

/// Content of an erased 14-bit program word
pub const ERASED_WORD: u16 = 0x3FFF;

/// Row-granular flash controller.
///
/// `stage_word` fills a latch without touching the array, `commit_word` fills
/// the final latch and programs every latched word of that row in one go.
/// Latches left untouched before a commit must leave the existing contents
/// of their word unchanged.
pub trait FlashController {
    /// Read a single word
    fn read_word(&mut self, address: u16) -> u16;

    /// Latch a word for the next commit
    fn stage_word(&mut self, address: u16, value: u16);

    /// Latch a final word and program the row holding it
    fn commit_word(&mut self, address: u16, value: u16);

    /// Erase the row containing `address`
    fn erase_row(&mut self, address: u16);
}

/// First word of the row containing `address`
pub fn row_base(address: u16) -> u16 {
    address & !ROW_MASK
}

/// Whether `address` is the final word of its row
pub fn is_row_end(address: u16) -> bool {
    address & ROW_MASK == ROW_MASK
}

/// Check that `count` words starting at `address` lie inside program flash
pub fn in_bounds(address: u16, count: usize) -> bool {
    address < FLASH_WORDS && usize::from(address) + count <= usize::from(FLASH_WORDS)
}

/// Write a batch of words starting at `address`.
///
/// Every word is latched except the last word of the batch, and the last
/// word of any row the batch runs off the end of, which are committed.
pub fn program<F>(flash: &mut F, address: u16, data: &[u16])
where
    F: FlashController + ?Sized,
{
    let last = match data.len().checked_sub(1) {
        Some(l) => l,
        None => return,
    };

    for (i, value) in data.iter().enumerate() {
        let a = address.wrapping_add(i as u16);

        if i == last || is_row_end(a) {
            trace!("commit 0x{:04x}: 0x{:04x}", a, value);
            flash.commit_word(a, *value);
        } else {
            flash.stage_word(a, *value);
        }
    }
}

/// In-memory flash array with row latches.
///
/// Addresses wrap at the array size as the address register would.
#[derive(Clone, Debug)]
pub struct RamFlash<const N: usize> {
    words: [u16; N],
    latches: [Option<u16>; ROW_WORDS],
    commits: usize,
    erases: usize,
}

/// Emulation of the whole device flash
pub type DeviceFlash = RamFlash<{ FLASH_WORDS as usize }>;

impl<const N: usize> RamFlash<N> {
    /// Create a fully erased flash
    pub fn new() -> Self {
        Self::filled(ERASED_WORD)
    }

    /// Create a flash with every word set to `value`
    pub fn filled(value: u16) -> Self {
        Self {
            words: [value; N],
            latches: [None; ROW_WORDS],
            commits: 0,
            erases: 0,
        }
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    pub fn words_mut(&mut self) -> &mut [u16] {
        &mut self.words
    }

    /// Number of rows programmed so far
    pub fn commits(&self) -> usize {
        self.commits
    }

    /// Number of rows erased so far
    pub fn erases(&self) -> usize {
        self.erases
    }

    /// Whether any latch holds a word not yet committed
    pub fn has_pending(&self) -> bool {
        self.latches.iter().any(Option::is_some)
    }

    fn index(address: u16) -> usize {
        usize::from(address) % N
    }

    fn latch(&mut self, address: u16, value: u16) {
        self.latches[usize::from(address & ROW_MASK)] = Some(value);
    }
}

impl<const N: usize> Default for RamFlash<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FlashController for RamFlash<N> {
    fn read_word(&mut self, address: u16) -> u16 {
        self.words[Self::index(address)]
    }

    fn stage_word(&mut self, address: u16, value: u16) {
        self.latch(address, value);
    }

    fn commit_word(&mut self, address: u16, value: u16) {
        self.latch(address, value);

        let base = row_base(address);
        for (offset, latch) in self.latches.iter_mut().enumerate() {
            if let Some(v) = latch.take() {
                let i = Self::index(base.wrapping_add(offset as u16));
                self.words[i] = v;
            }
        }
        self.commits += 1;
    }

    fn erase_row(&mut self, address: u16) {
        let base = Self::index(row_base(address));
        let end = core::cmp::min(base + ROW_WORDS, N);
        for w in &mut self.words[base..end] {
            *w = ERASED_WORD;
        }
        self.erases += 1;
    }
}
