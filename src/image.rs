//! Firmware memory image and its page view.
use std::collections::BTreeMap;
use std::ops::RangeBounds;

use crate::constants::{pic16, ERASE_VALUE};
use crate::device::Chip;
use crate::error::{Error, Result};

/// Sparse byte image of program memory, keyed by byte address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    memory: BTreeMap<u32, u8>,
}

/// One write unit: a page-aligned, fully populated slice of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Byte address of the first byte
    pub address: u32,
    pub data: Vec<u8>,
    /// Bytes that came from the image rather than from gap filling
    pub used: usize,
}

impl FromIterator<(u32, u8)> for FirmwareImage {
    fn from_iter<I: IntoIterator<Item = (u32, u8)>>(iter: I) -> Self {
        FirmwareImage {
            memory: iter.into_iter().collect(),
        }
    }
}

impl FirmwareImage {
    pub fn new(memory: BTreeMap<u32, u8>) -> Self {
        FirmwareImage { memory }
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Number of populated bytes.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn get(&self, address: u32) -> Option<u8> {
        self.memory.get(&address).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.memory.iter().map(|(&a, &v)| (a, v))
    }

    pub fn range<R: RangeBounds<u32>>(&self, range: R) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.memory.range(range).map(|(&a, &v)| (a, v))
    }

    /// Page-aligned pages in ascending order. Pages without any image byte
    /// are skipped, holes inside a page are filled with the erase value.
    pub fn pages(&self, page_size: usize) -> Vec<Page> {
        let page_size = page_size as u32;
        let mut pages: Vec<Page> = Vec::new();
        for (&address, &value) in &self.memory {
            let base = address - address % page_size;
            if pages.last().map(|p| p.address) != Some(base) {
                pages.push(Page {
                    address: base,
                    data: vec![ERASE_VALUE; page_size as usize],
                    used: 0,
                });
            }
            if let Some(page) = pages.last_mut() {
                page.data[(address - base) as usize] = value;
                page.used += 1;
            }
        }
        pages
    }

    /// Keep only what the bootloader can program on `chip`.
    ///
    /// Configuration words and data EEPROM are dropped with a warning. Any
    /// other byte at or above the user program limit is an error.
    pub fn program_memory(&self, chip: &Chip) -> Result<FirmwareImage> {
        let limit = chip.user_limit();
        let config = self.range(pic16::CONFIG_REGION).count();
        if config > 0 {
            log::warn!("Config data found ({} bytes), skipping", config);
        }
        let eeprom = self.range(pic16::EEPROM_REGION).count();
        if eeprom > 0 {
            log::warn!("EEPROM data found ({} bytes), skipping", eeprom);
        }

        if let Some((address, _)) = self.range(limit..).find(|(a, _)| {
            !pic16::CONFIG_REGION.contains(a) && !pic16::EEPROM_REGION.contains(a)
        }) {
            return Err(Error::ImageOutOfRange { address, limit });
        }
        Ok(self.range(..limit).collect())
    }

    /// Redirect the reset vector to the bootloader.
    ///
    /// The first words are replaced with a jump to the loader entry and the
    /// user's original vector is moved right below the bootloader, from
    /// where the bootloader starts the application.
    pub fn relocate_reset_vector(&self, chip: &Chip) -> FirmwareImage {
        let mut memory = self.memory.clone();

        let original: Vec<u16> = (0..pic16::RESET_VECTOR_WORDS)
            .filter_map(|w| self.word(w * 2))
            .collect();
        let (goto_found, pclath_needs_init) = inspect_reset_vector(&original);
        if !goto_found {
            log::warn!(
                "GOTO not found in first 4 words! Check reset vector initialization in your program"
            );
        }
        if original.is_empty() || original.len() > 3 {
            log::warn!("Invalid reset vector. Check reset vector initialization in your program");
        }

        let entry = chip.loader_entry_word() as u16;
        let jump = [
            pic16::OP_MOVLW | (entry >> 8),
            pic16::MOVWF_PCLATH,
            pic16::OP_GOTO | (entry & 0x07ff),
        ];
        put_words(&mut memory, 0, &jump);

        let mut moved = Vec::with_capacity(pic16::RESET_VECTOR_WORDS as usize);
        if pclath_needs_init {
            log::warn!("PCLATH not fully initialised before goto");
            moved.push(pic16::CLRF_PCLATH);
        }
        moved.extend(original.iter().take(3));
        put_words(&mut memory, chip.user_limit(), &moved);

        log::info!("Reset vector moved successfully");
        FirmwareImage { memory }
    }

    fn word(&self, address: u32) -> Option<u16> {
        let lo = self.get(address)?;
        let hi = self.get(address + 1).unwrap_or(0);
        Some(u16::from_le_bytes([lo, hi]))
    }
}

fn put_words(memory: &mut BTreeMap<u32, u8>, address: u32, words: &[u16]) {
    for (i, word) in words.iter().enumerate() {
        let [lo, hi] = word.to_le_bytes();
        let at = address + 2 * i as u32;
        memory.insert(at, lo);
        memory.insert(at + 1, hi);
    }
}

/// Returns (goto present, PCLATH not fully initialised before it).
fn inspect_reset_vector(words: &[u16]) -> (bool, bool) {
    let mut goto_found = false;
    let mut pclath = 0;
    for &code in words {
        if code & pic16::GOTO_MASK == pic16::OP_GOTO {
            goto_found = true;
        } else if code == pic16::CLRF_PCLATH || code == pic16::MOVWF_PCLATH {
            pclath = 2;
        } else if code == pic16::BCF_PCLATH_3 || code == pic16::BCF_PCLATH_4 {
            pclath += 1;
        }
    }
    (goto_found, pclath != 2)
}
