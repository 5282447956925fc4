//! MCU Chip definition, with chip-specific or chip-family-specific flags
use serde::{Deserialize, Serialize};

use crate::constants::pic16::RESET_VECTOR_WORDS;
use crate::error::{Error, Result};

/// Families the PIC16 frame layout applies to.
const SUPPORTED_FAMILIES: &[&str] = &["16F8XX", "16F8X"];

/// MCU Family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub family: String,
    pub description: String,
    /// Write/erase granularity in words.
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub page_size: u32,
    /// Words at the top of flash taken by the relocated reset vector and the
    /// bootloader itself.
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub bootloader_size: u32,
    pub variants: Vec<Chip>,
}

/// Represents an MCU chip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chip {
    /// Chip's name, the first of the variants sharing the type id
    pub name: String,
    /// Type id reported by the bootloader on identify
    #[serde(deserialize_with = "parse_chip_id")]
    pub chip_id: u8,
    #[serde(default)]
    aliases: Vec<String>,

    #[serde(default)]
    pub family: String,

    /// Program memory size in words
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub flash_size: u32,
    #[serde(default)]
    pub page_size: u32,
    #[serde(default)]
    pub bootloader_size: u32,
}

impl ::std::fmt::Display for Chip {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "{}(0x{:02x}, {})", self.name, self.chip_id, self.family)
    }
}

pub struct ChipDB {
    families: Vec<Family>,
}

impl ChipDB {
    pub fn load() -> Result<Self> {
        let families = [
            include_str!("../devices/pic16f8xx.yaml"),
            include_str!("../devices/pic16f8x.yaml"),
        ]
        .iter()
        .map(|raw| {
            serde_yaml::from_str(raw)
                .map_err(|e| Error::Config(format!("device database: {}", e)))
        })
        .collect::<Result<Vec<Family>>>()?;
        Ok(ChipDB { families })
    }

    pub fn chips(&self) -> impl Iterator<Item = Chip> + '_ {
        self.families
            .iter()
            .flat_map(|family| family.variants.iter().map(move |c| patch(family, c)))
    }

    pub fn find_by_id(&self, chip_id: u8) -> Result<Chip> {
        let chip = self
            .chips()
            .find(|c| c.chip_id == chip_id)
            .ok_or(Error::UnknownDevice(chip_id))?;
        log::debug!("Find chip: {}", chip);
        Ok(chip)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Chip> {
        let wanted = normalize_name(name);
        self.chips()
            .find(|c| {
                normalize_name(&c.name) == wanted
                    || c.aliases.iter().any(|a| normalize_name(a) == wanted)
            })
            .ok_or_else(|| Error::UnknownDeviceName(name.to_string()))
    }
}

// Family level defaults end up on every chip
fn patch(family: &Family, chip: &Chip) -> Chip {
    let mut chip = chip.clone();
    chip.family = family.family.clone();
    if chip.page_size == 0 {
        chip.page_size = family.page_size;
    }
    if chip.bootloader_size == 0 {
        chip.bootloader_size = family.bootloader_size;
    }
    chip
}

fn normalize_name(name: &str) -> String {
    let upper = name.trim().to_uppercase();
    upper.strip_prefix("PIC").unwrap_or(&upper).to_string()
}

impl Chip {
    pub fn new(
        name: &str,
        chip_id: u8,
        family: &str,
        flash_size: u32,
        page_size: u32,
        bootloader_size: u32,
    ) -> Self {
        Chip {
            name: name.to_string(),
            chip_id,
            aliases: Vec::new(),
            family: family.to_string(),
            flash_size,
            page_size,
            bootloader_size,
        }
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_FAMILIES.contains(&self.family.as_str())
    }

    pub fn ensure_supported(&self) -> Result<()> {
        if !self.is_supported() {
            return Err(Error::UnsupportedDevice(self.family.clone()));
        }
        if self.page_size == 0
            || self.page_bytes() > crate::constants::MAX_PAYLOAD_SIZE
            || self.flash_size % self.page_size != 0
            || self.bootloader_size < RESET_VECTOR_WORDS
            || self.bootloader_size >= self.flash_size
        {
            return Err(Error::Config(format!("inconsistent memory layout for {}", self)));
        }
        Ok(())
    }

    /// One page in bytes, the payload of a single write frame.
    pub const fn page_bytes(&self) -> usize {
        self.page_size as usize * 2
    }

    /// Word address the user reset vector is moved to.
    pub const fn relocated_vector_word(&self) -> u32 {
        self.flash_size - self.bootloader_size
    }

    /// Word address the bootloader starts at, right after the moved vector.
    pub const fn loader_entry_word(&self) -> u32 {
        self.relocated_vector_word() + RESET_VECTOR_WORDS
    }

    /// First byte address the user program may not occupy.
    pub const fn user_limit(&self) -> u32 {
        self.relocated_vector_word() * 2
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

fn parse_chip_id<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let id = parse_address_and_offset(deserializer)?;
    u8::try_from(id).map_err(serde::de::Error::custom)
}

fn parse_address_and_offset<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => return u32::try_from(n).map_err(serde::de::Error::custom),
        NumberOrString::String(s) => s,
    };
    let err = |_: std::num::ParseIntError| -> D::Error {
        serde::de::Error::custom(format!("error while parsing {:?}", s))
    };
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(err)
    } else if let Some(k) = ["KiB", "KB", "K"].iter().find_map(|u| s.strip_suffix(u)) {
        Ok(1024 * k.parse::<u32>().map_err(err)?)
    } else {
        s.parse().map_err(err)
    }
}
