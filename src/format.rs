//! Firmware file formats
use std::collections::BTreeMap;
use std::path::Path;

use ihex::Record;

use crate::error::{Error, Result};
use crate::image::FirmwareImage;

/// Bytes per data record when writing HEX files.
const RECORD_SIZE: usize = 16;

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<FirmwareImage> {
    let p = path.as_ref();
    log::info!("Loading firmware from file '{}'...", p.display());
    let raw = std::fs::read(p).map_err(|source| Error::ImageRead {
        path: p.to_path_buf(),
        source,
    })?;
    let text = std::str::from_utf8(&raw).map_err(|e| Error::ImageParse {
        line: 0,
        reason: format!("not a text file: {}", e),
    })?;
    let image = read_ihex(text)?;
    log::info!("Read {} bytes of firmware from {}", image.len(), p.display());
    Ok(image)
}

/// Parse Intel HEX text, validating every record.
///
/// Errors carry the 1-based line number of the offending record.
pub fn read_ihex(data: &str) -> Result<FirmwareImage> {
    let mut base_address = 0u32;
    let mut memory = BTreeMap::new();
    let mut eof_line = None;

    for (idx, line) in data.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(eof) = eof_line {
            log::warn!(
                "Ignoring data at line {} after end-of-file record at line {}",
                line_no,
                eof
            );
            break;
        }

        let record = Record::from_record_string(line).map_err(|e| Error::ImageParse {
            line: line_no,
            reason: e.to_string(),
        })?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let overflow = || Error::ImageParse {
                    line: line_no,
                    reason: "address overflow".to_string(),
                };
                let start = base_address.checked_add(offset as u32).ok_or_else(overflow)?;
                for (i, byte) in value.into_iter().enumerate() {
                    let address = start.checked_add(i as u32).ok_or_else(overflow)?;
                    memory.insert(address, byte);
                }
            }
            EndOfFile => eof_line = Some(line_no),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    if eof_line.is_none() {
        log::warn!("No end-of-file record found");
    }
    Ok(FirmwareImage::new(memory))
}

/// Serialize an image back to Intel HEX.
///
/// Contiguous runs become data records of up to 16 bytes, extended linear
/// address records are emitted whenever the upper 16 address bits change.
pub fn write_ihex(image: &FirmwareImage) -> Result<String> {
    let mut records = Vec::new();
    let mut upper = 0u16;
    let mut chunk: Option<(u32, Vec<u8>)> = None;

    let mut flush = |chunk: Option<(u32, Vec<u8>)>, records: &mut Vec<Record>| {
        if let Some((start, value)) = chunk {
            let hi = (start >> 16) as u16;
            if hi != upper {
                records.push(Record::ExtendedLinearAddress(hi));
                upper = hi;
            }
            records.push(Record::Data {
                offset: start as u16,
                value,
            });
        }
    };

    for (address, byte) in image.iter() {
        chunk = match chunk {
            Some((start, mut value))
                if start + value.len() as u32 == address
                    && value.len() < RECORD_SIZE
                    && address >> 16 == start >> 16 =>
            {
                value.push(byte);
                Some((start, value))
            }
            other => {
                flush(other, &mut records);
                Some((address, vec![byte]))
            }
        };
    }
    flush(chunk, &mut records);
    records.push(Record::EndOfFile);

    ihex::create_object_file_representation(&records).map_err(|e| Error::ImageParse {
        line: 0,
        reason: e.to_string(),
    })
}
