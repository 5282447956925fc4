//! Tiny Bootloader wire constants.

/// Sent by the device after every accepted frame.
pub const ACK: u8 = b'K';

/// Value of flash cells that are not covered by the firmware image.
pub const ERASE_VALUE: u8 = 0xff;

/// Largest payload a single frame can carry, the length field is one byte.
pub const MAX_PAYLOAD_SIZE: usize = 0xff;

pub mod commands {
    /// Identify request, answered with `[type_id, ACK]`.
    pub const IDENTIFY: u8 = 0xc1;
    /// Read back a page. Write frames start with the address high byte,
    /// which is always below 0x20 on PIC16, so opcodes never collide.
    pub const READ_PAGE: u8 = 0xc2;
}

/// PIC16 program memory layout, in byte addresses as used by HEX files.
pub mod pic16 {
    use std::ops::Range;

    /// Configuration words (word 0x2000..0x2100).
    pub const CONFIG_REGION: Range<u32> = 0x4000..0x4200;
    /// Data EEPROM (word 0x2100..0x2200).
    pub const EEPROM_REGION: Range<u32> = 0x4200..0x4400;

    /// Words of the user reset vector that are relocated.
    pub const RESET_VECTOR_WORDS: u32 = 4;

    pub const OP_MOVLW: u16 = 0x3000;
    pub const OP_GOTO: u16 = 0x2800;
    pub const GOTO_MASK: u16 = 0x3800;
    pub const MOVWF_PCLATH: u16 = 0x008a;
    pub const CLRF_PCLATH: u16 = 0x018a;
    pub const BCF_PCLATH_3: u16 = 0x118a;
    pub const BCF_PCLATH_4: u16 = 0x120a;
}
