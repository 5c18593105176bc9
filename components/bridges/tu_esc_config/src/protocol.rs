use std::fmt::{self, Debug, Formatter};
use thumbsup_core::{ErrorKind, TuError, TuResult};

pub const CMD_EXIT: u8 = 0x00;
pub const CMD_SET_SETTINGS: u8 = 0xAA;
pub const CMD_SAVE_SETTINGS: u8 = 0xAB;
pub const CMD_GET_SETTINGS: u8 = 0xBB;
pub const CMD_GET_INFO: u8 = 0xCC;
pub const CMD_RESET: u8 = 0xDD;
pub const CMD_BOOTLOADER: u8 = 0xEE;
pub const CMD_WRITE_PAGE: u8 = 0xF1;
pub const CMD_KEEPALIVE: u8 = 0xFF;

pub const ACK: u8 = 0x30;
pub const NACK: u8 = 0xC1;

pub const CONFIG_BAUD: u32 = 19_200;
pub const BOOTLOADER_BAUD: u32 = 115_200;

/// Largest response payload accepted from an ESC.
pub const MAX_RESPONSE_LEN: usize = 512;
/// Largest payload we ever send: one flash page plus its address.
pub const MAX_REQUEST_LEN: usize = FLASH_PAGE_SIZE + 2;
pub const FLASH_PAGE_SIZE: usize = 256;

pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// `[CMD][LEN_LO][LEN_HI][DATA..][XOR]`, the XOR covering every byte before it.
#[derive(Clone, PartialEq)]
pub struct Am32Request<'a> {
    pub command: u8,
    pub data: &'a [u8],
}

impl<'a> Am32Request<'a> {
    pub fn new(command: u8, data: &'a [u8]) -> Self {
        Am32Request { command, data }
    }

    pub fn packet_size_bytes(&self) -> usize {
        self.data.len() + 4
    }

    pub fn serialize(&self) -> TuResult<Vec<u8>> {
        if self.data.len() > MAX_REQUEST_LEN {
            return Err(TuError::new(
                ErrorKind::BufferOverflow,
                format!(
                    "AM32 request of {} bytes exceeds {}",
                    self.data.len(),
                    MAX_REQUEST_LEN
                ),
            ));
        }
        let mut out = Vec::with_capacity(self.packet_size_bytes());
        out.push(self.command);
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        out.extend_from_slice(self.data);
        out.push(xor_checksum(&out));
        Ok(out)
    }
}

impl Debug for Am32Request<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "cmd=0x{:02X} len={}", self.command, self.data.len())
    }
}

/// Interprets a one byte acknowledgement payload.
pub fn check_ack(command: u8, payload: &[u8]) -> TuResult<()> {
    match payload {
        [ACK] => Ok(()),
        [NACK] => Err(TuError::new(
            ErrorKind::CommFailure,
            format!("ESC refused command 0x{command:02X}"),
        )),
        other => Err(TuError::new(
            ErrorKind::CommFailure,
            format!(
                "unexpected {} byte reply to command 0x{:02X}",
                other.len(),
                command
            ),
        )),
    }
}
