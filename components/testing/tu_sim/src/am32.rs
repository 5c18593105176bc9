//! A one-wire AM32 ESC as seen from the controller side of the wire.
//! It only answers once it has seen the listen-mode pulse train, and only
//! at the baud rate of the mode it is in.
use log::debug;

pub const CONFIG_BAUD: u32 = 19_200;
pub const BOOTLOADER_BAUD: u32 = 115_200;

const CMD_EXIT: u8 = 0x00;
const CMD_SET_SETTINGS: u8 = 0xAA;
const CMD_SAVE_SETTINGS: u8 = 0xAB;
const CMD_GET_SETTINGS: u8 = 0xBB;
const CMD_GET_INFO: u8 = 0xCC;
const CMD_RESET: u8 = 0xDD;
const CMD_BOOTLOADER: u8 = 0xEE;
const CMD_WRITE_PAGE: u8 = 0xF1;
const CMD_KEEPALIVE: u8 = 0xFF;

const ACK: u8 = 0x30;
const NACK: u8 = 0xC1;

pub const EEPROM_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct SimAm32 {
    /// False models a one-directional signal wire: frames go out, nothing comes back.
    pub wired_bidirectional: bool,
    pub listening: bool,
    pub in_bootloader: bool,
    pub eeprom: [u8; EEPROM_SIZE],
    pub saved_eeprom: Option<[u8; EEPROM_SIZE]>,
    pub flashed_pages: Vec<(u16, Vec<u8>)>,
    /// Page address that will be refused, to exercise flash aborts.
    pub reject_page: Option<u16>,
    pub firmware_version: [u8; 3],
    pub name: [u8; 16],
    pub commands_seen: Vec<u8>,
    pub checksum_errors: usize,
    rx_frame: Vec<u8>,
}

impl Default for SimAm32 {
    fn default() -> Self {
        let mut name = [0u8; 16];
        name[..10].copy_from_slice(b"AM32-SIM-1");
        let mut esc = SimAm32 {
            wired_bidirectional: true,
            listening: false,
            in_bootloader: false,
            eeprom: [0u8; EEPROM_SIZE],
            saved_eeprom: None,
            flashed_pages: Vec::new(),
            reject_page: None,
            firmware_version: [2, 15, 0],
            name,
            commands_seen: Vec::new(),
            checksum_errors: 0,
            rx_frame: Vec::new(),
        };
        esc.eeprom[0x00] = 2; // layout version
        esc.eeprom[0x04] = 5; // startup power
        esc.eeprom[0x05] = 15; // timing
        esc.eeprom[0x06] = 24; // pwm frequency
        esc.eeprom[0x08] = 90; // temperature limit
        esc.eeprom[0x09] = 50; // current limit
        esc.eeprom[0x0A..0x0C].copy_from_slice(&1000u16.to_le_bytes());
        esc.eeprom[0x0C..0x0E].copy_from_slice(&2000u16.to_le_bytes());
        esc.eeprom[0x10..0x12].copy_from_slice(&2300u16.to_le_bytes());
        esc.eeprom[0x12] = 14;
        esc.eeprom[0x15..0x17].copy_from_slice(&1500u16.to_le_bytes());
        esc.seal_eeprom();
        esc
    }
}

impl SimAm32 {
    fn seal_eeprom(&mut self) {
        let checksum = self.eeprom[..EEPROM_SIZE - 1]
            .iter()
            .fold(0u8, |acc, b| acc ^ b);
        self.eeprom[EEPROM_SIZE - 1] = checksum;
    }

    /// Called when the controller drops the serial link.
    pub fn link_closed(&mut self) {
        self.rx_frame.clear();
    }

    /// Feeds bytes written by the controller; returns the bytes the ESC answers with.
    pub fn receive(&mut self, baud: u32, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        if !self.listening || !self.wired_bidirectional {
            return out;
        }
        let expected_baud = if self.in_bootloader {
            BOOTLOADER_BAUD
        } else {
            CONFIG_BAUD
        };
        if baud != expected_baud {
            return out;
        }
        for &b in bytes {
            self.rx_frame.push(b);
            if self.rx_frame.len() < 3 {
                continue;
            }
            let len = u16::from_le_bytes([self.rx_frame[1], self.rx_frame[2]]) as usize;
            if self.rx_frame.len() < 3 + len + 1 {
                continue;
            }
            let frame = std::mem::take(&mut self.rx_frame);
            let (body, checksum) = frame.split_at(3 + len);
            let computed = body.iter().fold(0u8, |acc, b| acc ^ b);
            if computed != checksum[0] {
                self.checksum_errors += 1;
                debug!("sim am32: bad checksum on command 0x{:02X}", body[0]);
                continue;
            }
            out.extend(self.handle(body[0], &body[3..]));
        }
        out
    }

    fn handle(&mut self, cmd: u8, data: &[u8]) -> Vec<u8> {
        self.commands_seen.push(cmd);
        let payload: Vec<u8> = match cmd {
            CMD_KEEPALIVE | CMD_RESET => vec![ACK],
            CMD_EXIT => {
                self.listening = false;
                self.in_bootloader = false;
                vec![ACK]
            }
            CMD_GET_SETTINGS => self.eeprom.to_vec(),
            CMD_SET_SETTINGS => {
                if data.len() == EEPROM_SIZE {
                    self.eeprom.copy_from_slice(data);
                    vec![ACK]
                } else {
                    vec![NACK]
                }
            }
            CMD_SAVE_SETTINGS => {
                self.saved_eeprom = Some(self.eeprom);
                vec![ACK]
            }
            CMD_GET_INFO => {
                let mut info = Vec::with_capacity(22);
                info.extend_from_slice(&self.firmware_version);
                info.extend_from_slice(&self.name);
                info.push(0x03); // mcu type
                info.push(64); // flash size in KiB
                info.push(9); // bootloader version
                info
            }
            CMD_BOOTLOADER => {
                self.in_bootloader = true;
                vec![ACK]
            }
            CMD_WRITE_PAGE if self.in_bootloader && data.len() > 2 => {
                let address = u16::from_le_bytes([data[0], data[1]]);
                if self.reject_page == Some(address) {
                    vec![NACK]
                } else {
                    self.flashed_pages.push((address, data[2..].to_vec()));
                    vec![ACK]
                }
            }
            _ => vec![NACK],
        };
        let mut response = Vec::with_capacity(payload.len() + 2);
        response.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        response.extend(payload);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(cmd: u8, data: &[u8]) -> Vec<u8> {
        let mut f = vec![cmd];
        f.extend_from_slice(&(data.len() as u16).to_le_bytes());
        f.extend_from_slice(data);
        let x = f.iter().fold(0u8, |acc, b| acc ^ b);
        f.push(x);
        f
    }

    #[test]
    fn test_silent_until_listening() {
        let mut esc = SimAm32::default();
        assert!(esc.receive(CONFIG_BAUD, &frame(CMD_KEEPALIVE, &[])).is_empty());
        esc.listening = true;
        assert_eq!(
            esc.receive(CONFIG_BAUD, &frame(CMD_KEEPALIVE, &[])),
            vec![1, 0, ACK]
        );
    }

    #[test]
    fn test_bad_checksum_is_ignored() {
        let mut esc = SimAm32 {
            listening: true,
            ..Default::default()
        };
        let mut f = frame(CMD_GET_INFO, &[]);
        let last = f.len() - 1;
        f[last] ^= 0x01;
        assert!(esc.receive(CONFIG_BAUD, &f).is_empty());
        assert_eq!(esc.checksum_errors, 1);
    }

    #[test]
    fn test_eeprom_checksum_sealed() {
        let esc = SimAm32::default();
        let x = esc.eeprom.iter().fold(0u8, |acc, b| acc ^ b);
        assert_eq!(x, 0);
    }
}
