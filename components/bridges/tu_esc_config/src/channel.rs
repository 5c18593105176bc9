use crate::protocol::*;
use crate::settings::{EscInfo, EscSettings, EEPROM_SIZE};
use log::{debug, error, info, warn};
use thumbsup_core::clock::{Deadline, RobotClock, TuDuration};
use thumbsup_core::config::{getcfg, ComponentConfig};
use thumbsup_core::hw::{PinFunction, SerialPort, SignalPin};
use thumbsup_core::{ErrorKind, MotorChannel, TuError, TuResult};

const ENTRY_PULSES: usize = 10;
const ENTRY_PULSE_HIGH_US: u32 = 100;
const ENTRY_PULSE_LOW_US: u32 = 900;
const ENTRY_SETTLE_MS: u64 = 100;
const RX_POLL_US: u32 = 100;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EscLinkConfig {
    pub reply_timeout: TuDuration,
    /// EEPROM writes take much longer to acknowledge.
    pub eeprom_write_timeout: TuDuration,
    pub page_timeout: TuDuration,
    pub retries: u8,
}

impl Default for EscLinkConfig {
    fn default() -> Self {
        EscLinkConfig {
            reply_timeout: TuDuration::from_millis(100),
            eeprom_write_timeout: TuDuration::from_millis(500),
            page_timeout: TuDuration::from_millis(200),
            retries: 3,
        }
    }
}

impl EscLinkConfig {
    pub fn from_config(config: Option<&ComponentConfig>) -> TuResult<Self> {
        let d = EscLinkConfig::default();
        let reply_ms: u64 = getcfg(config, "reply_timeout_ms", d.reply_timeout.as_millis())?;
        let eeprom_ms: u64 = getcfg(
            config,
            "eeprom_write_timeout_ms",
            d.eeprom_write_timeout.as_millis(),
        )?;
        let page_ms: u64 = getcfg(config, "page_timeout_ms", d.page_timeout.as_millis())?;
        let retries: u8 = getcfg(config, "retries", d.retries)?;
        if reply_ms == 0 || eeprom_ms == 0 || page_ms == 0 || retries == 0 {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                "ESC link timeouts and retries must be non zero",
            ));
        }
        Ok(EscLinkConfig {
            reply_timeout: TuDuration::from_millis(reply_ms),
            eeprom_write_timeout: TuDuration::from_millis(eeprom_ms),
            page_timeout: TuDuration::from_millis(page_ms),
            retries,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Config,
    Bootloader,
}

/// Serial configuration link to an AM32 ESC over its signal wire.
///
/// The caller must have stopped and released whatever was driving the pin
/// before `enter_config_mode`; on exit the pin is parked low as an output.
pub struct EscConfigChannel<S: SerialPort, P: SignalPin> {
    serial: S,
    pin: P,
    clock: RobotClock,
    channel: MotorChannel,
    config: EscLinkConfig,
    state: LinkState,
    last_eeprom: Option<[u8; EEPROM_SIZE]>,
}

impl<S: SerialPort, P: SignalPin> EscConfigChannel<S, P> {
    pub fn new(
        serial: S,
        pin: P,
        clock: RobotClock,
        channel: MotorChannel,
        config: EscLinkConfig,
    ) -> Self {
        EscConfigChannel {
            serial,
            pin,
            clock,
            channel,
            config,
            state: LinkState::Closed,
            last_eeprom: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != LinkState::Closed
    }

    fn park_pin(&mut self) {
        if let Err(e) = self.pin.set_function(self.channel, PinFunction::Output) {
            error!("esc: could not park {} pin: {}", self.channel, e);
            return;
        }
        self.pin.write_level(self.channel, false);
    }

    fn send_entry_signal(&mut self) -> TuResult<()> {
        self.pin.set_function(self.channel, PinFunction::Output)?;
        for _ in 0..ENTRY_PULSES {
            self.pin.write_level(self.channel, true);
            self.pin.delay_us(ENTRY_PULSE_HIGH_US);
            self.pin.write_level(self.channel, false);
            self.pin.delay_us(ENTRY_PULSE_LOW_US);
        }
        self.pin.delay_us((ENTRY_SETTLE_MS * 1_000) as u32);
        Ok(())
    }

    fn open_uart(&mut self, baud: u32) -> TuResult<()> {
        self.pin.set_function(self.channel, PinFunction::Uart)?;
        self.serial.open(baud)
    }

    fn close_link(&mut self) {
        self.serial.close();
        self.park_pin();
        self.state = LinkState::Closed;
    }

    /// Listen-mode pulse train, then a keepalive that must be answered.
    /// Failure leaves the UART closed and the pin parked.
    pub fn enter_config_mode(&mut self) -> TuResult<()> {
        if self.state == LinkState::Config {
            return Ok(());
        }
        info!("esc: entering config mode on {}", self.channel);
        let result = self
            .send_entry_signal()
            .and_then(|_| self.open_uart(CONFIG_BAUD))
            .and_then(|_| {
                self.state = LinkState::Config;
                let mut reply = [0u8; 4];
                let n = self.transact(CMD_KEEPALIVE, &[], &mut reply, self.config.reply_timeout)?;
                check_ack(CMD_KEEPALIVE, &reply[..n])
            });
        if let Err(e) = result {
            warn!("esc: no answer from {}: {}", self.channel, e);
            self.close_link();
            return Err(e
                .add_context("entering ESC config mode")
                .with_kind(ErrorKind::CommFailure));
        }
        info!("esc: config mode active");
        Ok(())
    }

    /// Tells the ESC to leave config mode and gives the pin back, parked low.
    pub fn exit_config_mode(&mut self) {
        if self.state == LinkState::Closed {
            return;
        }
        if let Err(e) = self.send_command(CMD_EXIT, &[]) {
            warn!("esc: exit command failed: {}", e);
        }
        self.close_link();
        info!("esc: config mode exited");
    }

    pub fn send_command(&mut self, command: u8, data: &[u8]) -> TuResult<()> {
        if self.state == LinkState::Closed {
            return Err(TuError::new(
                ErrorKind::NotInitialized,
                "ESC config link is closed",
            ));
        }
        let frame = Am32Request::new(command, data).serialize()?;
        self.serial.clear_input();
        self.serial.write(&frame)
    }

    fn read_byte_before(&mut self, deadline: &Deadline) -> TuResult<u8> {
        loop {
            if let Some(byte) = self.serial.read_byte() {
                return Ok(byte);
            }
            if deadline.is_expired(&self.clock) {
                return Err(TuError::new(ErrorKind::Timeout, "ESC reply timed out"));
            }
            self.serial.delay_us(RX_POLL_US);
        }
    }

    /// Reads `[LEN_LO][LEN_HI][DATA..]` into `buffer`, returning the payload length.
    pub fn receive_response(&mut self, buffer: &mut [u8], timeout: TuDuration) -> TuResult<usize> {
        if buffer.is_empty() {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                "empty receive buffer",
            ));
        }
        let deadline = Deadline::after(&self.clock, timeout);
        let lo = self.read_byte_before(&deadline)?;
        let hi = self.read_byte_before(&deadline)?;
        let len = u16::from_le_bytes([lo, hi]) as usize;
        if len > buffer.len() || len > MAX_RESPONSE_LEN {
            self.serial.clear_input();
            return Err(TuError::new(
                ErrorKind::BufferOverflow,
                format!(
                    "ESC announced {} bytes, buffer holds {}",
                    len,
                    buffer.len().min(MAX_RESPONSE_LEN)
                ),
            ));
        }
        for slot in buffer.iter_mut().take(len) {
            *slot = self.read_byte_before(&deadline)?;
        }
        Ok(len)
    }

    /// Command plus response, retried on timeouts.
    pub fn transact(
        &mut self,
        command: u8,
        data: &[u8],
        buffer: &mut [u8],
        timeout: TuDuration,
    ) -> TuResult<usize> {
        let mut last_error = None;
        for attempt in 1..=self.config.retries {
            self.send_command(command, data)?;
            match self.receive_response(buffer, timeout) {
                Ok(n) => return Ok(n),
                Err(e) if e.is_timeout() => {
                    debug!(
                        "esc: 0x{:02X} attempt {}/{} timed out",
                        command, attempt, self.config.retries
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| TuError::new(ErrorKind::Timeout, "ESC reply timed out"))
            .add_context(&format!("command 0x{command:02X}")))
    }

    fn require_config(&self) -> TuResult<()> {
        match self.state {
            LinkState::Config => Ok(()),
            other => Err(TuError::new(
                ErrorKind::InvalidState,
                format!("ESC link is {other:?}, config mode required"),
            )),
        }
    }

    pub fn read_settings(&mut self) -> TuResult<EscSettings> {
        self.require_config()?;
        let mut buffer = [0u8; EEPROM_SIZE];
        let timeout = self.config.reply_timeout;
        let n = self.transact(CMD_GET_SETTINGS, &[], &mut buffer, timeout)?;
        let settings = EscSettings::from_eeprom(&buffer[..n])?;
        if n == EEPROM_SIZE {
            self.last_eeprom = Some(buffer);
        }
        debug!("esc: settings read, {} bytes", n);
        Ok(settings)
    }

    /// Rejects invalid settings before anything is transmitted.
    pub fn write_settings(&mut self, settings: &EscSettings) -> TuResult<()> {
        settings.validate()?;
        self.require_config()?;
        let image = settings.to_eeprom(self.last_eeprom.as_ref());
        let mut reply = [0u8; 4];
        let timeout = self.config.eeprom_write_timeout;
        let n = self.transact(CMD_SET_SETTINGS, &image, &mut reply, timeout)?;
        check_ack(CMD_SET_SETTINGS, &reply[..n])?;
        self.last_eeprom = Some(image);
        info!("esc: settings written");
        Ok(())
    }

    pub fn save_settings(&mut self) -> TuResult<()> {
        self.simple_command(CMD_SAVE_SETTINGS, self.config.eeprom_write_timeout)
    }

    pub fn reset(&mut self) -> TuResult<()> {
        self.simple_command(CMD_RESET, self.config.reply_timeout)
    }

    fn simple_command(&mut self, command: u8, timeout: TuDuration) -> TuResult<()> {
        self.require_config()?;
        let mut reply = [0u8; 4];
        let n = self.transact(command, &[], &mut reply, timeout)?;
        check_ack(command, &reply[..n])
    }

    pub fn get_info(&mut self) -> TuResult<EscInfo> {
        self.require_config()?;
        let mut buffer = [0u8; 64];
        let timeout = self.config.reply_timeout;
        let n = self.transact(CMD_GET_INFO, &[], &mut buffer, timeout)?;
        EscInfo::parse(&buffer[..n])
    }

    /// Switches the ESC into its bootloader and the UART to the bootloader rate.
    pub fn enter_bootloader(&mut self) -> TuResult<()> {
        if self.state == LinkState::Bootloader {
            return Ok(());
        }
        self.simple_command(CMD_BOOTLOADER, self.config.reply_timeout)?;
        self.serial.close();
        if let Err(e) = self.serial.open(BOOTLOADER_BAUD) {
            self.close_link();
            return Err(e.add_context("reopening UART for the bootloader"));
        }
        self.state = LinkState::Bootloader;
        info!("esc: bootloader active at {} baud", BOOTLOADER_BAUD);
        Ok(())
    }

    /// Writes `image` page by page, each page acknowledged before the next.
    /// The first failed page aborts the flash. Returns the number of pages written.
    pub fn flash_firmware(&mut self, image: &[u8]) -> TuResult<usize> {
        if image.is_empty() {
            return Err(TuError::new(ErrorKind::InvalidParam, "empty firmware image"));
        }
        let pages = image.len().div_ceil(FLASH_PAGE_SIZE);
        if pages * FLASH_PAGE_SIZE > u16::MAX as usize + 1 {
            return Err(TuError::new(
                ErrorKind::OutOfRange,
                format!("firmware image of {} bytes does not fit", image.len()),
            ));
        }
        if self.state == LinkState::Closed {
            return Err(TuError::new(
                ErrorKind::NotInitialized,
                "ESC config link is closed",
            ));
        }
        self.enter_bootloader()?;
        info!("esc: flashing {} bytes in {} pages", image.len(), pages);
        let timeout = self.config.page_timeout;
        let mut request = [0xFFu8; FLASH_PAGE_SIZE + 2];
        for (index, chunk) in image.chunks(FLASH_PAGE_SIZE).enumerate() {
            let address = (index * FLASH_PAGE_SIZE) as u16;
            request[..2].copy_from_slice(&address.to_le_bytes());
            request[2..].fill(0xFF);
            request[2..2 + chunk.len()].copy_from_slice(chunk);
            let mut reply = [0u8; 4];
            let result = self
                .transact(CMD_WRITE_PAGE, &request, &mut reply, timeout)
                .and_then(|n| check_ack(CMD_WRITE_PAGE, &reply[..n]));
            if let Err(e) = result {
                error!("esc: flash aborted at page {} (0x{:04X}): {}", index, address, e);
                return Err(e.add_context(&format!("flashing page {index}")));
            }
        }
        info!("esc: flash complete");
        Ok(pages)
    }
}
