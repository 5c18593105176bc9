//! Simulated controller board.
//!
//! `SimBoard` is a cheap cloneable handle; every subsystem gets its own clone
//! the way firmware would get split peripherals. All delays advance the shared
//! mock clock, so bounded waits terminate deterministically.
pub mod am32;
pub mod store;

pub use am32::SimAm32;
pub use store::MemoryBlobStore;

use log::debug;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thumbsup_core::clock::{RobotClock, RobotClockMock, TuDuration, TuTime};
use thumbsup_core::hw::*;
use thumbsup_core::{ErrorKind, MotorChannel, TuError, TuResult};

pub const SIM_SYSTEM_CLOCK_HZ: u32 = 125_000_000;
pub const SIM_EXECUTORS: usize = 4;
pub const SIM_TRANSFERS: usize = 4;

/// One frame as it left the DShot executor.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DshotFrameRecord {
    pub channel: MotorChannel,
    pub word: u32,
    pub at: TuTime,
}

pub struct SimState {
    pub pin_functions: [PinFunction; MotorChannel::COUNT],
    pub pin_levels: [bool; MotorChannel::COUNT],
    /// Rising edges seen since the pin last became a GPIO output.
    pub rising_edges: [usize; MotorChannel::COUNT],

    pub pwm_frequency: [u32; MotorChannel::COUNT],
    pub pwm_enabled: [bool; MotorChannel::COUNT],
    pub pwm_pulse: [u16; MotorChannel::COUNT],
    pub pwm_writes: usize,

    pub program_capacity: usize,
    pub installed_programs: Vec<(ProgramKind, u8)>,
    pub program_installs: usize,
    pub executor_capacity: usize,
    pub executor_claimed: [bool; SIM_EXECUTORS],
    pub executor_running: [Option<MotorChannel>; SIM_EXECUTORS],
    pub executor_divider: [f32; SIM_EXECUTORS],
    pub transfer_capacity: usize,
    pub transfer_claimed: [bool; SIM_TRANSFERS],
    pub transfer_busy_until: [TuTime; SIM_TRANSFERS],
    pub transfer_aborts: usize,
    /// A wedged transfer never completes.
    pub wedged: bool,
    pub frame_duration: TuDuration,
    pub dshot_frames: Vec<DshotFrameRecord>,
    pub telemetry: [VecDeque<u32>; MotorChannel::COUNT],

    pub uart_baud: Option<u32>,
    pub uart_rx: VecDeque<u8>,
    pub uart_tx: Vec<u8>,
    pub esc: SimAm32,

    pub battery_mv: u32,
    pub safety_button: bool,
    pub watchdog_feeds: u64,
    pub last_feed: Option<TuTime>,
    pub leds: (LedPattern, LedPattern),
}

impl Default for SimState {
    fn default() -> Self {
        SimState {
            pin_functions: [PinFunction::Input; MotorChannel::COUNT],
            pin_levels: [false; MotorChannel::COUNT],
            rising_edges: [0; MotorChannel::COUNT],
            pwm_frequency: [0; MotorChannel::COUNT],
            pwm_enabled: [false; MotorChannel::COUNT],
            pwm_pulse: [0; MotorChannel::COUNT],
            pwm_writes: 0,
            program_capacity: 2,
            installed_programs: Vec::new(),
            program_installs: 0,
            executor_capacity: SIM_EXECUTORS,
            executor_claimed: [false; SIM_EXECUTORS],
            executor_running: [None; SIM_EXECUTORS],
            executor_divider: [0.0; SIM_EXECUTORS],
            transfer_capacity: SIM_TRANSFERS,
            transfer_claimed: [false; SIM_TRANSFERS],
            transfer_busy_until: [TuDuration::ZERO; SIM_TRANSFERS],
            transfer_aborts: 0,
            wedged: false,
            frame_duration: TuDuration::from_micros(30),
            dshot_frames: Vec::new(),
            telemetry: Default::default(),
            uart_baud: None,
            uart_rx: VecDeque::new(),
            uart_tx: Vec::new(),
            esc: SimAm32::default(),
            battery_mv: 11_800,
            safety_button: false,
            watchdog_feeds: 0,
            last_feed: None,
            leds: (LedPattern::Off, LedPattern::Off),
        }
    }
}

#[derive(Clone)]
pub struct SimBoard {
    state: Arc<Mutex<SimState>>,
    clock: RobotClock,
    mock: RobotClockMock,
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBoard {
    pub fn new() -> Self {
        let (clock, mock) = RobotClock::mock();
        SimBoard {
            state: Arc::new(Mutex::new(SimState::default())),
            clock,
            mock,
        }
    }

    pub fn clock(&self) -> RobotClock {
        self.clock.clone()
    }

    pub fn mock(&self) -> RobotClockMock {
        self.mock.clone()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Direct access for fault injection and assertions.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.state())
    }

    pub fn set_battery_mv(&self, millivolts: u32) {
        self.state().battery_mv = millivolts;
    }

    pub fn set_safety_button(&self, pressed: bool) {
        self.state().safety_button = pressed;
    }

    pub fn pwm_pulse(&self, channel: MotorChannel) -> u16 {
        self.state().pwm_pulse[channel.index()]
    }

    pub fn pwm_enabled(&self, channel: MotorChannel) -> bool {
        self.state().pwm_enabled[channel.index()]
    }

    pub fn pin_function(&self, channel: MotorChannel) -> PinFunction {
        self.state().pin_functions[channel.index()]
    }

    pub fn pin_level(&self, channel: MotorChannel) -> bool {
        self.state().pin_levels[channel.index()]
    }

    pub fn rising_edges(&self, channel: MotorChannel) -> usize {
        self.state().rising_edges[channel.index()]
    }

    pub fn dshot_frames(&self) -> Vec<DshotFrameRecord> {
        self.state().dshot_frames.clone()
    }

    pub fn clear_dshot_frames(&self) {
        self.state().dshot_frames.clear();
    }

    pub fn push_telemetry(&self, channel: MotorChannel, raw21: u32) {
        self.state().telemetry[channel.index()].push_back(raw21);
    }

    pub fn set_wedged(&self, wedged: bool) {
        self.state().wedged = wedged;
    }

    pub fn installed_program_count(&self) -> usize {
        self.state().installed_programs.len()
    }

    pub fn claimed_executors(&self) -> usize {
        self.state().executor_claimed.iter().filter(|c| **c).count()
    }

    pub fn claimed_transfers(&self) -> usize {
        self.state().transfer_claimed.iter().filter(|c| **c).count()
    }

    pub fn uart_baud(&self) -> Option<u32> {
        self.state().uart_baud
    }

    pub fn with_esc<R>(&self, f: impl FnOnce(&mut SimAm32) -> R) -> R {
        f(&mut self.state().esc)
    }

    pub fn watchdog_feeds(&self) -> u64 {
        self.state().watchdog_feeds
    }

    pub fn leds(&self) -> (LedPattern, LedPattern) {
        self.state().leds
    }
}

impl DelayUs for SimBoard {
    fn delay_us(&mut self, micros: u32) {
        self.mock.advance_micros(micros as u64);
    }
}

impl SignalPin for SimBoard {
    fn set_function(&mut self, channel: MotorChannel, function: PinFunction) -> TuResult<()> {
        let mut state = self.state();
        let i = channel.index();
        state.pin_functions[i] = function;
        if function == PinFunction::Output {
            state.rising_edges[i] = 0;
        }
        debug!("sim: {} pin -> {:?}", channel, function);
        Ok(())
    }

    fn write_level(&mut self, channel: MotorChannel, high: bool) {
        let mut state = self.state();
        let i = channel.index();
        if state.pin_functions[i] != PinFunction::Output {
            return;
        }
        if high && !state.pin_levels[i] {
            state.rising_edges[i] += 1;
        }
        state.pin_levels[i] = high;
    }
}

impl PwmHal for SimBoard {
    fn configure(&mut self, channel: MotorChannel, frequency_hz: u32) -> TuResult<()> {
        if frequency_hz == 0 {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                "PWM frequency must be non zero",
            ));
        }
        self.state().pwm_frequency[channel.index()] = frequency_hz;
        Ok(())
    }

    fn set_enabled(&mut self, channel: MotorChannel, enabled: bool) {
        self.state().pwm_enabled[channel.index()] = enabled;
    }

    fn write_pulse_us(&mut self, channel: MotorChannel, pulse_us: u16) {
        let mut state = self.state();
        state.pwm_pulse[channel.index()] = pulse_us;
        state.pwm_writes += 1;
    }
}

impl DshotHal for SimBoard {
    fn system_clock_hz(&self) -> u32 {
        SIM_SYSTEM_CLOCK_HZ
    }

    fn install_program(&mut self, kind: ProgramKind) -> TuResult<ProgramOffset> {
        let mut state = self.state();
        if state.installed_programs.len() >= state.program_capacity {
            return Err(TuError::new(
                ErrorKind::ResourceExhausted,
                "no program space left",
            ));
        }
        let offset = (state.installed_programs.len() * 16) as u8;
        state.installed_programs.push((kind, offset));
        state.program_installs += 1;
        Ok(ProgramOffset(offset))
    }

    fn remove_program(&mut self, kind: ProgramKind, offset: ProgramOffset) {
        self.state()
            .installed_programs
            .retain(|(k, o)| !(*k == kind && *o == offset.0));
    }

    fn claim_executor(&mut self) -> Option<ExecutorId> {
        let mut state = self.state();
        let capacity = state.executor_capacity.min(SIM_EXECUTORS);
        let free = state.executor_claimed[..capacity].iter().position(|c| !c)?;
        state.executor_claimed[free] = true;
        Some(ExecutorId(free as u8))
    }

    fn release_executor(&mut self, executor: ExecutorId) {
        let mut state = self.state();
        if let Some(claimed) = state.executor_claimed.get_mut(executor.0 as usize) {
            *claimed = false;
        }
    }

    fn start_executor(
        &mut self,
        executor: ExecutorId,
        _program: ProgramOffset,
        channel: MotorChannel,
        clock_divider: f32,
    ) {
        let mut state = self.state();
        let i = executor.0 as usize;
        if i < SIM_EXECUTORS {
            state.executor_running[i] = Some(channel);
            state.executor_divider[i] = clock_divider;
        }
    }

    fn stop_executor(&mut self, executor: ExecutorId) {
        let mut state = self.state();
        if let Some(running) = state.executor_running.get_mut(executor.0 as usize) {
            *running = None;
        }
    }

    fn claim_transfer(&mut self) -> Option<TransferId> {
        let mut state = self.state();
        let capacity = state.transfer_capacity.min(SIM_TRANSFERS);
        let free = state.transfer_claimed[..capacity].iter().position(|c| !c)?;
        state.transfer_claimed[free] = true;
        Some(TransferId(free as u8))
    }

    fn release_transfer(&mut self, transfer: TransferId) {
        let mut state = self.state();
        if let Some(claimed) = state.transfer_claimed.get_mut(transfer.0 as usize) {
            *claimed = false;
        }
    }

    fn transfer_busy(&self, transfer: TransferId) -> bool {
        let now = self.clock.now();
        let state = self.state();
        match state.transfer_busy_until.get(transfer.0 as usize) {
            Some(until) => state.wedged || now < *until,
            None => false,
        }
    }

    fn start_transfer(&mut self, transfer: TransferId, executor: ExecutorId, word: u32) {
        let now = self.clock.now();
        let mut state = self.state();
        let t = transfer.0 as usize;
        let Some(channel) = state
            .executor_running
            .get(executor.0 as usize)
            .copied()
            .flatten()
        else {
            return;
        };
        if t < SIM_TRANSFERS {
            state.transfer_busy_until[t] = now + state.frame_duration;
        }
        state.dshot_frames.push(DshotFrameRecord {
            channel,
            word,
            at: now,
        });
    }

    fn abort_transfer(&mut self, transfer: TransferId) {
        let now = self.clock.now();
        let mut state = self.state();
        if let Some(until) = state.transfer_busy_until.get_mut(transfer.0 as usize) {
            *until = now;
        }
        state.transfer_aborts += 1;
        state.wedged = false;
    }

    fn read_response(&mut self, executor: ExecutorId) -> Option<u32> {
        let mut state = self.state();
        let channel = state.executor_running.get(executor.0 as usize).copied()??;
        state.telemetry[channel.index()].pop_front()
    }
}

impl SerialPort for SimBoard {
    fn open(&mut self, baud: u32) -> TuResult<()> {
        let mut state = self.state();
        if state.pin_functions[MotorChannel::Weapon.index()] != PinFunction::Uart {
            return Err(TuError::new(
                ErrorKind::HardwareFault,
                "weapon pin is not muxed to the UART",
            ));
        }
        if state.rising_edges[MotorChannel::Weapon.index()] >= 10 {
            state.esc.listening = true;
        }
        state.uart_baud = Some(baud);
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state();
        state.uart_baud = None;
        state.uart_rx.clear();
        state.esc.link_closed();
    }

    fn write(&mut self, bytes: &[u8]) -> TuResult<()> {
        let mut state = self.state();
        let Some(baud) = state.uart_baud else {
            return Err(TuError::new(ErrorKind::NotInitialized, "UART is closed"));
        };
        state.uart_tx.extend_from_slice(bytes);
        let reply = state.esc.receive(baud, bytes);
        state.uart_rx.extend(reply);
        Ok(())
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.state().uart_rx.pop_front()
    }

    fn clear_input(&mut self) {
        self.state().uart_rx.clear();
    }
}

impl BoardSensors for SimBoard {
    fn battery_voltage_mv(&mut self) -> u32 {
        self.state().battery_mv
    }

    fn safety_button_pressed(&mut self) -> bool {
        self.state().safety_button
    }
}

impl Watchdog for SimBoard {
    fn feed(&mut self) {
        let now = self.clock.now();
        let mut state = self.state();
        state.watchdog_feeds += 1;
        state.last_feed = Some(now);
    }
}

impl StatusIndicator for SimBoard {
    fn show(&mut self, system: LedPattern, weapon: LedPattern) {
        self.state().leds = (system, weapon);
    }
}
