//! Hardware seams of the control core.
//! The real board and the simulated board both implement these; the core
//! never touches registers directly.
use crate::channel::MotorChannel;
use crate::error::{ErrorKind, TuError, TuResult};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thumbsup_clock::{Deadline, RobotClock, TuDuration};

/// Anything able to busy-wait for a short, bounded amount of time.
pub trait DelayUs {
    fn delay_us(&mut self, micros: u32);
}

/// What currently drives a physical signal pin.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum PinFunction {
    Pwm,
    Dshot,
    Uart,
    /// Plain GPIO output, used for parking and raw emergency levels.
    Output,
    /// Floating input.
    Input,
}

/// Direct access to the signal pin behind a motor channel.
pub trait SignalPin: DelayUs {
    fn set_function(&mut self, channel: MotorChannel, function: PinFunction) -> TuResult<()>;
    /// Only meaningful while the pin is in `PinFunction::Output`.
    fn write_level(&mut self, channel: MotorChannel, high: bool);
}

/// Servo-style pulse generator, one slice/channel per motor output.
pub trait PwmHal {
    fn configure(&mut self, channel: MotorChannel, frequency_hz: u32) -> TuResult<()>;
    fn set_enabled(&mut self, channel: MotorChannel, enabled: bool);
    fn write_pulse_us(&mut self, channel: MotorChannel, pulse_us: u16);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExecutorId(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransferId(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProgramOffset(pub u8);

/// Microcode flavours for the DShot executor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum ProgramKind {
    Standard,
    Bidirectional,
}

/// Programmable-timing transmitter used for DShot.
/// Executors run a shared program; transfers feed them one frame at a time.
pub trait DshotHal: DelayUs {
    fn system_clock_hz(&self) -> u32;

    fn install_program(&mut self, kind: ProgramKind) -> TuResult<ProgramOffset>;
    fn remove_program(&mut self, kind: ProgramKind, offset: ProgramOffset);

    fn claim_executor(&mut self) -> Option<ExecutorId>;
    fn release_executor(&mut self, executor: ExecutorId);
    fn start_executor(
        &mut self,
        executor: ExecutorId,
        program: ProgramOffset,
        channel: MotorChannel,
        clock_divider: f32,
    );
    fn stop_executor(&mut self, executor: ExecutorId);

    fn claim_transfer(&mut self) -> Option<TransferId>;
    fn release_transfer(&mut self, transfer: TransferId);
    fn transfer_busy(&self, transfer: TransferId) -> bool;
    fn start_transfer(&mut self, transfer: TransferId, executor: ExecutorId, word: u32);
    fn abort_transfer(&mut self, transfer: TransferId);

    /// Raw 21-bit telemetry word captured after the last frame, if any.
    fn read_response(&mut self, executor: ExecutorId) -> Option<u32>;
}

/// Half-duplex serial line multiplexed onto a motor signal pin.
pub trait SerialPort: DelayUs {
    fn open(&mut self, baud: u32) -> TuResult<()>;
    fn close(&mut self);
    fn write(&mut self, bytes: &[u8]) -> TuResult<()>;
    fn read_byte(&mut self) -> Option<u8>;
    fn clear_input(&mut self);
}

/// Opaque persistent storage. Implementations on flash must disable
/// interrupts for the whole erase+program of a page.
pub trait BlobStore {
    fn load(&self, key: &str) -> TuResult<Option<Vec<u8>>>;
    fn store(&mut self, key: &str, blob: &[u8]) -> TuResult<()>;
}

/// Slow analog and digital inputs sampled by the control loop.
pub trait BoardSensors {
    fn battery_voltage_mv(&mut self) -> u32;
    fn safety_button_pressed(&mut self) -> bool;
}

/// Facts the safety monitor consumes. All polled, no callbacks.
pub trait SafetyInputs {
    fn is_failsafe_active(&self) -> bool;
    fn is_armed(&self) -> bool;
    fn battery_voltage_mv(&self) -> u32;
    fn is_safety_button_pressed(&self) -> bool;
}

/// Snapshot of the safety facts for one control tick.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct SafetyFacts {
    pub failsafe_active: bool,
    pub armed: bool,
    pub battery_mv: u32,
    pub safety_button: bool,
}

impl SafetyInputs for SafetyFacts {
    fn is_failsafe_active(&self) -> bool {
        self.failsafe_active
    }

    fn is_armed(&self) -> bool {
        self.armed
    }

    fn battery_voltage_mv(&self) -> u32 {
        self.battery_mv
    }

    fn is_safety_button_pressed(&self) -> bool {
        self.safety_button
    }
}

pub trait Watchdog {
    fn feed(&mut self);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum LedPattern {
    Off,
    Solid,
    /// 500 ms period.
    BlinkSlow,
    /// 250 ms period.
    BlinkMedium,
    /// 100 ms period, the alarm pattern.
    BlinkFast,
}

/// Two indicators: system (0) and weapon (1).
pub trait StatusIndicator {
    fn show(&mut self, system: LedPattern, weapon: LedPattern);
}

/// Polls `ready` every `poll_us` microseconds until it holds or `timeout` elapses.
/// The delay is what lets time advance on simulated hardware.
pub fn wait_until<H, F>(
    clock: &RobotClock,
    hw: &mut H,
    timeout: TuDuration,
    poll_us: u32,
    mut ready: F,
) -> TuResult<()>
where
    H: DelayUs + ?Sized,
    F: FnMut(&mut H) -> bool,
{
    let deadline = Deadline::after(clock, timeout);
    loop {
        if ready(hw) {
            return Ok(());
        }
        if deadline.is_expired(clock) {
            return Err(TuError::new(
                ErrorKind::Timeout,
                format!("condition not met within {}", timeout),
            ));
        }
        hw.delay_us(poll_us.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thumbsup_clock::RobotClockMock;

    struct TickingDelay {
        mock: RobotClockMock,
        calls: u32,
    }

    impl DelayUs for TickingDelay {
        fn delay_us(&mut self, micros: u32) {
            self.calls += 1;
            self.mock.advance_micros(micros as u64);
        }
    }

    #[test]
    fn test_wait_until_succeeds_when_ready() {
        let (clock, mock) = RobotClock::mock();
        let mut hw = TickingDelay { mock, calls: 0 };
        let result = wait_until(&clock, &mut hw, TuDuration::from_millis(50), 100, |hw| {
            hw.calls >= 3
        });
        assert!(result.is_ok());
        assert_eq!(hw.calls, 3);
    }

    #[test]
    fn test_wait_until_times_out() {
        let (clock, mock) = RobotClock::mock();
        let mut hw = TickingDelay { mock, calls: 0 };
        let err = wait_until(&clock, &mut hw, TuDuration::from_millis(50), 1_000, |_| false)
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(clock.now_millis(), 50);
    }

    #[test]
    fn test_safety_facts_expose_inputs() {
        let facts = SafetyFacts {
            failsafe_active: true,
            armed: false,
            battery_mv: 11_800,
            safety_button: false,
        };
        assert!(facts.is_failsafe_active());
        assert_eq!(facts.battery_voltage_mv(), 11_800);
    }
}
