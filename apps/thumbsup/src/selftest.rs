//! Boot safety suite. Every check leaves the outputs where it found them.
use crate::controller::{RobotBoard, RobotController};
use crate::failsafe::LinkMonitor;
use log::{error, info, warn};
use std::fmt::{self, Display, Formatter};
use std::sync::PoisonError;
use thumbsup_core::hw::{BlobStore, BoardSensors, SafetyFacts};
use thumbsup_core::{ErrorKind, MotorChannel, TuError, TuResult};
use tu_drive::STICK_MAX;
use tu_dshot::throttle_from_unsigned_percent;
use tu_pwm::{safe_pulse, PWM_MAX_PULSE_US, PWM_MIN_PULSE_US};
use tu_weapon::{BatteryStatus, SafetyMonitor, SafetyViolation, WeaponState};

/// Readings outside this window point at a broken divider, not a flat pack.
const PLAUSIBLE_BATTERY_MV: std::ops::RangeInclusive<u32> = 6_000..=15_000;

const DRIVES: [MotorChannel; 2] = [MotorChannel::LeftDrive, MotorChannel::RightDrive];

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub outcome: TuResult<()>,
}

#[derive(Debug, Clone, Default)]
pub struct SelfTestReport {
    pub checks: Vec<CheckResult>,
}

impl SelfTestReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.outcome.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.outcome.is_err())
    }
}

impl Display for SelfTestReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for check in &self.checks {
            match &check.outcome {
                Ok(()) => writeln!(f, "  PASS  {}", check.name)?,
                Err(e) => writeln!(f, "  FAIL  {}: {}", check.name, e.message())?,
            }
        }
        let verdict = if self.passed() { "PASSED" } else { "FAILED" };
        write!(f, "self-test {verdict}")
    }
}

fn fail(message: impl Into<String>) -> TuResult<()> {
    Err(TuError::new(ErrorKind::HardwareFault, message))
}

/// Runs every check, even after a failure, so the report is complete.
pub fn run<B: RobotBoard, S: BlobStore>(robot: &mut RobotController<B, S>) -> SelfTestReport {
    let checks: [(&'static str, fn(&mut RobotController<B, S>) -> TuResult<()>); 6] = [
        ("motor init", motor_init),
        ("weapon safety", weapon_safety),
        ("failsafe", failsafe),
        ("battery", battery),
        ("emergency stops", emergency_stops),
        ("overflow protection", overflow),
    ];
    let mut report = SelfTestReport::default();
    for (name, check) in checks {
        let outcome = check(robot);
        match &outcome {
            Ok(()) => info!("selftest: {name} passed"),
            Err(e) => error!("selftest: {name} FAILED: {e}"),
        }
        report.checks.push(CheckResult { name, outcome });
    }
    report
}

fn motor_init<B: RobotBoard, S: BlobStore>(robot: &mut RobotController<B, S>) -> TuResult<()> {
    if robot.weapon.state() != WeaponState::Disarmed {
        return fail(format!("weapon starts {}", robot.weapon.state()));
    }
    let transports = robot.transports.lock().unwrap_or_else(PoisonError::into_inner);
    if transports.pwm.weapon_enabled() {
        return fail("weapon output unlocked at boot");
    }
    for channel in MotorChannel::ALL {
        let pulse = transports.pwm.current_pulse_us(channel).ok_or_else(|| {
            TuError::new(ErrorKind::NotInitialized, format!("{channel} has no PWM output"))
        })?;
        if pulse != safe_pulse(channel) {
            return fail(format!(
                "{channel} at {pulse} us, expected {} us",
                safe_pulse(channel)
            ));
        }
    }
    Ok(())
}

fn weapon_safety<B: RobotBoard, S: BlobStore>(robot: &mut RobotController<B, S>) -> TuResult<()> {
    let safety = *robot.weapon.safety().config();
    let refused = [
        SafetyFacts {
            battery_mv: safety.low_battery_mv - 1,
            ..Default::default()
        },
        SafetyFacts {
            battery_mv: safety.low_battery_mv + 1_000,
            safety_button: true,
            ..Default::default()
        },
    ];
    for facts in refused {
        if robot.weapon.arm(&facts).is_ok() {
            robot.weapon.disarm();
            return fail(format!("weapon armed with {facts:?}"));
        }
        if robot.weapon.state() != WeaponState::Disarmed {
            return fail(format!("refused arm left weapon {}", robot.weapon.state()));
        }
    }
    if robot.weapon.set_speed(100).is_ok() {
        return fail("disarmed weapon accepted a speed");
    }
    Ok(())
}

fn failsafe<B: RobotBoard, S: BlobStore>(robot: &mut RobotController<B, S>) -> TuResult<()> {
    let mut link = LinkMonitor::new(robot.config.failsafe_timeout);
    let now = robot.clock.now();
    if !link.update(now) {
        return fail("link up without any frame");
    }
    link.frame_received(now);
    if link.update(now) {
        return fail("fresh frame did not clear failsafe");
    }
    if !link.update(now + robot.config.failsafe_timeout + robot.config.loop_period) {
        return fail("stale link not detected");
    }

    let mut monitor = SafetyMonitor::new(*robot.weapon.safety().config());
    let lost = SafetyFacts {
        failsafe_active: true,
        armed: true,
        battery_mv: monitor.config().low_battery_mv + 1_000,
        safety_button: false,
    };
    match monitor.check_live(&lost) {
        Err(SafetyViolation::FailsafeActive) => Ok(()),
        other => fail(format!("live weapon with lost link gave {other:?}")),
    }
}

fn battery<B: RobotBoard, S: BlobStore>(robot: &mut RobotController<B, S>) -> TuResult<()> {
    let millivolts = robot.aux.battery_voltage_mv();
    if !PLAUSIBLE_BATTERY_MV.contains(&millivolts) {
        warn!("selftest: battery reading {millivolts} mV looks implausible, check the sense line");
    }
    let safety = robot.weapon.safety();
    let config = *safety.config();
    let expected = [
        (config.critical_battery_mv - 1, BatteryStatus::Critical),
        (config.critical_battery_mv, BatteryStatus::Low),
        (config.low_battery_mv - 1, BatteryStatus::Low),
        (config.low_battery_mv, BatteryStatus::Ok),
    ];
    for (mv, status) in expected {
        if safety.battery_status(mv) != status {
            return fail(format!("{mv} mV classified as {:?}", safety.battery_status(mv)));
        }
    }
    Ok(())
}

fn emergency_stops<B: RobotBoard, S: BlobStore>(
    robot: &mut RobotController<B, S>,
) -> TuResult<()> {
    robot.weapon.emergency_stop();
    if robot.weapon.state() != WeaponState::EmergencyStop {
        return fail("weapon did not latch the emergency stop");
    }
    {
        let mut transports = robot.transports.lock().unwrap_or_else(PoisonError::into_inner);
        transports.pwm.emergency_stop();
        let weapon_ok = !transports.pwm.weapon_enabled()
            && transports.pwm.current_pulse_us(MotorChannel::Weapon) == Some(PWM_MIN_PULSE_US);
        let drives_ok = DRIVES
            .iter()
            .all(|&c| transports.pwm.current_pulse_us(c) == Some(safe_pulse(c)));
        transports.pwm.resume();
        if !weapon_ok || !drives_ok {
            return fail("outputs not at safe pulses after emergency stop");
        }
    }
    robot
        .weapon
        .reinit()
        .map_err(|e| e.add_context("reinit after emergency stop"))?;
    if robot.weapon.state() != WeaponState::Disarmed {
        return fail(format!("reinit left weapon {}", robot.weapon.state()));
    }
    Ok(())
}

fn overflow<B: RobotBoard, S: BlobStore>(robot: &mut RobotController<B, S>) -> TuResult<()> {
    {
        let mut transports = robot.transports.lock().unwrap_or_else(PoisonError::into_inner);
        let pwm = &mut transports.pwm;
        let mut result = Ok(());
        for channel in DRIVES {
            for (request, expected) in [(5_000, PWM_MAX_PULSE_US), (-500, PWM_MIN_PULSE_US)] {
                pwm.set_pulse(channel, request)?;
                let target = pwm.pulse(channel).map(|p| p.target_pulse_us);
                if target != Some(expected) {
                    result = fail(format!("{channel} pulse {request} became {target:?}"));
                }
            }
            pwm.force_safe(channel)?;
        }
        pwm.set_pulse(MotorChannel::Weapon, 5_000)?;
        if pwm.pulse(MotorChannel::Weapon).map(|p| p.target_pulse_us) != Some(PWM_MIN_PULSE_US) {
            result = fail("locked weapon accepted a pulse");
        }
        pwm.force_safe(MotorChannel::Weapon)?;
        result?;
    }

    for forward in [-STICK_MAX, 0, STICK_MAX] {
        for turn in [-STICK_MAX, 0, STICK_MAX] {
            let out = robot.mixer.drive(forward, turn, None);
            if out.left.abs() > 100 || out.right.abs() > 100 {
                return fail(format!("mixer ({forward}, {turn}) gave {out:?}"));
            }
        }
    }
    if !robot.mixer.mix(i32::MAX, i32::MIN).is_stopped() {
        return fail("out of range stick input not rejected");
    }
    if throttle_from_unsigned_percent(i32::MAX) > 2_047 {
        return fail("dshot throttle overflow");
    }
    Ok(())
}
