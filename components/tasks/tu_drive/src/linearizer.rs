use thumbsup_core::MotorChannel;

/// Wheel speed that 100% stick asks for. Every fitted curve reaches it below full throttle.
pub const MAX_WHEEL_RPM: i32 = 830;

/// Bench-fitted model `rpm = a * (throttle - deadband)^b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorCurveParams {
    pub a: f32,
    pub b: f32,
    pub deadband: f32,
}

impl MotorCurveParams {
    /// Throttle percent needed to reach `rpm`, in [0, 100].
    pub fn throttle_for_rpm(&self, rpm: f32) -> f32 {
        if rpm <= 0.0 {
            return 0.0;
        }
        let throttle = self.deadband + (rpm / self.a).powf(1.0 / self.b);
        throttle.clamp(0.0, 100.0)
    }
}

pub const LEFT_FORWARD: MotorCurveParams = MotorCurveParams {
    a: 87.962_49,
    b: 0.500_102,
    deadband: 10.0,
};

pub const RIGHT_FORWARD: MotorCurveParams = MotorCurveParams {
    a: 94.404_96,
    b: 0.500_494,
    deadband: 10.0,
};

pub const LEFT_REVERSE: MotorCurveParams = MotorCurveParams {
    a: 88.861_44,
    b: 0.500_001,
    deadband: 10.0,
};

pub const RIGHT_REVERSE: MotorCurveParams = MotorCurveParams {
    a: 91.173_28,
    b: 0.5,
    deadband: 11.71,
};

/// Curve for a drive motor turning in the given direction. The weapon has none.
pub fn curve_for(channel: MotorChannel, reverse: bool) -> Option<&'static MotorCurveParams> {
    match (channel, reverse) {
        (MotorChannel::LeftDrive, false) => Some(&LEFT_FORWARD),
        (MotorChannel::LeftDrive, true) => Some(&LEFT_REVERSE),
        (MotorChannel::RightDrive, false) => Some(&RIGHT_FORWARD),
        (MotorChannel::RightDrive, true) => Some(&RIGHT_REVERSE),
        (MotorChannel::Weapon, _) => None,
    }
}

/// Maps a desired speed percent to the throttle percent that produces it on `channel`.
pub fn compensate(channel: MotorChannel, desired_percent: i32) -> i32 {
    let desired = desired_percent.clamp(-100, 100);
    if desired == 0 {
        return 0;
    }
    let reverse = desired < 0;
    let Some(curve) = curve_for(channel, reverse) else {
        return desired;
    };
    let rpm = desired.abs() * MAX_WHEEL_RPM / 100;
    let throttle = curve.throttle_for_rpm(rpm as f32) as i32;
    let signed = if reverse { -throttle } else { throttle };
    signed.clamp(-100, 100)
}
