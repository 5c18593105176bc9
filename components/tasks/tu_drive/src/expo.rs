/// Stick input range after the gamepad adapter.
pub const STICK_MAX: i32 = 127;

/// The expo curve: `x(1-k) + x³k` on a normalized input in [-1, 1].
/// k = 0 is linear, k = 1 is a pure cube.
#[inline]
pub fn expo_curve(x: f32, k: f32) -> f32 {
    let x = x.clamp(-1.0, 1.0);
    let k = k.clamp(0.0, 1.0);
    x * (1.0 - k) + x * x * x * k
}

/// Expo on a stick value in [-127, 127] with `expo` in percent.
pub fn apply_expo(input: i32, expo: u8) -> i32 {
    let input = input.clamp(-STICK_MAX, STICK_MAX);
    if input == 0 || expo == 0 {
        return input;
    }
    let out = expo_curve(input as f32 / STICK_MAX as f32, expo.min(100) as f32 / 100.0);
    ((out * STICK_MAX as f32).round() as i32).clamp(-STICK_MAX, STICK_MAX)
}

/// Same curve on a percentage in [-100, 100].
pub fn expo_percent(percent: i32, expo: u8) -> i32 {
    let percent = percent.clamp(-100, 100);
    if percent == 0 || expo == 0 {
        return percent;
    }
    let out = expo_curve(percent as f32 / 100.0, expo.min(100) as f32 / 100.0);
    ((out * 100.0).round() as i32).clamp(-100, 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_expo_zero_is_identity() {
        for x in -STICK_MAX..=STICK_MAX {
            assert_eq!(apply_expo(x, 0), x);
        }
        for p in -100..=100 {
            assert_eq!(expo_percent(p, 0), p);
        }
    }

    #[test]
    fn test_expo_full_is_cubic() {
        assert_relative_eq!(expo_curve(0.5, 1.0), 0.125);
        assert_eq!(apply_expo(127, 100), 127);
        assert_eq!(apply_expo(-127, 100), -127);
        assert_eq!(expo_percent(50, 100), 13);
    }

    #[test]
    fn test_expo_is_odd_and_bounded() {
        for expo in [0u8, 20, 30, 100, 255] {
            for x in -200..=200 {
                let y = apply_expo(x, expo);
                assert!((-STICK_MAX..=STICK_MAX).contains(&y));
                assert_eq!(apply_expo(-x, expo), -y);
            }
        }
    }

    #[test]
    fn test_expo_softens_center() {
        assert!(apply_expo(40, 30) < 40);
        assert_eq!(expo_percent(100, 20), 100);
        // 0.5 * 0.8 + 0.125 * 0.2 = 0.425
        assert_eq!(expo_percent(50, 20), 43);
    }
}
