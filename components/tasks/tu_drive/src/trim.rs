//! Per-speed turn trim.
//!
//! While trim mode is active the driver holds the robot straight at a few
//! speeds and captures `(speed, turn offset)` pairs. Leaving trim mode cleans
//! the samples up into a curve that the mixer interpolates on every frame.
use bincode::de::Decoder;
use bincode::enc::Encoder;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thumbsup_core::freeze::Freezable;
use thumbsup_core::hw::BlobStore;
use thumbsup_core::{ErrorKind, TuError, TuResult};

pub const TRIM_MAGIC: u32 = 0x5452_4D32;
pub const TRIM_BLOB_KEY: &str = "trim";
pub const MAX_TRIM_SAMPLES: usize = 30;
pub const MIN_SAMPLES_TO_SAVE: usize = 5;
pub const MIN_SPEED_PERCENT: i32 = 5;
const MAX_SAMPLES_PER_DIRECTION: usize = 20;
const DOWNSAMPLE_TARGET: usize = 15;
const OUTLIER_SIGMA: f32 = 3.0;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct TrimSample {
    pub speed_percent: i8,
    pub turn_offset: i8,
}

impl TrimSample {
    pub fn new(speed_percent: i32, turn_offset: i32) -> TuResult<Self> {
        if !in_percent_range(speed_percent) || !in_percent_range(turn_offset) {
            return Err(TuError::new(
                ErrorKind::OutOfRange,
                format!("trim sample ({speed_percent}, {turn_offset}) outside [-100, 100]"),
            ));
        }
        Ok(TrimSample {
            speed_percent: speed_percent as i8,
            turn_offset: turn_offset as i8,
        })
    }

    fn is_valid(&self) -> bool {
        in_percent_range(self.speed_percent as i32) && in_percent_range(self.turn_offset as i32)
    }
}

fn in_percent_range(value: i32) -> bool {
    (-100..=100).contains(&value)
}

/// On-flash layout of the fitted curve.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct TrimRecord {
    magic: u32,
    count: u8,
    samples: [TrimSample; MAX_TRIM_SAMPLES],
    checksum: u32,
}

impl TrimRecord {
    fn from_samples(fitted: &[TrimSample]) -> Self {
        let mut samples = [TrimSample::default(); MAX_TRIM_SAMPLES];
        let count = fitted.len().min(MAX_TRIM_SAMPLES);
        samples[..count].copy_from_slice(&fitted[..count]);
        let mut record = TrimRecord {
            magic: TRIM_MAGIC,
            count: count as u8,
            samples,
            checksum: 0,
        };
        record.checksum = record.compute_checksum();
        record
    }

    fn compute_checksum(&self) -> u32 {
        let count = (self.count as usize).min(MAX_TRIM_SAMPLES);
        self.samples[..count].iter().fold(
            self.magic.wrapping_add(self.count as u32),
            |acc, s| acc.wrapping_add((s.speed_percent as i32 + s.turn_offset as i32) as u32),
        )
    }

    fn into_samples(self) -> TuResult<Vec<TrimSample>> {
        if self.magic != TRIM_MAGIC {
            return Err(TuError::new(
                ErrorKind::CommFailure,
                format!("trim record magic 0x{:08X} is wrong", self.magic),
            ));
        }
        if self.count as usize > MAX_TRIM_SAMPLES {
            return Err(TuError::new(
                ErrorKind::OutOfRange,
                format!("trim record claims {} samples", self.count),
            ));
        }
        if self.checksum != self.compute_checksum() {
            return Err(TuError::new(
                ErrorKind::CommFailure,
                "trim record checksum mismatch",
            ));
        }
        let samples = &self.samples[..self.count as usize];
        if let Some(bad) = samples.iter().find(|s| !s.is_valid()) {
            return Err(TuError::new(
                ErrorKind::OutOfRange,
                format!("trim record holds out of range sample {bad:?}"),
            ));
        }
        let mut samples = samples.to_vec();
        samples.sort_by_key(|s| s.speed_percent);
        Ok(samples)
    }
}

fn record_config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Capture session plus the fitted curve it produces.
#[derive(Debug, Default, Clone)]
pub struct TrimCalibrator {
    active: bool,
    samples: Vec<TrimSample>,
    fitted: Vec<TrimSample>,
}

impl TrimCalibrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Starts a fresh capture session. The current curve stays in effect.
    pub fn enter(&mut self) {
        self.samples.clear();
        self.active = true;
        info!("trim mode entered");
    }

    pub fn capture(&mut self, speed_percent: i32, turn_offset: i32) -> TuResult<()> {
        if !self.active {
            return Err(TuError::new(
                ErrorKind::InvalidState,
                "trim mode is not active",
            ));
        }
        let sample = TrimSample::new(speed_percent, turn_offset)?;
        if self.samples.len() >= MAX_TRIM_SAMPLES {
            return Err(TuError::new(
                ErrorKind::ResourceExhausted,
                format!("already holding {MAX_TRIM_SAMPLES} trim samples"),
            ));
        }
        self.samples.push(sample);
        debug!(
            "trim sample {} captured: speed={} offset={}",
            self.samples.len(),
            speed_percent,
            turn_offset
        );
        Ok(())
    }

    pub fn remove_last_sample(&mut self) -> Option<TrimSample> {
        if !self.active {
            return None;
        }
        self.samples.pop()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn fitted(&self) -> &[TrimSample] {
        &self.fitted
    }

    /// Cleans the captured samples into a new curve. On failure the old curve is kept.
    pub fn fit(&mut self) -> TuResult<usize> {
        let curve = fit_curve(&self.samples)?;
        info!("trim curve fitted with {} samples", curve.len());
        self.fitted = curve;
        Ok(self.fitted.len())
    }

    /// Leaves trim mode, fitting and persisting the curve.
    pub fn exit(&mut self, store: &mut impl BlobStore) -> TuResult<usize> {
        if !self.active {
            return Err(TuError::new(
                ErrorKind::InvalidState,
                "trim mode is not active",
            ));
        }
        self.active = false;
        let result = self.fit();
        self.samples.clear();
        let count = result.map_err(|e| {
            warn!("trim fit failed, keeping previous curve: {e}");
            e
        })?;
        self.save(store)?;
        Ok(count)
    }

    /// Turn offset for `speed_percent`, interpolated on the fitted curve.
    pub fn get_offset(&self, speed_percent: i32) -> i32 {
        let curve = &self.fitted;
        let (Some(first), Some(last)) = (curve.first(), curve.last()) else {
            return 0;
        };
        if curve.len() == 1 || speed_percent <= first.speed_percent as i32 {
            return first.turn_offset as i32;
        }
        if speed_percent >= last.speed_percent as i32 {
            return last.turn_offset as i32;
        }
        for pair in curve.windows(2) {
            let (s0, o0) = (pair[0].speed_percent as i32, pair[0].turn_offset as i32);
            let (s1, o1) = (pair[1].speed_percent as i32, pair[1].turn_offset as i32);
            if speed_percent < s0 || speed_percent > s1 {
                continue;
            }
            if s1 == s0 {
                return o0;
            }
            let t = (speed_percent - s0) as f32 / (s1 - s0) as f32;
            return (o0 as f32 + t * (o1 - o0) as f32).round() as i32;
        }
        0
    }

    pub fn save(&self, store: &mut impl BlobStore) -> TuResult<()> {
        let record = TrimRecord::from_samples(&self.fitted);
        let bytes = bincode::encode_to_vec(&record, record_config())
            .map_err(|e| TuError::new_with_cause("Failed to encode trim record", e))?;
        store
            .store(TRIM_BLOB_KEY, &bytes)
            .map_err(|e| e.add_context("saving trim"))?;
        info!("trim saved ({} samples)", record.count);
        Ok(())
    }

    /// Replaces the curve with the persisted one. Anything invalid leaves zero trim.
    pub fn load(&mut self, store: &impl BlobStore) -> TuResult<usize> {
        self.fitted.clear();
        let Some(bytes) = store.load(TRIM_BLOB_KEY)? else {
            info!("no stored trim, using zero trim");
            return Ok(0);
        };
        let (record, _): (TrimRecord, usize) =
            bincode::decode_from_slice(&bytes, record_config())
                .map_err(|e| TuError::new_with_cause("Failed to decode trim record", e))?;
        self.fitted = record.into_samples()?;
        info!("trim loaded ({} samples)", self.fitted.len());
        Ok(self.fitted.len())
    }

    /// Drops the curve and persists the empty record.
    pub fn reset(&mut self, store: &mut impl BlobStore) -> TuResult<()> {
        self.samples.clear();
        self.fitted.clear();
        self.save(store)
    }
}

impl Freezable for TrimCalibrator {
    fn freeze<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        Encode::encode(&self.active, encoder)?;
        Encode::encode(&self.samples, encoder)?;
        Encode::encode(&self.fitted, encoder)
    }

    fn thaw<D: Decoder>(&mut self, decoder: &mut D) -> Result<(), DecodeError> {
        self.active = Decode::decode(decoder)?;
        self.samples = Decode::decode(decoder)?;
        self.fitted = Decode::decode(decoder)?;
        Ok(())
    }
}

fn fit_curve(samples: &[TrimSample]) -> TuResult<Vec<TrimSample>> {
    let moving: Vec<TrimSample> = samples
        .iter()
        .copied()
        .filter(|s| (s.speed_percent as i32).abs() >= MIN_SPEED_PERCENT)
        .collect();
    let (forward, reverse): (Vec<_>, Vec<_>) =
        moving.into_iter().partition(|s| s.speed_percent > 0);

    let mut curve = clean_direction(reverse);
    curve.extend(clean_direction(forward));
    curve.sort_by_key(|s| s.speed_percent);

    if curve.len() < MIN_SAMPLES_TO_SAVE {
        return Err(TuError::new(
            ErrorKind::InvalidParam,
            format!(
                "{} usable trim samples, need {}",
                curve.len(),
                MIN_SAMPLES_TO_SAVE
            ),
        ));
    }
    Ok(curve)
}

fn clean_direction(samples: Vec<TrimSample>) -> Vec<TrimSample> {
    let samples = remove_outliers(samples);
    if samples.len() > MAX_SAMPLES_PER_DIRECTION {
        downsample(samples, DOWNSAMPLE_TARGET)
    } else {
        samples
    }
}

fn remove_outliers(samples: Vec<TrimSample>) -> Vec<TrimSample> {
    if samples.len() < 3 {
        return samples;
    }
    let n = samples.len() as f32;
    let mean = samples.iter().map(|s| s.turn_offset as f32).sum::<f32>() / n;
    let variance = samples
        .iter()
        .map(|s| (s.turn_offset as f32 - mean).powi(2))
        .sum::<f32>()
        / (n - 1.0);
    let stddev = variance.sqrt();
    if stddev < 0.1 {
        return samples;
    }
    let threshold = OUTLIER_SIGMA * stddev;
    samples
        .into_iter()
        .filter(|s| {
            let keep = (s.turn_offset as f32 - mean).abs() <= threshold;
            if !keep {
                debug!("trim outlier dropped: {s:?}");
            }
            keep
        })
        .collect()
}

/// Evenly spaced subset by speed, always keeping both ends.
fn downsample(mut samples: Vec<TrimSample>, target: usize) -> Vec<TrimSample> {
    let count = samples.len();
    if count <= target || target < 2 {
        return samples;
    }
    samples.sort_by_key(|s| s.speed_percent);
    let step = (count - 1) as f32 / (target - 1) as f32;
    let mut out = Vec::with_capacity(target);
    out.push(samples[0]);
    for i in 1..target - 1 {
        let idx = (i as f32 * step + 0.5) as usize;
        if idx < count {
            out.push(samples[idx]);
        }
    }
    out.push(samples[count - 1]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use thumbsup_core::freeze::{freeze_to_vec, thaw_from_slice};
    use tu_sim::MemoryBlobStore;

    fn calibrated(points: &[(i32, i32)]) -> TrimCalibrator {
        let mut trim = TrimCalibrator::new();
        trim.enter();
        for &(speed, offset) in points {
            trim.capture(speed, offset).unwrap();
        }
        trim
    }

    const FIVE: [(i32, i32); 5] = [(20, 2), (40, 4), (60, 6), (80, 8), (100, 10)];

    #[test]
    fn test_five_sample_fit_interpolates() {
        let mut store = MemoryBlobStore::new();
        let mut trim = calibrated(&FIVE);
        assert_eq!(trim.exit(&mut store).unwrap(), 5);
        assert!(!trim.is_active());
        assert_eq!(trim.get_offset(50), 5);
        assert_eq!(trim.get_offset(70), 7);
        assert_eq!(trim.get_offset(20), 2);
    }

    #[test]
    fn test_offsets_clamp_outside_range() {
        let mut trim = calibrated(&FIVE);
        trim.fit().unwrap();
        assert_eq!(trim.get_offset(0), 2);
        assert_eq!(trim.get_offset(-100), 2);
        assert_eq!(trim.get_offset(127), 10);
    }

    #[test]
    fn test_interpolation_rounds_to_nearest() {
        let mut trim = calibrated(&[(10, 0), (20, 1), (30, 2), (40, 3), (50, 4)]);
        trim.fit().unwrap();
        // 14 -> 0.4, 15 -> 0.5, 16 -> 0.6
        assert_eq!(trim.get_offset(14), 0);
        assert_eq!(trim.get_offset(15), 1);
        assert_eq!(trim.get_offset(16), 1);
    }

    #[test]
    fn test_empty_curve_gives_zero() {
        let trim = TrimCalibrator::new();
        assert_eq!(trim.get_offset(50), 0);
        assert_eq!(trim.get_offset(-50), 0);
    }

    #[test]
    fn test_capture_rules() {
        let mut trim = TrimCalibrator::new();
        assert_eq!(
            trim.capture(50, 5).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        trim.enter();
        assert_eq!(
            trim.capture(101, 0).unwrap_err().kind(),
            ErrorKind::OutOfRange
        );
        assert_eq!(
            trim.capture(50, -101).unwrap_err().kind(),
            ErrorKind::OutOfRange
        );
        for i in 0..MAX_TRIM_SAMPLES {
            trim.capture(i as i32, 1).unwrap();
        }
        assert_eq!(
            trim.capture(50, 1).unwrap_err().kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(trim.sample_count(), MAX_TRIM_SAMPLES);
    }

    #[test]
    fn test_remove_last_sample() {
        let mut trim = calibrated(&[(30, 3), (60, 6)]);
        assert_eq!(
            trim.remove_last_sample(),
            Some(TrimSample {
                speed_percent: 60,
                turn_offset: 6
            })
        );
        assert_eq!(trim.sample_count(), 1);
    }

    #[test]
    fn test_failed_fit_keeps_previous_curve() {
        let mut store = MemoryBlobStore::new();
        let mut trim = calibrated(&FIVE);
        trim.exit(&mut store).unwrap();
        let saved = store.raw(TRIM_BLOB_KEY).unwrap();

        trim.enter();
        trim.capture(50, 40).unwrap();
        trim.capture(2, 40).unwrap();
        assert!(trim.exit(&mut store).is_err());
        assert_eq!(trim.get_offset(50), 5);
        assert_eq!(store.raw(TRIM_BLOB_KEY).unwrap(), saved);
    }

    #[test]
    fn test_near_zero_speeds_dropped() {
        let mut trim = calibrated(&[(0, 30), (4, 30), (-4, 30), (20, 2), (40, 4), (60, 6)]);
        assert!(trim.fit().is_err());
        trim.capture(80, 8).unwrap();
        trim.capture(100, 10).unwrap();
        assert_eq!(trim.fit().unwrap(), 5);
        assert!(trim.fitted().iter().all(|s| s.speed_percent >= 20));
    }

    #[test]
    fn test_outlier_removed() {
        let mut points: Vec<(i32, i32)> = (1..=12).map(|i| (i * 8, 5)).collect();
        points[3].1 = 4;
        points[7].1 = 6;
        points.push((100, 90));
        let mut trim = calibrated(&points);
        assert_eq!(trim.fit().unwrap(), 12);
        assert!(trim.fitted().iter().all(|s| s.turn_offset != 90));
    }

    #[test]
    fn test_identical_offsets_are_not_outliers() {
        let points: Vec<(i32, i32)> = (1..=8).map(|i| (i * 10, 3)).collect();
        let mut trim = calibrated(&points);
        assert_eq!(trim.fit().unwrap(), 8);
    }

    #[test]
    fn test_large_direction_downsampled() {
        let mut points: Vec<(i32, i32)> = (0..25).map(|i| (10 + i * 3, 2)).collect();
        points.extend([(-20, -1), (-60, -3)]);
        let mut trim = calibrated(&points[..MAX_TRIM_SAMPLES.min(points.len())]);
        assert_eq!(trim.fit().unwrap(), 17);
        let fitted = trim.fitted();
        assert_eq!(fitted[0].speed_percent, -60);
        assert_eq!(fitted[2].speed_percent, 10);
        assert_eq!(fitted.last().unwrap().speed_percent, 82);
        assert!(fitted.windows(2).all(|w| w[0].speed_percent <= w[1].speed_percent));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut store = MemoryBlobStore::new();
        let mut trim = calibrated(&FIVE);
        trim.exit(&mut store).unwrap();
        assert_eq!(store.raw(TRIM_BLOB_KEY).unwrap().len(), 69);

        let mut restored = TrimCalibrator::new();
        assert_eq!(restored.load(&store).unwrap(), 5);
        assert_eq!(restored.fitted(), trim.fitted());
        assert_eq!(restored.get_offset(50), 5);
    }

    #[test]
    fn test_missing_blob_is_zero_trim() {
        let store = MemoryBlobStore::new();
        let mut trim = TrimCalibrator::new();
        assert_eq!(trim.load(&store).unwrap(), 0);
        assert_eq!(trim.get_offset(50), 0);
    }

    #[test]
    fn test_flipped_magic_rejected() {
        let mut store = MemoryBlobStore::new();
        let mut trim = calibrated(&FIVE);
        trim.exit(&mut store).unwrap();
        store.corrupt_byte(TRIM_BLOB_KEY, 0);

        let mut restored = TrimCalibrator::new();
        assert!(restored.load(&store).is_err());
        assert_eq!(restored.get_offset(50), 0);
        assert!(restored.fitted().is_empty());
    }

    #[test]
    fn test_corrupt_sample_rejected() {
        let mut store = MemoryBlobStore::new();
        let mut trim = calibrated(&FIVE);
        trim.exit(&mut store).unwrap();
        // first sample's offset byte: magic(4) + count(1) + speed(1)
        store.corrupt_byte(TRIM_BLOB_KEY, 6);
        let mut restored = TrimCalibrator::new();
        assert!(restored.load(&store).is_err());
        assert!(restored.fitted().is_empty());
    }

    #[test]
    fn test_count_over_limit_rejected() {
        let mut record = TrimRecord::from_samples(&[]);
        record.count = 31;
        record.checksum = record.compute_checksum();
        assert_eq!(
            record.into_samples().unwrap_err().kind(),
            ErrorKind::OutOfRange
        );
    }

    #[test]
    fn test_out_of_range_sample_rejected() {
        let mut record = TrimRecord::from_samples(&[TrimSample::new(50, 5).unwrap()]);
        record.samples[0].turn_offset = 120;
        record.checksum = record.compute_checksum();
        assert_eq!(
            record.into_samples().unwrap_err().kind(),
            ErrorKind::OutOfRange
        );
    }

    #[test]
    fn test_checksum_wraps_with_negative_samples() {
        let record = TrimRecord::from_samples(&[TrimSample::new(-100, -100).unwrap()]);
        assert_eq!(
            record.checksum,
            TRIM_MAGIC.wrapping_add(1).wrapping_sub(200)
        );
    }

    #[test]
    fn test_reset_persists_empty_curve() {
        let mut store = MemoryBlobStore::new();
        let mut trim = calibrated(&FIVE);
        trim.exit(&mut store).unwrap();
        trim.reset(&mut store).unwrap();
        assert_eq!(trim.get_offset(50), 0);
        let mut restored = TrimCalibrator::new();
        assert_eq!(restored.load(&store).unwrap(), 0);
    }

    #[test]
    fn test_store_failure_reported() {
        let mut store = MemoryBlobStore::new();
        store.set_fail_writes(true);
        let mut trim = calibrated(&FIVE);
        assert!(trim.exit(&mut store).is_err());
        assert_eq!(trim.get_offset(50), 5);
    }

    #[test]
    fn test_freeze_thaw() {
        let mut trim = calibrated(&FIVE);
        trim.fit().unwrap();
        trim.capture(30, 1).unwrap();
        let bytes = freeze_to_vec(&trim).unwrap();
        let mut restored = TrimCalibrator::new();
        thaw_from_slice(&mut restored, &bytes).unwrap();
        assert!(restored.is_active());
        assert_eq!(restored.sample_count(), 6);
        assert_eq!(restored.get_offset(50), 5);
    }
}
