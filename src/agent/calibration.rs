use serde::{Deserialize, Serialize};

/// Two-point linear mapping from raw soil-probe ADC counts to a moisture
/// percentage. A dry probe reads `max_raw`, a submerged one `min_raw`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoilCalibration {
    pub max_raw: f64,
    pub min_raw: f64,
    /// Drop readings outside `[min_raw, max_raw]` instead of extrapolating.
    #[serde(default)]
    pub reject_out_of_range: bool,
}

impl Default for SoilCalibration {
    fn default() -> Self {
        Self {
            max_raw: 49_300.0,
            min_raw: 18_000.0,
            reject_out_of_range: false,
        }
    }
}

impl SoilCalibration {
    /// Percentage for a raw count. Values outside the calibrated range are
    /// extrapolated (below 0 or above 100) unless `reject_out_of_range` is set.
    pub fn percent(&self, raw: f64) -> Option<f64> {
        if self.max_raw == self.min_raw {
            return None;
        }
        if self.reject_out_of_range && (raw < self.min_raw || raw > self.max_raw) {
            return None;
        }
        Some((self.max_raw - raw) * 100.0 / (self.max_raw - self.min_raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_map_to_zero_and_hundred() {
        let c = SoilCalibration::default();
        assert_eq!(c.percent(49_300.0), Some(0.0));
        assert_eq!(c.percent(18_000.0), Some(100.0));
    }

    #[test]
    fn wetter_probe_reads_higher() {
        let c = SoilCalibration::default();
        let mut last = f64::MIN;
        for raw in (18_000..=49_300).rev().step_by(1_000) {
            let p = c.percent(raw as f64).unwrap();
            assert!(p > last);
            last = p;
        }
    }

    #[test]
    fn out_of_range_is_extrapolated_by_default() {
        let c = SoilCalibration::default();
        assert!(c.percent(60_000.0).unwrap() < 0.0);
        assert!(c.percent(10_000.0).unwrap() > 100.0);
    }

    #[test]
    fn out_of_range_can_be_rejected() {
        let c = SoilCalibration {
            max_raw: 600.0,
            min_raw: 250.0,
            reject_out_of_range: true,
        };
        assert_eq!(c.percent(700.0), None);
        assert_eq!(c.percent(200.0), None);
        assert_eq!(c.percent(425.0), Some(50.0));
    }

    #[test]
    fn degenerate_calibration_yields_nothing() {
        let c = SoilCalibration {
            max_raw: 100.0,
            min_raw: 100.0,
            reject_out_of_range: false,
        };
        assert_eq!(c.percent(100.0), None);
    }
}
