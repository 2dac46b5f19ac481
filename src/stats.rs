// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Hardware statistics as delivered by the ISP driver, and the validated form
//! the algorithms consume.

use std::time::SystemTime;

use log::warn;

use crate::sensor::{ExposureParams, WorkingMode};

pub const HISTOGRAM_BINS: usize = 256;

/// Exposure statistics block. `histogram` has HISTOGRAM_BINS entries;
/// `zone_luma` holds the mean 8-bit luma of each metering zone.
#[derive(Clone, Debug, Default)]
pub struct RawAeStats {
    pub histogram: Vec<u32>,
    pub zone_luma: Vec<u8>,
}

/// White balance statistics: per-zone (R, G, B) sums over near-white pixels,
/// plus the number of pixels that contributed to each zone.
#[derive(Clone, Debug, Default)]
pub struct RawAwbStats {
    pub zone_sums: Vec<[u32; 3]>,
    pub zone_counts: Vec<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct RawAfStats {
    /// Per-window contrast measure.
    pub zone_sharpness: Vec<u32>,
    /// Lens motor position when the window was measured.
    pub lens_position: i32,
}

/// Per-exposure luma histograms for HDR capture, long exposure first.
#[derive(Clone, Debug, Default)]
pub struct RawHdrStats {
    pub exposure_histograms: Vec<Vec<u32>>,
}

#[derive(Clone, Debug, Default)]
pub struct RawOrbStats {
    pub keypoints: Vec<(u16, u16)>,
}

/// One frame's worth of statistics as pushed by the hardware layer. A block
/// is None when the ISP did not produce it for this frame.
#[derive(Clone, Debug)]
pub struct IspStatsBuffer {
    pub frame_id: u32,
    pub readout_time: SystemTime,

    /// Exposure the frame was captured with.
    pub exposure: ExposureParams,

    pub ae: Option<RawAeStats>,
    pub awb: Option<RawAwbStats>,
    pub af: Option<RawAfStats>,
    pub hdr: Option<RawHdrStats>,
    pub orb: Option<RawOrbStats>,
}

impl IspStatsBuffer {
    /// A buffer with no statistics blocks at all.
    pub fn empty(frame_id: u32) -> Self {
        IspStatsBuffer {
            frame_id,
            readout_time: SystemTime::now(),
            exposure: ExposureParams::default(),
            ae: None,
            awb: None,
            af: None,
            hdr: None,
            orb: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AecStats {
    pub histogram: Vec<u32>,
    /// Mean luma in [0, 255].
    pub mean_luma: f32,
    pub zone_luma: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AwbStats {
    /// Sums over all zones with a non-zero pixel count.
    pub rgb_sum: [f64; 3],
    pub valid_zones: usize,
}

impl AwbStats {
    /// Gray world (R, B) gains that would neutralize the measured sums.
    pub fn gray_world_gains(&self) -> Option<(f32, f32)> {
        let [r, g, b] = self.rgb_sum;
        if r <= 0.0 || g <= 0.0 || b <= 0.0 {
            return None;
        }
        Some(((g / r) as f32, (g / b) as f32))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AfStats {
    pub sharpness: f64,
    pub zone_sharpness: Vec<u32>,
    pub lens_position: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HdrStats {
    /// Mean luma per exposure, long exposure first.
    pub exposure_luma: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrbStats {
    pub keypoints: Vec<(u16, u16)>,
}

/// Validated, algorithm-facing statistics for one frame. A None block means
/// the corresponding validity flag is unset.
#[derive(Clone, Debug)]
pub struct AnalyzerStats {
    pub frame_id: u32,
    pub readout_time: SystemTime,
    pub exposure: ExposureParams,
    pub aec: Option<AecStats>,
    pub awb: Option<AwbStats>,
    pub af: Option<AfStats>,
    pub hdr: Option<HdrStats>,
    pub orb: Option<OrbStats>,
}

impl AnalyzerStats {
    pub fn empty(frame_id: u32) -> Self {
        Self::convert(&IspStatsBuffer::empty(frame_id), WorkingMode::Normal)
    }

    pub fn aec_valid(&self) -> bool { self.aec.is_some() }
    pub fn awb_valid(&self) -> bool { self.awb.is_some() }
    pub fn af_valid(&self) -> bool { self.af.is_some() }
    pub fn hdr_valid(&self) -> bool { self.hdr.is_some() }
    pub fn orb_valid(&self) -> bool { self.orb.is_some() }

    /// Converts the hardware representation. Malformed blocks are logged and
    /// marked invalid; they never fail the whole frame.
    pub fn convert(raw: &IspStatsBuffer, mode: WorkingMode) -> Self {
        let frame_id = raw.frame_id;
        AnalyzerStats {
            frame_id,
            readout_time: raw.readout_time,
            exposure: raw.exposure,
            aec: raw.ae.as_ref().and_then(|ae| convert_aec(frame_id, ae)),
            awb: raw.awb.as_ref().and_then(|awb| convert_awb(frame_id, awb)),
            af: raw.af.as_ref().and_then(|af| convert_af(frame_id, af)),
            hdr: raw.hdr.as_ref().and_then(|hdr| convert_hdr(frame_id, hdr, mode)),
            orb: raw.orb.as_ref().map(|orb| OrbStats{keypoints: orb.keypoints.clone()}),
        }
    }
}

/// Mean bin index of a histogram, or None if it is empty.
pub fn histogram_mean(histogram: &[u32]) -> Option<f32> {
    let total: u64 = histogram.iter().map(|&c| c as u64).sum();
    if total == 0 {
        return None;
    }
    let weighted: u64 = histogram.iter().enumerate()
        .map(|(bin, &c)| bin as u64 * c as u64).sum();
    Some((weighted as f64 / total as f64) as f32)
}

fn convert_aec(frame_id: u32, raw: &RawAeStats) -> Option<AecStats> {
    if raw.histogram.len() != HISTOGRAM_BINS {
        warn!("frame {}: AE histogram has {} bins, expected {}",
              frame_id, raw.histogram.len(), HISTOGRAM_BINS);
        return None;
    }
    let Some(mean_luma) = histogram_mean(&raw.histogram) else {
        warn!("frame {}: AE histogram is empty", frame_id);
        return None;
    };
    Some(AecStats {
        histogram: raw.histogram.clone(),
        mean_luma,
        zone_luma: raw.zone_luma.clone(),
    })
}

fn convert_awb(frame_id: u32, raw: &RawAwbStats) -> Option<AwbStats> {
    if raw.zone_sums.len() != raw.zone_counts.len() {
        warn!("frame {}: AWB has {} zone sums but {} zone counts",
              frame_id, raw.zone_sums.len(), raw.zone_counts.len());
        return None;
    }
    let mut rgb_sum = [0.0f64; 3];
    let mut valid_zones = 0;
    for (sums, &count) in raw.zone_sums.iter().zip(raw.zone_counts.iter()) {
        if count == 0 {
            continue;
        }
        valid_zones += 1;
        for c in 0..3 {
            rgb_sum[c] += sums[c] as f64;
        }
    }
    if valid_zones == 0 {
        warn!("frame {}: AWB has no populated zones", frame_id);
        return None;
    }
    Some(AwbStats{rgb_sum, valid_zones})
}

fn convert_af(frame_id: u32, raw: &RawAfStats) -> Option<AfStats> {
    if raw.zone_sharpness.is_empty() {
        warn!("frame {}: AF has no windows", frame_id);
        return None;
    }
    Some(AfStats {
        sharpness: raw.zone_sharpness.iter().map(|&s| s as f64).sum(),
        zone_sharpness: raw.zone_sharpness.clone(),
        lens_position: raw.lens_position,
    })
}

fn convert_hdr(frame_id: u32, raw: &RawHdrStats, mode: WorkingMode) -> Option<HdrStats> {
    if raw.exposure_histograms.len() != mode.exposure_count() {
        warn!("frame {}: HDR stats cover {} exposures but mode {} uses {}",
              frame_id, raw.exposure_histograms.len(), mode, mode.exposure_count());
        return None;
    }
    let mut exposure_luma = Vec::with_capacity(raw.exposure_histograms.len());
    for histogram in &raw.exposure_histograms {
        exposure_luma.push(histogram_mean(histogram)?);
    }
    Some(HdrStats{exposure_luma})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_histogram(bin: usize) -> Vec<u32> {
        let mut h = vec![0; HISTOGRAM_BINS];
        h[bin] = 100;
        h
    }

    #[test]
    fn mean_of_histogram() {
        assert_eq!(histogram_mean(&flat_histogram(40)), Some(40.0));
        assert_eq!(histogram_mean(&vec![0; HISTOGRAM_BINS]), None);
    }

    #[test]
    fn malformed_blocks_become_invalid() {
        let mut raw = IspStatsBuffer::empty(7);
        raw.ae = Some(RawAeStats{histogram: vec![1; 10], zone_luma: vec![]});
        raw.awb = Some(RawAwbStats{zone_sums: vec![[1, 1, 1]], zone_counts: vec![]});
        raw.af = Some(RawAfStats{zone_sharpness: vec![], lens_position: 0});
        let stats = AnalyzerStats::convert(&raw, WorkingMode::Normal);
        assert_eq!(stats.frame_id, 7);
        assert!(!stats.aec_valid());
        assert!(!stats.awb_valid());
        assert!(!stats.af_valid());
    }

    #[test]
    fn awb_ignores_empty_zones() {
        let mut raw = IspStatsBuffer::empty(1);
        raw.awb = Some(RawAwbStats{
            zone_sums: vec![[100, 200, 50], [999, 999, 999]],
            zone_counts: vec![10, 0],
        });
        let awb = AnalyzerStats::convert(&raw, WorkingMode::Normal).awb.unwrap();
        assert_eq!(awb.valid_zones, 1);
        assert_eq!(awb.gray_world_gains(), Some((2.0, 4.0)));
    }

    #[test]
    fn hdr_exposure_count_must_match_mode() {
        let mut raw = IspStatsBuffer::empty(1);
        raw.hdr = Some(RawHdrStats{
            exposure_histograms: vec![flat_histogram(200), flat_histogram(50)],
        });
        assert!(AnalyzerStats::convert(&raw, WorkingMode::Hdr2).hdr_valid());
        assert!(!AnalyzerStats::convert(&raw, WorkingMode::Hdr3).hdr_valid());
    }
}
