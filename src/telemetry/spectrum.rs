/// Spectrum computation for vibration readings
///
/// The store takes any `SpectrumTransform`; `MagnitudeSpectrum` is a plain
/// DFT that is fine for the few hundred samples a sensor capture holds.
use std::f64::consts::PI;

use super::readings::AxisSamples;

pub trait SpectrumTransform: Send + Sync {
    /// Magnitudes of bins `0..len/2` for a real-valued signal
    fn magnitude(&self, samples: &[f64]) -> Vec<f64>;

    fn name(&self) -> &'static str;
}

/// Single-sided amplitude spectrum via a direct DFT, DC removed
#[derive(Debug, Clone, Copy, Default)]
pub struct MagnitudeSpectrum;

impl SpectrumTransform for MagnitudeSpectrum {
    fn magnitude(&self, samples: &[f64]) -> Vec<f64> {
        let n = samples.len();
        if n < 2 {
            return Vec::new();
        }

        let mean = samples.iter().sum::<f64>() / n as f64;
        let scale = 2.0 / n as f64;

        (0..n / 2)
            .map(|k| {
                let (mut re, mut im) = (0.0, 0.0);
                for (i, sample) in samples.iter().enumerate() {
                    let angle = 2.0 * PI * (k * i) as f64 / n as f64;
                    let value = sample - mean;
                    re += value * angle.cos();
                    im -= value * angle.sin();
                }
                (re * re + im * im).sqrt() * scale
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "dft-magnitude"
    }
}

pub fn axis_spectrum(transform: &dyn SpectrumTransform, samples: &AxisSamples) -> AxisSamples {
    AxisSamples {
        x: transform.magnitude(&samples.x),
        y: transform.magnitude(&samples.y),
        z: transform.magnitude(&samples.z),
    }
}

/// Frequency in Hz of bin `index` for a capture of `sample_count` samples
pub fn bin_frequency(index: usize, sample_count: usize, sample_rate_hz: f64) -> f64 {
    if sample_count == 0 {
        return 0.0;
    }
    index as f64 * sample_rate_hz / sample_count as f64
}

/// Frequency of the strongest non-DC bin
pub fn dominant_frequency(spectrum: &[f64], sample_count: usize, sample_rate_hz: f64) -> Option<f64> {
    spectrum
        .iter()
        .enumerate()
        .skip(1)
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(index, _)| bin_frequency(index, sample_count, sample_rate_hz))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pure_tone_peaks_at_its_bin() {
        let n = 64;
        let rate = 640.0;
        // 50 Hz falls exactly on bin 5
        let samples: Vec<f64> = (0..n)
            .map(|i| 2.0 * (2.0 * PI * 50.0 * i as f64 / rate).sin() + 0.7)
            .collect();

        let spectrum = MagnitudeSpectrum.magnitude(&samples);
        assert_eq!(spectrum.len(), n / 2);
        assert!((spectrum[5] - 2.0).abs() < 1e-6);
        assert!(spectrum[0].abs() < 1e-9);
        assert_eq!(dominant_frequency(&spectrum, n, rate), Some(50.0));
    }

    #[test]
    fn test_short_inputs() {
        assert!(MagnitudeSpectrum.magnitude(&[]).is_empty());
        assert!(MagnitudeSpectrum.magnitude(&[1.0]).is_empty());
        assert_eq!(dominant_frequency(&[], 0, 100.0), None);
    }
}
