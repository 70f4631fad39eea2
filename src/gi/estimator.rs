//! Multiscale mean estimator for per-surfel irradiance.
//!
//! A temporal, variance-guided exponential smoother: a short-window mean
//! tracks the signal quickly, a variance estimate bounds fireflies, and the
//! long-window `mean` catches up to the short mean at a rate driven by how
//! inconsistent the two have been. Mirrored by `estimator_update` in
//! `gi_common.wgsl`.
//!
//! The two scalars pull in opposite directions. `blend_rate` tracks the
//! signal-to-noise ratio `short_mean / (2 * deviation)`: a noisy surfel gets
//! a low rate so its long mean averages over more frames. `inconsistency`
//! tracks how far the long mean sits from the short mean in units of that
//! deviation, and a persistent gap ramps the catch-up towards the full
//! `blend_rate`. A lighting change therefore reacts through inconsistency
//! even on a noisy surfel, while stationary noise only lowers the rate.

use crate::core::types::Vec3;
use super::data::SurfelIrradiance;

const SHORT_WINDOW_BLEND: f32 = 0.08;
const VARIANCE_BLEND: f32 = 0.04;
const INCONSISTENCY_BLEND: f32 = 0.08;
const BLEND_RATE_BLEND: f32 = 0.1;
const FIREFLY_SIGMA: f32 = 8.0;
const FIREFLY_BIAS: f32 = 0.1;
const MIN_VARIANCE: f32 = 1e-5;

const LUMA: Vec3 = Vec3::new(0.2126, 0.7152, 0.0722);

#[inline]
fn luma(v: Vec3) -> f32 {
    v.dot(LUMA)
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[inline]
fn sqrt(v: Vec3) -> Vec3 {
    Vec3::new(v.x.sqrt(), v.y.sqrt(), v.z.sqrt())
}

#[inline]
fn smoothstep(e0: f32, e1: f32, x: f32) -> f32 {
    let t = ((x - e0) / (e1 - e0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Fold one radiance sample into the estimator, returning the new state
pub fn update(state: SurfelIrradiance, sample: Vec3) -> SurfelIrradiance {
    let mean = Vec3::from_array(state.mean);
    let short_mean = Vec3::from_array(state.short_mean);
    let variance = Vec3::from_array(state.variance);

    let dev = sqrt(variance.max(Vec3::splat(MIN_VARIANCE)));
    let sample = sample.min(Vec3::splat(FIREFLY_BIAS) + short_mean + dev * FIREFLY_SIGMA);

    let delta = sample - short_mean;
    let short_mean = short_mean.lerp(sample, SHORT_WINDOW_BLEND);
    let delta2 = sample - short_mean;
    let variance = variance.lerp(delta * delta2, VARIANCE_BLEND);

    let relative_diff = luma((mean - short_mean).abs() / dev.max(Vec3::splat(MIN_VARIANCE)));
    let inconsistency = lerp(state.inconsistency, relative_diff, INCONSISTENCY_BLEND);

    let target_rate = luma(short_mean * 0.5 / dev).clamp(1.0 / 32.0, 1.0);
    let catch_up = smoothstep(0.0, 1.0, relative_diff * (inconsistency - 0.2).max(0.02))
        .clamp(1.0 / 256.0, 1.0)
        * state.blend_rate;
    let blend_rate = lerp(state.blend_rate, target_rate, BLEND_RATE_BLEND);

    let mean = mean.lerp(sample, catch_up.clamp(0.0, 1.0));

    SurfelIrradiance {
        mean: mean.to_array(),
        short_mean: short_mean.to_array(),
        blend_rate,
        variance: variance.to_array(),
        inconsistency,
    }
}

/// Average several samples and fold them in as a single update
pub fn update_with_samples(state: SurfelIrradiance, samples: &[Vec3]) -> SurfelIrradiance {
    if samples.is_empty() {
        return state;
    }
    let sum: Vec3 = samples.iter().copied().sum();
    update(state, sum / samples.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(mut state: SurfelIrradiance, sample: Vec3, frames: usize) -> SurfelIrradiance {
        for _ in 0..frames {
            state = update(state, sample);
        }
        state
    }

    #[test]
    fn test_zero_signal_stays_zero() {
        let state = run(SurfelIrradiance::default(), Vec3::ZERO, 100);
        assert_eq!(state.mean, [0.0; 3]);
        assert!(state.variance.iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn test_constant_signal_converges() {
        for value in [Vec3::splat(0.5), Vec3::new(1.0, 0.25, 0.5), Vec3::splat(4.0)] {
            let state = run(SurfelIrradiance::default(), value, 1000);
            let mean = Vec3::from_array(state.mean);
            assert!((mean - value).abs().max_element() < 1e-2, "{:?} -> {:?}", value, mean);
            assert!(state.inconsistency < 0.05, "inconsistency {}", state.inconsistency);

            let state = run(state, value, 1000);
            assert!(state.inconsistency < 0.01, "inconsistency {}", state.inconsistency);
        }
    }

    #[test]
    fn test_inconsistency_trends_down() {
        let mut state = run(SurfelIrradiance::default(), Vec3::splat(0.5), 200);
        let early = state.inconsistency;
        state = run(state, Vec3::splat(0.5), 800);
        assert!(state.inconsistency < early);
    }

    #[test]
    fn test_reacts_to_step_change() {
        let state = run(SurfelIrradiance::default(), Vec3::splat(0.5), 2000);
        let state = run(state, Vec3::splat(2.0), 60);
        assert!(state.mean[0] > 1.75, "mean {}", state.mean[0]);
    }

    #[test]
    fn test_noise_lowers_blend_rate() {
        let clean = run(SurfelIrradiance::default(), Vec3::splat(0.5), 2000);
        let mut noisy = SurfelIrradiance::default();
        for frame in 0..2000 {
            noisy = update(noisy, Vec3::splat((frame % 2) as f32));
        }
        assert!(clean.blend_rate > 0.95, "clean rate {}", clean.blend_rate);
        assert!(noisy.blend_rate < 0.75, "noisy rate {}", noisy.blend_rate);
        assert!((noisy.mean[0] - 0.5).abs() < 0.05, "noisy mean {}", noisy.mean[0]);
    }

    #[test]
    fn test_step_change_raises_inconsistency() {
        let settled = run(SurfelIrradiance::default(), Vec3::splat(0.5), 2000);
        assert!(settled.inconsistency < 0.01);
        let stepped = run(settled, Vec3::splat(2.0), 10);
        assert!(stepped.inconsistency > 0.2, "inconsistency {}", stepped.inconsistency);
    }

    #[test]
    fn test_firefly_is_clamped() {
        let state = run(SurfelIrradiance::default(), Vec3::splat(0.5), 2000);
        let spiked = update(state, Vec3::splat(1000.0));
        assert!(spiked.mean[0] < 0.6, "mean {}", spiked.mean[0]);
        assert!(spiked.short_mean[0] < 0.6);
    }

    #[test]
    fn test_update_with_samples_averages() {
        let state = SurfelIrradiance::default();
        let a = update_with_samples(state, &[Vec3::ZERO, Vec3::splat(0.2)]);
        let b = update(state, Vec3::splat(0.1));
        assert_eq!(a, b);
        assert_eq!(update_with_samples(state, &[]), state);
    }
}
