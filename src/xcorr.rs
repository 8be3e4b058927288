//! Waveform cross-correlation between event pairs.
//!
//! For every unordered event pair sharing a station+phase pick, the engine
//! windows both waveforms around their picks, bandpasses them in the
//! frequency domain, and measures the normalized cross-correlation maximum
//! over lags within the configured range. Channels are combined by weighted
//! average (of both coefficient and lag), and pairs below the coefficient
//! threshold are dropped as routine filtering.
//!
//! Sign convention: with windows `a` and `b`, the correlation is
//! `c[m] = sum_l a[l+m] * b[l]`, so the measured lag is the correction to
//! add to the pick-based differential travel time `tt_a - tt_b`. A phase
//! arriving after event B's pick produces a negative lag.
//!
//! Missing or unusable waveform data skips the channel or pair; it never
//! fails the run.

use std::collections::BTreeSet;

use chrono::Duration;
use num_complex::Complex;
use rayon::prelude::*;
use realfft::RealFftPlanner;
use tracing::{debug, warn};

use crate::catalog::{Event, Phase, WaveformProvider};
use crate::config::CrossCorrelationConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct CrossCorrelationPair {
    pub event_a: String,
    pub event_b: String,
    pub station_id: String,
    pub phase: Phase,
    /// Seconds; see the module-level sign convention.
    pub lag_s: f64,
    /// Weighted combined coefficient, in [-1, 1].
    pub coefficient: f64,
}

struct Candidate {
    a: usize,
    b: usize,
    station_id: String,
    phase: Phase,
}

struct ChannelMeasurement {
    lag_s: f64,
    coefficient: f64,
}

fn duration_s(seconds: f64) -> Duration {
    Duration::microseconds((seconds * 1e6).round() as i64)
}

/// Correlates every qualifying event pair. Pair computations fan out over
/// rayon workers; each worker returns its own results and the final vector
/// is assembled by a single collect, so nothing appends concurrently.
pub fn correlate_all(
    events: &[Event],
    provider: &(dyn WaveformProvider + Sync),
    config: &CrossCorrelationConfig,
) -> Vec<CrossCorrelationPair> {
    let mut keys: BTreeSet<(usize, usize, String, Phase)> = BTreeSet::new();
    for a in 0..events.len() {
        for b in (a + 1)..events.len() {
            for pick in &events[a].picks {
                if events[b].pick_for(&pick.station_id, pick.phase).is_some() {
                    keys.insert((a, b, pick.station_id.clone(), pick.phase));
                }
            }
        }
    }
    let candidates: Vec<Candidate> = keys
        .into_iter()
        .map(|(a, b, station_id, phase)| Candidate {
            a,
            b,
            station_id,
            phase,
        })
        .collect();
    debug!(
        candidates = candidates.len(),
        "cross-correlating event pairs"
    );

    let mut pairs: Vec<CrossCorrelationPair> = candidates
        .par_iter()
        .map_init(RealFftPlanner::<f64>::new, |planner, candidate| {
            correlate_pair(planner, events, provider, config, candidate)
        })
        .flatten()
        .collect();
    pairs.sort_by(|x, y| {
        (&x.event_a, &x.event_b, &x.station_id, x.phase).cmp(&(
            &y.event_a,
            &y.event_b,
            &y.station_id,
            y.phase,
        ))
    });
    pairs
}

fn correlate_pair(
    planner: &mut RealFftPlanner<f64>,
    events: &[Event],
    provider: &(dyn WaveformProvider + Sync),
    config: &CrossCorrelationConfig,
    candidate: &Candidate,
) -> Option<CrossCorrelationPair> {
    let event_a = &events[candidate.a];
    let event_b = &events[candidate.b];
    let pick_a = event_a.pick_for(&candidate.station_id, candidate.phase)?;
    let pick_b = event_b.pick_for(&candidate.station_id, candidate.phase)?;

    let weights = config.channel_weights(candidate.phase);
    let mut weighted_lag = 0.0;
    let mut weighted_coeff = 0.0;
    let mut weight_sum = 0.0;
    for (&channel, &weight) in weights {
        if weight <= 0.0 {
            continue;
        }
        let Some(m) = correlate_channel(
            planner,
            provider,
            config,
            &candidate.station_id,
            channel,
            pick_a.time,
            pick_b.time,
        ) else {
            continue;
        };
        weighted_lag += weight * m.lag_s;
        weighted_coeff += weight * m.coefficient;
        weight_sum += weight;
    }
    if weight_sum == 0.0 {
        debug!(
            station = %candidate.station_id,
            phase = candidate.phase.as_str(),
            event_a = %event_a.id,
            event_b = %event_b.id,
            "no usable channel data; skipping pair"
        );
        return None;
    }

    let coefficient = weighted_coeff / weight_sum;
    let lag_s = weighted_lag / weight_sum;
    if coefficient < config.min_coefficient {
        return None;
    }
    Some(CrossCorrelationPair {
        event_a: event_a.id.clone(),
        event_b: event_b.id.clone(),
        station_id: candidate.station_id.clone(),
        phase: candidate.phase,
        lag_s,
        coefficient,
    })
}

fn correlate_channel(
    planner: &mut RealFftPlanner<f64>,
    provider: &(dyn WaveformProvider + Sync),
    config: &CrossCorrelationConfig,
    station_id: &str,
    channel: char,
    pick_a: chrono::DateTime<chrono::Utc>,
    pick_b: chrono::DateTime<chrono::Utc>,
) -> Option<ChannelMeasurement> {
    let before = duration_s(config.time_before_s);
    let after = duration_s(config.time_after_s);

    let mut windows = Vec::with_capacity(2);
    for pick in [pick_a, pick_b] {
        let trace = match provider.waveform(station_id, channel, pick - before, pick + after) {
            Ok(Some(trace)) => trace,
            Ok(None) => return None,
            Err(e) => {
                warn!(station = station_id, channel = %channel, "waveform read failed, skipping channel: {e}");
                return None;
            }
        };
        windows.push(trace);
    }
    let b = windows.pop()?;
    let a = windows.pop()?;

    if (a.sampling_rate_hz - b.sampling_rate_hz).abs() > 1e-9 {
        warn!(
            station = station_id,
            channel = %channel,
            "sampling rate mismatch ({} vs {} Hz), skipping channel",
            a.sampling_rate_hz,
            b.sampling_rate_hz
        );
        return None;
    }
    let fs = a.sampling_rate_hz;
    let mut sa = a.samples;
    let mut sb = b.samples;
    if sa.len() < 8 || sb.len() < 8 {
        return None;
    }
    demean(&mut sa);
    demean(&mut sb);
    bandpass(
        planner,
        &mut sa,
        fs,
        config.filter_min_freq_hz,
        config.filter_max_freq_hz,
    )?;
    bandpass(
        planner,
        &mut sb,
        fs,
        config.filter_min_freq_hz,
        config.filter_max_freq_hz,
    )?;

    let max_lag_samples = (config.max_lag_s * fs).round() as usize;
    let (lag_samples, coefficient) = normalized_xcorr(planner, &sa, &sb, max_lag_samples)?;
    Some(ChannelMeasurement {
        lag_s: lag_samples / fs,
        coefficient,
    })
}

/// The inverse real transform needs purely real DC and Nyquist bins; after
/// editing the spectrum their imaginary parts may carry rounding residue.
fn force_real_edges(spectrum: &mut [Complex<f64>], n: usize) {
    if let Some(first) = spectrum.first_mut() {
        first.im = 0.0;
    }
    if n % 2 == 0 {
        if let Some(last) = spectrum.last_mut() {
            last.im = 0.0;
        }
    }
}

fn demean(samples: &mut [f64]) {
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    for v in samples.iter_mut() {
        *v -= mean;
    }
}

/// Frequency-domain bandpass: forward real FFT, zero every bin outside
/// `[min_freq, max_freq]` (the DC bin always falls below `min_freq`),
/// inverse transform with 1/n scaling.
fn bandpass(
    planner: &mut RealFftPlanner<f64>,
    samples: &mut [f64],
    fs: f64,
    min_freq: f64,
    max_freq: f64,
) -> Option<()> {
    let n = samples.len();
    let r2c = planner.plan_fft_forward(n);
    let c2r = planner.plan_fft_inverse(n);

    let mut input = samples.to_vec();
    let mut spectrum = r2c.make_output_vec();
    r2c.process(&mut input, &mut spectrum).ok()?;

    let df = fs / n as f64;
    for (i, bin) in spectrum.iter_mut().enumerate() {
        let freq = i as f64 * df;
        if freq < min_freq || freq > max_freq {
            *bin = Complex::new(0.0, 0.0);
        }
    }
    force_real_edges(&mut spectrum, n);

    let mut output = vec![0.0; n];
    c2r.process(&mut spectrum, &mut output).ok()?;
    let scale = 1.0 / n as f64;
    for (dst, v) in samples.iter_mut().zip(output) {
        *dst = v * scale;
    }
    Some(())
}

/// Normalized cross-correlation via zero-padded FFT, peak searched over
/// integer lags in `[-max_lag, +max_lag]` and refined by a parabola through
/// the peak and its neighbours.
fn normalized_xcorr(
    planner: &mut RealFftPlanner<f64>,
    a: &[f64],
    b: &[f64],
    max_lag: usize,
) -> Option<(f64, f64)> {
    let energy_a: f64 = a.iter().map(|v| v * v).sum();
    let energy_b: f64 = b.iter().map(|v| v * v).sum();
    if energy_a <= 0.0 || energy_b <= 0.0 {
        return None;
    }
    let norm = (energy_a * energy_b).sqrt();

    // Pad past a.len()+b.len()-1 so the cyclic correlation is linear for
    // every lag we inspect.
    let n = (a.len() + b.len() - 1).next_power_of_two();
    let r2c = planner.plan_fft_forward(n);
    let c2r = planner.plan_fft_inverse(n);

    let mut pa = vec![0.0; n];
    pa[..a.len()].copy_from_slice(a);
    let mut pb = vec![0.0; n];
    pb[..b.len()].copy_from_slice(b);

    let mut sa = r2c.make_output_vec();
    r2c.process(&mut pa, &mut sa).ok()?;
    let mut sb = r2c.make_output_vec();
    r2c.process(&mut pb, &mut sb).ok()?;
    for (x, y) in sa.iter_mut().zip(sb.iter()) {
        *x *= y.conj();
    }
    force_real_edges(&mut sa, n);
    let mut cc = vec![0.0; n];
    c2r.process(&mut sa, &mut cc).ok()?;
    let scale = 1.0 / (n as f64 * norm);

    let max_lag = max_lag
        .min(a.len().saturating_sub(1))
        .min(b.len().saturating_sub(1));
    let value = |lag: isize| -> f64 {
        let idx = if lag >= 0 {
            lag as usize
        } else {
            n - lag.unsigned_abs()
        };
        cc[idx] * scale
    };

    let mut best_lag = 0isize;
    let mut best = f64::NEG_INFINITY;
    for lag in -(max_lag as isize)..=(max_lag as isize) {
        let v = value(lag);
        if v > best {
            best = v;
            best_lag = lag;
        }
    }

    let mut lag_f = best_lag as f64;
    let mut coeff = best;
    if max_lag > 0 && best_lag.abs() < max_lag as isize {
        let y1 = value(best_lag - 1);
        let y2 = best;
        let y3 = value(best_lag + 1);
        let denom = y1 - 2.0 * y2 + y3;
        if denom.abs() > f64::EPSILON {
            let delta = 0.5 * (y1 - y3) / denom;
            if delta.abs() < 1.0 {
                lag_f = best_lag as f64 + delta;
                coeff = y2 - 0.25 * (y1 - y3) * delta;
            }
        }
    }
    Some((lag_f, coeff.clamp(-1.0, 1.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Origin, Pick, Trace, TraceStore};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::f64::consts::PI;

    const FS: f64 = 100.0;

    fn test_config() -> CrossCorrelationConfig {
        CrossCorrelationConfig {
            time_before_s: 0.5,
            time_after_s: 1.5,
            max_lag_s: 0.2,
            filter_min_freq_hz: 1.0,
            filter_max_freq_hz: 20.0,
            p_channel_weights: BTreeMap::from([('Z', 1.0)]),
            s_channel_weights: BTreeMap::from([('Z', 1.0), ('N', 1.0), ('E', 1.0)]),
            min_coefficient: 0.6,
        }
    }

    /// A few-cycle wavelet inside the passband, centered at `at_s` seconds
    /// into the trace.
    fn place_wavelet(samples: &mut [f64], at_s: f64) {
        let half_width_s = 0.4;
        for (i, v) in samples.iter_mut().enumerate() {
            let t = i as f64 / FS - at_s;
            if t.abs() < half_width_s {
                let taper = (PI * t / (2.0 * half_width_s)).cos().powi(2);
                *v += taper * (2.0 * PI * 6.0 * t).sin();
            }
        }
    }

    fn event(id: &str, origin_s: f64, pick_s: f64, base: chrono::DateTime<Utc>) -> Event {
        Event {
            id: id.to_string(),
            origins: vec![Origin {
                time: base + Duration::microseconds((origin_s * 1e6) as i64),
                latitude_deg: 47.0,
                longitude_deg: 8.0,
                depth_km: 5.0,
                method: "catalog".into(),
            }],
            preferred_origin: 0,
            magnitude: Some(1.0),
            picks: vec![Pick {
                station_id: "XX.STA01".into(),
                phase: Phase::P,
                time: base + Duration::microseconds((pick_s * 1e6) as i64),
                weight: Some(1.0),
            }],
        }
    }

    fn store_with_wavelets(
        base: chrono::DateTime<Utc>,
        wavelet_positions_s: &[f64],
    ) -> TraceStore {
        let mut samples = vec![0.0; (20.0 * FS) as usize];
        for &at in wavelet_positions_s {
            place_wavelet(&mut samples, at);
        }
        let mut store = TraceStore::new();
        store.insert(Trace {
            station_id: "XX.STA01".into(),
            channel: 'Z',
            start_time: base,
            sampling_rate_hz: FS,
            samples,
        });
        store
    }

    #[test]
    fn recovers_known_lag_with_high_coefficient() {
        let base = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        // Event A's wavelet sits exactly on its pick; event B's arrives
        // 0.05 s after its pick, which must come back as lag -0.05.
        let store = store_with_wavelets(base, &[3.0, 9.05]);
        let events = vec![event("ev1", 2.0, 3.0, base), event("ev2", 8.0, 9.0, base)];
        let pairs = correlate_all(&events, &store, &test_config());
        assert_eq!(pairs.len(), 1);
        let pair = &pairs[0];
        assert!(
            (pair.lag_s + 0.05).abs() < 0.005,
            "expected lag near -0.05, got {}",
            pair.lag_s
        );
        assert!(
            pair.coefficient > 0.95,
            "expected near-perfect coefficient, got {}",
            pair.coefficient
        );
    }

    #[test]
    fn aligned_wavelets_measure_zero_lag() {
        let base = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        let store = store_with_wavelets(base, &[3.0, 9.0]);
        let events = vec![event("ev1", 2.0, 3.0, base), event("ev2", 8.0, 9.0, base)];
        let pairs = correlate_all(&events, &store, &test_config());
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].lag_s.abs() < 0.002);
    }

    #[test]
    fn dissimilar_waveforms_fall_below_threshold() {
        let base = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        // Different dominant frequencies in the two windows.
        let mut samples = vec![0.0; (20.0 * FS) as usize];
        for (i, v) in samples.iter_mut().enumerate() {
            let t = i as f64 / FS;
            if (2.5..3.5).contains(&t) {
                *v = (2.0 * PI * 4.0 * t).sin();
            }
            if (8.5..9.5).contains(&t) {
                *v = (2.0 * PI * 17.0 * t).sin();
            }
        }
        let mut store = TraceStore::new();
        store.insert(Trace {
            station_id: "XX.STA01".into(),
            channel: 'Z',
            start_time: base,
            sampling_rate_hz: FS,
            samples,
        });
        let events = vec![event("ev1", 2.0, 3.0, base), event("ev2", 8.0, 9.0, base)];
        let mut config = test_config();
        config.min_coefficient = 0.9;
        let pairs = correlate_all(&events, &store, &config);
        assert!(pairs.is_empty());
    }

    #[test]
    fn missing_waveform_skips_pair_without_error() {
        let base = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        let store = TraceStore::new();
        let events = vec![event("ev1", 2.0, 3.0, base), event("ev2", 8.0, 9.0, base)];
        let pairs = correlate_all(&events, &store, &test_config());
        assert!(pairs.is_empty());
    }

    #[test]
    fn events_without_shared_station_produce_no_candidates() {
        let base = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        let store = store_with_wavelets(base, &[3.0, 9.0]);
        let mut ev2 = event("ev2", 8.0, 9.0, base);
        ev2.picks[0].station_id = "XX.OTHER".into();
        let events = vec![event("ev1", 2.0, 3.0, base), ev2];
        let pairs = correlate_all(&events, &store, &test_config());
        assert!(pairs.is_empty());
    }

    #[test]
    fn parabolic_refinement_resolves_subsample_lag() {
        let mut planner = RealFftPlanner::<f64>::new();
        // Smooth pulse sampled at two offsets 0.4 samples apart.
        let pulse = |t: f64| (-t * t / 8.0).exp();
        let a: Vec<f64> = (0..128).map(|i| pulse(i as f64 - 64.0)).collect();
        let b: Vec<f64> = (0..128).map(|i| pulse(i as f64 - 64.4)).collect();
        let (lag, coeff) = normalized_xcorr(&mut planner, &a, &b, 10).unwrap();
        assert!((lag + 0.4).abs() < 0.05, "lag was {lag}");
        assert!(coeff > 0.99);
    }
}
