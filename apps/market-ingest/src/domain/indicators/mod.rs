//! Technical indicators over a close-price series.
//!
//! Output is aligned with the input: element `i` holds the indicators as of
//! bar `i`, with a field left `None` until enough history exists.

use rust_decimal::prelude::ToPrimitive;

use crate::domain::market::{Bar, Indicators};

const SMA_SHORT: usize = 20;
const SMA_LONG: usize = 50;
const EMA_FAST: usize = 12;
const EMA_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const RSI_PERIOD: usize = 14;
const BOLLINGER_PERIOD: usize = 20;
const BOLLINGER_WIDTH: f64 = 2.0;

/// Compute indicators for every position of `closes`.
#[must_use]
pub fn compute(closes: &[f64]) -> Vec<Indicators> {
    let sma_short = sma(closes, SMA_SHORT);
    let sma_long = sma(closes, SMA_LONG);
    let ema_fast = ema(closes, EMA_FAST);
    let ema_slow = ema(closes, EMA_SLOW);
    let rsi = rsi(closes, RSI_PERIOD);

    let macd: Vec<Option<f64>> = ema_fast
        .iter()
        .zip(&ema_slow)
        .map(|(fast, slow)| Some((*fast)? - (*slow)?))
        .collect();
    let macd_signal = signal_line(&macd, MACD_SIGNAL);

    (0..closes.len())
        .map(|i| {
            let bands = bollinger(closes, i);
            Indicators {
                sma_20: sma_short[i],
                sma_50: sma_long[i],
                ema_12: ema_fast[i],
                ema_26: ema_slow[i],
                rsi_14: rsi[i],
                macd: macd[i],
                macd_signal: macd_signal[i],
                macd_histogram: macd[i].zip(macd_signal[i]).map(|(m, s)| m - s),
                bb_upper: bands.map(|b| b.0),
                bb_middle: bands.map(|b| b.1),
                bb_lower: bands.map(|b| b.2),
            }
        })
        .collect()
}

/// Attach indicators to bars sorted by timestamp.
pub fn annotate(bars: &mut [Bar]) {
    let closes: Vec<f64> = bars
        .iter()
        .map(|b| b.close.to_f64().unwrap_or(f64::NAN))
        .collect();
    for (bar, indicators) in bars.iter_mut().zip(compute(&closes)) {
        bar.indicators = Some(indicators);
    }
}

#[allow(clippy::cast_precision_loss)]
fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            (i + 1 >= period).then(|| values[i + 1 - period..=i].iter().sum::<f64>() / period as f64)
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut current: Option<f64> = None;
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let next = current.map_or(v, |prev| alpha.mul_add(v - prev, prev));
            current = Some(next);
            (i + 1 >= period).then_some(next)
        })
        .collect()
}

/// EMA over a partially-defined series, starting at its first defined value.
#[allow(clippy::cast_precision_loss)]
fn signal_line(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut current: Option<f64> = None;
    let mut seen = 0usize;
    values
        .iter()
        .map(|value| {
            let v = (*value)?;
            seen += 1;
            let next = current.map_or(v, |prev| alpha.mul_add(v - prev, prev));
            current = Some(next);
            (seen >= period).then_some(next)
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if i < period {
                return None;
            }
            let (gains, losses) = values[i - period..=i].windows(2).fold(
                (0.0, 0.0),
                |(g, l), w| {
                    let change = w[1] - w[0];
                    if change >= 0.0 { (g + change, l) } else { (g, l - change) }
                },
            );
            let avg_gain = gains / period as f64;
            let avg_loss = losses / period as f64;
            if avg_loss == 0.0 {
                return Some(100.0);
            }
            Some(100.0 - 100.0 / (1.0 + avg_gain / avg_loss))
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn bollinger(values: &[f64], i: usize) -> Option<(f64, f64, f64)> {
    if i + 1 < BOLLINGER_PERIOD {
        return None;
    }
    let window = &values[i + 1 - BOLLINGER_PERIOD..=i];
    let n = BOLLINGER_PERIOD as f64;
    let mean = window.iter().sum::<f64>() / n;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let width = BOLLINGER_WIDTH * variance.sqrt();
    Some((mean + width, mean, mean - width))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f64> {
        (1..=n).map(|v| v as f64).collect()
    }

    #[test]
    fn fields_absent_until_warm() {
        let out = compute(&ramp(19));
        assert!(out.iter().all(|i| i.sma_20.is_none() && i.bb_middle.is_none()));
        assert!(out[11].ema_12.is_some());
        assert!(out[10].ema_12.is_none());
    }

    #[test]
    fn sma_of_ramp() {
        let out = compute(&ramp(50));
        // mean of 31..=50
        assert!((out[49].sma_20.unwrap() - 40.5).abs() < 1e-9);
        assert!((out[49].sma_50.unwrap() - 25.5).abs() < 1e-9);
    }

    #[test]
    fn rsi_of_monotonic_rise_is_100() {
        let out = compute(&ramp(20));
        assert_eq!(out[14].rsi_14, Some(100.0));
        assert_eq!(out[13].rsi_14, None);
    }

    #[test]
    fn rsi_balanced_moves_is_50() {
        let closes: Vec<f64> = (0..15).map(|i| if i % 2 == 0 { 10.0 } else { 11.0 }).collect();
        let out = compute(&closes);
        assert!((out[14].rsi_14.unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn flat_series_has_collapsed_bands_and_zero_macd() {
        let out = compute(&[5.0; 40]);
        let last = out[39];
        assert_eq!(last.bb_upper, last.bb_lower);
        assert!(last.macd.unwrap().abs() < 1e-12);
        assert!(last.macd_signal.unwrap().abs() < 1e-12);
        assert!(last.macd_histogram.unwrap().abs() < 1e-12);
    }

    #[test]
    fn signal_needs_nine_macd_values() {
        let out = compute(&ramp(40));
        assert!(out[32].macd_signal.is_none());
        assert!(out[33].macd_signal.is_some());
    }
}
