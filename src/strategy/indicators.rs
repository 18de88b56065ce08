// Thin wrappers over rust_ti with front NaN padding so indicator values line
// up with the source index: the value at index i uses the window ending at i.

use rust_ti::standard_indicators::bulk as sti;

/// Pad a bulk indicator result to `len` values with leading NaNs.
pub fn pad_front(values: &[f64], len: usize) -> Vec<f64> {
    let offset = len.saturating_sub(values.len());
    let mut padded = vec![f64::NAN; offset];
    padded.extend_from_slice(values);
    padded.truncate(len);
    padded
}

/// Simple moving average aligned to the source index.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    if period == 0 || n < period {
        return vec![f64::NAN; n];
    }
    pad_front(&sti::simple_moving_average(values, period), n)
}

/// Exponential moving average aligned to the source index.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    if period == 0 || n < period {
        return vec![f64::NAN; n];
    }
    pad_front(&sti::exponential_moving_average(values, period), n)
}

/// Standard 14-period RSI aligned to the source index.
pub fn rsi(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 14 {
        return vec![f64::NAN; n];
    }
    pad_front(&sti::rsi(values), n)
}

/// SMA-smoothed ATR over rolling windows, aligned to the source index.
pub fn atr(close: &[f64], high: &[f64], low: &[f64], period: usize) -> Vec<f64> {
    let n = close.len();
    if period == 0 || n < period {
        return vec![f64::NAN; n];
    }
    let values: Vec<f64> = (0..=n - period)
        .map(|i| {
            let end = i + period;
            rust_ti::other_indicators::single::average_true_range(
                &close[i..end],
                &high[i..end],
                &low[i..end],
                rust_ti::ConstantModelType::SimpleMovingAverage,
            )
        })
        .collect();
    pad_front(&values, n)
}
