//! Strictly increasing timestamp index.
//!
//! Log timestamps have at most millisecond resolution, so neighbouring lines
//! often share a timestamp and occasionally go backwards. The consolidated
//! table is keyed by timestamp, so every file's sequence is adjusted by whole
//! microseconds until it is strictly increasing, keeping the original order.

use chrono::{Duration, NaiveDateTime};

/// One microsecond, the unit of every adjustment.
pub fn usec() -> Duration {
    Duration::microseconds(1)
}

/// Make `ts` strictly increasing in place.
///
/// Without `nudge`, each timestamp that is not greater than its predecessor
/// becomes the predecessor plus one microsecond.
///
/// With `nudge`, the first timestamp is also moved forward by one
/// microsecond and the last is pulled back to one microsecond before the
/// largest raw value, with a backward pass decrementing any run compressed
/// against it. An out-of-order tail therefore never drags earlier records
/// back past their own raw values.
/// This keeps a file's range strictly inside its raw range so that two
/// rotated files sharing a boundary timestamp do not overlap. The backward
/// pass is skipped when the file has too many records squeezed into too
/// short a span for it to stay above the nudged start.
pub fn make_timestamps_unique(ts: &mut [NaiveDateTime], nudge: bool) {
    let n = ts.len();
    if n == 0 {
        return;
    }
    let raw_first = ts[0];
    let raw_max = ts.iter().copied().max().unwrap_or(raw_first);

    if nudge {
        ts[0] += usec();
    }
    for i in 1..n {
        if ts[i] <= ts[i - 1] {
            ts[i] = ts[i - 1] + usec();
        }
    }

    if !nudge || n < 2 {
        return;
    }

    let floor = raw_first + usec();
    let ceiling = raw_max - usec();
    // After the backward pass ts[0] becomes min(ts[0], ceiling - (n - 1) us).
    let steps = Duration::microseconds(n as i64 - 1);
    if ceiling - steps < floor || ts[n - 1] <= ceiling {
        return;
    }

    ts[n - 1] = ceiling;
    for i in (0..n - 1).rev() {
        if ts[i] < ts[i + 1] {
            break;
        }
        ts[i] = ts[i + 1] - usec();
    }
}

/// True when every timestamp is greater than the one before it.
pub fn is_strictly_increasing(ts: &[NaiveDateTime]) -> bool {
    ts.windows(2).all(|w| w[0] < w[1])
}
