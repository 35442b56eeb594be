//! Time-bucket helper (spec §4.A). Pure function — every consumer calls
//! this instead of re-deriving bucket arithmetic inline.

use crate::model::Timeframe;

/// `bucket_start(t, tf) = t - (t mod L(tf))`, computed in milliseconds
/// throughout this crate (ticks carry millisecond timestamps; the
/// spec's `L(tf)` is expressed in seconds, scaled here to match). A
/// tick whose timestamp equals a bucket's start belongs to that bucket
/// (tie-break belongs to the start, per spec §4.A).
pub fn bucket_start(timestamp_ms: i64, tf: Timeframe) -> i64 {
    let length_ms = tf.bucket_millis();
    timestamp_ms - timestamp_ms.rem_euclid(length_ms)
}
