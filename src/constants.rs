// Shared constants for the telemetry pipeline (protocol contract and tuning)

/// Metres to feet.
pub const MTOF: f64 = 3.28084;

/// Packet-type discriminators. Fixed by the telemetry source, never renumber.
pub const ID_SINGLE_OPERATOR: u8 = 2;
pub const ID_AV_PRIMARY: u8 = 3;
pub const ID_AV_SECONDARY: u8 = 4;
pub const ID_PAYLOAD: u8 = 5;
pub const ID_GSE_PRIMARY: u8 = 6;
pub const ID_GSE_SECONDARY: u8 = 7;

/// High-precision accelerometer saturates near ±16 g; at or beyond this
/// magnitude the wide-range reading is used instead.
pub const ACCEL_SATURATION_G: f64 = 17.0;

/// Number of altitude samples in the outlier-rejection window.
pub const ALTITUDE_WINDOW: usize = 5;

/// Outlier threshold as a fraction of the window mean.
pub const ALTITUDE_OUTLIER_FRACTION: f64 = 0.20;

/// Outlier threshold floor (metres).
pub const ALTITUDE_OUTLIER_FLOOR: f64 = 200.0;

/// Drift (s) beyond which the local render clock is nudged toward sender time.
pub const DRIFT_THRESHOLD_S: f64 = 0.25;

/// Fastest drift correction, in seconds of render time per second of wall
/// time. Displayed time runs between 0.9x and 1.1x while catching up.
pub const DRIFT_MAX_RATE: f64 = 0.1;

/// Drift is only corrected while the stream is fresh; a stalled stream lets
/// local time run on.
pub const DRIFT_STALE_AFTER_S: f64 = 1.0;

/// Lines kept in the user-visible log panel.
pub const EVENT_LOG_DEPTH: usize = 16;

/// Upper bound on points kept per plotted channel.
pub const SERIES_CAPACITY: usize = 4096;

/// Default smoothing time constant for the attitude display (s).
pub const ORIENTATION_TAU_S: f64 = 0.13;

/// Timeout for a single connect attempt (s).
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Longest accepted frame (bytes). Longer lines are skipped up to their newline.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
