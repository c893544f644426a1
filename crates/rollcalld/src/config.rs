use std::path::PathBuf;
use std::time::Duration;

use rollcall_store::StoreConfig;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path or bare index (default: /dev/video0).
    pub video_source: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Largest Euclidean distance still counted as a match.
    pub match_threshold: f32,
    /// Age after which the known-face cache is reloaded.
    pub cache_window: Duration,
    /// Process every Nth captured frame.
    pub frame_stride: u32,
    /// Downscale factor applied before detection.
    pub detect_scale: f32,
    /// HTTP bind address.
    pub listen_addr: String,
    /// Writer gate timeout for store writes.
    pub store_write_timeout: Duration,
    /// Bounded retries for a busy store during marking.
    pub store_busy_retries: u32,
    /// MJPEG poll interval.
    pub stream_interval: Duration,
    /// Where absentee CSVs are written; unset disables the export.
    pub export_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env_f32 = |key: &str, default: f32| parse_or(lookup(key), default);
        let env_u64 = |key: &str, default: u64| parse_or(lookup(key), default);
        let env_u32 = |key: &str, default: u32| parse_or(lookup(key), default);

        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let detect_scale = env_f32("ROLLCALL_DETECT_SCALE", 0.25);
        let detect_scale = if detect_scale > 0.0 && detect_scale <= 1.0 {
            detect_scale
        } else {
            tracing::warn!(value = detect_scale, "ROLLCALL_DETECT_SCALE out of (0, 1]; using 0.25");
            0.25
        };

        let match_threshold = env_f32("ROLLCALL_MATCH_THRESHOLD", 0.55);
        let match_threshold = if match_threshold.is_finite() && match_threshold > 0.0 {
            match_threshold
        } else {
            tracing::warn!(value = match_threshold, "ROLLCALL_MATCH_THRESHOLD must be positive; using 0.55");
            0.55
        };

        Self {
            video_source: lookup("ROLLCALL_VIDEO_SOURCE").unwrap_or_else(|| "/dev/video0".to_string()),
            model_dir: lookup("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("models")),
            db_path: lookup("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            match_threshold,
            cache_window: Duration::from_secs(env_u64("ROLLCALL_CACHE_WINDOW_SECS", 300)),
            frame_stride: env_u32("ROLLCALL_FRAME_STRIDE", 2).max(1),
            detect_scale,
            listen_addr: lookup("ROLLCALL_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:5000".to_string()),
            store_write_timeout: Duration::from_millis(env_u64("ROLLCALL_STORE_WRITE_TIMEOUT_MS", 2000)),
            store_busy_retries: env_u32("ROLLCALL_STORE_BUSY_RETRIES", 2),
            stream_interval: Duration::from_millis(env_u64("ROLLCALL_STREAM_INTERVAL_MS", 50).max(1)),
            export_dir: lookup("ROLLCALL_EXPORT_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            write_timeout: self.store_write_timeout,
            ..StoreConfig::default()
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config_from(&[("HOME", "/home/op")]);
        assert_eq!(cfg.video_source, "/dev/video0");
        assert_eq!(cfg.db_path, PathBuf::from("/home/op/.local/share/rollcall/attendance.db"));
        assert_eq!(cfg.model_dir, PathBuf::from("/home/op/.local/share/rollcall/models"));
        assert_eq!(cfg.match_threshold, 0.55);
        assert_eq!(cfg.cache_window, Duration::from_secs(300));
        assert_eq!(cfg.frame_stride, 2);
        assert_eq!(cfg.detect_scale, 0.25);
        assert_eq!(cfg.listen_addr, "0.0.0.0:5000");
        assert_eq!(cfg.store_busy_retries, 2);
        assert!(cfg.export_dir.is_none());
    }

    #[test]
    fn test_overrides() {
        let cfg = config_from(&[
            ("XDG_DATA_HOME", "/data"),
            ("ROLLCALL_VIDEO_SOURCE", "1"),
            ("ROLLCALL_MATCH_THRESHOLD", "0.4"),
            ("ROLLCALL_FRAME_STRIDE", "5"),
            ("ROLLCALL_EXPORT_DIR", "/exports"),
        ]);
        assert_eq!(cfg.video_source, "1");
        assert_eq!(cfg.db_path, PathBuf::from("/data/rollcall/attendance.db"));
        assert_eq!(cfg.match_threshold, 0.4);
        assert_eq!(cfg.frame_stride, 5);
        assert_eq!(cfg.export_dir, Some(PathBuf::from("/exports")));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let cfg = config_from(&[
            ("ROLLCALL_FRAME_STRIDE", "0"),
            ("ROLLCALL_DETECT_SCALE", "3.0"),
            ("ROLLCALL_MATCH_THRESHOLD", "abc"),
        ]);
        assert_eq!(cfg.frame_stride, 1);
        assert_eq!(cfg.detect_scale, 0.25);
        assert_eq!(cfg.match_threshold, 0.55);
    }

    #[test]
    fn test_threshold_rejects_nan_and_non_positive() {
        for bad in ["NaN", "-0.3", "0", "inf"] {
            let cfg = config_from(&[("ROLLCALL_MATCH_THRESHOLD", bad)]);
            assert_eq!(cfg.match_threshold, 0.55, "threshold {bad} should fall back");
        }
    }
}
