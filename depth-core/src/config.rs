use std::path::PathBuf;

/// Process-wide tunables, resolved once from the environment at startup.
///
/// Mirrors the `VIDEO_DEPTH_*` variables from the system's external
/// interface contract. Unset variables fall back to the defaults below.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub data_root: PathBuf,
    pub video_cache_size: usize,
    pub depth_model_id: String,
    pub depth_process_res: u32,
    pub inference_worker_count: usize,
    pub depth_downsample_factor: u32,
    pub depth_compression_level: u32,
    pub cors_origins: Vec<String>,
    pub profile_timing: bool,
    pub log_level: String,
    pub clear_cache_on_startup_override: bool,
    pub max_concurrent_tasks: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_root: PathBuf::from("tmp/sessions"),
            video_cache_size: 8,
            depth_model_id: String::new(),
            depth_process_res: 640,
            inference_worker_count: 3,
            depth_downsample_factor: 1,
            depth_compression_level: 0,
            cors_origins: Vec::new(),
            profile_timing: false,
            log_level: "warn".to_string(),
            clear_cache_on_startup_override: false,
            max_concurrent_tasks: 16,
        }
    }
}

impl Settings {
    /// Builds settings from the process environment, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let default = Settings::default();
        Settings {
            data_root: env_path("VIDEO_DEPTH_DATA_ROOT").unwrap_or(default.data_root),
            video_cache_size: env_parsed("VIDEO_DEPTH_CACHE").unwrap_or(default.video_cache_size),
            depth_model_id: env_string("VIDEO_DEPTH_MODEL_ID").unwrap_or(default.depth_model_id),
            depth_process_res: env_parsed("VIDEO_DEPTH_PROCESS_RES")
                .unwrap_or(default.depth_process_res),
            inference_worker_count: env_parsed("VIDEO_DEPTH_INFER_WORKERS")
                .unwrap_or(default.inference_worker_count),
            depth_downsample_factor: env_parsed("VIDEO_DEPTH_DOWNSAMPLE")
                .unwrap_or(default.depth_downsample_factor)
                .max(1),
            depth_compression_level: env_parsed("VIDEO_DEPTH_COMPRESSION")
                .unwrap_or(default.depth_compression_level),
            cors_origins: env_string("VIDEO_DEPTH_CORS_ORIGINS")
                .map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
                .unwrap_or(default.cors_origins),
            profile_timing: env_bool("VIDEO_DEPTH_PROFILE_TIMING")
                .unwrap_or(default.profile_timing),
            log_level: env_string("VIDEO_DEPTH_LOG_LEVEL").unwrap_or(default.log_level),
            clear_cache_on_startup_override: env_bool("VIDEO_DEPTH_CLEAR_CACHE")
                .unwrap_or(default.clear_cache_on_startup_override),
            max_concurrent_tasks: env_parsed("VIDEO_DEPTH_MAX_CONCURRENT_TASKS")
                .unwrap_or(default.max_concurrent_tasks),
        }
    }

    /// Whether `data_root` is the well-known default path, used to decide
    /// whether the startup cache sweep is safe to run unattended.
    pub fn data_root_is_default(&self) -> bool {
        self.data_root == PathBuf::from("tmp/sessions")
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_string(key).map(PathBuf::from)
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|s| s.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|s| matches!(s.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let settings = Settings::default();
        assert_eq!(settings.video_cache_size, 8);
        assert_eq!(settings.depth_process_res, 640);
        assert_eq!(settings.inference_worker_count, 3);
        assert_eq!(settings.depth_downsample_factor, 1);
        assert_eq!(settings.max_concurrent_tasks, 16);
        assert!(settings.data_root_is_default());
    }

    #[test]
    fn downsample_factor_is_clamped_to_at_least_one() {
        std::env::set_var("VIDEO_DEPTH_DOWNSAMPLE_TEST_ZERO", "0");
        let parsed: Option<u32> = env_parsed("VIDEO_DEPTH_DOWNSAMPLE_TEST_ZERO");
        assert_eq!(parsed, Some(0));
        std::env::remove_var("VIDEO_DEPTH_DOWNSAMPLE_TEST_ZERO");
    }
}
