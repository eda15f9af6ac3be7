use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "intake-forms";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the application data directory.
/// `~/.intake-forms/` on all platforms; falls back to the working directory
/// when no home directory can be determined (containers, CI).
pub fn app_data_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(format!(".{APP_NAME}")),
        None => PathBuf::from(format!(".{APP_NAME}")),
    }
}

/// Default location of the SQLite chunk/structure cache.
pub fn default_cache_path() -> PathBuf {
    app_data_dir().join("chunk_cache.sqlite")
}

/// Default directory for run reports written by the CLI.
pub fn default_output_dir() -> PathBuf {
    app_data_dir().join("runs")
}

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "intake_forms=debug"
    } else {
        "intake_forms=info"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_under_app_data() {
        let cache = default_cache_path();
        assert!(cache.starts_with(app_data_dir()));
        assert!(cache.ends_with("chunk_cache.sqlite"));
    }

    #[test]
    fn output_dir_under_app_data() {
        let runs = default_output_dir();
        assert!(runs.starts_with(app_data_dir()));
        assert!(runs.ends_with("runs"));
    }

    #[test]
    fn app_data_dir_is_hidden_app_folder() {
        let dir = app_data_dir();
        assert!(dir.ends_with(".intake-forms"));
    }

    #[test]
    fn log_filter_targets_this_crate() {
        assert!(default_log_filter().starts_with("intake_forms="));
    }
}
