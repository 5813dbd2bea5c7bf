//! Default on-disk locations.
//!
//! The buffer lives in a per-user data directory so that records left behind
//! by one process are found by the next one without any configuration.

use std::path::PathBuf;

/// Name of the buffer file inside the data directory.
pub const BUFFER_FILE_NAME: &str = "buffer.json";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "TRACE_SPOOL_DIR";

/// Returns the data directory for the span buffer.
///
/// Resolution order:
///
/// 1. `$TRACE_SPOOL_DIR`
/// 2. `$XDG_DATA_HOME/trace-spool`
/// 3. `$HOME/.local/share/trace-spool`
/// 4. `<system temp dir>/trace-spool`
///
/// Empty variables are ignored.
///
/// # Examples
///
/// ```
/// use trace_spool::infrastructure::get_data_dir;
///
/// let buffer_file = get_data_dir().join("buffer.json");
/// println!("spans are buffered in {}", buffer_file.display());
/// ```
#[must_use]
pub fn get_data_dir() -> PathBuf {
    resolve_data_dir(|key| std::env::var(key).ok())
}

/// Default location of the buffer file: `<data dir>/buffer.json`.
#[must_use]
pub fn default_buffer_path() -> PathBuf {
    get_data_dir().join(BUFFER_FILE_NAME)
}

fn resolve_data_dir(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(dir) = var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(xdg) = var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("trace-spool");
    }
    if let Some(home) = var("HOME") {
        return PathBuf::from(home).join(".local/share/trace-spool");
    }
    std::env::temp_dir().join("trace-spool")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(vars: &[(&str, &str)]) -> PathBuf {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        resolve_data_dir(|key| vars.get(key).cloned())
    }

    #[test]
    fn override_wins() {
        let dir = resolve(&[
            (DATA_DIR_ENV, "/srv/spool"),
            ("XDG_DATA_HOME", "/xdg"),
            ("HOME", "/home/u"),
        ]);
        assert_eq!(dir, PathBuf::from("/srv/spool"));
    }

    #[test]
    fn falls_back_through_xdg_and_home() {
        assert_eq!(
            resolve(&[("XDG_DATA_HOME", "/xdg"), ("HOME", "/home/u")]),
            PathBuf::from("/xdg/trace-spool")
        );
        assert_eq!(
            resolve(&[(DATA_DIR_ENV, " "), ("HOME", "/home/u")]),
            PathBuf::from("/home/u/.local/share/trace-spool")
        );
        assert_eq!(resolve(&[]), std::env::temp_dir().join("trace-spool"));
    }
}
