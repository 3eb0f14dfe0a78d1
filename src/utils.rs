//! Directory helpers and small string utilities
//!
//! Configuration lives in the platform's per-user config directory:
//!
//! - Linux: `~/.config/wfpctl/`
//! - Windows: `%APPDATA%\wfpctl\wfpctl\config\`
//!
//! # Example
//!
//! ```
//! use wfpctl::utils::get_config_dir;
//!
//! if let Some(dir) = get_config_dir() {
//!     let _config_file = dir.join("config.json");
//! }
//! ```

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "wfpctl", "wfpctl").map(|pd| pd.config_dir().to_path_buf())
}

/// Creates `dir` (and parents) readable only by the current user on Unix.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(dir)?;
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)?;
    }

    Ok(())
}

/// Truncates a string to a maximum length and adds an ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        // Nearest character boundary, so multi-byte characters are not split
        let end = s
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|&idx| idx <= max_len.saturating_sub(3))
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..end])
    }
}
