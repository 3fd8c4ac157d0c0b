use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirError {
    #[error("Directory not found: {0}")]
    DirNotFound(String),
}

pub type DirResult<T> = Result<T, DirError>;

/// Application name used to namespace directories.
pub static APP_NAME: &str = "arxiv-daily";

/// Well-known locations used by the training and inference pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirType {
    /// Daily record files (`*.json.gz`).
    Data,
    /// Persisted model artifact sets.
    Models,
}

impl Display for DirType {
    /// Pretty-print the default directory path hint for this dir type.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "~/{}/{}/{}", self.rel_path(), APP_NAME, self.leaf())
    }
}

impl DirType {
    /// XDG environment variable key for this directory type.
    fn xdg_key(&self) -> &'static str {
        "XDG_DATA_HOME"
    }

    /// Relative default path under HOME when XDG is not set.
    fn rel_path(&self) -> &'static str {
        ".local/share"
    }

    /// Sub-directory below the application directory.
    fn leaf(&self) -> &'static str {
        match self {
            DirType::Data => "data",
            DirType::Models => "models",
        }
    }

    /// Join the application name and leaf onto a base directory.
    fn under<P: AsRef<Path>>(&self, base: P) -> PathBuf {
        base.as_ref().join(APP_NAME).join(self.leaf())
    }

    /// Resolve the directory path from XDG or fallback environment hints.
    pub fn get_dir(&self) -> DirResult<PathBuf> {
        if let Some(dir) = env::var_os(self.xdg_key()) {
            Ok(self.under(PathBuf::from(dir)))
        } else if let Some(home_dir) = env::home_dir() {
            Ok(self.under(home_dir.join(self.rel_path())))
        } else if let Ok(home) = env::var("HOME") {
            Ok(self.under(PathBuf::from(home).join(self.rel_path())))
        } else if let Ok(userprofile) = env::var("USERPROFILE") {
            Ok(self.under(PathBuf::from(userprofile).join(self.rel_path())))
        } else {
            Err(DirError::DirNotFound(self.to_string()))
        }
    }

    /// Use `explicit` when given, otherwise the default location for this type.
    pub fn resolve(&self, explicit: Option<&Path>) -> DirResult<PathBuf> {
        match explicit {
            Some(path) => Ok(path.to_path_buf()),
            None => self.get_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn models_and_data_share_the_data_home() {
        let base = Path::new("/tmp/xdg");
        assert_eq!(
            DirType::Data.under(base),
            PathBuf::from("/tmp/xdg/arxiv-daily/data")
        );
        assert_eq!(
            DirType::Models.under(base),
            PathBuf::from("/tmp/xdg/arxiv-daily/models")
        );
    }

    #[test]
    fn explicit_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = DirType::Models.resolve(Some(dir.path())).unwrap();
        assert_eq!(resolved, dir.path());
    }

    #[test]
    fn display_mentions_leaf() {
        assert_eq!(DirType::Models.to_string(), "~/.local/share/arxiv-daily/models");
        assert_eq!(DirType::Data.to_string(), "~/.local/share/arxiv-daily/data");
    }
}
