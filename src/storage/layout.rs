use std::fs;
use std::path::{Path, PathBuf};
use crate::core::error::Result;

pub const MAP_FILE_NAME: &str = "00CONCS.map";
pub const MAP_LOCK_NAME: &str = "00CONCS.map.lock";
pub const CONC_EXT: &str = "conc";
pub const PID_EXT: &str = "pid";

/// Directory structure of the concordance cache
#[derive(Debug, Clone)]
pub struct CacheLayout {
    pub base_dir: PathBuf,      // Root, one subdirectory per corpus
}

impl CacheLayout {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(CacheLayout { base_dir })
    }

    pub fn corpus_dir(&self, corpname: &str) -> PathBuf {
        self.base_dir.join(sanitize_corpname(corpname))
    }

    pub fn ensure_corpus_dir(&self, corpname: &str) -> Result<PathBuf> {
        let dir = self.corpus_dir(corpname);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn map_path(&self, corpname: &str) -> PathBuf {
        self.corpus_dir(corpname).join(MAP_FILE_NAME)
    }

    pub fn map_lock_path(&self, corpname: &str) -> PathBuf {
        self.corpus_dir(corpname).join(MAP_LOCK_NAME)
    }

    pub fn conc_path(&self, corpname: &str, slug: &str) -> PathBuf {
        self.corpus_dir(corpname).join(format!("{}.{}", slug, CONC_EXT))
    }

    pub fn pid_path(&self, corpname: &str, slug: &str) -> PathBuf {
        self.corpus_dir(corpname).join(format!("{}.{}", slug, PID_EXT))
    }

    /// Corpus directories currently present under the cache root
    pub fn corpus_dirs(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if !self.base_dir.exists() {
            return Ok(names);
        }
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Slug part of `<slug>.conc` / `<slug>.pid`
pub fn slug_of(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}

/// Corpus names may contain path separators (e.g. `syn2020/part1`)
pub fn sanitize_corpname(corpname: &str) -> String {
    corpname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '_' })
        .collect()
}
