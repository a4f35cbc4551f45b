//! Operator-curated image blocklist.
//!
//! A plain-text sidecar of newline-delimited image ids. Listed images are
//! never served: matching cache files are deleted and their index mappings
//! pruned. The file is re-read whenever its modification time changes, so
//! edits take effect without a restart.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::SystemTime;

use tracing::{info, warn};

#[derive(Default)]
struct BlockState {
    entries: HashSet<String>,
    mod_time: Option<SystemTime>,
    active: bool,
}

pub struct Blocklist {
    path: PathBuf,
    state: RwLock<BlockState>,
}

impl Blocklist {
    pub fn new(path: PathBuf) -> Self {
        let list = Self {
            path,
            state: RwLock::new(BlockState::default()),
        };
        list.reload_if_changed();
        list
    }

    pub fn contains(&self, image_id: &str) -> bool {
        if image_id.is_empty() {
            return false;
        }
        self.reload_if_changed();
        let state = self.state.read().unwrap();
        state.active && state.entries.contains(image_id)
    }

    fn reload_if_changed(&self) {
        let mod_time = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.modified().ok(),
            Err(_) => {
                // File gone: deactivate.
                let mut state = self.state.write().unwrap();
                state.entries.clear();
                state.mod_time = None;
                state.active = false;
                return;
            }
        };

        {
            let state = self.state.read().unwrap();
            if state.active && state.mod_time.is_some() && state.mod_time == mod_time {
                return;
            }
        }

        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unable to read blocklist file");
                let mut state = self.state.write().unwrap();
                state.entries.clear();
                state.active = false;
                return;
            }
        };

        let entries: HashSet<String> = data
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        info!(path = %self.path.display(), entries = entries.len(), "loaded image blocklist");

        let mut state = self.state.write().unwrap();
        state.entries = entries;
        state.mod_time = mod_time;
        state.active = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_blocks_nothing() {
        let dir = TempDir::new().unwrap();
        let list = Blocklist::new(dir.path().join("blocklist.txt"));
        assert!(!list.contains("anything"));
    }

    #[test]
    fn listed_ids_are_blocked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocklist.txt");
        std::fs::write(&path, "bad-image\n\n  spaced-image  \n").unwrap();

        let list = Blocklist::new(path);
        assert!(list.contains("bad-image"));
        assert!(list.contains("spaced-image"));
        assert!(!list.contains("good-image"));
        assert!(!list.contains(""));
    }

    #[test]
    fn edits_are_picked_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocklist.txt");
        std::fs::write(&path, "first\n").unwrap();

        let list = Blocklist::new(path.clone());
        assert!(list.contains("first"));

        // Rewrite with a different entry and a bumped mtime.
        std::fs::write(&path, "second\n").unwrap();
        let newer = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::options().append(true).open(&path).unwrap();
        file.set_modified(newer).unwrap();

        assert!(list.contains("second"));
        assert!(!list.contains("first"));
    }
}
