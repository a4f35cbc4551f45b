//! Manual title -> image overrides.
//!
//! A sidecar of `"title","imageID"` lines lets an operator pin the poster
//! for a program by title, bypassing selection entirely. Matching is
//! case-insensitive on the program's titles. Pinned image ids are also
//! exempt from the eviction sweep.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tracing::{info, warn};

#[derive(Default)]
pub struct OverrideList {
    title_to_image: HashMap<String, String>,
    image_ids: HashSet<String>,
}

impl OverrideList {
    /// Load the override file. A missing file is simply an empty list.
    pub fn load(path: &PathBuf) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to read overrides file");
                }
                return Self::default();
            }
        };

        let mut list = Self::default();
        for (line_no, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((title, image_id)) = parse_override_line(line) else {
                warn!(path = %path.display(), line = line_no + 1, "unable to parse override line");
                continue;
            };
            if title.is_empty() || image_id.is_empty() {
                warn!(path = %path.display(), line = line_no + 1, "empty title or image id in override");
                continue;
            }
            list.title_to_image
                .insert(title.to_ascii_lowercase(), image_id.clone());
            list.image_ids.insert(image_id);
        }

        if !list.title_to_image.is_empty() {
            info!(path = %path.display(), count = list.title_to_image.len(), "loaded image overrides");
        }
        list
    }

    pub fn image_for_title(&self, title: &str) -> Option<&str> {
        if self.title_to_image.is_empty() {
            return None;
        }
        self.title_to_image
            .get(&title.trim().to_ascii_lowercase())
            .map(String::as_str)
    }

    /// First override hit across a program's titles.
    pub fn image_for_titles<'a, I>(&self, titles: I) -> Option<&str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        titles
            .into_iter()
            .find_map(|title| self.image_for_title(title))
    }

    /// Pinned images are never evicted.
    pub fn is_pinned(&self, image_id: &str) -> bool {
        !image_id.is_empty() && self.image_ids.contains(image_id)
    }
}

/// Parse one `"title","imageID"` record. Titles may contain commas; both
/// fields may be quoted or bare.
fn parse_override_line(line: &str) -> Option<(String, String)> {
    let (title, rest) = read_field(line)?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix(',')?;
    let (image_id, trailing) = read_field(rest.trim_start())?;
    if !trailing.trim().is_empty() {
        return None;
    }
    Some((title, image_id))
}

fn read_field(input: &str) -> Option<(String, &str)> {
    let input = input.trim_start();
    if let Some(rest) = input.strip_prefix('"') {
        let end = rest.find('"')?;
        Some((rest[..end].trim().to_string(), &rest[end + 1..]))
    } else {
        let end = input.find(',').unwrap_or(input.len());
        Some((input[..end].trim().to_string(), &input[end..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_quoted_and_bare_records() {
        assert_eq!(
            parse_override_line(r#""The Long, Wrong Title","img123""#),
            Some(("The Long, Wrong Title".to_string(), "img123".to_string()))
        );
        assert_eq!(
            parse_override_line("Plain Title,img456"),
            Some(("Plain Title".to_string(), "img456".to_string()))
        );
        assert!(parse_override_line(r#""only one field""#).is_none());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("overrides.txt");
        std::fs::write(&path, "\"My Show\",\"img-show\"\n\nbad line without comma\n").unwrap();

        let list = OverrideList::load(&path);
        assert_eq!(list.image_for_title("my show"), Some("img-show"));
        assert_eq!(list.image_for_title("MY SHOW "), Some("img-show"));
        assert_eq!(list.image_for_title("other"), None);
        assert!(list.is_pinned("img-show"));
        assert!(!list.is_pinned("img-other"));
    }

    #[test]
    fn first_matching_title_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("overrides.txt");
        std::fs::write(&path, "\"Second Title\",\"img-2\"\n").unwrap();

        let list = OverrideList::load(&path);
        let titles = ["First Title", "Second Title"];
        assert_eq!(
            list.image_for_titles(titles.iter().copied()),
            Some("img-2")
        );
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let list = OverrideList::load(&dir.path().join("overrides.txt"));
        assert_eq!(list.image_for_title("anything"), None);
    }
}
