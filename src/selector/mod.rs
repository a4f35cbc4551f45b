//! Poster candidate selection.
//!
//! Given every artwork candidate upstream offers for a program, pick the
//! single best poster deterministically. The ranking is table-driven so rule
//! changes are reviewable diffs instead of rewrites.

use crate::models::ImageCandidate;

/// Sentinel aspect value that disables the exact-aspect filter.
pub const ASPECT_ALL: &str = "all";

/// Allowed poster categories in preference order. Anything not listed here
/// is rejected outright, which keeps cast shots, banners-as-backgrounds and
/// fan art out of poster slots no matter how large they are.
const CATEGORY_RANKS: &[(&str, u32)] = &[
    ("poster art", 0),
    ("box art", 1),
    ("showcard", 2),
    ("banner-l1", 3),
    ("banner-l2", 4),
    ("vod art", 5),
];

/// Artwork tier preference: show-level art beats season-level beats
/// episode-level. Unknown tiers sit between season and episode.
const TIER_RANKS: &[(&str, u32)] = &[
    ("series", 0),
    ("show", 0),
    ("season", 1),
    ("episode", 3),
];
const TIER_RANK_UNKNOWN: u32 = 2;

/// Aspect preference applied only when no exact-aspect filter is requested.
/// Portrait ratios make better poster slots than landscape ones.
const ASPECT_RANKS: &[(&str, u32)] = &[
    ("2x3", 0),
    ("3x4", 1),
    ("4x3", 2),
    ("1x1", 3),
    ("16x9", 4),
];
const ASPECT_RANK_OTHER: u32 = 5;

const TIER_WEIGHT: u32 = 100;
const CATEGORY_WEIGHT: u32 = 10;

#[derive(Debug, Clone)]
pub struct SelectionConfig {
    /// Exact aspect label to require, e.g. "2x3". `"all"` (or empty)
    /// disables the filter.
    pub desired_aspect: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            desired_aspect: "2x3".to_string(),
        }
    }
}

impl SelectionConfig {
    fn aspect_filter(&self) -> Option<&str> {
        let aspect = self.desired_aspect.trim();
        if aspect.is_empty() || aspect.eq_ignore_ascii_case(ASPECT_ALL) {
            None
        } else {
            Some(aspect)
        }
    }
}

fn category_rank(category: &str) -> Option<u32> {
    let category = category.trim().to_ascii_lowercase();
    CATEGORY_RANKS
        .iter()
        .find(|(name, _)| *name == category)
        .map(|(_, rank)| *rank)
}

fn tier_rank(tier: &str) -> u32 {
    let tier = tier.trim().to_ascii_lowercase();
    TIER_RANKS
        .iter()
        .find(|(name, _)| *name == tier)
        .map(|(_, rank)| *rank)
        .unwrap_or(TIER_RANK_UNKNOWN)
}

fn aspect_rank(aspect: &str) -> u32 {
    let aspect = aspect.trim().to_ascii_lowercase();
    ASPECT_RANKS
        .iter()
        .find(|(name, _)| *name == aspect)
        .map(|(_, rank)| *rank)
        .unwrap_or(ASPECT_RANK_OTHER)
}

/// Pick the best poster candidate, or `None` when nothing qualifies.
///
/// Filtering is strict: candidates outside the category allow-list are
/// dropped, and when an exact aspect is configured a program with no match
/// yields `None` rather than falling back to an off-aspect image. Callers
/// treat `None` as "use the external fallback provider", not as an error.
///
/// The result is deterministic for a fixed input: scores compare strictly,
/// ties go to the larger width, and remaining ties keep the earliest
/// candidate.
pub fn select_poster<'a>(
    candidates: &'a [ImageCandidate],
    config: &SelectionConfig,
) -> Option<&'a ImageCandidate> {
    let aspect_filter = config.aspect_filter();

    let mut best: Option<(&ImageCandidate, u32)> = None;

    for candidate in candidates {
        if candidate.uri.trim().is_empty() {
            continue;
        }
        let Some(cat_rank) = category_rank(&candidate.category) else {
            continue;
        };
        if let Some(wanted) = aspect_filter {
            if !candidate.aspect.trim().eq_ignore_ascii_case(wanted) {
                continue;
            }
        }

        let mut score = tier_rank(&candidate.tier) * TIER_WEIGHT + cat_rank * CATEGORY_WEIGHT;
        if aspect_filter.is_none() {
            score += aspect_rank(&candidate.aspect);
        }

        best = match best {
            None => Some((candidate, score)),
            Some((current, current_score)) => {
                if score < current_score
                    || (score == current_score && candidate.width > current.width)
                {
                    Some((candidate, score))
                } else {
                    Some((current, current_score))
                }
            }
        };
    }

    best.map(|(candidate, _)| candidate)
}
