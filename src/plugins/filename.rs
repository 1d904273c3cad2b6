//! Media filename parser backing the `$habari` binding.
//!
//! Release names in the wild look like
//! `[SubsPlease] Sousou no Frieren - 28v2 (1080p) [ABCD1234].mkv`; scripts
//! use the parsed metadata to match files against library entries. The
//! parser is heuristic: it strips bracketed groups, pulls out the episode
//! marker, and keeps whatever is left as the title.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Parsed metadata for one filename.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedFilename {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

static EXTENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.(mkv|mp4|avi|webm|ts|mov|m4v)$").unwrap());
static LEADING_GROUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[([^\]]+)\]\s*").unwrap());
static CHECKSUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([0-9A-Fa-f]{8})\]").unwrap());
static RESOLUTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{3,4}p|[248]k)\b").unwrap());
static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\((19|20)(\d{2})\)").unwrap());
static SEASON_EPISODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bS(\d{1,2})E(\d{1,4})\b").unwrap());
static SEASON_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bseason\s+(\d{1,2})\b").unwrap());
static DASH_EPISODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s[-–]\s(\d{1,4})(?:v\d+)?\b").unwrap());
static EPISODE_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:e|ep|episode)\s*\.?\s*(\d{1,4})\b").unwrap());
static BRACKETED: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\[(][^\])]*[\])]").unwrap());

/// Parse a media filename into structured metadata.
pub fn parse(filename: &str) -> ParsedFilename {
    let mut parsed = ParsedFilename::default();
    let mut rest = filename.trim().to_string();

    if let Some(caps) = EXTENSION.captures(&rest) {
        parsed.extension = Some(caps[1].to_lowercase());
        rest = EXTENSION.replace(&rest, "").to_string();
    }

    if let Some(caps) = LEADING_GROUP.captures(&rest) {
        parsed.release_group = Some(caps[1].trim().to_string());
        rest = LEADING_GROUP.replace(&rest, "").to_string();
    }

    if let Some(caps) = CHECKSUM.captures(&rest) {
        parsed.checksum = Some(caps[1].to_uppercase());
        rest = CHECKSUM.replace(&rest, "").to_string();
    }

    if let Some(caps) = RESOLUTION.captures(&rest) {
        parsed.resolution = Some(caps[1].to_lowercase());
    }

    if let Some(caps) = YEAR.captures(&rest) {
        let year: u32 = format!("{}{}", &caps[1], &caps[2]).parse().unwrap_or(0);
        parsed.year = Some(year);
        rest = YEAR.replace(&rest, "").to_string();
    }

    // Episode markers, most specific first. The matched marker and
    // everything after it is cut from the title.
    if let Some(caps) = SEASON_EPISODE.captures(&rest) {
        parsed.season = caps[1].parse().ok();
        parsed.episode = caps[2].parse().ok();
        let start = caps.get(0).unwrap().start();
        rest.truncate(start);
    } else if let Some(caps) = DASH_EPISODE.captures(&rest) {
        parsed.episode = caps[1].parse().ok();
        let start = caps.get(0).unwrap().start();
        rest.truncate(start);
    } else if let Some(caps) = EPISODE_WORD.captures(&rest) {
        parsed.episode = caps[1].parse().ok();
        let start = caps.get(0).unwrap().start();
        rest.truncate(start);
    }

    if let Some(caps) = SEASON_WORD.captures(&rest) {
        parsed.season = caps[1].parse().ok();
        let start = caps.get(0).unwrap().start();
        rest.truncate(start);
    }

    // Whatever survives, minus bracketed noise and separator dots, is the
    // title.
    let title = BRACKETED.replace_all(&rest, " ");
    let title = if title.contains(' ') {
        title.to_string()
    } else {
        title.replace(['.', '_'], " ")
    };
    parsed.title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    parsed
        .title
        .truncate(parsed.title.trim_end_matches(['-', '–', ' ']).len());
    parsed.title = parsed.title.trim().to_string();

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fansub_release() {
        let parsed = parse("[SubsPlease] Sousou no Frieren - 28v2 (1080p) [ABCD1234].mkv");
        assert_eq!(parsed.title, "Sousou no Frieren");
        assert_eq!(parsed.episode, Some(28));
        assert_eq!(parsed.resolution.as_deref(), Some("1080p"));
        assert_eq!(parsed.release_group.as_deref(), Some("SubsPlease"));
        assert_eq!(parsed.checksum.as_deref(), Some("ABCD1234"));
        assert_eq!(parsed.extension.as_deref(), Some("mkv"));
        assert_eq!(parsed.season, None);
    }

    #[test]
    fn test_season_episode_marker() {
        let parsed = parse("Spy.x.Family.S02E05.720p.WEB.mkv");
        assert_eq!(parsed.title, "Spy x Family");
        assert_eq!(parsed.season, Some(2));
        assert_eq!(parsed.episode, Some(5));
        assert_eq!(parsed.resolution.as_deref(), Some("720p"));
    }

    #[test]
    fn test_episode_word_and_year() {
        let parsed = parse("Cowboy Bebop (1998) Episode 13.mp4");
        assert_eq!(parsed.title, "Cowboy Bebop");
        assert_eq!(parsed.year, Some(1998));
        assert_eq!(parsed.episode, Some(13));
        assert_eq!(parsed.extension.as_deref(), Some("mp4"));
    }

    #[test]
    fn test_movie_without_episode() {
        let parsed = parse("[Group] Perfect Blue (1997) (1080p) [01234567].mkv");
        assert_eq!(parsed.title, "Perfect Blue");
        assert_eq!(parsed.episode, None);
        assert_eq!(parsed.year, Some(1997));
        assert_eq!(parsed.release_group.as_deref(), Some("Group"));
    }

    #[test]
    fn test_season_word() {
        let parsed = parse("Mob Psycho 100 Season 3 - 04 (1080p).mkv");
        assert_eq!(parsed.episode, Some(4));
        assert_eq!(parsed.season, Some(3));
        assert_eq!(parsed.title, "Mob Psycho 100");
    }

    #[test]
    fn test_plain_name_is_title() {
        let parsed = parse("some random file.mkv");
        assert_eq!(parsed.title, "some random file");
        assert_eq!(parsed.episode, None);
    }
}
