mod parser;

pub use parser::{belongs_to_master, is_master, is_media, parse_media, parse_master};

use crate::error::DownloadError;
use crate::types::{Fragment, Level};

/// Result of classifying a fetched playlist text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    Master,
    Media,
}

/// Classify `text` per §4.A: exactly one of `isMaster`/`isMedia` must hold.
pub fn classify(text: &str) -> Result<PlaylistKind, DownloadError> {
    let master = is_master(text);
    let media = is_media(text);
    match (master, media) {
        (true, false) => Ok(PlaylistKind::Master),
        (false, true) => Ok(PlaylistKind::Media),
        _ => Err(DownloadError::UnclassifiedPlaylist),
    }
}

/// Parse a master playlist into its variant levels, or a media playlist
/// into its ordered fragment list, based on `classify`'s verdict.
pub enum ParsedPlaylist {
    Master(Vec<Level>),
    Media(Vec<Fragment>),
}

pub fn parse(text: &str, base_url: &str) -> Result<ParsedPlaylist, DownloadError> {
    match classify(text)? {
        PlaylistKind::Master => Ok(ParsedPlaylist::Master(parse_master(text, base_url)?)),
        PlaylistKind::Media => Ok(ParsedPlaylist::Media(parse_media(text, base_url)?)),
    }
}
