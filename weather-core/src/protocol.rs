//! Text messages exchanged on the shared topic.
//!
//! Every message starts with a marker token that names its kind:
//! - `[DATA] <temperature>,<humidity>,<visibility>\n` (outbound)
//! - `[CITIES] <name1>,<name2>,...\n` (outbound)
//! - `[CITY] <name>` (inbound)
//!
//! The broadcaster receives its own outbound messages back from the broker,
//! so anything that is not a `[CITY]` command is simply not ours to handle.

use thiserror::Error;

use crate::model::{CityTable, WeatherRecord};

pub const DATA_MARKER: &str = "[DATA]";
pub const CITIES_MARKER: &str = "[CITIES]";
pub const CITY_MARKER: &str = "[CITY]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    SelectCity(&'a str),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing space between the {CITY_MARKER} marker and the city name")]
    MissingSeparator,

    #[error("city name is empty")]
    EmptyCity,

    #[error("unrecognised marker {0:?}")]
    UnknownMarker(String),

    #[error("payload is not valid UTF-8")]
    NotUtf8,
}

/// Parses an inbound message.
///
/// Returns `Ok(None)` for messages that are not commands. The message is split
/// on its first space only, and the remainder (trimmed) is the city name, so
/// `[CITY] New York` selects `New York`.
pub fn parse_command(raw: &str) -> Result<Option<Command<'_>>, ParseError> {
    let message = raw.trim_start();
    if !message.starts_with(CITY_MARKER) {
        return Ok(None);
    }

    let (marker, rest) = message
        .split_once(' ')
        .ok_or(ParseError::MissingSeparator)?;

    if marker != CITY_MARKER {
        return Err(ParseError::UnknownMarker(marker.to_owned()));
    }

    let city = rest.trim();
    if city.is_empty() {
        return Err(ParseError::EmptyCity);
    }

    Ok(Some(Command::SelectCity(city)))
}

/// Like [`parse_command`], for raw broker payloads.
pub fn parse_payload(payload: &[u8]) -> Result<Option<Command<'_>>, ParseError> {
    let raw = std::str::from_utf8(payload).map_err(|_| ParseError::NotUtf8)?;
    parse_command(raw)
}

pub fn encode_data(record: &WeatherRecord) -> String {
    format!("{DATA_MARKER} {}\n", record.values().join(","))
}

pub fn encode_cities(table: &CityTable) -> String {
    let names: Vec<&str> = table.names().collect();
    format!("{CITIES_MARKER} {}\n", names.join(","))
}

pub fn encode_select_city(city: &str) -> String {
    format!("{CITY_MARKER} {city}")
}
