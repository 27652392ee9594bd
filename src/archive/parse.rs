//! Parsing of per-item metadata documents.
//!
//! The metadata endpoint is loosely typed: most text fields may be a string or
//! an array of strings, and numeric fields are frequently sent as strings.

use chrono::Utc;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::types::{ShowMetadata, Track};

/// Format labels kept as tracks; everything else (images, checksums, torrents) is skipped
const AUDIO_FORMATS: &[&str] = &[
    "flac",
    "mp3",
    "ogg",
    "shorten",
    "wave",
    "aiff",
    "apple lossless",
    "m4a",
];

/// Parse a `/metadata/<identifier>` response body
pub fn parse_metadata(identifier: &str, body: &str) -> Result<ShowMetadata> {
    let context = || format!("metadata for {identifier}");

    let root: Value = serde_json::from_str(body).map_err(|e| Error::Parse {
        context: context(),
        reason: e.to_string(),
    })?;

    let meta = root
        .get("metadata")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::Parse {
            context: context(),
            reason: "response has no metadata object (unknown or dark item)".to_string(),
        })?;

    let reviews = root
        .get("reviews")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let tracks = root
        .get("files")
        .and_then(Value::as_array)
        .map(|files| files.iter().filter_map(parse_track).collect())
        .unwrap_or_default();

    let show = ShowMetadata {
        identifier: first_text(meta, "identifier").unwrap_or_else(|| identifier.to_string()),
        title: first_text(meta, "title"),
        description: joined_text(meta, "description"),
        date: first_text(meta, "date"),
        year: first_text(meta, "year"),
        venue: first_text(meta, "venue"),
        creator: first_text(meta, "creator"),
        taper: first_text(meta, "taper"),
        source: first_text(meta, "source"),
        transferer: first_text(meta, "transferer"),
        lineage: joined_text(meta, "lineage"),
        notes: joined_text(meta, "notes"),
        collection: first_text(meta, "collection"),
        collections: meta
            .get("collection")
            .map(text_values)
            .unwrap_or_default()
            .into_iter()
            .filter(|c| !c.trim().is_empty())
            .collect(),
        dir: root.get("dir").and_then(Value::as_str).map(str::to_string),
        d1: root.get("d1").and_then(Value::as_str).map(str::to_string),
        d2: root.get("d2").and_then(Value::as_str).map(str::to_string),
        publicdate: first_text(meta, "publicdate"),
        avg_rating: average_stars(reviews),
        num_reviews: reviews.len() as u64,
        tracks,
        fetched_at: Some(Utc::now()),
    };

    show.validate().map_err(|reason| Error::Parse {
        context: context(),
        reason,
    })?;

    Ok(show)
}

/// Numeric value sent either as a JSON number or a numeric string
pub(crate) fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Array(items) => items.first().and_then(value_f64),
        _ => None,
    }
}

/// Non-negative integer sent either as a JSON number or a numeric string
pub(crate) fn value_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Array(items) => items.first().and_then(value_u64),
        _ => None,
    }
}

fn text_values(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    }
}

fn first_text(meta: &Map<String, Value>, key: &str) -> Option<String> {
    meta.get(key)
        .map(text_values)
        .and_then(|values| values.into_iter().find(|s| !s.trim().is_empty()))
}

fn joined_text(meta: &Map<String, Value>, key: &str) -> Option<String> {
    let values = meta.get(key).map(text_values)?;
    let joined = values
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    (!joined.is_empty()).then_some(joined)
}

fn average_stars(reviews: &[Value]) -> Option<f64> {
    let stars: Vec<f64> = reviews
        .iter()
        .filter_map(|r| r.get("stars").and_then(value_f64))
        .collect();
    if stars.is_empty() {
        return None;
    }
    Some(stars.iter().sum::<f64>() / stars.len() as f64)
}

fn is_audio_format(format: &str) -> bool {
    let format = format.to_ascii_lowercase();
    !format.contains("fingerprint") && AUDIO_FORMATS.iter().any(|f| format.contains(f))
}

/// Duration in seconds from `"312.5"`, `"5:12"` or `"1:05:12"`
fn parse_length(value: &Value) -> Option<f64> {
    if let Some(secs) = value_f64(value) {
        return Some(secs);
    }
    let text = value.as_str()?;
    let mut total = 0.0;
    for part in text.trim().split(':') {
        let n: f64 = part.parse().ok()?;
        total = total * 60.0 + n;
    }
    Some(total)
}

fn parse_track(file: &Value) -> Option<Track> {
    let format = file.get("format").and_then(Value::as_str)?;
    if !is_audio_format(format) {
        return None;
    }
    let name = file.get("name").and_then(Value::as_str)?;
    let text = |key: &str| {
        file.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Some(Track {
        name: name.to_string(),
        title: text("title"),
        track: text("track"),
        length: file.get("length").and_then(parse_length),
        md5: text("md5"),
        format: format.to_string(),
        source: text("source"),
        size: file.get("size").and_then(value_u64),
    })
}
