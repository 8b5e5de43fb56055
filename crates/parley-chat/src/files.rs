//! Upload reference normalization.
//!
//! Uploads reach the orchestrator as bare file names, absolute storage URLs,
//! or objects with any of `storageId`, `displayName`, `url`, `name`. They are
//! reduced to a canonical [`FileReference`]; entries that cannot be are
//! dropped, never reported.

use percent_encoding::percent_decode_str;
use serde_json::Value;

use parley_core::types::FileReference;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "ogg", "flac", "aac", "webm", "opus"];

pub fn normalize(raw: &[Value]) -> Vec<FileReference> {
    let refs: Vec<FileReference> = raw.iter().filter_map(normalize_one).collect();
    if refs.len() < raw.len() {
        tracing::debug!(
            received = raw.len(),
            kept = refs.len(),
            "Dropped malformed file references"
        );
    }
    refs
}

fn normalize_one(value: &Value) -> Option<FileReference> {
    match value {
        Value::String(s) => from_string(s),
        Value::Object(map) => {
            let field = |keys: &[&str]| {
                keys.iter()
                    .filter_map(|k| map.get(*k).and_then(Value::as_str))
                    .map(str::trim)
                    .find(|s| !s.is_empty())
            };

            let url_name = field(&["url"]).and_then(|u| from_string(u));
            let name = field(&["name"]);

            let storage_id = field(&["storageId", "storage_id"])
                .map(String::from)
                .or_else(|| url_name.as_ref().map(|r| r.storage_id.clone()))
                .or_else(|| name.map(String::from))?;

            let display_name = field(&["displayName", "display_name"])
                .or(name)
                .map(String::from)
                .or_else(|| url_name.map(|r| r.display_name))
                .unwrap_or_else(|| basename(&storage_id).to_string());

            canonical(storage_id, display_name)
        }
        _ => None,
    }
}

fn from_string(raw: &str) -> Option<FileReference> {
    let raw = raw.trim();
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        let name = url_file_name(raw)?;
        return canonical(name.clone(), name);
    }
    canonical(raw.to_string(), basename(raw).to_string())
}

/// Last path segment of a URL, percent-decoded, without query or fragment.
fn url_file_name(url: &str) -> Option<String> {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest)?;
    let without_suffix = after_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(after_scheme);
    let (_, path) = without_suffix.split_once('/')?;
    let segment = path.rsplit('/').find(|s| !s.is_empty())?;
    Some(percent_decode_str(segment).decode_utf8_lossy().into_owned())
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\'])
        .find(|s| !s.trim().is_empty())
        .unwrap_or(path)
}

fn canonical(storage_id: String, display_name: String) -> Option<FileReference> {
    let storage_id = storage_id.trim().to_string();
    let display_name = display_name.trim().to_string();
    if storage_id.is_empty() || display_name.is_empty() {
        return None;
    }
    Some(FileReference {
        storage_id,
        display_name,
    })
}

/// Whether the reference looks like an audio upload, by extension.
pub fn is_audio(file: &FileReference) -> bool {
    file.display_name
        .rsplit_once('.')
        .map(|(_, ext)| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
