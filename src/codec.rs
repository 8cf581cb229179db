use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Canonical card metadata, produced once at the codec boundary. Card
/// files come in two shapes on disk (a spec-versioned envelope with a
/// nested `data` block, or a flat legacy object); everything past this
/// module only ever sees this struct.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CardData {
    pub name: String,
    pub description: String,
    pub first_mes: String,
    pub mes_example: String,
    pub tags: Vec<String>,
    pub creator: String,
    pub version: String,
    pub has_lore_book: bool,
    pub lore_book_name: String,
}

/// Extracts embedded card metadata from a file. PNG extraction (tEXt
/// chunks) is supplied by the embedding application; the built-in
/// [`JsonCardCodec`] covers plain JSON exports.
pub trait CardCodec: Send + Sync {
    fn extract(&self, path: &Path) -> Result<CardData, String>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CardPayload {
    Enveloped {
        name: Option<String>,
        data: RawFields,
    },
    Flat(RawFields),
}

#[derive(Deserialize, Default)]
struct RawFields {
    name: Option<String>,
    description: Option<String>,
    first_mes: Option<String>,
    mes_example: Option<String>,
    tags: Option<TagField>,
    creator: Option<String>,
    character_version: Option<String>,
    character_book: Option<LoreBook>,
}

/// Tags arrive either as a JSON list (possibly with non-string entries)
/// or as one comma-joined string.
#[derive(Deserialize)]
#[serde(untagged)]
enum TagField {
    List(Vec<serde_json::Value>),
    Joined(String),
}

#[derive(Deserialize)]
struct LoreBook {
    name: Option<String>,
}

fn normalize_tags(field: Option<TagField>) -> Vec<String> {
    let raw: Vec<String> = match field {
        None => Vec::new(),
        Some(TagField::Joined(joined)) => joined.split(',').map(|t| t.to_string()).collect(),
        Some(TagField::List(values)) => values
            .into_iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut tags = Vec::new();
    for tag in raw {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            tags.push(trimmed.to_string());
        }
    }
    tags
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn normalize(payload: CardPayload, fallback_name: &str) -> CardData {
    let (outer_name, fields) = match payload {
        CardPayload::Enveloped { name, data } => (name, data),
        CardPayload::Flat(fields) => (None, fields),
    };

    let name = non_empty(outer_name)
        .or_else(|| non_empty(fields.name))
        .unwrap_or_else(|| fallback_name.to_string());

    let (has_lore_book, lore_book_name) = match fields.character_book {
        Some(book) => (true, book.name.unwrap_or_default()),
        None => (false, String::new()),
    };

    CardData {
        name,
        description: fields.description.unwrap_or_default(),
        first_mes: fields.first_mes.unwrap_or_default(),
        mes_example: fields.mes_example.unwrap_or_default(),
        tags: normalize_tags(fields.tags),
        creator: fields.creator.unwrap_or_default(),
        version: fields.character_version.unwrap_or_default(),
        has_lore_book,
        lore_book_name,
    }
}

/// Rough token estimate over the prose fields (~4 characters per token).
/// Cheap and stable, which is all the scanner's backfill pass needs.
pub fn estimate_tokens(data: &CardData) -> i64 {
    let chars = data.name.chars().count()
        + data.description.chars().count()
        + data.first_mes.chars().count()
        + data.mes_example.chars().count();
    ((chars + 3) / 4) as i64
}

/// Codec for `.json` card exports.
pub struct JsonCardCodec;

impl CardCodec for JsonCardCodec {
    fn extract(&self, path: &Path) -> Result<CardData, String> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ext != "json" {
            return Err(format!("unsupported card format: {}", path.display()));
        }

        let raw = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let payload: CardPayload = serde_json::from_str(&raw)
            .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();
        Ok(normalize(payload, &stem))
    }
}
