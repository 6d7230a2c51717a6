use ulid::Ulid;

pub fn new_ulid_string() -> String {
    Ulid::new().to_string()
}

/// Returns `raw` unless it is blank, in which case a fresh ULID is generated.
pub fn or_new_ulid(raw: Option<String>) -> String {
    match raw {
        Some(id) if !id.trim().is_empty() => id,
        _ => new_ulid_string(),
    }
}
