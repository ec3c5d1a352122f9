use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON string column into a typed value, returning CorruptRow on
/// parse failure.
pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use robust_core::command::Sender;

    #[test]
    fn parse_json_success() {
        let sender: Sender =
            parse_json(r#"{"id":"u1","handle":"bren"}"#, "messages", "sender").unwrap();
        assert_eq!(sender.handle, "bren");
        assert!(sender.name.is_none());
    }

    #[test]
    fn parse_json_failure() {
        let result: Result<Sender, _> = parse_json("not valid json", "messages", "sender");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow {
                table: "messages",
                column: "sender",
                ..
            })
        ));
    }
}
