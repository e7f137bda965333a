//! Normalizes list responses whose field names vary by endpoint into a
//! `Page` of items plus the next cursor.

use serde_json::Value;

use super::{pagination::Page, UpstreamError};

const ITEM_FIELDS: [&str; 3] = ["items", "data", "results"];
const CURSOR_POINTERS: [&str; 4] = [
    "/next_starting_after",
    "/next_cursor",
    "/pagination/next_starting_after",
    "/pagination/next_cursor",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseShape {
    /// Tries the common field names.
    Auto,
    /// Items live at `items`, the cursor at JSON pointer `cursor`.
    Fields {
        items: &'static str,
        cursor: &'static str,
    },
}

impl ResponseShape {
    pub fn normalize(&self, body: &Value) -> Result<Page, UpstreamError> {
        let (items, cursor) = match self {
            Self::Auto => (auto_items(body), auto_cursor(body)),
            Self::Fields { items, cursor } => (
                body.get(*items).and_then(Value::as_array),
                body.pointer(cursor),
            ),
        };

        let items = items.cloned().ok_or_else(|| {
            UpstreamError::Decode("list response does not contain an item array".to_string())
        })?;

        Ok(Page {
            items,
            next_cursor: cursor.and_then(cursor_value),
        })
    }
}

fn auto_items(body: &Value) -> Option<&Vec<Value>> {
    if let Some(array) = body.as_array() {
        return Some(array);
    }
    ITEM_FIELDS
        .iter()
        .find_map(|field| body.get(*field).and_then(Value::as_array))
}

fn auto_cursor(body: &Value) -> Option<&Value> {
    CURSOR_POINTERS
        .iter()
        .find_map(|pointer| body.pointer(pointer).filter(|value| !value.is_null()))
}

/// Cursors are opaque; numbers are carried as their text form and blank
/// strings mean there is no next page.
fn cursor_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn auto_reads_items_and_next_starting_after() {
        let page = ResponseShape::Auto
            .normalize(&json!({
                "items": [{ "id": "a" }, { "id": "b" }],
                "next_starting_after": "b"
            }))
            .expect("page");

        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("b"));
    }

    #[test]
    fn auto_reads_data_and_nested_pagination_cursor() {
        let page = ResponseShape::Auto
            .normalize(&json!({
                "data": [1, 2, 3],
                "pagination": { "next_starting_after": "c3" }
            }))
            .expect("page");

        assert_eq!(page.items, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(page.next_cursor.as_deref(), Some("c3"));
    }

    #[test]
    fn bare_array_has_no_cursor() {
        let page = ResponseShape::Auto
            .normalize(&json!([{ "id": 1 }]))
            .expect("page");

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn empty_and_null_cursors_mean_last_page() {
        let empty = ResponseShape::Auto
            .normalize(&json!({ "items": [], "next_starting_after": "" }))
            .expect("page");
        assert_eq!(empty.next_cursor, None);

        let null = ResponseShape::Auto
            .normalize(&json!({ "items": [], "next_cursor": null }))
            .expect("page");
        assert_eq!(null.next_cursor, None);
    }

    #[test]
    fn explicit_fields_shape() {
        let shape = ResponseShape::Fields {
            items: "emails",
            cursor: "/meta/after",
        };
        let page = shape
            .normalize(&json!({ "emails": [{}], "meta": { "after": 42 } }))
            .expect("page");

        assert_eq!(page.next_cursor.as_deref(), Some("42"));
    }

    #[test]
    fn missing_item_array_is_decode_error() {
        let err = ResponseShape::Auto
            .normalize(&json!({ "message": "ok" }))
            .expect_err("no items");

        assert!(matches!(err, UpstreamError::Decode(_)));
    }
}
