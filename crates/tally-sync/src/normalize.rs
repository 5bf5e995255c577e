//! # Response Normalization
//!
//! Backend responses arrive wrapped in a `message` envelope (sometimes), with
//! `null` where a field has no value, and with barcodes in three different
//! shapes. Everything is normalized here, right after the request returns,
//! so no other module inspects raw JSON.
//!
//! ```text
//! {"message": [{"item_code": "A", "rate": null, "item_barcode": [{"barcode": "1"}]}]}
//!                                   │
//!                                   ▼
//! vec![CatalogItem { item_code: "A", rate: 0.0, barcodes: vec!["1"], .. }]
//! ```

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::warn;

use tally_core::{CartValidationIssue, CatalogItem, Customer, PricingResult, ServerLineResult};

use crate::error::{SyncError, SyncResult};

/// Removes the `message` envelope if present.
pub fn unwrap_message(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("message") => {
            map.remove("message").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Drops `null` fields so serde defaults apply.
fn strip_nulls(map: &mut Map<String, Value>) {
    map.retain(|_, v| !v.is_null());
}

/// Collects barcodes from `barcode`, `item_barcode` or `barcodes`.
///
/// `item_barcode` may be an array of strings, an array of objects with a
/// `barcode` field, or a single such value.
pub fn extract_barcodes(item: &Map<String, Value>) -> Vec<String> {
    fn one(value: &Value) -> Option<String> {
        match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Object(obj) => obj
                .get("barcode")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            _ => None,
        }
    }

    let mut barcodes: Vec<String> = if let Some(single) = item.get("barcode").and_then(one) {
        vec![single]
    } else if let Some(value) = item.get("item_barcode") {
        match value {
            Value::Array(list) => list.iter().filter_map(one).collect(),
            other => one(other).into_iter().collect(),
        }
    } else if let Some(Value::Array(list)) = item.get("barcodes") {
        list.iter().filter_map(one).collect()
    } else {
        Vec::new()
    };

    barcodes.dedup();
    barcodes
}

/// Normalizes one catalog item.
pub fn item_from_value(value: Value) -> SyncResult<CatalogItem> {
    let Value::Object(mut map) = value else {
        return Err(SyncError::InvalidResponse("item is not an object".into()));
    };
    strip_nulls(&mut map);

    let barcodes = extract_barcodes(&map);
    map.remove("barcode");
    map.remove("item_barcode");
    map.insert(
        "barcodes".to_string(),
        Value::Array(barcodes.into_iter().map(Value::String).collect()),
    );

    serde_json::from_value(Value::Object(map))
        .map_err(|e| SyncError::InvalidResponse(format!("item: {e}")))
}

/// Normalizes an item list. Malformed entries are logged and skipped.
pub fn items_from_value(value: Value) -> SyncResult<Vec<CatalogItem>> {
    let list = expect_array(unwrap_message(value), "items")?;
    let mut items = Vec::with_capacity(list.len());
    for entry in list {
        match item_from_value(entry) {
            Ok(item) => items.push(item),
            Err(e) => warn!(error = %e, "Skipping malformed item"),
        }
    }
    Ok(items)
}

/// Normalizes a customer list. Malformed entries are logged and skipped.
pub fn customers_from_value(value: Value) -> SyncResult<Vec<Customer>> {
    let list = expect_array(unwrap_message(value), "customers")?;
    let mut customers = Vec::with_capacity(list.len());
    for entry in list {
        match record::<Customer>(entry) {
            Ok(customer) => customers.push(customer),
            Err(e) => warn!(error = %e, "Skipping malformed customer"),
        }
    }
    Ok(customers)
}

/// Deserializes one object after dropping its `null` fields.
pub fn record<T: DeserializeOwned>(value: Value) -> SyncResult<T> {
    let value = match value {
        Value::Object(mut map) => {
            strip_nulls(&mut map);
            Value::Object(map)
        }
        other => other,
    };
    serde_json::from_value(value).map_err(|e| SyncError::InvalidResponse(e.to_string()))
}

/// Deserializes a list of records. A `null` body is an empty list.
pub fn records<T: DeserializeOwned>(value: Value, what: &str) -> SyncResult<Vec<T>> {
    expect_array(unwrap_message(value), what)?
        .into_iter()
        .map(record)
        .collect()
}

/// Accepts `"a,b"`, `["a", "b"]` or nothing.
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Normalizes the `apply_offers` response.
pub fn pricing_result_from_value(value: Value) -> SyncResult<PricingResult> {
    let body = unwrap_message(value);
    let Value::Object(map) = body else {
        return Ok(PricingResult::default());
    };

    let items = match map.get("items") {
        Some(Value::Array(lines)) => lines.iter().map(line_result).collect(),
        _ => Vec::new(),
    };

    let free_items = match map.get("free_items") {
        Some(Value::Array(list)) => list
            .iter()
            .cloned()
            .filter_map(|v| match record(v) {
                Ok(free) => Some(free),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed free item");
                    None
                }
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(PricingResult {
        items,
        applied_pricing_rules: string_list(map.get("applied_pricing_rules")),
        free_items,
    })
}

fn line_result(value: &Value) -> ServerLineResult {
    let number = |key: &str| value.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    ServerLineResult {
        discount_percentage: number("discount_percentage"),
        discount_amount: number("discount_amount"),
        pricing_rules: string_list(value.get("pricing_rules")),
    }
}

/// Normalizes `validate_cart_items`. Bare strings become issues with only a
/// message.
pub fn validation_issues_from_value(value: Value) -> SyncResult<Vec<CartValidationIssue>> {
    let body = unwrap_message(value);
    let list = match body {
        Value::Null => return Ok(Vec::new()),
        Value::Object(ref map) if map.contains_key("errors") => {
            expect_array(map.get("errors").cloned().unwrap_or(Value::Null), "errors")?
        }
        other => expect_array(other, "validation errors")?,
    };

    list.into_iter()
        .map(|entry| match entry {
            Value::String(message) => Ok(CartValidationIssue {
                item_code: None,
                item_name: None,
                message,
                available_qty: None,
                requested_qty: None,
            }),
            other => record(other),
        })
        .collect()
}

fn expect_array(value: Value, what: &str) -> SyncResult<Vec<Value>> {
    match value {
        Value::Array(list) => Ok(list),
        Value::Null => Ok(Vec::new()),
        other => Err(SyncError::InvalidResponse(format!(
            "expected a list of {what}, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_message() {
        assert_eq!(unwrap_message(json!({"message": [1, 2]})), json!([1, 2]));
        assert_eq!(unwrap_message(json!([1])), json!([1]));
        assert_eq!(unwrap_message(json!({"items": []})), json!({"items": []}));
    }

    #[test]
    fn test_barcode_shapes() {
        let single = item_from_value(json!({"item_code": "A", "barcode": "111"})).unwrap();
        assert_eq!(single.barcodes, vec!["111"]);

        let objects = item_from_value(json!({
            "item_code": "B",
            "item_barcode": [{"barcode": "222"}, {"barcode": "333"}, {"uom": "Nos"}]
        }))
        .unwrap();
        assert_eq!(objects.barcodes, vec!["222", "333"]);

        let strings = item_from_value(json!({"item_code": "C", "item_barcode": ["444"]})).unwrap();
        assert_eq!(strings.barcodes, vec!["444"]);

        let one_object =
            item_from_value(json!({"item_code": "D", "item_barcode": {"barcode": "555"}})).unwrap();
        assert_eq!(one_object.barcodes, vec!["555"]);

        let processed = item_from_value(json!({"item_code": "E", "barcodes": ["666"]})).unwrap();
        assert_eq!(processed.barcodes, vec!["666"]);
    }

    #[test]
    fn test_nulls_take_defaults() {
        let item = item_from_value(json!({
            "item_code": "A",
            "item_name": "Apple",
            "rate": null,
            "price_list_rate": 12.5,
            "conversion_factor": null,
            "actual_qty": null,
        }))
        .unwrap();
        assert_eq!(item.rate, 0.0);
        assert_eq!(item.price_list_rate, 12.5);
        assert_eq!(item.conversion_factor, 1.0);
        assert_eq!(item.actual_qty, None);
    }

    #[test]
    fn test_items_skip_malformed() {
        let items = items_from_value(json!({"message": [
            {"item_code": "A"},
            {"item_name": "no code"},
            "junk",
        ]}))
        .unwrap();
        assert_eq!(items.len(), 1);
        assert!(items_from_value(json!({"message": 5})).is_err());
        assert!(items_from_value(json!({"message": null})).unwrap().is_empty());
    }

    #[test]
    fn test_pricing_result() {
        let result = pricing_result_from_value(json!({"message": {
            "items": [
                {"discount_percentage": 10, "pricing_rules": "PR-1, PR-2"},
                {"discount_amount": null, "pricing_rules": ["PR-3"]},
                {},
            ],
            "applied_pricing_rules": ["PR-1", "PR-2", "PR-3"],
            "free_items": [{"item_code": "GIFT", "qty": 1}],
        }}))
        .unwrap();

        assert_eq!(result.items.len(), 3);
        assert_eq!(result.items[0].discount_percentage, 10.0);
        assert_eq!(result.items[0].pricing_rules, vec!["PR-1", "PR-2"]);
        assert_eq!(result.items[1].pricing_rules, vec!["PR-3"]);
        assert!(!result.items[2].has_match());
        assert_eq!(result.applied_pricing_rules.len(), 3);
        assert_eq!(result.free_items[0].item_code, "GIFT");
    }

    #[test]
    fn test_validation_issues() {
        let issues = validation_issues_from_value(json!({"message": [
            {"item_code": "A", "message": "Only 2 left", "available_qty": 2, "requested_qty": 5},
            "Warehouse closed",
        ]}))
        .unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].available_qty, Some(2.0));
        assert_eq!(issues[1].message, "Warehouse closed");

        assert!(validation_issues_from_value(json!({"message": []}))
            .unwrap()
            .is_empty());
    }
}
