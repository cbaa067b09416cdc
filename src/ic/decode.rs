//! Candid-shaped reply decoding
//!
//! Canister replies arrive as JSON renderings of candid values:
//!
//! - `nat` / `nat64` as a number or a decimal string (`"1_000_000"` allowed)
//! - `opt T` as `[]` / `[v]` (a bare `null` or value is also accepted)
//! - variants as `{"Tag": payload}`, or a bare `"Tag"` for payload-less tags
//! - `Result` as the variant `{"Ok": v}` / `{"Err": e}`
//!
//! Everything in this module turns those shapes into plain Rust values so
//! that no nested option/variant handling leaks past the IC adapters.

use serde_json::{json, Value};

use crate::error::{AdapterError, AdapterResult};

const SOURCE: &str = "ic-decode";

/// Decode a candid `nat` (or any unsigned int) into `u128`
pub fn nat(value: &Value) -> AdapterResult<u128> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(u128::from)
            .ok_or_else(|| AdapterError::decode(SOURCE, format!("not an unsigned integer: {}", n))),
        Value::String(s) => {
            let digits: String = s.chars().filter(|c| *c != '_').collect();
            digits
                .parse::<u128>()
                .map_err(|e| AdapterError::decode(SOURCE, format!("bad nat {:?}: {}", s, e)))
        }
        other => Err(AdapterError::decode(SOURCE, format!("expected nat, got {}", other))),
    }
}

/// Decode a candid `opt T`, returning the inner value if present
pub fn opt(value: &Value) -> Option<&Value> {
    match value {
        Value::Null => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) if items.len() == 1 => Some(&items[0]),
        other => Some(other),
    }
}

/// Split a variant into its tag and payload (`Null` for payload-less tags)
pub fn variant(value: &Value) -> AdapterResult<(&str, &Value)> {
    static NULL: Value = Value::Null;
    match value {
        Value::String(tag) => Ok((tag.as_str(), &NULL)),
        Value::Object(map) if map.len() == 1 => map
            .iter()
            .next()
            .map(|(tag, payload)| (tag.as_str(), payload))
            .ok_or_else(|| AdapterError::decode(SOURCE, "empty variant")),
        other => Err(AdapterError::decode(
            SOURCE,
            format!("expected single-tag variant, got {}", other),
        )),
    }
}

/// Unwrap a candid `Result`, rendering the `Err` payload as a message
pub fn result(value: &Value) -> AdapterResult<&Value> {
    let (tag, payload) = variant(value)?;
    match tag {
        "Ok" => Ok(payload),
        "Err" => Err(AdapterError::rpc(SOURCE, describe_error(payload))),
        other => Err(AdapterError::decode(SOURCE, format!("unexpected result tag {}", other))),
    }
}

/// Human-readable rendering of an error variant like
/// `{"InsufficientFunds": {"balance": "10"}}`
pub fn describe_error(payload: &Value) -> String {
    match variant(payload) {
        Ok((tag, Value::Null)) => tag.to_string(),
        Ok((tag, Value::String(msg))) => format!("{}: {}", tag, msg),
        Ok((tag, detail)) => format!("{}: {}", tag, detail),
        Err(_) => payload.to_string(),
    }
}

/// Required record field
pub fn field<'a>(record: &'a Value, name: &str) -> AdapterResult<&'a Value> {
    record
        .get(name)
        .ok_or_else(|| AdapterError::decode(SOURCE, format!("missing field {}", name)))
}

/// Text value
pub fn text(value: &Value) -> AdapterResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| AdapterError::decode(SOURCE, format!("expected text, got {}", value)))
}

/// Owner principal of an ICRC `Account` record (`{"owner": .., "subaccount": ..}`)
pub fn account_owner(value: &Value) -> AdapterResult<String> {
    text(field(value, "owner")?)
}

/// Encode an ICRC `Account` with the default subaccount
pub fn account(owner: &str) -> Value {
    json!({ "owner": owner, "subaccount": [] })
}

/// Encode an `opt` argument
pub fn some_or_none<T: Into<Value>>(value: Option<T>) -> Value {
    match value {
        Some(v) => json!([v.into()]),
        None => json!([]),
    }
}

/// Encode a `nat` argument; strings keep full 128-bit precision
pub fn nat_arg(value: u128) -> Value {
    Value::String(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterErrorKind;

    #[test]
    fn test_nat_forms() {
        assert_eq!(nat(&json!(42)).unwrap(), 42);
        assert_eq!(nat(&json!("1_000_000")).unwrap(), 1_000_000);
        assert_eq!(
            nat(&json!("340282366920938463463374607431768211455")).unwrap(),
            u128::MAX
        );
        assert!(nat(&json!(-1)).is_err());
        assert!(nat(&json!(true)).is_err());
    }

    #[test]
    fn test_opt_forms() {
        assert!(opt(&json!([])).is_none());
        assert!(opt(&Value::Null).is_none());
        assert_eq!(opt(&json!(["abc"])), Some(&json!("abc")));
        assert_eq!(opt(&json!("abc")), Some(&json!("abc")));
    }

    #[test]
    fn test_variant_forms() {
        assert_eq!(variant(&json!("Created")).unwrap().0, "Created");
        let error = json!({"Error": "boom"});
        let (tag, payload) = variant(&error).unwrap();
        assert_eq!(tag, "Error");
        assert_eq!(payload, &json!("boom"));
        assert!(variant(&json!({"A": 1, "B": 2})).is_err());
    }

    #[test]
    fn test_result_unwrap() {
        assert_eq!(result(&json!({"Ok": "7"})).unwrap(), &json!("7"));
        let err = result(&json!({"Err": {"InsufficientFunds": {"balance": "10"}}})).unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Rpc);
        assert!(err.message.starts_with("InsufficientFunds"));
        let err = result(&json!({"Err": "TemporarilyUnavailable"})).unwrap_err();
        assert_eq!(err.message, "TemporarilyUnavailable");
    }

    #[test]
    fn test_account_round_shape() {
        let acct = account("aaaaa-aa");
        assert_eq!(account_owner(&acct).unwrap(), "aaaaa-aa");
        assert_eq!(some_or_none(Some(5u64)), json!([5]));
        assert_eq!(some_or_none::<u64>(None), json!([]));
    }
}
