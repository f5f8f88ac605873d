//! Method-binding metadata carried on IR functions.
//!
//! Every function implementing a concrete method is tagged with a string
//! attribute describing which type it belongs to and which method it
//! implements. The post-link lowering pass reads these attributes to build
//! dispatch tables without needing source-level information.
//!
//! Encoding: fields are joined with U+001F (unit separator), multiple
//! entries with U+001E (record separator). Each entry is
//! `typeSymbol <US> methodName <US> methodTypeSymbol`.

/// Attribute key marking an interface-call target function (IFn).
pub const ATTR_IFN: &str = "llgo.method.ifn";

/// Attribute key marking a direct-method-call target function (TFn).
pub const ATTR_TFN: &str = "llgo.method.tfn";

const FIELD_SEP: &str = "\u{1f}";
const LIST_SEP: &str = "\u{1e}";

/// One decoded method-binding record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBindingEntry {
    pub type_symbol: String,
    pub method_name: String,
    pub method_type_symbol: String,
}

/// Encode a single entry payload.
pub fn encode_payload(type_symbol: &str, method_name: &str, method_type_symbol: &str) -> String {
    format!("{type_symbol}{FIELD_SEP}{method_name}{FIELD_SEP}{method_type_symbol}")
}

/// Decode a single entry payload. Returns `None` when the field count is
/// wrong or any field is empty.
pub fn decode_payload(payload: &str) -> Option<MethodBindingEntry> {
    let mut parts = payload.split(FIELD_SEP);
    let type_symbol = parts.next()?;
    let method_name = parts.next()?;
    let method_type_symbol = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if type_symbol.is_empty() || method_name.is_empty() || method_type_symbol.is_empty() {
        return None;
    }
    Some(MethodBindingEntry {
        type_symbol: type_symbol.to_string(),
        method_name: method_name.to_string(),
        method_type_symbol: method_type_symbol.to_string(),
    })
}

/// Merge a payload into an existing attribute value, dropping exact
/// duplicates.
pub fn merge_payload(existing: &str, payload: &str) -> String {
    if existing.is_empty() {
        return payload.to_string();
    }
    if payload.is_empty() {
        return existing.to_string();
    }
    if existing.split(LIST_SEP).any(|item| item == payload) {
        return existing.to_string();
    }
    format!("{existing}{LIST_SEP}{payload}")
}

/// Decode a full attribute value into its entries, skipping malformed
/// items.
pub fn decode_attr_value(value: &str) -> Vec<MethodBindingEntry> {
    if value.is_empty() {
        return Vec::new();
    }
    value.split(LIST_SEP).filter_map(decode_payload).collect()
}
