// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Schema & Validator (spec §4.1, component A).
//!
//! A [`Schema`] describes a record as `{properties, required}`. Property
//! and table identifiers are restricted to `^[A-Za-z][A-Za-z0-9_]*$`, the
//! same restriction the SQL-backed repository backends place on table and
//! column names before interpolating them into DDL.
//!
//! Validation is delegated to a JSON-Schema-compatible validator
//! (`jsonschema`); the validator library choice is left external to the
//! record model itself — we compile a schema once and reuse the compiled
//! validator.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// `^[A-Za-z][A-Za-z0-9_]*$` — property and table name rule (spec §3.1).
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate an identifier (property name or table name), failing fast.
pub fn validate_identifier(name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(Error::workflow(format!(
            "invalid identifier '{name}': must match ^[A-Za-z][A-Za-z0-9_]*$"
        )))
    }
}

/// The primitive JSON type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    /// UTF-8 text.
    String,
    /// Any JSON number (integer or float).
    Number,
    /// A JSON number with no fractional part.
    Integer,
    /// `true`/`false`.
    Boolean,
    /// A nested record.
    Object,
    /// A homogeneous list, described by `items`.
    Array,
}

/// Extra semantic hint for how a `string` property should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Format {
    /// RFC 3339 timestamp.
    DateTime,
    /// RFC 3339 date (no time component).
    Date,
    /// A UUID.
    Uuid,
    /// An email address.
    Email,
    /// A URI.
    Uri,
    /// Opaque binary data (paired with `content_encoding = Blob`).
    Binary,
}

/// A single property's type descriptor (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySchema {
    /// The property's JSON type.
    #[serde(rename = "type")]
    pub type_: PropertyType,
    /// Optional semantic format hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    /// Set when this property stores opaque binary content as a blob.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_blob: bool,
    /// Whether `null` is an acceptable value in addition to `type_`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_nullable: bool,
    /// Maximum string length / array length, depending on `type_`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,
    /// Inclusive minimum, for `number`/`integer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    /// Inclusive maximum, for `number`/`integer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    /// Numeric step constraint, for `number`/`integer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiple_of: Option<f64>,
    /// Default value used when the property is absent from a record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Json>,
    /// Element type descriptor, required when `type_ == Array`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
}

impl PropertySchema {
    /// A bare property of the given type, with no constraints.
    pub fn new(type_: PropertyType) -> Self {
        Self {
            type_,
            format: None,
            is_blob: false,
            is_nullable: false,
            max_length: None,
            minimum: None,
            maximum: None,
            multiple_of: None,
            default: None,
            items: None,
        }
    }

    /// Builder-style: mark this property nullable.
    pub fn nullable(mut self) -> Self {
        self.is_nullable = true;
        self
    }

    /// Builder-style: attach a format hint.
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    /// Builder-style: attach a default value.
    pub fn with_default(mut self, default: Json) -> Self {
        self.default = Some(default);
        self
    }

    /// `simplify`: collapse this descriptor into `(is_nullable,
    /// non_null_type)`, the view SQL type mapping consumes (spec §4.1).
    pub fn simplify(&self) -> (bool, PropertyType) {
        (self.is_nullable, self.type_)
    }

    fn to_json_schema(&self) -> Json {
        let base_type = match self.type_ {
            PropertyType::String => "string",
            PropertyType::Number => "number",
            PropertyType::Integer => "integer",
            PropertyType::Boolean => "boolean",
            PropertyType::Object => "object",
            PropertyType::Array => "array",
        };
        let mut obj = serde_json::Map::new();
        if self.is_nullable {
            obj.insert("type".into(), serde_json::json!([base_type, "null"]));
        } else {
            obj.insert("type".into(), serde_json::json!(base_type));
        }
        if let Some(format) = self.format {
            let s = match format {
                Format::DateTime => "date-time",
                Format::Date => "date",
                Format::Uuid => "uuid",
                Format::Email => "email",
                Format::Uri => "uri",
                Format::Binary => "binary",
            };
            obj.insert("format".into(), serde_json::json!(s));
        }
        if let Some(max_len) = self.max_length {
            obj.insert("maxLength".into(), serde_json::json!(max_len));
        }
        if let Some(min) = self.minimum {
            obj.insert("minimum".into(), serde_json::json!(min));
        }
        if let Some(max) = self.maximum {
            obj.insert("maximum".into(), serde_json::json!(max));
        }
        if let Some(mult) = self.multiple_of {
            obj.insert("multipleOf".into(), serde_json::json!(mult));
        }
        if let Some(items) = &self.items {
            obj.insert("items".into(), items.to_json_schema());
        }
        Json::Object(obj)
    }
}

/// A full record schema: a mapping from property name to type descriptor,
/// plus the set of required property names (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    /// Property name → type descriptor. `BTreeMap` for a deterministic
    /// iteration order, which matters for canonical-JSON fingerprinting
    /// (§4.6) and for stable `CREATE TABLE` column ordering (§6.3).
    pub properties: BTreeMap<String, PropertySchema>,
    /// Names of properties that must be present on every valid record.
    pub required: BTreeSet<String>,
    #[serde(skip)]
    compiled: OnceLock<jsonschema::Validator>,
}

impl Schema {
    /// Construct a schema, validating every property/required name against
    /// the identifier rule up front (spec §3.1 invariant).
    pub fn new(
        properties: BTreeMap<String, PropertySchema>,
        required: BTreeSet<String>,
    ) -> Result<Self> {
        for name in properties.keys() {
            validate_identifier(name)?;
        }
        for name in &required {
            if !properties.contains_key(name) {
                return Err(Error::workflow(format!(
                    "required property '{name}' is not declared in properties"
                )));
            }
        }
        Ok(Self {
            properties,
            required,
            compiled: OnceLock::new(),
        })
    }

    fn to_json_schema(&self) -> Json {
        let mut props = serde_json::Map::new();
        for (name, prop) in &self.properties {
            props.insert(name.clone(), prop.to_json_schema());
        }
        serde_json::json!({
            "type": "object",
            "properties": props,
            "required": self.required.iter().collect::<Vec<_>>(),
        })
    }

    fn validator(&self) -> &jsonschema::Validator {
        self.compiled.get_or_init(|| {
            jsonschema::validator_for(&self.to_json_schema())
                .expect("schema descriptors always compile to valid JSON Schema")
        })
    }

    /// Validate `record` against this schema. On failure, returns
    /// `InvalidInput` citing every offending path, not just the first
    /// (spec §4.1).
    pub fn validate(&self, record: &Json) -> Result<()> {
        let validator = self.validator();
        let paths: Vec<String> = validator
            .iter_errors(record)
            .map(|e| {
                let pointer = e.instance_path.to_string();
                if pointer.is_empty() {
                    "<root>".to_string()
                } else {
                    pointer
                }
            })
            .collect();
        if paths.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidInput { paths })
        }
    }

    /// `defaultsOf`: `{name -> default}` for every property declaring one.
    pub fn defaults_of(&self) -> BTreeMap<String, Json> {
        self.properties
            .iter()
            .filter_map(|(name, prop)| prop.default.clone().map(|d| (name.clone(), d)))
            .collect()
    }

    /// `splitSchema`: project this schema onto primary-key and value
    /// property sets. Errors if any declared primary-key name is missing
    /// from the schema (spec §4.1).
    pub fn split(&self, primary_key_names: &[String]) -> Result<(Schema, Schema)> {
        let pk_set: BTreeSet<String> = primary_key_names.iter().cloned().collect();
        for name in &pk_set {
            validate_identifier(name)?;
            if !self.properties.contains_key(name) {
                return Err(Error::workflow(format!(
                    "primary key property '{name}' is not declared in schema"
                )));
            }
        }
        let mut pk_props = BTreeMap::new();
        let mut value_props = BTreeMap::new();
        for (name, prop) in &self.properties {
            if pk_set.contains(name) {
                pk_props.insert(name.clone(), prop.clone());
            } else {
                value_props.insert(name.clone(), prop.clone());
            }
        }
        let pk_required = self.required.intersection(&pk_set).cloned().collect();
        let value_required = self
            .required
            .difference(&pk_set)
            .cloned()
            .collect();
        Ok((
            Schema::new(pk_props, pk_required)?,
            Schema::new(value_props, value_required)?,
        ))
    }

    /// Property names, in declared (sorted) order.
    pub fn property_names(&self) -> impl Iterator<Item = &String> {
        self.properties.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        let mut props = BTreeMap::new();
        props.insert("id".to_string(), PropertySchema::new(PropertyType::String));
        props.insert(
            "category".to_string(),
            PropertySchema::new(PropertyType::String),
        );
        props.insert(
            "value".to_string(),
            PropertySchema::new(PropertyType::Integer),
        );
        let mut required = BTreeSet::new();
        required.insert("id".to_string());
        Schema::new(props, required).unwrap()
    }

    #[test]
    fn validate_accepts_conforming_record() {
        let schema = sample_schema();
        let record = serde_json::json!({"id": "1", "category": "e", "value": 10});
        assert!(schema.validate(&record).is_ok());
    }

    #[test]
    fn validate_reports_every_offending_path() {
        let schema = sample_schema();
        let record = serde_json::json!({"category": 5, "value": "not a number"});
        let err = schema.validate(&record).unwrap_err();
        match err {
            Error::InvalidInput { paths } => assert!(paths.len() >= 2),
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[test]
    fn split_separates_primary_key_from_value() {
        let schema = sample_schema();
        let (pk, value) = schema.split(&["id".to_string()]).unwrap();
        assert!(pk.properties.contains_key("id"));
        assert!(!value.properties.contains_key("id"));
        assert!(value.properties.contains_key("category"));
    }

    #[test]
    fn split_rejects_unknown_primary_key_name() {
        let schema = sample_schema();
        assert!(schema.split(&["missing".to_string()]).is_err());
    }

    #[test]
    fn rejects_invalid_identifier() {
        let mut props = BTreeMap::new();
        props.insert("1bad".to_string(), PropertySchema::new(PropertyType::String));
        assert!(Schema::new(props, BTreeSet::new()).is_err());
    }

    #[test]
    fn defaults_of_collects_only_declared_defaults() {
        let mut props = BTreeMap::new();
        props.insert(
            "retries".to_string(),
            PropertySchema::new(PropertyType::Integer).with_default(serde_json::json!(3)),
        );
        props.insert("name".to_string(), PropertySchema::new(PropertyType::String));
        let schema = Schema::new(props, BTreeSet::new()).unwrap();
        let defaults = schema.defaults_of();
        assert_eq!(defaults.get("retries"), Some(&serde_json::json!(3)));
        assert!(!defaults.contains_key("name"));
    }
}
