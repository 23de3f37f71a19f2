//! Firestore REST API types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Firestore document value.
///
/// Only the scalar kinds a job record uses; integers are decimal strings on
/// the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    NullValue(()),
    BooleanValue(bool),
    IntegerValue(String),
    DoubleValue(f64),
    TimestampValue(String),
    StringValue(String),
}

/// Firestore document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Full resource name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub fields: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
}

impl Document {
    pub fn new(fields: HashMap<String, Value>) -> Self {
        Self {
            name: None,
            fields: Some(fields),
            create_time: None,
            update_time: None,
        }
    }

    /// Read a typed field; `None` when missing, null, or of another type.
    pub fn field<T: FromFirestoreValue>(&self, name: &str) -> Option<T> {
        self.fields
            .as_ref()
            .and_then(|fields| fields.get(name))
            .and_then(T::from_firestore_value)
    }
}

/// Convert a Rust value to a Firestore value.
pub trait ToFirestoreValue {
    fn to_firestore_value(&self) -> Value;
}

/// Convert a Firestore value to a Rust type.
pub trait FromFirestoreValue: Sized {
    fn from_firestore_value(value: &Value) -> Option<Self>;
}

impl ToFirestoreValue for str {
    fn to_firestore_value(&self) -> Value {
        Value::StringValue(self.to_owned())
    }
}

impl ToFirestoreValue for String {
    fn to_firestore_value(&self) -> Value {
        self.as_str().to_firestore_value()
    }
}

impl<T: ToFirestoreValue + ?Sized> ToFirestoreValue for &T {
    fn to_firestore_value(&self) -> Value {
        (**self).to_firestore_value()
    }
}

impl<T: ToFirestoreValue> ToFirestoreValue for Option<T> {
    fn to_firestore_value(&self) -> Value {
        self.as_ref()
            .map_or(Value::NullValue(()), ToFirestoreValue::to_firestore_value)
    }
}

impl ToFirestoreValue for DateTime<Utc> {
    fn to_firestore_value(&self) -> Value {
        Value::TimestampValue(self.to_rfc3339())
    }
}

impl FromFirestoreValue for String {
    fn from_firestore_value(value: &Value) -> Option<Self> {
        if let Value::StringValue(s) = value {
            Some(s.clone())
        } else {
            None
        }
    }
}

impl FromFirestoreValue for DateTime<Utc> {
    fn from_firestore_value(value: &Value) -> Option<Self> {
        let Value::TimestampValue(raw) = value else {
            return None;
        };
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

/// Unsigned counters travel as decimal strings; doubles are accepted on read.
macro_rules! unsigned_value {
    ($($ty:ty),*) => {$(
        impl ToFirestoreValue for $ty {
            fn to_firestore_value(&self) -> Value {
                Value::IntegerValue(i64::try_from(*self).unwrap_or(i64::MAX).to_string())
            }
        }

        impl FromFirestoreValue for $ty {
            fn from_firestore_value(value: &Value) -> Option<Self> {
                match value {
                    Value::IntegerValue(digits) => digits.parse().ok(),
                    Value::DoubleValue(n) if *n >= 0.0 => Some(*n as $ty),
                    _ => None,
                }
            }
        }
    )*};
}

unsigned_value!(u32, u64);
