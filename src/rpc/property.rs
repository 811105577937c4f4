//! Capture property model and its JSON representation.
//!
//! A page names a property as `{id, type, value?}`. The id is opaque to the
//! broker; the type selects how `value` is read from and written to JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::error::BrokerError;

/// Property value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    None,
    NotApplicable,
    Byte,
    Ulong,
    Array,
    String,
    Version,
    DataSource,
    Enum,
    Object,
}

impl PropertyType {
    pub fn from_raw(raw: i64) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::NotApplicable,
            2 => Self::Byte,
            3 => Self::Ulong,
            4 => Self::Array,
            5 => Self::String,
            6 => Self::Version,
            7 => Self::DataSource,
            8 => Self::Enum,
            9 => Self::Object,
            _ => return None,
        })
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::NotApplicable => 1,
            Self::Byte => 2,
            Self::Ulong => 3,
            Self::Array => 4,
            Self::String => 5,
            Self::Version => 6,
            Self::DataSource => 7,
            Self::Enum => 8,
            Self::Object => 9,
        }
    }

    /// Types this protocol version cannot carry.
    pub fn is_supported(self) -> bool {
        !matches!(self, Self::NotApplicable | Self::Enum | Self::Object)
    }
}

/// Firmware or SDK version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub middle: u32,
    pub minor: u32,
    pub build: u32,
    pub year: i32,
    pub month: i32,
    pub day: i32,
    pub hour: i32,
    pub minute: i32,
}

/// Symbology / data source descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: i32,
    pub status: i32,
    pub name: String,
    pub flags: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(i8),
    Ulong(u64),
    Array(Vec<u8>),
    String(String),
    Version(Version),
    DataSource(DataSource),
}

/// A capture property as exchanged with the capture layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub id: i32,
    pub kind: PropertyType,
    pub value: Option<PropertyValue>,
}

impl Property {
    pub fn new(id: i32, kind: PropertyType) -> Self {
        Self {
            id,
            kind,
            value: None,
        }
    }

    #[cfg(test)]
    pub fn with_value(mut self, value: PropertyValue) -> Self {
        self.value = Some(value);
        self
    }

    /// Read `params.property` for a get request. Only `id` and `type` matter.
    pub fn for_get(params: &Map<String, Value>) -> Result<Self, BrokerError> {
        let object = property_object(params)?;
        let (id, kind) = id_and_type(object)?;
        Ok(Self::new(id, kind))
    }

    /// Read `params.property` for a set request, including its value.
    pub fn for_set(params: &Map<String, Value>) -> Result<Self, BrokerError> {
        let object = property_object(params)?;
        let (id, kind) = id_and_type(object)?;
        if !kind.is_supported() {
            return Err(unsupported(kind));
        }
        let value = match object.get("value") {
            Some(raw) if kind != PropertyType::None => Some(parse_value(kind, raw)?),
            _ => None,
        };
        Ok(Self { id, kind, value })
    }

    /// Result body of a successful get: `{property: {id, type, value}}`.
    pub fn to_result(&self) -> Result<Value, BrokerError> {
        if !self.kind.is_supported() {
            return Err(unsupported(self.kind));
        }
        let value = match (self.kind, &self.value) {
            (PropertyType::None, _) => Value::Null,
            (PropertyType::Byte, Some(PropertyValue::Byte(b))) => json!(b),
            (PropertyType::Ulong, Some(PropertyValue::Ulong(u))) => json!(u),
            (PropertyType::Array, Some(PropertyValue::Array(bytes))) => json!(bytes),
            (PropertyType::String, Some(PropertyValue::String(s))) => json!(s),
            (PropertyType::Version, Some(PropertyValue::Version(v))) => json!(v),
            (PropertyType::DataSource, Some(PropertyValue::DataSource(d))) => json!(d),
            (kind, _) => {
                return Err(BrokerError::MalformedCaptureProperty(format!(
                    "The capture property has type: {}, but the corresponding value is missing",
                    kind.raw()
                )));
            }
        };
        Ok(json!({
            "property": {
                "id": self.id,
                "type": self.kind.raw(),
                "value": value,
            }
        }))
    }
}

fn property_object(params: &Map<String, Value>) -> Result<&Map<String, Value>, BrokerError> {
    params
        .get("property")
        .and_then(Value::as_object)
        .ok_or_else(BrokerError::invalid_parameter)
}

fn id_and_type(object: &Map<String, Value>) -> Result<(i32, PropertyType), BrokerError> {
    let id = object
        .get("id")
        .and_then(Value::as_i64)
        .and_then(|id| i32::try_from(id).ok());
    let kind = object
        .get("type")
        .and_then(Value::as_i64)
        .and_then(PropertyType::from_raw);
    match (id, kind) {
        (Some(id), Some(kind)) => Ok((id, kind)),
        _ => Err(BrokerError::InvalidParameter(
            "JSON dictionary did not contain necessary key-value pairs to construct a capture property"
                .into(),
        )),
    }
}

fn parse_value(kind: PropertyType, raw: &Value) -> Result<PropertyValue, BrokerError> {
    let mismatch = || {
        BrokerError::InvalidParameter(format!(
            "The value from the JSON does not match property type {}: {raw}",
            kind.raw()
        ))
    };
    match kind {
        PropertyType::Byte => raw
            .as_i64()
            .and_then(|v| i8::try_from(v).ok())
            .map(PropertyValue::Byte)
            .ok_or_else(mismatch),
        PropertyType::Ulong => raw.as_u64().map(PropertyValue::Ulong).ok_or_else(mismatch),
        PropertyType::Array => serde_json::from_value::<Vec<u8>>(raw.clone())
            .map(PropertyValue::Array)
            .map_err(|_| mismatch()),
        PropertyType::String => raw
            .as_str()
            .map(|s| PropertyValue::String(s.to_owned()))
            .ok_or_else(mismatch),
        PropertyType::Version => serde_json::from_value::<Version>(raw.clone())
            .map(PropertyValue::Version)
            .map_err(|_| mismatch()),
        PropertyType::DataSource => serde_json::from_value::<DataSource>(raw.clone())
            .map(PropertyValue::DataSource)
            .map_err(|_| mismatch()),
        PropertyType::None | PropertyType::NotApplicable | PropertyType::Enum | PropertyType::Object => {
            Err(unsupported(kind))
        }
    }
}

fn unsupported(kind: PropertyType) -> BrokerError {
    BrokerError::PropertyTypeNotSupported(format!(
        "The capture property has type: {} which is not supported at this time",
        kind.raw()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn get_reads_id_and_type() {
        let p = Property::for_get(&params(json!({"property": {"id": 42, "type": 2}}))).unwrap();
        assert_eq!(p, Property::new(42, PropertyType::Byte));
    }

    #[test]
    fn unknown_type_is_invalid_parameter() {
        let err = Property::for_get(&params(json!({"property": {"id": 1, "type": 77}}))).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidParameter(_)));
    }

    #[test]
    fn missing_property_is_invalid_parameter() {
        let err = Property::for_get(&params(json!({"handle": 5}))).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidParameter(_)));
    }

    #[test]
    fn id_out_of_i32_range_rejected() {
        let err = Property::for_get(&params(json!({"property": {"id": 1u64 << 40, "type": 2}})))
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidParameter(_)));
    }

    #[test]
    fn set_byte_out_of_range_rejected() {
        let err = Property::for_set(&params(json!({"property": {"id": 1, "type": 2, "value": 300}})))
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidParameter(_)));
    }

    #[test]
    fn set_enum_type_not_supported() {
        let err = Property::for_set(&params(json!({"property": {"id": 1, "type": 8, "value": 3}})))
            .unwrap_err();
        assert!(matches!(err, BrokerError::PropertyTypeNotSupported(_)));
    }

    #[test]
    fn set_data_source_reads_all_fields() {
        let p = Property::for_set(&params(json!({"property": {
            "id": 9, "type": 7,
            "value": {"id": 3, "status": 1, "name": "EAN-13", "flags": 0}
        }})))
        .unwrap();
        assert_eq!(
            p.value,
            Some(PropertyValue::DataSource(DataSource {
                id: 3,
                status: 1,
                name: "EAN-13".into(),
                flags: 0,
            }))
        );
    }

    #[test]
    fn set_version_missing_field_rejected() {
        let err = Property::for_set(&params(json!({"property": {
            "id": 9, "type": 6, "value": {"major": 1}
        }})))
        .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidParameter(_)));
    }

    #[test]
    fn set_without_value_is_allowed() {
        let p = Property::for_set(&params(json!({"property": {"id": 4, "type": 3}}))).unwrap();
        assert_eq!(p.value, None);
    }

    #[test]
    fn result_carries_array_as_bytes() {
        let p = Property::new(5, PropertyType::Array).with_value(PropertyValue::Array(vec![1, 2, 255]));
        assert_eq!(
            p.to_result().unwrap(),
            json!({"property": {"id": 5, "type": 4, "value": [1, 2, 255]}})
        );
    }

    #[test]
    fn result_without_value_is_malformed() {
        let p = Property::new(5, PropertyType::Version);
        assert!(matches!(
            p.to_result().unwrap_err(),
            BrokerError::MalformedCaptureProperty(_)
        ));
    }

    #[test]
    fn result_with_mismatched_value_is_malformed() {
        let p = Property::new(5, PropertyType::String).with_value(PropertyValue::Byte(1));
        assert!(matches!(
            p.to_result().unwrap_err(),
            BrokerError::MalformedCaptureProperty(_)
        ));
    }

    #[test]
    fn result_object_type_not_supported() {
        let p = Property::new(5, PropertyType::Object);
        assert!(matches!(
            p.to_result().unwrap_err(),
            BrokerError::PropertyTypeNotSupported(_)
        ));
    }
}
