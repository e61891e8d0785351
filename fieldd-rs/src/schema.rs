/* Device schema: scalar types, parameter descriptors and the device
 * type table loaded from the sensor schema file.
 *
 * Every device type declares an ordered parameter list; the position
 * of a parameter is its index in protocol bitmasks, so order in the
 * schema file is significant. At most 16 parameters fit the 16-bit
 * masks. */

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RuntimeError;

pub const MAX_PARAMETERS: usize = 16;

/* ---------------------------------------------------------------------- */
/* Scalar types and values                                                */
/* ---------------------------------------------------------------------- */

/* The wire scalar types. The C-style aliases match schema files
 * written for the sensor firmware. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "u8", alias = "uint8_t")]
    U8,
    #[serde(rename = "i8", alias = "int8_t")]
    I8,
    #[serde(rename = "u16", alias = "uint16_t")]
    U16,
    #[serde(rename = "i16", alias = "int16_t")]
    I16,
    #[serde(rename = "u32", alias = "uint32_t")]
    U32,
    #[serde(rename = "i32", alias = "int32_t")]
    I32,
    #[serde(rename = "u64", alias = "uint64_t")]
    U64,
    #[serde(rename = "i64", alias = "int64_t")]
    I64,
    #[serde(rename = "f32", alias = "float")]
    F32,
    #[serde(rename = "f64", alias = "double")]
    F64,
}

impl ScalarType {
    /* Serialized size in bytes. */
    pub fn size(self) -> usize {
        match self {
            ScalarType::Bool | ScalarType::U8 | ScalarType::I8 => 1,
            ScalarType::U16 | ScalarType::I16 => 2,
            ScalarType::U32 | ScalarType::I32 | ScalarType::F32 => 4,
            ScalarType::U64 | ScalarType::I64 | ScalarType::F64 => 8,
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, ScalarType::Bool)
    }

    /* The type-zero value used to initialize registry slots. */
    pub fn zero(self) -> Value {
        match self {
            ScalarType::Bool => Value::Bool(false),
            ScalarType::U8 => Value::U8(0),
            ScalarType::I8 => Value::I8(0),
            ScalarType::U16 => Value::U16(0),
            ScalarType::I16 => Value::I16(0),
            ScalarType::U32 => Value::U32(0),
            ScalarType::I32 => Value::I32(0),
            ScalarType::U64 => Value::U64(0),
            ScalarType::I64 => Value::I64(0),
            ScalarType::F32 => Value::F32(0.0),
            ScalarType::F64 => Value::F64(0.0),
        }
    }

    /* Decode one little-endian value from the front of `bytes`. */
    pub fn decode(self, bytes: &[u8]) -> Option<Value> {
        if bytes.len() < self.size() {
            return None;
        }
        let value = match self {
            ScalarType::Bool => Value::Bool(bytes[0] != 0),
            ScalarType::U8 => Value::U8(bytes[0]),
            ScalarType::I8 => Value::I8(bytes[0] as i8),
            ScalarType::U16 => Value::U16(u16::from_le_bytes([bytes[0], bytes[1]])),
            ScalarType::I16 => Value::I16(i16::from_le_bytes([bytes[0], bytes[1]])),
            ScalarType::U32 => Value::U32(u32::from_le_bytes(bytes[..4].try_into().ok()?)),
            ScalarType::I32 => Value::I32(i32::from_le_bytes(bytes[..4].try_into().ok()?)),
            ScalarType::U64 => Value::U64(u64::from_le_bytes(bytes[..8].try_into().ok()?)),
            ScalarType::I64 => Value::I64(i64::from_le_bytes(bytes[..8].try_into().ok()?)),
            ScalarType::F32 => Value::F32(f32::from_le_bytes(bytes[..4].try_into().ok()?)),
            ScalarType::F64 => Value::F64(f64::from_le_bytes(bytes[..8].try_into().ok()?)),
        };
        Some(value)
    }

    /* Coerce an untyped parameter value (from RPC or a schema file)
     * into this scalar type. */
    pub fn coerce(self, value: ParamValue) -> Result<Value, String> {
        fn int_of(value: ParamValue) -> Option<i128> {
            match value {
                ParamValue::Int(v) => Some(v as i128),
                ParamValue::UInt(v) => Some(v as i128),
                _ => None,
            }
        }
        fn narrowed<T: TryFrom<i128>>(value: ParamValue) -> Result<T, String> {
            let raw = int_of(value).ok_or("expected an integer")?;
            T::try_from(raw).map_err(|_| format!("{raw} does not fit the parameter type"))
        }

        match self {
            ScalarType::Bool => match value {
                ParamValue::Bool(v) => Ok(Value::Bool(v)),
                _ => Err("expected a boolean".into()),
            },
            ScalarType::U8 => narrowed(value).map(Value::U8),
            ScalarType::I8 => narrowed(value).map(Value::I8),
            ScalarType::U16 => narrowed(value).map(Value::U16),
            ScalarType::I16 => narrowed(value).map(Value::I16),
            ScalarType::U32 => narrowed(value).map(Value::U32),
            ScalarType::I32 => narrowed(value).map(Value::I32),
            ScalarType::U64 => match value {
                ParamValue::UInt(v) => Ok(Value::U64(v)),
                ParamValue::Int(v) if v >= 0 => Ok(Value::U64(v as u64)),
                ParamValue::Int(_) => Err("negative value for unsigned parameter".into()),
                _ => Err("expected an integer".into()),
            },
            ScalarType::I64 => match value {
                ParamValue::Int(v) => Ok(Value::I64(v)),
                ParamValue::UInt(v) => i64::try_from(v)
                    .map(Value::I64)
                    .map_err(|_| "value does not fit the parameter type".into()),
                _ => Err("expected an integer".into()),
            },
            ScalarType::F32 => match value {
                ParamValue::Float(v) => Ok(Value::F32(v as f32)),
                ParamValue::Int(v) => Ok(Value::F32(v as f32)),
                ParamValue::UInt(v) => Ok(Value::F32(v as f32)),
                _ => Err("expected a number".into()),
            },
            ScalarType::F64 => match value {
                ParamValue::Float(v) => Ok(Value::F64(v)),
                ParamValue::Int(v) => Ok(Value::F64(v as f64)),
                ParamValue::UInt(v) => Ok(Value::F64(v as f64)),
                _ => Err("expected a number".into()),
            },
        }
    }
}

/* A typed parameter value as it exists on the wire and in the
 * registry. */
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub fn scalar_type(self) -> ScalarType {
        match self {
            Value::Bool(_) => ScalarType::Bool,
            Value::U8(_) => ScalarType::U8,
            Value::I8(_) => ScalarType::I8,
            Value::U16(_) => ScalarType::U16,
            Value::I16(_) => ScalarType::I16,
            Value::U32(_) => ScalarType::U32,
            Value::I32(_) => ScalarType::I32,
            Value::U64(_) => ScalarType::U64,
            Value::I64(_) => ScalarType::I64,
            Value::F32(_) => ScalarType::F32,
            Value::F64(_) => ScalarType::F64,
        }
    }

    /* Append this value little-endian. */
    pub fn encode_to(self, out: &mut Vec<u8>) {
        match self {
            Value::Bool(v) => out.push(v as u8),
            Value::U8(v) => out.push(v),
            Value::I8(v) => out.push(v as u8),
            Value::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    /* Numeric view used for bounds checks. `None` for booleans. */
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Value::Bool(_) => None,
            Value::U8(v) => Some(v as f64),
            Value::I8(v) => Some(v as f64),
            Value::U16(v) => Some(v as f64),
            Value::I16(v) => Some(v as f64),
            Value::U32(v) => Some(v as f64),
            Value::I32(v) => Some(v as f64),
            Value::U64(v) => Some(v as f64),
            Value::I64(v) => Some(v as f64),
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
        }
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(v) => ParamValue::Bool(v),
            Value::U8(v) => ParamValue::UInt(v as u64),
            Value::I8(v) => ParamValue::Int(v as i64),
            Value::U16(v) => ParamValue::UInt(v as u64),
            Value::I16(v) => ParamValue::Int(v as i64),
            Value::U32(v) => ParamValue::UInt(v as u64),
            Value::I32(v) => ParamValue::Int(v as i64),
            Value::U64(v) => ParamValue::UInt(v),
            Value::I64(v) => ParamValue::Int(v),
            Value::F32(v) => ParamValue::Float(v as f64),
            Value::F64(v) => ParamValue::Float(v),
        }
    }
}

/* An untyped parameter value as carried by RPC requests and schema
 * files. Coerced into a `Value` against the declared scalar type. */
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
}

/* ---------------------------------------------------------------------- */
/* Parameter and device type descriptors                                  */
/* ---------------------------------------------------------------------- */

#[derive(Debug, Clone, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub scalar_type: ScalarType,
    #[serde(default = "lower_default")]
    pub lower: f64,
    #[serde(default = "upper_default")]
    pub upper: f64,
    #[serde(default = "readable_default", alias = "read")]
    pub readable: bool,
    #[serde(default, alias = "write")]
    pub writable: bool,
    #[serde(default)]
    pub choices: Vec<ParamValue>,
    #[serde(default)]
    pub default: Option<ParamValue>,
}

fn lower_default() -> f64 {
    f64::NEG_INFINITY
}

fn upper_default() -> f64 {
    f64::INFINITY
}

fn readable_default() -> bool {
    true
}

impl Parameter {
    /* The slot's initial value: the declared default, else type-zero. */
    pub fn initial_value(&self) -> Value {
        self.default
            .and_then(|default| self.scalar_type.coerce(default).ok())
            .unwrap_or_else(|| self.scalar_type.zero())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceType {
    pub id: u16,
    pub name: String,
    #[serde(default)]
    pub params: Vec<Parameter>,
}

impl DeviceType {
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|param| param.name == name)
    }

    pub fn param(&self, index: usize) -> Option<&Parameter> {
        self.params.get(index)
    }

    /* Encode a set of parameter names into the protocol bitmask. */
    pub fn encode_params(&self, names: &[String]) -> Result<u16, RuntimeError> {
        let mut mask = 0u16;
        for name in names {
            let index = self.param_index(name).ok_or_else(|| {
                RuntimeError::validation(name.clone(), format!("no such parameter on {}", self.name))
            })?;
            mask |= 1 << index;
        }
        Ok(mask)
    }

    /* Decode a bitmask into parameter indices, ascending. Bits beyond
     * the declared parameter list are ignored. */
    pub fn decode_params(&self, mask: u16) -> Vec<usize> {
        (0..MAX_PARAMETERS.min(self.params.len()))
            .filter(|&index| mask & (1 << index) != 0)
            .collect()
    }
}

/* The device type table: schema file entries keyed by type id and by
 * name. */
#[derive(Debug, Default)]
pub struct DeviceSchema {
    by_id: HashMap<u16, Arc<DeviceType>>,
    by_name: HashMap<String, u16>,
}

impl DeviceSchema {
    pub fn from_types(types: Vec<DeviceType>) -> Result<Self, RuntimeError> {
        let mut schema = DeviceSchema::default();
        for device in types {
            if device.params.len() > MAX_PARAMETERS {
                return Err(RuntimeError::config(
                    device.name,
                    format!("more than {MAX_PARAMETERS} parameters"),
                ));
            }
            schema.by_name.insert(device.name.clone(), device.id);
            if schema.by_id.insert(device.id, Arc::new(device)).is_some() {
                warn!("duplicate device type id in schema, keeping the last entry");
            }
        }
        Ok(schema)
    }

    /* Load the schema from a JSON file: a top-level array of device
     * type entries. Unreadable or malformed schemas are fatal. */
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        check_json_extension(path)?;
        let text = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::config(path.display().to_string(), e.to_string()))?;
        let types: Vec<DeviceType> = serde_json::from_str(&text)
            .map_err(|e| RuntimeError::config(path.display().to_string(), e.to_string()))?;
        Self::from_types(types)
    }

    pub fn get(&self, id: u16) -> Option<Arc<DeviceType>> {
        self.by_id.get(&id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<DeviceType>> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }
}

fn check_json_extension(path: &Path) -> Result<(), RuntimeError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(()),
        _ => Err(RuntimeError::config(
            path.display().to_string(),
            "configuration file format not recognized (expected .json)",
        )),
    }
}

/* ---------------------------------------------------------------------- */
/* UIDs                                                                   */
/* ---------------------------------------------------------------------- */

/* The 96-bit sensor identifier:
 * `device_type (16) | year_offset (8) | serial (64)`. */
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub u128);

impl Uid {
    pub fn new(device_type: u16, year: u8, serial: u64) -> Self {
        Uid(((device_type as u128) << 72) | ((year as u128) << 64) | serial as u128)
    }

    pub fn device_type(self) -> u16 {
        (self.0 >> 72) as u16
    }

    pub fn year(self) -> u8 {
        ((self.0 >> 64) & 0xff) as u8
    }

    pub fn serial(self) -> u64 {
        self.0 as u64
    }

    /* Hex form used in the names file and over RPC. */
    pub fn to_hex(self) -> String {
        format!("{:024x}", self.0)
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        u128::from_str_radix(text, 16).ok().map(Uid)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Uid({:#06x}/{}/{:#018x})",
            self.device_type(),
            self.year(),
            self.serial()
        )
    }
}

/* ---------------------------------------------------------------------- */
/* Device names file                                                      */
/* ---------------------------------------------------------------------- */

/* Human-friendly sensor names: a JSON object mapping hex UIDs to
 * names, rewritten on every change. */
pub fn load_device_names(path: &Path) -> Result<HashMap<String, String>, RuntimeError> {
    check_json_extension(path)?;
    let text = std::fs::read_to_string(path)
        .map_err(|e| RuntimeError::config(path.display().to_string(), e.to_string()))?;
    serde_json::from_str(&text)
        .map_err(|e| RuntimeError::config(path.display().to_string(), e.to_string()))
}

pub fn save_device_names(path: &Path, names: &HashMap<String, String>) -> Result<(), RuntimeError> {
    let text = serde_json::to_string_pretty(names)
        .map_err(|e| RuntimeError::config(path.display().to_string(), e.to_string()))?;
    std::fs::write(path, text)
        .map_err(|e| RuntimeError::config(path.display().to_string(), e.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn test_schema() -> DeviceSchema {
        let json = r#"[
            {
                "id": 13,
                "name": "YogiBear",
                "params": [
                    {"name": "duty_cycle", "type": "f32", "lower": -1.0, "upper": 1.0,
                     "readable": true, "writable": true},
                    {"name": "enc_pos", "type": "f64"},
                    {"name": "pid_enabled", "type": "bool", "writable": true}
                ]
            },
            {
                "id": 0,
                "name": "LimitSwitch",
                "params": [
                    {"name": "switch0", "type": "bool"},
                    {"name": "switch1", "type": "bool"}
                ]
            },
            {
                "id": 7,
                "name": "RFID",
                "params": [
                    {"name": "mode", "type": "u8", "writable": true, "choices": [0, 1, 2]}
                ]
            }
        ]"#;
        let types: Vec<DeviceType> = serde_json::from_str(json).unwrap();
        DeviceSchema::from_types(types).unwrap()
    }

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(ScalarType::Bool.size(), 1);
        assert_eq!(ScalarType::U16.size(), 2);
        assert_eq!(ScalarType::F32.size(), 4);
        assert_eq!(ScalarType::I64.size(), 8);
    }

    #[test]
    fn test_value_encode_decode_all_types() {
        let values = [
            Value::Bool(true),
            Value::U8(0xfe),
            Value::I8(-5),
            Value::U16(0xbeef),
            Value::I16(-12345),
            Value::U32(0xdeadbeef),
            Value::I32(-1_000_000),
            Value::U64(u64::MAX - 1),
            Value::I64(i64::MIN + 1),
            Value::F32(0.5),
            Value::F64(-2.25),
        ];
        for value in values {
            let mut buf = Vec::new();
            value.encode_to(&mut buf);
            assert_eq!(buf.len(), value.scalar_type().size());
            assert_eq!(value.scalar_type().decode(&buf), Some(value));
        }
    }

    #[test]
    fn test_value_little_endian() {
        let mut buf = Vec::new();
        Value::F32(0.5).encode_to(&mut buf);
        assert_eq!(buf, vec![0x00, 0x00, 0x00, 0x3f]);
        buf.clear();
        Value::U16(0x1234).encode_to(&mut buf);
        assert_eq!(buf, vec![0x34, 0x12]);
    }

    #[test]
    fn test_coerce_bounds_of_type() {
        assert!(ScalarType::U8.coerce(ParamValue::Int(255)).is_ok());
        assert!(ScalarType::U8.coerce(ParamValue::Int(256)).is_err());
        assert!(ScalarType::U8.coerce(ParamValue::Int(-1)).is_err());
        assert!(ScalarType::Bool.coerce(ParamValue::Int(1)).is_err());
        assert_eq!(
            ScalarType::F32.coerce(ParamValue::Float(0.5)),
            Ok(Value::F32(0.5))
        );
    }

    #[test]
    fn test_uid_packing() {
        let uid = Uid::new(0x000d, 0x00, 0x0123_4567_89ab_cdef);
        assert_eq!(uid.device_type(), 0x000d);
        assert_eq!(uid.year(), 0);
        assert_eq!(uid.serial(), 0x0123_4567_89ab_cdef);
        assert_eq!(uid.0, (0x000d_u128 << 72) | 0x0123_4567_89ab_cdef);
        assert_eq!(Uid::from_hex(&uid.to_hex()), Some(uid));
    }

    #[test]
    fn test_schema_lookup_and_masks() {
        let schema = test_schema();
        let yogi = schema.get(13).unwrap();
        assert_eq!(yogi.name, "YogiBear");
        assert_eq!(yogi.param_index("duty_cycle"), Some(0));
        assert_eq!(yogi.param_index("enc_pos"), Some(1));
        assert_eq!(
            yogi.encode_params(&["duty_cycle".into(), "pid_enabled".into()])
                .unwrap(),
            0b101
        );
        assert_eq!(yogi.decode_params(0b101), vec![0, 2]);
        /* Bits past the parameter list are ignored. */
        assert_eq!(yogi.decode_params(0xfff8), Vec::<usize>::new());
        assert!(schema.get_by_name("LimitSwitch").is_some());
    }

    #[test]
    fn test_schema_load_rejects_bad_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "[]").unwrap();
        assert!(matches!(
            DeviceSchema::load(file.path()),
            Err(RuntimeError::Config { .. })
        ));
    }

    #[test]
    fn test_schema_load_rejects_malformed_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, "{{not json").unwrap();
        assert!(matches!(
            DeviceSchema::load(file.path()),
            Err(RuntimeError::Config { .. })
        ));
    }

    #[test]
    fn test_device_names_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        let mut names = HashMap::new();
        names.insert(Uid::new(13, 0, 42).to_hex(), "left_motor".to_string());
        save_device_names(&path, &names).unwrap();
        assert_eq!(load_device_names(&path).unwrap(), names);
    }
}
