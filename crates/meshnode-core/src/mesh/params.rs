//! Remote parameter protocol
//!
//! Parameters are addressed on the wire by a one-byte id. The id resolves
//! either to a dotted configuration path, or to a `direct.<module>.<method>`
//! path that invokes a module action instead of touching configuration.
//!
//! ## Payload layout (GET_PARAM response, SET_PARAM request)
//!
//! ```text
//! ┌───────────────┬────────────┬──────────────────────────┐
//! │ Param ID (1B) │ DType (1B) │ Value (dtype width, BE)  │
//! └───────────────┴────────────┴──────────────────────────┘
//! ```
//!
//! | Tag  | DType   | Width |
//! |------|---------|-------|
//! | 0x01 | BOOL    | 1     |
//! | 0x02 | UINT32  | 4     |
//! | 0x03 | SINT32  | 4     |
//! | 0x04 | FLOAT32 | 4     |

use crate::error::{NodeError, Result};
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Prefix marking a path as a module action
pub const DIRECT_PREFIX: &str = "direct.";

/// Wire data type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ParamType {
    /// One byte, non-zero is true
    Bool = 0x01,
    /// Unsigned 32-bit
    Uint32 = 0x02,
    /// Signed 32-bit
    Sint32 = 0x03,
    /// IEEE-754 single precision
    Float32 = 0x04,
}

impl ParamType {
    /// Create from tag byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(ParamType::Bool),
            0x02 => Some(ParamType::Uint32),
            0x03 => Some(ParamType::Sint32),
            0x04 => Some(ParamType::Float32),
            _ => None,
        }
    }

    /// Encoded value width in bytes
    pub fn width(&self) -> usize {
        match self {
            ParamType::Bool => 1,
            _ => 4,
        }
    }
}

/// A typed parameter value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    /// BOOL
    Bool(bool),
    /// UINT32
    Uint32(u32),
    /// SINT32
    Sint32(i32),
    /// FLOAT32
    Float32(f32),
}

impl ParamValue {
    /// Wire type of this value
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::Bool(_) => ParamType::Bool,
            ParamValue::Uint32(_) => ParamType::Uint32,
            ParamValue::Sint32(_) => ParamType::Sint32,
            ParamValue::Float32(_) => ParamType::Float32,
        }
    }

    /// Big-endian value bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = [0u8; 4];
        match self {
            ParamValue::Bool(b) => return vec![u8::from(*b)],
            ParamValue::Uint32(v) => BigEndian::write_u32(&mut buf, *v),
            ParamValue::Sint32(v) => BigEndian::write_i32(&mut buf, *v),
            ParamValue::Float32(v) => BigEndian::write_f32(&mut buf, *v),
        }
        buf.to_vec()
    }

    /// Decode value bytes for a dtype tag.
    ///
    /// BOOL reads the first byte; the 32-bit types need exactly four bytes.
    pub fn decode(dtype: u8, bytes: &[u8]) -> Option<Self> {
        match ParamType::from_byte(dtype)? {
            ParamType::Bool => bytes.first().map(|b| ParamValue::Bool(*b > 0)),
            _ if bytes.len() != 4 => None,
            ParamType::Uint32 => Some(ParamValue::Uint32(BigEndian::read_u32(bytes))),
            ParamType::Sint32 => Some(ParamValue::Sint32(BigEndian::read_i32(bytes))),
            ParamType::Float32 => Some(ParamValue::Float32(BigEndian::read_f32(bytes))),
        }
    }

    /// Map a configuration value onto a wire type.
    ///
    /// Booleans and floats map directly; integers only when they fit UINT32.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(ParamValue::Bool(*b)),
            Value::Number(n) if n.is_f64() => n.as_f64().map(|f| ParamValue::Float32(f as f32)),
            Value::Number(n) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map(ParamValue::Uint32),
            _ => None,
        }
    }

    /// Configuration representation
    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Bool(b) => Value::Bool(*b),
            ParamValue::Uint32(v) => Value::from(*v),
            ParamValue::Sint32(v) => Value::from(*v),
            ParamValue::Float32(v) => Value::from(f64::from(*v)),
        }
    }

    /// Truthiness used by boolean actions
    pub fn is_truthy(&self) -> bool {
        match self {
            ParamValue::Bool(b) => *b,
            ParamValue::Uint32(v) => *v != 0,
            ParamValue::Sint32(v) => *v != 0,
            ParamValue::Float32(v) => *v != 0.0,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Uint32(v) => write!(f, "{v}"),
            ParamValue::Sint32(v) => write!(f, "{v}"),
            ParamValue::Float32(v) => write!(f, "{v}"),
        }
    }
}

/// `{param_id, dtype, value}` payload
pub fn encode_param(param_id: u8, value: &ParamValue) -> Vec<u8> {
    let mut payload = vec![param_id, value.param_type() as u8];
    payload.extend(value.encode());
    payload
}

/// Parse a `{param_id, dtype, value}` payload
pub fn decode_param(payload: &[u8]) -> Option<(u8, ParamValue)> {
    if payload.len() < 3 {
        return None;
    }
    let value = ParamValue::decode(payload[1], &payload[2..])?;
    Some((payload[0], value))
}

/// What a parameter id resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamTarget<'a> {
    /// Dotted configuration path
    Config(&'a str),
    /// Module action
    Direct {
        /// Module registry name
        module: &'a str,
        /// Action name
        method: &'a str,
    },
}

/// Bijective map between parameter ids and paths
#[derive(Debug, Clone)]
pub struct ParameterMap {
    by_id: BTreeMap<u8, String>,
    by_path: HashMap<String, u8>,
}

impl ParameterMap {
    /// Build from `(id, path)` pairs; duplicate ids or paths are rejected
    pub fn new<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u8, S)>,
        S: Into<String>,
    {
        let mut by_id = BTreeMap::new();
        let mut by_path = HashMap::new();
        for (id, path) in entries {
            let path = path.into();
            if by_id.contains_key(&id) {
                return Err(NodeError::DuplicateParameter(format!("id 0x{id:02x}")));
            }
            if by_path.insert(path.clone(), id).is_some() {
                return Err(NodeError::DuplicateParameter(path));
            }
            by_id.insert(id, path);
        }
        Ok(Self { by_id, by_path })
    }

    /// Path for an id
    pub fn path(&self, id: u8) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Id for a path
    pub fn id(&self, path: &str) -> Option<u8> {
        self.by_path.get(path).copied()
    }

    /// Resolve an id to its target
    pub fn target(&self, id: u8) -> Option<ParamTarget<'_>> {
        let path = self.path(id)?;
        match path.strip_prefix(DIRECT_PREFIX) {
            Some(rest) => {
                let (module, method) = rest.split_once('.')?;
                Some(ParamTarget::Direct { module, method })
            }
            None => Some(ParamTarget::Config(path)),
        }
    }

    /// Entries ordered by id
    pub fn iter(&self) -> impl Iterator<Item = (u8, &str)> {
        self.by_id.iter().map(|(id, path)| (*id, path.as_str()))
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for ParameterMap {
    /// Stock parameter table.
    ///
    /// Ids below 0x80 touch module configuration, 0x80..0xA0 hardware
    /// configuration, 0xA0 and above are module actions.
    fn default() -> Self {
        let entries = [
            (0x01, "MODULE_CONFIGURATION.data_reporter.report_interval_s"),
            (0x02, "MODULE_CONFIGURATION.display.backlight_timeout_s"),
            (0x03, "MODULE_CONFIGURATION.pressure_1.V_TO_MPA_SLOPE"),
            (0x81, "HARDWARE_CONFIGURATION.uart.1.baudrate"),
            (0xA1, "direct.display.set_backlight"),
        ];
        let mut by_id = BTreeMap::new();
        let mut by_path = HashMap::new();
        for (id, path) in entries {
            by_id.insert(id, path.to_string());
            by_path.insert(path.to_string(), id);
        }
        Self { by_id, by_path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_float_roundtrip() {
        let payload = encode_param(0x03, &ParamValue::Float32(3.5));
        assert_eq!(payload, vec![0x03, 0x04, 0x40, 0x60, 0x00, 0x00]);
        assert_eq!(decode_param(&payload), Some((0x03, ParamValue::Float32(3.5))));
    }

    #[test]
    fn test_value_widths() {
        assert_eq!(ParamValue::Bool(true).encode(), vec![1]);
        assert_eq!(ParamValue::Uint32(300).encode(), vec![0, 0, 1, 44]);
        assert_eq!(ParamValue::Sint32(-2).encode(), vec![0xff, 0xff, 0xff, 0xfe]);
        for dtype in [ParamType::Bool, ParamType::Uint32, ParamType::Sint32, ParamType::Float32] {
            assert_eq!(ParamType::from_byte(dtype as u8), Some(dtype));
        }
        assert_eq!(ParamType::Bool.width(), 1);
        assert_eq!(ParamType::Float32.width(), 4);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // Unknown dtype
        assert_eq!(ParamValue::decode(0x09, &[0, 0, 0, 1]), None);
        // Short and long 32-bit values
        assert_eq!(ParamValue::decode(0x02, &[0, 1]), None);
        assert_eq!(ParamValue::decode(0x02, &[0, 0, 0, 1, 0]), None);
        // BOOL needs one byte
        assert_eq!(ParamValue::decode(0x01, &[]), None);
        assert_eq!(ParamValue::decode(0x01, &[7]), Some(ParamValue::Bool(true)));
        assert_eq!(decode_param(&[0x01, 0x02]), None);
    }

    #[test]
    fn test_from_json() {
        assert_eq!(ParamValue::from_json(&json!(true)), Some(ParamValue::Bool(true)));
        assert_eq!(ParamValue::from_json(&json!(30)), Some(ParamValue::Uint32(30)));
        assert_eq!(ParamValue::from_json(&json!(12.5)), Some(ParamValue::Float32(12.5)));
        assert_eq!(ParamValue::from_json(&json!(-4)), None);
        assert_eq!(ParamValue::from_json(&json!(5_000_000_000u64)), None);
        assert_eq!(ParamValue::from_json(&json!("text")), None);
        assert_eq!(ParamValue::from_json(&Value::Null), None);
    }

    #[test]
    fn test_to_json() {
        assert_eq!(ParamValue::Float32(3.5).to_json(), json!(3.5));
        assert_eq!(ParamValue::Sint32(-7).to_json(), json!(-7));
        assert_eq!(ParamValue::Uint32(9600).to_json(), json!(9600));
    }

    #[test]
    fn test_truthiness() {
        assert!(ParamValue::Uint32(1).is_truthy());
        assert!(!ParamValue::Sint32(0).is_truthy());
        assert!(ParamValue::Float32(0.5).is_truthy());
        assert!(!ParamValue::Bool(false).is_truthy());
    }

    #[test]
    fn test_default_map() {
        let map = ParameterMap::default();
        assert_eq!(map.len(), 5);
        assert_eq!(map.id("HARDWARE_CONFIGURATION.uart.1.baudrate"), Some(0x81));
        assert_eq!(
            map.target(0x01),
            Some(ParamTarget::Config("MODULE_CONFIGURATION.data_reporter.report_interval_s"))
        );
        assert_eq!(
            map.target(0xA1),
            Some(ParamTarget::Direct {
                module: "display",
                method: "set_backlight"
            })
        );
        assert_eq!(map.target(0x42), None);

        let ids: Vec<u8> = map.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0x01, 0x02, 0x03, 0x81, 0xA1]);
    }

    #[test]
    fn test_map_is_bijective() {
        assert!(ParameterMap::new([(1, "a.b"), (2, "a.c")]).is_ok());
        assert!(matches!(
            ParameterMap::new([(1, "a.b"), (1, "a.c")]),
            Err(NodeError::DuplicateParameter(_))
        ));
        assert!(matches!(
            ParameterMap::new([(1, "a.b"), (2, "a.b")]),
            Err(NodeError::DuplicateParameter(_))
        ));
    }
}
