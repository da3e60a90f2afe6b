// ABOUTME: Typed SQL value codec for the Granite TCP protocol
// ABOUTME: One-byte tag plus tag-specific body; LOB references carry a MAC instead of data

use crate::error::ProtocolError;
use crate::transfer::{TransferIn, TransferOut, lob_mac, verify_lob_mac};
use num_enum::TryFromPrimitive;

/// Wire tag of a typed value. Part of the ABI.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeTag {
    Null = 0,
    Boolean = 1,
    Int = 2,
    Long = 3,
    Double = 4,
    Decimal = 5,
    String = 6,
    Bytes = 7,
    Array = 8,
    Blob = 9,
    Clob = 10,
}

/// A SQL value as it crosses the wire.
///
/// Decimals travel in their canonical string form; doubles as raw IEEE
/// bits. LOBs travel by reference only; the peer streams the data later
/// through `COMMAND_READ_LOB`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Lob(LobRef),
}

/// Reference to a server-side large object.
///
/// The `hmac` field is stamped by the writing codec under the connection
/// key; a default of all zeroes is fine for values produced by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct LobRef {
    pub tag: TypeTag,
    pub length: i64,
    pub lob_id: i64,
    pub hmac: [u8; 32],
    pub precision: i64,
}

impl LobRef {
    pub fn blob(lob_id: i64, length: i64) -> Self {
        LobRef {
            tag: TypeTag::Blob,
            length,
            lob_id,
            hmac: [0; 32],
            precision: length,
        }
    }

    pub fn clob(lob_id: i64, length: i64) -> Self {
        LobRef {
            tag: TypeTag::Clob,
            length,
            lob_id,
            hmac: [0; 32],
            precision: length,
        }
    }
}

impl Value {
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Boolean(_) => TypeTag::Boolean,
            Value::Int(_) => TypeTag::Int,
            Value::Long(_) => TypeTag::Long,
            Value::Double(_) => TypeTag::Double,
            Value::Decimal(_) => TypeTag::Decimal,
            Value::String(_) => TypeTag::String,
            Value::Bytes(_) => TypeTag::Bytes,
            Value::Array(_) => TypeTag::Array,
            Value::Lob(lob) => lob.tag,
        }
    }
}

impl TransferOut {
    /// Write a typed value. When `mac_key` is present (server role) LOB
    /// references are stamped with a fresh MAC; otherwise the stored MAC is
    /// echoed unchanged (client role).
    pub fn write_value(&mut self, value: &Value, mac_key: Option<&[u8]>) {
        self.write_raw(&[value.tag() as u8]);
        match value {
            Value::Null => {}
            Value::Boolean(v) => self.write_bool(*v),
            Value::Int(v) => self.write_i32(*v),
            Value::Long(v) => self.write_i64(*v),
            Value::Double(v) => self.write_i64(v.to_bits() as i64),
            Value::Decimal(v) => self.write_string(Some(v)),
            Value::String(v) => self.write_string(Some(v)),
            Value::Bytes(v) => self.write_buffer(v),
            Value::Array(items) => {
                self.write_i32(items.len() as i32);
                for item in items {
                    self.write_value(item, mac_key);
                }
            }
            Value::Lob(lob) => {
                let mac = match mac_key {
                    Some(key) => lob_mac(key, lob.lob_id),
                    None => lob.hmac,
                };
                self.write_i64(lob.length);
                self.write_i64(lob.lob_id);
                self.write_raw(&mac);
                self.write_i64(lob.precision);
            }
        }
    }
}

impl TransferIn<'_> {
    /// Read a typed value. When `mac_key` is present the MAC of incoming
    /// LOB references is verified against the connection key.
    pub fn read_value(&mut self, mac_key: Option<&[u8]>) -> Result<Value, ProtocolError> {
        let raw = self.read_u8()?;
        let tag = TypeTag::try_from(raw).map_err(|_| ProtocolError::InvalidTag(raw))?;
        let value = match tag {
            TypeTag::Null => Value::Null,
            TypeTag::Boolean => Value::Boolean(self.read_bool()?),
            TypeTag::Int => Value::Int(self.read_i32()?),
            TypeTag::Long => Value::Long(self.read_i64()?),
            TypeTag::Double => Value::Double(f64::from_bits(self.read_i64()? as u64)),
            TypeTag::Decimal => Value::Decimal(self.read_string()?.unwrap_or_default()),
            TypeTag::String => Value::String(self.read_string()?.unwrap_or_default()),
            TypeTag::Bytes => Value::Bytes(self.read_buffer()?),
            TypeTag::Array => {
                let n = self.read_i32()?;
                if n < 0 {
                    return Err(ProtocolError::NegativeLength(n, "array"));
                }
                let mut items = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    items.push(self.read_value(mac_key)?);
                }
                Value::Array(items)
            }
            TypeTag::Blob | TypeTag::Clob => {
                let length = self.read_i64()?;
                let lob_id = self.read_i64()?;
                let mut hmac = [0u8; 32];
                hmac.copy_from_slice(&self.read_raw(32)?);
                let precision = self.read_i64()?;
                if let Some(key) = mac_key {
                    verify_lob_mac(key, lob_id, &hmac)?;
                }
                Value::Lob(LobRef {
                    tag,
                    length,
                    lob_id,
                    hmac,
                    precision,
                })
            }
        };
        Ok(value)
    }
}
