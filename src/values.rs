//! Seed types, public values, and the owned/unowned element storage behind
//! every leaf.

use core::ffi::c_void;
use core::mem::size_of;

use crate::error::*;

/// The element-type tag of a leaf.
///
/// A small set of scalar types is owned by the store. Every value at or
/// above [`SeedType::FIRST_PTR_TYPE`] is pointer-like: the store keeps the
/// pointer but never owns, dereferences, or frees the pointee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeedType(pub u32);

impl SeedType {
  /// Returned by metadata queries on absent leaves.
  pub const INVALID: SeedType = SeedType(0);
  pub const INT: SeedType = SeedType(1);
  pub const DOUBLE: SeedType = SeedType(2);
  pub const BOOLEAN: SeedType = SeedType(3);
  pub const STRING: SeedType = SeedType(4);
  pub const INT64: SeedType = SeedType(5);

  /// First pointer-like seed type.
  pub const FIRST_PTR_TYPE: SeedType = SeedType(64);
  pub const FUNCPTR: SeedType = SeedType(64);
  pub const VOIDPTR: SeedType = SeedType(65);
  pub const PLANTPTR: SeedType = SeedType(66);
  /// First seed type available to host/plugin-defined pointer subtypes.
  pub const FIRST_CUSTOM: SeedType = SeedType(1024);

  /// Returns ```true``` for seed types whose values are stored as unowned pointers.
  pub fn is_pointer(&self) -> bool {
    self.0 >= Self::FIRST_PTR_TYPE.0
  }

  /// Returns ```true``` for seed types a leaf may be created with.
  pub fn is_valid(&self) -> bool {
    (Self::INT.0..=Self::INT64.0).contains(&self.0) || self.is_pointer()
  }

  /// Size in bytes of one element of this type. Strings vary per element and
  /// report 0 here.
  pub fn fixed_size(&self) -> usize {
    match *self {
      SeedType::INT | SeedType::BOOLEAN => size_of::<i32>(),
      SeedType::INT64 => size_of::<i64>(),
      SeedType::DOUBLE => size_of::<f64>(),
      s if s.is_pointer() => size_of::<usize>(),
      _ => 0,
    }
  }
}

impl core::fmt::Display for SeedType {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match *self {
      SeedType::INT => f.write_str("int"),
      SeedType::DOUBLE => f.write_str("double"),
      SeedType::BOOLEAN => f.write_str("boolean"),
      SeedType::STRING => f.write_str("string"),
      SeedType::INT64 => f.write_str("int64"),
      SeedType::FUNCPTR => f.write_str("funcptr"),
      SeedType::VOIDPTR => f.write_str("voidptr"),
      SeedType::PLANTPTR => f.write_str("plantptr"),
      SeedType(n) => write!(f, "seed({})", n),
    }
  }
}

/// One element of a leaf's value array, as seen by callers.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  /// A 32-bit integer (```SeedType::INT```).
  Int(i32),
  /// A 64-bit integer (```SeedType::INT64```).
  Int64(i64),
  /// A double (```SeedType::DOUBLE```).
  Double(f64),
  /// A boolean (```SeedType::BOOLEAN```), stored as a 32-bit integer.
  Boolean(bool),
  /// A string (```SeedType::STRING```).
  String(String),
  /// A pointer of any pointer-like seed type. The store never owns the pointee.
  Pointer(*mut c_void),
}

impl Value {
  /// Returns ```true``` if this value may be stored in a leaf of type ```seed```.
  pub fn fits(&self, seed: SeedType) -> bool {
    match self {
      Value::Int(_) => seed == SeedType::INT,
      Value::Int64(_) => seed == SeedType::INT64,
      Value::Double(_) => seed == SeedType::DOUBLE,
      Value::Boolean(_) => seed == SeedType::BOOLEAN,
      Value::String(_) => seed == SeedType::STRING,
      Value::Pointer(_) => seed.is_pointer(),
    }
  }

  /// The natural seed type of this value. Pointers report ```VOIDPTR```.
  pub fn seed_type(&self) -> SeedType {
    match self {
      Value::Int(_) => SeedType::INT,
      Value::Int64(_) => SeedType::INT64,
      Value::Double(_) => SeedType::DOUBLE,
      Value::Boolean(_) => SeedType::BOOLEAN,
      Value::String(_) => SeedType::STRING,
      Value::Pointer(_) => SeedType::VOIDPTR,
    }
  }

  pub fn as_int(&self) -> Option<i32> {
    if let Value::Int(i) = self { Some(*i) } else { None }
  }

  pub fn as_int64(&self) -> Option<i64> {
    if let Value::Int64(i) = self { Some(*i) } else { None }
  }

  pub fn as_double(&self) -> Option<f64> {
    if let Value::Double(d) = self { Some(*d) } else { None }
  }

  pub fn as_boolean(&self) -> Option<bool> {
    if let Value::Boolean(b) = self { Some(*b) } else { None }
  }

  pub fn as_str(&self) -> Option<&str> {
    if let Value::String(s) = self { Some(s) } else { None }
  }

  pub fn as_pointer(&self) -> Option<*mut c_void> {
    if let Value::Pointer(p) = self { Some(*p) } else { None }
  }

  /// Pointers become hex strings; non-finite doubles become ```null```.
  #[cfg(feature = "serde_support")]
  pub fn to_json(&self) -> serde_json::Value {
    use serde_json::json;
    match self {
      Value::Int(i) => json!(i),
      Value::Int64(i) => json!(i),
      Value::Double(d) => json!(d),
      Value::Boolean(b) => json!(b),
      Value::String(s) => json!(s),
      Value::Pointer(p) => json!(format!("{:#x}", *p as usize)),
    }
  }
}

// --- Element storage ---

/// A stored element. Owned elements carry a private heap copy of the value's
/// bytes; unowned elements carry a pointer value verbatim.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Element {
  Owned(Box<[u8]>),
  Unowned(usize),
}

impl Element {
  /// Builds one element, allocating fallibly.
  fn new(seed: SeedType, value: &Value) -> WeedResult<Element> {
    if !value.fits(seed) {
      return Err(WeedError::WrongSeedType);
    }
    let bytes = match value {
      Value::Pointer(p) => return Ok(Element::Unowned(*p as usize)),
      Value::Int(i) => copy_bytes(&i.to_ne_bytes())?,
      Value::Int64(i) => copy_bytes(&i.to_ne_bytes())?,
      Value::Double(d) => copy_bytes(&d.to_ne_bytes())?,
      Value::Boolean(b) => copy_bytes(&(*b as i32).to_ne_bytes())?,
      Value::String(s) => copy_bytes(s.as_bytes())?,
    };
    Ok(Element::Owned(bytes))
  }

  /// Size of this element as stored under ```seed```: the byte length for
  /// strings, the type's fixed size otherwise.
  pub(crate) fn size(&self, seed: SeedType) -> usize {
    match self {
      Element::Owned(b) if seed == SeedType::STRING => b.len(),
      _ => seed.fixed_size(),
    }
  }

  /// Decodes this element back into a value of type ```seed```.
  pub(crate) fn value(&self, seed: SeedType) -> WeedResult<Value> {
    match self {
      Element::Unowned(p) => Ok(Value::Pointer(*p as *mut c_void)),
      Element::Owned(b) => match seed {
        SeedType::INT => Ok(Value::Int(i32::from_ne_bytes(fixed(b)?))),
        SeedType::INT64 => Ok(Value::Int64(i64::from_ne_bytes(fixed(b)?))),
        SeedType::DOUBLE => Ok(Value::Double(f64::from_ne_bytes(fixed(b)?))),
        SeedType::BOOLEAN => Ok(Value::Boolean(i32::from_ne_bytes(fixed(b)?) != 0)),
        SeedType::STRING => {
          let mut s = String::new();
          s.try_reserve_exact(b.len())?;
          s.push_str(core::str::from_utf8(b).map_err(|_| WeedError::WrongSeedType)?);
          Ok(Value::String(s))
        }
        _ => Err(WeedError::WrongSeedType),
      },
    }
  }
}

fn copy_bytes(src: &[u8]) -> WeedResult<Box<[u8]>> {
  let mut v = Vec::new();
  v.try_reserve_exact(src.len())?;
  v.extend_from_slice(src);
  Ok(v.into_boxed_slice())
}

fn fixed<const N: usize>(b: &[u8]) -> WeedResult<[u8; N]> {
  b.try_into().map_err(|_| WeedError::WrongSeedType)
}

/// Builds a complete value array for ```seed```. On failure every element
/// built so far is dropped before the error is returned, so callers never see
/// a partial array.
pub(crate) fn new_values(seed: SeedType, values: &[Value]) -> WeedResult<Vec<Element>> {
  if !seed.is_valid() {
    return Err(WeedError::WrongSeedType);
  }
  let mut out = Vec::new();
  out.try_reserve_exact(values.len())?;
  for v in values {
    out.push(Element::new(seed, v)?);
  }
  Ok(out)
}
