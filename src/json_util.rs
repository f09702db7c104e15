use core::fmt;

use crate::plant::*;
use crate::values::*;

// --- Serialization ---

/// Create a JSON string from a Plant.
///
/// Every leaf becomes a key mapped to the array of its values, the ```type```
/// leaf first. Pointers are written as hex strings and non-finite doubles as
/// ```null```. Leaves deleted while the plant is being written are skipped.
pub fn plant_to_string(p: &Plant) -> String {
  let mut s = String::new();
  // Writing to a String only fails if a Display impl does.
  let _ = write_plant(&mut s, p);
  s
}

fn write_plant<W: fmt::Write>(writer: &mut W, p: &Plant) -> fmt::Result {
  writer.write_char('{')?;
  let mut first = true;
  for key in p.keys().unwrap_or_default() {
    let Ok(values) = p.get_array(&key) else {
      continue;
    };
    if !first {
      writer.write_char(',')?;
    }
    first = false;
    writer.write_char('"')?;
    write_escaped_str(writer, &key)?;
    writer.write_str("\":[")?;
    for (i, v) in values.iter().enumerate() {
      if i > 0 {
        writer.write_char(',')?;
      }
      write_value(writer, v)?;
    }
    writer.write_char(']')?;
  }
  writer.write_char('}')
}

fn write_value<W: fmt::Write>(writer: &mut W, v: &Value) -> fmt::Result {
  match v {
    Value::Int(i) => write!(writer, "{}", i),
    Value::Int64(i) => write!(writer, "{}", i),
    Value::Double(d) if d.is_finite() => write!(writer, "{}", d),
    Value::Double(_) => writer.write_str("null"),
    Value::Boolean(b) => writer.write_str(if *b { "true" } else { "false" }),
    Value::String(s) => {
      writer.write_char('"')?;
      write_escaped_str(writer, s)?;
      writer.write_char('"')
    }
    Value::Pointer(p) => write!(writer, "\"{:#x}\"", *p as usize),
  }
}

fn write_escaped_str<W: fmt::Write>(writer: &mut W, s: &str) -> fmt::Result {
  for c in s.chars() {
    match c {
      '"' => writer.write_str("\\\"")?,
      '\\' => writer.write_str("\\\\")?,
      '/' => writer.write_str("\\/")?,
      '\x08' => writer.write_str("\\b")?,
      '\x0c' => writer.write_str("\\f")?,
      '\n' => writer.write_str("\\n")?,
      '\r' => writer.write_str("\\r")?,
      '\t' => writer.write_str("\\t")?,
      '\x00'..='\x1f' => write!(writer, "\\u{:04x}", c as u32)?,
      _ => writer.write_char(c)?,
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fresh_plant() {
    let p = Plant::new(4).unwrap();
    assert_eq!(plant_to_string(&p), "{\"type\":[4]}");
  }

  #[test]
  fn test_scalar_leaves() {
    let p = Plant::new(1).unwrap();
    p.set_boolean("on", true).unwrap();
    p.set("gains", SeedType::DOUBLE, &[Value::Double(0.5), Value::Double(f64::NAN)]).unwrap();
    p.set_int64("frames", 1 << 33).unwrap();
    let json = plant_to_string(&p);
    assert!(json.starts_with("{\"type\":[1],"));
    assert!(json.ends_with('}'));
    assert!(json.contains("\"on\":[true]"));
    assert!(json.contains("\"gains\":[0.5,null]"));
    assert!(json.contains("\"frames\":[8589934592]"));
  }

  #[test]
  fn test_escaping() {
    let p = Plant::new(1).unwrap();
    p.set_string("name", "a \"quoted\"\n\\path/").unwrap();
    let json = plant_to_string(&p);
    assert!(json.contains(r#""name":["a \"quoted\"\n\\path\/"]"#));
    let mut s = String::new();
    write_escaped_str(&mut s, "\x01\t").unwrap();
    assert_eq!(s, "\\u0001\\t");
  }

  #[test]
  fn test_pointers_and_empty_arrays() {
    let p = Plant::new(1).unwrap();
    p.set_pointer("cb", SeedType::FUNCPTR, 0x1000 as *mut core::ffi::c_void).unwrap();
    p.set("none", SeedType::STRING, &[]).unwrap();
    let json = plant_to_string(&p);
    assert!(json.contains("\"cb\":[\"0x1000\"]"));
    assert!(json.contains("\"none\":[]"));
  }

  #[test]
  fn test_freed_plant() {
    let p = Plant::new(1).unwrap();
    p.free().unwrap();
    assert_eq!(plant_to_string(&p), "{}");
  }
}
