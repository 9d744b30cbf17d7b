use core::fmt::{self, Debug};
use std::borrow::Cow;
use std::time::SystemTime;

use regex::Regex;

use crate::runtime::model::propex;
use crate::*;

use super::propex::PropexSegment;

mod converts;
mod map;
mod ser;

pub use self::map::*;

/// Names visible to nested property expressions (`a[msg.topic]`): either
/// the value being navigated itself, or an external variant.
#[derive(Debug, Clone)]
pub enum PropexEnv<'a> {
    ThisRef(&'a str),
    ExtRef(&'a str, &'a Variant),
}

pub trait PropexEnvSliceExt<'a> {
    fn find(&self, seg: &str, this: &'a Variant) -> Option<&'a Variant>;
    fn find_ext(&self, seg: &str) -> Option<&'a Variant>;
}

/// The value model carried inside messages, contexts and environment
/// stores. Deep clone is `Clone`; it is total for JSON-compatible values
/// and copies byte buffers by value.
#[derive(Default, Clone)]
pub enum Variant {
    /// Represents a null value.
    #[default]
    Null,

    /// Represents a floating-point number or a 64-bit integer number.
    Number(serde_json::Number),

    /// Represents a string of characters.
    String(String),

    /// Represents a boolean value (true or false).
    Bool(bool),

    /// Represents a Date value (timestamp inside).
    Date(SystemTime),

    /// Represents a regular expression.
    Regexp(Regex),

    /// Represents a sequence of bytes.
    Bytes(Vec<u8>),

    /// Represents an array of `Variant` values.
    Array(Vec<Variant>),

    /// Represents a key-value mapping of strings to `Variant` values.
    Object(VariantObjectMap),
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Variant::Null, Variant::Null) => true,
            (Variant::Number(a), Variant::Number(b)) => a == b,
            (Variant::String(a), Variant::String(b)) => a == b,
            (Variant::Bool(a), Variant::Bool(b)) => a == b,
            (Variant::Date(a), Variant::Date(b)) => a == b,
            (Variant::Regexp(a), Variant::Regexp(b)) => a.as_str() == b.as_str(),
            (Variant::Bytes(a), Variant::Bytes(b)) => a == b,
            (Variant::Array(a), Variant::Array(b)) => a == b,
            (Variant::Object(a), Variant::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Variant {}

impl Variant {
    pub fn empty_string() -> Variant {
        Variant::String("".into())
    }

    pub fn empty_object() -> Variant {
        Variant::Object(VariantObjectMap::new())
    }

    pub fn empty_array() -> Variant {
        Variant::Array(Vec::<Variant>::new())
    }

    pub fn now() -> Variant {
        Variant::Date(SystemTime::now())
    }

    pub fn bytes_from_json_value(jv: &serde_json::Value) -> crate::Result<Variant> {
        match jv {
            serde_json::Value::Array(array) => {
                let mut bytes = Vec::with_capacity(array.len());
                for e in array.iter() {
                    if let Some(byte) = e.as_i64() {
                        if !(0..=0xFF).contains(&byte) {
                            return Err(WireflowError::NotSupported("Invalid byte value".to_owned()).into());
                        }
                        bytes.push(byte as u8)
                    } else {
                        return Err(WireflowError::NotSupported("Invalid byte JSON value type".to_owned()).into());
                    }
                }
                Ok(Variant::Bytes(bytes))
            }
            serde_json::Value::String(string) => Ok(Variant::from(string.as_bytes())),
            _ => Err(WireflowError::NotSupported("Invalid byte JSON Value".to_owned()).into()),
        }
    }

    pub fn bytes_from_vec(vec: &[Variant]) -> crate::Result<Variant> {
        let mut bytes: Vec<u8> = Vec::with_capacity(vec.len());
        for v in vec.iter() {
            match v.as_u8() {
                Some(b) => bytes.push(b),
                None => return Err(WireflowError::OutOfRange.into()),
            }
        }
        Ok(Variant::Bytes(bytes))
    }

    pub fn is_bytes(&self) -> bool {
        matches!(self, Variant::Bytes(..))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Variant::Bytes(ref bytes) => Some(bytes),
            Variant::String(ref s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Variant::Bytes(ref bytes) => Some(bytes.clone()),
            Variant::String(ref s) => Some(s.bytes().collect()),
            Variant::Array(ref arr) => {
                let mut bytes = Vec::with_capacity(arr.len());
                for e in arr.iter() {
                    bytes.push(e.as_u8()?);
                }
                Some(bytes)
            }
            Variant::Number(f) => Some(f.to_string().bytes().collect()),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(*self, Variant::Number(_))
    }

    pub fn is_i64(&self) -> bool {
        match self {
            Variant::Number(n) => n.is_i64(),
            _ => false,
        }
    }

    pub fn is_f64(&self) -> bool {
        match self {
            Variant::Number(n) => n.is_f64(),
            _ => false,
        }
    }

    pub fn as_number(&self) -> Option<&serde_json::Number> {
        match self {
            Variant::Number(number) => Some(number),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Variant::Number(number) => number.as_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Variant::Number(number) => number.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Variant::Number(number) => number.as_u64(),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Variant::Number(number) => {
                if let Some(i) = number.as_i64() {
                    u8::try_from(i).ok()
                } else {
                    number.as_f64().filter(|f| (0.0..=255.0).contains(f)).map(|f| f as u8)
                }
            }
            _ => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Variant::String(..))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(ref s) => Some(s),
            _ => None,
        }
    }

    #[allow(clippy::inherent_to_string)]
    pub fn to_string(&self) -> crate::Result<String> {
        match self {
            Variant::String(s) => Ok(s.clone()),
            Variant::Number(f) => Ok(f.to_string()),
            Variant::Bool(b) => Ok(b.to_string()),
            _ => Err(WireflowError::InvalidOperation("Bad type".into()).into()),
        }
    }

    pub fn to_cow_str(&self) -> crate::Result<Cow<'_, str>> {
        match self {
            Variant::String(s) => Ok(Cow::Borrowed(s.as_str())),
            _ => Ok(Cow::Owned(self.to_string()?)),
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Variant::Bool(..))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Variant::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// JS-style truthiness, used by the rule operators.
    pub fn is_truthy(&self) -> bool {
        match self {
            Variant::Null => false,
            Variant::Bool(b) => *b,
            Variant::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
            Variant::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Variant::Array(..))
    }

    pub fn as_array(&self) -> Option<&Vec<Variant>> {
        match self {
            Variant::Array(ref array) => Some(array),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Variant>> {
        match self {
            Variant::Array(ref mut list) => Some(list),
            _ => None,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Variant::Object(..))
    }

    pub fn as_object(&self) -> Option<&VariantObjectMap> {
        match self {
            Variant::Object(ref object) => Some(object),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut VariantObjectMap> {
        match self {
            Variant::Object(ref mut object) => Some(object),
            _ => None,
        }
    }

    pub fn into_object(self) -> Result<VariantObjectMap, Self> {
        match self {
            Variant::Object(object) => Ok(object),
            other => Err(other),
        }
    }

    pub fn is_regexp(&self) -> bool {
        matches!(self, Variant::Regexp(..))
    }

    pub fn as_regexp(&self) -> Option<&Regex> {
        match self {
            Variant::Regexp(re) => Some(re),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Variant::Null => 0,
            Variant::Object(object) => object.len(),
            Variant::Array(array) => array.len(),
            Variant::Bytes(bytes) => bytes.len(),
            Variant::String(s) => s.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Variant::Null => true,
            Variant::Object(object) => object.is_empty(),
            Variant::Array(array) => array.is_empty(),
            Variant::Bytes(bytes) => bytes.is_empty(),
            Variant::String(s) => s.is_empty(),
            Variant::Number(f) => f.as_f64().map(|x| x.is_nan()).unwrap_or(false),
            _ => false,
        }
    }

    pub fn get_seg(&self, pseg: &PropexSegment) -> Option<&Variant> {
        match pseg {
            PropexSegment::Index(index) => self.get_array_item(*index),
            PropexSegment::Property(prop) => self.as_object()?.get_property(prop),
            PropexSegment::Nested(_) => None,
        }
    }

    pub fn get_seg_mut(&mut self, pseg: &PropexSegment) -> Option<&mut Variant> {
        match pseg {
            PropexSegment::Index(index) => self.get_array_item_mut(*index),
            PropexSegment::Property(prop) => self.as_object_mut()?.get_property_mut(prop),
            PropexSegment::Nested(_) => None,
        }
    }

    pub fn get_segs(&self, psegs: &[PropexSegment]) -> Option<&Variant> {
        psegs.iter().try_fold(self, |prev, pseg| prev.get_seg(pseg))
    }

    pub fn get_segs_mut(&mut self, psegs: &[PropexSegment]) -> Option<&mut Variant> {
        psegs.iter().try_fold(self, |prev, pseg| prev.get_seg_mut(pseg))
    }

    pub fn get_array_item(&self, index: usize) -> Option<&Variant> {
        match self {
            Variant::Array(arr) => arr.get(index),
            _ => None,
        }
    }

    pub fn get_array_item_mut(&mut self, index: usize) -> Option<&mut Variant> {
        match self {
            Variant::Array(arr) => arr.get_mut(index),
            _ => None,
        }
    }

    pub fn get_nav(&self, expr: &str, eval_env: &[PropexEnv]) -> Option<&Variant> {
        let mut prop_segs = propex::parse(expr).ok()?;
        expand_propex_segments_with(&mut prop_segs, eval_env, Some(self)).ok()?;
        self.get_segs(&prop_segs)
    }

    pub fn get_nav_mut(&mut self, expr: &str, eval_env: &[PropexEnv]) -> Option<&mut Variant> {
        let mut prop_segs = propex::parse(expr).ok()?;
        expand_propex_segments_with(&mut prop_segs, eval_env, Some(&*self)).ok()?;
        self.get_segs_mut(&prop_segs)
    }

    pub fn set_array_item(&mut self, index: usize, value: Variant) -> crate::Result<()> {
        match self {
            Variant::Array(ref mut this_arr) => {
                if let Some(existed) = this_arr.get_mut(index) {
                    *existed = value;
                    Ok(())
                } else if index >= this_arr.len() {
                    // fill the gap with nulls
                    this_arr.resize_with(index, Variant::default);
                    this_arr.push(value);
                    Ok(())
                } else {
                    Err(WireflowError::OutOfRange.into())
                }
            }
            Variant::Bytes(ref mut this_bytes) => {
                let byte = value.as_u8().ok_or(WireflowError::InvalidOperation("Bad casting".into()))?;
                if let Some(existed) = this_bytes.get_mut(index) {
                    *existed = byte;
                    Ok(())
                } else if index == this_bytes.len() {
                    this_bytes.push(byte);
                    Ok(())
                } else {
                    Err(WireflowError::OutOfRange.into())
                }
            }
            _ => Err(WireflowError::InvalidOperation("Bad type".into()).into()),
        }
    }

    pub fn set_seg_property(&mut self, pseg: &PropexSegment, value: Variant) -> crate::Result<()> {
        match pseg {
            PropexSegment::Index(index) => self.set_array_item(*index, value),
            PropexSegment::Property(prop) => {
                self.as_object_mut()
                    .ok_or(WireflowError::InvalidOperation("Not an object".into()))?
                    .set_property(prop.to_string(), value);
                Ok(())
            }
            PropexSegment::Nested(_) => Err(WireflowError::InvalidOperation("Unexpanded nested segment".into()).into()),
        }
    }

    /// Sets a value along a parsed path. With `create_missing`, a missing
    /// parent is created and its shape follows the next segment kind:
    /// string key makes an object, index makes an array.
    pub fn set_segs_property(&mut self, segs: &[PropexSegment], value: Variant, create_missing: bool) -> crate::Result<()> {
        match segs {
            [] => Err(WireflowError::BadArgument("segs").into()),
            [seg] => self.set_seg_property(seg, value),
            [first, rest @ ..] => {
                let next_seg = rest.first();
                let has_first = self.get_seg(first).is_some();
                if !has_first {
                    if !create_missing {
                        return Err(WireflowError::InvalidOperation(format!(
                            "Missing intermediate segment: '{}'",
                            first
                        ))
                        .into());
                    }
                    let child = match next_seg {
                        Some(PropexSegment::Property(_)) => Variant::empty_object(),
                        Some(PropexSegment::Index(_)) => Variant::empty_array(),
                        _ => return Err(WireflowError::BadArgument("segs").into()),
                    };
                    self.set_seg_property(first, child)?;
                }
                let first_prop =
                    self.get_seg_mut(first).ok_or(WireflowError::InvalidOperation("Failed to access segment".into()))?;
                first_prop.set_segs_property(rest, value, create_missing)
            }
        }
    }

    pub fn set_nav(
        &mut self,
        expr: &str,
        value: Variant,
        create_missing: bool,
        eval_env: &[PropexEnv],
    ) -> crate::Result<()> {
        let mut prop_segs = propex::parse(expr).map_err(|_| WireflowError::InvalidExpr(expr.into()))?;
        expand_propex_segments_with(&mut prop_segs, eval_env, Some(&*self))?;
        self.set_segs_property(&prop_segs, value, create_missing)
    }

    pub fn take(&mut self) -> Variant {
        core::mem::replace(self, Variant::Null)
    }
} // struct Variant

impl Debug for Variant {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Variant::Null => formatter.write_str("Null"),
            Variant::Bool(boolean) => write!(formatter, "Bool({})", boolean),
            Variant::Number(number) => Debug::fmt(number, formatter),
            Variant::String(string) => write!(formatter, "String({:?})", string),
            Variant::Date(sd) => write!(formatter, "Date({:?})", sd),
            Variant::Regexp(re) => write!(formatter, "Regexp({:?})", re),
            Variant::Bytes(bytes) => write!(formatter, "Bytes({:?})", bytes),
            Variant::Array(vec) => {
                formatter.write_str("Array ")?;
                Debug::fmt(&vec, formatter)
            }
            Variant::Object(ref map) => {
                formatter.write_str("Object ")?;
                Debug::fmt(map, formatter)
            }
        }
    }
}

impl<'a> PropexEnvSliceExt<'a> for &'a [PropexEnv<'a>] {
    fn find(&self, seg: &str, this: &'a Variant) -> Option<&'a Variant> {
        for s in self.iter() {
            match s {
                PropexEnv::ThisRef(sname) if *sname == seg => return Some(this),
                PropexEnv::ExtRef(sname, ext_var) if *sname == seg => return Some(ext_var),
                _ => continue,
            }
        }
        None
    }

    fn find_ext(&self, seg: &str) -> Option<&'a Variant> {
        for s in self.iter() {
            match s {
                PropexEnv::ExtRef(sname, ext_var) if *sname == seg => return Some(ext_var),
                _ => continue,
            }
        }
        None
    }
}

/// Replaces `Nested` segments with the concrete key they resolve to in the
/// evaluation environment. `this` backs `ThisRef` entries when available.
fn expand_propex_segments_with(
    segs: &mut [PropexSegment],
    eval_env: &[PropexEnv],
    this: Option<&Variant>,
) -> crate::Result<()> {
    for seg in segs.iter_mut() {
        if let PropexSegment::Nested(nested_segs) = seg {
            let nested_var = match nested_segs.first() {
                Some(PropexSegment::Property(s)) => match this {
                    Some(this) => eval_env.find(s, this),
                    None => eval_env.find_ext(s),
                },
                // No recursion at this level
                _ => return Err(WireflowError::OutOfRange.into()),
            };
            let nested_var = nested_var.ok_or(WireflowError::OutOfRange)?;
            *seg = match nested_var.get_segs(&nested_segs[1..]).ok_or(WireflowError::OutOfRange)? {
                Variant::String(str_index) => PropexSegment::Property(Cow::Owned(str_index.clone())),
                Variant::Number(num_index) if num_index.as_u64().is_some() => {
                    PropexSegment::Index(num_index.as_u64().unwrap() as usize)
                }
                _ => return Err(WireflowError::OutOfRange.into()),
            };
        }
    }
    Ok(())
}

pub fn expand_propex_segments(segs: &mut [PropexSegment], eval_env: &[PropexEnv]) -> crate::Result<()> {
    expand_propex_segments_with(segs, eval_env, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn variant_clone_should_be_deep() {
        let var1 = Variant::Array(vec![
            Variant::from(123),
            Variant::from(333),
            Variant::Array(vec![Variant::from(901), Variant::from(902)]),
        ]);
        let mut var2 = var1.clone();

        let inner_array = var2.as_array_mut().unwrap()[2].as_array_mut().unwrap();
        inner_array[0] = Variant::from(999);

        let value1 = var1.as_array().unwrap()[2].as_array().unwrap()[0].as_i64().unwrap();
        let value2 = var2.as_array().unwrap()[2].as_array().unwrap()[0].as_i64().unwrap();

        assert_eq!(value1, 901);
        assert_eq!(value2, 999);
    }

    #[test]
    fn variant_propex_readonly_accessing_should_be_ok() {
        let obj1 = Variant::from([
            ("value1", Variant::from(123)),
            (
                "value3",
                Variant::from([("aaa", Variant::from(333)), ("ccc", Variant::from(555)), ("ddd", Variant::from(999))]),
            ),
        ]);

        assert_eq!(obj1.get_nav("value1", &[]).unwrap().as_i64().unwrap(), 123);
        assert_eq!(obj1.get_nav("value3.ccc", &[]).unwrap().as_i64().unwrap(), 555);
        assert_eq!(obj1.get_nav("['value3'].ccc", &[]).unwrap().as_i64().unwrap(), 555);
        assert_eq!(obj1.get_nav("['value3'][\"ccc\"]", &[]).unwrap().as_i64().unwrap(), 555);
        assert_eq!(obj1.get_nav("value3.ddd", &[]).unwrap().as_i64().unwrap(), 999);
    }

    #[test]
    fn variant_propex_set_nav_property_with_empty_object_should_be_ok() {
        let mut obj1 = Variant::empty_object();

        obj1.set_nav("address.country", Variant::String("US".to_string()), true, &[]).unwrap();
        obj1.set_nav("address.zip", Variant::String("12345".to_string()), true, &[]).unwrap();

        obj1.set_nav("array_field[0]", Variant::String("11111".to_string()), true, &[]).unwrap();
        obj1.set_nav("array_field[1]", Variant::String("22222".to_string()), true, &[]).unwrap();

        let obj_address = obj1.get_nav("address", &[]).unwrap();
        assert!(obj_address.is_object());
        assert_eq!(obj_address.get_nav("country", &[]).unwrap().as_str().unwrap(), "US");
        assert_eq!(obj_address.get_nav("zip", &[]).unwrap().as_str().unwrap(), "12345");
        assert_eq!(obj_address.len(), 2);

        let arr = obj1.get_nav("array_field", &[]).unwrap();
        assert!(arr.is_array());
        assert_eq!(arr.len(), 2);
    }

    #[test]
    fn variant_set_nav_shapes_created_parent_from_next_segment() {
        let mut obj = Variant::empty_object();
        obj.set_nav("a.b[0]", Variant::from(1), true, &[]).unwrap();
        assert!(obj.get_nav("a", &[]).unwrap().is_object());
        assert!(obj.get_nav("a.b", &[]).unwrap().is_array());

        let mut obj2 = Variant::empty_object();
        obj2.set_nav("xs[1]", Variant::from(5), true, &[]).unwrap();
        let xs = obj2.get_nav("xs", &[]).unwrap().as_array().unwrap();
        assert_eq!(xs.len(), 2);
        assert!(xs[0].is_null());
        assert_eq!(xs[1].as_i64().unwrap(), 5);
    }

    #[test]
    fn variant_set_nav_without_create_missing_fails_and_mutates_nothing() {
        let mut obj = Variant::from([("a", Variant::from(1))]);
        assert!(obj.set_nav("b.c", Variant::from(2), false, &[]).is_err());
        assert!(obj.get_nav("b", &[]).is_none());
    }

    #[test]
    fn variant_set_nav_rejects_invalid_expr() {
        let mut obj = Variant::empty_object();
        let err = obj.set_nav("a[", Variant::from(1), true, &[]).unwrap_err();
        assert!(matches!(err.downcast_ref::<WireflowError>(), Some(WireflowError::InvalidExpr(_))));
        assert!(obj.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_variant_propex_with_nested_propex() {
        let obj1 = Variant::from([
            ("value3", Variant::from(vec![Variant::from(333), Variant::from(444), Variant::from(555)])),
            ("value4", Variant::from(1)),
        ]);

        let obj2 = Variant::from([("value5", Variant::from("value3"))]);

        assert_eq!(obj1.get_nav("['value3'][1]", &[]).unwrap().as_i64().unwrap(), 444);

        let res = obj1.get_nav("['value3'][this.value4]", &[PropexEnv::ThisRef("this")]).unwrap().as_i64().unwrap();
        assert_eq!(res, 444);

        let res = obj1
            .get_nav("[obj2.value5][me.value4]", &[PropexEnv::ThisRef("me"), PropexEnv::ExtRef("obj2", &obj2)])
            .unwrap()
            .as_i64()
            .unwrap();
        assert_eq!(res, 444);
    }

    #[test]
    fn variant_can_round_trip_json_value() {
        let org = Variant::Object(VariantObjectMap::from([
            ("a".into(), Variant::from(1)), //
            ("b".into(), "hello".into()),
        ]));
        let jv = serde_json::to_value(org).unwrap();
        assert_eq!(jv.get("a").cloned(), Some(1.into()));
        assert_eq!(jv.get("b").cloned(), Some("hello".into()));

        let json = json!({"p0": null, "p1": "a", "p2": 123, "p3": true, "p4": [100, 200.0]});
        let var = Variant::deserialize(&json).unwrap();
        let obj = var.as_object().unwrap();
        assert!(obj["p0"].is_null());
        assert_eq!(obj["p1"].as_str().unwrap(), "a");
        assert_eq!(obj["p2"].as_i64().unwrap(), 123);
        assert!(obj["p3"].as_bool().unwrap());
        assert_eq!(obj["p4"].as_array().unwrap()[1].as_f64().unwrap(), 200.0);
    }

    #[test]
    fn variant_truthiness() {
        assert!(!Variant::Null.is_truthy());
        assert!(!Variant::from(0).is_truthy());
        assert!(!Variant::from("").is_truthy());
        assert!(!Variant::Bool(false).is_truthy());
        assert!(Variant::from(1).is_truthy());
        assert!(Variant::from("x").is_truthy());
        assert!(Variant::empty_object().is_truthy());
    }
}
