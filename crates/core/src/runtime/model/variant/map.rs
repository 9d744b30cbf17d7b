use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::runtime::model::propex::{self, PropexSegment};
use crate::{ErrorContext, WireflowError};

use super::*;

pub type VariantObjectMap = BTreeMap<String, Variant>;

pub trait VariantObject {
    fn contains_property(&self, prop: &str) -> bool;
    fn get_property(&self, prop: &str) -> Option<&Variant>;
    fn get_property_mut(&mut self, prop: &str) -> Option<&mut Variant>;
    fn get_nav_property(&self, expr: &str, eval_env: &[PropexEnv]) -> Option<&Variant>;
    fn get_nav_property_mut(&mut self, expr: &str, eval_env: &[PropexEnv]) -> Option<&mut Variant>;
    fn set_property(&mut self, prop: String, value: Variant);
    fn set_nav_property(&mut self, expr: &str, value: Variant, eval_env: &[PropexEnv], create_missing: bool)
        -> crate::Result<()>;

    fn get_segs_property(&self, segs: &[PropexSegment]) -> Option<&Variant>;
    fn get_segs_property_mut(&mut self, segs: &[PropexSegment]) -> Option<&mut Variant>;

    fn remove_property(&mut self, prop: &str) -> Option<Variant>;
    fn remove_nav_property(&mut self, expr: &str, eval_env: &[PropexEnv]) -> Option<Variant>;
    fn remove_segs_property(&mut self, segs: &[PropexSegment]) -> Option<Variant>;
}

impl VariantObject for VariantObjectMap {
    fn contains_property(&self, prop: &str) -> bool {
        self.contains_key(prop)
    }

    fn get_property(&self, prop: &str) -> Option<&Variant> {
        self.get(prop)
    }

    fn get_property_mut(&mut self, prop: &str) -> Option<&mut Variant> {
        self.get_mut(prop)
    }

    /// Get the value of a navigation property.
    ///
    /// The first segment must be a string key: `aaa.bb`, `['aaa']` or
    /// `aaa[msg.topic]`, never a bare index.
    fn get_nav_property(&self, expr: &str, eval_env: &[PropexEnv]) -> Option<&Variant> {
        let mut segs = propex::parse(expr).ok()?;
        self.expand_segs(&mut segs, eval_env).ok()?;
        self.get_segs_property(&segs)
    }

    fn get_nav_property_mut(&mut self, expr: &str, eval_env: &[PropexEnv]) -> Option<&mut Variant> {
        let mut segs = propex::parse(expr).ok()?;
        self.expand_segs(&mut segs, eval_env).ok()?;
        self.get_segs_property_mut(&segs)
    }

    fn set_property(&mut self, prop: String, value: Variant) {
        let _ = self.insert(prop, value);
    }

    fn set_nav_property(
        &mut self,
        expr: &str,
        value: Variant,
        eval_env: &[PropexEnv],
        create_missing: bool,
    ) -> crate::Result<()> {
        if expr.is_empty() {
            return Err(crate::WireflowError::BadArgument("expr"))
                .with_context(|| "The argument expr cannot be empty".to_string());
        }

        let mut segs = propex::parse(expr).map_err(|_| crate::WireflowError::InvalidExpr(expr.into()))?;
        self.expand_segs(&mut segs, eval_env)?;

        let first_prop_name = match segs.first() {
            Some(PropexSegment::Property(name)) => name.to_string(),
            _ => {
                return Err(crate::WireflowError::InvalidExpr(expr.into()))
                    .with_context(|| format!("The first property to access must be a string, got '{}'", expr));
            }
        };

        let first_prop = match (self.contains_key(&first_prop_name), create_missing, segs.len()) {
            (true, _, _) => self.get_mut(&first_prop_name).unwrap(),
            (false, true, 1) => {
                self.insert(first_prop_name, value);
                return Ok(());
            }
            (false, true, _) => {
                let child = match segs.get(1) {
                    Some(PropexSegment::Property(_)) => Variant::empty_object(),
                    Some(PropexSegment::Index(_)) => Variant::empty_array(),
                    _ => {
                        return Err(crate::WireflowError::BadArgument("expr"))
                            .with_context(|| format!("Not allowed to set first property: '{}'", first_prop_name));
                    }
                };
                self.insert(first_prop_name.clone(), child);
                self.get_mut(&first_prop_name).unwrap()
            }
            (false, false, _) => {
                return Err(crate::WireflowError::InvalidOperation(format!(
                    "Failed to set first property: '{}'",
                    first_prop_name
                ))
                .into());
            }
        };

        if segs.len() == 1 {
            *first_prop = value;
            return Ok(());
        }

        first_prop.set_segs_property(&segs[1..], value, create_missing)
    }

    fn get_segs_property(&self, segs: &[PropexSegment]) -> Option<&Variant> {
        match segs {
            [PropexSegment::Property(first_prop_name)] => self.get(first_prop_name.as_ref()),
            [PropexSegment::Property(first_prop_name), rest @ ..] => {
                self.get(first_prop_name.as_ref())?.get_segs(rest)
            }
            _ => None,
        }
    }

    fn get_segs_property_mut(&mut self, segs: &[PropexSegment]) -> Option<&mut Variant> {
        match segs {
            [PropexSegment::Property(first_prop_name)] => self.get_mut(first_prop_name.as_ref()),
            [PropexSegment::Property(first_prop_name), rest @ ..] => {
                self.get_mut(first_prop_name.as_ref())?.get_segs_mut(rest)
            }
            _ => None,
        }
    }

    fn remove_property(&mut self, prop: &str) -> Option<Variant> {
        self.remove(prop)
    }

    fn remove_nav_property(&mut self, expr: &str, eval_env: &[PropexEnv]) -> Option<Variant> {
        if expr.is_empty() {
            return None;
        }

        let mut path = propex::parse(expr).ok()?;
        self.expand_segs(&mut path, eval_env).ok()?;

        self.remove_segs_property(&path)
    }

    fn remove_segs_property(&mut self, segs: &[PropexSegment]) -> Option<Variant> {
        match segs {
            [] => None,

            [PropexSegment::Property(first_prop_name)] => self.remove(first_prop_name.as_ref()),

            [PropexSegment::Property(first_prop_name), rest @ ..] => {
                let prop_tail = self.get_mut(first_prop_name.as_ref())?.get_segs_mut(&rest[..rest.len() - 1])?;

                match (prop_tail, segs.last()?) {
                    (Variant::Object(tail_map), PropexSegment::Property(tail_seg)) => {
                        tail_map.remove(tail_seg.as_ref())
                    }
                    (Variant::Array(tail_arr), PropexSegment::Index(tail_index)) if *tail_index < tail_arr.len() => {
                        Some(tail_arr.remove(*tail_index))
                    }
                    _ => None,
                }
            }

            _ => None,
        }
    }
}

trait VariantObjectExpand {
    fn expand_segs(&self, segs: &mut [PropexSegment], eval_env: &[PropexEnv]) -> crate::Result<()>;
}

impl VariantObjectExpand for VariantObjectMap {
    /// Resolves nested segments against this map (for `ThisRef` names) or
    /// the external environment.
    fn expand_segs(&self, segs: &mut [PropexSegment], eval_env: &[PropexEnv]) -> crate::Result<()> {
        for seg in segs.iter_mut() {
            if let PropexSegment::Nested(nested_segs) = seg {
                let resolved = match nested_segs.first() {
                    Some(PropexSegment::Property(s)) => {
                        let is_this = eval_env.iter().any(|e| matches!(e, PropexEnv::ThisRef(n) if n == s));
                        if is_this {
                            self.get_segs_property(&nested_segs[1..]).cloned()
                        } else {
                            let env: &[PropexEnv] = eval_env;
                            env.find_ext(s).and_then(|v| v.get_segs(&nested_segs[1..])).cloned()
                        }
                    }
                    _ => return Err(WireflowError::OutOfRange.into()),
                };
                *seg = match resolved {
                    Some(Variant::String(str_index)) => PropexSegment::Property(Cow::Owned(str_index)),
                    Some(Variant::Number(num_index)) if num_index.as_u64().is_some() => {
                        PropexSegment::Index(num_index.as_u64().unwrap() as usize)
                    }
                    _ => return Err(WireflowError::OutOfRange.into()),
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_nav_property() {
        let mut obj1 = Variant::from([
            ("value1", Variant::from(123)),
            (
                "value3",
                Variant::from([("aaa", Variant::from(333)), ("bbb", Variant::from(444))]),
            ),
            ("value4", Variant::Array(vec!["foo".into(), "foobar".into(), "bar".into()])),
        ])
        .into_object()
        .unwrap();

        assert!(obj1.get("value3").unwrap().as_object().unwrap().contains_key("aaa"));
        let _ = obj1.remove_nav_property("value3.aaa", &[]).unwrap();
        assert!(!obj1.get("value3").unwrap().as_object().unwrap().contains_key("aaa"));

        assert_eq!(obj1.get("value4").unwrap().as_array().unwrap().len(), 3);
        let removed = obj1.remove_nav_property("value4[1]", &[]).unwrap();
        assert_eq!(removed, Variant::String("foobar".into()));
        assert_eq!(obj1.get("value4").unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_nav_property_with_cross_reference() {
        let mut obj = Variant::from([
            ("lookup", Variant::from([("a", Variant::from(1)), ("b", Variant::from(2))])),
            ("topic", Variant::from("b")),
        ])
        .into_object()
        .unwrap();

        assert_eq!(obj.get_nav_property("lookup[msg.topic]", &[PropexEnv::ThisRef("msg")]).unwrap(), &Variant::from(2));

        obj.set_nav_property("lookup[msg.topic]", Variant::from(42), &[PropexEnv::ThisRef("msg")], false).unwrap();
        assert_eq!(obj.get_nav_property("lookup.b", &[]).unwrap(), &Variant::from(42));
    }
}
