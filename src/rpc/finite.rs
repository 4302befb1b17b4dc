//! Rejects results carrying floats that JSON cannot represent
//!
//! `serde_json` writes NaN and the infinities as `null`, which would hand the
//! client a different value than the callable produced. [`ensure_finite`] walks
//! a result with a serializer that only looks at floats, so the dispatcher can
//! report such a result as unencodable instead.

use std::fmt;

use serde::ser::{self, Serialize};

use crate::errors::MethodError;

pub fn ensure_finite<T: Serialize + ?Sized>(value: &T) -> Result<(), MethodError> {
    match value.serialize(FiniteCheck) {
        Ok(()) => Ok(()),
        Err(Finding::NonFinite(number)) => Err(MethodError::Serialize(ser::Error::custom(
            format!("{number} cannot be represented in JSON"),
        ))),
        // Anything else is reported by the real serializer.
        Err(Finding::Custom(_)) => Ok(()),
    }
}

#[derive(Debug)]
enum Finding {
    NonFinite(f64),
    Custom(String),
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonFinite(number) => write!(f, "non-finite number {number}"),
            Self::Custom(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for Finding {}

impl ser::Error for Finding {
    fn custom<M: fmt::Display>(msg: M) -> Self {
        Self::Custom(msg.to_string())
    }
}

#[derive(Clone, Copy)]
struct FiniteCheck;

impl FiniteCheck {
    fn float(self, number: f64) -> Result<(), Finding> {
        if number.is_finite() {
            Ok(())
        } else {
            Err(Finding::NonFinite(number))
        }
    }
}

impl ser::Serializer for FiniteCheck {
    type Ok = ();
    type Error = Finding;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_i8(self, _: i8) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_i16(self, _: i16) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_i32(self, _: i32) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_i64(self, _: i64) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_u8(self, _: u8) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_u16(self, _: u16) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_u32(self, _: u32) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_u64(self, _: u64) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_f32(self, number: f32) -> Result<(), Finding> {
        self.float(f64::from(number))
    }

    fn serialize_f64(self, number: f64) -> Result<(), Finding> {
        self.float(number)
    }

    fn serialize_char(self, _: char) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_str(self, _: &str) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_bytes(self, _: &[u8]) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_none(self) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), Finding> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<(), Finding> {
        Ok(())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Finding> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Result<(), Finding> {
        value.serialize(self)
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<Self, Finding> {
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self, Finding> {
        Ok(self)
    }

    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, Finding> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, Finding> {
        Ok(self)
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self, Finding> {
        Ok(self)
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, Finding> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, Finding> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteCheck {
    type Ok = ();
    type Error = Finding;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Finding> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Finding> {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteCheck {
    type Ok = ();
    type Error = Finding;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Finding> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Finding> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteCheck {
    type Ok = ();
    type Error = Finding;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Finding> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Finding> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteCheck {
    type Ok = ();
    type Error = Finding;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Finding> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Finding> {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteCheck {
    type Ok = ();
    type Error = Finding;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), Finding> {
        key.serialize(*self)
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Finding> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Finding> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteCheck {
    type Ok = ();
    type Error = Finding;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Finding> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Finding> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteCheck {
    type Ok = ();
    type Error = Finding;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Finding> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Finding> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    #[test]
    fn finite_values_pass() {
        assert!(ensure_finite(&1.5_f64).is_ok());
        assert!(ensure_finite(&json!({"a": [1, 2.5, "x", null]})).is_ok());
        assert!(ensure_finite(&Some(vec![0.0_f32, -3.0])).is_ok());
    }

    #[test]
    fn non_finite_floats_are_found_anywhere() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = ensure_finite(&value).expect_err("top level");
            assert!(matches!(err, MethodError::Serialize(_)));
        }

        let nested: BTreeMap<&str, Vec<Option<f64>>> =
            BTreeMap::from([("values", vec![Some(1.0), None, Some(f64::INFINITY)])]);
        assert!(matches!(
            ensure_finite(&nested),
            Err(MethodError::Serialize(_))
        ));
        assert!(ensure_finite(&(1_u8, f32::NAN)).is_err());
    }

    #[test]
    fn other_serialization_problems_are_left_to_serde_json() {
        let tuple_keys = BTreeMap::from([((0_u8, 0_u8), "origin")]);
        assert!(ensure_finite(&tuple_keys).is_ok());
        assert!(serde_json::to_value(&tuple_keys).is_err());
    }
}
