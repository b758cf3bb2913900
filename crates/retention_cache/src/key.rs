// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deterministic cache key encoding.
//!
//! [`encode_key`] turns any [`Serialize`] value into a canonical string so that structurally
//! equal parameters land in the same cache slot, regardless of the order in which map entries
//! or struct fields were produced.
//!
//! The encoding is JSON-like but not JSON:
//!
//! - scalars use their literal JSON form, strings and chars are quoted and escaped;
//! - `None` is the absent marker: dropped from maps and structs, `null` inside sequences;
//! - sequences keep their order, maps and structs are sorted by field name and written as
//!   `{name:value,...}` with unquoted names;
//! - 128-bit integers are written with their own string conversion;
//! - non-finite floats encode as `null`.
//!
//! A type's own `Serialize` implementation decides what gets encoded, so a handle whose shape is
//! unstable can expose just its identifying field (or use
//! [`RetentionCacheBuilder::key_serializer`](crate::RetentionCacheBuilder::key_serializer)).

use std::any::type_name;
use std::borrow::Borrow;
use std::fmt::{self, Debug, Display};
use std::mem::size_of_val;
use std::ptr;
use std::sync::Arc;

use serde::ser::{self, Impossible, Serialize};

use crate::EncodeError;

/// The canonical encoding of a cache parameter.
///
/// Two parameters that are structurally equal always produce equal keys.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
///
/// use retention_cache::encode_key;
///
/// let a = HashMap::from([("x", 1), ("y", 2)]);
/// let b = HashMap::from([("y", 2), ("x", 1)]);
///
/// assert_eq!(encode_key(&a)?, encode_key(&b)?);
/// assert_eq!(encode_key(&a)?.as_str(), "{x:1,y:2}");
/// # Ok::<(), retention_cache::EncodeError>(())
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Returns the encoded key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the encoded value was absent (for example `None`).
    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&&*self.0).finish()
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Encodes `value` into its canonical [`CacheKey`].
///
/// Map keys and field names are written as they are, without quoting or escaping, so a name
/// containing `:` or `,` can make two different values share a key. Parameters whose map keys
/// come from untrusted input should keep such characters out of them.
///
/// # Errors
///
/// Returns an [`EncodeError`] if the value refers back to itself while it is being encoded,
/// if a map key is not string-like, or if the value's `Serialize` implementation fails.
///
/// # Examples
///
/// ```
/// use retention_cache::encode_key;
///
/// #[derive(serde::Serialize)]
/// struct Query<'a> {
///     collection: &'a str,
///     limit: Option<u32>,
///     tags: Vec<Option<&'a str>>,
/// }
///
/// let key = encode_key(&Query {
///     collection: "users",
///     limit: None,
///     tags: vec![Some("a"), None],
/// })?;
///
/// assert_eq!(key.as_str(), r#"{collection:"users",tags:["a",null]}"#);
/// # Ok::<(), retention_cache::EncodeError>(())
/// ```
pub fn encode_key<T>(value: &T) -> Result<CacheKey, EncodeError>
where
    T: Serialize + ?Sized,
{
    let mut path = Vec::new();
    let encoded = encode_nested(&mut path, value)?;
    Ok(CacheKey(encoded.unwrap_or_default().into()))
}

/// Identifies a value on the active encoding path.
///
/// The address alone is ambiguous because a struct and its first field share it, so the type
/// name is part of the identity. Zero-sized values are never tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Identity {
    addr: usize,
    ty: &'static str,
}

/// `None` marks an absent value.
type Fragment = Option<String>;

fn encode_nested<T>(path: &mut Vec<Identity>, value: &T) -> Result<Fragment, EncodeError>
where
    T: Serialize + ?Sized,
{
    let identity = (size_of_val(value) != 0).then(|| Identity {
        addr: ptr::from_ref(value).cast::<()>().addr(),
        ty: type_name::<T>(),
    });

    if let Some(identity) = identity {
        if path.contains(&identity) {
            return Err(EncodeError::circular());
        }
        path.push(identity);
    }

    let encoded = value.serialize(KeyEncoder { path: &mut *path });

    if identity.is_some() {
        path.pop();
    }

    encoded
}

fn quote(text: &str) -> Result<String, EncodeError> {
    serde_json::to_string(text).map_err(<EncodeError as ser::Error>::custom)
}

fn format_number(value: f64) -> String {
    if !value.is_finite() {
        "null".to_owned()
    } else if value == 0.0 {
        // -0.0 is written the same as 0.0
        "0".to_owned()
    } else if value.fract() == 0.0 && value.abs() < 1e21 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

fn wrap_variant(variant: Option<&'static str>, body: String) -> String {
    match variant {
        Some(variant) => format!("{{{variant}:{body}}}"),
        None => body,
    }
}

struct KeyEncoder<'a> {
    path: &'a mut Vec<Identity>,
}

impl<'a> ser::Serializer for KeyEncoder<'a> {
    type Ok = Fragment;
    type Error = EncodeError;

    type SerializeSeq = SeqEncoder<'a>;
    type SerializeTuple = SeqEncoder<'a>;
    type SerializeTupleStruct = SeqEncoder<'a>;
    type SerializeTupleVariant = SeqEncoder<'a>;
    type SerializeMap = MapEncoder<'a>;
    type SerializeStruct = MapEncoder<'a>;
    type SerializeStructVariant = MapEncoder<'a>;

    fn serialize_bool(self, v: bool) -> Result<Fragment, EncodeError> {
        Ok(Some(v.to_string()))
    }

    fn serialize_i8(self, v: i8) -> Result<Fragment, EncodeError> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i16(self, v: i16) -> Result<Fragment, EncodeError> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i32(self, v: i32) -> Result<Fragment, EncodeError> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i64(self, v: i64) -> Result<Fragment, EncodeError> {
        Ok(Some(v.to_string()))
    }

    fn serialize_i128(self, v: i128) -> Result<Fragment, EncodeError> {
        Ok(Some(v.to_string()))
    }

    fn serialize_u8(self, v: u8) -> Result<Fragment, EncodeError> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u16(self, v: u16) -> Result<Fragment, EncodeError> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u32(self, v: u32) -> Result<Fragment, EncodeError> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u64(self, v: u64) -> Result<Fragment, EncodeError> {
        Ok(Some(v.to_string()))
    }

    fn serialize_u128(self, v: u128) -> Result<Fragment, EncodeError> {
        Ok(Some(v.to_string()))
    }

    fn serialize_f32(self, v: f32) -> Result<Fragment, EncodeError> {
        self.serialize_f64(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<Fragment, EncodeError> {
        Ok(Some(format_number(v)))
    }

    fn serialize_char(self, v: char) -> Result<Fragment, EncodeError> {
        quote(v.encode_utf8(&mut [0; 4])).map(Some)
    }

    fn serialize_str(self, v: &str) -> Result<Fragment, EncodeError> {
        quote(v).map(Some)
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Fragment, EncodeError> {
        let items: Vec<String> = v.iter().map(u8::to_string).collect();
        Ok(Some(format!("[{}]", items.join(","))))
    }

    fn serialize_none(self) -> Result<Fragment, EncodeError> {
        Ok(None)
    }

    fn serialize_some<T>(self, value: &T) -> Result<Fragment, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Fragment, EncodeError> {
        Ok(Some("null".to_owned()))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Fragment, EncodeError> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(self, _name: &'static str, _index: u32, variant: &'static str) -> Result<Fragment, EncodeError> {
        quote(variant).map(Some)
    }

    fn serialize_newtype_struct<T>(self, _name: &'static str, value: &T) -> Result<Fragment, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Fragment, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        let body = encode_nested(self.path, value)?;
        Ok(Some(match body {
            Some(body) => wrap_variant(Some(variant), body),
            None => "{}".to_owned(),
        }))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqEncoder<'a>, EncodeError> {
        Ok(SeqEncoder::new(self.path, len.unwrap_or_default(), None))
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqEncoder<'a>, EncodeError> {
        Ok(SeqEncoder::new(self.path, len, None))
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<SeqEncoder<'a>, EncodeError> {
        Ok(SeqEncoder::new(self.path, len, None))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<SeqEncoder<'a>, EncodeError> {
        Ok(SeqEncoder::new(self.path, len, Some(variant)))
    }

    fn serialize_map(self, len: Option<usize>) -> Result<MapEncoder<'a>, EncodeError> {
        Ok(MapEncoder::new(self.path, len.unwrap_or_default(), None))
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<MapEncoder<'a>, EncodeError> {
        Ok(MapEncoder::new(self.path, len, None))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<MapEncoder<'a>, EncodeError> {
        Ok(MapEncoder::new(self.path, len, Some(variant)))
    }
}

struct SeqEncoder<'a> {
    path: &'a mut Vec<Identity>,
    items: Vec<String>,
    variant: Option<&'static str>,
}

impl<'a> SeqEncoder<'a> {
    fn new(path: &'a mut Vec<Identity>, len: usize, variant: Option<&'static str>) -> Self {
        Self {
            path,
            items: Vec::with_capacity(len),
            variant,
        }
    }

    fn push<T>(&mut self, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        // array positions are preserved, so absent elements become null
        let item = encode_nested(self.path, value)?.unwrap_or_else(|| "null".to_owned());
        self.items.push(item);
        Ok(())
    }

    fn finish(self) -> Fragment {
        let body = format!("[{}]", self.items.join(","));
        Some(wrap_variant(self.variant, body))
    }
}

impl ser::SerializeSeq for SeqEncoder<'_> {
    type Ok = Fragment;
    type Error = EncodeError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.push(value)
    }

    fn end(self) -> Result<Fragment, EncodeError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTuple for SeqEncoder<'_> {
    type Ok = Fragment;
    type Error = EncodeError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.push(value)
    }

    fn end(self) -> Result<Fragment, EncodeError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleStruct for SeqEncoder<'_> {
    type Ok = Fragment;
    type Error = EncodeError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.push(value)
    }

    fn end(self) -> Result<Fragment, EncodeError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleVariant for SeqEncoder<'_> {
    type Ok = Fragment;
    type Error = EncodeError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.push(value)
    }

    fn end(self) -> Result<Fragment, EncodeError> {
        Ok(self.finish())
    }
}

struct MapEncoder<'a> {
    path: &'a mut Vec<Identity>,
    fields: Vec<(String, String)>,
    pending_key: Option<String>,
    variant: Option<&'static str>,
}

impl<'a> MapEncoder<'a> {
    fn new(path: &'a mut Vec<Identity>, len: usize, variant: Option<&'static str>) -> Self {
        Self {
            path,
            fields: Vec::with_capacity(len),
            pending_key: None,
            variant,
        }
    }

    fn push<T>(&mut self, name: String, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        // absent values drop the whole field
        if let Some(value) = encode_nested(self.path, value)? {
            self.fields.push((name, value));
        }
        Ok(())
    }

    fn finish(mut self) -> Fragment {
        self.fields.sort_by(|(a, _), (b, _)| a.cmp(b));
        let fields: Vec<String> = self.fields.iter().map(|(name, value)| format!("{name}:{value}")).collect();
        let body = format!("{{{}}}", fields.join(","));
        Some(wrap_variant(self.variant, body))
    }
}

impl ser::SerializeMap for MapEncoder<'_> {
    type Ok = Fragment;
    type Error = EncodeError;

    fn serialize_key<T>(&mut self, key: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.pending_key = Some(key.serialize(MapKeyEncoder)?);
        Ok(())
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        let name = self
            .pending_key
            .take()
            .ok_or_else(|| <EncodeError as ser::Error>::custom("map value serialized before its key"))?;
        self.push(name, value)
    }

    fn end(self) -> Result<Fragment, EncodeError> {
        Ok(self.finish())
    }
}

impl ser::SerializeStruct for MapEncoder<'_> {
    type Ok = Fragment;
    type Error = EncodeError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.push(key.to_owned(), value)
    }

    fn end(self) -> Result<Fragment, EncodeError> {
        Ok(self.finish())
    }
}

impl ser::SerializeStructVariant for MapEncoder<'_> {
    type Ok = Fragment;
    type Error = EncodeError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.push(key.to_owned(), value)
    }

    fn end(self) -> Result<Fragment, EncodeError> {
        Ok(self.finish())
    }
}

/// Renders map keys, which are emitted unquoted.
struct MapKeyEncoder;

impl ser::Serializer for MapKeyEncoder {
    type Ok = String;
    type Error = EncodeError;

    type SerializeSeq = Impossible<String, EncodeError>;
    type SerializeTuple = Impossible<String, EncodeError>;
    type SerializeTupleStruct = Impossible<String, EncodeError>;
    type SerializeTupleVariant = Impossible<String, EncodeError>;
    type SerializeMap = Impossible<String, EncodeError>;
    type SerializeStruct = Impossible<String, EncodeError>;
    type SerializeStructVariant = Impossible<String, EncodeError>;

    fn serialize_bool(self, v: bool) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_i8(self, v: i8) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_i16(self, v: i16) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_i32(self, v: i32) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_i64(self, v: i64) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_i128(self, v: i128) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_u8(self, v: u8) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_u16(self, v: u16) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_u32(self, v: u32) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_u64(self, v: u64) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_u128(self, v: u128) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_f32(self, v: f32) -> Result<String, EncodeError> {
        Ok(format_number(f64::from(v)))
    }

    fn serialize_f64(self, v: f64) -> Result<String, EncodeError> {
        Ok(format_number(v))
    }

    fn serialize_char(self, v: char) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_str(self, v: &str) -> Result<String, EncodeError> {
        Ok(v.to_owned())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<String, EncodeError> {
        Err(EncodeError::unsupported_key("bytes"))
    }

    fn serialize_none(self) -> Result<String, EncodeError> {
        Err(EncodeError::unsupported_key("an absent value"))
    }

    fn serialize_some<T>(self, value: &T) -> Result<String, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<String, EncodeError> {
        Err(EncodeError::unsupported_key("a unit value"))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<String, EncodeError> {
        Err(EncodeError::unsupported_key(name))
    }

    fn serialize_unit_variant(self, _name: &'static str, _index: u32, variant: &'static str) -> Result<String, EncodeError> {
        Ok(variant.to_owned())
    }

    fn serialize_newtype_struct<T>(self, _name: &'static str, value: &T) -> Result<String, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<String, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        Err(EncodeError::unsupported_key(name))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, EncodeError> {
        Err(EncodeError::unsupported_key("a sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, EncodeError> {
        Err(EncodeError::unsupported_key("a tuple"))
    }

    fn serialize_tuple_struct(self, name: &'static str, _len: usize) -> Result<Self::SerializeTupleStruct, EncodeError> {
        Err(EncodeError::unsupported_key(name))
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, EncodeError> {
        Err(EncodeError::unsupported_key(name))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, EncodeError> {
        Err(EncodeError::unsupported_key("a map"))
    }

    fn serialize_struct(self, name: &'static str, _len: usize) -> Result<Self::SerializeStruct, EncodeError> {
        Err(EncodeError::unsupported_key(name))
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, EncodeError> {
        Err(EncodeError::unsupported_key(name))
    }
}
