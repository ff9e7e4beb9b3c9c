//! Value Codec
//!
//! Turns method arguments and return values into wire strings and back.
//!
//! # Encoding
//!
//! Two tiers:
//! - **Primitive table**: `String`, `bool`, `i32`, `i64`, `u32`, `u64`, `f32`,
//!   `f64` and [`BigDecimal`] each have a dedicated, locale-independent text
//!   form. Floats use the shortest representation that parses back to the
//!   same bits, plus `NaN`, `Infinity` and `-Infinity`.
//! - **Generic**: every other type is encoded as JSON with `serde_json`.
//!
//! The table is keyed by [`TypeId`] and owned by the codec instance, so two
//! codecs can disagree without any process-wide state.
//!
//! # Example
//!
//! ```
//! use servicedisc_common::codec::ValueCodec;
//!
//! let codec = ValueCodec::new();
//! assert_eq!(codec.encode(&f64::INFINITY).unwrap(), "Infinity");
//! assert_eq!(codec.encode(&"plain".to_string()).unwrap(), "plain");
//! assert_eq!(codec.encode(&vec![1, 2]).unwrap(), "[1,2]");
//!
//! let n: i64 = codec.decode("-42").unwrap();
//! assert_eq!(n, -42);
//! ```

use bigdecimal::BigDecimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::dispatch::ReturnKind;
use crate::protocol::error::{Result, ServiceDiscError};

type EncodeFn = Box<dyn Fn(&dyn Any) -> Option<String> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&str) -> Result<Box<dyn Any + Send>> + Send + Sync>;

struct PrimitiveCodec {
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Two-tier value encoder shared by both transports.
pub struct ValueCodec {
    primitives: HashMap<TypeId, PrimitiveCodec>,
}

impl ValueCodec {
    /// Creates a codec with the default primitive table.
    pub fn new() -> Self {
        let mut codec = Self::generic_only();
        codec.register::<String, _, _>(|s| s.clone(), |text| Ok(text.to_string()));
        codec.register::<bool, _, _>(|b| b.to_string(), decode_bool);
        codec.register::<i32, _, _>(|n| n.to_string(), parse_text::<i32>);
        codec.register::<i64, _, _>(|n| n.to_string(), parse_text::<i64>);
        codec.register::<u32, _, _>(|n| n.to_string(), parse_text::<u32>);
        codec.register::<u64, _, _>(|n| n.to_string(), parse_text::<u64>);
        codec.register::<f32, _, _>(|n| encode_float(*n), decode_float::<f32>);
        codec.register::<f64, _, _>(|n| encode_float(*n), decode_float::<f64>);
        codec.register::<BigDecimal, _, _>(|n| n.to_string(), parse_text::<BigDecimal>);
        codec
    }

    /// Creates a codec with an empty primitive table; everything is JSON.
    pub fn generic_only() -> Self {
        Self {
            primitives: HashMap::new(),
        }
    }

    /// Adds or replaces the primitive encoding for `T`.
    pub fn register<T, E, D>(&mut self, encode: E, decode: D)
    where
        T: Any + Send,
        E: Fn(&T) -> String + Send + Sync + 'static,
        D: Fn(&str) -> Result<T> + Send + Sync + 'static,
    {
        let encode: EncodeFn = Box::new(move |value: &dyn Any| value.downcast_ref::<T>().map(&encode));
        let decode: DecodeFn =
            Box::new(move |text: &str| decode(text).map(|v| Box::new(v) as Box<dyn Any + Send>));
        self.primitives
            .insert(TypeId::of::<T>(), PrimitiveCodec { encode, decode });
    }

    /// Whether `T` uses a dedicated primitive encoding.
    pub fn is_primitive<T: Any>(&self) -> bool {
        self.primitives.contains_key(&TypeId::of::<T>())
    }

    pub fn encode<T: Serialize + Any>(&self, value: &T) -> Result<String> {
        if let Some(entry) = self.primitives.get(&TypeId::of::<T>()) {
            if let Some(text) = (entry.encode)(value) {
                return Ok(text);
            }
        }
        Ok(serde_json::to_string(value)?)
    }

    /// Encodes an optional value; `None` stays absent instead of becoming `"null"`.
    pub fn encode_optional<T: Serialize + Any>(&self, value: Option<&T>) -> Result<Option<String>> {
        value.map(|v| self.encode(v)).transpose()
    }

    pub fn decode<T: DeserializeOwned + Any>(&self, text: &str) -> Result<T> {
        if let Some(entry) = self.primitives.get(&TypeId::of::<T>()) {
            let decoded = (entry.decode)(text)?;
            return decoded.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
                ServiceDiscError::Decode(format!(
                    "primitive decoder for {} produced another type",
                    type_name::<T>()
                ))
            });
        }
        serde_json::from_str(text)
            .map_err(|e| ServiceDiscError::Decode(format!("{}: {}", type_name::<T>(), e)))
    }

    pub fn decode_optional<T: DeserializeOwned + Any>(&self, text: Option<&str>) -> Result<Option<T>> {
        text.map(|t| self.decode(t)).transpose()
    }

    /// Decodes a method's return value.
    ///
    /// A `Void` method yields `None` without looking at `text`.
    pub fn decode_return<T: DeserializeOwned + Any>(
        &self,
        returns: ReturnKind,
        text: Option<&str>,
    ) -> Result<Option<T>> {
        match returns {
            ReturnKind::Void => Ok(None),
            ReturnKind::Value => self.decode_optional(text),
            ReturnKind::Stream => Err(ServiceDiscError::UnsupportedSignature(
                "stream return values are not decoded by the value codec".to_string(),
            )),
        }
    }
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ValueCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCodec")
            .field("primitives", &self.primitives.len())
            .finish()
    }
}

fn parse_text<T>(text: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    text.parse::<T>()
        .map_err(|e| ServiceDiscError::Decode(format!("{} from {:?}: {}", type_name::<T>(), text, e)))
}

fn decode_bool(text: &str) -> Result<bool> {
    if text.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if text.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(ServiceDiscError::Decode(format!("bool from {:?}", text)))
    }
}

trait WireFloat: Copy + fmt::Display + FromStr {
    const INFINITY: Self;
    const NEG_INFINITY: Self;
    const NAN: Self;
    fn is_nan(self) -> bool;
    fn is_infinite(self) -> bool;
    fn is_sign_negative(self) -> bool;
}

macro_rules! wire_float {
    ($t:ty) => {
        impl WireFloat for $t {
            const INFINITY: Self = <$t>::INFINITY;
            const NEG_INFINITY: Self = <$t>::NEG_INFINITY;
            const NAN: Self = <$t>::NAN;
            fn is_nan(self) -> bool {
                <$t>::is_nan(self)
            }
            fn is_infinite(self) -> bool {
                <$t>::is_infinite(self)
            }
            fn is_sign_negative(self) -> bool {
                <$t>::is_sign_negative(self)
            }
        }
    };
}

wire_float!(f32);
wire_float!(f64);

// Display prints the shortest digits that parse back to the same value.
fn encode_float<F: WireFloat>(value: F) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_negative() {
            "-Infinity".to_string()
        } else {
            "Infinity".to_string()
        }
    } else {
        value.to_string()
    }
}

fn decode_float<F>(text: &str) -> Result<F>
where
    F: WireFloat,
    F::Err: fmt::Display,
{
    match text {
        "NaN" => Ok(F::NAN),
        "Infinity" => Ok(F::INFINITY),
        "-Infinity" => Ok(F::NEG_INFINITY),
        _ => parse_text::<F>(text),
    }
}
