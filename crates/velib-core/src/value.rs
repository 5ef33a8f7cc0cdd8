//! Values and value holders.
//!
//! A published path stores its state in a [`ValueHolder`]. Two holders are
//! built in: [`DirectValue`] keeps whatever was last set and renders it with
//! [`default_text`], [`FormattedValue`] pairs the raw value with a formatting
//! function. Callers with their own storage implement [`ValueHolder`] and hand
//! it over as [`PathValue::Custom`].

use crate::Result;
use std::fmt;

/// A bus-transportable datum.
pub type Value = serde_json::Value;

/// Renders a raw value as display text.
pub type Formatter = Box<dyn Fn(&Value) -> String + Send + Sync>;

/// Storage behind one published path.
///
/// After `set_value` returns `Ok`, `value` and `text` must reflect the new
/// value.
pub trait ValueHolder: Send {
    /// The current raw value.
    fn value(&self) -> Result<Value>;

    /// The current value rendered for humans.
    fn text(&self) -> Result<String>;

    /// Replace the current value.
    fn set_value(&mut self, value: Value) -> Result<()>;
}

impl<H: ValueHolder + ?Sized> ValueHolder for Box<H> {
    fn value(&self) -> Result<Value> {
        (**self).value()
    }

    fn text(&self) -> Result<String> {
        (**self).text()
    }

    fn set_value(&mut self, value: Value) -> Result<()> {
        (**self).set_value(value)
    }
}

/// Default text rendering.
///
/// Strings are shown verbatim, numbers in their shortest form, null as an
/// empty string and arrays or objects as compact JSON.
pub fn default_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.as_f64().map(|f| f.to_string()).unwrap_or_default()
            }
        }
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Build a formatter that renders numbers with a fixed number of decimals
/// followed by a unit, e.g. `fixed(2, "V")` renders `3.5` as `3.50 V`.
///
/// Non-numeric values fall back to [`default_text`].
pub fn fixed(decimals: usize, unit: &str) -> impl Fn(&Value) -> String + Send + Sync + 'static {
    let unit = unit.to_string();
    move |value: &Value| match value.as_f64() {
        Some(f) if unit.is_empty() => format!("{:.*}", decimals, f),
        Some(f) => format!("{:.*} {}", decimals, f, unit),
        None => default_text(value),
    }
}

/// Holder that stores exactly the last value set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectValue {
    value: Value,
}

impl DirectValue {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl ValueHolder for DirectValue {
    fn value(&self) -> Result<Value> {
        Ok(self.value.clone())
    }

    fn text(&self) -> Result<String> {
        Ok(default_text(&self.value))
    }

    fn set_value(&mut self, value: Value) -> Result<()> {
        self.value = value;
        Ok(())
    }
}

/// Holder that renders its raw value through a formatting function.
pub struct FormattedValue {
    value: Value,
    formatter: Formatter,
}

impl FormattedValue {
    pub fn new<F>(value: impl Into<Value>, formatter: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        Self {
            value: value.into(),
            formatter: Box::new(formatter),
        }
    }

    /// A formatted holder using [`default_text`].
    pub fn plain(value: impl Into<Value>) -> Self {
        Self::new(value, default_text)
    }

    /// A formatted holder using [`fixed`].
    pub fn with_unit(value: impl Into<Value>, decimals: usize, unit: &str) -> Self {
        Self::new(value, fixed(decimals, unit))
    }
}

impl fmt::Debug for FormattedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormattedValue")
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

impl ValueHolder for FormattedValue {
    fn value(&self) -> Result<Value> {
        Ok(self.value.clone())
    }

    fn text(&self) -> Result<String> {
        Ok((self.formatter)(&self.value))
    }

    fn set_value(&mut self, value: Value) -> Result<()> {
        self.value = value;
        Ok(())
    }
}

/// What a caller hands to path registration.
pub enum PathValue {
    /// A raw value, stored in a [`DirectValue`].
    Direct(Value),
    /// A raw value with a formatter.
    Formatted(FormattedValue),
    /// A caller-supplied holder.
    Custom(Box<dyn ValueHolder>),
}

impl PathValue {
    pub fn custom(holder: impl ValueHolder + 'static) -> Self {
        PathValue::Custom(Box::new(holder))
    }

    pub(crate) fn into_holder(self) -> Box<dyn ValueHolder> {
        match self {
            PathValue::Direct(value) => Box::new(DirectValue::new(value)),
            PathValue::Formatted(holder) => Box::new(holder),
            PathValue::Custom(holder) => holder,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            PathValue::Direct(_) => "direct",
            PathValue::Formatted(_) => "formatted",
            PathValue::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for PathValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathValue::Direct(value) => f.debug_tuple("Direct").field(value).finish(),
            PathValue::Formatted(holder) => f.debug_tuple("Formatted").field(holder).finish(),
            PathValue::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<Value> for PathValue {
    fn from(value: Value) -> Self {
        PathValue::Direct(value)
    }
}

impl From<FormattedValue> for PathValue {
    fn from(holder: FormattedValue) -> Self {
        PathValue::Formatted(holder)
    }
}

impl From<Box<dyn ValueHolder>> for PathValue {
    fn from(holder: Box<dyn ValueHolder>) -> Self {
        PathValue::Custom(holder)
    }
}

macro_rules! direct_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for PathValue {
                fn from(value: $ty) -> Self {
                    PathValue::Direct(Value::from(value))
                }
            }
        )*
    };
}

direct_from!(i32, i64, u32, u64, f64, bool, String, &str);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_text() {
        assert_eq!(default_text(&json!(1)), "1");
        assert_eq!(default_text(&json!(-7)), "-7");
        assert_eq!(default_text(&json!(3.5)), "3.5");
        assert_eq!(default_text(&json!(0.0)), "0");
        assert_eq!(default_text(&json!("x")), "x");
        assert_eq!(default_text(&json!(true)), "true");
        assert_eq!(default_text(&Value::Null), "");
        assert_eq!(default_text(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn test_direct_round_trip() {
        let mut holder = DirectValue::new(0);
        for v in [json!(42), json!("hello"), json!(2.25), json!({"nested": [1, 2]})] {
            holder.set_value(v.clone()).unwrap();
            assert_eq!(holder.value().unwrap(), v);
            assert_eq!(holder.text().unwrap(), default_text(&v));
        }
    }

    #[test]
    fn test_formatted_applies_formatter_after_set() {
        let mut holder = FormattedValue::with_unit(0.0, 2, "V");
        assert_eq!(holder.text().unwrap(), "0.00 V");

        holder.set_value(json!(3.5)).unwrap();
        assert_eq!(holder.value().unwrap(), json!(3.5));
        assert_eq!(holder.text().unwrap(), "3.50 V");
    }

    #[test]
    fn test_fixed_falls_back_for_non_numbers() {
        let format = fixed(1, "A");
        assert_eq!(format(&json!(12)), "12.0 A");
        assert_eq!(format(&json!("n/a")), "n/a");
        assert_eq!(fixed(0, "")(&json!(99.6)), "100");
    }

    #[test]
    fn test_path_value_conversions() {
        assert!(matches!(PathValue::from(1), PathValue::Direct(_)));
        assert!(matches!(PathValue::from("go-velib"), PathValue::Direct(_)));
        assert!(matches!(
            PathValue::from(FormattedValue::plain(0)),
            PathValue::Formatted(_)
        ));
        assert!(matches!(
            PathValue::custom(DirectValue::default()),
            PathValue::Custom(_)
        ));
    }

    #[test]
    fn test_into_holder_keeps_initial_value() {
        let holder = PathValue::from(65535).into_holder();
        assert_eq!(holder.value().unwrap(), json!(65535));
        assert_eq!(holder.text().unwrap(), "65535");
    }
}
