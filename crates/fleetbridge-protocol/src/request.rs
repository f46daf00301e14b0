//! Inbound control messages.
//!
//! The cloud side sends JSON arrays whose first element is a string tag and
//! whose remaining elements are positional arguments, e.g.
//! `["forward", 5]`.  Each bridge parses them once, at the boundary, into a
//! closed enum implementing [`ControlRequest`]; every later stage works with
//! typed values only.

use std::fmt;
use std::ops::RangeInclusive;

use fleetbridge_types::LinkError;
use serde_json::Value;

/// A typed control request for one device kind.
pub trait ControlRequest: Sized + Send + fmt::Debug + 'static {
    /// Accepted array lengths, tag included.
    const ARITY: RangeInclusive<usize>;

    /// Build a request from its tag and positional arguments.
    ///
    /// # Errors
    ///
    /// [`LinkError::Validation`] for an unknown tag or arguments of the wrong
    /// count or type.
    fn from_fields(tag: &str, args: &[Value]) -> Result<Self, LinkError>;

    /// Parse a raw control-channel text message.
    fn parse(text: &str) -> Result<Self, LinkError> {
        let fields = parse_array(text, Self::ARITY)?;
        let (tag, args) = fields
            .split_first()
            .ok_or_else(|| LinkError::Validation("empty control message".to_string()))?;
        let tag = tag
            .as_str()
            .ok_or_else(|| LinkError::Validation(format!("tag {tag} is not a string")))?;
        Self::from_fields(tag, args)
    }
}

/// Parse `text` as a JSON array whose length lies in `arity`.
pub fn parse_array(text: &str, arity: RangeInclusive<usize>) -> Result<Vec<Value>, LinkError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| LinkError::Validation(format!("not JSON: {e}")))?;
    let Value::Array(fields) = value else {
        return Err(LinkError::Validation("control message is not an array".to_string()));
    };
    if !arity.contains(&fields.len()) {
        return Err(LinkError::Validation(format!(
            "arity {} outside {}..={}",
            fields.len(),
            arity.start(),
            arity.end()
        )));
    }
    Ok(fields)
}

/// Check that `tag` received exactly `expected` arguments.
pub fn expect_args(tag: &str, args: &[Value], expected: usize) -> Result<(), LinkError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(LinkError::Validation(format!(
            "\"{tag}\" takes {expected} argument(s), got {}",
            args.len()
        )))
    }
}

pub fn bool_arg(tag: &str, args: &[Value], index: usize) -> Result<bool, LinkError> {
    args.get(index)
        .and_then(Value::as_bool)
        .ok_or_else(|| bad_arg(tag, index, "a bool"))
}

/// A JSON integer that fits in an `i32`.
pub fn int_arg(tag: &str, args: &[Value], index: usize) -> Result<i32, LinkError> {
    args.get(index)
        .and_then(Value::as_i64)
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| bad_arg(tag, index, "a 32-bit integer"))
}

fn bad_arg(tag: &str, index: usize, wanted: &str) -> LinkError {
    LinkError::Validation(format!("\"{tag}\" argument {index} must be {wanted}"))
}

pub(crate) fn unknown_tag(tag: &str) -> LinkError {
    LinkError::Validation(format!("unrecognized tag \"{tag}\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_array_enforces_inclusive_arity() {
        assert!(parse_array(r#"["capture"]"#, 1..=2).is_ok());
        assert!(parse_array(r#"["led", true]"#, 1..=2).is_ok());
        assert!(parse_array(r#"[]"#, 1..=2).is_err());
        assert!(parse_array(r#"["led", true, 1]"#, 1..=2).is_err());
    }

    #[test]
    fn parse_array_rejects_non_arrays() {
        assert!(matches!(
            parse_array(r#"{"op":"capture"}"#, 1..=2),
            Err(LinkError::Validation(_))
        ));
        assert!(matches!(parse_array("not json", 1..=2), Err(LinkError::Validation(_))));
    }

    #[test]
    fn int_arg_rejects_floats_and_out_of_range() {
        let args = [json!(5), json!(2.5), json!(i64::from(i32::MAX) + 1), json!("7")];
        assert_eq!(int_arg("forward", &args, 0).unwrap(), 5);
        assert!(int_arg("forward", &args, 1).is_err());
        assert!(int_arg("forward", &args, 2).is_err());
        assert!(int_arg("forward", &args, 3).is_err());
        assert!(int_arg("forward", &args, 4).is_err());
    }

    #[test]
    fn bool_arg_requires_json_bool() {
        let args = [json!(true), json!(1)];
        assert!(bool_arg("led", &args, 0).unwrap());
        assert!(bool_arg("led", &args, 1).is_err());
    }

    #[test]
    fn expect_args_message_names_the_tag() {
        let err = expect_args("offset", &[json!(1)], 2).unwrap_err();
        assert!(err.to_string().contains("offset"));
    }
}
