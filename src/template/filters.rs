//! Custom template filters

use minijinja::value::Value;
use minijinja::{Error, ErrorKind, State};

/// Register all custom filters with a minijinja Environment
pub fn register_filters(env: &mut minijinja::Environment) {
    env.add_filter("json", filter_json);
    env.add_filter("lines", filter_lines);
    env.add_filter("bullets", filter_bullets);
    env.add_filter("clip", filter_clip);
    env.add_filter("strftime", filter_strftime);
}

/// Serialize value to pretty JSON
fn filter_json(_state: &State, value: Value) -> Result<Value, Error> {
    let json = serde_json::to_string_pretty(&value).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("JSON serialization failed: {}", e),
        )
    })?;
    Ok(Value::from(json))
}

/// Split a string into lines
fn filter_lines(_state: &State, value: Value) -> Result<Value, Error> {
    if value.is_undefined() || value.is_none() {
        return Ok(Value::from_iter(Vec::<Value>::new()));
    }
    let s = value.to_string();
    Ok(Value::from_iter(s.lines().map(|l| Value::from(l.to_string()))))
}

/// Render a sequence as a markdown bullet list
fn filter_bullets(_state: &State, value: Value) -> Result<Value, Error> {
    if value.is_undefined() || value.is_none() {
        return Ok(Value::from(""));
    }
    match value.try_iter() {
        Ok(iter) if value.as_str().is_none() => {
            let items: Vec<String> = iter.map(|v| format!("- {}", v)).collect();
            Ok(Value::from(items.join("\n")))
        }
        _ => Ok(Value::from(format!("- {}", value))),
    }
}

/// Keep at most `max` characters, marking the cut with an ellipsis
fn filter_clip(_state: &State, value: Value, max: usize) -> Result<Value, Error> {
    let s = value.to_string();
    if s.chars().count() <= max {
        return Ok(Value::from(s));
    }
    let clipped: String = s.chars().take(max).collect();
    Ok(Value::from(format!("{}…", clipped)))
}

/// Format a timestamp using strftime format string
///
/// `"now"` uses the current UTC time, anything else must be RFC3339.
fn filter_strftime(_state: &State, value: Value, format: Value) -> Result<Value, Error> {
    let format_str = format.as_str().ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidOperation,
            "strftime filter requires format string as argument",
        )
    })?;

    let datetime = match value.as_str() {
        Some("now") => chrono::Utc::now(),
        Some(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map_err(|e| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("Failed to parse datetime: {}", e),
                )
            })?
            .with_timezone(&chrono::Utc),
        None => {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                "strftime filter requires string input (\"now\" or RFC3339 timestamp)",
            ));
        }
    };

    Ok(Value::from(datetime.format(format_str).to_string()))
}
