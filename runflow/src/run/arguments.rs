//! Nested argument maps: deep merge and path access.

use crate::errors::{MergeConflictError, PipelineError};
use serde_json::{Map, Value};

/// A run's argument tree.
pub type Arguments = Map<String, Value>;

/// Converts a JSON value into an argument map, if it is one.
#[must_use]
pub fn as_arguments(value: Value) -> Option<Arguments> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Deep-merges `other` under `subject`.
///
/// Keys already present in `subject` keep their value, including an explicit
/// `null`. Nested maps merge recursively. A map meeting a non-null scalar or
/// list is a conflict: the key is left untouched and the conflict is reported,
/// with all conflicts of one merge aggregated into a single error.
pub fn merge_into_map(subject: &mut Arguments, other: &Arguments) -> Result<(), PipelineError> {
    let mut errors = Vec::new();
    merge_at(subject, other, &mut Vec::new(), &mut errors);
    PipelineError::combine(errors)
}

fn merge_at(
    subject: &mut Arguments,
    other: &Arguments,
    path: &mut Vec<String>,
    errors: &mut Vec<PipelineError>,
) {
    for (key, theirs) in other {
        path.push(key.clone());
        match subject.get_mut(key) {
            None => {
                subject.insert(key.clone(), theirs.clone());
            }
            Some(Value::Object(ours)) => match theirs {
                Value::Object(theirs) => merge_at(ours, theirs, path, errors),
                Value::Null => {}
                _ => errors.push(conflict(path, "map", kind(theirs))),
            },
            Some(Value::Null) => {}
            Some(ours) => {
                if theirs.is_object() {
                    errors.push(conflict(path, kind(ours), "map"));
                }
            }
        }
        path.pop();
    }
}

fn conflict(path: &[String], subject: &'static str, other: &'static str) -> PipelineError {
    MergeConflictError::new(path.join("."), subject, other).into()
}

fn joined(path: &[&str]) -> String {
    path.join(".")
}

/// Looks up the value at `path`.
pub fn value_at_path<'a>(
    arguments: &'a Arguments,
    path: &[&str],
) -> Result<&'a Value, PipelineError> {
    let Some((last, parents)) = path.split_last() else {
        return Err(PipelineError::EmptyPath);
    };

    let mut current = arguments;
    for (depth, key) in parents.iter().enumerate() {
        current = match current.get(*key) {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(PipelineError::NotAMap {
                    path: joined(&path[..=depth]),
                })
            }
            None => {
                return Err(PipelineError::PathNotFound {
                    path: joined(&path[..=depth]),
                })
            }
        };
    }

    current
        .get(*last)
        .ok_or_else(|| PipelineError::PathNotFound { path: joined(path) })
}

/// Stores `value` at `path`, creating intermediate maps as needed.
pub fn set_value_at_path(
    arguments: &mut Arguments,
    path: &[&str],
    value: Value,
) -> Result<(), PipelineError> {
    let Some((last, parents)) = path.split_last() else {
        return Err(PipelineError::EmptyPath);
    };

    let mut current = arguments;
    for (depth, key) in parents.iter().enumerate() {
        let entry = current
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => {
                return Err(PipelineError::NotAMap {
                    path: joined(&path[..=depth]),
                })
            }
        };
    }

    current.insert((*last).to_string(), value);
    Ok(())
}

/// Removes and returns the value at `path`.
pub fn remove_value_at_path(
    arguments: &mut Arguments,
    path: &[&str],
) -> Result<Value, PipelineError> {
    let Some((last, parents)) = path.split_last() else {
        return Err(PipelineError::EmptyPath);
    };

    let mut current = arguments;
    for (depth, key) in parents.iter().enumerate() {
        current = match current.get_mut(*key) {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(PipelineError::NotAMap {
                    path: joined(&path[..=depth]),
                })
            }
            None => {
                return Err(PipelineError::PathNotFound {
                    path: joined(&path[..=depth]),
                })
            }
        };
    }

    current
        .remove(*last)
        .ok_or_else(|| PipelineError::PathNotFound { path: joined(path) })
}

/// Splits a dotted path such as `a.b.c` into components.
#[must_use]
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('.').filter(|part| !part.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn args(value: Value) -> Arguments {
        as_arguments(value).unwrap()
    }

    #[test]
    fn test_merge_fills_missing_keys() {
        let mut subject = args(json!({"a": 1, "nested": {"x": "mine"}}));
        let other = args(json!({"b": 2, "nested": {"x": "theirs", "y": true}}));

        merge_into_map(&mut subject, &other).unwrap();
        assert_eq!(
            Value::Object(subject),
            json!({"a": 1, "b": 2, "nested": {"x": "mine", "y": true}})
        );
    }

    #[test]
    fn test_merge_keeps_explicit_null() {
        let mut subject = args(json!({"opt": null, "deep": {"flag": null}}));
        let other = args(json!({"opt": {"inner": 1}, "deep": {"flag": "on"}}));

        merge_into_map(&mut subject, &other).unwrap();
        let expected = json!({"opt": null, "deep": {"flag": null}});
        assert_eq!(Value::Object(subject), expected);
    }

    #[test]
    fn test_merge_conflicts_are_aggregated() {
        let mut subject = args(json!({"a": {"x": 1}, "b": "text", "c": 3}));
        let other = args(json!({"a": "scalar", "b": {"y": 2}, "c": 4, "d": 5}));

        let err = merge_into_map(&mut subject, &other).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("2 errors occurred:"), "{message}");
        for expected in [
            "type mismatch at a: cannot merge map with string",
            "type mismatch at b: cannot merge string with map",
        ] {
            assert!(message.contains(expected), "{message}");
        }

        // Conflicting keys are untouched; everything else still merges.
        assert_eq!(
            Value::Object(subject),
            json!({"a": {"x": 1}, "b": "text", "c": 3, "d": 5})
        );
    }

    #[test]
    fn test_nested_conflict_path() {
        let mut subject = args(json!({"outer": {"inner": [1, 2]}}));
        let other = args(json!({"outer": {"inner": {"k": "v"}}}));

        let err = merge_into_map(&mut subject, &other).unwrap_err();
        assert_eq!(
            err.to_string(),
            "type mismatch at outer.inner: cannot merge list with map"
        );
    }

    #[test]
    fn test_path_round_trip() {
        let mut arguments = Arguments::new();
        for (path, value) in [
            (vec!["a"], json!(1)),
            (vec!["b", "c", "d"], json!({"deep": [1, 2]})),
            (vec!["b", "e"], json!(null)),
        ] {
            set_value_at_path(&mut arguments, &path, value.clone()).unwrap();
            assert_eq!(value_at_path(&arguments, &path).unwrap(), &value);
        }

        let removed = remove_value_at_path(&mut arguments, &["b", "c", "d"]).unwrap();
        assert_eq!(removed, json!({"deep": [1, 2]}));
        let err = value_at_path(&arguments, &["b", "c", "d"]).unwrap_err();
        assert_eq!(err.to_string(), "value does not exist at path b.c.d");
    }

    #[test]
    fn test_path_through_scalar() {
        let mut arguments = args(json!({"a": "leaf"}));
        let err = value_at_path(&arguments, &["a", "b"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "encountered something other than a string map at a"
        );
        let nested = set_value_at_path(&mut arguments, &["a", "b"], json!(1));
        assert!(nested.is_err());
        assert!(remove_value_at_path(&mut arguments, &["a", "b"]).is_err());
    }

    #[test]
    fn test_empty_path_is_rejected() {
        let mut arguments = Arguments::new();
        assert!(matches!(
            set_value_at_path(&mut arguments, &[], json!(1)),
            Err(PipelineError::EmptyPath)
        ));
        assert!(matches!(
            value_at_path(&arguments, &[]),
            Err(PipelineError::EmptyPath)
        ));
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("a.b.c"), vec!["a", "b", "c"]);
        assert_eq!(split_path("single"), vec!["single"]);
        assert!(split_path("").is_empty());
    }
}
