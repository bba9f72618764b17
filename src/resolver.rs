// src/resolver.rs

//! First-match-wins lookups over a loosely structured JSON document.
//!
//! The run configuration schema has been renamed several times; every field
//! is therefore looked up through an ordered list of dotted paths
//! (`tools.kraken2.db`, `input.files[0]`, ...). The first path that exists and
//! is not `null` wins.

use serde_json::Value;

use crate::error::{EngineError, Result};

/// Permissive truthiness: `1`, `true`, `yes`, `on` (case-insensitive) are true,
/// everything else is false.
pub fn truthy_str(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() == Some(1.0),
        Value::String(s) => truthy_str(s),
        _ => false,
    }
}

/// Convert a dotted path with optional `[n]` indices into a JSON pointer.
fn to_pointer(path: &str) -> String {
    let mut pointer = String::with_capacity(path.len() + 1);
    for segment in path.split('.') {
        let (key, indices) = match segment.find('[') {
            Some(pos) => segment.split_at(pos),
            None => (segment, ""),
        };
        if !key.is_empty() {
            pointer.push('/');
            pointer.push_str(&key.replace('~', "~0").replace('/', "~1"));
        }
        for idx in indices.split(['[', ']']).filter(|s| !s.is_empty()) {
            pointer.push('/');
            pointer.push_str(idx.trim());
        }
    }
    pointer
}

#[derive(Debug, Clone, Copy)]
pub struct ConfigResolver<'a> {
    doc: &'a Value,
}

impl<'a> ConfigResolver<'a> {
    pub fn new(doc: &'a Value) -> Self {
        Self { doc }
    }

    pub fn document(&self) -> &'a Value {
        self.doc
    }

    /// Value and winning path for the first present, non-null alias.
    pub fn lookup<'p>(&self, paths: &[&'p str]) -> Option<(&'p str, &'a Value)> {
        paths.iter().find_map(|path| {
            self.doc
                .pointer(&to_pointer(path))
                .filter(|v| !v.is_null())
                .map(|v| (*path, v))
        })
    }

    pub fn value(&self, paths: &[&str]) -> Option<&'a Value> {
        self.lookup(paths).map(|(_, v)| v)
    }

    pub fn require(&self, paths: &[&str]) -> Result<&'a Value> {
        self.value(paths)
            .ok_or_else(|| EngineError::MissingRequiredField {
                paths: paths.iter().map(|p| p.to_string()).collect(),
            })
    }

    /// Scalars are rendered as strings; arrays and objects are not strings.
    pub fn string(&self, paths: &[&str]) -> Option<String> {
        self.value(paths).and_then(scalar_string)
    }

    pub fn string_or(&self, paths: &[&str], default: &str) -> String {
        self.string(paths).unwrap_or_else(|| default.to_string())
    }

    pub fn require_string(&self, paths: &[&str]) -> Result<String> {
        let (path, value) = self
            .lookup(paths)
            .ok_or_else(|| EngineError::MissingRequiredField {
                paths: paths.iter().map(|p| p.to_string()).collect(),
            })?;
        scalar_string(value)
            .ok_or_else(|| EngineError::config(path, format!("expected a string, found {value}")))
    }

    pub fn bool_or(&self, paths: &[&str], default: bool) -> bool {
        self.value(paths).map(truthy).unwrap_or(default)
    }

    /// Integer coercion: numbers (truncated), numeric strings and booleans.
    /// An absent field yields the default; a present but non-numeric one is
    /// an error naming the path it came from.
    pub fn int_or(&self, paths: &[&str], default: i64) -> Result<i64> {
        match self.lookup(paths) {
            None => Ok(default),
            Some((path, value)) => coerce_int(value).ok_or_else(|| {
                EngineError::config(path, format!("expected an integer, found {value}"))
            }),
        }
    }

    pub fn string_list(&self, paths: &[&str]) -> Option<Vec<String>> {
        match self.value(paths)? {
            Value::Array(items) => Some(items.iter().filter_map(scalar_string).collect()),
            Value::String(s) => Some(
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect(),
            ),
            _ => None,
        }
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn pointer_conversion() {
        assert_eq!(to_pointer("tools.kraken2.db"), "/tools/kraken2/db");
        assert_eq!(to_pointer("input.files[1]"), "/input/files/1");
        assert_eq!(to_pointer("a/b.c"), "/a~1b/c");
    }

    #[test]
    fn first_present_alias_wins() {
        let doc = json!({
            "kraken2_db": "/legacy/db",
            "tools": { "kraken2": { "db": "/new/db" } }
        });
        let r = ConfigResolver::new(&doc);
        let (path, value) = r.lookup(&["tools.kraken2.db", "kraken2_db"]).unwrap();
        assert_eq!(path, "tools.kraken2.db");
        assert_eq!(value, "/new/db");
        assert_eq!(
            r.string(&["databases.kraken2", "kraken2_db"]).as_deref(),
            Some("/legacy/db")
        );
    }

    #[test]
    fn null_is_treated_as_absent() {
        let doc = json!({ "run": { "run_dir": null }, "run_dir": "/tmp/r" });
        let r = ConfigResolver::new(&doc);
        assert_eq!(r.string(&["run.run_dir", "run_dir"]).as_deref(), Some("/tmp/r"));
    }

    #[test]
    fn truthy_parsing_is_permissive() {
        for v in [json!(1), json!(true), json!("YES"), json!(" on "), json!("True")] {
            assert!(truthy(&v), "{v} should be truthy");
        }
        for v in [json!(0), json!(2), json!("no"), json!("enabled"), json!(null), json!([])] {
            assert!(!truthy(&v), "{v} should be falsy");
        }
    }

    #[test]
    fn int_coercion() {
        let doc = json!({ "a": "12", "b": 3.7, "c": true, "d": "many" });
        let r = ConfigResolver::new(&doc);
        assert_eq!(r.int_or(&["a"], 0).unwrap(), 12);
        assert_eq!(r.int_or(&["b"], 0).unwrap(), 3);
        assert_eq!(r.int_or(&["c"], 0).unwrap(), 1);
        assert_eq!(r.int_or(&["missing"], 7).unwrap(), 7);
        let err = r.int_or(&["d"], 0).unwrap_err();
        assert!(err.to_string().contains("`d`"));
    }

    #[test]
    fn require_names_every_path() {
        let doc = json!({});
        let r = ConfigResolver::new(&doc);
        match r.require(&["run.run_dir", "run_dir"]) {
            Err(EngineError::MissingRequiredField { paths }) => {
                assert_eq!(paths, vec!["run.run_dir", "run_dir"])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn string_list_accepts_arrays_and_csv() {
        let doc = json!({ "a": ["vaginal", "vagina"], "b": "oral, skin" });
        let r = ConfigResolver::new(&doc);
        assert_eq!(r.string_list(&["a"]).unwrap(), vec!["vaginal", "vagina"]);
        assert_eq!(r.string_list(&["b"]).unwrap(), vec!["oral", "skin"]);
        assert!(r.string_list(&["c"]).is_none());
    }

    proptest! {
        #[test]
        fn optional_lookups_never_fail_on_absent_fields(
            keys in proptest::collection::vec("[a-z]{1,6}", 1..4),
            default in any::<i64>(),
            flag in any::<bool>(),
        ) {
            let doc = json!({ "unrelated": { "field": 1 } });
            let r = ConfigResolver::new(&doc);
            let path = keys.join(".");
            prop_assume!(path != "unrelated" && !path.starts_with("unrelated."));
            prop_assert_eq!(r.int_or(&[path.as_str()], default).unwrap(), default);
            prop_assert_eq!(r.bool_or(&[path.as_str()], flag), flag);
            prop_assert_eq!(r.string_or(&[path.as_str()], "x"), "x");
        }
    }
}
