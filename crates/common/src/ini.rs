//! Ordered INI model used for the configuration file and for the serialized
//! copy stored in the sink's configuration table.
//!
//! Parsing keeps section and key order; serialization emits the same shape
//! back, so `parse(serialize(parse(x))) == parse(x)`.

use anyhow::Context;

use crate::errors::ErrorMetadata;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IniSection {
    /// Section name; the empty string is the unnamed global section `[]`.
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl IniSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Serializes this section alone; the configuration table stores one
    /// section per row in this form.
    pub fn serialize(&self) -> String {
        let mut out = format!("[{}]\n", self.name);
        for (k, v) in &self.entries {
            out.push_str(k);
            out.push_str(" = ");
            out.push_str(v);
            out.push('\n');
        }
        out
    }
}

pub fn parse(text: &str) -> anyhow::Result<Vec<IniSection>> {
    let mut sections: Vec<IniSection> = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.strip_suffix(']').with_context(|| {
                ErrorMetadata::config_invalid(
                    "MalformedIni",
                    format!("Unterminated section header on line {}", lineno + 1),
                )
            })?;
            sections.push(IniSection::new(name.trim()));
            continue;
        }
        let (key, value) = line.split_once('=').with_context(|| {
            ErrorMetadata::config_invalid(
                "MalformedIni",
                format!("Expected key = value on line {}", lineno + 1),
            )
        })?;
        let key = key.trim();
        anyhow::ensure!(
            !key.is_empty(),
            ErrorMetadata::config_invalid(
                "MalformedIni",
                format!("Empty key on line {}", lineno + 1),
            )
        );
        let section = match sections.last_mut() {
            Some(s) => s,
            None => {
                // Keys before any header belong to the unnamed section.
                sections.push(IniSection::new(""));
                sections.last_mut().expect("just pushed")
            },
        };
        section
            .entries
            .push((key.to_owned(), value.trim().to_owned()));
    }
    Ok(sections)
}

pub fn serialize(sections: &[IniSection]) -> String {
    let mut out = String::new();
    for section in sections {
        out.push_str(&section.serialize());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const SAMPLE: &str = r#"
[datalogger]
type = sqlite
name = plant ; not a comment, comments take whole lines
dir = ./

; a comment
[c]
type = json
address = http://127.0.0.1:8080/json
seconds = 1

[x::c]
address = foo
type = INTEGER
"#;

    #[test]
    fn test_parse_sample() {
        let sections = parse(SAMPLE).unwrap();
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].name, "datalogger");
        assert_eq!(sections[0].get("type"), Some("sqlite"));
        assert_eq!(sections[1].get("seconds"), Some("1"));
        assert_eq!(sections[2].name, "x::c");
    }

    #[test]
    fn test_unnamed_section() {
        let sections = parse("[]\nipc_port = 9997\n").unwrap();
        assert_eq!(sections[0].name, "");
        assert_eq!(sections[0].get("ipc_port"), Some("9997"));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse("[unterminated\n").is_err());
        assert!(parse("[s]\nno delimiter\n").is_err());
        assert!(parse("[s]\n= value\n").is_err());
    }

    #[test]
    fn test_parse_serialize_idempotent_on_sample() {
        let once = parse(SAMPLE).unwrap();
        let twice = parse(&serialize(&once)).unwrap();
        assert_eq!(once, twice);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]
        #[test]
        fn proptest_parse_serialize_idempotent(
            names in prop::collection::vec("[a-z][a-z0-9_:]{0,8}", 1..4),
            entries in prop::collection::vec(("[a-z][a-z0-9_]{0,8}", "[a-zA-Z0-9 _.,:/-]{0,12}"), 0..6),
        ) {
            let mut text = String::new();
            for name in &names {
                text.push_str(&format!("[{name}]\n"));
                for (k, v) in &entries {
                    text.push_str(&format!("{k}={v}\n"));
                }
            }
            let once = parse(&text).unwrap();
            let twice = parse(&serialize(&once)).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
