//! Option parsing and sanitization.
//!
//! Pure: given a definition, a raw option map and the variable parser,
//! produce the option map the module should see plus the set of variable
//! ids the parse depended on. The returned variable set drives
//! re-evaluation on variable change, so fields the definition marks as
//! ignored for subscription contribute their substituted text but not
//! their variables.

use std::collections::HashSet;

use serde_json::Value;

use crate::model::{ControlId, EntityDefinition, OptionFieldKind, OptionsMap, VariableId};
use crate::surface::VariablesParser;

/// Output of [`parse_entity_options`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOptions {
    /// Sanitized option map: declared fields only, textual
    /// variable-bearing fields substituted.
    pub options: OptionsMap,
    /// Variable ids the parse touched, minus those from
    /// `ignored_for_subscribe` fields.
    pub referenced_variables: HashSet<VariableId>,
}

/// Parse an entity's raw options against its definition.
///
/// With no definition available the raw options pass through unchanged
/// and the variable set is empty: without field declarations there is no
/// way to know which values need parsing, and dropping them all would
/// destroy user configuration.
#[must_use]
pub fn parse_entity_options(
    definition: Option<&EntityDefinition>,
    raw: &OptionsMap,
    control_id: &ControlId,
    parser: &dyn VariablesParser,
) -> ParsedOptions {
    let Some(definition) = definition else {
        return ParsedOptions {
            options: raw.clone(),
            referenced_variables: HashSet::new(),
        };
    };

    let mut options = OptionsMap::new();
    let mut referenced_variables = HashSet::new();

    // Undeclared raw fields are dropped here; this is the sanitization
    // boundary between user input and the module.
    for field in &definition.option_fields {
        let Some(raw_value) = raw.get(&field.id) else {
            continue;
        };

        let substitutes = field.kind == OptionFieldKind::TextInput && field.use_variables;
        if !substitutes {
            options.insert(field.id.clone(), raw_value.clone());
            continue;
        }

        let parsed = parser.parse_variables(&stringify(raw_value), control_id);
        options.insert(field.id.clone(), Value::String(parsed.text));
        if !definition.ignored_for_subscribe.contains(&field.id) {
            referenced_variables.extend(parsed.variable_ids);
        }
    }

    ParsedOptions {
        options,
        referenced_variables,
    }
}

/// Textual form of a raw option value for substitution purposes.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, OptionField};
    use crate::surface::ParsedExpression;
    use serde_json::json;

    /// Substitutes `$(name)` tokens with `name.len()` and records them.
    struct TokenParser;

    impl VariablesParser for TokenParser {
        fn parse_variables(&self, text: &str, _control_id: &ControlId) -> ParsedExpression {
            let mut out = String::new();
            let mut variable_ids = HashSet::new();
            let mut rest = text;
            while let Some(start) = rest.find("$(") {
                out.push_str(&rest[..start]);
                let tail = &rest[start + 2..];
                match tail.find(')') {
                    Some(end) => {
                        let name = &tail[..end];
                        out.push_str(&name.len().to_string());
                        variable_ids.insert(name.to_string());
                        rest = &tail[end + 1..];
                    }
                    None => {
                        out.push_str(&rest[start..]);
                        rest = "";
                    }
                }
            }
            out.push_str(rest);
            ParsedExpression {
                text: out,
                variable_ids,
            }
        }
    }

    fn definition(fields: Vec<OptionField>, ignored: &[&str]) -> EntityDefinition {
        EntityDefinition {
            id: "def1".to_string(),
            kind: EntityKind::Feedback,
            option_fields: fields,
            ignored_for_subscribe: ignored.iter().map(ToString::to_string).collect(),
            has_lifecycle_functions: true,
        }
    }

    fn text_field(id: &str, use_variables: bool) -> OptionField {
        OptionField {
            id: id.to_string(),
            kind: OptionFieldKind::TextInput,
            use_variables,
        }
    }

    #[test]
    fn unknown_definition_passes_through() {
        let mut raw = OptionsMap::new();
        raw.insert("anything".to_string(), json!("$(v1)"));
        let parsed = parse_entity_options(None, &raw, &"c1".to_string(), &TokenParser);
        assert_eq!(parsed.options, raw);
        assert!(parsed.referenced_variables.is_empty());
    }

    #[test]
    fn undeclared_fields_are_dropped() {
        let def = definition(vec![text_field("label", false)], &[]);
        let mut raw = OptionsMap::new();
        raw.insert("label".to_string(), json!("hello"));
        raw.insert("stale".to_string(), json!(42));
        let parsed = parse_entity_options(Some(&def), &raw, &"c1".to_string(), &TokenParser);
        assert_eq!(parsed.options.len(), 1);
        assert_eq!(parsed.options.get("label"), Some(&json!("hello")));
    }

    #[test]
    fn declared_but_absent_fields_stay_absent() {
        let def = definition(vec![text_field("label", true)], &[]);
        let raw = OptionsMap::new();
        let parsed = parse_entity_options(Some(&def), &raw, &"c1".to_string(), &TokenParser);
        assert!(parsed.options.is_empty());
        assert!(parsed.referenced_variables.is_empty());
    }

    #[test]
    fn textual_variable_fields_are_substituted() {
        let def = definition(vec![text_field("label", true)], &[]);
        let mut raw = OptionsMap::new();
        raw.insert("label".to_string(), json!("x $(v1) y"));
        let parsed = parse_entity_options(Some(&def), &raw, &"c1".to_string(), &TokenParser);
        assert_eq!(parsed.options.get("label"), Some(&json!("x 2 y")));
        assert_eq!(
            parsed.referenced_variables,
            HashSet::from(["v1".to_string()])
        );
    }

    #[test]
    fn non_variable_fields_copy_raw_values() {
        let def = definition(
            vec![
                text_field("plain", false),
                OptionField {
                    id: "count".to_string(),
                    kind: OptionFieldKind::Number,
                    use_variables: true,
                },
            ],
            &[],
        );
        let mut raw = OptionsMap::new();
        raw.insert("plain".to_string(), json!("$(v1)"));
        raw.insert("count".to_string(), json!(7));
        let parsed = parse_entity_options(Some(&def), &raw, &"c1".to_string(), &TokenParser);
        // Non-textual or non-use_variables fields keep their value and
        // contribute no variables, even when the text looks like one.
        assert_eq!(parsed.options.get("plain"), Some(&json!("$(v1)")));
        assert_eq!(parsed.options.get("count"), Some(&json!(7)));
        assert!(parsed.referenced_variables.is_empty());
    }

    #[test]
    fn numeric_values_are_stringified_before_substitution() {
        let def = definition(vec![text_field("label", true)], &[]);
        let mut raw = OptionsMap::new();
        raw.insert("label".to_string(), json!(42));
        let parsed = parse_entity_options(Some(&def), &raw, &"c1".to_string(), &TokenParser);
        assert_eq!(parsed.options.get("label"), Some(&json!("42")));
    }

    #[test]
    fn ignored_for_subscribe_excludes_variables_but_keeps_text() {
        let def = definition(
            vec![text_field("label", true), text_field("id", true)],
            &["id"],
        );
        let mut raw = OptionsMap::new();
        raw.insert("label".to_string(), json!("$(v1)$(v2)"));
        raw.insert("id".to_string(), json!("$(v3)"));
        let parsed = parse_entity_options(Some(&def), &raw, &"c1".to_string(), &TokenParser);
        assert_eq!(parsed.options.get("id"), Some(&json!("2")));
        assert_eq!(
            parsed.referenced_variables,
            HashSet::from(["v1".to_string(), "v2".to_string()])
        );
    }
}
