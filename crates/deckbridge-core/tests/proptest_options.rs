//! Property tests for the option parser and the state-transition
//! algebra.
//!
//! The parser properties pin the sanitization boundary: output keys are
//! always a subset of the declared fields, undeclared input never leaks
//! through, and ignored-for-subscribe fields never contribute to the
//! returned variable set. The state properties pin the invalidation and
//! failure transitions the scheduler composes.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;
use serde_json::{json, Value};

use deckbridge_core::{
    parse_entity_options, ControlId, EntityDefinition, EntityKind, EntityState, OptionField,
    OptionFieldKind, OptionsMap, ParsedExpression, VariablesParser,
};

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

#[derive(Debug, Clone)]
struct FieldShape {
    textual: bool,
    use_variables: bool,
    ignored: bool,
    variables: Vec<String>,
    present_in_raw: bool,
}

fn field_shape() -> impl Strategy<Value = FieldShape> {
    (
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        prop::collection::vec("[a-z]{1,4}", 0..3),
        prop::bool::weighted(0.8),
    )
        .prop_map(
            |(textual, use_variables, ignored, variables, present_in_raw)| FieldShape {
                textual,
                use_variables,
                ignored,
                variables,
                present_in_raw,
            },
        )
}

fn field_shapes() -> impl Strategy<Value = HashMap<String, FieldShape>> {
    prop::collection::hash_map("[a-z]{1,4}", field_shape(), 0..6)
}

fn undeclared_extras() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("zz_[a-z]{1,4}", 0..4)
}

/// Raw value for a declared field: variable-bearing text for
/// substituting fields, an inert number otherwise.
fn raw_value(shape: &FieldShape) -> Value {
    if shape.textual && shape.use_variables {
        let mut text = String::new();
        for variable in &shape.variables {
            text.push_str("$(");
            text.push_str(variable);
            text.push_str(") ");
        }
        json!(text)
    } else {
        json!(7)
    }
}

fn build_inputs(
    shapes: &HashMap<String, FieldShape>,
    extras: &[String],
) -> (EntityDefinition, OptionsMap) {
    let mut definition = EntityDefinition {
        id: "def".to_string(),
        kind: EntityKind::Feedback,
        option_fields: Vec::new(),
        ignored_for_subscribe: HashSet::new(),
        has_lifecycle_functions: true,
    };
    let mut raw = OptionsMap::new();
    for (id, shape) in shapes {
        definition.option_fields.push(OptionField {
            id: id.clone(),
            kind: if shape.textual {
                OptionFieldKind::TextInput
            } else {
                OptionFieldKind::Number
            },
            use_variables: shape.use_variables,
        });
        if shape.ignored {
            definition.ignored_for_subscribe.insert(id.clone());
        }
        if shape.present_in_raw {
            raw.insert(id.clone(), raw_value(shape));
        }
    }
    for extra in extras {
        raw.insert(extra.clone(), json!("$(leak)"));
    }
    (definition, raw)
}

proptest! {
    #[test]
    fn parser_output_keys_are_declared_and_present(
        shapes in field_shapes(),
        extras in undeclared_extras(),
    ) {
        let (definition, raw) = build_inputs(&shapes, &extras);
        let parsed = parse_entity_options(
            Some(&definition),
            &raw,
            &"c1".to_string(),
            &TokenParser,
        );
        for key in parsed.options.keys() {
            prop_assert!(shapes.contains_key(key), "undeclared key {key} leaked");
            prop_assert!(raw.contains_key(key), "key {key} not present in raw input");
        }
        prop_assert!(!parsed.referenced_variables.contains("leak"));
    }

    #[test]
    fn parser_reports_exactly_the_subscribed_variables(
        shapes in field_shapes(),
    ) {
        let (definition, raw) = build_inputs(&shapes, &[]);
        let parsed = parse_entity_options(
            Some(&definition),
            &raw,
            &"c1".to_string(),
            &TokenParser,
        );
        let mut expected = HashSet::new();
        for shape in shapes.values() {
            let substitutes = shape.textual && shape.use_variables;
            if substitutes && shape.present_in_raw && !shape.ignored {
                expected.extend(shape.variables.iter().cloned());
            }
        }
        prop_assert_eq!(parsed.referenced_variables, expected);
    }

    #[test]
    fn parser_copies_non_substituting_fields_verbatim(
        shapes in field_shapes(),
    ) {
        let (definition, raw) = build_inputs(&shapes, &[]);
        let parsed = parse_entity_options(
            Some(&definition),
            &raw,
            &"c1".to_string(),
            &TokenParser,
        );
        for (id, shape) in &shapes {
            if shape.present_in_raw && !(shape.textual && shape.use_variables) {
                prop_assert_eq!(parsed.options.get(id), raw.get(id));
            }
        }
    }

    #[test]
    fn parser_without_definition_is_identity(
        keys in prop::collection::vec("[a-z]{1,6}", 0..8),
    ) {
        let mut raw = OptionsMap::new();
        for key in keys {
            raw.insert(key, json!("$(v)"));
        }
        let parsed = parse_entity_options(None, &raw, &"c1".to_string(), &TokenParser);
        prop_assert_eq!(parsed.options, raw);
        prop_assert!(parsed.referenced_variables.is_empty());
    }
}

fn any_state() -> impl Strategy<Value = EntityState> {
    prop_oneof![
        Just(EntityState::Unloaded),
        Just(EntityState::Upgrading),
        Just(EntityState::UpgradingInvalidated),
        Just(EntityState::Ready),
        Just(EntityState::PendingDelete),
    ]
}

proptest! {
    #[test]
    fn invalidation_is_idempotent_and_preserves_flight(state in any_state()) {
        let once = state.after_invalidation();
        prop_assert_eq!(once.after_invalidation(), once);
        prop_assert_eq!(once.upgrade_in_flight(), state.upgrade_in_flight());
    }

    #[test]
    fn upgrade_failure_always_lands_outside_the_flight(state in any_state()) {
        let landed = state.after_upgrade_failure();
        prop_assert!(!landed.upgrade_in_flight());
        prop_assert_eq!(landed.after_upgrade_failure(), landed);
    }

    #[test]
    fn pending_delete_absorbs_every_transition(
        ops in prop::collection::vec(any::<bool>(), 0..12),
    ) {
        let mut state = EntityState::PendingDelete;
        for invalidate in ops {
            state = if invalidate {
                state.after_invalidation()
            } else {
                state.after_upgrade_failure()
            };
            prop_assert_eq!(state, EntityState::PendingDelete);
        }
    }
}
