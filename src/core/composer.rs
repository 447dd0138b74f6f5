//! # Composer
//!
//! Turns the conditional fragments configured for an action into the concrete
//! script a target runs. Conditions are evaluated against an [`ExpressionContext`]
//! built once per target and action; a malformed condition aborts composition
//! rather than silently running a partial or default script.

use crate::{
    constants::{
        DEFAULT_BUILD_SCRIPT, DEFAULT_CLEAN_SCRIPT, DEFAULT_FETCH_SCRIPT, DEFAULT_INSTALL_SCRIPT,
    },
    core::expression::{self, ExpressionContext, ExpressionError, Value},
    models::{ActionKind, ConditionalFragment, Target, VarValue, Versions},
};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComposeError {
    #[error("invalid condition `{condition}` on a '{action}' fragment: {source}")]
    InvalidCondition {
        action: ActionKind,
        condition: String,
        #[source]
        source: ExpressionError,
    },
}

/// Where a composed script came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptSource {
    Configured,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedScript {
    pub body: String,
    pub source: ScriptSource,
}

impl ComposedScript {
    /// True when every configured fragment was skipped.
    pub fn is_blank(&self) -> bool {
        self.body.trim().is_empty()
    }
}

/// The built-in script used when a target configures no fragments for an action.
pub fn default_script(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Fetch => DEFAULT_FETCH_SCRIPT,
        ActionKind::Clean => DEFAULT_CLEAN_SCRIPT,
        ActionKind::Install => DEFAULT_INSTALL_SCRIPT,
        ActionKind::Build => DEFAULT_BUILD_SCRIPT,
    }
}

/// Builds the identifiers visible to a target's conditions.
///
/// Target `vars` are applied last so a repository can override the built-in names.
pub fn build_context(target: &Target, kind: ActionKind, versions: &Versions) -> ExpressionContext {
    let mut values: HashMap<String, Value> = HashMap::new();
    values.insert("projectName".into(), Value::from(target.name.as_str()));
    values.insert(
        "projectPath".into(),
        Value::from(target.path.to_string_lossy().into_owned()),
    );
    values.insert("actionName".into(), Value::from(kind.name()));
    values.insert(
        "nodeVersion".into(),
        Value::from(versions.node.clone().unwrap_or_default()),
    );
    values.insert(
        "pnpmVersion".into(),
        Value::from(versions.pnpm.clone().unwrap_or_default()),
    );
    for (name, var) in &target.vars {
        let value = match var {
            VarValue::Number(n) => Value::Number(*n),
            VarValue::Text(s) => Value::String(s.clone()),
        };
        values.insert(name.clone(), value);
    }
    ExpressionContext::new(values)
}

/// Composes the script for one action.
///
/// With fragments configured, the result is the in-order concatenation of every
/// fragment whose condition is absent or true. Without fragments, the built-in
/// default for the action is returned verbatim.
///
/// # Errors
/// Returns [`ComposeError::InvalidCondition`] for the first malformed condition.
/// Conditions are all validated, even those after a fragment that already matched.
pub fn compose(
    kind: ActionKind,
    fragments: Option<&[ConditionalFragment]>,
    context: &ExpressionContext,
) -> Result<ComposedScript, ComposeError> {
    let Some(fragments) = fragments else {
        log::debug!("Using default '{}' script.", kind);
        return Ok(ComposedScript {
            body: default_script(kind).to_string(),
            source: ScriptSource::Default,
        });
    };

    let mut body = String::new();
    for fragment in fragments {
        let condition = fragment.condition.as_deref().filter(|c| !c.is_empty());

        let include = match condition {
            None => true,
            Some(condition) => expression::evaluate(condition, context).map_err(|source| {
                ComposeError::InvalidCondition {
                    action: kind,
                    condition: condition.to_string(),
                    source,
                }
            })?,
        };

        if include {
            body.push_str(&fragment.value);
        } else {
            log::debug!(
                "Skipping '{}' fragment, condition not met: {}",
                kind,
                condition.unwrap_or_default()
            );
        }
    }

    Ok(ComposedScript {
        body,
        source: ScriptSource::Configured,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn fragment(value: &str, condition: Option<&str>) -> ConditionalFragment {
        ConditionalFragment {
            value: value.to_string(),
            condition: condition.map(str::to_string),
        }
    }

    fn target(name: &str) -> Target {
        Target {
            name: name.to_string(),
            path: PathBuf::from("/work").join(name),
            vars: BTreeMap::new(),
            actions: BTreeMap::new(),
        }
    }

    #[test]
    fn test_compose_keeps_only_matching_fragments() {
        let context = ExpressionContext::from_iter([("projectName", "foo")]);
        let fragments = [
            fragment("a", Some("projectName == 'foo'")),
            fragment("b", Some("projectName == 'bar'")),
        ];
        let script = compose(ActionKind::Build, Some(&fragments), &context).unwrap();
        assert_eq!(script.body, "a");
        assert_eq!(script.source, ScriptSource::Configured);
    }

    #[test]
    fn test_compose_preserves_declared_order_and_unconditional_fragments() {
        let context = ExpressionContext::from_iter([("projectName", "foo")]);
        let fragments = [
            fragment("one\n", None),
            fragment("two\n", Some("projectName != 'bar'")),
            fragment("three\n", Some("")),
        ];
        let script = compose(ActionKind::Install, Some(&fragments), &context).unwrap();
        assert_eq!(script.body, "one\ntwo\nthree\n");
    }

    #[test]
    fn test_compose_rejects_whitespace_only_condition() {
        let fragments = [fragment("rm -rf dist\n", Some("   "))];
        let err = compose(
            ActionKind::Build,
            Some(&fragments),
            &ExpressionContext::default(),
        )
        .unwrap_err();
        let ComposeError::InvalidCondition {
            condition, source, ..
        } = err;
        assert_eq!(condition, "   ");
        assert!(matches!(
            source,
            ExpressionError::IncompleteComparison { .. }
        ));
    }

    #[test]
    fn test_compose_falls_back_to_default_without_fragments() {
        let script = compose(ActionKind::Fetch, None, &ExpressionContext::default()).unwrap();
        assert_eq!(script.body, DEFAULT_FETCH_SCRIPT);
        assert_eq!(script.source, ScriptSource::Default);
    }

    #[test]
    fn test_compose_with_all_fragments_skipped_is_blank() {
        let fragments = [fragment("a", Some("projectName == 'nope'"))];
        let script = compose(
            ActionKind::Clean,
            Some(&fragments),
            &ExpressionContext::default(),
        )
        .unwrap();
        assert!(script.is_blank());
        assert_eq!(script.source, ScriptSource::Configured);
    }

    #[test]
    fn test_compose_fails_closed_on_malformed_condition() {
        let fragments = [
            fragment("safe", None),
            fragment("never", Some("(projectName == 'foo'")),
        ];
        let err = compose(
            ActionKind::Build,
            Some(&fragments),
            &ExpressionContext::default(),
        )
        .unwrap_err();
        let ComposeError::InvalidCondition {
            action, condition, ..
        } = err;
        assert_eq!(action, ActionKind::Build);
        assert_eq!(condition, "(projectName == 'foo'");
    }

    #[test]
    fn test_build_context_exposes_target_and_vars() {
        let mut t = target("api");
        t.vars.insert("tier".into(), VarValue::Number(2.0));
        t.vars.insert("region".into(), VarValue::Text("eu".into()));
        let versions = Versions {
            node: Some("20".into()),
            pnpm: None,
        };
        let context = build_context(&t, ActionKind::Install, &versions);

        assert_eq!(context.get("projectName"), Some(&Value::from("api")));
        assert_eq!(context.get("actionName"), Some(&Value::from("install")));
        assert_eq!(context.get("nodeVersion"), Some(&Value::from("20")));
        assert_eq!(context.get("pnpmVersion"), Some(&Value::from("")));
        assert_eq!(context.get("tier"), Some(&Value::Number(2.0)));
        assert!(expression::evaluate("tier >= 2 && region == 'eu'", &context).unwrap());
    }
}
