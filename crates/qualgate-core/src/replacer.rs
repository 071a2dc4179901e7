//! Variable replacement engine.
//!
//! Resolves placeholders of the literal shape `${{ scope.name }}` against
//! layered string-keyed sources. Scopes are `vars`, `secrets` and `env`;
//! the deprecated aliases `var`, `secret` and `envs` behave identically but
//! are logged as deprecated.
//!
//! Substitution is a visitor over a small closed set of value shapes: plain
//! strings, ordered string→string maps, nested string→value maps and
//! sequences. Every string leaf is a substitution candidate.
//!
//! Two passes run over a plan: [`replace_initial`] resolves every structural
//! field before any config file content is loaded, and
//! [`replace_config_content`] later resolves placeholders inside config file
//! text. Secret placeholders are a hard error in the second pass because
//! file content may be persisted as evidence.

use indexmap::IndexMap;
use regex::Regex;
use std::sync::LazyLock;

use crate::error::{ReplaceBatchError, ReplaceError};
use crate::model::{Environment, ExecutionPlan};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([A-Za-z]+)\.([A-Za-z0-9_-]+)\s*\}\}").unwrap()
});

/// Placeholder scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Vars,
    Secrets,
    Env,
}

impl Scope {
    fn canonical(self) -> &'static str {
        match self {
            Scope::Vars => "vars",
            Scope::Secrets => "secrets",
            Scope::Env => "env",
        }
    }
}

/// Parse a scope token, returning the scope and whether the spelling is a
/// deprecated alias. Unknown tokens are not placeholders.
fn parse_scope(token: &str) -> Option<(Scope, bool)> {
    match token {
        "vars" => Some((Scope::Vars, false)),
        "var" => Some((Scope::Vars, true)),
        "secrets" => Some((Scope::Secrets, false)),
        "secret" => Some((Scope::Secrets, true)),
        "env" => Some((Scope::Env, false)),
        "envs" => Some((Scope::Env, true)),
        _ => None,
    }
}

/// Substitution phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Structural plan fields, before config file content is loaded.
    Initial,
    /// Text content of config files. Secrets are disallowed here.
    ConfigValues,
}

/// Layered lookup sources for one substitution site, each scope ordered from
/// most specific to least specific. Resolution stops at the first layer
/// containing the name.
#[derive(Debug, Clone, Default)]
pub struct Sources<'a> {
    pub vars: Vec<&'a IndexMap<String, String>>,
    pub secrets: Vec<&'a IndexMap<String, String>>,
    pub env: Vec<&'a Environment>,
}

impl<'a> Sources<'a> {
    fn layers(&self, scope: Scope) -> &[&'a IndexMap<String, String>] {
        match scope {
            Scope::Vars => &self.vars,
            Scope::Secrets => &self.secrets,
            Scope::Env => &self.env,
        }
    }
}

/// Visitor that substitutes placeholders in place and collects per-field
/// failures. Fields that resolve keep their value regardless of failures
/// elsewhere in the same batch.
pub struct Substituter<'a> {
    sources: Sources<'a>,
    phase: Phase,
    /// Site description used in secret-in-config errors (the file name).
    context: String,
    errors: Vec<ReplaceError>,
}

impl<'a> Substituter<'a> {
    pub fn new(sources: Sources<'a>, phase: Phase) -> Self {
        Self {
            sources,
            phase,
            context: String::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Substitute placeholders in one string field.
    pub fn string(&mut self, field: &mut String) {
        let resolved = self.resolve_text(field);
        *field = resolved;
    }

    /// Substitute placeholders in every value of an ordered string map.
    pub fn string_map(&mut self, map: &mut IndexMap<String, String>) {
        for value in map.values_mut() {
            let resolved = self.resolve_text(value);
            *value = resolved;
        }
    }

    /// Substitute placeholders in every element of a string sequence.
    pub fn string_seq(&mut self, seq: &mut [String]) {
        for item in seq {
            let resolved = self.resolve_text(item);
            *item = resolved;
        }
    }

    /// Substitute placeholders in every string leaf of an arbitrary value.
    pub fn value(&mut self, value: &mut serde_json::Value) {
        match value {
            serde_json::Value::String(s) => {
                let resolved = self.resolve_text(s);
                *s = resolved;
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    self.value(item);
                }
            }
            serde_json::Value::Object(map) => {
                for (_, v) in map.iter_mut() {
                    self.value(v);
                }
            }
            _ => {}
        }
    }

    /// Drain collected errors. Empty means the whole batch succeeded.
    pub fn take_errors(&mut self) -> Vec<ReplaceError> {
        std::mem::take(&mut self.errors)
    }

    /// Finish the batch, merging collected failures into one error.
    pub fn finish(mut self) -> Result<(), ReplaceBatchError> {
        let errors = self.take_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ReplaceBatchError { errors })
        }
    }

    /// Replace every placeholder in `input`. A failing placeholder is left
    /// untouched and its error collected; siblings still resolve.
    fn resolve_text(&mut self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        // Collect matches first so `self` stays free for resolution.
        let matches: Vec<(usize, usize, String, String)> = PLACEHOLDER
            .captures_iter(input)
            .map(|caps| {
                let m = caps.get(0).unwrap();
                (m.start(), m.end(), caps[1].to_string(), caps[2].to_string())
            })
            .collect();
        for (start, end, scope_token, name) in matches {
            out.push_str(&input[last..start]);
            last = end;
            let literal = &input[start..end];
            match parse_scope(&scope_token) {
                None => out.push_str(literal),
                Some((scope, deprecated)) => {
                    if deprecated {
                        tracing::warn!(
                            scope = %scope_token,
                            name = %name,
                            "deprecated placeholder scope; use '{}'",
                            scope.canonical()
                        );
                    }
                    let mut chain = Vec::new();
                    match self.resolve(scope, &name, &mut chain) {
                        Ok(value) => out.push_str(&value),
                        Err(err) => {
                            self.errors.push(err);
                            out.push_str(literal);
                        }
                    }
                }
            }
        }
        out.push_str(&input[last..]);
        out
    }

    /// Resolve one placeholder, recursing into placeholders found in its
    /// value. `chain` tracks the names visited during this top-level call:
    /// re-visiting a name signals SelfReference when it was the only name
    /// visited so far, CircularReference otherwise. Both are terminal for
    /// this placeholder only.
    fn resolve(
        &self,
        scope: Scope,
        name: &str,
        chain: &mut Vec<String>,
    ) -> Result<String, ReplaceError> {
        if self.phase == Phase::ConfigValues && scope == Scope::Secrets {
            return Err(ReplaceError::SecretInConfig {
                file: self.context.clone(),
                name: name.to_string(),
            });
        }

        let key = format!("{}.{}", scope.canonical(), name);
        if chain.contains(&key) {
            return Err(if chain.len() == 1 {
                ReplaceError::SelfReference { name: key }
            } else {
                ReplaceError::CircularReference {
                    name: key,
                    chain: chain.clone(),
                }
            });
        }

        let raw = self
            .sources
            .layers(scope)
            .iter()
            .find_map(|layer| layer.get(name))
            .ok_or_else(|| ReplaceError::NotFound {
                scope: scope.canonical().to_string(),
                name: name.to_string(),
            })?
            .clone();

        chain.push(key);
        let resolved = self.resolve_nested(&raw, chain)?;
        chain.pop();
        Ok(resolved)
    }

    /// Resolve placeholders inside a variable's value. Unlike the top level,
    /// the first failure aborts the whole placeholder.
    fn resolve_nested(
        &self,
        input: &str,
        chain: &mut Vec<String>,
    ) -> Result<String, ReplaceError> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(input) {
            let m = caps.get(0).unwrap();
            out.push_str(&input[last..m.start()]);
            last = m.end();
            match parse_scope(&caps[1]) {
                None => out.push_str(m.as_str()),
                Some((scope, _)) => {
                    let value = self.resolve(scope, &caps[2], chain)?;
                    out.push_str(&value);
                }
            }
        }
        out.push_str(&input[last..]);
        Ok(out)
    }
}

/// Resolve every structural field of the plan in place (the "Initial" pass).
///
/// While the global environment map itself is being replaced, it is excluded
/// as an `env` lookup source to avoid trivial self-reference; every
/// more-local layer (check, autopilot, step, evaluate, finalize) resolves
/// against the layers below it plus the global map.
///
/// Per-field failures are collected and merged into one combined error;
/// fields that resolved keep their values.
pub fn replace_initial(
    plan: &mut ExecutionPlan,
    secrets: &IndexMap<String, String>,
) -> Result<(), ReplaceBatchError> {
    let mut errors = Vec::new();

    // Default variables first: they feed every later lookup.
    let vars_snapshot = plan.default_vars.clone();
    {
        let sources = Sources {
            vars: vec![&vars_snapshot],
            secrets: vec![secrets],
            env: vec![],
        };
        let mut sub = Substituter::new(sources, Phase::Initial);
        sub.string_map(&mut plan.default_vars);
        errors.extend(sub.take_errors());
    }
    let vars = plan.default_vars.clone();

    // Global environment, with itself excluded as an env source.
    {
        let sources = Sources {
            vars: vec![&vars],
            secrets: vec![secrets],
            env: vec![],
        };
        let mut sub = Substituter::new(sources, Phase::Initial);
        sub.string_map(&mut plan.env);
        errors.extend(sub.take_errors());
    }
    let global_env = plan.env.clone();

    {
        let sources = Sources {
            vars: vec![&vars],
            secrets: vec![secrets],
            env: vec![&global_env],
        };
        let mut sub = Substituter::new(sources, Phase::Initial);
        sub.string(&mut plan.header.name);
        sub.string(&mut plan.header.version);
        for repo in &mut plan.repositories {
            sub.string(&mut repo.url);
            for (_, value) in repo.config.iter_mut() {
                sub.value(value);
            }
        }
        for check in &mut plan.manual_checks {
            sub.string(&mut check.item.chapter.title);
            sub.string(&mut check.item.chapter.text);
            sub.string(&mut check.item.requirement.title);
            sub.string(&mut check.item.requirement.text);
            sub.string(&mut check.item.check.title);
            sub.string(&mut check.reason);
        }
        errors.extend(sub.take_errors());
    }

    for check in &mut plan.autopilot_checks {
        replace_autopilot_check(check, &vars, secrets, &global_env, &mut errors);
    }

    if let Some(finalize) = &mut plan.finalize {
        {
            let sources = Sources {
                vars: vec![&vars],
                secrets: vec![secrets],
                env: vec![&global_env],
            };
            let mut sub = Substituter::new(sources, Phase::Initial);
            sub.string_map(&mut finalize.env);
            errors.extend(sub.take_errors());
        }
        let finalize_env = finalize.env.clone();
        let sources = Sources {
            vars: vec![&vars],
            secrets: vec![secrets],
            env: vec![&finalize_env, &global_env],
        };
        let mut sub = Substituter::new(sources, Phase::Initial);
        sub.string(&mut finalize.run);
        sub.string_seq(&mut finalize.config_files);
        errors.extend(sub.take_errors());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ReplaceBatchError { errors })
    }
}

fn replace_autopilot_check(
    check: &mut crate::model::AutopilotCheck,
    vars: &IndexMap<String, String>,
    secrets: &IndexMap<String, String>,
    global_env: &Environment,
    errors: &mut Vec<ReplaceError>,
) {
    // Check-local environment resolves against the global layer only.
    {
        let sources = Sources {
            vars: vec![vars],
            secrets: vec![secrets],
            env: vec![global_env],
        };
        let mut sub = Substituter::new(sources, Phase::Initial);
        sub.string_map(&mut check.env);
        sub.string(&mut check.item.chapter.title);
        sub.string(&mut check.item.chapter.text);
        sub.string(&mut check.item.requirement.title);
        sub.string(&mut check.item.requirement.text);
        sub.string(&mut check.item.check.title);
        errors.extend(sub.take_errors());
    }
    let check_env = check.env.clone();

    {
        let sources = Sources {
            vars: vec![vars],
            secrets: vec![secrets],
            env: vec![&check_env, global_env],
        };
        let mut sub = Substituter::new(sources, Phase::Initial);
        sub.string_map(&mut check.autopilot.env);
        errors.extend(sub.take_errors());
    }
    let autopilot_env = check.autopilot.env.clone();

    for level in &mut check.autopilot.steps {
        for step in level {
            {
                let sources = Sources {
                    vars: vec![vars],
                    secrets: vec![secrets],
                    env: vec![&autopilot_env, &check_env, global_env],
                };
                let mut sub = Substituter::new(sources, Phase::Initial);
                sub.string_map(&mut step.env);
                errors.extend(sub.take_errors());
            }
            let step_env = step.env.clone();
            let sources = Sources {
                vars: vec![vars],
                secrets: vec![secrets],
                env: vec![&step_env, &autopilot_env, &check_env, global_env],
            };
            let mut sub = Substituter::new(sources, Phase::Initial);
            sub.string(&mut step.title);
            sub.string(&mut step.run);
            sub.string_seq(&mut step.config_files);
            errors.extend(sub.take_errors());
        }
    }

    {
        let sources = Sources {
            vars: vec![vars],
            secrets: vec![secrets],
            env: vec![&autopilot_env, &check_env, global_env],
        };
        let mut sub = Substituter::new(sources, Phase::Initial);
        sub.string_map(&mut check.autopilot.evaluate.env);
        errors.extend(sub.take_errors());
    }
    let evaluate_env = check.autopilot.evaluate.env.clone();
    let sources = Sources {
        vars: vec![vars],
        secrets: vec![secrets],
        env: vec![&evaluate_env, &autopilot_env, &check_env, global_env],
    };
    let mut sub = Substituter::new(sources, Phase::Initial);
    sub.string(&mut check.autopilot.evaluate.run);
    sub.string_seq(&mut check.autopilot.evaluate.config_files);
    errors.extend(sub.take_errors());
}

/// Resolve placeholders inside config file content (the "ConfigValues"
/// pass). Any `secrets` placeholder in the content is a hard error.
pub fn replace_config_content(
    content: &str,
    file_name: &str,
    sources: Sources<'_>,
) -> Result<String, ReplaceBatchError> {
    let mut sub = Substituter::new(sources, Phase::ConfigValues).with_context(file_name);
    let mut text = content.to_string();
    sub.string(&mut text);
    sub.finish()?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn resolve_one(env: &Environment, text: &str) -> (String, Vec<ReplaceError>) {
        let sources = Sources {
            vars: vec![],
            secrets: vec![],
            env: vec![env],
        };
        let mut sub = Substituter::new(sources, Phase::Initial);
        let mut s = text.to_string();
        sub.string(&mut s);
        (s, sub.take_errors())
    }

    #[test]
    fn test_simple_env_resolution() {
        let env = map(&[("FOO", "bar")]);
        let (out, errors) = resolve_one(&env, "value is ${{ env.FOO }}");
        assert_eq!(out, "value is bar");
        assert!(errors.is_empty());
    }

    #[test]
    fn test_layering_stops_at_most_specific() {
        let local = map(&[("NAME", "local")]);
        let global = map(&[("NAME", "global"), ("ONLY_GLOBAL", "g")]);
        let sources = Sources {
            vars: vec![],
            secrets: vec![],
            env: vec![&local, &global],
        };
        let mut sub = Substituter::new(sources, Phase::Initial);
        let mut s = "${{ env.NAME }}/${{ env.ONLY_GLOBAL }}".to_string();
        sub.string(&mut s);
        assert_eq!(s, "local/g");
        assert!(sub.take_errors().is_empty());
    }

    #[test]
    fn test_not_found_keeps_literal_and_collects_error() {
        let env = map(&[("A", "1")]);
        let (out, errors) = resolve_one(&env, "${{ env.A }} ${{ env.MISSING }}");
        assert_eq!(out, "1 ${{ env.MISSING }}");
        assert_eq!(
            errors,
            vec![ReplaceError::NotFound {
                scope: "env".to_string(),
                name: "MISSING".to_string(),
            }]
        );
    }

    #[test]
    fn test_self_reference_detected() {
        let env = map(&[("FOO", "${{ env.FOO }}")]);
        let (out, errors) = resolve_one(&env, "${{ env.FOO }}");
        assert_eq!(out, "${{ env.FOO }}");
        assert_eq!(
            errors,
            vec![ReplaceError::SelfReference {
                name: "env.FOO".to_string(),
            }]
        );
    }

    #[test]
    fn test_circular_reference_detected() {
        let env = map(&[("FOO", "${{ env.BAR }}"), ("BAR", "${{ env.FOO }}")]);
        let (_, errors) = resolve_one(&env, "${{ env.FOO }}");
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ReplaceError::CircularReference { name, .. } if name == "env.FOO"
        ));
    }

    #[test]
    fn test_nested_resolution_succeeds() {
        let env = map(&[("OUTER", "a-${{ env.INNER }}-z"), ("INNER", "42")]);
        let (out, errors) = resolve_one(&env, "${{ env.OUTER }}");
        assert_eq!(out, "a-42-z");
        assert!(errors.is_empty());
    }

    #[test]
    fn test_deprecated_alias_resolves_like_canonical() {
        let env = map(&[("FOO", "bar")]);
        let (out, errors) = resolve_one(&env, "${{ envs.FOO }}");
        assert_eq!(out, "bar");
        assert!(errors.is_empty());
    }

    #[test]
    fn test_unknown_scope_is_left_untouched() {
        let env = map(&[("FOO", "bar")]);
        let (out, errors) = resolve_one(&env, "${{ nope.FOO }}");
        assert_eq!(out, "${{ nope.FOO }}");
        assert!(errors.is_empty());
    }

    #[test]
    fn test_vars_and_secrets_scopes() {
        let vars = map(&[("version", "2.0")]);
        let secrets = map(&[("TOKEN", "tok-123")]);
        let sources = Sources {
            vars: vec![&vars],
            secrets: vec![&secrets],
            env: vec![],
        };
        let mut sub = Substituter::new(sources, Phase::Initial);
        let mut s = "v=${{ vars.version }} t=${{ secrets.TOKEN }}".to_string();
        sub.string(&mut s);
        assert_eq!(s, "v=2.0 t=tok-123");
        assert!(sub.take_errors().is_empty());
    }

    #[test]
    fn test_secret_in_config_content_is_hard_error() {
        let secrets = map(&[("TOKEN", "tok-123")]);
        let sources = Sources {
            vars: vec![],
            secrets: vec![&secrets],
            env: vec![],
        };
        let err = replace_config_content("token: ${{ secrets.TOKEN }}", "app.yaml", sources)
            .unwrap_err();
        assert_eq!(
            err.errors,
            vec![ReplaceError::SecretInConfig {
                file: "app.yaml".to_string(),
                name: "TOKEN".to_string(),
            }]
        );
    }

    #[test]
    fn test_config_content_resolves_env_and_vars() {
        let vars = map(&[("threshold", "0.8")]);
        let env = map(&[("TARGET", "prod")]);
        let sources = Sources {
            vars: vec![&vars],
            secrets: vec![],
            env: vec![&env],
        };
        let out = replace_config_content(
            "target=${{ env.TARGET }} threshold=${{ vars.threshold }}",
            "cfg.ini",
            sources,
        )
        .unwrap();
        assert_eq!(out, "target=prod threshold=0.8");
    }

    #[test]
    fn test_value_visitor_reaches_nested_string_leaves() {
        let env = map(&[("X", "resolved")]);
        let sources = Sources {
            vars: vec![],
            secrets: vec![],
            env: vec![&env],
        };
        let mut sub = Substituter::new(sources, Phase::Initial);
        let mut value = serde_json::json!({
            "plain": "${{ env.X }}",
            "list": ["${{ env.X }}", 7],
            "nested": { "deep": "${{ env.X }}" }
        });
        sub.value(&mut value);
        assert!(sub.take_errors().is_empty());
        assert_eq!(value["plain"], "resolved");
        assert_eq!(value["list"][0], "resolved");
        assert_eq!(value["nested"]["deep"], "resolved");
    }

    #[test]
    fn test_replace_initial_excludes_global_env_from_itself() {
        let mut plan = ExecutionPlan {
            env: map(&[("A", "${{ env.B }}"), ("B", "x")]),
            ..Default::default()
        };
        let err = replace_initial(&mut plan, &IndexMap::new()).unwrap_err();
        // env.B is not resolvable while the global map itself is replaced.
        assert_eq!(
            err.errors,
            vec![ReplaceError::NotFound {
                scope: "env".to_string(),
                name: "B".to_string(),
            }]
        );
        // B itself resolved fine and keeps its value.
        assert_eq!(plan.env.get("B").unwrap(), "x");
    }

    #[test]
    fn test_replace_initial_resolves_step_fields_through_layers() {
        let mut plan = ExecutionPlan {
            default_vars: map(&[("tool", "scanner")]),
            env: map(&[("GLOBAL", "g")]),
            ..Default::default()
        };
        let mut check = crate::model::AutopilotCheck::default();
        check.autopilot.name = "ap".to_string();
        check.autopilot.steps = vec![vec![crate::model::Step {
            id: "s1".to_string(),
            env: map(&[("LOCAL", "${{ env.GLOBAL }}-local")]),
            run: "${{ vars.tool }} --target ${{ env.LOCAL }}".to_string(),
            ..Default::default()
        }]];
        check.autopilot.evaluate.run = "echo ${{ env.GLOBAL }}".to_string();
        plan.autopilot_checks.push(check);

        replace_initial(&mut plan, &IndexMap::new()).unwrap();
        let step = &plan.autopilot_checks[0].autopilot.steps[0][0];
        assert_eq!(step.env.get("LOCAL").unwrap(), "g-local");
        assert_eq!(step.run, "scanner --target g-local");
        assert_eq!(plan.autopilot_checks[0].autopilot.evaluate.run, "echo g");
    }

    #[test]
    fn test_batch_keeps_successes_alongside_failures() {
        let mut plan = ExecutionPlan {
            env: map(&[("GOOD", "ok")]),
            ..Default::default()
        };
        plan.header.name = "${{ env.GOOD }}".to_string();
        plan.header.version = "${{ env.BAD }}".to_string();
        let err = replace_initial(&mut plan, &IndexMap::new()).unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert_eq!(plan.header.name, "ok");
        assert_eq!(plan.header.version, "${{ env.BAD }}");
    }
}
