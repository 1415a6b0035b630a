// Variable resolution
// Merges declared defaults, dot-file values, host environment, and CLI
// overrides into the PIPE_VAR_* map handed to every child process

use std::collections::HashMap;
use std::env;

/// Build a `PIPE_*` environment variable name from step/sub-run ids.
/// Hyphens become underscores, everything uppercased.
pub fn env_key(parts: &[&str]) -> String {
    let joined = parts.join("_").replace('-', "_");
    format!("PIPE_{}", joined.to_uppercase())
}

/// Build a `PIPE_VAR_*` environment variable name from a declared variable
/// key. Same transformation as [`env_key`].
pub fn var_env_key(key: &str) -> String {
    format!("PIPE_VAR_{}", key.replace('-', "_").to_uppercase())
}

fn host_env() -> HashMap<String, String> {
    env::vars().collect()
}

/// Merge variable sources with strictly increasing precedence:
///
///   1. declared defaults (rendered as templates against the host env),
///   2. dot-file values,
///   3. the host process's own `PIPE_VAR_*` entries for declared keys,
///   4. explicit CLI overrides.
///
/// Sources 2 and 4 may only set declared keys; undeclared keys produce a
/// warning and are dropped unless `PIPE_EXPERIMENTAL_UNSAFE_VARS` is set.
pub fn resolve_vars(
    declared: &HashMap<String, String>,
    dot_file: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> (HashMap<String, String>, Vec<String>) {
    resolve_with_env(
        declared,
        dot_file,
        overrides,
        &host_env(),
        crate::config::unsafe_vars_enabled(),
    )
}

fn resolve_with_env(
    declared: &HashMap<String, String>,
    dot_file: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
    host: &HashMap<String, String>,
    unsafe_vars: bool,
) -> (HashMap<String, String>, Vec<String>) {
    let mut resolved = HashMap::new();
    let mut warnings = Vec::new();

    for (key, value) in declared {
        resolved.insert(var_env_key(key), render_var_value(value, host));
    }

    for (key, value) in dot_file {
        if declared.contains_key(key) || unsafe_vars {
            resolved.insert(var_env_key(key), value.clone());
        } else {
            warnings.push(format!(
                "dot file variable {key:?} is not declared in the pipeline vars (ignored; set PIPE_EXPERIMENTAL_UNSAFE_VARS to allow)"
            ));
        }
    }

    for key in declared.keys() {
        let name = var_env_key(key);
        if let Some(value) = host.get(&name) {
            resolved.insert(name, value.clone());
        }
    }

    for (key, value) in overrides {
        if declared.contains_key(key) || unsafe_vars {
            resolved.insert(var_env_key(key), value.clone());
        } else {
            warnings.push(format!(
                "override {key:?} is not declared in the pipeline vars (ignored; set PIPE_EXPERIMENTAL_UNSAFE_VARS to allow)"
            ));
        }
    }

    warnings.sort();
    (resolved, warnings)
}

/// Warn about `PIPE_VAR_*` names in the host environment that do not back
/// any declared key. Silent when the unsafe-vars escape hatch is set.
pub fn unmatched_env_var_warnings(declared: &HashMap<String, String>) -> Vec<String> {
    unmatched_with_env(
        declared,
        &host_env(),
        crate::config::unsafe_vars_enabled(),
    )
}

fn unmatched_with_env(
    declared: &HashMap<String, String>,
    host: &HashMap<String, String>,
    unsafe_vars: bool,
) -> Vec<String> {
    if unsafe_vars {
        return Vec::new();
    }
    let known: std::collections::HashSet<String> =
        declared.keys().map(|k| var_env_key(k)).collect();

    let mut warnings: Vec<String> = host
        .keys()
        .filter(|name| name.starts_with("PIPE_VAR_") && !known.contains(*name))
        .map(|name| format!("environment variable {name} does not match any declared pipeline var"))
        .collect();
    warnings.sort();
    warnings
}

/// Render a declared default as a template against the host environment.
/// Supported forms are `{{ .NAME }}` and `{{ .NAME | default "fallback" }}`
/// (and the prefix form `{{ default "fallback" .NAME }}`). On any parse
/// error the original literal is preserved.
fn render_var_value(value: &str, host: &HashMap<String, String>) -> String {
    if !value.contains("{{") {
        return value.to_string();
    }
    render_template(value, host).unwrap_or_else(|| value.to_string())
}

fn render_template(value: &str, host: &HashMap<String, String>) -> Option<String> {
    let mut out = String::new();
    let mut rest = value;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}")?;
        out.push_str(&eval_expr(after[..end].trim(), host)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Some(out)
}

#[derive(Debug, PartialEq)]
enum Tok {
    /// `.NAME`: a lookup in the data context.
    Field(String),
    /// A double-quoted string literal.
    Str(String),
    /// A bare word, e.g. the `default` helper name.
    Word(String),
}

fn tokenize(expr: &str) -> Option<Vec<Tok>> {
    let mut toks = Vec::new();
    let mut chars = expr.char_indices().peekable();
    while let Some(&(i, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let start = i + 1;
            let mut end = None;
            for (j, d) in chars.by_ref() {
                if d == '"' {
                    end = Some(j);
                    break;
                }
            }
            toks.push(Tok::Str(expr[start..end?].to_string()));
        } else {
            let start = i;
            let mut end = expr.len();
            while let Some(&(j, d)) = chars.peek() {
                if d.is_whitespace() || d == '"' {
                    end = j;
                    break;
                }
                chars.next();
            }
            let word = &expr[start..end];
            if let Some(name) = word.strip_prefix('.') {
                if name.is_empty()
                    || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return None;
                }
                toks.push(Tok::Field(name.to_string()));
            } else {
                toks.push(Tok::Word(word.to_string()));
            }
        }
    }
    Some(toks)
}

fn eval_atom(tok: &Tok, host: &HashMap<String, String>) -> Option<String> {
    match tok {
        Tok::Field(name) => Some(host.get(name).cloned().unwrap_or_default()),
        Tok::Str(s) => Some(s.clone()),
        Tok::Word(_) => None,
    }
}

/// `default fallback value` returns `fallback` when `value` is empty.
fn eval_default(fallback: &Tok, value: String, host: &HashMap<String, String>) -> Option<String> {
    if value.is_empty() {
        eval_atom(fallback, host)
    } else {
        Some(value)
    }
}

fn eval_expr(expr: &str, host: &HashMap<String, String>) -> Option<String> {
    let mut stages = expr.split('|');

    let first = tokenize(stages.next()?)?;
    let mut value = match first.as_slice() {
        [tok @ (Tok::Field(_) | Tok::Str(_))] => eval_atom(tok, host)?,
        [Tok::Word(w), fallback, val] if w.as_str() == "default" => {
            eval_default(fallback, eval_atom(val, host)?, host)?
        }
        _ => return None,
    };

    for stage in stages {
        let toks = tokenize(stage)?;
        value = match toks.as_slice() {
            [Tok::Word(w), fallback] if w.as_str() == "default" => {
                eval_default(fallback, value, host)?
            }
            _ => return None,
        };
    }

    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_key_transformation() {
        assert_eq!(env_key(&["get-version"]), "PIPE_GET_VERSION");
        assert_eq!(env_key(&["fetch", "api-token"]), "PIPE_FETCH_API_TOKEN");
        assert_eq!(var_env_key("aws-region"), "PIPE_VAR_AWS_REGION");
        assert_eq!(var_env_key("simple"), "PIPE_VAR_SIMPLE");
    }

    #[test]
    fn defaults_only() {
        let declared = map(&[("region", "us-east-1")]);
        let (resolved, warns) =
            resolve_with_env(&declared, &map(&[]), &map(&[]), &map(&[]), false);
        assert_eq!(resolved.get("PIPE_VAR_REGION").unwrap(), "us-east-1");
        assert!(warns.is_empty());
    }

    #[test]
    fn precedence_chain() {
        let declared = map(&[("region", "default")]);
        let dot = map(&[("region", "from-dot")]);
        let overrides = map(&[("region", "from-cli")]);
        let host = map(&[("PIPE_VAR_REGION", "from-env")]);

        // dot file beats default
        let (r, _) = resolve_with_env(&declared, &dot, &map(&[]), &map(&[]), false);
        assert_eq!(r.get("PIPE_VAR_REGION").unwrap(), "from-dot");

        // host env beats dot file
        let (r, _) = resolve_with_env(&declared, &dot, &map(&[]), &host, false);
        assert_eq!(r.get("PIPE_VAR_REGION").unwrap(), "from-env");

        // CLI override beats everything
        let (r, _) = resolve_with_env(&declared, &dot, &overrides, &host, false);
        assert_eq!(r.get("PIPE_VAR_REGION").unwrap(), "from-cli");
    }

    #[test]
    fn undeclared_keys_dropped_with_warning() {
        let declared = map(&[("known", "x")]);
        let dot = map(&[("mystery", "1")]);
        let overrides = map(&[("surprise", "2")]);
        let (resolved, warns) =
            resolve_with_env(&declared, &dot, &overrides, &map(&[]), false);
        assert_eq!(resolved.len(), 1);
        assert_eq!(warns.len(), 2);
        assert!(warns.iter().any(|w| w.contains("\"mystery\"")));
        assert!(warns.iter().any(|w| w.contains("\"surprise\"")));
    }

    #[test]
    fn unsafe_hatch_accepts_new_keys() {
        let declared = map(&[]);
        let dot = map(&[("extra", "1")]);
        let overrides = map(&[("more", "2")]);
        let (resolved, warns) =
            resolve_with_env(&declared, &dot, &overrides, &map(&[]), true);
        assert_eq!(resolved.get("PIPE_VAR_EXTRA").unwrap(), "1");
        assert_eq!(resolved.get("PIPE_VAR_MORE").unwrap(), "2");
        assert!(warns.is_empty());
    }

    #[test]
    fn host_env_only_sets_declared_keys() {
        let declared = map(&[("known", "x")]);
        let host = map(&[
            ("PIPE_VAR_KNOWN", "from-env"),
            ("PIPE_VAR_UNKNOWN", "ignored"),
        ]);
        let (resolved, _) = resolve_with_env(&declared, &map(&[]), &map(&[]), &host, false);
        assert_eq!(resolved.get("PIPE_VAR_KNOWN").unwrap(), "from-env");
        assert!(!resolved.contains_key("PIPE_VAR_UNKNOWN"));
    }

    #[test]
    fn unmatched_host_vars_warn() {
        let declared = map(&[("known", "x")]);
        let host = map(&[
            ("PIPE_VAR_KNOWN", "ok"),
            ("PIPE_VAR_STRAY", "warn-me"),
            ("UNRELATED", "no"),
        ]);
        let warns = unmatched_with_env(&declared, &host, false);
        assert_eq!(warns.len(), 1);
        assert!(warns[0].contains("PIPE_VAR_STRAY"));

        assert!(unmatched_with_env(&declared, &host, true).is_empty());
    }

    #[test]
    fn template_plain_field() {
        let host = map(&[("HOME", "/home/u")]);
        assert_eq!(render_var_value("{{ .HOME }}/bin", &host), "/home/u/bin");
    }

    #[test]
    fn template_missing_field_renders_empty() {
        assert_eq!(render_var_value("x{{ .NOPE }}y", &map(&[])), "xy");
    }

    #[test]
    fn template_default_pipe() {
        let host = map(&[("SET", "value")]);
        assert_eq!(
            render_var_value("{{ .SET | default \"fb\" }}", &host),
            "value"
        );
        assert_eq!(
            render_var_value("{{ .UNSET | default \"fb\" }}", &host),
            "fb"
        );
    }

    #[test]
    fn template_default_prefix_form() {
        assert_eq!(
            render_var_value("{{ default \"fb\" .UNSET }}", &map(&[])),
            "fb"
        );
    }

    #[test]
    fn template_parse_errors_preserve_literal() {
        let host = map(&[]);
        // unclosed delimiter
        assert_eq!(render_var_value("{{ .BROKEN", &host), "{{ .BROKEN");
        // unknown helper
        assert_eq!(
            render_var_value("{{ upper .X }}", &host),
            "{{ upper .X }}"
        );
        // malformed field
        assert_eq!(render_var_value("{{ .BAD-NAME }}", &host), "{{ .BAD-NAME }}");
    }

    #[test]
    fn non_template_values_untouched() {
        assert_eq!(render_var_value("plain value", &map(&[])), "plain value");
        assert_eq!(render_var_value("{single brace}", &map(&[])), "{single brace}");
    }
}
