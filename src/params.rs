//! Parameter sets and parameter-space expansion.
//!
//! A job's command, arguments, environment, stdin and working directory are
//! templates over its parameter bindings: `{name}` is replaced by the bound
//! value, `{{` and `}}` escape literal braces, and a bare `{}` passes through
//! untouched (common in shell idioms like `find ... -exec cmd {} \;`).
//!
//! The expansion helpers turn a declarative parameter-space description into
//! the flat list of [`ParamSet`]s a batch is instantiated from.

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::SpecError;

/// Ordered map of parameter name to value. Insertion order is preserved and
/// flows through to expansion, grouping and sink column order.
pub type ParamSet = IndexMap<String, Value>;

/// Render a `{name}` template against a parameter set.
///
/// Errors on a placeholder with no binding and on unbalanced braces; the
/// empty placeholder `{}` is emitted verbatim.
pub fn render(template: &str, params: &ParamSet) -> Result<String, SpecError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                if !closed {
                    return Err(SpecError::UnbalancedBraces {
                        template: template.to_string(),
                    });
                }
                if name.is_empty() {
                    out.push_str("{}");
                    continue;
                }
                match params.get(&name) {
                    Some(value) => out.push_str(&display_value(value)),
                    None => {
                        return Err(SpecError::UnknownPlaceholder {
                            name,
                            template: template.to_string(),
                        });
                    }
                }
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(SpecError::UnbalancedBraces {
                        template: template.to_string(),
                    });
                }
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

/// Textual form of a parameter value as substituted into templates and CSV
/// cells: strings bare, scalars via JSON, compounds as compact JSON.
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ── Parameter-space expansion ────────────────────────────────────────────────

/// Cartesian product over an ordered `name -> candidate values` map.
///
/// The last axis varies fastest. An axis with no values yields an empty
/// space; no axes at all yield one empty set.
pub fn matrix(axes: &IndexMap<String, Vec<Value>>) -> Vec<ParamSet> {
    let mut sets = vec![ParamSet::new()];
    for (name, values) in axes {
        let mut next = Vec::with_capacity(sets.len() * values.len());
        for set in &sets {
            for value in values {
                let mut expanded = set.clone();
                expanded.insert(name.clone(), value.clone());
                next.push(expanded);
            }
        }
        sets = next;
    }
    sets
}

/// Element-wise combination: the i-th set binds each axis to its i-th value.
///
/// All axes must have the same length.
pub fn zip(axes: &IndexMap<String, Vec<Value>>) -> Result<Vec<ParamSet>, SpecError> {
    let mut len: Option<usize> = None;
    for values in axes.values() {
        match len {
            None => len = Some(values.len()),
            Some(expected) if expected != values.len() => {
                return Err(SpecError::UnevenZip {
                    left: expected,
                    right: values.len(),
                });
            }
            Some(_) => {}
        }
    }

    let len = len.unwrap_or(0);
    let mut sets = Vec::with_capacity(len);
    for i in 0..len {
        let mut set = ParamSet::new();
        for (name, values) in axes {
            set.insert(name.clone(), values[i].clone());
        }
        sets.push(set);
    }
    Ok(sets)
}

/// Concatenate several expansions into one.
pub fn chain<I>(groups: I) -> Vec<ParamSet>
where
    I: IntoIterator<Item = Vec<ParamSet>>,
{
    groups.into_iter().flatten().collect()
}

/// Repeat each set `n` times, binding `counter_key` to the repetition index
/// (0-based) so repeated instances stay distinguishable.
pub fn repeat(sets: &[ParamSet], n: usize, counter_key: &str) -> Vec<ParamSet> {
    let mut out = Vec::with_capacity(sets.len() * n);
    for set in sets {
        for i in 0..n {
            let mut repeated = set.clone();
            repeated.insert(counter_key.to_string(), Value::from(i as u64));
            out.push(repeated);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(entries: &[(&str, Value)]) -> ParamSet {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn render_substitutes_values() {
        let p = params(&[("algo", json!("lru")), ("size", json!(1024))]);
        let out = render("bench --algo={algo} --size={size}", &p).unwrap();
        assert_eq!(out, "bench --algo=lru --size=1024");
    }

    #[test]
    fn render_escaped_braces() {
        let p = params(&[("n", json!(3))]);
        assert_eq!(render("{{n}} is {n}", &p).unwrap(), "{n} is 3");
    }

    #[test]
    fn render_empty_placeholder_passes_through() {
        let p = ParamSet::new();
        assert_eq!(
            render("find . -exec rm {} ;", &p).unwrap(),
            "find . -exec rm {} ;"
        );
    }

    #[test]
    fn render_unknown_placeholder() {
        let p = ParamSet::new();
        let err = render("run {missing}", &p).unwrap_err();
        assert!(matches!(err, SpecError::UnknownPlaceholder { ref name, .. } if name == "missing"));
    }

    #[test]
    fn render_unclosed_brace() {
        let p = ParamSet::new();
        assert!(matches!(
            render("run {oops", &p),
            Err(SpecError::UnbalancedBraces { .. })
        ));
        assert!(matches!(
            render("run oops}", &p),
            Err(SpecError::UnbalancedBraces { .. })
        ));
    }

    #[test]
    fn render_value_forms() {
        let p = params(&[
            ("s", json!("text")),
            ("f", json!(2.5)),
            ("b", json!(true)),
            ("nil", Value::Null),
            ("list", json!([1, 2])),
        ]);
        assert_eq!(
            render("{s}|{f}|{b}|{nil}|{list}", &p).unwrap(),
            "text|2.5|true||[1,2]"
        );
    }

    #[test]
    fn matrix_is_cartesian_last_axis_fastest() {
        let mut axes = IndexMap::new();
        axes.insert("a".to_string(), vec![json!(1), json!(2)]);
        axes.insert("b".to_string(), vec![json!("x"), json!("y")]);
        let sets = matrix(&axes);
        assert_eq!(sets.len(), 4);
        assert_eq!(sets[0], params(&[("a", json!(1)), ("b", json!("x"))]));
        assert_eq!(sets[1], params(&[("a", json!(1)), ("b", json!("y"))]));
        assert_eq!(sets[2], params(&[("a", json!(2)), ("b", json!("x"))]));
        assert_eq!(sets[3], params(&[("a", json!(2)), ("b", json!("y"))]));
    }

    #[test]
    fn matrix_empty_axis_yields_empty_space() {
        let mut axes = IndexMap::new();
        axes.insert("a".to_string(), vec![json!(1)]);
        axes.insert("b".to_string(), Vec::new());
        assert!(matrix(&axes).is_empty());
    }

    #[test]
    fn zip_combines_element_wise() {
        let mut axes = IndexMap::new();
        axes.insert("host".to_string(), vec![json!("h1"), json!("h2")]);
        axes.insert("port".to_string(), vec![json!(80), json!(81)]);
        let sets = zip(&axes).unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[1], params(&[("host", json!("h2")), ("port", json!(81))]));
    }

    #[test]
    fn zip_rejects_uneven_axes() {
        let mut axes = IndexMap::new();
        axes.insert("a".to_string(), vec![json!(1), json!(2)]);
        axes.insert("b".to_string(), vec![json!(1)]);
        assert!(matches!(
            zip(&axes),
            Err(SpecError::UnevenZip { left: 2, right: 1 })
        ));
    }

    #[test]
    fn chain_concatenates() {
        let first = vec![params(&[("a", json!(1))])];
        let second = vec![params(&[("a", json!(2))]), params(&[("a", json!(3))])];
        let all = chain([first, second]);
        assert_eq!(all.len(), 3);
        assert_eq!(all[2]["a"], json!(3));
    }

    #[test]
    fn repeat_injects_counter() {
        let base = vec![params(&[("seed", json!(7))])];
        let sets = repeat(&base, 3, "run");
        assert_eq!(sets.len(), 3);
        assert_eq!(sets[0]["run"], json!(0));
        assert_eq!(sets[2]["run"], json!(2));
        assert_eq!(sets[2]["seed"], json!(7));
    }
}
