use std::collections::BTreeMap;

use super::parser::{Assignment, Expr};
use super::span::Pos;
use crate::traits::ManifestError;

/// An evaluated manifest value. Mappings keep their source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    None,
    Map(Vec<(String, Value)>),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Int(_) => "integer",
            Value::Bool(_) => "boolean",
            Value::None => "None",
            Value::Map(_) => "mapping",
            Value::List(_) => "list",
        }
    }
}

/// Fallback values for `Var(...)` lookups not satisfied by `vars`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultVars {
    values: BTreeMap<String, String>,
}

impl DefaultVars {
    pub fn new(host_cpu: impl Into<String>, host_os: impl Into<String>) -> Self {
        let mut values = BTreeMap::new();
        values.insert("host_cpu".to_string(), host_cpu.into());
        values.insert("host_os".to_string(), host_os.into());
        Self { values }
    }

    /// Values describing the machine running the scan.
    pub fn for_host() -> Self {
        let cpu = match std::env::consts::ARCH {
            "x86_64" => "x64",
            "x86" => "x86",
            "aarch64" => "arm64",
            "arm" => "arm",
            other => other,
        };
        let os = match std::env::consts::OS {
            "macos" => "mac",
            "windows" => "win",
            other => other,
        };
        Self::new(cpu, os)
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

impl Default for DefaultVars {
    fn default() -> Self {
        Self::for_host()
    }
}

/// Top-level bindings of an evaluated manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    values: BTreeMap<String, Value>,
}

impl Bindings {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

struct Scope<'a> {
    vars: Option<&'a Value>,
    defaults: &'a DefaultVars,
}

impl Scope<'_> {
    fn lookup(&self, name: &str, pos: Pos) -> Result<Value, ManifestError> {
        if let Some(value) = self.vars.and_then(|vars| vars.get(name)) {
            return Ok(value.clone());
        }
        if let Some(value) = self.defaults.get(name) {
            return Ok(Value::Str(value.to_string()));
        }
        Err(ManifestError::UndefinedVariable {
            name: name.to_string(),
            line: pos.line,
            column: pos.column,
        })
    }
}

/// Evaluates every assignment. `vars` is evaluated first so that later
/// assignments can reference it regardless of source order; `vars` itself
/// only sees the default table.
pub(crate) fn evaluate(
    assignments: &[Assignment],
    defaults: &DefaultVars,
) -> Result<Bindings, ManifestError> {
    let mut values = BTreeMap::new();

    let bare = Scope {
        vars: None,
        defaults,
    };
    for assignment in assignments.iter().filter(|a| a.name == "vars") {
        let value = eval_expr(&assignment.value, &bare)?;
        if !matches!(value, Value::Map(_)) {
            return Err(ManifestError::TypeMismatch {
                line: assignment.pos.line,
                column: assignment.pos.column,
                message: format!("`vars` must be a mapping, found {}", value.type_name()),
            });
        }
        values.insert("vars".to_string(), value);
    }

    let vars = values.get("vars").cloned();
    let scope = Scope {
        vars: vars.as_ref(),
        defaults,
    };
    for assignment in assignments.iter().filter(|a| a.name != "vars") {
        let value = eval_expr(&assignment.value, &scope)?;
        values.insert(assignment.name.clone(), value);
    }

    Ok(Bindings { values })
}

fn eval_expr(expr: &Expr, scope: &Scope<'_>) -> Result<Value, ManifestError> {
    match expr {
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::None => Ok(Value::None),
        Expr::Var { name, pos } => scope.lookup(name, *pos),
        Expr::Concat(operands) => {
            let mut out = String::new();
            for (operand, pos) in operands {
                match eval_expr(operand, scope)? {
                    Value::Str(s) => out.push_str(&s),
                    other => {
                        return Err(ManifestError::TypeMismatch {
                            line: pos.line,
                            column: pos.column,
                            message: format!("cannot concatenate {} to a string", other.type_name()),
                        })
                    }
                }
            }
            Ok(Value::Str(out))
        }
        Expr::Dict(entries) => {
            let mut map: Vec<(String, Value)> = Vec::with_capacity(entries.len());
            for ((key_expr, key_pos), value_expr) in entries {
                let key = match eval_expr(key_expr, scope)? {
                    Value::Str(s) => s,
                    other => {
                        return Err(ManifestError::TypeMismatch {
                            line: key_pos.line,
                            column: key_pos.column,
                            message: format!("mapping keys must be strings, found {}", other.type_name()),
                        })
                    }
                };
                let value = eval_expr(value_expr, scope)?;
                // Later duplicates win, keeping the first position.
                match map.iter_mut().find(|(k, _)| *k == key) {
                    Some(slot) => slot.1 = value,
                    None => map.push((key, value)),
                }
            }
            Ok(Value::Map(map))
        }
        Expr::List(items) => items
            .iter()
            .map(|item| eval_expr(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
    }
}
