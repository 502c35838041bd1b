//! RFC 6902 JSON Patch application over `serde_json::Value`.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PatchError {
    #[error("patch is not an array")]
    NotAnArray,

    #[error("operation {0} is malformed")]
    BadOperation(usize),

    #[error("operation {0}: unknown op '{1}'")]
    UnknownOp(usize, String),

    #[error("operation {0}: path does not exist")]
    BadPath(usize),

    #[error("operation {0}: test failed")]
    TestFailed(usize),
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// Apply a patch document, returning the transformed value.
pub fn apply(doc: &Value, patch: &Value) -> Result<Value> {
    let ops = patch.as_array().ok_or(PatchError::NotAnArray)?;
    let mut doc = doc.clone();

    for (n, op) in ops.iter().enumerate() {
        let obj = op.as_object().ok_or(PatchError::BadOperation(n))?;
        let kind = obj
            .get("op")
            .and_then(Value::as_str)
            .ok_or(PatchError::BadOperation(n))?;
        let path = obj
            .get("path")
            .and_then(Value::as_str)
            .ok_or(PatchError::BadOperation(n))?;

        match kind {
            "add" => {
                let value = obj.get("value").ok_or(PatchError::BadOperation(n))?.clone();
                insert(&mut doc, path, value, n)?;
            }
            "remove" => {
                remove(&mut doc, path, n)?;
            }
            "replace" => {
                let value = obj.get("value").ok_or(PatchError::BadOperation(n))?.clone();
                if path.is_empty() {
                    doc = value;
                } else {
                    remove(&mut doc, path, n)?;
                    insert(&mut doc, path, value, n)?;
                }
            }
            "move" => {
                let from = obj
                    .get("from")
                    .and_then(Value::as_str)
                    .ok_or(PatchError::BadOperation(n))?;
                let value = remove(&mut doc, from, n)?;
                insert(&mut doc, path, value, n)?;
            }
            "copy" => {
                let from = obj
                    .get("from")
                    .and_then(Value::as_str)
                    .ok_or(PatchError::BadOperation(n))?;
                let value = resolve(&doc, from).ok_or(PatchError::BadPath(n))?.clone();
                insert(&mut doc, path, value, n)?;
            }
            "test" => {
                let expected = obj.get("value").ok_or(PatchError::BadOperation(n))?;
                let actual = resolve(&doc, path).ok_or(PatchError::BadPath(n))?;
                if actual != expected {
                    return Err(PatchError::TestFailed(n));
                }
            }
            other => return Err(PatchError::UnknownOp(n, other.to_string())),
        }
    }

    Ok(doc)
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn split_pointer(path: &str) -> Option<Vec<String>> {
    if path.is_empty() {
        return Some(Vec::new());
    }
    let rest = path.strip_prefix('/')?;
    Some(rest.split('/').map(unescape_token).collect())
}

fn resolve<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let tokens = split_pointer(path)?;
    let mut current = doc;
    for token in &tokens {
        current = match current {
            Value::Object(map) => map.get(token)?,
            Value::Array(list) => list.get(token.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn insert(doc: &mut Value, path: &str, value: Value, n: usize) -> Result<()> {
    let tokens = split_pointer(path).ok_or(PatchError::BadOperation(n))?;
    if tokens.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (leaf, parents) = tokens.split_last().expect("nonempty");

    let mut current = doc;
    for token in parents {
        current = match current {
            Value::Object(map) => map.get_mut(token).ok_or(PatchError::BadPath(n))?,
            Value::Array(list) => {
                let i = token.parse::<usize>().map_err(|_| PatchError::BadPath(n))?;
                list.get_mut(i).ok_or(PatchError::BadPath(n))?
            }
            _ => return Err(PatchError::BadPath(n)),
        };
    }

    match current {
        Value::Object(map) => {
            map.insert(leaf.clone(), value);
            Ok(())
        }
        Value::Array(list) => {
            if leaf == "-" {
                list.push(value);
                return Ok(());
            }
            let i = leaf.parse::<usize>().map_err(|_| PatchError::BadPath(n))?;
            if i > list.len() {
                return Err(PatchError::BadPath(n));
            }
            list.insert(i, value);
            Ok(())
        }
        _ => Err(PatchError::BadPath(n)),
    }
}

fn remove(doc: &mut Value, path: &str, n: usize) -> Result<Value> {
    let tokens = split_pointer(path).ok_or(PatchError::BadOperation(n))?;
    let Some((leaf, parents)) = tokens.split_last() else {
        return Err(PatchError::BadPath(n));
    };

    let mut current = doc;
    for token in parents {
        current = match current {
            Value::Object(map) => map.get_mut(token).ok_or(PatchError::BadPath(n))?,
            Value::Array(list) => {
                let i = token.parse::<usize>().map_err(|_| PatchError::BadPath(n))?;
                list.get_mut(i).ok_or(PatchError::BadPath(n))?
            }
            _ => return Err(PatchError::BadPath(n)),
        };
    }

    match current {
        Value::Object(map) => map.remove(leaf).ok_or(PatchError::BadPath(n)),
        Value::Array(list) => {
            let i = leaf.parse::<usize>().map_err(|_| PatchError::BadPath(n))?;
            if i >= list.len() {
                return Err(PatchError::BadPath(n));
            }
            Ok(list.remove(i))
        }
        _ => Err(PatchError::BadPath(n)),
    }
}
