//! Carry an edit of a chart spec over to its pre-transformed form without
//! evaluating anything.
//!
//! The edit between the two input specs is replayed on the transformed
//! spec when it only touches regions the transform left alone. Anything
//! that could change a server-computed value gives up, and the caller runs
//! a full pre-transform instead. Both paths produce the same spec.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Result;
use crate::inline::is_inline_url;
use crate::planner::{PlannerConfig, SpecPlan};
use crate::spec::ChartSpec;

/// `transformed1` edited the way `spec1` became `spec2`, or `None` when the
/// edit reaches into pre-transformed content.
pub fn patch_pre_transformed_spec(
    spec1: &ChartSpec,
    transformed1: &ChartSpec,
    spec2: &ChartSpec,
) -> Result<Option<ChartSpec>> {
    if spec1 == spec2 {
        return Ok(Some(transformed1.clone()));
    }

    let config = PlannerConfig::pre_transform(true);
    let (plan1, plan2) = match (
        SpecPlan::try_new(spec1, &config),
        SpecPlan::try_new(spec2, &config),
    ) {
        (Ok(p1), Ok(p2)) => (p1, p2),
        (Err(e), _) | (_, Err(e)) => {
            debug!(error = %e, "cannot patch an unplannable spec");
            return Ok(None);
        }
    };
    if plan1.server_spec != plan2.server_spec || plan1.comm_plan != plan2.comm_plan {
        debug!("server side of the spec changed");
        return Ok(None);
    }

    let (Value::Object(a), Value::Object(b), Value::Object(mut t)) =
        (spec1.to_value()?, spec2.to_value()?, transformed1.to_value()?)
    else {
        return Ok(None);
    };
    if patch_scope(&a, &b, &mut t, "").is_none() {
        return Ok(None);
    }
    Ok(Some(ChartSpec::from_value(Value::Object(t))?))
}

/// Replay the differences between scopes `a` and `b` on `t`.
fn patch_scope(a: &Map<String, Value>, b: &Map<String, Value>, t: &mut Map<String, Value>, pointer: &str) -> Option<()> {
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    for key in keys {
        let (va, vb) = (a.get(key), b.get(key));
        if va == vb {
            continue;
        }
        let path = format!("{pointer}/{key}");
        match key.as_str() {
            "data" | "signals" => patch_named(key, va, vb, t, &path)?,
            "marks" => patch_marks(va, vb, t, &path)?,
            _ => {
                debug!(pointer = %path, "patched");
                match vb {
                    Some(v) => t.insert(key.clone(), v.clone()),
                    None => t.remove(key),
                };
            }
        }
    }
    Some(())
}

fn entries(list: Option<&Value>) -> &[Value] {
    list.and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default()
}

fn entry_name(entry: &Value) -> Option<&str> {
    entry.get("name").and_then(Value::as_str)
}

/// Signal and data lists, matched by name since the transform adds and
/// removes entries.
fn patch_named(key: &str, va: Option<&Value>, vb: Option<&Value>, t: &mut Map<String, Value>, pointer: &str) -> Option<()> {
    let (ea, eb) = (entries(va), entries(vb));
    let names_a: Vec<_> = ea.iter().map(entry_name).collect();
    let names_b: Vec<_> = eb.iter().map(entry_name).collect();
    if names_a != names_b {
        debug!(pointer, "entries added, removed or reordered");
        return None;
    }
    for (old, new) in ea.iter().zip(eb) {
        if old == new {
            continue;
        }
        let name = entry_name(old)?;
        if key == "data" && [old, new].iter().any(|e| uses_inline_url(e)) {
            debug!(pointer, dataset = name, "inline dataset changed");
            return None;
        }
        let target = t
            .get_mut(key)?
            .as_array_mut()?
            .iter_mut()
            .find(|e| entry_name(e) == Some(name))?;
        // the transform rewrote this entry
        if target != old {
            debug!(pointer, name, "edit touches pre-transformed content");
            return None;
        }
        debug!(pointer, name, "patched");
        *target = new.clone();
    }
    Some(())
}

fn uses_inline_url(entry: &Value) -> bool {
    entry
        .get("url")
        .and_then(Value::as_str)
        .is_some_and(is_inline_url)
}

fn is_group(mark: &Value) -> bool {
    mark.get("type").and_then(Value::as_str) == Some("group")
}

/// Marks keep their positions through the transform, which keeps group
/// scopes aligned.
fn patch_marks(va: Option<&Value>, vb: Option<&Value>, t: &mut Map<String, Value>, pointer: &str) -> Option<()> {
    let (ma, mb) = (entries(va), entries(vb));
    if ma.len() != mb.len() {
        if ma.iter().chain(mb).any(is_group) {
            return None;
        }
        debug!(pointer, "patched");
        match vb {
            Some(v) => t.insert("marks".to_string(), v.clone()),
            None => t.remove("marks"),
        };
        return Some(());
    }

    let mt = t.get_mut("marks")?.as_array_mut()?;
    if mt.len() != ma.len() {
        return None;
    }
    for (i, (old, new)) in ma.iter().zip(mb).enumerate() {
        if old == new {
            continue;
        }
        let path = format!("{pointer}/{i}");
        match (is_group(old), is_group(new)) {
            (true, true) => {
                let (Value::Object(a), Value::Object(b), Value::Object(target)) = (old, new, &mut mt[i]) else {
                    return None;
                };
                patch_scope(a, b, target, &path)?;
            }
            (false, false) => {
                debug!(pointer = %path, "patched");
                mt[i] = new.clone();
            }
            _ => return None,
        }
    }
    Some(())
}
