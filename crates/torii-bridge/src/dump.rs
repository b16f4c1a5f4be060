//! Structural dumper
//!
//! Renders an arbitrary script value as human-readable text: strings are
//! quoted with C-style control escapes, tables nest with two-space
//! indentation, and a visited map from table identity to the path that
//! first reached it turns cycles into annotated back-references instead of
//! unbounded recursion. Everything else falls back to its to-string form,
//! so wrapped handles render through the host.
//!
//! The format is diagnostic output, not a wire format: the only stable
//! promises are quoting/escaping of strings and brace-delimited,
//! newline-separated table entries.

use std::rc::Rc;

use rustc_hash::FxHashMap;
use torii_vm::{fmt_number, Value, Vm, VmResult};

/// Marker emitted for a back-reference to the value the dump started from
const ROOT_MARKER: &str = "<root>";

/// Render the value at `idx` as diagnostic text
pub fn dump_value(vm: &mut Vm, idx: isize) -> VmResult<String> {
    let abs = vm.abs_index(idx)?;
    let value = vm
        .at(abs)
        .cloned()
        .ok_or_else(|| torii_vm::VmError::msg("dump source slot is empty"))?;
    let mut out = String::new();
    let mut visited: FxHashMap<usize, String> = FxHashMap::default();
    render(vm, &value, &mut out, 0, &mut visited, "")?;
    Ok(out)
}

fn render(
    vm: &mut Vm,
    value: &Value,
    out: &mut String,
    depth: usize,
    visited: &mut FxHashMap<usize, String>,
    path: &str,
) -> VmResult<()> {
    match value {
        Value::Number(n) => out.push_str(&fmt_number(*n)),
        Value::Str(s) => add_quoted(out, s),
        Value::Table(table) => {
            let identity = Rc::as_ptr(table) as usize;
            if let Some(first_path) = visited.get(&identity) {
                // a previously recorded path that prefixes the current one
                // means we walked back into an ancestor
                let circular = path.starts_with(first_path.as_str())
                    && (path.len() == first_path.len()
                        || path[first_path.len()..].starts_with('['));
                if first_path.is_empty() {
                    out.push_str(ROOT_MARKER);
                } else {
                    out.push_str(first_path);
                }
                if circular {
                    out.push_str(" -- circular reference");
                }
                return Ok(());
            }
            visited.insert(identity, path.to_string());

            out.push('{');
            let entries = table.borrow().pairs();
            let mut first = true;
            for (key, val) in entries {
                if !first {
                    out.push(',');
                }
                first = false;
                out.push('\n');
                for _ in 0..(depth + 1) * 2 {
                    out.push(' ');
                }
                let key_part = match &key {
                    Value::Str(s) => {
                        out.push('[');
                        add_quoted(out, s);
                        out.push(']');
                        format!("[\"{}\"]", s)
                    }
                    Value::Number(n) => {
                        out.push('[');
                        out.push_str(&fmt_number(*n));
                        out.push(']');
                        format!("[{}]", *n as i64)
                    }
                    other => {
                        out.push('[');
                        vm.push(other.clone())?;
                        let rendered = vm.tostring(-1);
                        vm.pop();
                        out.push_str(&rendered?);
                        out.push(']');
                        "[?]".to_string()
                    }
                };
                out.push_str(" = ");
                let child_path = format!("{}{}", path, key_part);
                render(vm, &val, out, depth + 1, visited, &child_path)?;
            }
            visited.remove(&identity);
            if !first {
                out.push('\n');
                for _ in 0..depth * 2 {
                    out.push(' ');
                }
            }
            out.push('}');
        }
        other => {
            // nil, boolean, function, userdata: to-string form (wrapped
            // handles go through the host's rendering)
            vm.push(other.clone())?;
            let rendered = vm.tostring(-1);
            vm.pop();
            out.push_str(&rendered?);
        }
    }
    Ok(())
}

/// Quote a string with C-style escapes for control characters.
///
/// A decimal escape is zero-padded to three digits when the following
/// character is itself a digit, keeping the rendering unambiguous.
fn add_quoted(out: &mut String, s: &str) {
    out.push('"');
    let mut iter = s.chars().peekable();
    while let Some(c) = iter.next() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            c if (c as u32) < 32 || c as u32 == 127 => {
                let code = c as u32;
                let next_is_digit = iter.peek().is_some_and(|n| n.is_ascii_digit());
                if next_is_digit {
                    out.push_str(&format!("\\{:03}", code));
                } else {
                    out.push_str(&format!("\\{}", code));
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// One-line-per-slot rendering of a VM's stack for embedder debugging
pub fn describe_stack(vm: &mut Vm) -> VmResult<String> {
    let top = vm.top();
    let mut out = format!("stack dump ({} values):\n", top);
    for slot in 0..top {
        let type_name = vm
            .at(slot)
            .map(|v| v.type_name())
            .unwrap_or("none");
        let rendered = vm.tostring(slot as isize)?;
        out.push_str(&format!("  [{}]: ({}) {}\n", slot, type_name, rendered));
    }
    Ok(out)
}
