//! Native implementations behind the `native` declarations of the
//! built-in modules.
//!
//! Every function here follows the native calling convention: the receiver
//! (or the native itself, for module-level functions) sits at `base`,
//! arguments follow, and the return value replaces the whole window.

use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::object::{
    GenState, NativeFn, NativeRegistry, ObjBody, Raised, RegistryEntry,
};
use crate::value::{GcRef, Value};
use crate::vm::Vm;

/// Built-in registry for an embedded module, if it has one.
pub(crate) fn registry_for(name: &str) -> Option<Rc<NativeRegistry>> {
    match name {
        "core" => Some(core_registry()),
        "sys" => Some(sys_registry()),
        _ => None,
    }
}

fn entry(class_name: Option<&'static str>, name: &'static str, func: NativeFn) -> RegistryEntry {
    RegistryEntry { class_name, name, func }
}

pub(crate) fn core_registry() -> Rc<NativeRegistry> {
    Rc::new(NativeRegistry {
        entries: vec![
            entry(None, "print", nat_print),
            entry(None, "clock", nat_clock),
            entry(None, "typeOf", nat_type_of),
            entry(None, "gcCollect", nat_gc_collect),
            entry(Some("Object"), "__str__", object_str),
            entry(Some("Object"), "__eq__", object_eq),
            entry(Some("Object"), "__hash__", object_hash),
            entry(Some("Class"), "__str__", class_str),
            entry(Some("Class"), "name", class_name),
            entry(Some("Number"), "__str__", value_str),
            entry(Some("Number"), "__hash__", object_hash),
            entry(Some("Boolean"), "__str__", value_str),
            entry(Some("Boolean"), "__hash__", object_hash),
            entry(Some("Null"), "__str__", value_str),
            entry(Some("Null"), "__hash__", object_hash),
            entry(Some("String"), "len", str_len),
            entry(Some("String"), "upper", str_upper),
            entry(Some("String"), "lower", str_lower),
            entry(Some("String"), "contains", str_contains),
            entry(Some("String"), "startsWith", str_starts_with),
            entry(Some("String"), "__str__", str_self),
            entry(Some("String"), "__add__", str_add),
            entry(Some("String"), "__eq__", str_eq),
            entry(Some("String"), "__hash__", str_hash),
            entry(Some("String"), "__lt__", str_lt),
            entry(Some("String"), "__le__", str_le),
            entry(Some("String"), "__gt__", str_gt),
            entry(Some("String"), "__ge__", str_ge),
            entry(Some("String"), "__iter__", str_iter),
            entry(Some("String"), "__next__", str_next),
            entry(Some("Function"), "__str__", function_str),
            entry(Some("Module"), "__str__", module_str),
            entry(Some("List"), "add", list_add),
            entry(Some("List"), "pop", list_pop),
            entry(Some("List"), "len", list_len),
            entry(Some("List"), "clear", list_clear),
            entry(Some("List"), "contains", list_contains),
            entry(Some("List"), "__str__", list_str),
            entry(Some("List"), "__eq__", list_eq),
            entry(Some("List"), "__iter__", seq_iter),
            entry(Some("List"), "__next__", seq_next),
            entry(Some("Tuple"), "len", tuple_len),
            entry(Some("Tuple"), "__str__", tuple_str),
            entry(Some("Tuple"), "__eq__", tuple_eq),
            entry(Some("Tuple"), "__iter__", seq_iter),
            entry(Some("Tuple"), "__next__", seq_next),
            entry(Some("Table"), "len", table_len),
            entry(Some("Table"), "contains", table_contains),
            entry(Some("Table"), "del", table_del),
            entry(Some("Table"), "merge", table_merge),
            entry(Some("Table"), "keys", table_keys),
            entry(Some("Table"), "values", table_values),
            entry(Some("Table"), "__str__", table_str),
            entry(Some("Table"), "__iter__", table_iter),
            entry(Some("Table"), "__next__", table_next),
            entry(Some("Generator"), "__iter__", gen_iter),
            entry(Some("Generator"), "__next__", gen_next),
            entry(Some("Generator"), "send", gen_send),
            entry(Some("Generator"), "isDone", gen_is_done),
            entry(Some("Exception"), "printStacktrace", exc_print_stacktrace),
        ],
    })
}

pub(crate) fn sys_registry() -> Rc<NativeRegistry> {
    Rc::new(NativeRegistry {
        entries: vec![
            entry(None, "__argv", sys_argv),
            entry(None, "__platform", sys_platform),
            entry(None, "exit", sys_exit),
            entry(None, "time", sys_time),
        ],
    })
}

// ------------------------------------------------------------- helpers --

fn recv(vm: &Vm, base: usize) -> Value {
    vm.stack[base]
}

fn arg(vm: &Vm, base: usize, i: usize) -> Value {
    vm.stack[base + 1 + i]
}

fn recv_obj(vm: &Vm, base: usize) -> GcRef {
    recv(vm, base).as_obj().expect("native receiver is a heap object")
}

fn check_str(vm: &mut Vm, v: Value, what: &str) -> Result<GcRef, Raised> {
    match v.as_obj() {
        Some(r) if matches!(vm.heap.get(r), ObjBody::Str(_)) => Ok(r),
        _ => {
            let t = vm.type_name_of(v);
            Err(vm.type_exc(format!("{} must be a String, got {}", what, t)))
        }
    }
}

/// `7.0` prints as `7`; the fraction only shows when it is there.
pub(crate) fn num_to_string(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// User-facing text of any value, dispatching `__str__` on heap objects.
pub(crate) fn display(vm: &mut Vm, v: Value) -> Result<String, Raised> {
    match v {
        Value::Null => Ok("null".to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Num(n) => Ok(num_to_string(n)),
        Value::Handle(_) => Ok("<handle>".to_string()),
        Value::Obj(r) => {
            if let ObjBody::Str(s) = vm.heap.get(r) {
                return Ok(s.bytes.clone());
            }
            match vm.method_on(v, vm.names.str_) {
                Some(m) => {
                    let s = vm.call_with_receiver(m, v, &[])?;
                    match s.as_obj() {
                        Some(sr) if matches!(vm.heap.get(sr), ObjBody::Str(_)) => {
                            Ok(vm.heap.str_bytes(sr).to_string())
                        }
                        _ => {
                            let t = vm.type_name_of(s);
                            Err(vm.type_exc(format!("__str__ must return a String, got {}", t)))
                        }
                    }
                }
                None => Ok(format!("<{}>", vm.type_name_of(v))),
            }
        }
    }
}

// ---------------------------------------------------------- module level --

fn nat_print(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let text = display(vm, arg(vm, base, 0))?;
    println!("{}", text);
    Ok(Value::Null)
}

fn nat_clock(_vm: &mut Vm, _base: usize, _argc: usize) -> Result<Value, Raised> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Num(secs))
}

fn nat_type_of(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    Ok(match vm.class_of(arg(vm, base, 0)) {
        Some(c) => Value::Obj(c),
        None => Value::Null,
    })
}

fn nat_gc_collect(vm: &mut Vm, _base: usize, _argc: usize) -> Result<Value, Raised> {
    vm.collect_garbage();
    Ok(Value::Null)
}

// ----------------------------------------------------------- Object/Class --

fn object_str(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let v = recv(vm, base);
    let name = vm
        .class_of(v)
        .map(|c| vm.heap.str_bytes(vm.heap.class(c).name).to_string())
        .unwrap_or_else(|| vm.type_name_of(v).to_string());
    let s = vm.heap.new_string(format!("<{} instance>", name));
    Ok(Value::Obj(s))
}

fn object_eq(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    Ok(Value::Bool(recv(vm, base).raw_eq(arg(vm, base, 0))))
}

fn object_hash(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let h = match recv(vm, base) {
        Value::Obj(r) => r.index() as f64,
        Value::Num(n) => crate::value::hash_num(n) as f64,
        Value::Bool(b) => u32::from(b) as f64,
        Value::Null => 0.0,
        Value::Handle(p) => p as usize as f64,
    };
    Ok(Value::Num(h))
}

fn class_str(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_obj(vm, base);
    let name = vm.heap.str_bytes(vm.heap.class(r).name).to_string();
    let s = vm.heap.new_string(format!("<class {}>", name));
    Ok(Value::Obj(s))
}

fn class_name(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_obj(vm, base);
    Ok(Value::Obj(vm.heap.class(r).name))
}

// ---------------------------------------------------------- primitives --

fn value_str(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let text = match recv(vm, base) {
        Value::Num(n) => num_to_string(n),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => {
            let t = vm.type_name_of(other);
            return Err(vm.type_exc(format!("unexpected receiver {}", t)));
        }
    };
    let s = vm.heap.new_string(text);
    Ok(Value::Obj(s))
}

// -------------------------------------------------------------- String --

fn recv_str(vm: &mut Vm, base: usize) -> Result<String, Raised> {
    let r = recv_obj(vm, base);
    match vm.heap.get(r) {
        ObjBody::Str(s) => Ok(s.bytes.clone()),
        other => {
            let t = other.type_name();
            Err(vm.type_exc(format!("expected String receiver, got {}", t)))
        }
    }
}

fn str_self(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    Ok(recv(vm, base))
}

fn str_len(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let s = recv_str(vm, base)?;
    Ok(Value::Num(s.len() as f64))
}

fn str_upper(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let s = recv_str(vm, base)?;
    let out = vm.heap.new_string(s.to_uppercase());
    Ok(Value::Obj(out))
}

fn str_lower(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let s = recv_str(vm, base)?;
    let out = vm.heap.new_string(s.to_lowercase());
    Ok(Value::Obj(out))
}

fn str_contains(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let s = recv_str(vm, base)?;
    let needle = check_str(vm, arg(vm, base, 0), "argument to contains()")?;
    let found = s.contains(vm.heap.str_bytes(needle));
    Ok(Value::Bool(found))
}

fn str_starts_with(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let s = recv_str(vm, base)?;
    let prefix = check_str(vm, arg(vm, base, 0), "argument to startsWith()")?;
    let found = s.starts_with(vm.heap.str_bytes(prefix));
    Ok(Value::Bool(found))
}

fn str_add(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let s = recv_str(vm, base)?;
    let other = check_str(vm, arg(vm, base, 0), "right operand of '+'")?;
    let mut out = String::with_capacity(s.len() + vm.heap.str_bytes(other).len());
    out.push_str(&s);
    out.push_str(vm.heap.str_bytes(other));
    let r = vm.heap.new_string(out);
    Ok(Value::Obj(r))
}

fn str_eq(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_obj(vm, base);
    let other = arg(vm, base, 0);
    let eq = match other.as_obj() {
        Some(o) if o == r => true,
        Some(o) => match (vm.heap.get(r), vm.heap.get(o)) {
            (ObjBody::Str(a), ObjBody::Str(b)) => {
                // Two interned strings are never content-equal without
                // being the same object.
                if a.interned && b.interned {
                    false
                } else {
                    a.hash == b.hash && a.bytes == b.bytes
                }
            }
            _ => false,
        },
        None => false,
    };
    Ok(Value::Bool(eq))
}

fn str_hash(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_obj(vm, base);
    Ok(Value::Num(vm.heap.str_hash(r) as f64))
}

fn str_compare(vm: &mut Vm, base: usize, what: &str) -> Result<std::cmp::Ordering, Raised> {
    let s = recv_str(vm, base)?;
    let other = check_str(vm, arg(vm, base, 0), what)?;
    Ok(s.as_str().cmp(vm.heap.str_bytes(other)))
}

fn str_lt(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    Ok(Value::Bool(str_compare(vm, base, "right operand of '<'")?.is_lt()))
}

fn str_le(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    Ok(Value::Bool(str_compare(vm, base, "right operand of '<='")?.is_le()))
}

fn str_gt(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    Ok(Value::Bool(str_compare(vm, base, "right operand of '>'")?.is_gt()))
}

fn str_ge(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    Ok(Value::Bool(str_compare(vm, base, "right operand of '>='")?.is_ge()))
}

/// Iteration state for strings is the byte offset of the next character.
fn str_iter(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let s = recv_str(vm, base)?;
    match arg(vm, base, 0) {
        Value::Null => Ok(if s.is_empty() { Value::Bool(false) } else { Value::Num(0.0) }),
        Value::Num(n) => {
            let i = n as usize;
            if i >= s.len() || !s.is_char_boundary(i) {
                return Ok(Value::Bool(false));
            }
            let next = i + s[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
            Ok(if next < s.len() { Value::Num(next as f64) } else { Value::Bool(false) })
        }
        other => {
            let t = vm.type_name_of(other);
            Err(vm.type_exc(format!("bad iteration state: {}", t)))
        }
    }
}

fn str_next(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let s = recv_str(vm, base)?;
    let i = match arg(vm, base, 0) {
        Value::Num(n) => n as usize,
        other => {
            let t = vm.type_name_of(other);
            return Err(vm.type_exc(format!("bad iteration state: {}", t)));
        }
    };
    if i >= s.len() || !s.is_char_boundary(i) {
        return Err(vm.index_exc("iteration past end of string"));
    }
    let ch = s[i..].chars().next().expect("boundary checked");
    let out = vm.heap.new_string(ch.to_string());
    Ok(Value::Obj(out))
}

// --------------------------------------------------- Function / Module --

fn function_str(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_obj(vm, base);
    let name = match vm.heap.get(r) {
        ObjBody::Closure(c) => {
            let f = vm.heap.func(c.func);
            f.proto.name.clone().unwrap_or_else(|| "<anonymous>".to_string())
        }
        ObjBody::Func(f) => f.proto.name.clone().unwrap_or_else(|| "<anonymous>".to_string()),
        ObjBody::Native(n) => n.name.clone(),
        ObjBody::BoundMethod(_) => "<bound method>".to_string(),
        other => other.type_name().to_string(),
    };
    let s = vm.heap.new_string(format!("<fn {}>", name));
    Ok(Value::Obj(s))
}

fn module_str(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_obj(vm, base);
    let name = vm.heap.str_bytes(vm.heap.module(r).name).to_string();
    let s = vm.heap.new_string(format!("<module {}>", name));
    Ok(Value::Obj(s))
}

// ---------------------------------------------------------------- List --

fn recv_list_ref(vm: &mut Vm, base: usize) -> Result<GcRef, Raised> {
    let r = recv_obj(vm, base);
    match vm.heap.get(r) {
        ObjBody::List(_) => Ok(r),
        other => {
            let t = other.type_name();
            Err(vm.type_exc(format!("expected List receiver, got {}", t)))
        }
    }
}

fn list_add(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_list_ref(vm, base)?;
    let v = arg(vm, base, 0);
    if let ObjBody::List(l) = vm.heap.get_mut(r) {
        l.push(v);
    }
    vm.heap.account_growth(std::mem::size_of::<Value>());
    Ok(Value::Null)
}

fn list_pop(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_list_ref(vm, base)?;
    let popped = match vm.heap.get_mut(r) {
        ObjBody::List(l) => l.pop(),
        _ => unreachable!(),
    };
    match popped {
        Some(v) => Ok(v),
        None => Err(vm.index_exc("pop from an empty list")),
    }
}

fn list_len(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_list_ref(vm, base)?;
    let len = match vm.heap.get(r) {
        ObjBody::List(l) => l.len(),
        _ => unreachable!(),
    };
    Ok(Value::Num(len as f64))
}

fn list_clear(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_list_ref(vm, base)?;
    if let ObjBody::List(l) = vm.heap.get_mut(r) {
        l.clear();
    }
    Ok(Value::Null)
}

fn list_contains(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_list_ref(vm, base)?;
    let needle = arg(vm, base, 0);
    let items = match vm.heap.get(r) {
        ObjBody::List(l) => l.clone(),
        _ => unreachable!(),
    };
    for item in items {
        if vm.values_equal(needle, item)? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn list_str(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_list_ref(vm, base)?;
    let items = match vm.heap.get(r) {
        ObjBody::List(l) => l.clone(),
        _ => unreachable!(),
    };
    let text = seq_to_string(vm, &items, "[", "]")?;
    let s = vm.heap.new_string(text);
    Ok(Value::Obj(s))
}

fn seq_to_string(vm: &mut Vm, items: &[Value], open: &str, close: &str) -> Result<String, Raised> {
    let mut out = String::from(open);
    for (i, &item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        if let Some(r) = item.as_obj() {
            if let ObjBody::Str(s) = vm.heap.get(r) {
                out.push('"');
                out.push_str(&s.bytes);
                out.push('"');
                continue;
            }
        }
        out.push_str(&display(vm, item)?);
    }
    out.push_str(close);
    Ok(out)
}

fn list_eq(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_list_ref(vm, base)?;
    let other = arg(vm, base, 0);
    let b = match other.as_obj() {
        Some(o) => match vm.heap.get(o) {
            ObjBody::List(l) => l.clone(),
            _ => return Ok(Value::Bool(false)),
        },
        None => return Ok(Value::Bool(false)),
    };
    let a = match vm.heap.get(r) {
        ObjBody::List(l) => l.clone(),
        _ => unreachable!(),
    };
    if a.len() != b.len() {
        return Ok(Value::Bool(false));
    }
    for (x, y) in a.into_iter().zip(b) {
        if !vm.values_equal(x, y)? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

/// Shared list/tuple iteration: the state is the element index.
fn seq_items(vm: &mut Vm, base: usize) -> Result<Vec<Value>, Raised> {
    let r = recv_obj(vm, base);
    match vm.heap.get(r) {
        ObjBody::List(l) => Ok(l.clone()),
        ObjBody::Tuple(t) => Ok(t.to_vec()),
        other => {
            let t = other.type_name();
            Err(vm.type_exc(format!("expected List or Tuple receiver, got {}", t)))
        }
    }
}

fn seq_iter(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let items = seq_items(vm, base)?;
    match arg(vm, base, 0) {
        Value::Null => Ok(if items.is_empty() { Value::Bool(false) } else { Value::Num(0.0) }),
        Value::Num(n) => {
            let next = n + 1.0;
            Ok(if (next as usize) < items.len() { Value::Num(next) } else { Value::Bool(false) })
        }
        other => {
            let t = vm.type_name_of(other);
            Err(vm.type_exc(format!("bad iteration state: {}", t)))
        }
    }
}

fn seq_next(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let items = seq_items(vm, base)?;
    match arg(vm, base, 0) {
        Value::Num(n) if (n as usize) < items.len() => Ok(items[n as usize]),
        _ => Err(vm.index_exc("iteration past end of sequence")),
    }
}

// --------------------------------------------------------------- Tuple --

fn tuple_len(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let items = seq_items(vm, base)?;
    Ok(Value::Num(items.len() as f64))
}

fn tuple_str(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let items = seq_items(vm, base)?;
    let text = seq_to_string(vm, &items, "(", ")")?;
    let s = vm.heap.new_string(text);
    Ok(Value::Obj(s))
}

fn tuple_eq(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let a = seq_items(vm, base)?;
    let other = arg(vm, base, 0);
    let b = match other.as_obj() {
        Some(o) => match vm.heap.get(o) {
            ObjBody::Tuple(t) => t.to_vec(),
            _ => return Ok(Value::Bool(false)),
        },
        None => return Ok(Value::Bool(false)),
    };
    if a.len() != b.len() {
        return Ok(Value::Bool(false));
    }
    for (x, y) in a.into_iter().zip(b) {
        if !vm.values_equal(x, y)? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

// --------------------------------------------------------------- Table --

fn recv_table_ref(vm: &mut Vm, base: usize) -> Result<GcRef, Raised> {
    let r = recv_obj(vm, base);
    match vm.heap.get(r) {
        ObjBody::Table(_) => Ok(r),
        other => {
            let t = other.type_name();
            Err(vm.type_exc(format!("expected Table receiver, got {}", t)))
        }
    }
}

fn table_len(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_table_ref(vm, base)?;
    let len = match vm.heap.get(r) {
        ObjBody::Table(t) => t.len(),
        _ => unreachable!(),
    };
    Ok(Value::Num(len as f64))
}

fn table_contains(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_table_ref(vm, base)?;
    let key = arg(vm, base, 0);
    let found = vm.table_find(r, key)?.is_some();
    Ok(Value::Bool(found))
}

fn table_del(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_table_ref(vm, base)?;
    let key = arg(vm, base, 0);
    let removed = vm.table_delete(r, key)?;
    Ok(Value::Bool(removed))
}

fn table_merge(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let dst = recv_table_ref(vm, base)?;
    let src = match arg(vm, base, 0).as_obj() {
        Some(r) if matches!(vm.heap.get(r), ObjBody::Table(_)) => r,
        _ => {
            let v = arg(vm, base, 0);
            let t = vm.type_name_of(v);
            return Err(vm.type_exc(format!("argument to merge() must be a Table, got {}", t)));
        }
    };
    vm.table_merge(dst, src)?;
    Ok(recv(vm, base))
}

fn table_pairs(vm: &mut Vm, base: usize) -> Result<Vec<(Value, Value)>, Raised> {
    let r = recv_table_ref(vm, base)?;
    match vm.heap.get(r) {
        ObjBody::Table(t) => Ok(t.iter().map(|(_, k, v)| (k, v)).collect()),
        _ => unreachable!(),
    }
}

fn table_keys(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let pairs = table_pairs(vm, base)?;
    let items: Vec<Value> = pairs.into_iter().map(|(k, _)| k).collect();
    let list = vm.heap.alloc(vm.builtins.list, ObjBody::List(items));
    Ok(Value::Obj(list))
}

fn table_values(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let pairs = table_pairs(vm, base)?;
    let items: Vec<Value> = pairs.into_iter().map(|(_, v)| v).collect();
    let list = vm.heap.alloc(vm.builtins.list, ObjBody::List(items));
    Ok(Value::Obj(list))
}

fn table_str(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let pairs = table_pairs(vm, base)?;
    let mut out = String::from("{");
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&display(vm, *k)?);
        out.push_str(": ");
        out.push_str(&display(vm, *v)?);
    }
    out.push('}');
    let s = vm.heap.new_string(out);
    Ok(Value::Obj(s))
}

/// Table iteration states are entry slots; keys come out in table order.
fn table_iter(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_table_ref(vm, base)?;
    let from = match arg(vm, base, 0) {
        Value::Null => 0,
        Value::Num(n) => n as usize + 1,
        other => {
            let t = vm.type_name_of(other);
            return Err(vm.type_exc(format!("bad iteration state: {}", t)));
        }
    };
    let next = match vm.heap.get(r) {
        ObjBody::Table(t) => t.next_used(from),
        _ => unreachable!(),
    };
    Ok(match next {
        Some(slot) => Value::Num(slot as f64),
        None => Value::Bool(false),
    })
}

fn table_next(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let r = recv_table_ref(vm, base)?;
    let slot = match arg(vm, base, 0) {
        Value::Num(n) => n as usize,
        other => {
            let t = vm.type_name_of(other);
            return Err(vm.type_exc(format!("bad iteration state: {}", t)));
        }
    };
    let key = match vm.heap.get(r) {
        ObjBody::Table(t) => t.key_at(slot),
        _ => unreachable!(),
    };
    match key {
        Some(k) => Ok(k),
        None => Err(vm.index_exc("iteration state is no longer valid")),
    }
}

// ----------------------------------------------------------- Generator --

fn recv_gen(vm: &mut Vm, base: usize) -> Result<GcRef, Raised> {
    let r = recv_obj(vm, base);
    match vm.heap.get(r) {
        ObjBody::Generator(_) => Ok(r),
        other => {
            let t = other.type_name();
            Err(vm.type_exc(format!("expected Generator receiver, got {}", t)))
        }
    }
}

fn gen_state(vm: &Vm, g: GcRef) -> GenState {
    match vm.heap.get(g) {
        ObjBody::Generator(gen) => gen.state,
        _ => unreachable!(),
    }
}

/// Advance the generator; the iteration state is the generator itself,
/// falsy once it completes.
fn gen_iter(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let g = recv_gen(vm, base)?;
    if gen_state(vm, g) == GenState::Done {
        return Ok(Value::Bool(false));
    }
    vm.resume_generator(g, Value::Null)?;
    Ok(if gen_state(vm, g) == GenState::Done {
        Value::Bool(false)
    } else {
        Value::Obj(g)
    })
}

fn gen_next(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let g = recv_gen(vm, base)?;
    match vm.heap.get(g) {
        ObjBody::Generator(gen) => Ok(gen.last_yield),
        _ => unreachable!(),
    }
}

fn gen_send(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let g = recv_gen(vm, base)?;
    let v = arg(vm, base, 0);
    let yielded = vm.resume_generator(g, v)?;
    if gen_state(vm, g) == GenState::Done {
        return Err(vm.stop_iteration_exc());
    }
    Ok(yielded)
}

fn gen_is_done(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let g = recv_gen(vm, base)?;
    Ok(Value::Bool(gen_state(vm, g) == GenState::Done))
}

// ----------------------------------------------------------- Exception --

fn exc_print_stacktrace(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let exc = recv(vm, base);
    let rendered = vm.render_exception(exc);
    eprintln!("{}", rendered);
    Ok(Value::Null)
}

// ------------------------------------------------------------------ sys --

fn sys_argv(vm: &mut Vm, _base: usize, _argc: usize) -> Result<Value, Raised> {
    vm.heap.disable();
    let args: Vec<Value> = vm
        .options
        .argv
        .clone()
        .into_iter()
        .map(|a| Value::Obj(vm.heap.new_string(a)))
        .collect();
    let list = vm.heap.alloc(vm.builtins.list, ObjBody::List(args));
    vm.heap.enable();
    Ok(Value::Obj(list))
}

fn sys_platform(vm: &mut Vm, _base: usize, _argc: usize) -> Result<Value, Raised> {
    let s = vm.heap.new_string(std::env::consts::OS.to_string());
    Ok(Value::Obj(s))
}

fn sys_exit(vm: &mut Vm, base: usize, _argc: usize) -> Result<Value, Raised> {
    let code = match arg(vm, base, 0) {
        Value::Num(n) => n as i32,
        _ => 0,
    };
    std::process::exit(code);
}

fn sys_time(_vm: &mut Vm, _base: usize, _argc: usize) -> Result<Value, Raised> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Num(secs))
}
