//! The embedding API.
//!
//! Host code talks to the VM through stack slots: values are pushed onto
//! the value stack, addressed by index (non-negative from the API base,
//! negative from the top), and calls consume the callee and arguments from
//! the top of the stack, replacing them with the result.
//!
//! Misusing a slot index (addressing past the live stack) is a host bug
//! and asserts rather than raising an in-language exception.

use crate::object::{ObjBody, ObjUserdata, Raised};
use crate::value::{GcRef, Value};
use crate::vm::Vm;

impl Vm {
    fn api_index(&self, slot: i32) -> usize {
        let idx = if slot < 0 {
            self.stack.len() as i64 + slot as i64
        } else {
            slot as i64
        };
        assert!(
            idx >= 0 && (idx as usize) < self.stack.len(),
            "API slot {} out of range (stack height {})",
            slot,
            self.stack.len()
        );
        idx as usize
    }

    // ------------------------------------------------------------ push --

    pub fn push_value(&mut self, v: Value) {
        self.push(v);
    }

    pub fn push_num(&mut self, n: f64) {
        self.push(Value::Num(n));
    }

    pub fn push_bool(&mut self, b: bool) {
        self.push(Value::Bool(b));
    }

    pub fn push_null(&mut self) {
        self.push(Value::Null);
    }

    pub fn push_handle(&mut self, p: *mut std::ffi::c_void) {
        self.push(Value::Handle(p));
    }

    /// Push a fresh (non-interned) string.
    pub fn push_string(&mut self, text: &str) {
        self.maybe_collect();
        let r = self.heap.new_string(text.to_string());
        self.push(Value::Obj(r));
    }

    /// Push a new empty list.
    pub fn push_list(&mut self) {
        let list = self.alloc(self.builtins.list, ObjBody::List(Vec::new()));
        self.push(Value::Obj(list));
    }

    /// Push an opaque byte buffer with an optional collector-run cleanup.
    pub fn push_userdata(&mut self, data: Vec<u8>, finalizer: Option<fn(&mut [u8])>) {
        let ud = self.alloc(None, ObjBody::Userdata(ObjUserdata { data, finalizer }));
        self.push(Value::Obj(ud));
    }

    /// Pop and discard the top `n` slots.
    pub fn pop_slots(&mut self, n: usize) {
        assert!(n <= self.stack.len(), "pop past the stack base");
        let new_len = self.stack.len() - n;
        self.stack.truncate(new_len);
    }

    pub fn stack_height(&self) -> usize {
        self.stack.len()
    }

    // ------------------------------------------------------------- get --

    pub fn get_slot(&self, slot: i32) -> Value {
        self.stack[self.api_index(slot)]
    }

    // ------------------------------------------------------ predicates --

    pub fn is_num(&self, slot: i32) -> bool {
        matches!(self.get_slot(slot), Value::Num(_))
    }

    pub fn is_bool(&self, slot: i32) -> bool {
        matches!(self.get_slot(slot), Value::Bool(_))
    }

    pub fn is_null(&self, slot: i32) -> bool {
        matches!(self.get_slot(slot), Value::Null)
    }

    fn slot_body(&self, slot: i32) -> Option<&ObjBody> {
        self.get_slot(slot).as_obj().map(|r| self.heap.get(r))
    }

    pub fn is_string(&self, slot: i32) -> bool {
        matches!(self.slot_body(slot), Some(ObjBody::Str(_)))
    }

    pub fn is_list(&self, slot: i32) -> bool {
        matches!(self.slot_body(slot), Some(ObjBody::List(_)))
    }

    pub fn is_tuple(&self, slot: i32) -> bool {
        matches!(self.slot_body(slot), Some(ObjBody::Tuple(_)))
    }

    pub fn is_table(&self, slot: i32) -> bool {
        matches!(self.slot_body(slot), Some(ObjBody::Table(_)))
    }

    pub fn is_instance_obj(&self, slot: i32) -> bool {
        matches!(self.slot_body(slot), Some(ObjBody::Instance(_)))
    }

    // -------------------------------------------------- checked access --

    /// The number in `slot`, or a `TypeException` naming the argument.
    pub fn check_num(&mut self, slot: i32, what: &str) -> Result<f64, Raised> {
        match self.get_slot(slot) {
            Value::Num(n) => Ok(n),
            other => {
                let t = self.type_name_of(other);
                Err(self.type_exc(format!("{} must be a Number, got {}", what, t)))
            }
        }
    }

    /// Like `check_num`, also requiring an integral value.
    pub fn check_int(&mut self, slot: i32, what: &str) -> Result<i64, Raised> {
        let n = self.check_num(slot, what)?;
        if n.fract() != 0.0 {
            return Err(self.arg_exc(format!("{} must be an integer, got {}", what, n)));
        }
        Ok(n as i64)
    }

    pub fn check_string(&mut self, slot: i32, what: &str) -> Result<String, Raised> {
        match self.slot_body(slot) {
            Some(ObjBody::Str(s)) => Ok(s.bytes.clone()),
            _ => {
                let v = self.get_slot(slot);
                let t = self.type_name_of(v);
                Err(self.type_exc(format!("{} must be a String, got {}", what, t)))
            }
        }
    }

    /// Read a string slot without copying.
    pub fn get_string(&self, slot: i32) -> Option<&str> {
        match self.slot_body(slot) {
            Some(ObjBody::Str(s)) => Some(&s.bytes),
            _ => None,
        }
    }

    // ------------------------------------------------- list and tuple --

    pub fn sequence_len(&self, slot: i32) -> Option<usize> {
        match self.slot_body(slot)? {
            ObjBody::List(l) => Some(l.len()),
            ObjBody::Tuple(t) => Some(t.len()),
            _ => None,
        }
    }

    /// Push element `idx` of the list or tuple in `slot`.
    pub fn push_sequence_elem(&mut self, slot: i32, idx: usize) -> Result<(), Raised> {
        let obj = self.get_slot(slot);
        let v = self.subscript_get(obj, Value::Num(idx as f64))?;
        self.push(v);
        Ok(())
    }

    /// Pop a value and append it to the list in `slot`.
    pub fn append_to_list(&mut self, slot: i32) -> Result<(), Raised> {
        let v = self.pop();
        let list = self.get_slot(slot);
        match list.as_obj() {
            Some(r) if matches!(self.heap.get(r), ObjBody::List(_)) => {
                if let ObjBody::List(l) = self.heap.get_mut(r) {
                    l.push(v);
                }
                self.heap.account_growth(std::mem::size_of::<Value>());
                Ok(())
            }
            _ => {
                let t = self.type_name_of(list);
                Err(self.type_exc(format!("expected List, got {}", t)))
            }
        }
    }

    // ------------------------------------------------ fields & globals --

    /// Push `obj.name`: an instance field or a module member.
    pub fn push_field(&mut self, slot: i32, name: &str) -> Result<(), Raised> {
        let obj = self.get_slot(slot);
        let name_ref = self.intern(name);
        match obj.as_obj().map(|r| (r, self.heap.get(r))) {
            Some((r, ObjBody::Instance(_))) => match self.get_field_raw(r, name_ref) {
                Some(v) => {
                    self.push(v);
                    Ok(())
                }
                None => Err(self.name_exc(format!("no field '{}'", name))),
            },
            Some((r, ObjBody::Module(_))) => match self.module_global(r, name_ref) {
                Some((_, v)) => {
                    self.push(v);
                    Ok(())
                }
                None => Err(self.name_exc(format!("module has no member '{}'", name))),
            },
            _ => {
                let t = self.type_name_of(obj);
                Err(self.type_exc(format!("cannot read fields of {}", t)))
            }
        }
    }

    /// Pop a value and store it as `obj.name`.
    pub fn store_field(&mut self, slot: i32, name: &str) -> Result<(), Raised> {
        let v = self.pop();
        let obj = self.get_slot(slot);
        let name_ref = self.intern(name);
        match obj.as_obj().map(|r| (r, self.heap.get(r))) {
            Some((r, ObjBody::Instance(_))) => {
                self.set_field_raw(r, name_ref, v);
                Ok(())
            }
            Some((r, ObjBody::Module(_))) => {
                self.define_global(r, name_ref, v);
                Ok(())
            }
            _ => {
                let t = self.type_name_of(obj);
                Err(self.type_exc(format!("cannot set fields on {}", t)))
            }
        }
    }

    /// Push a global of a loaded module.
    pub fn push_module_global(&mut self, module: &str, name: &str) -> Result<(), Raised> {
        let module_ref = self.intern(module);
        let m = match self.modules.get(&module_ref) {
            Some(&m) => m,
            None => return Err(self.import_exc(format!("module '{}' is not loaded", module))),
        };
        let name_ref = self.intern(name);
        match self.module_global(m, name_ref) {
            Some((_, v)) => {
                self.push(v);
                Ok(())
            }
            None => Err(self.name_exc(format!("no global '{}' in module '{}'", name, module))),
        }
    }

    /// Define or overwrite a global of a loaded module.
    pub fn store_module_global(&mut self, module: &str, name: &str) -> Result<(), Raised> {
        let v = self.pop();
        let module_ref = self.intern(module);
        let m = match self.modules.get(&module_ref) {
            Some(&m) => m,
            None => return Err(self.import_exc(format!("module '{}' is not loaded", module))),
        };
        let name_ref = self.intern(name);
        self.define_global(m, name_ref, v);
        Ok(())
    }

    fn intern(&mut self, text: &str) -> GcRef {
        self.maybe_collect();
        self.heap.intern(text)
    }

    // ------------------------------------------------------------ call --

    /// Call with the callee and `argc` arguments on the stack; the result
    /// replaces them.
    pub fn api_call(&mut self, argc: usize) -> Result<(), Raised> {
        assert!(self.stack.len() > argc, "call without callee on the stack");
        let callee_pos = self.stack.len() - argc - 1;
        let callee = self.stack[callee_pos];
        let args: Vec<Value> = self.stack.split_off(callee_pos + 1);
        self.stack.truncate(callee_pos);
        let result = self.call_function(callee, &args)?;
        self.push(result);
        Ok(())
    }

    /// Invoke `name` on the receiver under `argc` arguments; the result
    /// replaces receiver and arguments.
    pub fn api_call_method(&mut self, name: &str, argc: usize) -> Result<(), Raised> {
        assert!(self.stack.len() > argc, "method call without receiver on the stack");
        let recv_pos = self.stack.len() - argc - 1;
        let receiver = self.stack[recv_pos];
        let name_ref = self.intern(name);
        let args: Vec<Value> = self.stack.split_off(recv_pos + 1);
        self.stack.truncate(recv_pos);
        let result = self.invoke_method(receiver, name_ref, &args)?;
        self.push(result);
        Ok(())
    }

    // -------------------------------------------------------- iteration --

    /// Drive the `__iter__`/`__next__` protocol over `iterable`, invoking
    /// `f` for each element.
    pub fn iterate(
        &mut self,
        iterable: Value,
        mut f: impl FnMut(&mut Vm, Value) -> Result<(), Raised>,
    ) -> Result<(), Raised> {
        let iter_name = self.names.iter;
        let next_name = self.names.next;
        let mut state = Value::Null;
        loop {
            state = self.invoke_method(iterable, iter_name, &[state])?;
            if !state.is_truthy() {
                return Ok(());
            }
            let item = self.invoke_method(iterable, next_name, &[state])?;
            f(self, item)?;
        }
    }

    // ------------------------------------------------------ diagnostics --

    /// Print the trace of the exception that escaped the last evaluation.
    pub fn print_stack_trace(&mut self) {
        if let Some(exc) = self.current_exception {
            let rendered = self.render_exception(exc);
            eprintln!("{}", rendered);
        }
    }
}

/// A growable byte buffer that finalizes into a string value, for natives
/// and hosts assembling text piecewise.
#[derive(Default)]
pub struct StringBuffer {
    text: String,
}

impl StringBuffer {
    pub fn new() -> StringBuffer {
        StringBuffer::default()
    }

    pub fn append(&mut self, s: &str) -> &mut Self {
        self.text.push_str(s);
        self
    }

    pub fn append_char(&mut self, c: char) -> &mut Self {
        self.text.push(c);
        self
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Turn the buffer into a string value on the VM stack.
    pub fn finish(self, vm: &mut Vm) {
        vm.push_string(&self.text);
    }
}
