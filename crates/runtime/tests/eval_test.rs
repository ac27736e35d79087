//! End-to-end evaluation tests: source in, observable state out.
//!
//! Results are read back through the embedding API rather than by
//! capturing stdout, so every assertion is on real VM state.

use brio_runtime::{Value, Vm, VmOptions};

fn vm() -> Vm {
    Vm::new(VmOptions::default())
}

fn eval(vm: &mut Vm, source: &str) {
    vm.evaluate("<test>", source).expect("evaluation succeeds");
}

fn global_num(vm: &mut Vm, name: &str) -> f64 {
    vm.push_module_global("__main__", name).expect("global exists");
    let v = vm.get_slot(-1);
    vm.pop_slots(1);
    match v {
        Value::Num(n) => n,
        other => panic!("expected number in '{}', got {:?}", name, other),
    }
}

fn global_str(vm: &mut Vm, name: &str) -> String {
    vm.push_module_global("__main__", name).expect("global exists");
    let s = vm.get_string(-1).expect("string global").to_string();
    vm.pop_slots(1);
    s
}

fn global_str_list(vm: &mut Vm, name: &str) -> Vec<String> {
    vm.push_module_global("__main__", name).expect("global exists");
    let len = vm.sequence_len(-1).expect("list global");
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        vm.push_sequence_elem(-1, i).expect("element");
        out.push(vm.get_string(-1).expect("string element").to_string());
        vm.pop_slots(1);
    }
    vm.pop_slots(1);
    out
}

fn global_num_list(vm: &mut Vm, name: &str) -> Vec<f64> {
    vm.push_module_global("__main__", name).expect("global exists");
    let len = vm.sequence_len(-1).expect("list global");
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        vm.push_sequence_elem(-1, i).expect("element");
        match vm.get_slot(-1) {
            Value::Num(n) => out.push(n),
            other => panic!("expected number element, got {:?}", other),
        }
        vm.pop_slots(1);
    }
    vm.pop_slots(1);
    out
}

#[test]
fn test_arithmetic_precedence() {
    let mut vm = vm();
    eval(&mut vm, "var x = 1 + 2 * 3");
    assert_eq!(global_num(&mut vm, "x"), 7.0);
}

#[test]
fn test_fibonacci() {
    let mut vm = vm();
    eval(
        &mut vm,
        "fun fib(n)\n if n < 2 then return n end\n return fib(n-1) + fib(n-2)\nend\nvar r = fib(10)",
    );
    assert_eq!(global_num(&mut vm, "r"), 55.0);
}

#[test]
fn test_string_concat_and_compare() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var s = \"foo\" + \"bar\"\nvar eq = s == \"foobar\"\nvar lt = \"abc\" < \"abd\"",
    );
    assert_eq!(global_str(&mut vm, "s"), "foobar");
    vm.push_module_global("__main__", "eq").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
    vm.push_module_global("__main__", "lt").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
}

#[test]
fn test_class_inheritance_and_super() {
    let mut vm = vm();
    eval(
        &mut vm,
        "class C\n fun m() return 1 end\nend\n\
         class D is C\n fun m() return super.m() + 1 end\nend\n\
         var r = D().m()",
    );
    assert_eq!(global_num(&mut vm, "r"), 2.0);
}

#[test]
fn test_constructor_and_fields() {
    let mut vm = vm();
    eval(
        &mut vm,
        "class Point\n fun new(x, y)\n  this.x = x\n  this.y = y\n end\n\
          fun norm2() return this.x * this.x + this.y * this.y end\nend\n\
         var p = Point(3, 4)\nvar n = p.norm2()\np.x = 6\nvar x2 = p.x",
    );
    assert_eq!(global_num(&mut vm, "n"), 25.0);
    assert_eq!(global_num(&mut vm, "x2"), 6.0);
}

#[test]
fn test_field_offsets_stable_across_instances() {
    let mut vm = vm();
    eval(
        &mut vm,
        "class Pair\nend\n\
         var a = Pair()\na.first = 1\na.second = 2\n\
         var b = Pair()\nb.second = 20\nb.first = 10\n\
         var r = a.first * 1000 + a.second * 100 + b.first * 10 + b.second",
    );
    // 1, 2, 10, 20 regardless of write order.
    assert_eq!(global_num(&mut vm, "r"), 1000.0 + 200.0 + 100.0 + 20.0);
}

#[test]
fn test_closures_capture_and_mutate() {
    let mut vm = vm();
    eval(
        &mut vm,
        "fun counter()\n var n = 0\n return fun()\n  n = n + 1\n  return n\n end\nend\n\
         var c = counter()\nvar a = c()\nvar b = c()",
    );
    assert_eq!(global_num(&mut vm, "a"), 1.0);
    assert_eq!(global_num(&mut vm, "b"), 2.0);
}

#[test]
fn test_upvalue_closed_at_scope_exit() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var g = null\nbegin\n var x = 10\n g = fun() return x end\n x = 11\nend\nvar y = g()",
    );
    // The closure observes the last value written before scope exit.
    assert_eq!(global_num(&mut vm, "y"), 11.0);
}

#[test]
fn test_two_closures_share_one_upvalue() {
    let mut vm = vm();
    eval(
        &mut vm,
        "fun pair()\n var n = 0\n var inc = fun() n = n + 1 end\n var get = fun() return n end\n\
          return (inc, get)\nend\n\
         var fns = pair()\nvar inc = fns[0]\nvar get = fns[1]\ninc()\ninc()\nvar r = get()",
    );
    assert_eq!(global_num(&mut vm, "r"), 2.0);
}

#[test]
fn test_while_loop_with_break_continue() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var sum = 0\nvar i = 0\nwhile true do\n i = i + 1\n if i > 10 then break end\n\
          if i % 2 == 0 then continue end\n sum = sum + i\nend",
    );
    // 1 + 3 + 5 + 7 + 9
    assert_eq!(global_num(&mut vm, "sum"), 25.0);
}

#[test]
fn test_for_over_list() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var acc = 0\nfor v in [1, 2, 3, 4] do\n acc = acc + v\nend",
    );
    assert_eq!(global_num(&mut vm, "acc"), 10.0);
}

#[test]
fn test_exception_handled_then_ensure_then_after() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var order = []\ntry\n raise TypeException(\"boom\")\n order.add(\"unreached\")\n\
         except TypeException e\n order.add(\"handled:\" + e.message())\n\
         ensure\n order.add(\"ensured\")\nend\norder.add(\"after\")",
    );
    assert_eq!(
        global_str_list(&mut vm, "order"),
        vec!["handled:boom", "ensured", "after"]
    );
}

#[test]
fn test_exception_class_match_is_subclass_test() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var caught = \"no\"\ntry\n raise TypeException(\"x\")\nexcept Exception e\n caught = \"yes\"\nend",
    );
    assert_eq!(global_str(&mut vm, "caught"), "yes");
}

#[test]
fn test_unmatched_exception_reaches_outer_handler() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var path = []\ntry\n try\n  raise NameException(\"inner\")\n except TypeException e\n  path.add(\"wrong\")\n end\n\
         except NameException e\n path.add(\"outer\")\nend",
    );
    assert_eq!(global_str_list(&mut vm, "path"), vec!["outer"]);
}

#[test]
fn test_return_runs_ensure_first() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var order = []\nfun f()\n try\n  order.add(\"body\")\n  return 42\n ensure\n  order.add(\"ensure\")\n end\nend\n\
         var r = f()\norder.add(\"after\")",
    );
    assert_eq!(global_num(&mut vm, "r"), 42.0);
    assert_eq!(global_str_list(&mut vm, "order"), vec!["body", "ensure", "after"]);
}

#[test]
fn test_ensure_reraises_unhandled_exception() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var order = []\ntry\n try\n  raise TypeException(\"x\")\n ensure\n  order.add(\"inner-ensure\")\n end\n\
         except TypeException e\n order.add(\"caught\")\nend",
    );
    assert_eq!(global_str_list(&mut vm, "order"), vec!["inner-ensure", "caught"]);
}

#[test]
fn test_uncaught_exception_fails_evaluation() {
    let mut vm = vm();
    let result = vm.evaluate("<test>", "raise TypeException(\"boom\")");
    assert!(result.is_err());
    let exc = vm.current_exception().expect("escaped exception recorded");
    let message = vm.exception_message(exc);
    assert!(message.contains("TypeException"));
    assert!(message.contains("boom"));
}

#[test]
fn test_stack_trace_records_call_chain() {
    let mut vm = vm();
    let result = vm.evaluate(
        "<test>",
        "fun inner()\n raise TypeException(\"deep\")\nend\nfun outer()\n inner()\nend\nouter()",
    );
    assert!(result.is_err());
    let exc = vm.current_exception().unwrap();
    let rendered = vm.render_exception(exc);
    assert!(rendered.contains("inner"));
    assert!(rendered.contains("outer"));
    // Oldest frame first when printed.
    let outer_pos = rendered.find("outer").unwrap();
    let inner_pos = rendered.find("inner").unwrap();
    assert!(outer_pos < inner_pos);
}

#[test]
fn test_generator_for_loop() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var g = fun()\n yield 1\n yield 2\n yield 3\nend\nvar acc = []\nfor v in g() do\n acc.add(v)\nend",
    );
    assert_eq!(global_num_list(&mut vm, "acc"), vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_generator_send_and_done() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var g = fun()\n var got = yield 1\n yield got * 10\nend\n\
         var it = g()\nit.send(null)\nvar r = it.send(5)\nvar done_before = it.isDone()\n\
         var caught = false\ntry\n it.send(null)\nexcept StopIteration e\n caught = true\nend\n\
         var done_after = it.isDone()",
    );
    assert_eq!(global_num(&mut vm, "r"), 50.0);
    vm.push_module_global("__main__", "caught").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
    vm.push_module_global("__main__", "done_after").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
}

#[test]
fn test_nested_generators() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var inner = fun()\n yield 1\n yield 2\nend\n\
         var outer = fun()\n for v in inner() do\n  yield v * 10\n end\nend\n\
         var acc = []\nfor v in outer() do\n acc.add(v)\nend",
    );
    assert_eq!(global_num_list(&mut vm, "acc"), vec![10.0, 20.0]);
}

#[test]
fn test_vararg_collects_tuple() {
    let mut vm = vm();
    eval(
        &mut vm,
        "fun f(first, rest...)\n var n = rest.len()\n return first * 100 + n\nend\n\
         var a = f(1)\nvar b = f(2, 9, 9, 9)",
    );
    assert_eq!(global_num(&mut vm, "a"), 100.0);
    assert_eq!(global_num(&mut vm, "b"), 203.0);
}

#[test]
fn test_default_arguments() {
    let mut vm = vm();
    eval(
        &mut vm,
        "fun greet(name, greeting=\"hi\")\n return greeting + \" \" + name\nend\n\
         var a = greet(\"bo\")\nvar b = greet(\"bo\", \"yo\")",
    );
    assert_eq!(global_str(&mut vm, "a"), "hi bo");
    assert_eq!(global_str(&mut vm, "b"), "yo bo");
}

#[test]
fn test_wrong_arity_raises_type_exception() {
    let mut vm = vm();
    eval(
        &mut vm,
        "fun two(a, b) return a + b end\nvar caught = false\n\
         try\n two(1)\nexcept TypeException e\n caught = true\nend",
    );
    vm.push_module_global("__main__", "caught").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
}

#[test]
fn test_unpacking_assignment_swaps() {
    let mut vm = vm();
    eval(&mut vm, "var a = 1\nvar b = 2\na, b = (b, a)");
    assert_eq!(global_num(&mut vm, "a"), 2.0);
    assert_eq!(global_num(&mut vm, "b"), 1.0);
}

#[test]
fn test_unpack_from_function_result() {
    let mut vm = vm();
    eval(
        &mut vm,
        "fun both() return (7, 8) end\nvar a, b = both()",
    );
    assert_eq!(global_num(&mut vm, "a"), 7.0);
    assert_eq!(global_num(&mut vm, "b"), 8.0);
}

#[test]
fn test_unpack_wrong_count_raises() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var caught = false\ntry\n var a, b = (1, 2, 3)\nexcept InvalidArgException e\n caught = true\nend",
    );
    vm.push_module_global("__main__", "caught").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
}

#[test]
fn test_table_literal_and_access() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var t = {\"a\": 1, \"b\": 2}\nvar a = t[\"a\"]\nt[\"c\"] = 3\nvar n = t.len()\n\
         var has = t.contains(\"b\")\nt.del(\"b\")\nvar gone = t[\"b\"]",
    );
    assert_eq!(global_num(&mut vm, "a"), 1.0);
    assert_eq!(global_num(&mut vm, "n"), 3.0);
    vm.push_module_global("__main__", "gone").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Null);
    vm.pop_slots(1);
}

#[test]
fn test_table_merge_overwrites_and_adds() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var a = {\"x\": 1}\nvar b = {\"x\": 9, \"y\": 2}\na.merge(b)\n\
         var x = a[\"x\"]\nvar y = a[\"y\"]\nvar n = a.len()",
    );
    assert_eq!(global_num(&mut vm, "x"), 9.0);
    assert_eq!(global_num(&mut vm, "y"), 2.0);
    assert_eq!(global_num(&mut vm, "n"), 2.0);
}

#[test]
fn test_table_negative_zero_key() {
    let mut vm = vm();
    eval(&mut vm, "var t = {}\nt[-0.0] = \"zero\"\nvar r = t[0]");
    assert_eq!(global_str(&mut vm, "r"), "zero");
}

#[test]
fn test_table_nan_key_rejected() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var nan = 0 / 0\nvar caught = false\nvar t = {}\n\
         try\n t[nan] = 1\nexcept TypeException e\n caught = true\nend",
    );
    vm.push_module_global("__main__", "caught").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
}

#[test]
fn test_division_by_zero_is_ieee() {
    let mut vm = vm();
    eval(&mut vm, "var inf = 1 / 0\nvar isinf = inf > 1e308");
    vm.push_module_global("__main__", "isinf").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
}

#[test]
fn test_operator_overload_on_user_class() {
    let mut vm = vm();
    eval(
        &mut vm,
        "class Vec\n fun new(x) this.x = x end\n fun __add__(other) return Vec(this.x + other.x) end\n\
          fun __eq__(other) return this.x == other.x end\nend\n\
         var v = Vec(1) + Vec(2)\nvar r = v.x\nvar same = Vec(3) == v",
    );
    assert_eq!(global_num(&mut vm, "r"), 3.0);
    vm.push_module_global("__main__", "same").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
}

#[test]
fn test_reversed_operator_dispatch() {
    let mut vm = vm();
    eval(
        &mut vm,
        "class Scale\n fun new(k) this.k = k end\n fun __rmul__(n) return n * this.k end\nend\n\
         var r = 3 * Scale(7)",
    );
    assert_eq!(global_num(&mut vm, "r"), 21.0);
}

#[test]
fn test_is_operator() {
    let mut vm = vm();
    eval(
        &mut vm,
        "class A\nend\nclass B is A\nend\n\
         var b_is_a = B() is A\nvar a_is_b = A() is B\nvar num_is = 1 is Number\nvar obj_is = 1 is Object",
    );
    for (name, expected) in [
        ("b_is_a", true),
        ("a_is_b", false),
        ("num_is", true),
        ("obj_is", true),
    ] {
        vm.push_module_global("__main__", name).unwrap();
        assert_eq!(vm.get_slot(-1), Value::Bool(expected), "global {}", name);
        vm.pop_slots(1);
    }
}

#[test]
fn test_recursion_limit_raises_stack_overflow() {
    let mut vm = vm();
    let result = vm.evaluate("<test>", "fun f() return f() end\nf()");
    assert!(result.is_err());
    let exc = vm.current_exception().unwrap();
    let message = vm.exception_message(exc);
    assert!(message.contains("StackOverflow"), "got: {}", message);
    // The VM is still usable afterwards.
    vm.evaluate("<test>", "var ok = 1 + 1").unwrap();
    assert_eq!(global_num(&mut vm, "ok"), 2.0);
}

#[test]
fn test_stack_overflow_is_catchable() {
    let mut vm = vm();
    eval(
        &mut vm,
        "fun f() return f() end\nvar caught = false\n\
         try\n f()\nexcept StackOverflowException e\n caught = true\nend",
    );
    vm.push_module_global("__main__", "caught").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
}

#[test]
fn test_interrupt_flag_raises_program_interrupted() {
    let mut vm = vm();
    vm.interrupt_handle().store(true, std::sync::atomic::Ordering::Relaxed);
    let result = vm.evaluate("<test>", "while true do end");
    assert!(result.is_err());
    let exc = vm.current_exception().unwrap();
    assert!(vm.exception_message(exc).contains("ProgramInterrupted"));
}

#[test]
fn test_name_error_for_undefined_global() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var caught = false\ntry\n missing()\nexcept NameException e\n caught = true\nend",
    );
    vm.push_module_global("__main__", "caught").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
}

#[test]
fn test_index_out_of_bounds() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var caught = false\ntry\n var x = [1, 2][5]\nexcept IndexOutOfBoundException e\n caught = true\nend",
    );
    vm.push_module_global("__main__", "caught").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
}

#[test]
fn test_string_iteration() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var acc = []\nfor c in \"abc\" do\n acc.add(c)\nend",
    );
    assert_eq!(global_str_list(&mut vm, "acc"), vec!["a", "b", "c"]);
}

#[test]
fn test_bound_method_value() {
    let mut vm = vm();
    eval(
        &mut vm,
        "var l = [1, 2, 3]\nvar m = l.len\nvar r = m()",
    );
    assert_eq!(global_num(&mut vm, "r"), 3.0);
}

#[test]
fn test_sys_argv() {
    let mut options = VmOptions::default();
    options.argv = vec!["hello".to_string(), "world".to_string()];
    let mut vm = Vm::new(options);
    eval(&mut vm, "import sys for argv\nvar first = argv[0]\nvar n = argv.len()");
    assert_eq!(global_str(&mut vm, "first"), "hello");
    assert_eq!(global_num(&mut vm, "n"), 2.0);
}

#[test]
fn test_evaluate_bytecode_roundtrip() {
    let source = "fun triple(n) return n * 3 end\nvar r = triple(14)";
    let proto = brio_compiler::compile("__main__", source).expect("compiles");
    let bytes = brio_core::serialize(&proto);

    let mut vm = vm();
    vm.evaluate_bytecode("__main__", "<mem>", &bytes).expect("bytecode runs");
    assert_eq!(global_num(&mut vm, "r"), 42.0);
}

#[test]
fn test_evaluate_bytecode_rejects_bad_magic() {
    let mut vm = vm();
    let result = vm.evaluate_bytecode("__main__", "<mem>", &[1, 2, 3, 4, 5, 6, 7]);
    assert!(result.is_err());
}

#[test]
fn test_repl_style_state_persistence() {
    let mut vm = vm();
    vm.evaluate_module("__main__", "<stdin>", "var counter = 1").unwrap();
    vm.evaluate_module("__main__", "<stdin>", "counter = counter + 1").unwrap();
    assert_eq!(global_num(&mut vm, "counter"), 2.0);
}
