//! Collector behavior under real programs: stress mode, reachability
//! through every root class, weak interning.

use brio_runtime::{Value, Vm, VmOptions};

fn stress_vm() -> Vm {
    let mut options = VmOptions::default();
    options.stress_gc = true;
    Vm::new(options)
}

fn global_num(vm: &mut Vm, name: &str) -> f64 {
    vm.push_module_global("__main__", name).expect("global exists");
    let v = vm.get_slot(-1);
    vm.pop_slots(1);
    match v {
        Value::Num(n) => n,
        other => panic!("expected number, got {:?}", other),
    }
}

#[test]
fn test_stress_gc_program_still_correct() {
    // Collecting at every allocation point shakes out unrooted
    // intermediates; the program must still compute the same answer.
    let mut vm = stress_vm();
    vm.evaluate(
        "<test>",
        "var acc = []\nvar i = 0\nwhile i < 50 do\n acc.add(\"item\" + \"-\" + \"x\")\n i = i + 1\nend\n\
         var n = acc.len()",
    )
    .unwrap();
    assert_eq!(global_num(&mut vm, "n"), 50.0);
}

#[test]
fn test_stress_gc_with_closures_and_classes() {
    let mut vm = stress_vm();
    vm.evaluate(
        "<test>",
        "class Node\n fun new(v)\n  this.v = v\n  this.next = null\n end\nend\n\
         fun build(n)\n var head = null\n var i = 0\n while i < n do\n  var node = Node(i)\n  node.next = head\n  head = node\n  i = i + 1\n end\n return head\nend\n\
         var head = build(30)\nvar sum = 0\nwhile head != null do\n sum = sum + head.v\n head = head.next\nend",
    )
    .unwrap();
    // 0 + 1 + ... + 29
    assert_eq!(global_num(&mut vm, "sum"), 435.0);
}

#[test]
fn test_stress_gc_generators_survive_collection() {
    let mut vm = stress_vm();
    vm.evaluate(
        "<test>",
        "var g = fun()\n var i = 0\n while i < 10 do\n  yield i\n  i = i + 1\n end\nend\n\
         var total = 0\nfor v in g() do\n total = total + v\nend",
    )
    .unwrap();
    assert_eq!(global_num(&mut vm, "total"), 45.0);
}

#[test]
fn test_explicit_collection_preserves_reachable_state() {
    let mut vm = Vm::new(VmOptions::default());
    vm.evaluate(
        "<test>",
        "var keep = {\"k\": [1, 2, 3]}\ngcCollect()\nvar n = keep[\"k\"].len()",
    )
    .unwrap();
    assert_eq!(global_num(&mut vm, "n"), 3.0);
}

#[test]
fn test_collection_frees_garbage() {
    let mut vm = Vm::new(VmOptions::default());
    vm.evaluate(
        "<test>",
        "var i = 0\nwhile i < 1000 do\n var tmp = [i, i, i]\n i = i + 1\nend",
    )
    .unwrap();
    let live_before = vm.heap.live_objects();
    vm.collect_garbage();
    assert!(
        vm.heap.live_objects() <= live_before,
        "collection must not grow the live set"
    );
    // The intern pool holds no dangling keys: every pooled string is live.
    for r in vm.heap.pool.iter().collect::<Vec<_>>() {
        assert!(vm.heap.is_live(r));
    }
}

#[test]
fn test_gc_stats_accumulate() {
    let mut vm = Vm::new(VmOptions::default());
    let collections_before = vm.heap.stats.collections;
    vm.collect_garbage();
    vm.collect_garbage();
    assert_eq!(vm.heap.stats.collections, collections_before + 2);
}

#[test]
fn test_symbol_cache_stats() {
    let mut vm = Vm::new(VmOptions::default());
    vm.evaluate(
        "<test>",
        "var total = 0\nvar i = 0\nwhile i < 100 do\n total = total + i\n i = i + 1\nend",
    )
    .unwrap();
    // Repeated global access hits the inline caches after the first miss.
    assert!(vm.stats.cache_hits > vm.stats.cache_misses);
}
