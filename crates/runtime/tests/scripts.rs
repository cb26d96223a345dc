//! End-to-end tests: parse and run scripts against a ScriptSystem
//!
//! These go through the public API only, the way an embedding host does.

use quill::{
    Context, DictionaryValue, EngineConfig, MemoryResolver, Mode, Process, Record, RecordRef,
    RecordValue, SUPER_NAME, ScriptSystem, State, StepMode, Value, Variable, parse_script,
};
use std::cell::RefCell;
use std::rc::Rc;

fn evaluate(source: &str) -> Value {
    let system = ScriptSystem::default();
    Process::new(&system)
        .evaluate(&parse_script(source).unwrap())
        .unwrap()
}

fn failure_name(source: &str) -> &'static str {
    let system = ScriptSystem::default();
    Process::new(&system)
        .evaluate(&parse_script(source).unwrap())
        .unwrap_err()
        .error
        .name()
}

#[test]
fn test_scenario_sum_of_names() {
    assert_eq!(evaluate("a = 1\nb = a + 2\nb"), Value::from(3.0));
}

#[test]
fn test_scenario_array_length() {
    assert_eq!(evaluate("x = [1,2,3]\nlen(x)"), Value::from(3.0));
}

#[test]
fn test_scenario_precedence() {
    assert_eq!(evaluate("1 + 2 * 3"), Value::from(7.0));
    assert_eq!(evaluate("(1 + 2) * 3"), Value::from(9.0));
}

#[test]
fn test_scenario_missing_operand_is_syntax_error_on_line_1() {
    let error = parse_script("if a ==\n").unwrap_err();
    assert!(error.matches("SyntaxError"));
    assert_eq!(error.line(), Some(1));
}

#[test]
fn test_text_operations() {
    assert_eq!(evaluate("'ab' * 2 + 'c'"), Value::from("ababc"));
    assert_eq!(evaluate("'%s is %d' % ['x', 4]"), Value::from("x is 4"));
    assert_eq!(evaluate("'maps' / 'e1m1.wad'"), Value::from("maps/e1m1.wad"));
    assert_eq!(evaluate("'hello'[-1]"), Value::from("o"));
    assert_eq!(evaluate("'hello'[1:3]"), Value::from("el"));
}

#[test]
fn test_value_methods() {
    assert_eq!(evaluate("'Quill'.upper()"), Value::from("QUILL"));
    assert_eq!(
        evaluate("'/data/maps/e1m1.wad'.fileNameWithoutExtension()"),
        Value::from("e1m1")
    );
    assert_eq!(
        evaluate("'data.txt'.endsWith('.txt')"),
        Value::boolean(true)
    );
    assert_eq!(evaluate("{'a': 1, 'b': 2}.keys()").to_string(), "['a', 'b']");
    assert_eq!(evaluate("[1, 2, 3].contains(2)"), Value::boolean(true));
    assert_eq!(failure_name("(5).upper()"), "NotFoundError");
}

#[test]
fn test_builtin_modules_are_importable() {
    assert_eq!(
        evaluate("import Path\nPath.join('a', 'b', 'c.qs')"),
        Value::from("a/b/c.qs")
    );
    assert_eq!(failure_name("import Version\nVersion.OS = 'plan9'"), "ReadOnlyError");
}

#[test]
fn test_const_and_read_only() {
    assert_eq!(failure_name("const limit = 10\nlimit = 11"), "ReadOnlyError");
    assert_eq!(failure_name("const limit = 10\nlimit += 1"), "ReadOnlyError");
}

#[test]
fn test_host_variable_modes() {
    let system = ScriptSystem::default();
    let globals = Record::new_ref();
    globals.borrow_mut().add(
        Variable::with_mode("speed", Value::from(1.0), Mode::ALLOW_NUMBER).unwrap(),
    );
    let mut process = Process::with_globals(&system, Rc::clone(&globals));

    let failure = process
        .evaluate(&parse_script("speed = 'fast'").unwrap())
        .unwrap_err();
    assert_eq!(failure.error.name(), "InvalidError");
    assert_eq!(globals.borrow().value("speed").unwrap(), Value::from(1.0));

    process.evaluate(&parse_script("speed = 2.5").unwrap()).unwrap();
    assert_eq!(globals.borrow().value("speed").unwrap(), Value::from(2.5));
}

#[test]
fn test_case_insensitive_dictionary_variable() {
    let system = ScriptSystem::default();
    let globals = Record::new_ref();
    globals.borrow_mut().add(
        Variable::with_mode(
            "table",
            Value::Dictionary(DictionaryValue::new()),
            Mode::DEFAULT | Mode::CASE_INSENSITIVE_KEYS,
        )
        .unwrap(),
    );
    let mut process = Process::with_globals(&system, globals);
    let source = "table['Key'] = 1\n\
                  table['KEY'] += 1\n\
                  [table['key'], 'kEy' in table, len(table)]";
    let result = process.evaluate(&parse_script(source).unwrap()).unwrap();
    assert_eq!(result.to_string(), "[2, True, 1]");
}

#[test]
fn test_dictionary_contains_agrees_with_element() {
    let source = "d = {'a': 1, 2: 'two'}\n\
                  found = []\n\
                  for key in ['a', 'A', 2, '2']\n\
                      has = key in d\n\
                      try\n\
                          d[key]\n\
                          found += [has == True]\n\
                      catch NotFoundError\n\
                          found += [has == False]\n\
                      end\n\
                  end\n\
                  found";
    assert_eq!(evaluate(source).to_string(), "[True, True, True, True]");
}

#[test]
fn test_records_and_members() {
    let source = "record Player\n\
                  Player.name = 'ana'\n\
                  Player.score = 10\n\
                  Player.score += 5\n\
                  def describe()\n\
                      return self.name + ': ' + Text(self.score)\n\
                  end\n\
                  Player.describe = describe\n\
                  Player.describe()";
    assert_eq!(evaluate(source), Value::from("ana: 15"));
}

#[test]
fn test_record_scope_inherits_from_super_records() {
    let source = "record Shape()\n\
                      sides = 0\n\
                      def describe()\n\
                          return self.name + ' has ' + Text(self.sides) + ' sides'\n\
                      end\n\
                  end\n\
                  record Square(Shape)\n\
                      name = 'square'\n\
                      sides = 4\n\
                  end\n\
                  record Blob(Shape): name = 'blob'\n\
                  [Square.describe(), Blob.describe(), Blob.sides, len(Square.__super__)]";
    assert_eq!(
        evaluate(source).to_string(),
        "['square has 4 sides', 'blob has 0 sides', 0, 1]"
    );
}

#[test]
fn test_record_scope_reopens_and_sees_outer_names() {
    let source = "base = 10\n\
                  record Base(): k = 1\n\
                  for i in [1, 2]\n\
                      record Counter(Base)\n\
                          n ?= 0\n\
                          n += base + i\n\
                      end\n\
                  end\n\
                  [Counter.n, Counter.k, len(Counter.__super__), 'n' in Base]";
    assert_eq!(evaluate(source).to_string(), "[23, 1, 1, False]");

    assert_eq!(failure_name("x = 1\nrecord A(x): y = 2"), "TypeError");
    assert_eq!(failure_name("record A(): y = 2\nA.z"), "NotFoundError");
}

#[test]
fn test_super_records_from_host() {
    let system = ScriptSystem::default();
    let mut process = Process::new(&system);
    let defaults: RecordRef = Record::new_ref();
    defaults.borrow_mut().add_number("volume", 0.5);
    {
        let globals = process.globals();
        let settings = globals.borrow_mut().subrecord("settings").unwrap();
        settings.borrow_mut().add_super_record(&defaults).unwrap();
    }
    let script = parse_script("settings.volume").unwrap();
    assert_eq!(process.evaluate(&script).unwrap(), Value::from(0.5));
    assert!(process
        .globals()
        .borrow()
        .value_at_path(&format!("settings.{}", SUPER_NAME))
        .is_ok());
}

#[test]
fn test_uncaught_errors_surface_kind_and_line() {
    let system = ScriptSystem::default();
    let mut process = Process::new(&system);
    let script = parse_script("x = 1\n\ny = x / 0\nz = 3").unwrap();
    let failure = process.evaluate(&script).unwrap_err();
    assert_eq!(failure.error.name(), "ArithmeticError");
    assert_eq!(failure.line, 3);
    assert_eq!(process.state(), State::Failed);
    // Side effects before the failure stay.
    assert_eq!(process.globals().borrow().value("x").unwrap(), Value::from(1.0));
    assert!(!process.globals().borrow().has("z"));
}

#[test]
fn test_throw_and_catch_by_name() {
    let source = "def check(n)\n\
                      if n < 0: throw 'negative'\n\
                      return n\n\
                  end\n\
                  try\n\
                      check(-1)\n\
                  catch TypeError\n\
                      result = 'type'\n\
                  catch Error, e\n\
                      result = e\n\
                  end\n\
                  result";
    assert_eq!(evaluate(source), Value::from("Error: negative"));
}

#[test]
fn test_eval_shares_local_namespace() {
    assert_eq!(evaluate("a = 2\neval('b = a * 10')\nb + 1"), Value::from(21.0));
    assert_eq!(
        evaluate("def f(x)\n    return eval('x + 1')\nend\nf(4)"),
        Value::from(5.0)
    );
}

#[test]
fn test_print_goes_to_sink() {
    let system = ScriptSystem::default();
    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&lines);
    system.set_print_sink(move |text| sink.borrow_mut().push(text.to_string()));
    let script = parse_script("for n in [1, 2]: print 'n =', n\nprint").unwrap();
    Process::new(&system).evaluate(&script).unwrap();
    assert_eq!(*lines.borrow(), vec!["n = 1", "n = 2", ""]);
}

fn system_with_modules() -> ScriptSystem {
    let resolver = MemoryResolver::new()
        .with_module(
            "Geometry",
            "unit = 2\ndef area(w, h)\n    return w * h * unit\nend",
        )
        .with_module("Settings", "volume = 5");
    ScriptSystem::new(EngineConfig::default(), resolver)
}

#[test]
fn test_module_functions_use_module_namespace() {
    let system = system_with_modules();
    let script = parse_script("import Geometry\nunit = 100\nGeometry.area(3, 4)").unwrap();
    let result = Process::new(&system).evaluate(&script).unwrap();
    assert_eq!(result, Value::from(24.0));
}

#[test]
fn test_import_record_is_a_copy() {
    let system = system_with_modules();
    let script = parse_script(
        "import record Settings\nSettings.volume = 9\nimport Settings\nSettings.volume",
    )
    .unwrap();
    // The second import rebinds the shared module namespace, untouched by
    // the change to the copy.
    let result = Process::new(&system).evaluate(&script).unwrap();
    assert_eq!(result, Value::from(5.0));
}

#[test]
fn test_missing_and_circular_modules() {
    let system = ScriptSystem::new(
        EngineConfig::default(),
        MemoryResolver::new()
            .with_module("Ping", "import Pong")
            .with_module("Pong", "import Ping"),
    );
    let mut process = Process::new(&system);
    let failure = process
        .evaluate(&parse_script("import Nowhere").unwrap())
        .unwrap_err();
    assert_eq!(failure.error.name(), "NotFoundError");

    let failure = process
        .evaluate(&parse_script("import Ping").unwrap())
        .unwrap_err();
    assert_eq!(failure.error.name(), "IllegalError");
}

fn double(_: &Context, args: &[Value]) -> quill::Result<Option<Value>> {
    Ok(Some(Value::from(args[0].as_number()? * 2.0)))
}

#[test]
fn test_native_module_from_host() {
    let system = ScriptSystem::default();
    let host = Record::new_ref();
    host.borrow_mut().add_native("double", Rc::new(double));
    system.add_native_module("Host", &host);
    let script = parse_script("import Host\nHost.double(21)").unwrap();
    assert_eq!(
        Process::new(&system).evaluate(&script).unwrap(),
        Value::from(42.0)
    );
}

#[test]
fn test_call_depth_limit() {
    let config = EngineConfig {
        max_call_depth: 8,
        ..EngineConfig::default()
    };
    let system = ScriptSystem::new(config, MemoryResolver::new());
    let source = "def depth(n)\n    if n == 0: return 0\n    return 1 + depth(n - 1)\nend\n";
    let mut process = Process::new(&system);
    let ok = parse_script(&format!("{}depth(5)", source)).unwrap();
    assert_eq!(process.evaluate(&ok).unwrap(), Value::from(5.0));

    let too_deep = parse_script(&format!("{}depth(50)", source)).unwrap();
    let failure = process.evaluate(&too_deep).unwrap_err();
    assert_eq!(failure.error.name(), "IllegalError");
}

#[test]
fn test_per_iteration_suspends_only_top_level_loops() {
    let config = EngineConfig {
        step_mode: StepMode::PerIteration,
        ..EngineConfig::default()
    };
    let system = ScriptSystem::new(config, MemoryResolver::new());
    let source = "def count()\n\
                      n = 0\n\
                      while n < 5: n += 1\n\
                      return n\n\
                  end\n\
                  x = 0\n\
                  for i in [1, 2, 3]: x += count()\n\
                  x";
    let mut process = Process::new(&system);
    process.run(&parse_script(source).unwrap()).unwrap();
    let mut steps = 0;
    while process.execute().unwrap() == State::Suspended {
        steps += 1;
    }
    assert_eq!(steps, 2);
    assert_eq!(process.result(), &Value::from(15.0));
}

fn run_against(input: &RecordRef, script: &str) -> Record {
    let system = ScriptSystem::default();
    let globals = input.borrow().duplicate().unwrap().into_ref();
    Process::with_globals(&system, Rc::clone(&globals))
        .evaluate(&parse_script(script).unwrap())
        .unwrap();
    globals.borrow().duplicate().unwrap()
}

#[test]
fn test_evaluation_is_deterministic() {
    let input = Record::new_ref();
    {
        let mut input = input.borrow_mut();
        input.add_array("samples", vec![Value::from(3.0), Value::from(1.0), Value::from(2.0)]);
        input.add_text("label", "run");
        input.subrecord("stats").unwrap();
    }
    let script = "total = 0\n\
                  for s in samples: total += s\n\
                  stats.mean = total / len(samples)\n\
                  stats.names = dir()\n\
                  label += '-' + Text(total)";
    let first = run_against(&input, script);
    let second = run_against(&input, script);
    let first = Value::Record(RecordValue::new_owned(first));
    let second = Value::Record(RecordValue::new_owned(second));
    assert_eq!(first, second);
    let label = first
        .as_record()
        .unwrap()
        .with(|r| r.value("label").unwrap())
        .unwrap();
    assert_eq!(label, Value::from("run-6"));
}
