//! Property-based tests for arithmetic and tables.

mod common;

use std::collections::HashMap;
use std::path::Path;

use common::{run, Capture};
use gem::{compile_source, CompileOptions, Vm, VmConfig};
use proptest::prelude::*;

fn arb_small_int() -> impl Strategy<Value = i64> {
    0i64..1000i64
}

/// Arithmetic over small integers, as Gem source. No division, so nothing can fail.
fn arb_expression() -> impl Strategy<Value = String> {
    let leaf = arb_small_int().prop_map(|n| n.to_string());
    leaf.prop_recursive(4, 32, 2, |inner| {
        (inner.clone(), prop::sample::select(vec!["+", "-", "*"]), inner)
            .prop_map(|(a, op, b)| format!("({} {} {})", a, op, b))
    })
}

fn output(source: &str, optimize: bool) -> String {
    let bytecode =
        compile_source(source, Path::new("prop.gem"), &CompileOptions { optimize }).unwrap();
    let capture = Capture::default();
    let mut vm = Vm::with_output(VmConfig::default(), Box::new(capture.clone()));
    vm.evaluate(&bytecode).unwrap();
    capture.contents()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn integer_arithmetic_matches_rust(a in arb_small_int(), b in arb_small_int()) {
        let source = format!("console.out({a} + {b}, \" \", {a} - {b}, \" \", {a} * {b})");
        let expected = format!("{} {} {}\n", a + b, a - b, a * b);
        prop_assert_eq!(run(&source), expected);
    }

    #[test]
    fn division_modulo_and_power_match_f64(
        a in -1000i64..1000,
        divisor in 1i64..100,
        negative in any::<bool>(),
        base in 0i64..50,
        exponent in 0i64..6,
    ) {
        let b = if negative { -divisor } else { divisor };
        let source = format!(
            "console.out(({a}) / ({b}), \" \", ({a}) % ({b}), \" \", {base} ^ {exponent})"
        );
        let (a, b) = (a as f64, b as f64);
        let expected = [a / b, a % b, (base as f64).powf(exponent as f64)];
        let printed = run(&source);
        let got: Vec<f64> = printed
            .trim_end()
            .split(' ')
            .map(|part| part.parse().unwrap())
            .collect();
        prop_assert_eq!(got.len(), 3);
        for (got, want) in got.iter().zip(expected) {
            prop_assert!((got - want).abs() <= 1e-9 * want.abs().max(1.0), "{} vs {}", got, want);
        }
    }

    #[test]
    fn folding_does_not_change_results(expr in arb_expression()) {
        let source = format!("console.out({})", expr);
        prop_assert_eq!(output(&source, true), output(&source, false));
    }

    #[test]
    fn last_write_wins(writes in prop::collection::vec(("[a-d]", arb_small_int()), 1..20)) {
        let mut source = String::from("var t = {}\n");
        let mut expected = HashMap::new();
        for (key, value) in &writes {
            source.push_str(&format!("t.{} = {}\n", key, value));
            expected.insert(key.clone(), *value);
        }
        source.push_str("console.out(t.length())\n");
        let mut keys: Vec<_> = expected.keys().cloned().collect();
        keys.sort();
        for key in &keys {
            source.push_str(&format!("console.out(t.{})\n", key));
        }

        let mut want = format!("{}\n", expected.len());
        for key in &keys {
            want.push_str(&format!("{}\n", expected[key]));
        }
        prop_assert_eq!(run(&source), want);
    }
}
