mod common;

use common::{P, Unit, calls_to, count_instructions, verified};
use hsilc::{
    diagnostics::ErrorCode,
    frontend::{symbol::SymbolFlags, types::VariableType},
    middle::il::InstructionKind,
};

#[test]
fn return_inside_try_runs_the_single_finally_copy() {
    let mut unit = Unit::new();
    let note = unit
        .symbols
        .register_function("note", P, &[], VariableType::NoReturn, SymbolFlags::empty());
    let f = unit.symbols.register_function(
        "f",
        P,
        &[("flag", VariableType::Boolean)],
        VariableType::Integer,
        SymbolFlags::empty(),
    );
    let flag = unit.symbols.function(f).unwrap().arguments[0];

    unit.define(f, |c| {
        c.open_try(P);
        {
            let condition = c.variable(P, flag);
            c.open_if(P, condition);
            let five = c.integer(P, 5);
            c.return_value(P, Some(five))?;
            c.close_if()?;
        }
        c.open_finally()?;
        {
            let call = c.call(P, note, vec![])?;
            c.evaluate(P, call)?;
        }
        c.close_try_finally()?;

        let zero = c.integer(P, 0);
        c.return_value(P, Some(zero))?;
        Ok(())
    });

    let (result, diagnostics) = unit.compile(&verified());
    let module = result.unwrap();
    assert!(!diagnostics.has_errors());

    let function = module.function(f).unwrap();
    assert_eq!(calls_to(function, &unit.symbols, "NOTE"), 1);
    assert_eq!(
        count_instructions(function, |kind| matches!(kind, InstructionKind::Return { .. })),
        2
    );
}

#[test]
fn finally_rethrows_what_the_try_block_threw() {
    let mut unit = Unit::new();
    let note = unit
        .symbols
        .register_function("note", P, &[], VariableType::NoReturn, SymbolFlags::empty());
    let f = unit
        .symbols
        .register_function("f", P, &[], VariableType::NoReturn, SymbolFlags::empty());

    unit.define(f, |c| {
        c.open_try(P);
        let call = c.call(P, note, vec![])?;
        c.evaluate(P, call)?;
        c.open_finally()?;
        let call = c.call(P, note, vec![])?;
        c.evaluate(P, call)?;
        c.close_try_finally()?;
        Ok(())
    });

    let (result, diagnostics) = unit.compile(&verified());
    let module = result.unwrap();
    assert!(!diagnostics.has_errors());

    let function = module.function(f).unwrap();
    assert_eq!(calls_to(function, &unit.symbols, "NOTE"), 2);
    assert_eq!(
        count_instructions(function, |kind| matches!(kind, InstructionKind::Throw { is_rethrow: true, .. })),
        1
    );
    assert_eq!(
        count_instructions(function, |kind| matches!(kind, InstructionKind::LoadException { .. })),
        1
    );
    assert!(function.cfg.blocks.iter().any(|block| block.is_exception_target));
}

#[test]
fn falling_off_a_function_is_reported() {
    let mut unit = Unit::new();
    let f = unit
        .symbols
        .register_function("f", P, &[], VariableType::Integer, SymbolFlags::empty());
    unit.define(f, |_| Ok(()));

    let (result, diagnostics) = unit.compile(&verified());

    assert!(result.is_ok());
    assert_eq!(diagnostics.errors().collect::<Vec<_>>(), vec![ErrorCode::FunctionMustReturnValue]);
}
