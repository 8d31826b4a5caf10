//! End-to-end control flow scenarios: assignments and barrier regions.

use std::sync::Arc;

use mal_vm::atom::{TYPE_BIT, TYPE_STR};
use mal_vm::{BlockBuilder, Client, Instruction, MalRuntime, MalType, Token, Value};

fn client() -> (Arc<MalRuntime>, Client) {
    let rt = MalRuntime::with_defaults();
    let c = Client::new(Arc::clone(&rt));
    (rt, c)
}

#[test]
fn test_multi_assign_copies_and_retains_inputs() {
    let (rt, mut client) = client();

    // r1,r2 := (x,y); end;
    let mut b = BlockBuilder::new(rt.name("user"), rt.name("main"));
    let r1 = b.variable("r1", MalType::atom(TYPE_STR));
    let r2 = b.variable("r2", MalType::atom(TYPE_STR));
    let x = b.constant(Value::Str("a".into()));
    let y = b.constant(Value::Str("b".into()));
    b.push(Instruction::assign(vec![r1, r2], vec![x, y]));
    let blk = b.freeze(None).unwrap();

    client.run_global(&blk).unwrap();
    let frame = client.global.as_ref().unwrap();
    assert_eq!(frame.get(r1).as_str(), Some("a"));
    assert_eq!(frame.get(r2).as_str(), Some("b"));
    // The input slots retain their values.
    assert_eq!(frame.get(x).as_str(), Some("a"));
    assert_eq!(frame.get(y).as_str(), Some("b"));
}

fn barrier_block(rt: &MalRuntime, control: bool) -> (Arc<mal_vm::MalBlock>, usize) {
    // barrier c; r := "ok"; exit c; end;
    let mut b = BlockBuilder::new(rt.name("user"), rt.name("main"));
    let c = b.constant(Value::Bit(control));
    let r = b.variable("r", MalType::atom(TYPE_STR));
    let ok = b.constant(Value::Str("ok".into()));
    b.push(Instruction::control(Token::Barrier, c));
    b.push(Instruction::assign(vec![r], vec![ok]));
    b.push(Instruction::control(Token::Exit, c));
    (b.freeze(None).unwrap(), r)
}

#[test]
fn test_barrier_false_skips_region() {
    let (rt, mut client) = client();
    let (blk, r) = barrier_block(&rt, false);
    client.run_global(&blk).unwrap();
    let frame = client.global.as_ref().unwrap();
    assert!(frame.get(r).is_nil());
}

#[test]
fn test_barrier_true_enters_region() {
    let (rt, mut client) = client();
    let (blk, r) = barrier_block(&rt, true);
    client.run_global(&blk).unwrap();
    let frame = client.global.as_ref().unwrap();
    assert_eq!(frame.get(r).as_str(), Some("ok"));
}

#[test]
fn test_nil_control_variable_skips_region() {
    let (rt, mut client) = client();
    let mut b = BlockBuilder::new(rt.name("user"), rt.name("main"));
    let c = b.variable("c", MalType::atom(TYPE_BIT));
    let r = b.variable("r", MalType::atom(TYPE_STR));
    let ok = b.constant(Value::Str("ok".into()));
    b.push(Instruction::control(Token::Barrier, c));
    b.push(Instruction::assign(vec![r], vec![ok]));
    b.push(Instruction::control(Token::Exit, c));
    let blk = b.freeze(None).unwrap();

    client.run_global(&blk).unwrap();
    let frame = client.global.as_ref().unwrap();
    assert!(frame.get(r).is_nil());
}

#[test]
fn test_leave_jumps_to_exit() {
    let (rt, mut client) = client();

    // barrier go; leave go; r := "unreached"; exit go; end;
    let mut b = BlockBuilder::new(rt.name("user"), rt.name("main"));
    let go = b.constant(Value::Bit(true));
    let r = b.variable("r", MalType::atom(TYPE_STR));
    let v = b.constant(Value::Str("unreached".into()));
    b.push(Instruction::control(Token::Barrier, go));
    b.push(Instruction::control(Token::Leave, go));
    b.push(Instruction::assign(vec![r], vec![v]));
    b.push(Instruction::control(Token::Exit, go));
    let blk = b.freeze(None).unwrap();

    client.run_global(&blk).unwrap();
    let frame = client.global.as_ref().unwrap();
    assert!(frame.get(r).is_nil());
}

#[test]
fn test_redo_loops_until_control_drops() {
    let (rt, mut client) = client();
    rt.register_command(
        "calc",
        "countdown",
        vec![MalType::atom(TYPE_BIT)],
        vec![MalType::atom(mal_vm::atom::TYPE_INT)],
        |frame, pci| {
            // rets: [again], args: [n]; decrements n in place.
            let n = frame.get(pci.arg(1)).as_int().unwrap_or(0) - 1;
            frame.set(pci.arg(1), Value::Int(n));
            frame.set(pci.arg(0), Value::Bit(n > 0));
            Ok(())
        },
    );

    // n := 3; barrier go(true); again := calc.countdown(n); redo again; exit go
    let mut b = BlockBuilder::new(rt.name("user"), rt.name("main"));
    let n = b.variable("n", MalType::atom(mal_vm::atom::TYPE_INT));
    let three = b.constant(Value::Int(3));
    let go = b.constant(Value::Bit(true));
    let again = b.variable("again", MalType::atom(TYPE_BIT));
    b.push(Instruction::assign(vec![n], vec![three]));
    b.push(Instruction::control(Token::Barrier, go));
    b.push(Instruction::call(
        Token::CmdCall,
        rt.name("calc"),
        rt.name("countdown"),
        vec![again],
        vec![n],
    ));
    b.push(Instruction::control(Token::Redo, again));
    b.push(Instruction::control(Token::Exit, go));
    let blk = b.freeze(Some(&rt.scope)).unwrap();

    client.run_global(&blk).unwrap();
    let frame = client.global.as_ref().unwrap();
    assert_eq!(frame.get(n).as_int(), Some(0));
    assert_eq!(frame.get(again).as_bit(), Some(false));
}

#[test]
fn test_function_call_returns_values() {
    let (rt, mut client) = client();

    // Callee: function user.twice(v:int):int  --  r := v; r2 := v; return r.
    let mut cb = BlockBuilder::new(rt.name("user"), rt.name("twice"));
    let r = cb.variable("r", MalType::atom(mal_vm::atom::TYPE_INT));
    let v = cb.variable("v", MalType::atom(mal_vm::atom::TYPE_INT));
    cb.signature(vec![r], vec![v]);
    cb.push(Instruction::assign(vec![r], vec![v]));
    let mut ret = Instruction::new(Token::Return);
    ret.retc = 1;
    ret.args = vec![r];
    cb.push(ret);
    let callee = cb.freeze(None).unwrap();

    let rets = client.call(&callee, &[Value::Int(21)]).unwrap();
    assert_eq!(rets, vec![Value::Int(21)]);
}
