//! Factory plants: persistent frames, yield/resume, shutdown.

use std::sync::Arc;

use mal_vm::atom::{TYPE_BIT, TYPE_INT};
use mal_vm::{BlockBuilder, Client, Instruction, MalBlock, MalRuntime, MalType, Token, Value};

fn client() -> (Arc<MalRuntime>, Client) {
    let rt = MalRuntime::with_defaults();
    let c = Client::new(Arc::clone(&rt));
    (rt, c)
}

fn register_incr(rt: &MalRuntime) {
    rt.register_command(
        "calc",
        "incr",
        vec![MalType::atom(TYPE_INT)],
        vec![MalType::atom(TYPE_INT)],
        |frame, pci| {
            let v = frame.get(pci.arg(1)).as_int().unwrap_or(0);
            frame.set(pci.arg(0), Value::Int(v + 1));
            Ok(())
        },
    );
}

/// factory counter(seed:int):int
///   s := seed;
///   barrier always := true;
///     yield s;
///     s := calc.incr(s);
///   redo always;
///   exit always;
/// end
fn counter_factory(rt: &MalRuntime) -> Arc<MalBlock> {
    let mut b = BlockBuilder::new_factory(rt.name("user"), rt.name("counter"));
    let r = b.variable("r", MalType::atom(TYPE_INT));
    let seed = b.variable("seed", MalType::atom(TYPE_INT));
    b.signature(vec![r], vec![seed]);

    let s = b.variable("s", MalType::atom(TYPE_INT));
    let always = b.variable("always", MalType::atom(TYPE_BIT));
    let ctrue = b.constant(Value::Bit(true));

    b.push(Instruction::assign(vec![s], vec![seed]));
    b.push(Instruction::assign(vec![always], vec![ctrue]));
    b.push(Instruction::control(Token::Barrier, always));
    let mut y = Instruction::new(Token::Yield);
    y.retc = 1;
    y.args = vec![s];
    b.push(y);
    b.push(Instruction::call(
        Token::CmdCall,
        rt.name("calc"),
        rt.name("incr"),
        vec![s],
        vec![s],
    ));
    b.push(Instruction::control(Token::Redo, always));
    b.push(Instruction::control(Token::Exit, always));
    b.freeze(Some(&rt.scope)).unwrap()
}

#[test]
fn test_factory_counter_yields_a_sequence() {
    let (rt, mut client) = client();
    register_incr(&rt);
    let factory = counter_factory(&rt);

    let mut seen = Vec::new();
    for _ in 0..4 {
        let rets = client.call(&factory, &[Value::Int(10)]).unwrap();
        seen.push(rets[0].as_int().unwrap());
    }
    assert_eq!(seen, vec![10, 11, 12, 13]);
}

#[test]
fn test_plant_survives_between_calls() {
    let (rt, mut client) = client();
    register_incr(&rt);
    let factory = counter_factory(&rt);

    client.call(&factory, &[Value::Int(0)]).unwrap();
    assert_eq!(rt.plants.plant_count(), 1);
    client.call(&factory, &[Value::Int(0)]).unwrap();
    assert_eq!(rt.plants.plant_count(), 1);
}

/// factory once():int  --  yield 5; return 5; end
fn once_factory(rt: &MalRuntime) -> Arc<MalBlock> {
    let mut b = BlockBuilder::new_factory(rt.name("user"), rt.name("once"));
    let r = b.variable("r", MalType::atom(TYPE_INT));
    b.signature(vec![r], vec![]);
    let five = b.constant(Value::Int(5));
    b.push(Instruction::assign(vec![r], vec![five]));
    let mut y = Instruction::new(Token::Yield);
    y.retc = 1;
    y.args = vec![r];
    b.push(y);
    let mut ret = Instruction::new(Token::Return);
    ret.retc = 1;
    ret.args = vec![r];
    b.push(ret);
    b.freeze(None).unwrap()
}

#[test]
fn test_return_tears_the_plant_down_and_recreates() {
    let (rt, mut client) = client();
    let factory = once_factory(&rt);

    // First call yields.
    let rets = client.call(&factory, &[]).unwrap();
    assert_eq!(rets, vec![Value::Int(5)]);
    assert_eq!(rt.plants.plant_count(), 1);

    // Second call resumes after the yield, hits return: plant removed.
    client.call(&factory, &[]).unwrap();
    assert_eq!(rt.plants.plant_count(), 0);

    // Third call starts fresh from pc 1 and yields again.
    let rets = client.call(&factory, &[]).unwrap();
    assert_eq!(rets, vec![Value::Int(5)]);
    assert_eq!(rt.plants.plant_count(), 1);
}

#[test]
fn test_resume_preserves_non_parameter_slots() {
    let (rt, mut client) = client();
    register_incr(&rt);

    // factory keeper():int -- s := 41; yield s; s := calc.incr(s); yield s; end
    let mut b = BlockBuilder::new_factory(rt.name("user"), rt.name("keeper"));
    let r = b.variable("r", MalType::atom(TYPE_INT));
    b.signature(vec![r], vec![]);
    let s = b.variable("s", MalType::atom(TYPE_INT));
    let start = b.constant(Value::Int(41));
    b.push(Instruction::assign(vec![s], vec![start]));
    let mut y1 = Instruction::new(Token::Yield);
    y1.retc = 1;
    y1.args = vec![s];
    b.push(y1);
    b.push(Instruction::call(
        Token::CmdCall,
        rt.name("calc"),
        rt.name("incr"),
        vec![s],
        vec![s],
    ));
    let mut y2 = Instruction::new(Token::Yield);
    y2.retc = 1;
    y2.args = vec![s];
    b.push(y2);
    let factory = b.freeze(Some(&rt.scope)).unwrap();

    // The second call observes the post-yield state of s.
    assert_eq!(client.call(&factory, &[]).unwrap(), vec![Value::Int(41)]);
    assert_eq!(client.call(&factory, &[]).unwrap(), vec![Value::Int(42)]);
}

#[test]
fn test_factory_dispatch_from_a_calling_block() {
    let (rt, mut client) = client();
    register_incr(&rt);
    let factory = counter_factory(&rt);
    rt.register_block(Arc::clone(&factory));

    // Caller block: out := user.counter(100); end
    let mut b = BlockBuilder::new(rt.name("user"), rt.name("main"));
    let out = b.variable("out", MalType::atom(TYPE_INT));
    let seed = b.constant(Value::Int(100));
    b.push(Instruction::call(
        Token::FacCall,
        rt.name("user"),
        rt.name("counter"),
        vec![out],
        vec![seed],
    ));
    let caller = b.freeze(Some(&rt.scope)).unwrap();

    client.run_global(&caller).unwrap();
    let frame = client.global.as_ref().unwrap();
    assert_eq!(frame.get(out).as_int(), Some(100));

    // A second run of the caller resumes the same plant.
    let mut client2 = Client::new(Arc::clone(&rt));
    client2.run_global(&caller).unwrap();
    let frame = client2.global.as_ref().unwrap();
    assert_eq!(frame.get(out).as_int(), Some(101));
}

#[test]
fn test_shutdown_by_name_resets_the_sequence() {
    let (rt, mut client) = client();
    register_incr(&rt);
    let factory = counter_factory(&rt);

    assert_eq!(
        client.call(&factory, &[Value::Int(7)]).unwrap(),
        vec![Value::Int(7)]
    );
    assert_eq!(
        client.call(&factory, &[Value::Int(7)]).unwrap(),
        vec![Value::Int(8)]
    );

    rt.plants.shutdown_by_name("counter", &rt.buffers, &rt.atoms);

    // The plant was removed, so the sequence restarts at the seed.
    assert_eq!(
        client.call(&factory, &[Value::Int(7)]).unwrap(),
        vec![Value::Int(7)]
    );
}
