//! The MAL interpreter loop.
//!
//! Executes a contiguous range of a block against a stack frame until the
//! range is exited or an exception escapes. Dispatch covers assignments,
//! native command and pattern calls, recursive function calls, factory
//! dispatch and the structured control-flow tokens. Between instructions
//! the loop honours the cooperative pause/cancel bytes and the session's
//! query timeout; before expensive instructions it consults the admission
//! controller.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::atom::AtomRegistry;
use crate::bat::BufferPool;
use crate::block::{MalBlock, VarFlags};
use crate::client::{Client, ClientMode};
use crate::exception::{ExceptionKind, MalException, MalResult, ANY_EXCEPTION};
use crate::instruction::{Instruction, Token};
use crate::module::{Implementation, MAX_COMMAND_ARGS};
use crate::stack::{StackFrame, CMD_EXIT, STATUS_PAUSED, STATUS_QUIT};
use crate::value::Value;

/// Sentinel message that ends a block successfully from a callback.
pub const SKIP_TO_END: &str = "!skip-to-end";

/// How a sequence run left the block.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    /// The range terminated normally.
    Done,
    /// A factory paused at the yield instruction with this pc.
    Yielded(usize),
}

/// The caller's side of a nested call, used to deliver return values.
pub struct Caller<'a> {
    pub frame: &'a mut StackFrame,
    pub pci: &'a Instruction,
}

thread_local! {
    // Kernel primitives report errors through a side channel rather than
    // their return value; the loop drains it after every callback.
    static KERNEL_ERRBUF: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Records a kernel-level error for the current thread. The interpreter
/// captures it after the running callback returns and wraps it with the
/// `GDKerror` prefix.
pub fn report_kernel_error(message: &str) {
    KERNEL_ERRBUF.with(|buf| {
        let mut buf = buf.borrow_mut();
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(message);
    });
}

/// Drains the thread's kernel error buffer.
pub fn take_kernel_error() -> Option<String> {
    KERNEL_ERRBUF.with(|buf| {
        let mut buf = buf.borrow_mut();
        if buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *buf))
        }
    })
}

fn timeout_exception(block: &MalBlock, pc: usize) -> MalException {
    MalException::located(
        ExceptionKind::Mal,
        block.function.as_str(),
        pc,
        "query aborted due to timeout",
    )
}

/// Runs a block against a fresh or reused frame. The standard entry for
/// one interpreter call.
pub fn run_mal(
    client: &mut Client,
    block: &Arc<MalBlock>,
    env: Option<&mut StackFrame>,
) -> MalResult<()> {
    if block.errors {
        return Err(MalException::new(
            ExceptionKind::Mal,
            "mal.interpreter",
            "Syntax error in script",
        ));
    }
    let rt = Arc::clone(&client.runtime);
    match env {
        Some(frame) => {
            frame.ensure(block.vtop());
            run_sequence(client, block, 1, usize::MAX, frame, None)?;
            if !frame.keep_alive && block.gc {
                frame.garbage_collect(block, &rt.buffers, &rt.atoms, true);
            }
        }
        None => {
            let mut frame = StackFrame::prepare(block, block.vtop());
            run_sequence(client, block, 1, usize::MAX, &mut frame, None)?;
            if !frame.keep_alive && block.gc {
                frame.garbage_collect(block, &rt.buffers, &rt.atoms, true);
            }
        }
    }
    if client.deadline_exceeded() {
        return Err(timeout_exception(block, block.stop));
    }
    Ok(())
}

/// Re-enters the interpreter at a specific place against an existing
/// frame. Used by co-routines and by schedulers that execute a block one
/// slice at a time.
pub fn reenter_mal(
    client: &mut Client,
    block: &Arc<MalBlock>,
    startpc: usize,
    stoppc: usize,
    frame: &mut StackFrame,
) -> MalResult<Flow> {
    let rt = Arc::clone(&client.runtime);
    let keep_alive = frame.keep_alive;
    let flow = run_sequence(client, block, startpc, stoppc, frame, None)?;
    if !keep_alive && block.gc {
        frame.garbage_collect(block, &rt.buffers, &rt.atoms, true);
    }
    Ok(flow)
}

/// Direct procedural call: copies the supplied arguments into a frame,
/// runs the block, and hands back its return values. Gated by the
/// process-wide parallelism bound.
pub fn call_mal(client: &mut Client, block: &Arc<MalBlock>, args: &[Value]) -> MalResult<Vec<Value>> {
    let rt = Arc::clone(&client.runtime);
    rt.parallelism.acquire();
    let result = call_mal_inner(client, block, args);
    rt.parallelism.release();
    if client.deadline_exceeded() {
        return Err(timeout_exception(block, block.stop));
    }
    result
}

fn call_mal_inner(
    client: &mut Client,
    block: &Arc<MalBlock>,
    args: &[Value],
) -> MalResult<Vec<Value>> {
    let rt = Arc::clone(&client.runtime);
    let sig = block.signature();
    match sig.token {
        Token::Function => {
            let mut frame = StackFrame::prepare(block, block.vtop());
            copy_actuals_into(&rt.buffers, &mut frame, block, args);
            run_sequence(client, block, 1, usize::MAX, &mut frame, None)?;
            let sig = block.signature();
            let rets: Vec<Value> = sig.args[..sig.retc]
                .iter()
                .map(|&a| frame.get(a).clone())
                .collect();
            for v in &rets {
                if let Some(id) = v.as_bat() {
                    rt.buffers.incref(id);
                }
            }
            if block.gc {
                frame.garbage_collect(block, &rt.buffers, &rt.atoms, true);
            }
            Ok(rets)
        }
        Token::Factory => call_factory_direct(client, block, args),
        _ => Err(MalException::new(
            ExceptionKind::Mal,
            "mal.interpreter",
            "unknown instruction type for direct call",
        )),
    }
}

fn copy_actuals_into(pool: &BufferPool, frame: &mut StackFrame, block: &MalBlock, args: &[Value]) {
    let sig = block.signature();
    let formals = &sig.args[sig.retc..];
    if formals.is_empty() {
        return;
    }
    for (i, arg) in args.iter().enumerate() {
        // The last formal absorbs trailing actuals when variadic.
        let slot = formals[i.min(formals.len() - 1)];
        if let Some(id) = arg.as_bat() {
            pool.incref(id);
        }
        frame.set(slot, arg.clone());
    }
}

/// The short-cut factory call without a caller frame: yielded values are
/// delivered to the caller directly; a factory return tears the plant
/// down and produces no values.
fn call_factory_direct(
    client: &mut Client,
    block: &Arc<MalBlock>,
    args: &[Value],
) -> MalResult<Vec<Value>> {
    let rt = Arc::clone(&client.runtime);
    let lease = rt.plants.checkout(block, client.id)?;
    let mut frame = lease.frame;
    let resume = lease.resume_pc;

    // Old arguments are released before the new ones land.
    let sig = block.signature();
    let formals: Vec<usize> = sig.args[sig.retc..].to_vec();
    if !formals.is_empty() {
        for (i, arg) in args.iter().enumerate() {
            let slot = formals[i.min(formals.len() - 1)];
            frame.release_slot(slot, &rt.buffers, &rt.atoms);
            if let Some(id) = arg.as_bat() {
                rt.buffers.incref(id);
            }
            frame.set(slot, arg.clone());
        }
    }

    match run_sequence(client, block, resume, usize::MAX, &mut frame, None) {
        Ok(Flow::Yielded(ypc)) => {
            let ypci = block.instr(ypc);
            let mut rets = Vec::with_capacity(ypci.retc);
            for i in 0..ypci.retc {
                let v = frame.get(ypci.arg(i)).clone();
                if let Some(id) = v.as_bat() {
                    rt.buffers.incref(id);
                }
                rets.push(v);
            }
            rt.plants.checkin(lease.id, frame, ypc + 1);
            Ok(rets)
        }
        Ok(Flow::Done) => {
            rt.plants.remove(lease.id, frame, block, &rt.buffers, &rt.atoms);
            Ok(Vec::new())
        }
        Err(e) => {
            rt.plants.checkin(lease.id, frame, resume);
            Err(e)
        }
    }
}

/// Factory dispatch from a call site: routes the call to the block's
/// plant, resuming after the last yield.
fn run_factory(
    client: &mut Client,
    block: &Arc<MalBlock>,
    caller_frame: &mut StackFrame,
    pci: &Instruction,
) -> MalResult<()> {
    let rt = Arc::clone(&client.runtime);
    if block.errors {
        return Err(MalException::new(
            ExceptionKind::Mal,
            "factory.call",
            "Syntax error in script",
        ));
    }
    let lease = rt.plants.checkout(block, client.id)?;
    let mut frame = lease.frame;
    frame.cmd = caller_frame.cmd;
    let resume = lease.resume_pc;

    let sig = block.signature();
    let formals: Vec<usize> = sig.args[sig.retc..].to_vec();
    let mut a = 0usize;
    for i in pci.retc..pci.argc() {
        if formals.is_empty() {
            break;
        }
        let slot = formals[a.min(formals.len() - 1)];
        frame.release_slot(slot, &rt.buffers, &rt.atoms);
        let v = caller_frame.get(pci.arg(i)).clone();
        if let Some(id) = v.as_bat() {
            rt.buffers.incref(id);
        }
        frame.set(slot, v);
        a += 1;
    }

    let flow = run_sequence(
        client,
        block,
        resume,
        usize::MAX,
        &mut frame,
        Some(Caller {
            frame: caller_frame,
            pci,
        }),
    );
    match flow {
        Ok(Flow::Yielded(ypc)) => {
            let ypci = block.instr(ypc);
            for i in 0..ypci.retc.min(pci.retc) {
                let v = frame.get(ypci.arg(i)).clone();
                if let Some(id) = v.as_bat() {
                    rt.buffers.incref(id);
                }
                caller_frame.set(pci.arg(i), v);
            }
            rt.plants.checkin(lease.id, frame, ypc + 1);
            Ok(())
        }
        Ok(Flow::Done) => {
            rt.plants.remove(lease.id, frame, block, &rt.buffers, &rt.atoms);
            Ok(())
        }
        Err(e) => {
            rt.plants.checkin(lease.id, frame, resume);
            Err(e)
        }
    }
}

/// A recursive MAL function call: assembles the callee frame, copies the
/// actuals, and re-enters the interpreter at pc 1.
fn call_function(
    client: &mut Client,
    callee: &Arc<MalBlock>,
    frame: &mut StackFrame,
    pci: &Instruction,
) -> MalResult<()> {
    let rt = Arc::clone(&client.runtime);
    if callee.errors {
        return Err(MalException::new(
            ExceptionKind::Mal,
            "mal.interpreter",
            "Syntax error in script",
        ));
    }
    let mut nstk = StackFrame::prepare(callee, callee.vtop());
    nstk.call_depth = frame.call_depth + 1;
    nstk.stk_depth = frame.stk_depth + nstk.len();
    nstk.cmd = frame.cmd;
    if nstk.call_depth > rt.config.max_call_depth {
        return Err(MalException::new(
            ExceptionKind::StackOverflow,
            "mal.interpreter",
            "maximum call depth reached",
        ));
    }
    if nstk.stk_depth > rt.config.max_stack_slots {
        return Err(MalException::new(
            ExceptionKind::StackOverflow,
            "mal.interpreter",
            "running low on stack space",
        ));
    }

    let sig = callee.signature();
    let formals: Vec<usize> = sig.args[sig.retc..].to_vec();
    let mut a = 0usize;
    for i in pci.retc..pci.argc() {
        if formals.is_empty() {
            break;
        }
        let slot = formals[a.min(formals.len() - 1)];
        let v = frame.get(pci.arg(i)).clone();
        if let Some(id) = v.as_bat() {
            rt.buffers.incref(id);
        }
        nstk.set(slot, v);
        a += 1;
    }

    run_sequence(client, callee, 1, usize::MAX, &mut nstk, Some(Caller { frame, pci }))?;
    Ok(())
}

/// The core loop: executes `[startpc, stop)` of `block` against `frame`,
/// stopping early at `stoppc` when one is given.
pub fn run_sequence(
    client: &mut Client,
    block: &Arc<MalBlock>,
    startpc: usize,
    stoppc: usize,
    frame: &mut StackFrame,
    mut caller: Option<Caller<'_>>,
) -> MalResult<Flow> {
    let rt = Arc::clone(&client.runtime);
    let pool: &BufferPool = &rt.buffers;
    let registry: &AtomRegistry = &rt.atoms;

    let mut pc = startpc;
    // The variable that absorbed the pending exception, consumed when its
    // catch is entered.
    let mut pending: Option<usize> = None;
    // The catch variable of the region currently being handled, cleared at
    // the matching exit. A raise inside such a region chains the trail.
    let mut caught_var: Option<usize> = None;

    while pc < block.stop && pc != stoppc {
        if frame.status == STATUS_PAUSED {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        if frame.status == STATUS_QUIT {
            frame.cmd = CMD_EXIT;
        }
        if frame.cmd == CMD_EXIT || client.mode == ClientMode::Finishing {
            frame.cmd = 0;
            break;
        }

        let pci = block.instr(pc);
        if client.debug.contains(crate::config::DebugFlags::TRACE) {
            log::trace!("{}[{}] {:?}", block.function, pc, pci);
        }

        let mut result: MalResult<()> = if client.deadline_exceeded() {
            Err(timeout_exception(block, pc))
        } else {
            Ok(())
        };

        // Identify last uses and shield the return slots before the call.
        let mut backups: Vec<(usize, u64)> = Vec::new();
        let mut garbage: Vec<usize> = Vec::new();
        if result.is_ok() && pci.gc {
            for i in 0..pci.argc() {
                let a = pci.arg(i);
                if frame.get(a).as_bat().is_some()
                    && block.var(a).eol == pc
                    && !block.var(a).flags.contains(VarFlags::FIXED)
                    && !pci.uses_from(i + 1, a)
                {
                    garbage.push(a);
                }
                if i < pci.retc {
                    if let Some(id) = frame.get(a).as_bat() {
                        backups.push((a, id));
                    }
                }
            }
        }

        // Admission: expensive instructions wait for pool capacity.
        let claim = if result.is_ok() && pci.token.is_call() {
            rt.admission.argument_claim(pool, block, frame, pci)
        } else {
            0
        };
        if claim > 0 {
            rt.admission.admit_blocking(claim, 0);
        }
        let started = Instant::now();

        if result.is_ok() {
            result = match pci.token {
                Token::Assign => {
                    for k in 0..pci.retc {
                        let i = pci.retc + k;
                        if i >= pci.argc() {
                            break;
                        }
                        let v = frame.get(pci.arg(i)).clone();
                        if let Some(id) = v.as_bat() {
                            pool.incref(id);
                        }
                        frame.set(pci.arg(k), v);
                    }
                    Ok(())
                }
                Token::CmdCall => match &pci.implementation {
                    Some(Implementation::Command(f)) => {
                        if pci.argc() > MAX_COMMAND_ARGS {
                            Err(MalException::located(
                                ExceptionKind::Type,
                                block.function.as_str(),
                                pc,
                                "too many arguments for command call",
                            ))
                        } else {
                            f(frame, pci)
                        }
                    }
                    _ => Err(missing_address(block, pc, pci)),
                },
                Token::PatCall => match &pci.implementation {
                    Some(Implementation::Pattern(f)) => f(client, block, frame, pci),
                    _ => Err(missing_address(block, pc, pci)),
                },
                Token::FcnCall => match nested_block(pci) {
                    Some(callee) => {
                        frame.pcup = pc;
                        call_function(client, &callee, frame, pci)
                    }
                    None => Err(MalException::located(
                        ExceptionKind::Mal,
                        block.function.as_str(),
                        pc,
                        "reference to MAL function missing",
                    )),
                },
                Token::FacCall => match nested_block(pci) {
                    Some(callee) => {
                        frame.pcup = pc;
                        run_factory(client, &callee, frame, pci)
                    }
                    None => Err(MalException::located(
                        ExceptionKind::Mal,
                        block.function.as_str(),
                        pc,
                        "reference to MAL factory missing",
                    )),
                },
                // Control tokens are handled after the expression phase.
                _ => Ok(()),
            };
        }

        if claim > 0 {
            rt.admission.release(claim, 0);
            rt.admission.fairness(
                started.elapsed(),
                client.resident_hint,
                rt.config.max_parallel_plans,
            );
        }

        // Post-call garbage collection: drop replaced return handles and
        // inputs at their last use.
        if pci.gc {
            if result.is_ok() {
                for &(a, old_id) in &backups {
                    if frame.get(a).as_bat() != Some(old_id) {
                        pool.decref(old_id);
                    }
                }
                for &a in &garbage {
                    log::trace!("gc: pc={pc} releasing {}", block.var(a).name);
                    frame.release_slot(a, pool, registry);
                }
            }
        }

        // Kernel errors arrive through the thread-local buffer.
        if let Some(kernel) = take_kernel_error() {
            result = match result {
                Ok(()) => Err(MalException::from_text(format!(
                    "{}:{}",
                    crate::exception::KERNEL_ERROR_PREFIX,
                    kernel
                ))),
                Err(e) => Err(MalException::from_text(format!("{}\n{}", e.text(), kernel))),
            };
        }

        // A raise copies the operand's string into a fresh exception.
        if result.is_ok() && pci.token == Token::Raise {
            let dest = pci.dest_var();
            result = Err(match frame.get(dest).as_str() {
                Some(text) if ExceptionKind::parse(text.split(':').next().unwrap_or("")).is_some() => {
                    let mut exc = MalException::from_text(text.to_string());
                    // A raise inside a catch region whose variable is still
                    // set chains the previous trail under the new line.
                    if let Some(prev_var) = caught_var {
                        if prev_var != dest {
                            if let Some(prev) = frame.get(prev_var).as_str() {
                                exc = MalException::from_text(format!("{prev}\n{}", exc.text()));
                            }
                        }
                    }
                    exc
                }
                Some(text) => MalException::located(
                    ExceptionKind::Mal,
                    block.function.as_str(),
                    pc,
                    text,
                ),
                None => MalException::located(
                    ExceptionKind::Mal,
                    block.function.as_str(),
                    pc,
                    "exception variable unset",
                ),
            });
        }

        // Exception routing.
        if let Err(exc) = result {
            if exc.text().contains(SKIP_TO_END) {
                break;
            }
            let prefix = exc.prefix().to_string();
            let var = block
                .find_variable(&prefix)
                .or_else(|| block.find_variable(&format!("{prefix}error")))
                .or_else(|| block.find_variable(ANY_EXCEPTION));
            let var = match var {
                Some(v) => v,
                None => {
                    // Uncaught in this frame: collect and pass upward; the
                    // top-level block stamps the trail.
                    if block.gc && !frame.keep_alive {
                        frame.garbage_collect(block, pool, registry, true);
                    }
                    if caller.is_none() {
                        return Err(exc.cascade(
                            ExceptionKind::Mal,
                            block.function.as_str(),
                            pc,
                            "Exception not caught",
                        ));
                    }
                    return Err(exc);
                }
            };
            frame.release_slot(var, pool, registry);
            frame.set(var, Value::Str(exc.into_text()));

            // Position at the catch block for this variable, skipping
            // nested catches that name a different one.
            let mut target = None;
            let mut scan = pc;
            while scan < block.stop {
                let l = block.instr(scan);
                if l.token == Token::Catch {
                    let hit = (0..l.retc).any(|j| {
                        let arg = l.arg(j);
                        arg == var || block.var(arg).name == ANY_EXCEPTION
                    });
                    if hit {
                        target = Some(scan);
                        break;
                    }
                }
                scan += 1;
            }
            match target {
                Some(catch_pc) => {
                    pending = Some(var);
                    caught_var = Some(var);
                    pc = catch_pc;
                    continue;
                }
                None => {
                    let stored = frame.get(var).as_str().unwrap_or_default().to_string();
                    if block.gc && !frame.keep_alive {
                        frame.garbage_collect(block, pool, registry, true);
                    }
                    return Err(MalException::from_text(stored).cascade(
                        ExceptionKind::Mal,
                        block.function.as_str(),
                        block.stop - 1,
                        "Exception not caught",
                    ));
                }
            }
        }

        // Control flow.
        match pci.token {
            Token::Barrier => {
                if frame.get(pci.dest_var()).enters_barrier() {
                    pc += 1;
                } else {
                    pc = pci.jump + 1;
                }
            }
            Token::Leave => {
                if frame.get(pci.dest_var()).takes_jump() {
                    pc = pci.jump;
                } else {
                    pc += 1;
                }
            }
            Token::Redo => {
                if frame.get(pci.dest_var()).takes_jump() {
                    pc = pci.jump;
                } else {
                    pc += 1;
                }
            }
            Token::Catch => {
                if pending.is_none() {
                    pc = pci.jump;
                } else {
                    pending = None;
                    pc += 1;
                }
            }
            Token::Exit => {
                if pending == Some(pci.dest_var()) {
                    pending = None;
                }
                if caught_var == Some(pci.dest_var()) {
                    caught_var = None;
                }
                pc += 1;
            }
            Token::Yield => {
                if !block.is_factory() {
                    return Err(MalException::located(
                        ExceptionKind::Mal,
                        block.function.as_str(),
                        pc,
                        "yield outside factory",
                    ));
                }
                return Ok(Flow::Yielded(pc));
            }
            Token::Return => {
                if let Some(c) = caller.as_mut() {
                    for i in 0..pci.retc.min(c.pci.retc) {
                        let v = frame.get(pci.arg(i)).clone();
                        if let Some(id) = v.as_bat() {
                            pool.incref(id);
                        }
                        c.frame.set(c.pci.arg(i), v);
                    }
                }
                if block.is_factory() {
                    // The plant is torn down by the dispatcher.
                    return Ok(Flow::Done);
                }
                if block.gc && !frame.keep_alive {
                    frame.garbage_collect(block, pool, registry, true);
                }
                break;
            }
            Token::End => {
                if block.is_factory() {
                    return Ok(Flow::Done);
                }
                if caller.is_some() && block.gc && !frame.keep_alive {
                    frame.garbage_collect(block, pool, registry, true);
                }
                break;
            }
            _ => pc += 1,
        }
    }

    Ok(Flow::Done)
}

fn nested_block(pci: &Instruction) -> Option<Arc<MalBlock>> {
    if let Some(b) = &pci.block {
        return Some(Arc::clone(b));
    }
    match &pci.implementation {
        Some(Implementation::Function(b)) | Some(Implementation::Factory(b)) => {
            Some(Arc::clone(b))
        }
        _ => None,
    }
}

fn missing_address(block: &MalBlock, pc: usize, pci: &Instruction) -> MalException {
    let module = pci.module.as_ref().map(|n| n.as_str()).unwrap_or("?");
    let fcn = pci.function.as_ref().map(|n| n.as_str()).unwrap_or("?");
    MalException::located(
        ExceptionKind::Mal,
        block.function.as_str(),
        pc,
        format!("address of {module}.{fcn} missing"),
    )
}
