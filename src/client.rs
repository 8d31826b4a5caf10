//! Session state and the top-level call surface.
//!
//! A client owns the per-session pieces the interpreter consults between
//! instructions: the output stream, the query deadline, debug bits and
//! the error status. Exceptions that reach the session boundary are
//! written to the output stream, one `!`-prefixed line per cascaded
//! layer, and flip the session into the aborted state until `rollback`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::block::MalBlock;
use crate::config::DebugFlags;
use crate::exception::{ExceptionKind, MalException, MalResult};
use crate::interpreter;
use crate::runtime::MalRuntime;
use crate::stack::StackFrame;
use crate::value::Value;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Message every call short-circuits with while the session is aborted.
pub const ABORTED_MESSAGE: &str = "COMMIT: transaction is aborted, will ROLLBACK instead";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Running,
    /// Cooperative cancel: the loop breaks at the next boundary.
    Finishing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Ok,
    /// An exception reached the session boundary; calls short-circuit
    /// until rollback.
    Error,
}

/// One client session of the abstract machine.
pub struct Client {
    pub id: u64,
    pub runtime: Arc<MalRuntime>,
    pub mode: ClientMode,
    pub status: SessionStatus,
    pub debug: DebugFlags,
    /// Deadline armed at the start of each top-level call.
    pub deadline: Option<Instant>,
    /// Resident-set estimate supplied by the host for the fairness layer;
    /// zero disables it.
    pub resident_hint: u64,
    /// Reusable global frame for session-scoped variables.
    pub global: Option<StackFrame>,
    output: Vec<u8>,
}

impl Client {
    pub fn new(runtime: Arc<MalRuntime>) -> Self {
        let debug = runtime.config.debug;
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst),
            runtime,
            mode: ClientMode::Running,
            status: SessionStatus::Ok,
            debug,
            deadline: None,
            resident_hint: 0,
            global: None,
            output: Vec::new(),
        }
    }

    /// Arms the query deadline from the configured timeout.
    fn arm_deadline(&mut self) {
        self.deadline = self
            .runtime
            .config
            .query_timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
    }

    pub fn deadline_exceeded(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() > d)
    }

    /// Requests cooperative cancellation of the running call.
    pub fn cancel(&mut self) {
        self.mode = ClientMode::Finishing;
    }

    pub fn is_aborted(&self) -> bool {
        self.status == SessionStatus::Error
    }

    /// Ends the aborted state; the next call runs normally again.
    pub fn rollback(&mut self) {
        self.status = SessionStatus::Ok;
    }

    fn aborted_exception(&self) -> MalException {
        MalException::new(ExceptionKind::Sql, "session.run", ABORTED_MESSAGE)
    }

    /// Runs a block as a top-level call. An exception becomes the call's
    /// result: it is dumped to the session output and flips the session
    /// status to error, invalidating any savepoint the call opened.
    pub fn run(&mut self, block: &Arc<MalBlock>) -> MalResult<()> {
        if self.is_aborted() {
            return Err(self.aborted_exception());
        }
        self.arm_deadline();
        self.mode = ClientMode::Running;
        let result = interpreter::run_mal(self, block, None);
        self.finish(result)
    }

    /// Runs a block against the session's reusable global frame, so
    /// session variables survive across calls.
    pub fn run_global(&mut self, block: &Arc<MalBlock>) -> MalResult<()> {
        if self.is_aborted() {
            return Err(self.aborted_exception());
        }
        self.arm_deadline();
        self.mode = ClientMode::Running;
        let mut frame = match self.global.take() {
            Some(f) => f,
            None => {
                let mut f = StackFrame::prepare(block, block.vtop());
                f.keep_alive = true;
                f
            }
        };
        let result = interpreter::run_mal(self, block, Some(&mut frame));
        self.global = Some(frame);
        self.finish(result)
    }

    /// Direct procedural call with argument values; returns the block's
    /// return values.
    pub fn call(&mut self, block: &Arc<MalBlock>, args: &[Value]) -> MalResult<Vec<Value>> {
        if self.is_aborted() {
            return Err(self.aborted_exception());
        }
        self.arm_deadline();
        self.mode = ClientMode::Running;
        let result = interpreter::call_mal(self, block, args);
        self.finish(result)
    }

    fn finish<T>(&mut self, result: MalResult<T>) -> MalResult<T> {
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                let _ = e.dump_to(&mut self.output);
                self.status = SessionStatus::Error;
                Err(e)
            }
        }
    }

    /// Drains everything written to the session output stream.
    pub fn take_output(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.output)).into_owned()
    }

    /// Tears the session down, releasing whatever the global frame owns.
    pub fn shutdown(&mut self) {
        if let Some(mut frame) = self.global.take() {
            frame.clear(&self.runtime.buffers, &self.runtime.atoms);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockBuilder;
    use crate::instruction::Instruction;

    fn empty_block(rt: &MalRuntime) -> Arc<MalBlock> {
        let b = BlockBuilder::new(rt.name("user"), rt.name("main"));
        b.freeze(None).unwrap()
    }

    #[test]
    fn test_run_empty_block() {
        let rt = MalRuntime::with_defaults();
        let mut client = Client::new(Arc::clone(&rt));
        let blk = empty_block(&rt);
        assert!(client.run(&blk).is_ok());
        assert_eq!(client.status, SessionStatus::Ok);
    }

    #[test]
    fn test_aborted_session_short_circuits() {
        let rt = MalRuntime::with_defaults();
        let mut client = Client::new(Arc::clone(&rt));
        client.status = SessionStatus::Error;
        let blk = empty_block(&rt);
        let err = client.run(&blk).unwrap_err();
        assert!(err.text().contains(ABORTED_MESSAGE));

        client.rollback();
        assert!(client.run(&blk).is_ok());
    }

    #[test]
    fn test_failed_call_writes_bang_lines() {
        let rt = MalRuntime::with_defaults();
        let mut client = Client::new(Arc::clone(&rt));

        let mut b = BlockBuilder::new(rt.name("user"), rt.name("boom"));
        let s = b.constant(crate::value::Value::Str("IO:io.read[1]:nope".into()));
        b.push(Instruction::control(crate::instruction::Token::Raise, s));
        let blk = b.freeze(None).unwrap();

        assert!(client.run(&blk).is_err());
        let out = client.take_output();
        assert!(out.starts_with('!'));
        assert!(out.contains("nope"));
        assert_eq!(client.status, SessionStatus::Error);
    }
}
