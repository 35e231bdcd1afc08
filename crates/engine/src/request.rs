//! Requests and the transaction registry
//!
//! A [`Request`] names a registered transaction body by code and carries its
//! typed operands. Bodies are plain functions of the request and a
//! [`Transaction`]; they perform no I/O besides the transaction and are
//! expected to end with `commit()`.
//!
//! ```
//! use phasekv_engine::{Args, Request, TxnRegistry};
//! use phasekv_core::{Key, ValueKind};
//!
//! const INCR: usize = 0;
//!
//! let mut registry = TxnRegistry::new();
//! registry.register(INCR, |req, txn| {
//!     txn.write_int32(req.args.keys[0], req.args.amount, ValueKind::Sum)?;
//!     txn.commit()?;
//!     Ok(None)
//! });
//! let req = Request::new(INCR, Args::key(Key::from_parts(1, 0)).with_amount(2));
//! assert!(registry.contains(req.txn));
//! ```

use crossbeam::channel::{bounded, Receiver, Sender};
use phasekv_concurrency::Transaction;
use phasekv_core::{Key, TxnError, Value};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Instant;

/// Index of a registered transaction body
pub type TxnCode = usize;

/// Outcome of one request
pub type Reply = Result<Option<Value>, TxnError>;

/// A transaction body
pub type TxnBody = Arc<dyn Fn(&Request, &mut dyn Transaction) -> Reply + Send + Sync>;

/// Typed operands of a request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    /// Keys the body operates on
    pub keys: SmallVec<[Key; 2]>,
    /// Application ids (users, items, ...)
    pub ids: SmallVec<[u64; 4]>,
    /// Amount, price, delta
    pub amount: i32,
    /// Opaque payload for plain writes
    pub payload: Option<Value>,
}

impl Args {
    /// Operands with a single key
    pub fn key(key: Key) -> Self {
        Self {
            keys: smallvec::smallvec![key],
            ..Self::default()
        }
    }

    /// Operands with several keys
    pub fn keys(keys: impl IntoIterator<Item = Key>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Set the amount
    pub fn with_amount(mut self, amount: i32) -> Self {
        self.amount = amount;
        self
    }

    /// Add an id
    pub fn with_id(mut self, id: u64) -> Self {
        self.ids.push(id);
        self
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// One unit of work for a worker
#[derive(Debug, Clone)]
pub struct Request {
    /// Registered body to run
    pub txn: TxnCode,
    /// Operands
    pub args: Args,
    /// Where the reply of a stashed request is delivered after replay
    pub completion: Option<Sender<Reply>>,
    /// Earliest retry time; owned by callers, ignored by the engine
    pub retry_at: Option<Instant>,
}

impl Request {
    /// Request without a completion channel
    pub fn new(txn: TxnCode, args: Args) -> Self {
        Self {
            txn,
            args,
            completion: None,
            retry_at: None,
        }
    }

    /// Request whose deferred reply arrives on the returned receiver
    ///
    /// If `submit` returns [`TxnError::Stash`], exactly one reply is sent on
    /// the receiver once the request has been replayed.
    pub fn deferred(txn: TxnCode, args: Args) -> (Self, Receiver<Reply>) {
        let (tx, rx) = bounded(1);
        let mut req = Self::new(txn, args);
        req.completion = Some(tx);
        (req, rx)
    }

    /// Attach a completion channel
    pub fn with_completion(mut self, completion: Sender<Reply>) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Set the caller-owned retry time
    pub fn with_retry_at(mut self, at: Instant) -> Self {
        self.retry_at = Some(at);
        self
    }
}

/// Table of transaction bodies indexed by code
#[derive(Clone, Default)]
pub struct TxnRegistry {
    bodies: Vec<Option<TxnBody>>,
}

impl TxnRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `body` under `code`, replacing any previous body
    pub fn register<F>(&mut self, code: TxnCode, body: F)
    where
        F: Fn(&Request, &mut dyn Transaction) -> Reply + Send + Sync + 'static,
    {
        if self.bodies.len() <= code {
            self.bodies.resize_with(code + 1, || None);
        }
        self.bodies[code] = Some(Arc::new(body));
    }

    /// Check if `code` has a body
    pub fn contains(&self, code: TxnCode) -> bool {
        matches!(self.bodies.get(code), Some(Some(_)))
    }

    /// Body for `code`
    ///
    /// # Panics
    ///
    /// An unknown code is a programming error.
    pub fn get(&self, code: TxnCode) -> &TxnBody {
        match self.bodies.get(code) {
            Some(Some(body)) => body,
            _ => panic!("unknown transaction code {}", code),
        }
    }

    /// Number of registered bodies
    pub fn len(&self) -> usize {
        self.bodies.iter().filter(|b| b.is_some()).count()
    }

    /// Check if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TxnRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let codes: Vec<TxnCode> = (0..self.bodies.len()).filter(|c| self.contains(*c)).collect();
        f.debug_struct("TxnRegistry").field("codes", &codes).finish()
    }
}
