//! Client-side transactions.
//!
//! Operations queue locally and go out as one `transaction` request on
//! [`commit`](Transaction::commit). The server runs them in order and stops at
//! the first failure; it does not undo earlier ones. Every queued operation is
//! resolved exactly once: with its result, its own error, or a rollback error
//! when an earlier operation failed.

use super::client::{ClientParams, ClientValue, RomClient};
use super::continuation::{spawn_with, Continuation};
use super::proxy::RemoteObject;
use super::schema::ParamType;
use super::server::keys;
use super::value::RomValue;
use crate::config::ProtocolConfig;
use crate::protocol::{methods, ResponseError};
use crate::{Result, RomError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

/// Result of one queued operation, available after commit.
#[derive(Debug)]
pub struct TxResult<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TxResult<T> {
    pub async fn get(self) -> Result<T> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(RomError::rollback("transaction was discarded")))
    }
}

enum OpKind {
    Create {
        proxy: RemoteObject,
        tx: oneshot::Sender<Result<RemoteObject>>,
    },
    Invoke {
        returns: ParamType,
        tx: oneshot::Sender<Result<ClientValue>>,
    },
    Release {
        proxy: RemoteObject,
        tx: oneshot::Sender<Result<()>>,
    },
}

struct QueuedOp {
    id: u64,
    method: &'static str,
    params: Value,
    kind: OpKind,
}

impl QueuedOp {
    fn fail(self, err: RomError) {
        match self.kind {
            OpKind::Create { proxy, tx } => {
                proxy.roll_back();
                let _ = tx.send(Err(err));
            }
            OpKind::Invoke { tx, .. } => {
                let _ = tx.send(Err(err));
            }
            OpKind::Release { tx, .. } => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

pub struct Transaction {
    client: RomClient,
    ops: Mutex<Vec<QueuedOp>>,
    next_id: AtomicU64,
    state: Mutex<TransactionState>,
}

impl Transaction {
    pub(crate) fn new(client: RomClient) -> Self {
        Self {
            client,
            ops: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            state: Mutex::new(TransactionState::Open),
        }
    }

    fn ops(&self) -> MutexGuard<'_, Vec<QueuedOp>> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.ops().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            TransactionState::Open => Ok(()),
            TransactionState::Committed => Err(RomError::protocol("transaction already committed")),
            TransactionState::RolledBack => {
                Err(RomError::rollback("transaction already rolled back"))
            }
        }
    }

    /// Leave `Open` and take the queue. Fails when already closed.
    fn close(&self, next: TransactionState) -> Result<Vec<QueuedOp>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            TransactionState::Open => *state = next,
            TransactionState::Committed => {
                return Err(RomError::protocol("transaction already committed"))
            }
            TransactionState::RolledBack => {
                return Err(RomError::rollback("transaction already rolled back"))
            }
        }
        Ok(std::mem::take(&mut *self.ops()))
    }

    fn push(&self, op: QueuedOp) {
        self.ops().push(op);
    }

    /// Queue a create. The proxy is provisional: later operations in this
    /// transaction may use it, and it becomes live once the commit succeeds.
    ///
    /// The outcome shows in the proxy's state only. Use
    /// [`create_tracked`](Self::create_tracked) to also learn why a create
    /// failed.
    pub fn create(&self, type_name: &str, params: ClientParams) -> Result<RemoteObject> {
        self.create_tracked(type_name, params).map(|(proxy, _)| proxy)
    }

    /// Like [`create`](Self::create), plus a result that resolves to the
    /// patched proxy after commit, or to the error that stopped it.
    pub fn create_tracked(
        &self,
        type_name: &str,
        params: ClientParams,
    ) -> Result<(RemoteObject, TxResult<RemoteObject>)> {
        self.ensure_open()?;
        let request = self.client.create_params(type_name, &params)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let provisional = format!("{}{}", ProtocolConfig::PROVISIONAL_REF_PREFIX, id);
        let proxy = RemoteObject::provisional(&provisional, type_name, self.client.downgrade());
        let (tx, rx) = oneshot::channel();
        self.push(QueuedOp {
            id,
            method: methods::CREATE,
            params: request,
            kind: OpKind::Create {
                proxy: proxy.clone(),
                tx,
            },
        });
        Ok((proxy, TxResult { rx }))
    }

    pub fn invoke(
        &self,
        object: &RemoteObject,
        method: &str,
        params: ClientParams,
    ) -> Result<TxResult<ClientValue>> {
        self.ensure_open()?;
        let reference = object.wire_ref()?;
        let (request, returns) =
            self.client
                .invoke_params(&reference, object.type_name(), method, &params)?;
        let (tx, rx) = oneshot::channel();
        self.push(QueuedOp {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            method: methods::INVOKE,
            params: request,
            kind: OpKind::Invoke { returns, tx },
        });
        Ok(TxResult { rx })
    }

    pub fn release(&self, object: &RemoteObject) -> Result<TxResult<()>> {
        self.ensure_open()?;
        let reference = object.wire_ref()?;
        let (tx, rx) = oneshot::channel();
        self.push(QueuedOp {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            method: methods::RELEASE,
            params: json!({ (keys::OBJECT): reference }),
            kind: OpKind::Release {
                proxy: object.clone(),
                tx,
            },
        });
        Ok(TxResult { rx })
    }

    /// Send every queued operation as one request and resolve each one.
    ///
    /// Returns a rollback error when any operation failed. A transport
    /// failure fails every operation with that error.
    pub async fn commit(&self) -> Result<()> {
        let ops = self.close(TransactionState::Committed)?;
        if ops.is_empty() {
            return Ok(());
        }

        let operations: Vec<Value> = ops
            .iter()
            .map(|op| {
                json!({
                    (keys::ID): op.id,
                    (keys::METHOD): op.method,
                    (keys::PARAMS): op.params,
                })
            })
            .collect();
        debug!("Committing transaction of {} operations", operations.len());

        let reply = self
            .client
            .session()
            .send_request(
                methods::TRANSACTION,
                Some(json!({ (keys::OPERATIONS): operations })),
            )
            .await;

        match reply.and_then(|result| parse_outcomes(&result)) {
            Ok(outcomes) => self.distribute(ops, outcomes),
            Err(e) => {
                for op in ops {
                    op.fail(e.clone());
                }
                Err(e)
            }
        }
    }

    fn distribute(
        &self,
        ops: Vec<QueuedOp>,
        mut outcomes: HashMap<u64, Result<Value>>,
    ) -> Result<()> {
        let mut failure: Option<(u64, RomError)> = None;
        for op in ops {
            let id = op.id;
            if let Some((failed, _)) = &failure {
                op.fail(RomError::rollback(format!(
                    "operation {} failed earlier in the transaction",
                    failed
                )));
                continue;
            }
            match outcomes.remove(&id) {
                Some(Ok(value)) => self.succeed(op, &value),
                Some(Err(e)) => {
                    op.fail(e.clone());
                    failure = Some((id, e));
                }
                None => {
                    let e = RomError::rollback("operation was not attempted");
                    op.fail(e.clone());
                    failure = Some((id, e));
                }
            }
        }

        match failure {
            Some((id, e)) => Err(RomError::rollback(format!(
                "transaction failed at operation {}: {}",
                id, e
            ))),
            None => Ok(()),
        }
    }

    fn succeed(&self, op: QueuedOp, value: &Value) {
        match op.kind {
            OpKind::Create { proxy, tx } => match self.client.read_value(value, &ParamType::String) {
                Ok(RomValue::String(reference)) => {
                    proxy.patch(&reference);
                    self.client.adopt_proxy(&reference, proxy.clone());
                    let _ = tx.send(Ok(proxy));
                }
                other => {
                    warn!("Transaction create returned no reference: {:?}", other);
                    proxy.roll_back();
                    let _ = tx.send(Err(RomError::protocol(format!(
                        "create returned no object reference: {}",
                        value
                    ))));
                }
            },
            OpKind::Invoke { returns, tx } => {
                let _ = tx.send(self.client.read_value(value, &returns));
            }
            OpKind::Release { proxy, tx } => {
                self.client.forget(&proxy);
                let _ = tx.send(Ok(()));
            }
        }
    }

    pub fn commit_with(self, continuation: Continuation<()>) {
        let runtime = self.client.runtime();
        spawn_with(
            runtime.as_ref(),
            async move { self.commit().await },
            continuation,
        );
    }

    /// Discard the queue. Every queued operation fails with a rollback error
    /// and queued creates are left rolled back.
    pub fn rollback(&self) -> Result<()> {
        for op in self.close(TransactionState::RolledBack)? {
            op.fail(RomError::rollback("transaction rolled back"));
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state() == TransactionState::Open && !self.is_empty() {
            debug!("Uncommitted transaction dropped");
            let _ = self.rollback();
        }
    }
}

/// `[{id, result} | {id, error}]` into per-operation outcomes.
fn parse_outcomes(result: &Value) -> Result<HashMap<u64, Result<Value>>> {
    let items = result
        .as_array()
        .ok_or_else(|| RomError::protocol("transaction result must be an array"))?;
    let mut outcomes = HashMap::with_capacity(items.len());
    for item in items {
        let id = item
            .get(keys::ID)
            .and_then(Value::as_u64)
            .ok_or_else(|| RomError::protocol("transaction outcome without an id"))?;
        let outcome = match item.get(keys::ERROR) {
            Some(error) => {
                let error: ResponseError = serde_json::from_value(error.clone())?;
                Err(RomError::from_response_error(error))
            }
            None => Ok(item.get(keys::RESULT).cloned().unwrap_or(Value::Null)),
        };
        outcomes.insert(id, outcome);
    }
    Ok(outcomes)
}
