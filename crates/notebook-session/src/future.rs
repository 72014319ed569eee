//! Client-side handles for outstanding execute requests.
//!
//! An [`ExecutionFuture`] is created when an execute request is sent. The
//! transport feeds it through the paired [`FutureSender`] (usually via a
//! [`FutureRouter`]); the owner installs handlers and awaits [`done`].
//! Handlers run inside `done`, so iopub messages are applied strictly in
//! delivery order and always before the terminal reply.
//!
//! [`done`]: ExecutionFuture::done

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use kernel_messages::ConversionError;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::ExecutionError;

pub type MessageHandler = Box<dyn FnMut(&JupyterMessage) + Send>;

struct FutureChannels {
    iopub_rx: mpsc::UnboundedReceiver<JupyterMessage>,
    reply_rx: oneshot::Receiver<JupyterMessage>,
}

pub struct ExecutionFuture {
    msg_id: String,
    in_progress: AtomicBool,
    dispose_on_done: bool,
    reply_handler: Mutex<Option<MessageHandler>>,
    iopub_handler: Mutex<Option<MessageHandler>>,
    channels: Mutex<Option<FutureChannels>>,
    disposed: watch::Sender<bool>,
}

/// Transport-side half of an [`ExecutionFuture`].
pub struct FutureSender {
    msg_id: String,
    iopub_tx: mpsc::UnboundedSender<JupyterMessage>,
    reply_tx: Option<oneshot::Sender<JupyterMessage>>,
}

impl FutureSender {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Queue an iopub message. Returns false once the future is gone.
    pub fn send_iopub(&self, msg: JupyterMessage) -> bool {
        self.iopub_tx.send(msg).is_ok()
    }

    /// Deliver the terminal shell reply. Only the first reply is delivered.
    pub fn send_reply(&mut self, msg: JupyterMessage) -> bool {
        match self.reply_tx.take() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }
}

impl ExecutionFuture {
    pub fn new(msg_id: impl Into<String>, dispose_on_done: bool) -> (Arc<Self>, FutureSender) {
        let msg_id = msg_id.into();
        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        let (disposed, _) = watch::channel(false);

        let future = Arc::new(ExecutionFuture {
            msg_id: msg_id.clone(),
            in_progress: AtomicBool::new(true),
            dispose_on_done,
            reply_handler: Mutex::new(None),
            iopub_handler: Mutex::new(None),
            channels: Mutex::new(Some(FutureChannels { iopub_rx, reply_rx })),
            disposed,
        });
        let sender = FutureSender {
            msg_id,
            iopub_tx,
            reply_tx: Some(reply_tx),
        };
        (future, sender)
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn set_in_progress(&self, in_progress: bool) {
        self.in_progress.store(in_progress, Ordering::SeqCst);
    }

    pub fn set_reply_handler(&self, handler: MessageHandler) {
        install(&self.reply_handler, handler, "reply");
    }

    pub fn set_iopub_handler(&self, handler: MessageHandler) {
        install(&self.iopub_handler, handler, "iopub");
    }

    pub fn is_disposed(&self) -> bool {
        *self.disposed.borrow()
    }

    /// Drop handlers and cancel any pending [`done`](Self::done).
    pub fn dispose(&self) {
        if self.disposed.send_replace(true) {
            return;
        }
        debug!("[future] Disposing {}", self.msg_id);
        self.in_progress.store(false, Ordering::SeqCst);
        lock(&self.reply_handler).take();
        lock(&self.iopub_handler).take();
        lock(&self.channels).take();
    }

    /// Pump messages into the handlers until the terminal reply arrives.
    ///
    /// Returns the reply, or [`ExecutionError::Canceled`] if the future is
    /// disposed first. Only one caller may await a future.
    pub async fn done(&self) -> Result<JupyterMessage, ExecutionError> {
        let mut disposed = self.disposed.subscribe();
        if *disposed.borrow() {
            return Err(ExecutionError::Canceled);
        }
        let FutureChannels {
            mut iopub_rx,
            mut reply_rx,
        } = lock(&self.channels)
            .take()
            .ok_or(ExecutionError::AlreadyAwaited)?;
        let mut iopub_open = true;

        loop {
            tokio::select! {
                biased;

                changed = disposed.changed() => {
                    if changed.is_err() || *disposed.borrow() {
                        return Err(ExecutionError::Canceled);
                    }
                }
                msg = iopub_rx.recv(), if iopub_open => match msg {
                    Some(msg) => self.dispatch(&self.iopub_handler, &msg),
                    None => iopub_open = false,
                },
                reply = &mut reply_rx => {
                    // iopub queued before the reply still belongs ahead of it
                    while let Ok(msg) = iopub_rx.try_recv() {
                        self.dispatch(&self.iopub_handler, &msg);
                    }
                    let reply = reply.map_err(|_| ExecutionError::ReplyDropped)?;
                    self.in_progress.store(false, Ordering::SeqCst);
                    self.dispatch(&self.reply_handler, &reply);
                    if self.dispose_on_done {
                        self.dispose();
                    }
                    return Ok(reply);
                }
            }
        }
    }

    fn dispatch(&self, slot: &Mutex<Option<MessageHandler>>, msg: &JupyterMessage) {
        // Run the handler outside the lock so it may dispose this future.
        let handler = lock(slot).take();
        let Some(mut handler) = handler else {
            return;
        };
        handler(msg);
        if !self.is_disposed() {
            let mut guard = lock(slot);
            if guard.is_none() {
                *guard = Some(handler);
            }
        }
    }
}

impl std::fmt::Debug for ExecutionFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionFuture")
            .field("msg_id", &self.msg_id)
            .field("in_progress", &self.in_progress())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn install(slot: &Mutex<Option<MessageHandler>>, handler: MessageHandler, kind: &str) {
    let mut guard = lock(slot);
    if guard.is_some() {
        warn!("[future] Replacing existing {} handler", kind);
    }
    *guard = Some(handler);
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Routes kernel messages to the future of the request they answer.
///
/// Messages are matched on `parent_header.msg_id`. `execute_reply` is the
/// terminal message and retires the route; everything else is iopub.
#[derive(Clone, Default)]
pub struct FutureRouter {
    routes: Arc<Mutex<HashMap<String, FutureSender>>>,
}

impl FutureRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, msg_id: &str, dispose_on_done: bool) -> Arc<ExecutionFuture> {
        let (future, sender) = ExecutionFuture::new(msg_id, dispose_on_done);
        lock(&self.routes).insert(msg_id.to_string(), sender);
        future
    }

    /// Returns true if the message belonged to a registered request.
    pub fn route(&self, msg: JupyterMessage) -> bool {
        let Some(parent_id) = kernel_messages::parent_msg_id(&msg).map(str::to_string) else {
            return false;
        };
        let mut routes = lock(&self.routes);
        if matches!(msg.content, JupyterMessageContent::ExecuteReply(_)) {
            match routes.remove(&parent_id) {
                Some(mut sender) => sender.send_reply(msg),
                None => false,
            }
        } else {
            match routes.get(&parent_id) {
                Some(sender) => sender.send_iopub(msg),
                None => false,
            }
        }
    }

    /// Decode a message a backend delivered as JSON and route it.
    pub fn route_json(&self, json: &str) -> Result<bool, ConversionError> {
        let msg = kernel_messages::parse_message(json)?;
        Ok(self.route(msg))
    }

    pub fn pending(&self) -> usize {
        lock(&self.routes).len()
    }

    /// Drop every route; their futures resolve with `ReplyDropped`.
    pub fn clear(&self) {
        lock(&self.routes).clear();
    }
}
