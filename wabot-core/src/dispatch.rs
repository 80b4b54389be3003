//! Inbound event fan-out and failure-isolated handler dispatch.
//!
//! The supervisor owns an [`EventSource`] per open connection and publishes
//! every inbound event into it. Subscribers get their own unbounded queue
//! per event kind, so each one sees every event exactly once and in
//! emission order. [`EventDispatcher::attach`] spawns one worker per
//! subscription; a worker runs its handler sequentially and survives any
//! error or panic the handler produces.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::backend::ConnectionHandle;
use crate::event::{CallBatch, GroupParticipantsUpdate, InboundEvent, MessageBatch};

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A handler for one event kind. Receives the event and the live connection.
pub type Handler<E> = Arc<dyn Fn(Arc<E>, ConnectionHandle) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<E, F, Fut>(f: F) -> Handler<E>
where
    E: Send + Sync + 'static,
    F: Fn(Arc<E>, ConnectionHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event: Arc<E>, conn: ConnectionHandle| -> HandlerFuture {
        Box::pin(f(event, conn))
    })
}

/// The primary handler per event kind.
#[derive(Clone)]
pub struct Handlers {
    pub message: Handler<MessageBatch>,
    pub call: Handler<CallBatch>,
    pub group_update: Handler<GroupParticipantsUpdate>,
}

impl Handlers {
    /// Handlers that accept everything and do nothing.
    pub fn noop() -> Self {
        Self {
            message: handler(|_, _| async { Ok(()) }),
            call: handler(|_, _| async { Ok(()) }),
            group_update: handler(|_, _| async { Ok(()) }),
        }
    }
}

/// Typed inbound fan-out for one connection.
#[derive(Default)]
pub struct EventSource {
    messages: Vec<UnboundedSender<Arc<MessageBatch>>>,
    calls: Vec<UnboundedSender<Arc<CallBatch>>>,
    group_updates: Vec<UnboundedSender<Arc<GroupParticipantsUpdate>>>,
}

impl EventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_messages(&mut self) -> UnboundedReceiver<Arc<MessageBatch>> {
        subscribe(&mut self.messages)
    }

    pub fn subscribe_calls(&mut self) -> UnboundedReceiver<Arc<CallBatch>> {
        subscribe(&mut self.calls)
    }

    pub fn subscribe_group_updates(&mut self) -> UnboundedReceiver<Arc<GroupParticipantsUpdate>> {
        subscribe(&mut self.group_updates)
    }

    /// Deliver one event to every live subscriber of its kind. Returns how
    /// many subscribers received it.
    pub fn publish(&mut self, event: InboundEvent) -> usize {
        match event {
            InboundEvent::Message(batch) => fan_out(&mut self.messages, batch),
            InboundEvent::Call(calls) => fan_out(&mut self.calls, calls),
            InboundEvent::GroupUpdate(update) => fan_out(&mut self.group_updates, update),
        }
    }
}

fn subscribe<E>(senders: &mut Vec<UnboundedSender<Arc<E>>>) -> UnboundedReceiver<Arc<E>> {
    let (tx, rx) = mpsc::unbounded_channel();
    senders.push(tx);
    rx
}

fn fan_out<E>(senders: &mut Vec<UnboundedSender<Arc<E>>>, event: E) -> usize {
    let event = Arc::new(event);
    senders.retain(|tx| tx.send(event.clone()).is_ok());
    senders.len()
}

/// Routes inbound streams to handlers.
#[derive(Clone)]
pub struct EventDispatcher {
    handlers: Handlers,
    extra_message: Vec<(&'static str, Handler<MessageBatch>)>,
}

impl EventDispatcher {
    pub fn new(handlers: Handlers) -> Self {
        Self {
            handlers,
            extra_message: Vec::new(),
        }
    }

    /// Register another message subscriber next to the primary handler.
    /// It gets its own queue and worker.
    pub fn with_message_subscriber(mut self, name: &'static str, handler: Handler<MessageBatch>) -> Self {
        self.extra_message.push((name, handler));
        self
    }

    /// Subscribe to `source` and start the workers for one open period.
    pub fn attach(&self, source: &mut EventSource, conn: ConnectionHandle, attempt: u64) -> Attachment {
        let mut workers = vec![
            spawn_worker(
                "message",
                source.subscribe_messages(),
                self.handlers.message.clone(),
                conn.clone(),
                attempt,
            ),
            spawn_worker(
                "call",
                source.subscribe_calls(),
                self.handlers.call.clone(),
                conn.clone(),
                attempt,
            ),
            spawn_worker(
                "group_update",
                source.subscribe_group_updates(),
                self.handlers.group_update.clone(),
                conn.clone(),
                attempt,
            ),
        ];
        for (name, handler) in &self.extra_message {
            workers.push(spawn_worker(
                *name,
                source.subscribe_messages(),
                handler.clone(),
                conn.clone(),
                attempt,
            ));
        }
        Attachment { workers }
    }
}

/// Workers started by one [`EventDispatcher::attach`] call.
pub struct Attachment {
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl Attachment {
    /// Wait for workers to drain their queues once the source is dropped.
    /// Anything still running after `grace` is aborted.
    pub async fn shutdown(self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        for (name, mut worker) in self.workers {
            match tokio::time::timeout_at(deadline, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(subscriber = name, error = %e, "Dispatcher worker failed"),
                Err(_) => {
                    tracing::warn!(subscriber = name, "Handler still running after close, aborting");
                    worker.abort();
                }
            }
        }
    }
}

fn spawn_worker<E>(
    name: &'static str,
    mut rx: UnboundedReceiver<Arc<E>>,
    handler: Handler<E>,
    conn: ConnectionHandle,
    attempt: u64,
) -> (&'static str, JoinHandle<()>)
where
    E: Send + Sync + 'static,
{
    let worker = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let span = tracing::info_span!("handler", subscriber = name, attempt);
            // Build the future inside the guarded block so a panic in the
            // handler's synchronous prologue is caught too.
            let call = async { handler(event, conn.clone()).await };
            match AssertUnwindSafe(call).catch_unwind().instrument(span).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let error = format!("{e:#}");
                    tracing::error!(subscriber = name, attempt, %error, "Error handling {name} event");
                }
                Err(panic) => {
                    let panic = panic_message(panic.as_ref());
                    tracing::error!(subscriber = name, attempt, %panic, "Handler panicked on {name} event");
                }
            }
        }
        tracing::debug!(subscriber = name, attempt, "Event stream ended");
    });
    (name, worker)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChatMessage, MessageKey, UpsertKind};

    fn batch(id: &str) -> InboundEvent {
        InboundEvent::Message(MessageBatch {
            kind: UpsertKind::Notify,
            messages: vec![ChatMessage {
                key: MessageKey {
                    remote_jid: "1@s.whatsapp.net".into(),
                    id: id.into(),
                    from_me: false,
                    participant: None,
                },
                push_name: None,
                timestamp: None,
                content: None,
            }],
        })
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let mut source = EventSource::new();
        let mut a = source.subscribe_messages();
        let mut b = source.subscribe_messages();

        assert_eq!(source.publish(batch("1")), 2);
        assert_eq!(source.publish(batch("2")), 2);
        drop(source);

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await.unwrap().messages[0].key.id, "1");
            assert_eq!(rx.recv().await.unwrap().messages[0].key.id, "2");
            assert!(rx.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let mut source = EventSource::new();
        let rx = source.subscribe_messages();
        drop(rx);
        assert_eq!(source.publish(batch("1")), 0);
    }

    #[test]
    fn panic_message_reads_str_and_string() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
