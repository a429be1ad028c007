//! Run group: a set of actors that live and die together.
//!
//! Each actor is an `execute` future plus an `interrupt` callback. All
//! actors run concurrently. When the first one returns, every actor's
//! interrupt is called exactly once, in registration order, and the group
//! waits for all of them to return. The first error observed is the
//! group's result; simultaneous completions are ordered by registration.

use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::auth::AuthError;
use crate::cache::CacheError;
use crate::sink::SinkError;

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("auth handler: {0}")]
    Auth(#[from] AuthError),

    #[error("sink server: {0}")]
    Sink(#[from] SinkError),

    #[error("listener {address}: {source}")]
    Listener {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("static secret updater: {0}")]
    Updater(#[from] CacheError),

    #[error("actor {0} panicked")]
    Panicked(String),
}

type Execute = Pin<Box<dyn Future<Output = Result<(), ActorError>> + Send>>;
type Interrupt = Box<dyn FnOnce() + Send>;

struct Actor {
    name: String,
    execute: Execute,
    interrupt: Interrupt,
}

#[derive(Default)]
pub struct RunGroup {
    actors: Vec<Actor>,
}

impl RunGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, I>(&mut self, name: impl Into<String>, execute: F, interrupt: I)
    where
        F: Future<Output = Result<(), ActorError>> + Send + 'static,
        I: FnOnce() + Send + 'static,
    {
        self.actors.push(Actor {
            name: name.into(),
            execute: Box::pin(execute),
            interrupt: Box::new(interrupt),
        });
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub async fn run(self) -> Result<(), ActorError> {
        let total = self.actors.len();
        if total == 0 {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut names = Vec::with_capacity(total);
        let mut interrupts: Vec<Option<Interrupt>> = Vec::with_capacity(total);

        for (index, actor) in self.actors.into_iter().enumerate() {
            names.push(actor.name.clone());
            interrupts.push(Some(actor.interrupt));
            let tx = tx.clone();
            let name = actor.name;
            let execute = actor.execute;
            tokio::spawn(async move {
                let result = AssertUnwindSafe(execute)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        tracing::error!(actor = %name, panic = %panic_message(&panic), "Actor panicked");
                        Err(ActorError::Panicked(name))
                    });
                let _ = tx.send((index, result));
            });
        }
        drop(tx);

        let mut completed = Vec::with_capacity(total);
        if let Some(first) = rx.recv().await {
            completed.push(first);
        }
        while let Ok(next) = rx.try_recv() {
            completed.push(next);
        }
        completed.sort_by_key(|(index, _)| *index);

        if let Some((index, result)) = completed.first() {
            match result {
                Ok(()) => tracing::info!(actor = %names[*index], "Actor finished, stopping run group"),
                Err(e) => tracing::error!(actor = %names[*index], error = %e, "Actor failed, stopping run group"),
            }
        }

        for interrupt in interrupts.iter_mut() {
            if let Some(interrupt) = interrupt.take() {
                interrupt();
            }
        }

        while completed.len() < total {
            match rx.recv().await {
                Some(next) => completed.push(next),
                None => break,
            }
        }

        let mut first_error = None;
        for (index, result) in completed {
            match result {
                Ok(()) => tracing::debug!(actor = %names[index], "Actor stopped"),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => tracing::debug!(actor = %names[index], error = %e, "Discarding later actor error"),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn listener_error(address: &str) -> ActorError {
        ActorError::Listener {
            address: address.into(),
            source: std::io::Error::other("boom"),
        }
    }

    #[tokio::test]
    async fn test_empty_group_returns_ok() {
        assert!(RunGroup::new().run().await.is_ok());
    }

    #[tokio::test]
    async fn test_every_interrupt_called_once() {
        let ctx = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut group = RunGroup::new();

        for i in 0..3 {
            let wait = ctx.clone();
            let cancel = ctx.clone();
            let calls = calls.clone();
            group.add(
                format!("actor-{}", i),
                async move {
                    if i > 0 {
                        wait.cancelled().await;
                    }
                    Ok::<(), ActorError>(())
                },
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    cancel.cancel();
                },
            );
        }

        group.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let ctx = CancellationToken::new();
        let mut group = RunGroup::new();

        let wait = ctx.clone();
        group.add(
            "late",
            async move {
                wait.cancelled().await;
                Err::<(), _>(listener_error("late"))
            },
            || {},
        );
        let cancel = ctx.clone();
        group.add(
            "early",
            async { Err::<(), _>(listener_error("early")) },
            move || cancel.cancel(),
        );

        match group.run().await {
            Err(ActorError::Listener { address, .. }) => assert_eq!(address, "early"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_interrupts_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let ctx = CancellationToken::new();
        let mut group = RunGroup::new();
        for name in ["a", "b", "c"] {
            let order = order.clone();
            let wait = ctx.clone();
            let cancel = ctx.clone();
            group.add(
                name,
                async move {
                    if name == "c" {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    } else {
                        wait.cancelled().await;
                    }
                    Ok::<(), ActorError>(())
                },
                move || {
                    order.lock().unwrap().push(name);
                    cancel.cancel();
                },
            );
        }
        group.run().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let mut group = RunGroup::new();
        group.add(
            "explodes",
            async {
                if "kaboom".len() > 1 {
                    panic!("kaboom");
                }
                Ok::<(), ActorError>(())
            },
            || {},
        );
        assert!(matches!(group.run().await, Err(ActorError::Panicked(name)) if name == "explodes"));
    }
}
