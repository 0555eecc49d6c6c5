//! The wrapped worker actor: one isolated task hosting one [`Processor`].

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::work::{Work, WorkError, WorkResult};
use crate::worker::Processor;

/// Observable lifecycle of a worker actor.
///
/// `Starting -> Idle -> Busy -> Idle -> ... -> Closed`. No other
/// transitions are reachable; in particular there is no path back from
/// `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActorState {
    Starting = 0,
    Idle = 1,
    Busy = 2,
    Closed = 3,
}

impl ActorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Idle,
            2 => Self::Busy,
            _ => Self::Closed,
        }
    }
}

/// Messages an actor accepts on its inbound channel.
#[derive(Debug)]
pub enum ActorMessage<I> {
    Work(Work<I>),
    Shutdown,
}

/// Events an actor emits on its outbound channel.
#[derive(Debug)]
pub enum ActorEvent<O> {
    Initialized { name: String },
    Result(WorkResult<O>),
    Closed { name: String },
}

/// A live handle to a running actor: the dispatch manager's view of it.
pub struct ActorHandle<I> {
    name: String,
    inbound: mpsc::Sender<ActorMessage<I>>,
    state: Arc<AtomicU8>,
}

// Manual impl: `#[derive(Clone)]` would add a spurious `I: Clone` bound even
// though `mpsc::Sender<ActorMessage<I>>` is `Clone` regardless of `I`.
impl<I> Clone for ActorHandle<I> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inbound: self.inbound.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<I> ActorHandle<I> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ActorState {
        ActorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Send one work item to this actor. Fails if the actor has exited.
    pub async fn send_work(&self, work: Work<I>) -> Result<(), mpsc::error::SendError<Work<I>>> {
        self.inbound
            .send(ActorMessage::Work(work))
            .await
            .map_err(|e| match e.0 {
                ActorMessage::Work(w) => mpsc::error::SendError(w),
                ActorMessage::Shutdown => unreachable!(),
            })
    }

    /// Request a graceful shutdown. The actor finishes any in-flight
    /// `process` call, emits `Closed`, then exits.
    pub async fn shutdown(&self) {
        let _ = self.inbound.send(ActorMessage::Shutdown).await;
    }

    pub fn is_alive(&self) -> bool {
        !self.inbound.is_closed()
    }
}

/// Spawn one actor hosting `worker`, returning a handle plus the receiver
/// end the supervisor/dispatch manager drains for events.
///
/// The `inbound_capacity` parameter bounds the actor's mailbox; spec.md
/// requires only "capacity >= 1".
pub fn spawn_actor<P>(
    name: impl Into<String>,
    worker: P,
    inbound_capacity: usize,
) -> (ActorHandle<P::Input>, mpsc::Receiver<ActorEvent<P::Output>>)
where
    P: Processor,
{
    let name = name.into();
    let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
    let (outbound_tx, outbound_rx) = mpsc::channel(inbound_capacity.max(1) + 1);
    let state = Arc::new(AtomicU8::new(ActorState::Starting as u8));

    let handle = ActorHandle {
        name: name.clone(),
        inbound: inbound_tx,
        state: Arc::clone(&state),
    };

    tokio::spawn(run_actor(name, worker, inbound_rx, outbound_tx, state));

    (handle, outbound_rx)
}

#[instrument(skip(worker, inbound, outbound, state), fields(actor = %name))]
async fn run_actor<P>(
    name: String,
    worker: P,
    mut inbound: mpsc::Receiver<ActorMessage<P::Input>>,
    outbound: mpsc::Sender<ActorEvent<P::Output>>,
    state: Arc<AtomicU8>,
) where
    P: Processor,
{
    state.store(ActorState::Idle as u8, Ordering::Release);
    if outbound
        .send(ActorEvent::Initialized { name: name.clone() })
        .await
        .is_err()
    {
        debug!("outbound closed before initialization could be observed");
        return;
    }
    info!("actor initialized");

    while let Some(msg) = inbound.recv().await {
        match msg {
            ActorMessage::Shutdown => break,
            ActorMessage::Work(work) => {
                state.store(ActorState::Busy as u8, Ordering::Release);
                let work_id = work.id();
                let result = AssertUnwindSafe(worker.process(work))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        warn!("worker panicked while processing work");
                        WorkResult::err(work_id, WorkError::from_panic(panic.as_ref()))
                    });
                state.store(ActorState::Idle as u8, Ordering::Release);
                if outbound.send(ActorEvent::Result(result)).await.is_err() {
                    debug!("outbound closed, actor stopping");
                    return;
                }
            }
        }
    }

    state.store(ActorState::Closed as u8, Ordering::Release);
    let _ = outbound.send(ActorEvent::Closed { name }).await;
}
