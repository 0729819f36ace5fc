//! Runs a [ConsensusState] on its own task.
//!
//! The task owns the state machine. Peers, timeouts and the mempool reach it
//! through one loop, so inputs are handled strictly one at a time.
use replica_common::p2p::PeerId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::message::{NewRoundStepMessage, VoteSetMaj23Message};
use crate::{ConsensusError, ConsensusState, EventBus, MsgInfo, Outbound, RoundStateSummary};

const INPUT_QUEUE_SIZE: usize = 1024;

/// Something for the state machine to act on.
#[derive(Clone, Debug)]
pub enum ConsensusInput {
    Message(MsgInfo),
    /// A peer announced its position and may need our data.
    PeerStatus {
        peer: PeerId,
        status: NewRoundStepMessage,
    },
    PeerMaj23 {
        peer: PeerId,
        msg: VoteSetMaj23Message,
    },
    PeerAdded(PeerId),
}

pub struct ConsensusService;

impl ConsensusService {
    /// Replays the WAL and starts the state machine. Messages for peers are
    /// sent to `outbound`.
    pub fn spawn(
        mut state: ConsensusState,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Result<ConsensusHandle, ConsensusError> {
        state.start()?;

        let (inputs, input_rx) = mpsc::channel(INPUT_QUEUE_SIZE);
        let (summary_tx, summary) = watch::channel(state.summary());
        let events = state.events().clone();
        let cancel = CancellationToken::new();
        let txs_available = state
            .config()
            .wait_for_txs()
            .then(|| state.executor().mempool().enable_txs_available());

        let task = tokio::spawn(run(
            state,
            input_rx,
            outbound,
            summary_tx,
            txs_available,
            cancel.clone(),
        ));
        Ok(ConsensusHandle {
            inputs,
            summary,
            events,
            cancel,
            task,
        })
    }
}

pub struct ConsensusHandle {
    inputs: mpsc::Sender<ConsensusInput>,
    summary: watch::Receiver<RoundStateSummary>,
    events: EventBus,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), ConsensusError>>,
}

impl ConsensusHandle {
    pub fn inputs(&self) -> mpsc::Sender<ConsensusInput> {
        self.inputs.clone()
    }

    /// Returns `false` once the state machine stopped.
    pub async fn send(&self, input: ConsensusInput) -> bool {
        self.inputs.send(input).await.is_ok()
    }

    /// The latest position, updated after every input.
    pub fn summary(&self) -> watch::Receiver<RoundStateSummary> {
        self.summary.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the state machine and waits until the WAL is flushed. Returns
    /// the fatal error that stopped it early, if any.
    pub async fn stop(self) -> Result<(), ConsensusError> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|e| ConsensusError::execution(anyhow::Error::from(e).context("consensus task")))?
    }
}

enum Wakeup {
    Cancelled,
    Timeout,
    Input(Option<ConsensusInput>),
    TxsAvailable(Option<()>),
}

async fn run(
    mut state: ConsensusState,
    mut inputs: mpsc::Receiver<ConsensusInput>,
    outbound: mpsc::UnboundedSender<Outbound>,
    summary: watch::Sender<RoundStateSummary>,
    txs_available: Option<mpsc::Receiver<()>>,
    cancel: CancellationToken,
) -> Result<(), ConsensusError> {
    let flush_cancel = cancel.child_token();
    let flush_task = state.spawn_wal_flush(flush_cancel.clone());
    tracing::info!(position = %state.round_state().hrs(), "Consensus started");

    let result = run_loop(
        &mut state,
        &mut inputs,
        &outbound,
        &summary,
        txs_available,
        &cancel,
    )
    .await;
    if let Err(error) = &result {
        tracing::error!(%error, position = %state.round_state().hrs(), "Consensus halted");
    }

    state.stop_ticker();
    inputs.close();
    let result = match result {
        Ok(()) => drain(&mut state, &mut inputs),
        error => error,
    };
    forward(&mut state, &outbound);

    let flushed = state.flush_wal();
    flush_cancel.cancel();
    if let Some(task) = flush_task {
        if let Err(error) = task.await {
            tracing::warn!(%error, "WAL flush task failed");
        }
    }
    tracing::info!(position = %state.round_state().hrs(), "Consensus stopped");
    result.and(flushed)
}

async fn run_loop(
    state: &mut ConsensusState,
    inputs: &mut mpsc::Receiver<ConsensusInput>,
    outbound: &mpsc::UnboundedSender<Outbound>,
    summary: &watch::Sender<RoundStateSummary>,
    mut txs_available: Option<mpsc::Receiver<()>>,
    cancel: &CancellationToken,
) -> Result<(), ConsensusError> {
    loop {
        state.process_internal()?;
        forward(state, outbound);
        summary.send_replace(state.summary());

        let due = state.next_timeout_due();
        let wakeup = tokio::select! {
            biased;
            _ = cancel.cancelled() => Wakeup::Cancelled,
            _ = sleep_until(due) => Wakeup::Timeout,
            input = inputs.recv() => Wakeup::Input(input),
            notified = recv_txs_available(&mut txs_available) => Wakeup::TxsAvailable(notified),
        };

        match wakeup {
            Wakeup::Cancelled => return Ok(()),
            Wakeup::Timeout => {
                if let Some(timeout) = state.pop_due_timeout(Instant::now()) {
                    state.handle_timeout(timeout)?;
                }
            }
            Wakeup::Input(Some(input)) => handle_input(state, input)?,
            Wakeup::Input(None) => {
                tracing::debug!("All consensus input senders dropped");
                return Ok(());
            }
            Wakeup::TxsAvailable(Some(())) => state.handle_txs_available()?,
            Wakeup::TxsAvailable(None) => txs_available = None,
        }
    }
}

fn handle_input(state: &mut ConsensusState, input: ConsensusInput) -> Result<(), ConsensusError> {
    match input {
        ConsensusInput::Message(mi) => {
            let peer = mi.peer_id.clone();
            match state.handle_msg(mi) {
                Err(error) if error.is_recoverable() => {
                    tracing::debug!(?peer, %error, "Dropped consensus message");
                    Ok(())
                }
                other => other,
            }
        }
        ConsensusInput::PeerStatus { peer, status } => {
            state.peer_catchup(peer, status);
            Ok(())
        }
        ConsensusInput::PeerMaj23 { peer, msg } => {
            state.set_peer_maj23(peer, msg);
            Ok(())
        }
        ConsensusInput::PeerAdded(peer) => {
            state.peer_added(peer);
            Ok(())
        }
    }
}

/// Handles what was queued before shutdown.
fn drain(
    state: &mut ConsensusState,
    inputs: &mut mpsc::Receiver<ConsensusInput>,
) -> Result<(), ConsensusError> {
    while let Ok(input) = inputs.try_recv() {
        handle_input(state, input)?;
    }
    state.process_internal()
}

fn forward(state: &mut ConsensusState, outbound: &mpsc::UnboundedSender<Outbound>) {
    for msg in state.drain_outbound() {
        if outbound.send(msg).is_err() {
            tracing::trace!("Outbound receiver dropped");
            break;
        }
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

async fn recv_txs_available(receiver: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
