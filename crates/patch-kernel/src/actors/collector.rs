//! Collector: wraps a CollectionManager for frame assembly via acton-reactive.
//!
//! Uses the broker pub/sub pattern:
//! - Subscribes to `SubmitFrame` from patch drivers
//! - Broadcasts `CollectorReady` on start with its handle
//! - Broadcasts `FrameAssembled` once per completed frame
//! - Broadcasts `CollectionRejected` for contributions the manager refuses

use std::sync::Arc;

use acton_reactive::prelude::*;

use crate::collect::CollectionManager;
use crate::messages::{
    CollectionRejected, CollectorReady, FrameAssembled, FrameKind, SubmitFrame,
};

/// Actor state for Collector.
#[derive(Default, Clone)]
pub struct CollectorState {
    /// Shared with any direct (non-actor) submitters
    manager: Option<Arc<CollectionManager>>,
}

impl std::fmt::Debug for CollectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorState")
            .field(
                "pending_positions",
                &self.manager.as_ref().map(|m| m.positions().pending_count()),
            )
            .field(
                "pending_velocities",
                &self.manager.as_ref().map(|m| m.velocities().pending_count()),
            )
            .finish()
    }
}

/// Actor front for a [`CollectionManager`].
///
/// Submissions are handled concurrently (via `act_on`); the manager's
/// per-sequence locking keeps each frame consistent, and exactly one handler
/// sees the completing contribution and broadcasts the frame.
///
/// ## Message Flow
///
/// ```text
/// Patch step end
///   |
///   +-- SubmitFrame (seq, slice) --> Collector
///   |                                   |
///   |                 more contributors outstanding: nothing
///   |                 last contributor: FrameAssembled (broadcast)
///   |                 refused: CollectionRejected (broadcast)
/// ```
pub struct Collector;

impl Collector {
    /// Spawn the Collector actor in the given runtime.
    pub async fn spawn(runtime: &mut ActorRuntime, manager: Arc<CollectionManager>) -> ActorHandle {
        let mut actor = runtime.new_actor_with_name::<CollectorState>("Collector".to_string());

        actor.model.manager = Some(manager);

        actor.handle().subscribe::<SubmitFrame>().await;

        actor.after_start(|actor| {
            let broker = actor.broker().clone();
            let handle = actor.handle().clone();

            Reply::pending(async move {
                tracing::info!("Collector started, broadcasting ready");
                broker.broadcast(CollectorReady { handle }).await;
            })
        });

        actor.act_on::<SubmitFrame>(|actor, context| {
            let msg = context.message().clone();
            let broker = actor.broker().clone();

            let Some(manager) = actor.model.manager.clone() else {
                tracing::error!("Collector: manager not initialized");
                return Reply::ready();
            };

            let result = match msg.kind {
                FrameKind::Positions { lattice, precision } => manager
                    .positions()
                    .submit_with_lattice(msg.seq, &msg.ids, &msg.values, precision, Some(lattice)),
                FrameKind::Velocities => manager.submit_velocities(msg.seq, &msg.ids, &msg.values),
            };

            match result {
                Ok(None) => {
                    tracing::trace!(
                        seq = msg.seq,
                        patch = %msg.patch,
                        collection = msg.kind.as_str(),
                        "Collector: contribution accepted"
                    );
                    Reply::ready()
                }
                Ok(Some(frame)) => {
                    tracing::debug!(
                        seq = frame.seq,
                        atoms = frame.len(),
                        collection = msg.kind.as_str(),
                        "Collector: frame assembled"
                    );
                    let assembled = FrameAssembled {
                        collection: msg.kind.as_str(),
                        frame: Arc::new(frame),
                    };
                    Reply::pending(async move {
                        broker.broadcast(assembled).await;
                    })
                }
                Err(e) => {
                    tracing::warn!(
                        seq = msg.seq,
                        patch = %msg.patch,
                        error = %e,
                        "Collector: contribution rejected"
                    );
                    let rejected = CollectionRejected {
                        seq: msg.seq,
                        patch: msg.patch,
                        reason: e.to_string(),
                    };
                    Reply::pending(async move {
                        broker.broadcast(rejected).await;
                    })
                }
            }
        });

        actor.start().await
    }
}
