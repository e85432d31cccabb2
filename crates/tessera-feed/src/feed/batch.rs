//! The atomic batcher: a bounded queue with one consumer task.
//!
//! Every mutating submission (append batches and puts) flows through this
//! queue, so submission order equals completion-callback order and at most
//! one write pipeline is in flight per feed. The consumer holds the feed
//! core only weakly; once the last handle drops, the queue closes and the
//! task exits.

use std::sync::Weak;

use tokio::sync::{
    mpsc,
    oneshot,
};
use tracing::trace;

use super::{
    after_mutation,
    Shared,
};
use crate::{
    proof::Proof,
    storage::RandomAccess,
    Result,
};

pub(super) enum WriteCommand {
    Append {
        blocks: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<u64>>,
    },
    Put {
        index: u64,
        data: Vec<u8>,
        proof: Proof,
        reply: oneshot::Sender<Result<()>>,
    },
}

pub(super) fn spawn_writer<T: RandomAccess>(
    shared: Weak<Shared<T>>,
    mut commands: mpsc::Receiver<WriteCommand>,
) {
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            match command {
                WriteCommand::Append {
                    blocks,
                    reply,
                } => {
                    let mut core = shared.core.lock().await;
                    let outcome = core.handle_append(blocks).await;
                    let outcome = match outcome {
                        Ok((start, have)) => {
                            after_mutation(&shared, &mut core, have);
                            Ok(start)
                        }
                        Err(e) => Err(e),
                    };
                    drop(core);
                    let _ = reply.send(outcome);
                }
                WriteCommand::Put {
                    index,
                    data,
                    proof,
                    reply,
                } => {
                    let mut core = shared.core.lock().await;
                    let outcome = core.handle_put(index, data, proof).await;
                    let outcome = match outcome {
                        Ok(have) => {
                            after_mutation(&shared, &mut core, have);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    };
                    drop(core);
                    let _ = reply.send(outcome);
                }
            }
        }
        trace!("write consumer exited");
    });
}
