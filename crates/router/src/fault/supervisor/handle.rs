//! Task-owned supervisor tree.
//!
//! The tree is moved into a single task and driven through a command
//! channel, so failure reports from many callers are handled one at a time.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use murmur_core::{Error, Result};

use super::strategy::RestartStrategy;
use super::tree::{NodeId, NodeStatus, RestartReport, Supervised, SupervisorTree};

const COMMAND_BUFFER: usize = 64;

enum Command {
    AddWorker {
        parent: NodeId,
        entity: Box<dyn Supervised>,
        reply: oneshot::Sender<Result<NodeId>>,
    },
    AddSupervisor {
        parent: NodeId,
        name: String,
        strategy: RestartStrategy,
        reply: oneshot::Sender<Result<NodeId>>,
    },
    Failure {
        node: NodeId,
        reason: String,
        reply: oneshot::Sender<Result<RestartReport>>,
    },
    Status {
        node: NodeId,
        reply: oneshot::Sender<Option<NodeStatus>>,
    },
    Find {
        name: String,
        reply: oneshot::Sender<Option<NodeId>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running supervisor tree.
#[derive(Clone)]
pub struct SupervisorHandle {
    root: NodeId,
    commands: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    /// Move `tree` into a task and return a handle plus the task.
    #[must_use]
    pub fn spawn(tree: SupervisorTree) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let root = tree.root();
        let task = tokio::spawn(run(tree, rx));
        (Self { root, commands }, task)
    }

    #[must_use]
    pub const fn root(&self) -> NodeId {
        self.root
    }

    /// # Errors
    ///
    /// See [`SupervisorTree::add_worker`]; `Error::EntityNotFound` if the
    /// tree has shut down.
    pub async fn add_worker(&self, parent: NodeId, entity: Box<dyn Supervised>) -> Result<NodeId> {
        self.request(|reply| Command::AddWorker {
            parent,
            entity,
            reply,
        })
        .await?
    }

    /// # Errors
    ///
    /// See [`SupervisorTree::add_supervisor`].
    pub async fn add_supervisor(
        &self,
        parent: NodeId,
        name: impl Into<String>,
        strategy: RestartStrategy,
    ) -> Result<NodeId> {
        let name = name.into();
        self.request(|reply| Command::AddSupervisor {
            parent,
            name,
            strategy,
            reply,
        })
        .await?
    }

    /// Report that `node` failed and wait for the restart to finish.
    ///
    /// # Errors
    ///
    /// See [`SupervisorTree::report_failure`].
    pub async fn report_failure(
        &self,
        node: NodeId,
        reason: impl Into<String>,
    ) -> Result<RestartReport> {
        let reason = reason.into();
        self.request(|reply| Command::Failure {
            node,
            reason,
            reply,
        })
        .await?
    }

    pub async fn status(&self, node: NodeId) -> Option<NodeStatus> {
        self.request(|reply| Command::Status { node, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn find(&self, name: impl Into<String>) -> Option<NodeId> {
        let name = name.into();
        self.request(|reply| Command::Find { name, reply })
            .await
            .ok()
            .flatten()
    }

    /// Stop every entity and end the task. Idempotent.
    pub async fn shutdown(&self) {
        if self
            .request(|reply| Command::Shutdown { reply })
            .await
            .is_err()
        {
            debug!("supervisor already shut down");
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| gone())?;
        rx.await.map_err(|_| gone())
    }
}

fn gone() -> Error {
    Error::EntityNotFound {
        entity: "supervisor".to_string(),
    }
}

async fn run(mut tree: SupervisorTree, mut commands: mpsc::Receiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::AddWorker {
                parent,
                entity,
                reply,
            } => {
                let _ = reply.send(tree.add_worker(parent, entity).await);
            }
            Command::AddSupervisor {
                parent,
                name,
                strategy,
                reply,
            } => {
                let _ = reply.send(tree.add_supervisor(parent, name, strategy));
            }
            Command::Failure {
                node,
                reason,
                reply,
            } => {
                let _ = reply.send(tree.report_failure(node, &reason).await);
            }
            Command::Status { node, reply } => {
                let _ = reply.send(tree.status(node));
            }
            Command::Find { name, reply } => {
                let _ = reply.send(tree.find(&name));
            }
            Command::Shutdown { reply } => {
                tree.stop_all().await;
                let _ = reply.send(());
                break;
            }
        }
    }
    info!("supervisor stopped");
}
