//! Host-facing facade: wires the transport and engine tasks together and
//! exposes the command/event channels.

use std::sync::Arc;

use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use sc_store::Storage;

use crate::{
    config::Config,
    engine::{ChatEngine, Command},
    error::{ClientError, TransportError},
    events::EngineEvent,
    transport::{self, TransportHandle},
};

pub struct ChatClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<EngineEvent>,
    transport: TransportHandle,
    engine_task: JoinHandle<Result<(), ClientError>>,
}

impl ChatClient {
    /// Start the transport and engine tasks. Must run inside a tokio
    /// runtime. Connects to the first configured relay.
    pub fn start(config: Config, store: Arc<dyn Storage>) -> Result<Self, ClientError> {
        let relay = config
            .relay_servers
            .first()
            .ok_or_else(|| TransportError::UrlInvalid("no relay servers configured".into()))?
            .clone();

        let (transport_events_tx, transport_events_rx) = mpsc::channel(128);
        let transport =
            transport::spawn(&relay, config.connection_timeout, transport_events_tx)?;

        let (commands_tx, commands_rx) = mpsc::channel(64);
        let engine = ChatEngine::new(
            config,
            store,
            transport.outbound.clone(),
            commands_tx.clone(),
        )?;
        let events = engine.event_sender();
        let engine_task = tokio::spawn(engine.run(transport_events_rx, commands_rx));

        Ok(Self {
            commands: commands_tx,
            events,
            transport,
            engine_task,
        })
    }

    /// The event stream. Each call returns an independent consumer.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn send_text(&self, to: &str, body: &str) -> Result<(), ClientError> {
        self.command(Command::SendText {
            to: to.to_string(),
            body: body.to_string(),
        })
        .await
    }

    /// Establish a session ahead of the first message.
    pub async fn request_session(&self, to: &str) -> Result<(), ClientError> {
        self.command(Command::RequestSession { to: to.to_string() }).await
    }

    /// Record the user's explicit trust decision after a safety-number
    /// comparison.
    pub async fn mark_verified(&self, user_id: &str) -> Result<(), ClientError> {
        self.command(Command::MarkVerified {
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn block_contact(&self, user_id: &str) -> Result<(), ClientError> {
        self.command(Command::BlockContact {
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn reset_session(&self, user_id: &str) -> Result<(), ClientError> {
        self.command(Command::ResetSession {
            user_id: user_id.to_string(),
        })
        .await
    }

    /// Cooperative shutdown of both tasks.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        self.transport.shutdown();
        let _ = self.engine_task.await;
        let _ = self.transport.task.await;
    }

    async fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::Cancelled.into())
    }
}
