use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

use crate::core::{ConnectionState, SessionState};
use crate::network::channel::MessageChannel;
use crate::utils::{Result, WeaveError};

/// Owns the passive listener and the dialing side of the session. Accepted
/// and dialed sockets are both handed to the message channel; the accept
/// loop keeps running until `close`.
pub struct ConnectionManager {
    state: SessionState,
    channel: MessageChannel,
    connect_timeout: Duration,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    receive_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConnectionManager {
    pub fn new(state: SessionState, channel: MessageChannel, connect_timeout: Duration) -> Self {
        Self {
            state,
            channel,
            connect_timeout,
            accept_task: Mutex::new(None),
            receive_tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Bind the listening endpoint and start accepting. Returns the bound
    /// address (port 0 picks an ephemeral one).
    pub async fn listen(&self, port: u16) -> Result<SocketAddr> {
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                let err = WeaveError::BindFailed(format!("port {}: {}", port, e));
                self.state
                    .set(ConnectionState::Failed(err.to_string()))
                    .await;
                return Err(err);
            }
        };
        let local = listener.local_addr()?;

        self.state.set(ConnectionState::Listening).await;
        info!("Listening for peers on {}", local);

        let state = self.state.clone();
        let channel = self.channel.clone();
        let receive_tasks = self.receive_tasks.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        info!("Accepted connection from {}", addr);
                        state.set(ConnectionState::Connected).await;
                        let handle = channel.attach(stream).await;
                        receive_tasks.lock().await.push(handle);
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        if let Some(previous) = self.accept_task.lock().await.replace(task) {
            previous.abort();
        }

        Ok(local)
    }

    /// Dial a peer. Dialing while already connected simply replaces the
    /// send target; the old connection's receive loop runs until its
    /// stream ends.
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.state.set(ConnectionState::Connecting).await;
        info!("Connecting to {}:{}", host, port);

        let stream = match timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.fail_connect(host, port, &e.to_string()).await,
            Err(_) => return self.fail_connect(host, port, "connection timed out").await,
        };

        self.state.set(ConnectionState::Connected).await;
        info!("Connected to {}:{}", host, port);

        let handle = self.channel.attach(stream).await;
        self.receive_tasks.lock().await.push(handle);
        Ok(())
    }

    async fn fail_connect(&self, host: &str, port: u16, cause: &str) -> Result<()> {
        let err = WeaveError::ConnectFailed(format!("{}:{}: {}", host, port, cause));
        self.state
            .set(ConnectionState::Failed(err.to_string()))
            .await;
        Err(err)
    }

    /// Idempotent teardown: stops accepting, aborts every receive loop,
    /// and drops the send half. Aborting closes the underlying sockets,
    /// which is what unblocks a receive loop parked on a read.
    pub async fn close(&self) {
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        for task in self.receive_tasks.lock().await.drain(..) {
            task.abort();
        }
        self.channel.detach().await;
        self.state.set(ConnectionState::Disconnected).await;
    }
}
