//! ELM327 connection manager
//!
//! [`ObdConnection`] runs the initialization handshake, then hands the
//! transport to a background IO loop. Callers talk to the adapter only
//! through two unbounded FIFO queues and never block.

use crate::config::ConnectionConfig;
use crate::consumer;
use crate::error::LinkError;
use crate::handshake;
use crate::io_loop::IoLoop;
use crate::state::{ConnectionState, StateCell};
use elm_protocol::{InitStep, Transport, INIT_SEQUENCE};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Background tasks sharing one cancellation scope
struct ConnectionTasks {
    cancel: CancellationToken,
    io: JoinHandle<Box<dyn Transport>>,
    consumer: JoinHandle<Option<String>>,
}

/// Connection to an ELM327 adapter over a [`Transport`]
pub struct ObdConnection {
    config: ConnectionConfig,
    state: Arc<StateCell>,
    /// Held here until the IO loop takes ownership, and again after close
    transport: Mutex<Option<Box<dyn Transport>>>,
    request_tx: mpsc::UnboundedSender<String>,
    request_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    response_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    response_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    tasks: Mutex<Option<ConnectionTasks>>,
    init_steps: Vec<InitStep>,
}

impl ObdConnection {
    /// Create a connection over `transport` with default configuration
    pub fn new(transport: impl Transport) -> Self {
        Self::with_config(transport, ConnectionConfig::default())
    }

    /// Create a connection over `transport` with the given configuration
    pub fn with_config(transport: impl Transport, config: ConnectionConfig) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let transport: Box<dyn Transport> = Box::new(transport);

        Self {
            config,
            state: Arc::new(StateCell::new()),
            transport: Mutex::new(Some(transport)),
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
            response_tx: Mutex::new(Some(response_tx)),
            response_rx: Mutex::new(response_rx),
            tasks: Mutex::new(None),
            init_steps: INIT_SEQUENCE.to_vec(),
        }
    }

    /// Replace the initialization sequence, for adapters that need a
    /// different bring-up
    pub fn with_init_steps(mut self, steps: Vec<InitStep>) -> Self {
        self.init_steps = steps;
        self
    }

    /// Open the transport, run the handshake and start the background tasks.
    ///
    /// Returns `false` on any failure; the reason is logged. Use
    /// [`Self::try_connect`] to inspect it.
    pub async fn connect(&self, baud_rate: u32) -> bool {
        match self.try_connect(baud_rate).await {
            Ok(()) => true,
            Err(e) => {
                error!("ELM327 connection failed: {}", e);
                false
            }
        }
    }

    /// [`Self::connect`] at the configured baud rate
    pub async fn connect_default(&self) -> bool {
        self.connect(self.config.baud_rate).await
    }

    /// Like [`Self::connect`] but reports why it failed.
    ///
    /// The transport is closed again on every failure path.
    pub async fn try_connect(&self, baud_rate: u32) -> Result<(), LinkError> {
        let state = self.state.get();
        if state != ConnectionState::Disconnected {
            return Err(LinkError::InvalidState(state));
        }
        // a concurrent connect already holds the transport
        let mut transport = lock(&self.transport)
            .take()
            .ok_or(LinkError::InvalidState(state))?;

        info!("Connecting to {} at {} baud", transport.name(), baud_rate);
        if let Err(e) = transport.open(&self.config.port_settings(baud_rate)) {
            self.park(transport);
            return Err(LinkError::Open(e));
        }

        let poll = self.config.idle_poll();
        let result = handshake::run(transport.as_mut(), &self.init_steps, poll).await;
        if let Err(e) = result {
            self.park(transport);
            return Err(e);
        }

        let queues = (lock(&self.request_rx).take(), lock(&self.response_tx).take());
        let (Some(requests), Some(responses)) = queues else {
            self.park(transport);
            return Err(LinkError::QueueClosed);
        };

        // Held until the tasks are stored so a concurrent close either
        // sees them or prevents the transition to Connected.
        let mut tasks = lock(&self.tasks);
        if let Err(state) = self.state.mark_connected() {
            // closed while the handshake was running
            drop(tasks);
            self.park(transport);
            return Err(LinkError::InvalidState(state));
        }

        let cancel = CancellationToken::new();
        let (first_tx, first_rx) = oneshot::channel();
        let io = tokio::spawn(
            IoLoop {
                transport,
                requests,
                responses,
                first_frame: Some(first_tx),
                state: Arc::clone(&self.state),
                cancel: cancel.clone(),
                idle_poll: self.config.idle_poll(),
                max_faults: self.config.max_transport_faults,
            }
            .run(),
        );
        let consumer = tokio::spawn(consumer::consume_first(first_rx, cancel.clone()));
        *tasks = Some(ConnectionTasks {
            cancel,
            io,
            consumer,
        });
        drop(tasks);

        info!("ELM327 connected");
        Ok(())
    }

    /// Close `transport` and keep it until the connection is dropped
    fn park(&self, mut transport: Box<dyn Transport>) {
        if transport.is_open() {
            transport.close();
        }
        *lock(&self.transport) = Some(transport);
    }

    /// Queue a request without blocking.
    ///
    /// Returns `false` once the connection has been closed.
    pub fn try_send(&self, request: impl Into<String>) -> bool {
        if self.state.get() == ConnectionState::Closed {
            return false;
        }
        self.request_tx.send(request.into()).is_ok()
    }

    /// Take the oldest response frame, if any, without blocking
    pub fn try_get_response(&self) -> Option<String> {
        if self.state.get() == ConnectionState::Closed {
            return None;
        }
        lock(&self.response_rx).try_recv().ok()
    }

    /// Check if the handshake succeeded and the connection is not closed
    pub fn is_connected(&self) -> bool {
        self.state.get() == ConnectionState::Connected
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Tear the connection down.
    ///
    /// Cancels the background tasks and waits briefly for them to stop,
    /// closes both queues and closes the transport. Safe to call repeatedly
    /// and on a connection that never connected.
    pub async fn close_connection(&self) {
        let tasks = {
            let mut tasks = lock(&self.tasks);
            let previous = self.state.mark_closed();
            if previous != ConnectionState::Closed {
                info!("Closing ELM327 connection ({})", previous);
            }
            tasks.take()
        };
        if let Some(tasks) = tasks {
            self.stop_tasks(tasks).await;
        }

        if let Some(mut requests) = lock(&self.request_rx).take() {
            requests.close();
        }
        lock(&self.response_tx).take();
        {
            let mut responses = lock(&self.response_rx);
            responses.close();
            while responses.try_recv().is_ok() {}
        }

        if let Some(transport) = lock(&self.transport).as_mut() {
            if transport.is_open() {
                transport.close();
            }
        }
    }

    async fn stop_tasks(&self, tasks: ConnectionTasks) {
        let deadline = self.config.shutdown_timeout();
        tasks.cancel.cancel();

        let mut io = tasks.io;
        match timeout(deadline, &mut io).await {
            Ok(Ok(transport)) => self.park(transport),
            Ok(Err(e)) => warn!("IO loop ended abnormally: {}", e),
            Err(_) => {
                warn!("IO loop still running after {:?}, aborting", deadline);
                io.abort();
            }
        }

        let mut consumer = tasks.consumer;
        if timeout(deadline, &mut consumer).await.is_err() {
            debug!("Consumer still running after {:?}, aborting", deadline);
            consumer.abort();
        }
    }
}

impl Drop for ObdConnection {
    fn drop(&mut self) {
        if let Some(tasks) = lock(&self.tasks).as_ref() {
            tasks.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandshakeFailure;
    use elm_protocol::{AdapterHandle, SimulatedAdapter};
    use std::time::{Duration, Instant};
    use tokio::time::sleep;

    const BAUD: u32 = 38400;

    fn simulated() -> (ObdConnection, AdapterHandle) {
        let adapter = SimulatedAdapter::elm327();
        let handle = adapter.handle();
        (ObdConnection::new(adapter), handle)
    }

    /// Let the IO loop run a few idle slots
    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    fn commands_up_to(index: usize) -> String {
        INIT_SEQUENCE[..=index]
            .iter()
            .map(|step| format!("{}\r", step.command))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_success() {
        let (conn, handle) = simulated();

        assert!(conn.connect(BAUD).await);
        assert!(conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(handle.settings().unwrap().baud_rate, BAUD);
        assert_eq!(handle.written_text(), commands_up_to(INIT_SEQUENCE.len() - 1));

        conn.close_connection().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_step_aborts_handshake() {
        for (index, step) in INIT_SEQUENCE.iter().enumerate() {
            let (conn, handle) = simulated();
            handle.reply(step.command, b"?\r\r>");

            let err = conn.try_connect(BAUD).await.unwrap_err();
            match err {
                LinkError::Handshake { command, reason } => {
                    assert_eq!(command, step.command);
                    assert_eq!(reason, HandshakeFailure::Rejected("?\\r\\r>".to_string()));
                }
                other => panic!("unexpected error {other:?}"),
            }
            assert!(!conn.is_connected());
            assert!(!handle.is_open());
            assert_eq!(handle.written_text(), commands_up_to(index));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_step_times_out() {
        for (index, step) in INIT_SEQUENCE.iter().enumerate() {
            let (conn, handle) = simulated();
            handle.silence(step.command);

            assert!(!conn.connect(BAUD).await);
            assert!(!conn.is_connected());
            assert!(!handle.is_open());
            assert_eq!(handle.written_text(), commands_up_to(index));
        }

        let (conn, handle) = simulated();
        handle.silence("ATL0");
        assert!(matches!(
            conn.try_connect(BAUD).await,
            Err(LinkError::Handshake {
                command: "ATL0",
                reason: HandshakeFailure::Timeout(2000),
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_runs_no_steps() {
        let (conn, handle) = simulated();
        handle.fail_open(true);

        assert!(matches!(conn.try_connect(BAUD).await, Err(LinkError::Open(_))));
        assert!(!conn.is_connected());
        assert!(handle.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_fault_closes_transport() {
        let (conn, handle) = simulated();
        handle.fail_io(true);

        assert!(matches!(
            conn.try_connect(BAUD).await,
            Err(LinkError::Transport(_))
        ));
        assert!(!handle.is_open());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_written_in_order() {
        let (conn, handle) = simulated();
        assert!(conn.connect(BAUD).await);

        assert!(conn.try_send("a"));
        assert!(conn.try_send("b"));
        assert!(conn.try_send("c"));
        settle().await;

        assert!(handle.written_text().ends_with("ATSP0\ra\rb\rc\r"));
        conn.close_connection().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip() {
        let (conn, handle) = simulated();
        handle.silence("0100");
        assert!(conn.connect(BAUD).await);

        assert!(conn.try_send("0100"));
        settle().await;
        assert!(handle.written_text().ends_with("0100\r"));
        assert_eq!(conn.try_get_response(), None);

        handle.push_inbound(b"41 00 BE 3B B0 11\r\r>");
        settle().await;

        let expected = "41 00 BE 3B B0 11\\r\\r>";
        assert_eq!(conn.try_get_response().as_deref(), Some(expected));
        assert_eq!(conn.try_get_response(), None);

        // the consumer sees a copy without taking it off the queue
        let tasks = lock(&conn.tasks).take().unwrap();
        assert_eq!(tasks.consumer.await.unwrap().as_deref(), Some(expected));
        tasks.cancel.cancel();
        let transport = tasks.io.await.unwrap();
        assert!(transport.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_reply_becomes_two_frames() {
        let (conn, handle) = simulated();
        assert!(conn.connect(BAUD).await);

        handle.push_inbound(b"41 0C");
        settle().await;
        handle.push_inbound(b" 1A F8\r\r>");
        settle().await;

        assert_eq!(conn.try_get_response().as_deref(), Some("41 0C"));
        assert_eq!(conn.try_get_response().as_deref(), Some(" 1A F8\\r\\r>"));
        conn.close_connection().await;
    }

    #[test]
    fn test_queue_api_never_blocks() {
        let (conn, _handle) = simulated();

        let start = Instant::now();
        for i in 0..10_000 {
            assert!(conn.try_send(format!("01{:02X}", i % 256)));
        }
        assert_eq!(conn.try_get_response(), None);
        assert!(start.elapsed() < Duration::from_secs(1));

        let responses = lock(&conn.response_tx).clone().unwrap();
        for i in 0..10_000 {
            responses.send(format!("41 0C {:04X}\\r>", i)).unwrap();
        }

        let start = Instant::now();
        for i in 0..10_000 {
            assert_eq!(conn.try_get_response(), Some(format!("41 0C {:04X}\\r>", i)));
        }
        assert_eq!(conn.try_get_response(), None);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_racing_connect_leaves_port_closed() {
        for _ in 0..100 {
            let adapter = SimulatedAdapter::elm327();
            let handle = adapter.handle();
            let reset = InitStep::new("ATZ", Duration::ZERO, Duration::from_millis(500), |r: &str| {
                r.contains('>')
            });
            let conn = Arc::new(ObdConnection::new(adapter).with_init_steps(vec![reset]));

            let connecting = tokio::spawn({
                let conn = Arc::clone(&conn);
                async move { conn.connect(BAUD).await }
            });
            let closing = tokio::spawn({
                let conn = Arc::clone(&conn);
                async move {
                    tokio::task::yield_now().await;
                    conn.close_connection().await;
                }
            });
            connecting.await.unwrap();
            closing.await.unwrap();

            assert_eq!(conn.state(), ConnectionState::Closed);
            assert!(!handle.is_open());
            assert!(!conn.try_send("0100"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_init_steps() {
        let (conn, handle) = simulated();
        let reset = InitStep::new("ATZ", Duration::ZERO, Duration::from_millis(100), |r: &str| {
            r.contains("ELM327")
        });
        let conn = conn.with_init_steps(vec![reset]);

        assert!(conn.connect(BAUD).await);
        assert_eq!(handle.written_text(), "ATZ\r");
        conn.close_connection().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let (conn, handle) = simulated();
        assert!(conn.connect(BAUD).await);
        handle.push_inbound(b"STOPPED\r>");
        settle().await;

        conn.close_connection().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.try_send("0100"));
        assert_eq!(conn.try_get_response(), None);
        assert!(!handle.is_open());

        conn.close_connection().await;
        assert!(!conn.is_connected());
        assert!(!conn.try_send("0100"));
        assert_eq!(conn.try_get_response(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_without_connect() {
        let (conn, handle) = simulated();
        assert!(conn.try_send("queued before connect"));

        conn.close_connection().await;
        conn.close_connection().await;

        assert!(!conn.try_send("0100"));
        assert_eq!(conn.try_get_response(), None);
        assert!(!handle.is_open());
        assert!(!conn.connect(BAUD).await);
        assert!(matches!(
            conn.try_connect(BAUD).await,
            Err(LinkError::InvalidState(ConnectionState::Closed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_twice_is_rejected() {
        let (conn, _handle) = simulated();
        assert!(conn.connect(BAUD).await);
        assert!(matches!(
            conn.try_connect(BAUD).await,
            Err(LinkError::InvalidState(ConnectionState::Connected))
        ));
        assert!(conn.is_connected());
        conn.close_connection().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_io_faults_close_the_link() {
        let (conn, handle) = simulated();
        assert!(conn.connect(BAUD).await);

        handle.fail_io(true);
        sleep(Duration::from_millis(200)).await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!handle.is_open());
        assert!(!conn.try_send("0100"));

        conn.close_connection().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_queued_before_connect_are_sent() {
        let (conn, handle) = simulated();
        assert!(conn.try_send("ATRV"));
        assert!(conn.connect(BAUD).await);
        settle().await;

        assert!(handle.written_text().ends_with("ATSP0\rATRV\r"));
        assert_eq!(conn.try_get_response().as_deref(), Some("?\\r\\r>"));
        conn.close_connection().await;
    }
}
