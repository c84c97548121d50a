use super::*;
use crate::config::{LogSink, ManagerOptions};
use crate::error::{BoxError, ExitingError};
use crate::escape::ProcessExit;
use crate::registry::ExitRegistry;
use crate::server::{ExtHandler, ExtPoint, ListenerHandle, Server, StopOptions};
use crate::terminator::CapturingTerminator;
use crate::triggers::Signal;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct MockServer {
    name: String,
    start_delay: Option<Duration>,
    start_error: Option<&'static str>,
    start_escape: Option<i32>,
    stop_delay: Option<Duration>,
    hang_on_stop: bool,
    stop_error: Option<&'static str>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    pre_stop: Mutex<Vec<ExtHandler>>,
    listener: ListenerHandle,
}

impl MockServer {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Server for MockServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), BoxError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(code) = self.start_escape {
            return Err(Box::new(ProcessExit::new(code)));
        }
        match self.start_error {
            Some(message) => Err(message.into()),
            None => Ok(()),
        }
    }

    async fn stop(&self, _options: StopOptions) -> Result<(), BoxError> {
        self.stops.fetch_add(1, Ordering::SeqCst);

        let handlers = self.pre_stop.lock().clone();
        for handler in handlers {
            handler().await?;
        }

        if self.hang_on_stop {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.stop_delay {
            tokio::time::sleep(delay).await;
        }
        match self.stop_error {
            Some(message) => Err(message.into()),
            None => Ok(()),
        }
    }

    fn ext(&self, point: ExtPoint, handler: ExtHandler) {
        match point {
            ExtPoint::PreStop => self.pre_stop.lock().push(handler),
        }
    }

    fn listener(&self) -> ListenerHandle {
        self.listener.clone()
    }
}

struct Harness {
    manager: Manager,
    registry: Arc<ExitRegistry>,
    terminator: Arc<CapturingTerminator>,
    logs: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn new(servers: Vec<Arc<MockServer>>) -> Self {
        Self::with_timeout(servers, Duration::from_secs(5))
    }

    fn with_timeout(servers: Vec<Arc<MockServer>>, exit_timeout: Duration) -> Self {
        let terminator = Arc::new(CapturingTerminator::new());
        let registry = ExitRegistry::with_terminator(terminator.clone());

        let logs = Arc::new(Mutex::new(Vec::new()));
        let sink: LogSink = {
            let logs = Arc::clone(&logs);
            Arc::new(move |message: &str| logs.lock().push(message.to_string()))
        };

        let options = ManagerOptions::default()
            .with_exit_timeout(exit_timeout)
            .with_os_signals(false)
            .with_catch_panics(false)
            .with_log(sink);

        let servers: Vec<Arc<dyn Server>> = servers
            .into_iter()
            .map(|server| server as Arc<dyn Server>)
            .collect();
        let manager = Manager::with_registry(Arc::clone(&registry), servers, options).unwrap();

        Self {
            manager,
            registry,
            terminator,
            logs,
        }
    }

    fn logged(&self, needle: &str) -> bool {
        self.logs.lock().iter().any(|line| line.contains(needle))
    }
}

#[tokio::test]
async fn test_start_then_stop() {
    let server = Arc::new(MockServer::named("a"));
    let harness = Harness::new(vec![server.clone()]);

    harness.manager.start().await.unwrap();
    assert_eq!(harness.manager.state(), Some(ExitState::Started));
    assert!(harness.manager.is_active());

    harness.manager.stop().await.unwrap();
    assert_eq!(harness.manager.state(), Some(ExitState::Stopped));
    assert_eq!(server.stops(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(harness.terminator.codes().is_empty());
}

#[tokio::test]
async fn test_graceful_exit() {
    let servers = vec![Arc::new(MockServer::named("a")), Arc::new(MockServer::named("b"))];
    let harness = Harness::new(servers.clone());
    harness.manager.start().await.unwrap();

    let escape = harness.manager.exit(0);
    assert_eq!(escape.code(), 0);

    assert_eq!(harness.terminator.wait(WAIT).await, Some(0));
    assert_eq!(harness.manager.state(), Some(ExitState::Stopped));
    assert!(servers.iter().all(|server| server.stops() == 1));
}

#[tokio::test]
async fn test_error_exit_aborts_stop() {
    let harness = Harness::new(vec![Arc::new(MockServer::named("a"))]);
    harness.manager.start().await.unwrap();

    let _ = harness.manager.exit(10);

    assert_eq!(harness.terminator.wait(WAIT).await, Some(10));
    assert_eq!(harness.manager.state(), Some(ExitState::Errored));
    assert_eq!(harness.manager.exit_code(), 10);
    assert!(harness.logged("Server stop failed: Process aborted"));
}

#[tokio::test]
async fn test_terminate_signal_is_graceful() {
    let harness = Harness::new(vec![Arc::new(MockServer::named("a"))]);
    harness.manager.start().await.unwrap();

    harness.manager.inner.on_signal(Signal::Terminate);

    assert_eq!(harness.terminator.wait(WAIT).await, Some(0));
    assert_eq!(harness.manager.state(), Some(ExitState::Stopped));
}

#[tokio::test]
async fn test_quit_signal_aborts() {
    let harness = Harness::new(vec![Arc::new(MockServer::named("a"))]);
    harness.manager.start().await.unwrap();

    harness.manager.inner.on_signal(Signal::Quit);

    assert_eq!(harness.terminator.wait(WAIT).await, Some(1));
    assert_eq!(harness.manager.state(), Some(ExitState::Errored));
}

#[tokio::test]
async fn test_unhandled_rejection() {
    let harness = Harness::new(vec![Arc::new(MockServer::named("a"))]);
    harness.manager.start().await.unwrap();

    harness
        .manager
        .spawn(async { Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "lost")) });

    assert_eq!(harness.terminator.wait(WAIT).await, Some(1));
    assert_eq!(harness.manager.state(), Some(ExitState::Errored));
    assert!(harness.logged("Fatal rejection: lost"));
}

#[tokio::test]
async fn test_escape_rejection_is_ignored() {
    let harness = Harness::new(vec![Arc::new(MockServer::named("a"))]);
    harness.manager.start().await.unwrap();

    harness
        .manager
        .report_rejection(Box::new(ExitingError::from(ProcessExit::new(0))));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.manager.state(), Some(ExitState::Started));
    assert!(harness.terminator.codes().is_empty());
}

#[tokio::test]
async fn test_highest_exit_code_wins() {
    let harness = Harness::new(vec![Arc::new(MockServer::named("a"))]);
    harness.manager.start().await.unwrap();

    let _ = harness.manager.exit(0);
    let _ = harness.manager.exit(1);
    let _ = harness.manager.exit(0);

    assert_eq!(harness.terminator.wait(WAIT).await, Some(1));
    assert_eq!(harness.manager.exit_code(), 1);
    assert_eq!(harness.manager.state(), Some(ExitState::Errored));
}

#[tokio::test]
async fn test_error_exit_after_prestop() {
    let server = Arc::new(MockServer {
        name: "draining".to_string(),
        stop_delay: Some(Duration::from_millis(200)),
        ..Default::default()
    });
    let harness = Harness::new(vec![server]);
    harness.manager.start().await.unwrap();

    let _ = harness.manager.exit(0);

    let deadline = tokio::time::Instant::now() + WAIT;
    while harness.manager.state() != Some(ExitState::Prestopped) {
        assert!(tokio::time::Instant::now() < deadline, "pre-stop never ran");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(harness.terminator.codes().is_empty());

    let _ = harness.manager.exit(4);

    assert_eq!(harness.manager.state(), Some(ExitState::Errored));
    assert_eq!(harness.terminator.wait(WAIT).await, Some(4));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(harness.terminator.codes(), vec![4]);
    assert_eq!(harness.manager.state(), Some(ExitState::Errored));
}

#[tokio::test]
async fn test_rejection_while_stopping() {
    let server = Arc::new(MockServer {
        name: "draining".to_string(),
        stop_delay: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let harness = Harness::new(vec![server]);
    harness.manager.start().await.unwrap();

    let stopping = {
        let manager = harness.manager.clone();
        tokio::spawn(async move { manager.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(harness.manager.state(), Some(ExitState::Stopping));

    harness.manager.report_rejection("late failure".into());

    assert_eq!(harness.manager.state(), Some(ExitState::Errored));
    assert_eq!(harness.terminator.wait(WAIT).await, Some(1));
    assert!(harness.logged("Fatal rejection: late failure"));

    stopping.await.unwrap().unwrap();
    assert_eq!(harness.terminator.codes(), vec![1]);
    assert_eq!(harness.manager.state(), Some(ExitState::Errored));
}

#[tokio::test]
async fn test_exit_gate_timeout() {
    let server = Arc::new(MockServer::named("stuck"));
    let hanging: ExtHandler =
        Arc::new(|| std::future::pending::<Result<(), BoxError>>().boxed());
    server.ext(ExtPoint::PreStop, hanging);

    let harness = Harness::with_timeout(vec![server], Duration::from_millis(1));
    harness.manager.start().await.unwrap();

    let _ = harness.manager.exit(0);

    assert_eq!(harness.terminator.wait(WAIT).await, Some(SEVERE_EXIT_CODE));
    assert_eq!(harness.manager.state(), Some(ExitState::Timeout));
    assert_eq!(harness.manager.exit_code(), SEVERE_EXIT_CODE);
}

#[tokio::test]
async fn test_hanging_stop_times_out() {
    let server = Arc::new(MockServer {
        name: "stuck".to_string(),
        hang_on_stop: true,
        ..Default::default()
    });
    let harness = Harness::with_timeout(vec![server], Duration::from_millis(20));
    harness.manager.start().await.unwrap();

    let _ = harness.manager.exit(0);

    assert_eq!(harness.terminator.wait(WAIT).await, Some(SEVERE_EXIT_CODE));
    assert_eq!(harness.manager.state(), Some(ExitState::Timeout));
}

#[tokio::test]
async fn test_terminate_called_once() {
    let harness = Harness::new(vec![Arc::new(MockServer::named("a"))]);
    harness.manager.start().await.unwrap();

    let _ = harness.manager.exit(0);
    assert_eq!(harness.terminator.wait(WAIT).await, Some(0));

    let _ = harness.manager.exit(5);
    harness.manager.inner.on_signal(Signal::Quit);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(harness.terminator.codes(), vec![0]);
}

#[tokio::test]
async fn test_partial_start_failure_rolls_back() {
    let healthy = Arc::new(MockServer::named("healthy"));
    let broken = Arc::new(MockServer {
        name: "broken".to_string(),
        start_error: Some("port in use"),
        ..Default::default()
    });
    let late = Arc::new(MockServer {
        name: "late".to_string(),
        start_delay: Some(Duration::from_millis(10)),
        ..Default::default()
    });
    let harness = Harness::new(vec![healthy.clone(), broken.clone(), late.clone()]);

    let result = harness.manager.start().await;

    match result {
        Err(ExitingError::Startup(e)) => assert_eq!(e.to_string(), "port in use"),
        other => panic!("expected startup failure, got {:?}", other),
    }
    assert_eq!(harness.manager.state(), Some(ExitState::Errored));
    assert_eq!(healthy.stops(), 1);
    assert_eq!(late.stops(), 1);
    assert_eq!(late.starts.load(Ordering::SeqCst), 1);
    assert!(harness.terminator.codes().is_empty());
}

#[tokio::test]
async fn test_escape_during_start() {
    let server = Arc::new(MockServer {
        name: "escaping".to_string(),
        start_escape: Some(3),
        ..Default::default()
    });
    let harness = Harness::new(vec![server]);

    let result = harness.manager.start().await;
    match result {
        Err(e) => assert!(e.is_escape()),
        Ok(()) => panic!("expected the escape marker"),
    }

    assert_eq!(harness.terminator.wait(WAIT).await, Some(3));
    assert_eq!(harness.manager.state(), Some(ExitState::Errored));
}

#[tokio::test]
async fn test_exit_during_start() {
    let server = Arc::new(MockServer {
        name: "slow".to_string(),
        start_delay: Some(Duration::from_millis(30)),
        ..Default::default()
    });
    let harness = Harness::new(vec![server.clone()]);

    let starting = {
        let manager = harness.manager.clone();
        tokio::spawn(async move { manager.start().await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(harness.manager.state(), Some(ExitState::Starting));

    let _ = harness.manager.exit(0);
    assert_eq!(harness.manager.state(), Some(ExitState::StartAborted));

    starting.await.unwrap().unwrap();
    assert_eq!(harness.terminator.wait(WAIT).await, Some(0));
    assert_eq!(harness.manager.state(), Some(ExitState::Stopped));
    assert_eq!(server.stops(), 1);
}

#[tokio::test]
async fn test_exit_during_explicit_stop() {
    let server = Arc::new(MockServer {
        name: "draining".to_string(),
        stop_delay: Some(Duration::from_millis(30)),
        ..Default::default()
    });
    let harness = Harness::new(vec![server.clone()]);
    harness.manager.start().await.unwrap();

    let stopping = {
        let manager = harness.manager.clone();
        tokio::spawn(async move { manager.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(harness.manager.state(), Some(ExitState::Stopping));

    let _ = harness.manager.exit(0);
    assert!(harness.terminator.codes().is_empty());

    stopping.await.unwrap().unwrap();
    assert_eq!(harness.terminator.wait(WAIT).await, Some(0));
    assert_eq!(server.stops(), 1);
}

#[tokio::test]
async fn test_listener_close_is_severe() {
    let server = Arc::new(MockServer::named("a"));
    let harness = Harness::new(vec![server.clone()]);
    harness.manager.start().await.unwrap();

    server.listener.close();

    assert_eq!(harness.terminator.wait(WAIT).await, Some(SEVERE_EXIT_CODE));
    assert_eq!(harness.manager.exit_code(), SEVERE_EXIT_CODE);
}

#[tokio::test]
async fn test_host_signal_handler_defers() {
    let harness = Harness::new(vec![Arc::new(MockServer::named("a"))]);
    harness.manager.start().await.unwrap();

    let host = harness.registry.listen(Signal::Terminate);
    assert_eq!(harness.registry.listener_count(Signal::Terminate), 2);
    harness.manager.inner.on_signal(Signal::Terminate);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.manager.state(), Some(ExitState::Started));

    drop(host);
    harness.manager.inner.on_signal(Signal::Terminate);
    assert_eq!(harness.terminator.wait(WAIT).await, Some(0));
}

#[tokio::test]
async fn test_deactivated_manager_ignores_triggers() {
    let harness = Harness::new(vec![Arc::new(MockServer::named("a"))]);
    harness.manager.start().await.unwrap();

    harness.registry.reset();
    assert!(!harness.manager.is_active());
    assert!(harness.registry.current().is_none());
    assert_eq!(harness.registry.listener_count(Signal::Terminate), 0);

    harness.manager.inner.on_signal(Signal::Terminate);
    let _ = harness.manager.exit(1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.manager.state(), Some(ExitState::Started));
    assert!(harness.terminator.codes().is_empty());

    assert!(matches!(
        harness.manager.start().await,
        Err(ExitingError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_registry_exit_is_intercepted() {
    let server = Arc::new(MockServer::named("a"));
    let harness = Harness::new(vec![server.clone()]);
    harness.manager.start().await.unwrap();

    let escape = harness.registry.exit(0);
    assert_eq!(escape.code(), 0);
    assert!(harness.terminator.codes().is_empty());

    assert_eq!(harness.terminator.wait(WAIT).await, Some(0));
    assert_eq!(server.stops(), 1);
}

#[tokio::test]
async fn test_single_manager_per_registry() {
    let harness = Harness::new(vec![Arc::new(MockServer::named("a"))]);

    let servers: Vec<Arc<dyn Server>> = vec![Arc::new(MockServer::named("b"))];
    let second = Manager::with_registry(
        Arc::clone(&harness.registry),
        servers.clone(),
        ManagerOptions::default(),
    );
    assert!(matches!(second, Err(ExitingError::AlreadyActive)));

    harness.manager.deactivate();
    let third = Manager::with_registry(
        Arc::clone(&harness.registry),
        servers,
        ManagerOptions::default(),
    )
    .unwrap();
    assert_eq!(harness.registry.current().map(|m| m.id()), Some(third.id()));
}

#[test]
fn test_empty_server_set_rejected() {
    let registry = ExitRegistry::with_terminator(Arc::new(CapturingTerminator::new()));
    let result = Manager::with_registry(
        registry,
        Vec::<Arc<dyn Server>>::new(),
        ManagerOptions::default(),
    );
    assert!(matches!(result, Err(ExitingError::NoServers)));
}

#[tokio::test]
async fn test_invalid_state_transitions() {
    let harness = Harness::new(vec![Arc::new(MockServer::named("a"))]);
    assert_eq!(harness.manager.state(), None);

    let err = harness.manager.stop().await.unwrap_err();
    assert_eq!(err.to_string(), "Cannot stop while in state unset");

    harness.manager.start().await.unwrap();
    assert!(matches!(
        harness.manager.start().await,
        Err(ExitingError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_stop_failure_reports_first_error() {
    let server = Arc::new(MockServer {
        name: "flaky".to_string(),
        stop_error: Some("socket busy"),
        ..Default::default()
    });
    let harness = Harness::new(vec![server, Arc::new(MockServer::named("b"))]);
    harness.manager.start().await.unwrap();

    match harness.manager.stop().await {
        Err(ExitingError::Shutdown(e)) => assert_eq!(e.to_string(), "socket busy"),
        other => panic!("expected shutdown failure, got {:?}", other),
    }
    assert_eq!(harness.manager.state(), Some(ExitState::Errored));
}

#[tokio::test]
async fn test_before_exit_warns_when_running() {
    let harness = Harness::new(vec![Arc::new(MockServer::named("a"))]);
    harness.manager.start().await.unwrap();

    harness.manager.before_exit();
    assert!(harness.logged("Process exiting without stopping servers (state == started)"));

    harness.manager.stop().await.unwrap();
    harness.logs.lock().clear();
    harness.manager.before_exit();
    assert!(harness.logs.lock().is_empty());
}

#[test]
fn test_state_names() {
    assert_eq!(ExitState::StartAborted.to_string(), "startAborted");
    assert!(ExitState::Timeout.is_terminal());
    assert!(!ExitState::Prestopped.is_terminal());
    assert_eq!(types::describe(None), "unset");
}
